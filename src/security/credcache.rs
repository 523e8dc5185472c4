//! Credential cache.
//!
//! Keyed by issuer and signature bytes; comparison is signature equality.

use log::debug;

use super::cache::{CacheOps, SecurityCache};
use super::{Credential, mix_bytes};
use crate::config::SecCacheTuning;

/// Comparator and hash behavior for credentials.
#[derive(Debug)]
pub struct CredOps;

impl CacheOps for CredOps {
    type Data = Credential;

    fn index_of(data: &Credential, hash_limit: u64) -> u64 {
        let h = mix_bytes(0x6372_6564, data.issuer.as_bytes());
        mix_bytes(h, &data.signature) % hash_limit
    }

    fn matches(probe: &Credential, entry: &Credential) -> bool {
        probe.signature.len() == entry.signature.len() && probe.signature == entry.signature
    }

    fn stamp_expiration(data: &Credential, timeout_secs: u64, now: u64) -> u64 {
        (now + timeout_secs).min(data.timeout)
    }

    fn describe(prefix: &str, data: &Credential) {
        debug!(
            "{prefix} credential: issuer={} uid={} groups={}",
            data.issuer,
            data.userid,
            data.groups.len()
        );
    }
}

/// Cache of verified credentials.
#[derive(Debug)]
pub struct CredCache {
    cache: SecurityCache<CredOps>,
}

impl CredCache {
    /// Credential cache with the given tuning.
    pub fn new(tuning: SecCacheTuning) -> CredCache {
        CredCache {
            cache: SecurityCache::new("credential", tuning),
        }
    }

    /// The generic cache, for lookup/insert/remove and properties.
    pub fn cache(&self) -> &SecurityCache<CredOps> {
        &self.cache
    }

    /// Cache a verified credential.
    pub fn insert(&self, cred: &Credential) {
        self.cache.insert(cred.clone(), cred.footprint());
    }

    /// Fetch the cached credential matching `probe`'s signature.
    pub fn get(&self, probe: &Credential) -> Option<Credential> {
        self.cache.lookup(probe)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::unix_now;

    fn cred(uid: u32, sig: &[u8]) -> Credential {
        Credential {
            issuer: "server-a".into(),
            userid: uid,
            groups: vec![100, 200],
            timeout: unix_now() + 3600,
            signature: sig.to_vec(),
        }
    }

    #[test]
    fn hit_returns_full_credential() {
        let cc = CredCache::new(SecCacheTuning::default());
        cc.insert(&cred(42, b"signature"));

        let got = cc.get(&cred(0, b"signature")).expect("hit");
        assert_eq!(got.userid, 42);
        assert_eq!(got.groups, vec![100, 200]);
        assert!(cc.get(&cred(42, b"other")).is_none());
    }
}
