//! Revocation list.
//!
//! Hashed by issuing server and capability id. Unlike the token caches, an
//! entry's expiration is the revocation's own deadline: lookups never roll
//! it forward, and the entry drops off the list exactly when the revoked
//! capability would have expired anyway.

use log::debug;

use super::cache::{CacheOps, SecurityCache};
use super::{Revocation, mix_bytes};
use crate::config::SecCacheTuning;
use crate::types::Sid;

/// Comparator and hash behavior for revocations.
#[derive(Debug)]
pub struct RevOps;

impl CacheOps for RevOps {
    type Data = Revocation;

    fn index_of(data: &Revocation, hash_limit: u64) -> u64 {
        let h = mix_bytes(0x7265_766c, data.server.as_bytes());
        mix_bytes(h, &data.capability_id.to_le_bytes()) % hash_limit
    }

    fn matches(probe: &Revocation, entry: &Revocation) -> bool {
        probe.server == entry.server && probe.capability_id == entry.capability_id
    }

    fn stamp_expiration(data: &Revocation, _timeout_secs: u64, _now: u64) -> u64 {
        // the revocation expires on its own schedule, never later
        data.expires
    }

    fn describe(prefix: &str, data: &Revocation) {
        debug!(
            "{prefix} revocation: server={} capability={}",
            data.server, data.capability_id
        );
    }
}

/// The active revocation set.
#[derive(Debug)]
pub struct RevocationList {
    cache: SecurityCache<RevOps>,
}

impl RevocationList {
    /// Revocation list with the given tuning.
    pub fn new(tuning: SecCacheTuning) -> RevocationList {
        RevocationList {
            cache: SecurityCache::new("revocation", tuning),
        }
    }

    /// The generic cache, for properties and statistics.
    pub fn cache(&self) -> &SecurityCache<RevOps> {
        &self.cache
    }

    /// Record a revocation.
    pub fn insert(&self, rev: Revocation) {
        self.cache.insert(rev, std::mem::size_of::<Revocation>());
    }

    /// Is `(server, capability_id)` currently revoked?
    pub fn is_revoked(&self, server: &Sid, capability_id: u64) -> bool {
        let probe = Revocation {
            server: *server,
            capability_id,
            expires: 0,
        };
        self.cache.lookup(&probe).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::unix_now;

    #[test]
    fn live_revocation_blocks() {
        let rl = RevocationList::new(SecCacheTuning::default());
        let server = Sid([9; 16]);
        rl.insert(Revocation {
            server,
            capability_id: 77,
            expires: unix_now() + 600,
        });
        assert!(rl.is_revoked(&server, 77));
        assert!(!rl.is_revoked(&server, 78));
        assert!(!rl.is_revoked(&Sid([8; 16]), 77));
    }

    #[test]
    fn lapsed_revocation_clears_itself() {
        let rl = RevocationList::new(SecCacheTuning::default());
        let server = Sid([9; 16]);
        rl.insert(Revocation {
            server,
            capability_id: 5,
            expires: unix_now().saturating_sub(10),
        });
        assert!(!rl.is_revoked(&server, 5));
    }
}
