//! Capability cache.
//!
//! Entries are keyed by the fields a capability grants over (issuer,
//! filesystem, operation mask, handle set) and compared by signature bytes:
//! two capabilities with equal signatures are the same token. Quick-sign
//! reuses a cached signature for a freshly built capability whose grant
//! fields match an entry, skipping the signing path entirely.

use log::{debug, warn};

use super::cache::{CacheOps, SecurityCache};
use super::{Capability, mix_bytes};
use crate::config::SecCacheTuning;

/// Comparator and hash behavior for capabilities.
#[derive(Debug)]
pub struct CapOps;

impl CacheOps for CapOps {
    type Data = Capability;

    fn index_of(data: &Capability, hash_limit: u64) -> u64 {
        let mut h = mix_bytes(0x6361_7063, data.issuer.as_bytes());
        h = h.wrapping_add(mix_bytes(h, &data.fs_id.0.to_le_bytes()));
        h = h.wrapping_add(mix_bytes(h, &data.op_mask.to_le_bytes()));
        for handle in &data.handles {
            h = h.wrapping_add(mix_bytes(h, handle.as_bytes()));
        }
        h % hash_limit
    }

    fn matches(probe: &Capability, entry: &Capability) -> bool {
        // two null capabilities are the same token
        if probe.signature.is_empty() && entry.signature.is_empty() {
            return true;
        }
        if probe.signature.len() != entry.signature.len() {
            warn!(
                "capability cache: signature size mismatch (probe {}, entry {})",
                probe.signature.len(),
                entry.signature.len()
            );
            return false;
        }
        probe.signature == entry.signature
    }

    fn stamp_expiration(data: &Capability, timeout_secs: u64, now: u64) -> u64 {
        // a refresh never outlives the capability itself
        (now + timeout_secs).min(data.timeout)
    }

    fn describe(prefix: &str, data: &Capability) {
        debug!(
            "{prefix} capability: issuer={} fs={} mask={:#x} handles={}",
            data.issuer,
            data.fs_id.0,
            data.op_mask,
            data.handles.len()
        );
    }
}

/// Cache of verified capabilities.
#[derive(Debug)]
pub struct CapCache {
    cache: SecurityCache<CapOps>,
}

impl CapCache {
    /// Capability cache with the given tuning.
    pub fn new(tuning: SecCacheTuning) -> CapCache {
        CapCache {
            cache: SecurityCache::new("capability", tuning),
        }
    }

    /// The generic cache, for lookup/insert/remove and properties.
    pub fn cache(&self) -> &SecurityCache<CapOps> {
        &self.cache
    }

    /// Cache a verified capability.
    pub fn insert(&self, cap: &Capability) {
        self.cache.insert(cap.clone(), cap.footprint());
    }

    /// Is this exact (signature-identical) capability cached and live?
    pub fn contains(&self, cap: &Capability) -> bool {
        self.cache.lookup(cap).is_some()
    }

    /// Copy the timeout and signature from a cached capability whose grant
    /// fields equal `cap`'s, sparing a signing pass. Returns false when no
    /// field-equal entry is cached — the normal fallback, not a failure.
    pub fn quick_sign(&self, cap: &mut Capability) -> bool {
        let found = self.cache.lookup_cmp(cap, |probe, entry| {
            probe.fs_id == entry.fs_id
                && probe.op_mask == entry.op_mask
                && probe.issuer == entry.issuer
                && probe.handles == entry.handles
        });
        match found {
            Some(cached) => {
                cap.timeout = cached.timeout;
                cap.signature = cached.signature.clone();
                debug!("capability cache: quick-signed for issuer={}", cap.issuer);
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::unix_now;
    use crate::types::{FsId, Oid};

    fn cap(mask: u32, sig: &[u8]) -> Capability {
        Capability {
            issuer: "server-a".into(),
            fs_id: FsId(3),
            op_mask: mask,
            handles: vec![Oid([1; 16]), Oid([2; 16])],
            timeout: unix_now() + 3600,
            signature: sig.to_vec(),
        }
    }

    #[test]
    fn lookup_by_signature() {
        let cc = CapCache::new(SecCacheTuning::default());
        cc.insert(&cap(0xf, b"sig-one"));
        assert!(cc.contains(&cap(0xf, b"sig-one")));
        assert!(!cc.contains(&cap(0xf, b"sig-two")));
    }

    #[test]
    fn quick_sign_copies_signature_on_field_match() {
        let cc = CapCache::new(SecCacheTuning::default());
        let signed = cap(0xf, b"real-signature");
        cc.insert(&signed);

        let mut unsigned = cap(0xf, b"");
        assert!(cc.quick_sign(&mut unsigned));
        assert_eq!(unsigned.signature, b"real-signature");
        assert_eq!(unsigned.timeout, signed.timeout);
    }

    #[test]
    fn quick_sign_declines_on_field_mismatch() {
        let cc = CapCache::new(SecCacheTuning::default());
        cc.insert(&cap(0xf, b"real-signature"));

        // different op mask: cached entry must not be reused
        let mut unsigned = cap(0x1, b"");
        assert!(!cc.quick_sign(&mut unsigned));
        assert!(unsigned.signature.is_empty());
    }
}
