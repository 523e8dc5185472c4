//! Security tokens and their caches.
//!
//! Verifying a capability or credential signature is expensive, so verified
//! tokens are held in expiring caches and revalidated only when their cache
//! entry lapses. A third cache carries revocations, whose entries expire on
//! the revocation's own deadline rather than a timeout from insertion.

mod cache;
mod capcache;
mod credcache;
mod revlist;

pub use cache::{CacheOps, CacheProp, CacheStats, SecurityCache};
pub use capcache::CapCache;
pub use credcache::CredCache;
pub use revlist::RevocationList;

use crate::types::{FsId, Oid, Sid};

/// A signed token granting an operation mask over a set of objects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Capability {
    /// Server that issued and signed the token.
    pub issuer: String,
    /// Filesystem the grant applies to.
    pub fs_id: FsId,
    /// Bitmask of permitted operations.
    pub op_mask: u32,
    /// Objects covered by the grant.
    pub handles: Vec<Oid>,
    /// Expiration, unix seconds.
    pub timeout: u64,
    /// Signature over the above; empty for the null capability.
    pub signature: Vec<u8>,
}

impl Capability {
    /// Rough in-memory footprint, used for cache size accounting.
    pub fn footprint(&self) -> usize {
        std::mem::size_of::<Capability>()
            + self.issuer.len()
            + self.handles.len() * std::mem::size_of::<Oid>()
            + self.signature.len()
    }
}

/// A signed identity token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    /// Server that issued and signed the token.
    pub issuer: String,
    /// User the credential identifies.
    pub userid: u32,
    /// Group memberships.
    pub groups: Vec<u32>,
    /// Expiration, unix seconds.
    pub timeout: u64,
    /// Signature over the above.
    pub signature: Vec<u8>,
}

impl Credential {
    /// Rough in-memory footprint, used for cache size accounting.
    pub fn footprint(&self) -> usize {
        std::mem::size_of::<Credential>()
            + self.issuer.len()
            + self.groups.len() * 4
            + self.signature.len()
    }
}

/// One revoked capability, identified by issuing server and capability id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Revocation {
    /// Server the revocation came from.
    pub server: Sid,
    /// Id of the revoked capability.
    pub capability_id: u64,
    /// When the revocation itself lapses, unix seconds.
    pub expires: u64,
}

pub(crate) fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

pub(crate) fn mix_bytes(seed: u64, bytes: &[u8]) -> u64 {
    let mut h = seed ^ 0x9e37_79b9_7f4a_7c15;
    for &b in bytes {
        h ^= b as u64;
        h = h.wrapping_mul(0x100_0000_01b3);
    }
    h ^ (h >> 29)
}
