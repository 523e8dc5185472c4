//! Iteration position cache.
//!
//! Maps `(object, position)` to the raw key bytes of the last entry an
//! iteration returned, so a resumed scan can seek straight back instead of
//! stepping from the start. Entries never expire; the cache is bounded by a
//! hard cap and rejects new entries once full. Losing an entry only costs
//! the resumer a slower skip-to-position walk.

use log::debug;
use parking_lot::Mutex;

use crate::chains::ChainTable;
use crate::error::{Error, Result};
use crate::types::Oid;

/// Bucket count; power of two so the mixed hash folds cleanly.
const PCACHE_TABLE_SIZE: usize = 1 << 10;
/// Entry cap. Inserts beyond this fail quietly.
const PCACHE_HARD_LIMIT: usize = 51_200;

#[derive(Debug)]
struct PcacheEntry {
    oid: Oid,
    pos: u64,
    key: Vec<u8>,
}

/// Position cache for resumable iteration.
#[derive(Debug)]
pub struct PositionCache {
    table: Mutex<ChainTable<PcacheEntry>>,
    hard_limit: usize,
}

impl Default for PositionCache {
    fn default() -> Self {
        PositionCache::new()
    }
}

impl PositionCache {
    /// Cache with the default table size and hard cap.
    pub fn new() -> PositionCache {
        PositionCache::with_limit(PCACHE_HARD_LIMIT)
    }

    /// Cache with a custom entry cap; test support and small deployments.
    pub fn with_limit(hard_limit: usize) -> PositionCache {
        PositionCache {
            table: Mutex::new(ChainTable::new(PCACHE_TABLE_SIZE)),
            hard_limit,
        }
    }

    fn bucket(oid: &Oid, pos: u64) -> usize {
        let mut h = pos ^ (pos >> 31);
        for chunk in oid.0.chunks_exact(8) {
            let mut v = [0u8; 8];
            v.copy_from_slice(chunk);
            h = h.wrapping_mul(0x9e3779b97f4a7c15) ^ u64::from_le_bytes(v);
        }
        (h as usize) & (PCACHE_TABLE_SIZE - 1)
    }

    /// Key bytes recorded for `(oid, pos)`, if still cached.
    pub fn lookup(&self, oid: &Oid, pos: u64) -> Option<Vec<u8>> {
        let table = self.table.lock();
        let hit = table
            .search(Self::bucket(oid, pos), |e| e.oid == *oid && e.pos == pos)
            .map(|e| e.key.clone());
        debug!(
            "pcache lookup {}: oid={oid} pos={pos:#x}",
            if hit.is_some() { "hit" } else { "miss" }
        );
        hit
    }

    /// Record `key` as the last entry returned at `(oid, pos)`. Replaces an
    /// existing record for the same position; fails quietly at the cap.
    pub fn insert(&self, oid: &Oid, pos: u64, key: &[u8]) -> Result<()> {
        let bucket = Self::bucket(oid, pos);
        let mut table = self.table.lock();
        table.search_remove(bucket, |e| e.oid == *oid && e.pos == pos);
        if table.len() >= self.hard_limit {
            debug!("pcache full ({} entries), rejecting oid={oid} pos={pos:#x}", table.len());
            return Err(Error::Busy);
        }
        table.insert_head(
            bucket,
            PcacheEntry {
                oid: *oid,
                pos,
                key: key.to_vec(),
            },
        );
        Ok(())
    }

    /// Drop every entry. Models a server restart in tests.
    pub fn clear(&self) {
        self.table.lock().drain_all();
    }

    /// Number of cached positions.
    pub fn len(&self) -> usize {
        self.table.lock().len()
    }

    /// True when nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.table.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn oid(n: u8) -> Oid {
        Oid([n; 16])
    }

    #[test]
    fn lookup_after_insert() {
        let pc = PositionCache::new();
        pc.insert(&oid(1), 0x10003, b"lastkey").unwrap();
        assert_eq!(pc.lookup(&oid(1), 0x10003), Some(b"lastkey".to_vec()));
        assert_eq!(pc.lookup(&oid(1), 0x10004), None);
        assert_eq!(pc.lookup(&oid(2), 0x10003), None);
    }

    #[test]
    fn reinsert_replaces() {
        let pc = PositionCache::new();
        pc.insert(&oid(1), 7, b"one").unwrap();
        pc.insert(&oid(1), 7, b"two").unwrap();
        assert_eq!(pc.lookup(&oid(1), 7), Some(b"two".to_vec()));
        assert_eq!(pc.len(), 1);
    }

    #[test]
    fn hard_cap_rejects_new() {
        let pc = PositionCache::with_limit(2);
        pc.insert(&oid(1), 1, b"a").unwrap();
        pc.insert(&oid(1), 2, b"b").unwrap();
        assert!(pc.insert(&oid(1), 3, b"c").is_err());
        // replacing an existing position still works at the cap
        pc.insert(&oid(1), 2, b"b2").unwrap();
        assert_eq!(pc.lookup(&oid(1), 2), Some(b"b2".to_vec()));
    }

    #[test]
    fn clear_empties() {
        let pc = PositionCache::new();
        pc.insert(&oid(1), 1, b"a").unwrap();
        pc.clear();
        assert!(pc.is_empty());
        assert_eq!(pc.lookup(&oid(1), 1), None);
    }
}
