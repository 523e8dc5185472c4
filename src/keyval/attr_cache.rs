//! Attribute cache.
//!
//! Bounded per-object cache of dataspace attributes plus a fixed whitelist
//! of keyval values worth keeping hot (datafile handles, distribution
//! names). Entries are only written after the backing store has committed,
//! so a hit never reflects uncommitted state.
//!
//! Eviction is random-victim: a uniformly random bucket, scanning forward to
//! the first occupied one, dropping the head of its chain.

use log::debug;
use rand::Rng;

use crate::chains::ChainTable;
use crate::error::{Error, Result};
use crate::types::{DsAttributes, ObjectRef};

/// Most keyval names one entry can carry.
pub const ATTR_CACHE_MAX_KEYVALS: usize = 8;

/// One cached keyval value under an object.
#[derive(Debug, Clone)]
pub struct CachedKeyval {
    /// Whitelisted key name.
    pub key: String,
    /// Value bytes, present once something was cached for the key.
    pub data: Option<Vec<u8>>,
}

#[derive(Debug)]
struct AttrCacheElem {
    key: ObjectRef,
    attr: DsAttributes,
    keyvals: Vec<CachedKeyval>,
}

/// Bounded object-attribute cache with a keyval whitelist.
#[derive(Debug)]
pub struct AttrCache {
    table: ChainTable<AttrCacheElem>,
    max_elems: usize,
    keywords: Vec<String>,
}

impl AttrCache {
    /// Cache with `table_size` buckets, at most `max_elems` entries, and
    /// the given cacheable keyval names (at most
    /// [`ATTR_CACHE_MAX_KEYVALS`], extras are dropped).
    pub fn new(table_size: usize, max_elems: usize, keywords: &[&str]) -> AttrCache {
        let keywords = keywords
            .iter()
            .take(ATTR_CACHE_MAX_KEYVALS)
            .map(|k| k.to_string())
            .collect();
        AttrCache {
            table: ChainTable::new(table_size),
            max_elems,
            keywords,
        }
    }

    fn bucket(&self, refn: &ObjectRef) -> usize {
        refn.bucket_hash() as usize % self.table.nbuckets()
    }

    /// True when `refn` has an entry.
    pub fn contains(&self, refn: &ObjectRef) -> bool {
        self.table.search(self.bucket(refn), |e| e.key == *refn).is_some()
    }

    /// Cached attributes for `refn`.
    pub fn fetch_attr(&self, refn: &ObjectRef) -> Option<DsAttributes> {
        self.table
            .search(self.bucket(refn), |e| e.key == *refn)
            .map(|e| e.attr)
    }

    /// Cached value bytes for a whitelisted keyval, when present.
    pub fn get_keyval(&self, refn: &ObjectRef, key: &str) -> Option<Vec<u8>> {
        self.table
            .search(self.bucket(refn), |e| e.key == *refn)?
            .keyvals
            .iter()
            .find(|kv| kv.key == key)?
            .data
            .clone()
    }

    /// Insert or refresh the entry for `refn`, evicting a random victim
    /// when the cache is full.
    pub fn insert(&mut self, refn: ObjectRef, attr: DsAttributes) {
        if !self.contains(&refn) && self.table.len() >= self.max_elems {
            self.evict_random();
        }
        let bucket = self.bucket(&refn);
        if let Some(elem) = self.table.search_mut(bucket, |e| e.key == refn) {
            elem.attr = attr;
            return;
        }
        let keyvals = self
            .keywords
            .iter()
            .map(|k| CachedKeyval {
                key: k.clone(),
                data: None,
            })
            .collect();
        self.table.insert_head(
            bucket,
            AttrCacheElem {
                key: refn,
                attr,
                keyvals,
            },
        );
        debug!("attr cache: inserted {refn}");
    }

    fn evict_random(&mut self) {
        let start = rand::thread_rng().gen_range(0..self.table.nbuckets());
        if let Some(bucket) = self.table.first_occupied_from(start) {
            if let Some(victim) = self.table.remove_head_at(bucket) {
                debug!("attr cache full, evicted {}", victim.key);
            }
        }
    }

    /// Drop the entry for `refn`. `NotFound` when absent.
    pub fn remove(&mut self, refn: &ObjectRef) -> Result<()> {
        self.table
            .search_remove(self.bucket(refn), |e| e.key == *refn)
            .map(|_| ())
            .ok_or(Error::NotFound)
    }

    /// Replace the whole attribute block for a cached object.
    pub fn update_attr(&mut self, refn: &ObjectRef, attr: &DsAttributes) -> bool {
        let bucket = self.bucket(refn);
        match self.table.search_mut(bucket, |e| e.key == *refn) {
            Some(elem) => {
                elem.attr = *attr;
                true
            }
            None => false,
        }
    }

    /// Update only the bytestream size of a cached object.
    pub fn update_bsize(&mut self, refn: &ObjectRef, b_size: i64) -> bool {
        let bucket = self.bucket(refn);
        match self.table.search_mut(bucket, |e| e.key == *refn) {
            Some(elem) => {
                elem.attr.b_size = b_size;
                true
            }
            None => false,
        }
    }

    /// Update only the keyval-entry count of a cached object.
    pub fn update_ksize(&mut self, refn: &ObjectRef, k_size: i64) -> bool {
        let bucket = self.bucket(refn);
        match self.table.search_mut(bucket, |e| e.key == *refn) {
            Some(elem) => {
                elem.attr.k_size = k_size;
                true
            }
            None => false,
        }
    }

    /// Cache `data` under a whitelisted keyval name for `refn`. Fails when
    /// the object is not cached or the name is not on the whitelist.
    pub fn set_keyval(&mut self, refn: &ObjectRef, key: &str, data: &[u8]) -> Result<()> {
        let bucket = self.bucket(refn);
        let elem = self
            .table
            .search_mut(bucket, |e| e.key == *refn)
            .ok_or(Error::NotFound)?;
        let slot = elem
            .keyvals
            .iter_mut()
            .find(|kv| kv.key == key)
            .ok_or(Error::BadArg("key is not cacheable"))?;
        slot.data = Some(data.to_vec());
        Ok(())
    }

    /// Forget the cached value (not the slot) of one keyval name.
    pub fn clear_keyval(&mut self, refn: &ObjectRef, key: &str) {
        let bucket = self.bucket(refn);
        if let Some(elem) = self.table.search_mut(bucket, |e| e.key == *refn) {
            if let Some(slot) = elem.keyvals.iter_mut().find(|kv| kv.key == key) {
                slot.data = None;
            }
        }
    }

    /// Live entry count.
    pub fn len(&self) -> usize {
        self.table.len()
    }

    /// True when the cache holds nothing.
    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{FsId, Oid};

    fn refn(n: u8) -> ObjectRef {
        ObjectRef::new(FsId(1), Oid([n; 16]))
    }

    fn attrs(b_size: i64) -> DsAttributes {
        DsAttributes {
            b_size,
            ..Default::default()
        }
    }

    #[test]
    fn insert_fetch_remove() {
        let mut c = AttrCache::new(16, 8, &["dh", "md"]);
        c.insert(refn(1), attrs(100));
        assert_eq!(c.fetch_attr(&refn(1)).unwrap().b_size, 100);
        assert!(c.fetch_attr(&refn(2)).is_none());
        c.remove(&refn(1)).unwrap();
        assert!(matches!(c.remove(&refn(1)), Err(Error::NotFound)));
    }

    #[test]
    fn keyval_whitelist_enforced() {
        let mut c = AttrCache::new(16, 8, &["dh"]);
        c.insert(refn(1), attrs(0));
        c.set_keyval(&refn(1), "dh", b"handles").unwrap();
        assert_eq!(c.get_keyval(&refn(1), "dh"), Some(b"handles".to_vec()));
        assert!(c.set_keyval(&refn(1), "other", b"x").is_err());
        assert!(c.set_keyval(&refn(2), "dh", b"x").is_err());
        c.clear_keyval(&refn(1), "dh");
        assert_eq!(c.get_keyval(&refn(1), "dh"), None);
    }

    #[test]
    fn targeted_updates_hit_cached_entries_only() {
        let mut c = AttrCache::new(16, 8, &[]);
        c.insert(refn(1), attrs(5));
        assert!(c.update_bsize(&refn(1), 50));
        assert!(c.update_ksize(&refn(1), 3));
        assert!(!c.update_bsize(&refn(9), 50));
        let a = c.fetch_attr(&refn(1)).unwrap();
        assert_eq!(a.b_size, 50);
        assert_eq!(a.k_size, 3);
    }

    #[test]
    fn eviction_keeps_cache_at_cap_and_admits_new_entry() {
        let mut c = AttrCache::new(8, 4, &[]);
        for n in 0..4 {
            c.insert(refn(n), attrs(n as i64));
        }
        assert_eq!(c.len(), 4);
        c.insert(refn(50), attrs(50));
        assert_eq!(c.len(), 4, "exactly one eviction per insert");
        assert!(c.contains(&refn(50)), "new entry must survive");
    }
}
