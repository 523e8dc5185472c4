//! Generic expiring hashed-chain cache.
//!
//! Each concrete cache supplies its behavior through [`CacheOps`]: how data
//! hashes to a chain, what makes a probe match an entry, and how an entry's
//! expiration is stamped. The cache owns the chains, the lock, the tunables,
//! and the statistics; lookups roll live entries' expirations forward and
//! drop lapsed ones on contact.

use log::{debug, info};
use parking_lot::Mutex;

use super::unix_now;
use crate::chains::ChainTable;
use crate::config::SecCacheTuning;
use crate::error::{Error, Result};

/// Behavior a concrete cache plugs into [`SecurityCache`].
pub trait CacheOps {
    /// The cached token type.
    type Data: Clone + Send;

    /// Chain index for `data`, below `hash_limit`.
    fn index_of(data: &Self::Data, hash_limit: u64) -> u64;

    /// Does `probe` identify `entry`?
    fn matches(probe: &Self::Data, entry: &Self::Data) -> bool;

    /// Expiration stamped at insert and on every hit. The default is a
    /// timeout from now; implementations cap it at the token's own
    /// expiration or replace it entirely.
    fn stamp_expiration(data: &Self::Data, timeout_secs: u64, now: u64) -> u64 {
        let _ = data;
        now + timeout_secs
    }

    /// One debug line describing `data`; must not print secrets.
    fn describe(prefix: &str, data: &Self::Data);
}

/// Tunable properties, settable at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheProp {
    /// Most entries held.
    EntryLimit,
    /// Soft cap on cached bytes.
    SizeLimit,
    /// Number of hash chains.
    HashLimit,
    /// Seconds an entry lives after insert or refresh.
    Timeout,
    /// Lookups between statistics lines; 0 disables.
    StatsFreq,
}

/// Hit/miss accounting, reported every `stats_freq` lookups.
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheStats {
    /// Entries inserted.
    pub inserts: u64,
    /// Lookup calls.
    pub lookups: u64,
    /// Lookups that found a live entry.
    pub hits: u64,
    /// Lookups that found nothing.
    pub misses: u64,
    /// Entries removed explicitly or by eviction.
    pub removed: u64,
    /// Entries dropped because they lapsed.
    pub expired: u64,
    /// Entries currently held.
    pub entry_count: u64,
    /// Bytes currently held, by the caches' own accounting.
    pub cache_size: u64,
}

struct Entry<D> {
    expiration: u64,
    data: D,
    data_size: usize,
}

struct CacheState<D> {
    chains: ChainTable<Entry<D>>,
    stats: CacheStats,
    stat_count: u64,
    tuning: SecCacheTuning,
}

/// An expiring cache specialized by a [`CacheOps`] implementation.
pub struct SecurityCache<O: CacheOps> {
    desc: &'static str,
    state: Mutex<CacheState<O::Data>>,
}

impl<O: CacheOps> std::fmt::Debug for SecurityCache<O> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("SecurityCache")
            .field("desc", &self.desc)
            .field("entries", &state.chains.len())
            .finish()
    }
}

impl<O: CacheOps> SecurityCache<O> {
    /// Cache named `desc` (for log lines) with the given tuning.
    pub fn new(desc: &'static str, tuning: SecCacheTuning) -> SecurityCache<O> {
        SecurityCache {
            desc,
            state: Mutex::new(CacheState {
                chains: ChainTable::new(tuning.hash_limit as usize),
                stats: CacheStats::default(),
                stat_count: 0,
                tuning,
            }),
        }
    }

    /// Look `probe` up with the cache's own comparator.
    pub fn lookup(&self, probe: &O::Data) -> Option<O::Data> {
        self.lookup_cmp(probe, O::matches)
    }

    /// Look `probe` up with an override comparator. A hit refreshes the
    /// entry's expiration; a lapsed entry is dropped and reported as a
    /// miss.
    pub fn lookup_cmp<F>(&self, probe: &O::Data, matches: F) -> Option<O::Data>
    where
        F: Fn(&O::Data, &O::Data) -> bool,
    {
        let now = unix_now();
        let mut state = self.state.lock();
        let bucket = O::index_of(probe, state.tuning.hash_limit) as usize;
        let timeout = state.tuning.timeout_secs;

        let found = state
            .chains
            .search_mut(bucket, |e| matches(probe, &e.data))
            .map(|entry| {
                if entry.expiration <= now {
                    None
                } else {
                    entry.expiration = O::stamp_expiration(&entry.data, timeout, now);
                    Some(entry.data.clone())
                }
            });

        state.stats.lookups += 1;
        let result = match found {
            Some(Some(data)) => {
                state.stats.hits += 1;
                Some(data)
            }
            Some(None) => {
                // found but lapsed: drop it on the way out
                if let Some(old) = state.chains.search_remove(bucket, |e| matches(probe, &e.data)) {
                    state.stats.expired += 1;
                    state.stats.entry_count -= 1;
                    state.stats.cache_size -= old.data_size as u64;
                }
                state.stats.misses += 1;
                None
            }
            None => {
                state.stats.misses += 1;
                None
            }
        };

        self.maybe_report(&mut state);
        debug!(
            "{} cache: lookup {}",
            self.desc,
            if result.is_some() { "hit" } else { "miss" }
        );
        result
    }

    /// Insert `data`, draining lapsed entries from its chain first and
    /// evicting the oldest entries if the cache is at a limit.
    pub fn insert(&self, data: O::Data, data_size: usize) {
        let now = unix_now();
        let mut state = self.state.lock();
        let bucket = O::index_of(&data, state.tuning.hash_limit) as usize;

        // lapsed neighbors go first
        let mut dropped = 0u64;
        let mut dropped_size = 0u64;
        state.chains.retain_chain(bucket, |e| {
            if e.expiration <= now {
                dropped += 1;
                dropped_size += e.data_size as u64;
                false
            } else {
                true
            }
        });
        state.stats.expired += dropped;
        state.stats.entry_count -= dropped;
        state.stats.cache_size -= dropped_size;

        // stay under the entry and byte limits
        while state.chains.len() as u64 >= state.tuning.entry_limit
            || state.stats.cache_size + data_size as u64 > state.tuning.size_limit
        {
            let Some(victim_bucket) = state.chains.first_occupied_from(bucket) else {
                break;
            };
            if let Some(victim) = state.chains.remove_tail_at(victim_bucket) {
                state.stats.removed += 1;
                state.stats.entry_count -= 1;
                state.stats.cache_size -= victim.data_size as u64;
            }
        }

        O::describe("caching", &data);
        let expiration = O::stamp_expiration(&data, state.tuning.timeout_secs, now);
        state.chains.insert_head(
            bucket,
            Entry {
                expiration,
                data,
                data_size,
            },
        );
        state.stats.inserts += 1;
        state.stats.entry_count += 1;
        state.stats.cache_size += data_size as u64;
    }

    /// Remove the entry `probe` identifies. `NotFound` when absent.
    pub fn remove(&self, probe: &O::Data) -> Result<()> {
        let mut state = self.state.lock();
        let bucket = O::index_of(probe, state.tuning.hash_limit) as usize;
        match state.chains.search_remove(bucket, |e| O::matches(probe, &e.data)) {
            Some(old) => {
                state.stats.removed += 1;
                state.stats.entry_count -= 1;
                state.stats.cache_size -= old.data_size as u64;
                Ok(())
            }
            None => Err(Error::NotFound),
        }
    }

    /// Read one tunable.
    pub fn get_prop(&self, prop: CacheProp) -> u64 {
        let state = self.state.lock();
        match prop {
            CacheProp::EntryLimit => state.tuning.entry_limit,
            CacheProp::SizeLimit => state.tuning.size_limit,
            CacheProp::HashLimit => state.tuning.hash_limit,
            CacheProp::Timeout => state.tuning.timeout_secs,
            CacheProp::StatsFreq => state.tuning.stats_freq,
        }
    }

    /// Change one tunable. Changing the hash limit rebuilds the chains.
    pub fn set_prop(&self, prop: CacheProp, value: u64) -> Result<()> {
        let mut state = self.state.lock();
        match prop {
            CacheProp::EntryLimit => state.tuning.entry_limit = value,
            CacheProp::SizeLimit => state.tuning.size_limit = value,
            CacheProp::HashLimit => {
                if value == 0 {
                    return Err(Error::BadArg("hash limit must be positive"));
                }
                state.tuning.hash_limit = value;
                let mut old = std::mem::replace(&mut state.chains, ChainTable::new(value as usize));
                for entry in old.drain_all() {
                    let bucket = O::index_of(&entry.data, value) as usize;
                    state.chains.insert_head(bucket, entry);
                }
            }
            CacheProp::Timeout => state.tuning.timeout_secs = value,
            CacheProp::StatsFreq => state.tuning.stats_freq = value,
        }
        Ok(())
    }

    /// Snapshot of the statistics block.
    pub fn stats(&self) -> CacheStats {
        self.state.lock().stats
    }

    /// Zero the statistics block.
    pub fn reset_stats(&self) {
        let mut state = self.state.lock();
        let held = (state.stats.entry_count, state.stats.cache_size);
        state.stats = CacheStats::default();
        state.stats.entry_count = held.0;
        state.stats.cache_size = held.1;
    }

    fn maybe_report(&self, state: &mut CacheState<O::Data>) {
        if state.tuning.stats_freq == 0 {
            return;
        }
        state.stat_count += 1;
        if state.stat_count >= state.tuning.stats_freq {
            state.stat_count = 0;
            let s = &state.stats;
            info!(
                "{} cache stats: {} entries, {} lookups, {} hits, {} misses, {} expired, {} removed",
                self.desc, s.entry_count, s.lookups, s.hits, s.misses, s.expired, s.removed
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Tok {
        name: u64,
        hard_expiry: Option<u64>,
    }

    struct TokOps;

    impl CacheOps for TokOps {
        type Data = Tok;

        fn index_of(data: &Tok, hash_limit: u64) -> u64 {
            data.name % hash_limit
        }

        fn matches(probe: &Tok, entry: &Tok) -> bool {
            probe.name == entry.name
        }

        fn stamp_expiration(data: &Tok, timeout_secs: u64, now: u64) -> u64 {
            let soft = now + timeout_secs;
            match data.hard_expiry {
                Some(hard) => soft.min(hard),
                None => soft,
            }
        }

        fn describe(prefix: &str, data: &Tok) {
            log::debug!("{prefix} token {}", data.name);
        }
    }

    fn tok(name: u64) -> Tok {
        Tok {
            name,
            hard_expiry: None,
        }
    }

    fn cache(tuning: SecCacheTuning) -> SecurityCache<TokOps> {
        SecurityCache::new("test", tuning)
    }

    #[test]
    fn insert_then_hit_before_timeout() {
        let c = cache(SecCacheTuning::default());
        c.insert(tok(1), 8);
        assert_eq!(c.lookup(&tok(1)), Some(tok(1)));
        assert_eq!(c.lookup(&tok(2)), None);
        let s = c.stats();
        assert_eq!(s.hits, 1);
        assert_eq!(s.misses, 1);
    }

    #[test]
    fn lapsed_entry_is_removed_on_lookup() {
        let tuning = SecCacheTuning {
            timeout_secs: 0,
            ..Default::default()
        };
        let c = cache(tuning);
        c.insert(tok(1), 8);
        assert_eq!(c.lookup(&tok(1)), None);
        let s = c.stats();
        assert_eq!(s.expired, 1);
        assert_eq!(s.entry_count, 0);
    }

    #[test]
    fn own_expiry_caps_the_stamp() {
        let c = cache(SecCacheTuning::default());
        // token already expired on its own terms
        c.insert(
            Tok {
                name: 1,
                hard_expiry: Some(1),
            },
            8,
        );
        assert_eq!(c.lookup(&tok(1)), None);
    }

    #[test]
    fn full_cache_evicts_exactly_one() {
        let tuning = SecCacheTuning {
            entry_limit: 3,
            ..Default::default()
        };
        let c = cache(tuning);
        for n in 0..3 {
            c.insert(tok(n), 8);
        }
        c.insert(tok(99), 8);
        let s = c.stats();
        assert_eq!(s.entry_count, 3);
        assert_eq!(s.removed, 1);
        assert_eq!(c.lookup(&tok(99)), Some(tok(99)));
    }

    #[test]
    fn remove_and_props() {
        let c = cache(SecCacheTuning::default());
        c.insert(tok(5), 8);
        c.remove(&tok(5)).unwrap();
        assert!(c.remove(&tok(5)).is_err());

        assert_eq!(c.get_prop(CacheProp::EntryLimit), 256);
        c.set_prop(CacheProp::Timeout, 120).unwrap();
        assert_eq!(c.get_prop(CacheProp::Timeout), 120);
    }

    #[test]
    fn hash_limit_rebuild_keeps_entries() {
        let c = cache(SecCacheTuning::default());
        for n in 0..10 {
            c.insert(tok(n), 8);
        }
        c.set_prop(CacheProp::HashLimit, 4).unwrap();
        for n in 0..10 {
            assert!(c.lookup(&tok(n)).is_some(), "entry {n} lost in rebuild");
        }
    }
}
