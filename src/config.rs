//! Server tunables.
//!
//! Typed knobs with defaults matching long-standing deployment values, plus
//! a `name=value` parser for the fragments a server config file hands this
//! layer. Unknown names are rejected so typos surface at startup rather
//! than as silently-default caches.

use crate::error::{Error, Result};

/// Keyval-store tuning: attribute cache shape and pcache cap.
#[derive(Debug, Clone)]
pub struct KeyvalTuning {
    /// Attribute cache bucket count.
    pub attr_table_size: usize,
    /// Most entries the attribute cache may hold.
    pub attr_max_elems: usize,
    /// Keyval names the attribute cache may hold values for.
    pub attr_keywords: Vec<String>,
    /// Position cache entry cap.
    pub pcache_limit: usize,
}

impl Default for KeyvalTuning {
    fn default() -> KeyvalTuning {
        KeyvalTuning {
            attr_table_size: 511,
            attr_max_elems: 1024,
            attr_keywords: vec!["datafile_handles".into(), "metafile_dist".into()],
            pcache_limit: 51_200,
        }
    }
}

/// Security cache tuning shared by the capability, credential, and
/// revocation caches.
#[derive(Debug, Clone, Copy)]
pub struct SecCacheTuning {
    /// Most entries the cache may hold.
    pub entry_limit: u64,
    /// Soft cap on total cached bytes.
    pub size_limit: u64,
    /// Number of hash chains.
    pub hash_limit: u64,
    /// Seconds an entry stays valid after insert or refresh.
    pub timeout_secs: u64,
    /// Emit cache statistics every this many lookups; 0 disables.
    pub stats_freq: u64,
}

impl Default for SecCacheTuning {
    fn default() -> SecCacheTuning {
        SecCacheTuning {
            entry_limit: 256,
            size_limit: 64 * 1024 * 1024,
            hash_limit: 128,
            timeout_secs: 60,
            stats_freq: 1000,
        }
    }
}

/// Transport buffer tuning for the wire codec.
#[derive(Debug, Clone, Copy)]
pub struct WireTuning {
    /// Receive buffers posted per connection.
    pub recv_buf_count: u32,
    /// Size of each receive buffer in bytes.
    pub recv_buf_size: u32,
}

impl Default for WireTuning {
    fn default() -> WireTuning {
        WireTuning {
            recv_buf_count: 20,
            recv_buf_size: 8 * 1024,
        }
    }
}

/// All tunables in one place.
#[derive(Debug, Clone, Default)]
pub struct Tuning {
    /// Keyval-store knobs.
    pub keyval: KeyvalTuning,
    /// Security cache knobs.
    pub seccache: SecCacheTuning,
    /// Wire codec knobs.
    pub wire: WireTuning,
}

impl Tuning {
    /// Apply one `name=value` option.
    pub fn apply(&mut self, option: &str) -> Result<()> {
        let (name, value) = option
            .split_once('=')
            .ok_or(Error::BadArg("option must be name=value"))?;
        let name = name.trim();
        let value = value.trim();
        match name {
            "attr_cache_table_size" => self.keyval.attr_table_size = parse_pos(value)?,
            "attr_cache_max_elems" => self.keyval.attr_max_elems = parse_pos(value)?,
            "attr_cache_keywords" => {
                self.keyval.attr_keywords =
                    value.split(',').map(|s| s.trim().to_string()).collect();
            }
            "pcache_limit" => self.keyval.pcache_limit = parse_pos(value)?,
            "seccache_entry_limit" => self.seccache.entry_limit = parse_u64(value)?,
            "seccache_size_limit" => self.seccache.size_limit = parse_u64(value)?,
            "seccache_hash_limit" => {
                let v = parse_u64(value)?;
                if v == 0 {
                    return Err(Error::BadArg("seccache_hash_limit must be positive"));
                }
                self.seccache.hash_limit = v;
            }
            "seccache_timeout" => self.seccache.timeout_secs = parse_u64(value)?,
            "seccache_stats_freq" => self.seccache.stats_freq = parse_u64(value)?,
            "recv_buf_count" => self.wire.recv_buf_count = parse_u32_pos(value)?,
            "recv_buf_size" => self.wire.recv_buf_size = parse_u32_pos(value)?,
            _ => return Err(Error::BadArg("unknown tuning option")),
        }
        Ok(())
    }

    /// Apply a batch of `name=value` options in order.
    pub fn apply_all<'a, I: IntoIterator<Item = &'a str>>(&mut self, options: I) -> Result<()> {
        for opt in options {
            self.apply(opt)?;
        }
        Ok(())
    }
}

fn parse_u64(value: &str) -> Result<u64> {
    value.parse().map_err(|_| Error::BadArg("expected an unsigned integer"))
}

fn parse_pos(value: &str) -> Result<usize> {
    let v: usize = value
        .parse()
        .map_err(|_| Error::BadArg("expected an unsigned integer"))?;
    if v == 0 {
        return Err(Error::BadArg("value must be positive"));
    }
    Ok(v)
}

fn parse_u32_pos(value: &str) -> Result<u32> {
    let v: u32 = value
        .parse()
        .map_err(|_| Error::BadArg("expected an unsigned integer"))?;
    if v == 0 {
        return Err(Error::BadArg("value must be positive"));
    }
    Ok(v)
}
