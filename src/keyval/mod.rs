//! Ordered keyval store.
//!
//! Every record lives in one storage-engine database under the physical key
//! `[OID (16)] [type (1)] [user key bytes]`, so a prefix scan walks exactly
//! one object's entries of one type. A per-object count record with empty
//! user key tracks how many counted entries exist. Iteration hands out
//! opaque resumable positions backed by the position cache, with a
//! skip-to-position fallback that survives cache loss and restarts.

mod attr_cache;
mod pcache;

pub use attr_cache::{ATTR_CACHE_MAX_KEYVALS, AttrCache, CachedKeyval};
pub use pcache::PositionCache;

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use bitflags::bitflags;
use log::{debug, warn};
use parking_lot::Mutex;
use rand::Rng;

use crate::config::KeyvalTuning;
use crate::error::{Error, Result};
use crate::job::{CompletionQueue, JobId};
use crate::store::{CursorOp, Dbase, DbCursor};
use crate::types::{FsId, ObjectRef, Oid};

/// Longest permitted user key, matching the engine's page constraints.
pub const MAX_KEY_LENGTH: usize = 512;

/// Record type byte within the physical key. The byte values order count
/// records between attribute and directory-entry streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum KeyType {
    /// Object attribute entries.
    Attribute = b'a',
    /// Per-object entry counter.
    Count = b'c',
    /// Directory entries.
    DirectoryEntry = b'd',
}

bitflags! {
    /// Behavior flags accepted by every keyval operation.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct KeyvalFlags: u32 {
        /// Force the engine to stabilize after the operation.
        const SYNC = 1 << 0;
        /// Insert only; fail with `Exists` when the key is present.
        const NO_OVERWRITE = 1 << 1;
        /// Update only; fail with `NotFound` when the key is absent.
        const ONLY_OVERWRITE = 1 << 2;
        /// Operate on directory entries instead of attributes.
        const DIRECTORY_ENTRY = 1 << 3;
        /// Key bytes are opaque: never printed, never attribute-cached.
        const BINARY_KEY = 1 << 4;
        /// Maintain the per-object count record.
        const HANDLE_COUNT = 1 << 5;
        /// Remove each entry as iteration yields it.
        const ITERATE_REMOVE = 1 << 6;
    }
}

impl KeyvalFlags {
    fn key_type(self) -> KeyType {
        if self.contains(KeyvalFlags::DIRECTORY_ENTRY) {
            KeyType::DirectoryEntry
        } else {
            KeyType::Attribute
        }
    }
}

/// Opaque iteration position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KvPosition(pub u64);

impl KvPosition {
    /// Begin a fresh scan.
    pub const START: KvPosition = KvPosition(u64::MAX);
    /// The scan already ran off the end.
    pub const END: KvPosition = KvPosition(u64::MAX - 1);

    fn index(self) -> u64 {
        self.0 & 0xffff_ffff
    }
}

fn encode_key(oid: &Oid, ktype: KeyType, user_key: &[u8]) -> Result<Vec<u8>> {
    if user_key.len() > MAX_KEY_LENGTH {
        return Err(Error::BadArg("key exceeds maximum length"));
    }
    let mut out = Vec::with_capacity(17 + user_key.len());
    out.extend_from_slice(oid.as_bytes());
    out.push(ktype as u8);
    out.extend_from_slice(user_key);
    Ok(out)
}

/// Split a physical key back into `(oid, type byte, user key)`.
fn decode_key(raw: &[u8]) -> Result<(Oid, u8, &[u8])> {
    if raw.len() < 17 {
        return Err(Error::Corrupt("keyval key shorter than its prefix"));
    }
    let mut oid = [0u8; 16];
    oid.copy_from_slice(&raw[..16]);
    Ok((Oid(oid), raw[16], &raw[17..]))
}

enum CountAdjust {
    Increment,
    Decrement,
}

/// The keyval store over one collection's database.
pub struct KeyvalStore {
    db: Arc<dyn Dbase>,
    fs_id: FsId,
    pcache: PositionCache,
    attr_cache: Mutex<AttrCache>,
    readdir_session: AtomicU32,
}

impl std::fmt::Debug for KeyvalStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyvalStore")
            .field("records", &self.db.record_count())
            .field("pcache_entries", &self.pcache.len())
            .finish()
    }
}

impl KeyvalStore {
    /// Store over one collection's `db` with default tuning.
    pub fn new(db: Arc<dyn Dbase>, fs_id: FsId) -> KeyvalStore {
        KeyvalStore::with_tuning(db, fs_id, &KeyvalTuning::default())
    }

    /// Store over one collection's `db` with explicit cache tuning.
    pub fn with_tuning(db: Arc<dyn Dbase>, fs_id: FsId, tuning: &KeyvalTuning) -> KeyvalStore {
        let keywords: Vec<&str> = tuning.attr_keywords.iter().map(|s| s.as_str()).collect();
        KeyvalStore {
            db,
            fs_id,
            pcache: PositionCache::with_limit(tuning.pcache_limit),
            attr_cache: Mutex::new(AttrCache::new(
                tuning.attr_table_size,
                tuning.attr_max_elems,
                &keywords,
            )),
            readdir_session: AtomicU32::new(rand::thread_rng().r#gen()),
        }
    }

    /// The attribute cache, for the dataspace layer to keep current.
    pub fn attr_cache(&self) -> &Mutex<AttrCache> {
        &self.attr_cache
    }

    /// The position cache; exposed so restart behavior can be exercised.
    pub fn pcache(&self) -> &PositionCache {
        &self.pcache
    }

    /// Read the value under `(oid, key)` into `buf`, returning the number
    /// of bytes written. A too-small buffer yields
    /// `BufferTooSmall { required }` and leaves `buf` untouched.
    pub fn read(&self, oid: &Oid, key: &[u8], buf: &mut [u8], flags: KeyvalFlags) -> Result<usize> {
        if !flags.contains(KeyvalFlags::BINARY_KEY) {
            debug!("keyval read: oid={oid} key={}", String::from_utf8_lossy(key));
            // serve whitelisted keys straight from the attribute cache
            if let Ok(name) = std::str::from_utf8(key) {
                let cache = self.attr_cache.lock();
                if let Some(data) = cache.get_keyval(&ObjectRef::new(self.fs_id, *oid), name) {
                    return copy_out(&data, buf);
                }
            }
        }
        let value = self.db.get(&encode_key(oid, flags.key_type(), key)?)?;
        copy_out(&value, buf)
    }

    /// Store `value` under `(oid, key)` subject to the overwrite flags.
    pub fn write(&self, oid: &Oid, key: &[u8], value: &[u8], flags: KeyvalFlags) -> Result<()> {
        let raw = encode_key(oid, flags.key_type(), key)?;
        if !flags.contains(KeyvalFlags::BINARY_KEY) {
            debug!("keyval write: oid={oid} key={}", String::from_utf8_lossy(key));
        }
        if flags.contains(KeyvalFlags::ONLY_OVERWRITE) {
            self.db.get(&raw)?;
        }
        if flags.contains(KeyvalFlags::NO_OVERWRITE) {
            self.db.put_once(&raw, value)?;
            self.adjust_count(oid, CountAdjust::Increment, flags)?;
        } else {
            self.db.put(&raw, value)?;
        }
        if flags.contains(KeyvalFlags::SYNC) {
            self.db.sync()?;
        }
        // the store has committed; now the cache may reflect it
        if !flags.contains(KeyvalFlags::BINARY_KEY) {
            if let Ok(name) = std::str::from_utf8(key) {
                let mut cache = self.attr_cache.lock();
                let refn = ObjectRef::new(self.fs_id, *oid);
                if cache.contains(&refn) && cache.set_keyval(&refn, name, value).is_err() {
                    debug!("keyval write: {name} not cacheable");
                }
            }
        }
        Ok(())
    }

    /// Delete `(oid, key)`, optionally fetching the old value first.
    pub fn remove(
        &self,
        oid: &Oid,
        key: &[u8],
        old_value: Option<&mut Vec<u8>>,
        flags: KeyvalFlags,
    ) -> Result<()> {
        let raw = encode_key(oid, flags.key_type(), key)?;
        if let Some(out) = old_value {
            *out = self.db.get(&raw)?;
        }
        self.db.del(&raw)?;
        self.adjust_count(oid, CountAdjust::Decrement, flags)?;
        if flags.contains(KeyvalFlags::SYNC) {
            self.db.sync()?;
        }
        if !flags.contains(KeyvalFlags::BINARY_KEY) {
            if let Ok(name) = std::str::from_utf8(key) {
                let refn = ObjectRef::new(self.fs_id, *oid);
                self.attr_cache.lock().clear_keyval(&refn, name);
            }
        }
        Ok(())
    }

    /// Read several keys; each element reports its own outcome.
    pub fn read_list(&self, oid: &Oid, keys: &[&[u8]], flags: KeyvalFlags) -> Vec<Result<Vec<u8>>> {
        keys.iter()
            .map(|key| {
                let raw = encode_key(oid, flags.key_type(), key)?;
                self.db.get(&raw)
            })
            .collect()
    }

    /// Write several pairs; stops at the first failure, leaving earlier
    /// writes in place.
    pub fn write_list(&self, oid: &Oid, pairs: &[(&[u8], &[u8])], flags: KeyvalFlags) -> Result<()> {
        for (key, value) in pairs {
            self.write(oid, key, value, flags)?;
        }
        Ok(())
    }

    /// Remove several keys; each element reports its own outcome.
    pub fn remove_list(&self, oid: &Oid, keys: &[&[u8]], flags: KeyvalFlags) -> Vec<Result<()>> {
        keys.iter()
            .map(|key| self.remove(oid, key, None, flags))
            .collect()
    }

    /// Force the engine to stabilize.
    pub fn flush(&self) -> Result<()> {
        self.db.sync()
    }

    /// The count record's value, `NotFound` once it has decremented away.
    pub fn get_handle_info(&self, oid: &Oid) -> Result<i32> {
        let raw = encode_key(oid, KeyType::Count, b"")?;
        let value = self.db.get(&raw)?;
        decode_count(&value)
    }

    /// Iterate entries of one type under `oid`, resuming from `position`.
    /// Returns the entries and the position to pass next time; `END` when
    /// the scan is exhausted.
    pub fn iterate(
        &self,
        oid: &Oid,
        position: KvPosition,
        count: usize,
        flags: KeyvalFlags,
    ) -> Result<(Vec<(Vec<u8>, Vec<u8>)>, KvPosition)> {
        if count == 0 {
            return Err(Error::BadArg("iterate needs a positive count"));
        }
        if position == KvPosition::END {
            return Ok((Vec::new(), KvPosition::END));
        }
        let ktype = flags.key_type();
        debug!("keyval iterate: oid={oid} pos={:#x} count={count}", position.0);

        let mut cursor = self.db.cursor();
        let mut entries: Vec<(Vec<u8>, Vec<u8>)> = Vec::with_capacity(count);
        let mut ended = false;

        match self.position_cursor(&mut *cursor, oid, ktype, position)? {
            SeekResult::ConsumeCurrent(entry) => entries.push(entry),
            SeekResult::AfterCurrent => {}
            SeekResult::Exhausted => ended = true,
        }

        while !ended && entries.len() < count {
            match self.cursor_entry(&mut *cursor, oid, ktype, CursorOp::Next, b"") {
                Ok(entry) => entries.push(entry),
                Err(Error::NotFound) => ended = true,
                Err(other) => return Err(other),
            }
        }

        let next_pos = if ended {
            KvPosition::END
        } else {
            let next = if position == KvPosition::START {
                let session = self.readdir_session.fetch_add(1, Ordering::Relaxed);
                KvPosition(((session as u64) << 32) | (entries.len() as u64 - 1))
            } else {
                KvPosition(position.0 + entries.len() as u64)
            };
            if let Some((last_key, _)) = entries.last() {
                // best effort; a full pcache only slows the resume down
                let _ = self.pcache.insert(oid, next.0, last_key);
            }
            next
        };

        if flags.contains(KeyvalFlags::ITERATE_REMOVE) {
            for (key, _) in &entries {
                let raw = encode_key(oid, ktype, key)?;
                self.db.del(&raw)?;
                self.adjust_count(oid, CountAdjust::Decrement, flags)?;
            }
        }

        Ok((entries, next_pos))
    }

    /// [`KeyvalStore::iterate`], yielding keys only.
    pub fn iterate_keys(
        &self,
        oid: &Oid,
        position: KvPosition,
        count: usize,
        flags: KeyvalFlags,
    ) -> Result<(Vec<Vec<u8>>, KvPosition)> {
        let (entries, pos) = self.iterate(oid, position, count, flags)?;
        Ok((entries.into_iter().map(|(k, _)| k).collect(), pos))
    }

    /// Run `op` and post its result onto `queue` under a fresh job id.
    pub fn submit(&self, op: KeyvalOp, queue: &CompletionQueue<Result<KeyvalReply>>) -> JobId {
        let job = JobId::next();
        let result = self.service(op);
        if let Err(err) = &result {
            if !err.is_benign() {
                warn!("keyval {job} failed: {err}");
            }
        }
        queue.post(job, result);
        job
    }

    fn service(&self, op: KeyvalOp) -> Result<KeyvalReply> {
        match op {
            KeyvalOp::Read { oid, key, max_size, flags } => {
                let mut buf = vec![0u8; max_size];
                let n = self.read(&oid, &key, &mut buf, flags)?;
                buf.truncate(n);
                Ok(KeyvalReply::Value(buf))
            }
            KeyvalOp::Write { oid, key, value, flags } => {
                self.write(&oid, &key, &value, flags)?;
                Ok(KeyvalReply::Written)
            }
            KeyvalOp::Remove { oid, key, flags } => {
                self.remove(&oid, &key, None, flags)?;
                Ok(KeyvalReply::Removed)
            }
            KeyvalOp::Iterate { oid, position, count, flags } => {
                let (entries, position) = self.iterate(&oid, position, count, flags)?;
                Ok(KeyvalReply::Entries { entries, position })
            }
            KeyvalOp::IterateKeys { oid, position, count, flags } => {
                let (keys, position) = self.iterate_keys(&oid, position, count, flags)?;
                Ok(KeyvalReply::Keys { keys, position })
            }
            KeyvalOp::Flush => {
                self.flush()?;
                Ok(KeyvalReply::Flushed)
            }
            KeyvalOp::GetHandleInfo { oid } => Ok(KeyvalReply::HandleInfo(self.get_handle_info(&oid)?)),
        }
    }

    /// Seek to the first real entry of `(oid, ktype)`, skipping an
    /// empty-key record at the head of the stream.
    fn seek_first(
        &self,
        cursor: &mut dyn DbCursor,
        oid: &Oid,
        ktype: KeyType,
    ) -> Result<(Vec<u8>, Vec<u8>)> {
        let probe = encode_key(oid, ktype, b"")?;
        let (key, value) = self.cursor_entry(cursor, oid, ktype, CursorOp::SetRange, &probe)?;
        if key.is_empty() {
            return self.cursor_entry(cursor, oid, ktype, CursorOp::Next, b"");
        }
        Ok((key, value))
    }

    fn position_cursor(
        &self,
        cursor: &mut dyn DbCursor,
        oid: &Oid,
        ktype: KeyType,
        position: KvPosition,
    ) -> Result<SeekResult> {
        if position == KvPosition::START {
            return match self.seek_first(cursor, oid, ktype) {
                Ok(entry) => Ok(SeekResult::ConsumeCurrent(entry)),
                Err(Error::NotFound) => Ok(SeekResult::Exhausted),
                Err(other) => Err(other),
            };
        }

        if let Some(last_key) = self.pcache.lookup(oid, position.0) {
            let probe = encode_key(oid, ktype, &last_key)?;
            return match self.cursor_entry(cursor, oid, ktype, CursorOp::Set, &probe) {
                // cursor sits on the already-returned entry
                Ok(_) => Ok(SeekResult::AfterCurrent),
                Err(Error::NotFound) => {
                    // last entry was deleted in the interim; its successor
                    // has not been returned yet
                    match self.cursor_entry(cursor, oid, ktype, CursorOp::SetRange, &probe) {
                        Ok(entry) => Ok(SeekResult::ConsumeCurrent(entry)),
                        Err(Error::NotFound) => Ok(SeekResult::Exhausted),
                        Err(other) => Err(other),
                    }
                }
                Err(other) => Err(other),
            };
        }

        // cache miss (restart or eviction): step entry by entry
        debug!("keyval iterate: stepping to position {}", position.index());
        match self.seek_first(cursor, oid, ktype) {
            Ok(_) => {}
            Err(Error::NotFound) => return Ok(SeekResult::Exhausted),
            Err(other) => return Err(other),
        }
        for _ in 0..position.index() {
            match self.cursor_entry(cursor, oid, ktype, CursorOp::Next, b"") {
                Ok(_) => {}
                Err(Error::NotFound) => return Ok(SeekResult::Exhausted),
                Err(other) => return Err(other),
            }
        }
        Ok(SeekResult::AfterCurrent)
    }

    /// One validated cursor step: the record must still belong to
    /// `(oid, ktype)`, otherwise the stream is over.
    fn cursor_entry(
        &self,
        cursor: &mut dyn DbCursor,
        oid: &Oid,
        ktype: KeyType,
        op: CursorOp,
        probe: &[u8],
    ) -> Result<(Vec<u8>, Vec<u8>)> {
        let (raw_key, value) = cursor.step(op, probe)?;
        let (got_oid, got_type, user_key) = decode_key(&raw_key)?;
        if got_oid != *oid || got_type != ktype as u8 {
            return Err(Error::NotFound);
        }
        Ok((user_key.to_vec(), value))
    }

    fn adjust_count(&self, oid: &Oid, action: CountAdjust, flags: KeyvalFlags) -> Result<()> {
        if !flags.contains(KeyvalFlags::HANDLE_COUNT) {
            return Ok(());
        }
        let raw = encode_key(oid, KeyType::Count, b"")?;
        let mut count = match self.db.get(&raw) {
            Ok(value) => decode_count(&value)?,
            Err(Error::NotFound) => 0,
            Err(other) => return Err(other),
        };
        match action {
            CountAdjust::Increment => {
                count += 1;
                debug!("handle count: oid={oid} -> {count}");
            }
            CountAdjust::Decrement => {
                if count <= 0 {
                    warn!("handle count underflow on oid={oid}");
                    return Err(Error::Internal("handle count underflow"));
                }
                count -= 1;
                debug!("handle count: oid={oid} -> {count}");
                if count == 0 {
                    return self.db.del(&raw);
                }
            }
        }
        self.db.put(&raw, &count.to_le_bytes())
    }
}

enum SeekResult {
    /// Cursor sits on an entry the caller has not seen; yield it first.
    ConsumeCurrent((Vec<u8>, Vec<u8>)),
    /// Cursor sits on the last entry already returned; continue with next.
    AfterCurrent,
    /// Nothing (left) to scan.
    Exhausted,
}

fn copy_out(value: &[u8], buf: &mut [u8]) -> Result<usize> {
    if value.len() > buf.len() {
        return Err(Error::BufferTooSmall {
            required: value.len(),
        });
    }
    buf[..value.len()].copy_from_slice(value);
    Ok(value.len())
}

fn decode_count(value: &[u8]) -> Result<i32> {
    let bytes: [u8; 4] = value
        .try_into()
        .map_err(|_| Error::Corrupt("count record is not 4 bytes"))?;
    Ok(i32::from_le_bytes(bytes))
}

/// An operation for the submit path.
#[derive(Debug)]
pub enum KeyvalOp {
    /// Read one value, bounded by `max_size`.
    Read {
        /// Object to read under.
        oid: Oid,
        /// User key bytes.
        key: Vec<u8>,
        /// Largest acceptable value size.
        max_size: usize,
        /// Behavior flags.
        flags: KeyvalFlags,
    },
    /// Store one value.
    Write {
        /// Object to write under.
        oid: Oid,
        /// User key bytes.
        key: Vec<u8>,
        /// Value bytes.
        value: Vec<u8>,
        /// Behavior flags.
        flags: KeyvalFlags,
    },
    /// Delete one entry.
    Remove {
        /// Object to delete under.
        oid: Oid,
        /// User key bytes.
        key: Vec<u8>,
        /// Behavior flags.
        flags: KeyvalFlags,
    },
    /// Scan entries.
    Iterate {
        /// Object to scan.
        oid: Oid,
        /// Resume position.
        position: KvPosition,
        /// Most entries to return.
        count: usize,
        /// Behavior flags.
        flags: KeyvalFlags,
    },
    /// Scan keys only.
    IterateKeys {
        /// Object to scan.
        oid: Oid,
        /// Resume position.
        position: KvPosition,
        /// Most keys to return.
        count: usize,
        /// Behavior flags.
        flags: KeyvalFlags,
    },
    /// Stabilize the engine.
    Flush,
    /// Read the count record.
    GetHandleInfo {
        /// Object whose count is wanted.
        oid: Oid,
    },
}

/// Reply posted for a finished [`KeyvalOp`].
#[derive(Debug)]
pub enum KeyvalReply {
    /// Value read.
    Value(Vec<u8>),
    /// Write applied.
    Written,
    /// Entry removed.
    Removed,
    /// Entries scanned plus the resume position.
    Entries {
        /// `(key, value)` pairs in key order.
        entries: Vec<(Vec<u8>, Vec<u8>)>,
        /// Position for the next call.
        position: KvPosition,
    },
    /// Keys scanned plus the resume position.
    Keys {
        /// Keys in order.
        keys: Vec<Vec<u8>>,
        /// Position for the next call.
        position: KvPosition,
    },
    /// Flush finished.
    Flushed,
    /// Count record value.
    HandleInfo(i32),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemDb;

    fn store() -> KeyvalStore {
        KeyvalStore::new(Arc::new(MemDb::new()), FsId(9))
    }

    fn oid(n: u8) -> Oid {
        Oid([n; 16])
    }

    #[test]
    fn write_read_round_trip() {
        let kv = store();
        kv.write(&oid(1), b"owner", &[0xab], KeyvalFlags::empty()).unwrap();
        let mut buf = [0u8; 8];
        let n = kv.read(&oid(1), b"owner", &mut buf, KeyvalFlags::empty()).unwrap();
        assert_eq!(&buf[..n], &[0xab]);

        let mut empty: [u8; 0] = [];
        match kv.read(&oid(1), b"owner", &mut empty, KeyvalFlags::empty()) {
            Err(Error::BufferTooSmall { required }) => assert_eq!(required, 1),
            other => panic!("expected BufferTooSmall, got {other:?}"),
        }
    }

    #[test]
    fn no_overwrite_keeps_first_value() {
        let kv = store();
        kv.write(&oid(1), b"k", b"v1", KeyvalFlags::NO_OVERWRITE).unwrap();
        assert!(matches!(
            kv.write(&oid(1), b"k", b"v2", KeyvalFlags::NO_OVERWRITE),
            Err(Error::Exists)
        ));
        let mut buf = [0u8; 8];
        let n = kv.read(&oid(1), b"k", &mut buf, KeyvalFlags::empty()).unwrap();
        assert_eq!(&buf[..n], b"v1");
    }

    #[test]
    fn only_overwrite_requires_presence() {
        let kv = store();
        assert!(matches!(
            kv.write(&oid(1), b"k", b"v", KeyvalFlags::ONLY_OVERWRITE),
            Err(Error::NotFound)
        ));
        kv.write(&oid(1), b"k", b"v", KeyvalFlags::empty()).unwrap();
        kv.write(&oid(1), b"k", b"v2", KeyvalFlags::ONLY_OVERWRITE).unwrap();
    }

    #[test]
    fn handle_count_tracks_inserts_and_removes() {
        let kv = store();
        let fl = KeyvalFlags::NO_OVERWRITE | KeyvalFlags::HANDLE_COUNT;
        for key in [b"a".as_slice(), b"b", b"c"] {
            kv.write(&oid(1), key, b"v", fl).unwrap();
        }
        assert_eq!(kv.get_handle_info(&oid(1)).unwrap(), 3);

        kv.remove(&oid(1), b"a", None, KeyvalFlags::HANDLE_COUNT).unwrap();
        kv.remove(&oid(1), b"b", None, KeyvalFlags::HANDLE_COUNT).unwrap();
        assert_eq!(kv.get_handle_info(&oid(1)).unwrap(), 1);

        kv.remove(&oid(1), b"c", None, KeyvalFlags::HANDLE_COUNT).unwrap();
        assert!(matches!(kv.get_handle_info(&oid(1)), Err(Error::NotFound)));
    }

    #[test]
    fn failed_insert_does_not_bump_count() {
        let kv = store();
        let fl = KeyvalFlags::NO_OVERWRITE | KeyvalFlags::HANDLE_COUNT;
        kv.write(&oid(1), b"a", b"v", fl).unwrap();
        assert!(kv.write(&oid(1), b"a", b"v2", fl).is_err());
        assert_eq!(kv.get_handle_info(&oid(1)).unwrap(), 1);
    }

    #[test]
    fn remove_can_return_old_value() {
        let kv = store();
        kv.write(&oid(1), b"k", b"payload", KeyvalFlags::empty()).unwrap();
        let mut old = Vec::new();
        kv.remove(&oid(1), b"k", Some(&mut old), KeyvalFlags::empty()).unwrap();
        assert_eq!(old, b"payload");
        assert!(matches!(
            kv.remove(&oid(1), b"k", None, KeyvalFlags::empty()),
            Err(Error::NotFound)
        ));
    }

    #[test]
    fn iterate_yields_sorted_and_skips_count_record() {
        let kv = store();
        let fl = KeyvalFlags::NO_OVERWRITE | KeyvalFlags::HANDLE_COUNT;
        for key in [b"m".as_slice(), b"a", b"z", b"k"] {
            kv.write(&oid(1), key, b"v", fl).unwrap();
        }
        // different object's records must not bleed in
        kv.write(&oid(2), b"foreign", b"v", KeyvalFlags::empty()).unwrap();

        let (entries, pos) = kv
            .iterate(&oid(1), KvPosition::START, 16, KeyvalFlags::empty())
            .unwrap();
        let keys: Vec<&[u8]> = entries.iter().map(|(k, _)| k.as_slice()).collect();
        assert_eq!(keys, vec![b"a".as_slice(), b"k", b"m", b"z"]);
        assert!(!keys.iter().any(|k| k.is_empty()));
        assert_eq!(pos, KvPosition::END);
    }

    #[test]
    fn iterate_resumes_through_pcache() {
        let kv = store();
        for n in 0..10u8 {
            kv.write(&oid(1), &[b'a' + n], &[n], KeyvalFlags::empty()).unwrap();
        }
        let (first, pos1) = kv
            .iterate(&oid(1), KvPosition::START, 3, KeyvalFlags::empty())
            .unwrap();
        assert_eq!(first.len(), 3);
        assert_ne!(pos1, KvPosition::END);

        let (rest, pos2) = kv
            .iterate(&oid(1), pos1, 10, KeyvalFlags::empty())
            .unwrap();
        assert_eq!(rest.len(), 7);
        assert_eq!(rest[0].0, vec![b'd']);
        assert_eq!(pos2, KvPosition::END);
    }

    #[test]
    fn iterate_resumes_after_pcache_loss() {
        let kv = store();
        for n in 0..10u8 {
            kv.write(&oid(1), &[b'a' + n], &[n], KeyvalFlags::empty()).unwrap();
        }
        let (_, pos1) = kv
            .iterate(&oid(1), KvPosition::START, 3, KeyvalFlags::empty())
            .unwrap();
        // a restart clears the pcache but positions must keep working
        kv.pcache().clear();
        let (rest, _) = kv.iterate(&oid(1), pos1, 10, KeyvalFlags::empty()).unwrap();
        let keys: Vec<u8> = rest.iter().map(|(k, _)| k[0]).collect();
        assert_eq!(keys, (b'd'..=b'j').collect::<Vec<u8>>());
    }

    #[test]
    fn iterate_resumes_past_deleted_cursor_key() {
        let kv = store();
        for n in 0..6u8 {
            kv.write(&oid(1), &[b'a' + n], &[n], KeyvalFlags::empty()).unwrap();
        }
        let (_, pos1) = kv
            .iterate(&oid(1), KvPosition::START, 2, KeyvalFlags::empty())
            .unwrap();
        // delete the pcache'd cursor key ("b"); resume must continue at "c"
        kv.remove(&oid(1), b"b", None, KeyvalFlags::empty()).unwrap();
        let (rest, _) = kv.iterate(&oid(1), pos1, 10, KeyvalFlags::empty()).unwrap();
        let keys: Vec<u8> = rest.iter().map(|(k, _)| k[0]).collect();
        assert_eq!(keys, vec![b'c', b'd', b'e', b'f']);
    }

    #[test]
    fn iterate_remove_drains_and_decrements() {
        let kv = store();
        let fl = KeyvalFlags::NO_OVERWRITE | KeyvalFlags::HANDLE_COUNT;
        for key in [b"a".as_slice(), b"b", b"c"] {
            kv.write(&oid(1), key, b"v", fl).unwrap();
        }
        let (entries, _) = kv
            .iterate(
                &oid(1),
                KvPosition::START,
                2,
                KeyvalFlags::ITERATE_REMOVE | KeyvalFlags::HANDLE_COUNT,
            )
            .unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(kv.get_handle_info(&oid(1)).unwrap(), 1);

        let (rest, pos) = kv
            .iterate(
                &oid(1),
                KvPosition::START,
                10,
                KeyvalFlags::ITERATE_REMOVE | KeyvalFlags::HANDLE_COUNT,
            )
            .unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(pos, KvPosition::END);
        assert!(matches!(kv.get_handle_info(&oid(1)), Err(Error::NotFound)));
    }

    #[test]
    fn iterate_keys_matches_iterate() {
        let kv = store();
        for key in [b"x".as_slice(), b"y"] {
            kv.write(&oid(1), key, b"v", KeyvalFlags::empty()).unwrap();
        }
        let (keys, pos) = kv
            .iterate_keys(&oid(1), KvPosition::START, 10, KeyvalFlags::empty())
            .unwrap();
        assert_eq!(keys, vec![b"x".to_vec(), b"y".to_vec()]);
        assert_eq!(pos, KvPosition::END);
    }

    #[test]
    fn directory_entries_are_separate_from_attributes() {
        let kv = store();
        kv.write(&oid(1), b"name", b"attr", KeyvalFlags::empty()).unwrap();
        kv.write(&oid(1), b"name", b"dirent", KeyvalFlags::DIRECTORY_ENTRY).unwrap();

        let mut buf = [0u8; 16];
        let n = kv.read(&oid(1), b"name", &mut buf, KeyvalFlags::empty()).unwrap();
        assert_eq!(&buf[..n], b"attr");
        let n = kv
            .read(&oid(1), b"name", &mut buf, KeyvalFlags::DIRECTORY_ENTRY)
            .unwrap();
        assert_eq!(&buf[..n], b"dirent");

        let (entries, _) = kv
            .iterate(&oid(1), KvPosition::START, 10, KeyvalFlags::DIRECTORY_ENTRY)
            .unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].1, b"dirent");
    }

    #[test]
    fn submit_posts_completion() {
        let kv = store();
        let queue = CompletionQueue::new();
        kv.write(&oid(1), b"k", b"v", KeyvalFlags::empty()).unwrap();
        let job = kv.submit(
            KeyvalOp::Read {
                oid: oid(1),
                key: b"k".to_vec(),
                max_size: 64,
                flags: KeyvalFlags::empty(),
            },
            &queue,
        );
        let done = queue.try_collect().unwrap();
        assert_eq!(done.job, job);
        match done.result.unwrap() {
            KeyvalReply::Value(v) => assert_eq!(v, b"v"),
            other => panic!("unexpected reply {other:?}"),
        }
    }
}
