//! In-memory ordered engine.
//!
//! A `BTreeMap` under a mutex, with cursors that remember their last key and
//! re-seek on every step. Re-seeking keeps cursors valid across interleaved
//! writes without borrowing the tree, which is all the layered stores need.

use std::collections::BTreeMap;
use std::ops::Bound;

use parking_lot::Mutex;

use super::{CursorOp, Dbase, DbCursor};
use crate::error::{Error, Result};

/// Heap-backed [`Dbase`] implementation.
#[derive(Debug, Default)]
pub struct MemDb {
    map: Mutex<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemDb {
    /// Fresh empty database.
    pub fn new() -> MemDb {
        MemDb::default()
    }
}

impl Dbase for MemDb {
    fn get(&self, key: &[u8]) -> Result<Vec<u8>> {
        self.map.lock().get(key).cloned().ok_or(Error::NotFound)
    }

    fn put(&self, key: &[u8], val: &[u8]) -> Result<()> {
        self.map.lock().insert(key.to_vec(), val.to_vec());
        Ok(())
    }

    fn put_once(&self, key: &[u8], val: &[u8]) -> Result<()> {
        let mut map = self.map.lock();
        if map.contains_key(key) {
            return Err(Error::Exists);
        }
        map.insert(key.to_vec(), val.to_vec());
        Ok(())
    }

    fn del(&self, key: &[u8]) -> Result<()> {
        self.map.lock().remove(key).map(|_| ()).ok_or(Error::NotFound)
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }

    fn cursor(&self) -> Box<dyn DbCursor + '_> {
        Box::new(MemCursor {
            db: self,
            position: None,
        })
    }

    fn record_count(&self) -> usize {
        self.map.lock().len()
    }
}

struct MemCursor<'a> {
    db: &'a MemDb,
    position: Option<Vec<u8>>,
}

impl DbCursor for MemCursor<'_> {
    fn step(&mut self, op: CursorOp, probe: &[u8]) -> Result<(Vec<u8>, Vec<u8>)> {
        let map = self.db.map.lock();
        let found = match op {
            CursorOp::First => map.iter().next(),
            CursorOp::Next => {
                let pos = self.position.as_ref().ok_or(Error::BadArg("cursor not positioned"))?;
                map.range::<[u8], _>((Bound::Excluded(pos.as_slice()), Bound::Unbounded))
                    .next()
            }
            CursorOp::Set => map.get_key_value(probe),
            CursorOp::SetRange => map
                .range::<[u8], _>((Bound::Included(probe), Bound::Unbounded))
                .next(),
            CursorOp::Current => {
                let pos = self.position.as_ref().ok_or(Error::BadArg("cursor not positioned"))?;
                // the record may have been deleted since the last step
                map.get_key_value(pos.as_slice())
            }
        };
        match found {
            Some((k, v)) => {
                let out = (k.clone(), v.clone());
                drop(map);
                self.position = Some(out.0.clone());
                Ok(out)
            }
            None => Err(Error::NotFound),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_get_del() {
        let db = MemDb::new();
        db.put(b"alpha", b"1").unwrap();
        db.put(b"beta", b"2").unwrap();
        assert_eq!(db.get(b"alpha").unwrap(), b"1");
        assert!(matches!(db.get(b"gamma"), Err(Error::NotFound)));

        db.put(b"alpha", b"3").unwrap();
        assert_eq!(db.get(b"alpha").unwrap(), b"3");

        db.del(b"alpha").unwrap();
        assert!(matches!(db.del(b"alpha"), Err(Error::NotFound)));
        assert_eq!(db.record_count(), 1);
    }

    #[test]
    fn put_once_rejects_duplicates() {
        let db = MemDb::new();
        db.put_once(b"k", b"v1").unwrap();
        assert!(matches!(db.put_once(b"k", b"v2"), Err(Error::Exists)));
        assert_eq!(db.get(b"k").unwrap(), b"v1");
    }

    #[test]
    fn cursor_walks_in_order() {
        let db = MemDb::new();
        for k in ["b", "d", "a", "c"] {
            db.put(k.as_bytes(), k.as_bytes()).unwrap();
        }
        let mut cur = db.cursor();
        let mut keys = Vec::new();
        let (k, _) = cur.step(CursorOp::First, b"").unwrap();
        keys.push(k);
        while let Ok((k, _)) = cur.step(CursorOp::Next, b"") {
            keys.push(k);
        }
        assert_eq!(keys, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec(), b"d".to_vec()]);
    }

    #[test]
    fn set_range_seeks_least_upper() {
        let db = MemDb::new();
        db.put(b"aa", b"1").unwrap();
        db.put(b"cc", b"2").unwrap();
        let mut cur = db.cursor();
        let (k, _) = cur.step(CursorOp::SetRange, b"bb").unwrap();
        assert_eq!(k, b"cc");
        assert!(matches!(cur.step(CursorOp::Set, b"bb"), Err(Error::NotFound)));
        let (k, _) = cur.step(CursorOp::Set, b"aa").unwrap();
        assert_eq!(k, b"aa");
    }

    #[test]
    fn cursor_survives_interleaved_delete() {
        let db = MemDb::new();
        for k in ["a", "b", "c"] {
            db.put(k.as_bytes(), b"x").unwrap();
        }
        let mut cur = db.cursor();
        cur.step(CursorOp::Set, b"b").unwrap();
        db.del(b"b").unwrap();
        // current record is gone; next still advances past it
        assert!(matches!(cur.step(CursorOp::Current, b""), Err(Error::NotFound)));
        let (k, _) = cur.step(CursorOp::Next, b"").unwrap();
        assert_eq!(k, b"c");
    }
}
