//! Lock request state.
//!
//! A request describes the byte regions a client wants locked, as a list of
//! physical extents on this server. The manager consumes the description
//! lazily through [`RequestState`], which supports partial consumption of an
//! extent when only a prefix could be granted.

use std::fmt;
use std::sync::Arc;

use smallvec::SmallVec;

use crate::error::{Error, Result};
use crate::itree::NodeIx;
use crate::types::{ObjectRef, ReqId};

/// A contiguous physical byte range `(offset, length)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent {
    /// First physical byte.
    pub offset: i64,
    /// Length in bytes; always positive.
    pub len: i64,
}

impl Extent {
    /// Extent covering `len` bytes starting at `offset`.
    pub fn new(offset: i64, len: i64) -> Extent {
        Extent { offset, len }
    }
}

/// The region description a lock request is built from.
#[derive(Debug, Clone, Default)]
pub struct FileReq {
    extents: Vec<Extent>,
}

impl FileReq {
    /// Description from in-order physical extents. Rejects negative offsets,
    /// non-positive lengths, and out-of-order extents.
    pub fn new(extents: Vec<Extent>) -> Result<FileReq> {
        let mut prev_end = -1i64;
        for e in &extents {
            if e.offset < 0 || e.len <= 0 {
                return Err(Error::BadRange);
            }
            if e.offset <= prev_end {
                return Err(Error::BadArg("extents must be ascending and disjoint"));
            }
            prev_end = e.offset + e.len - 1;
        }
        Ok(FileReq { extents })
    }

    /// Single contiguous range.
    pub fn contiguous(offset: i64, len: i64) -> Result<FileReq> {
        FileReq::new(vec![Extent::new(offset, len)])
    }

    /// Total bytes described.
    pub fn total_bytes(&self) -> i64 {
        self.extents.iter().map(|e| e.len).sum()
    }
}

/// Progress cursor over a [`FileReq`], honoring a starting skip and an
/// aggregate byte bound.
#[derive(Debug, Clone)]
pub struct RequestState {
    extents: Vec<Extent>,
    seg: usize,
    seg_bytes_used: i64,
}

impl RequestState {
    /// Cursor over `req`, skipping the first `skip` bytes of the description
    /// and bounding consumption to `aggregate` bytes.
    pub fn new(req: &FileReq, skip: i64, aggregate: i64) -> Result<RequestState> {
        if skip < 0 || aggregate < 0 {
            return Err(Error::BadArg("negative request bounds"));
        }
        let mut extents = Vec::with_capacity(req.extents.len());
        let mut to_skip = skip;
        let mut budget = aggregate;
        for e in &req.extents {
            if budget == 0 {
                break;
            }
            let mut off = e.offset;
            let mut len = e.len;
            if to_skip >= len {
                to_skip -= len;
                continue;
            }
            off += to_skip;
            len -= to_skip;
            to_skip = 0;
            let take = len.min(budget);
            extents.push(Extent::new(off, take));
            budget -= take;
        }
        Ok(RequestState {
            extents,
            seg: 0,
            seg_bytes_used: 0,
        })
    }

    /// The unconsumed head piece as an inclusive `(start, end)` range.
    pub fn peek(&self) -> Option<(i64, i64)> {
        let e = self.extents.get(self.seg)?;
        let start = e.offset + self.seg_bytes_used;
        Some((start, e.offset + e.len - 1))
    }

    /// Consume `n` bytes from the head piece.
    pub fn consume(&mut self, n: i64) {
        let e = &self.extents[self.seg];
        self.seg_bytes_used += n;
        debug_assert!(self.seg_bytes_used <= e.len);
        if self.seg_bytes_used == e.len {
            self.seg += 1;
            self.seg_bytes_used = 0;
        }
    }

    /// True once every described byte has been consumed.
    pub fn done(&self) -> bool {
        self.seg >= self.extents.len()
    }
}

/// Direction of a lock request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Shared read lock.
    Read,
    /// Exclusive write lock.
    Write,
}

/// How an acquire call enters the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireKind {
    /// First call for a new request; returns immediately on partial grant.
    NewBlock,
    /// First call, never waits.
    NewNonblock,
    /// Resume an existing queued request; arms the wait offset so the
    /// callback fires when progress reaches it.
    ContinueBlock,
    /// Resume an existing queued request, never waits.
    ContinueNonblock,
}

impl AcquireKind {
    /// True for the `New*` variants.
    pub fn is_new(self) -> bool {
        matches!(self, AcquireKind::NewBlock | AcquireKind::NewNonblock)
    }
}

/// Grant progression of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockStatus {
    /// Created but not yet filed in either index.
    New,
    /// Partially granted; waiting in the queued list.
    Incomplete,
    /// Every requested byte is granted; filed in the granted map.
    AllGranted,
}

/// A byte range released by `ReleaseSome` that the owning request may
/// reclaim before consuming new extents.
#[derive(Debug, Clone, Copy)]
pub struct RemovedRange {
    /// First physical byte of the reservable range.
    pub start: i64,
    /// Last physical byte, inclusive.
    pub end: i64,
}

/// Progress report handed to a queued request's resumption callback.
#[derive(Debug, Clone, Copy)]
pub struct ProgressUpdate {
    /// The request this report is for.
    pub req_id: ReqId,
    /// Bytes granted by the progress pass.
    pub bytes_granted: i64,
    /// Highest absolute logical offset locked, -1 when nothing is held.
    pub last_locked: i64,
    /// Lowest absolute logical offset still unlocked, -1 when none remain.
    pub next_offset: i64,
    /// True when the whole request is granted.
    pub complete: bool,
}

/// Resumption callback for queued requests. Runs outside the manager lock
/// and must not call back into the manager.
pub type LockCallback = Arc<dyn Fn(ProgressUpdate) + Send + Sync>;

pub(crate) struct LockReq {
    pub(crate) id: ReqId,
    pub(crate) refn: ObjectRef,
    pub(crate) direction: Direction,
    pub(crate) status: LockStatus,
    pub(crate) state: RequestState,
    pub(crate) aggregate_size: i64,
    pub(crate) actual_locked_bytes: i64,
    /// Absolute logical offset progress must reach before the callback
    /// fires; -1 disarms background progress for this request.
    pub(crate) wait_offset: i64,
    /// Intervals granted to this request, ascending, as node indexes into
    /// the owning object's tree for `direction`.
    pub(crate) granted: Vec<NodeIx>,
    /// Ranges released by `ReleaseSome`, reclaimed back-to-front before new
    /// extents are consumed.
    pub(crate) removed: SmallVec<[RemovedRange; 4]>,
    /// Bytes granted by background progress since the caller last heard
    /// from us; delivered and reset when the callback fires.
    pub(crate) pending_bytes: i64,
    /// Set by `ReleaseSome`: background progress leaves the request alone
    /// until the owner resumes it with a `Continue*` acquire.
    pub(crate) suspended: bool,
    pub(crate) callback: Option<LockCallback>,
}

impl fmt::Debug for LockReq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockReq")
            .field("id", &self.id)
            .field("refn", &self.refn)
            .field("direction", &self.direction)
            .field("status", &self.status)
            .field("actual_locked_bytes", &self.actual_locked_bytes)
            .field("wait_offset", &self.wait_offset)
            .field("granted", &self.granted.len())
            .field("removed", &self.removed.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_bad_descriptions() {
        assert!(FileReq::new(vec![Extent::new(-1, 10)]).is_err());
        assert!(FileReq::new(vec![Extent::new(0, 0)]).is_err());
        assert!(FileReq::new(vec![Extent::new(100, 10), Extent::new(50, 10)]).is_err());
    }

    #[test]
    fn state_walks_extents() {
        let req = FileReq::new(vec![Extent::new(0, 100), Extent::new(200, 50)]).unwrap();
        let mut st = RequestState::new(&req, 0, 150).unwrap();
        assert_eq!(st.peek(), Some((0, 99)));
        st.consume(40);
        assert_eq!(st.peek(), Some((40, 99)));
        st.consume(60);
        assert_eq!(st.peek(), Some((200, 249)));
        st.consume(50);
        assert!(st.done());
    }

    #[test]
    fn skip_and_aggregate_bound_the_stream() {
        let req = FileReq::new(vec![Extent::new(0, 100), Extent::new(200, 100)]).unwrap();
        // skip the first 80 bytes, then take only 60
        let mut st = RequestState::new(&req, 80, 60).unwrap();
        assert_eq!(st.peek(), Some((80, 99)));
        st.consume(20);
        assert_eq!(st.peek(), Some((200, 239)));
        st.consume(40);
        assert!(st.done());
    }
}
