//! Byte-range lock manager.
//!
//! Arbitrates overlapping read/write access to object byte ranges. Each
//! object gets two interval trees (granted reads, granted writes), an
//! ordered map of fully granted requests, and a FIFO of partially granted
//! ones. Acquire grants as many bytes as current conflicts allow; releases
//! feed [`LockManager::progress`], which advances queued requests in arrival
//! order and wakes their callbacks.
//!
//! One mutex guards the whole table. The critical sections are short,
//! in-memory only, and never invoke callbacks: progress collects the
//! callbacks to fire and runs them after the lock is dropped, so they must
//! not reenter the manager.

mod distribution;
mod request;
mod table;

pub use distribution::{ByteContiguous, Distribution, SimpleStripe};
pub use request::{
    AcquireKind, Direction, Extent, FileReq, LockCallback, LockStatus, ProgressUpdate,
    RequestState,
};
pub use table::{AcquireOutcome, AcquireParams, ReviseMode, ReviseOutcome};

use parking_lot::Mutex;

use crate::error::Result;
use crate::types::{ObjectRef, ReqId};
use table::LockTable;

/// The byte-range lock manager. Cheap to share behind an `Arc`.
#[derive(Debug)]
pub struct LockManager {
    table: Mutex<LockTable>,
}

impl Default for LockManager {
    fn default() -> Self {
        LockManager::new()
    }
}

impl LockManager {
    /// Manager with an empty table.
    pub fn new() -> LockManager {
        LockManager {
            table: Mutex::new(LockTable::new()),
        }
    }

    /// Admit a new request or resume a queued one, granting every byte that
    /// does not conflict with already granted locks.
    pub fn acquire(&self, params: AcquireParams) -> Result<AcquireOutcome> {
        self.table.lock().acquire(params)
    }

    /// Release bytes held by a request: everything, or everything above an
    /// absolute logical offset. `ReleaseAll` is idempotent.
    pub fn revise(
        &self,
        refn: &ObjectRef,
        mode: ReviseMode,
        req_id: ReqId,
    ) -> Result<ReviseOutcome> {
        self.table.lock().revise(refn, mode, req_id)
    }

    /// Push every queued request on `refn` as far as its wait offset
    /// allows. Callbacks fire after the table lock is released.
    pub fn progress(&self, refn: &ObjectRef) {
        let fired = self.table.lock().progress(refn);
        for (callback, update) in fired {
            callback(update);
        }
    }

    /// Number of objects currently holding lock state.
    pub fn object_count(&self) -> usize {
        self.table.lock().object_count()
    }

    /// Granted intervals of one direction on `refn`, ascending. Diagnostic.
    pub fn locked_ranges(&self, refn: &ObjectRef, direction: Direction) -> Vec<(i64, i64, ReqId)> {
        self.table.lock().locked_ranges(refn, direction)
    }

    /// Status of a live request, `None` once it is torn down.
    pub fn request_status(&self, refn: &ObjectRef, id: ReqId) -> Option<LockStatus> {
        self.table.lock().request_status(refn, id)
    }
}
