//! Lock table internals: per-object state, request pools, and the grant
//! engine.
//!
//! Everything in this module runs under the manager's table mutex. Objects
//! and requests live in pools and reference each other by index only, so no
//! structure here ever dangles when a neighbor is removed.

use std::collections::VecDeque;
use std::sync::Arc;

use log::{debug, warn};
use smallvec::SmallVec;

use super::distribution::Distribution;
use super::request::{
    AcquireKind, Direction, FileReq, LockCallback, LockReq, LockStatus, ProgressUpdate,
    RemovedRange, RequestState,
};
use crate::chains::ChainTable;
use crate::error::{Error, Result};
use crate::itree::IntervalTree;
use crate::rbmap::RbMap;
use crate::types::{ObjectRef, ReqId};

const TABLE_BUCKETS: usize = 61;

/// Arguments to an acquire call.
pub struct AcquireParams {
    /// Object the locks are against.
    pub refn: ObjectRef,
    /// Read or write.
    pub direction: Direction,
    /// New or continuing, blocking or not.
    pub kind: AcquireKind,
    /// Required for `Continue*`: the id returned by the first call.
    pub client_req_id: Option<ReqId>,
    /// Offset distribution for the object; consulted on first contact only.
    pub dist: Arc<dyn Distribution>,
    /// Region description. Ignored for `Continue*`.
    pub file_req: FileReq,
    /// Bytes of the description to skip before the first wanted byte.
    pub file_req_offset: i64,
    /// Absolute logical offset the caller wants granted up to (exclusive).
    pub final_offset: i64,
    /// Total bytes the whole request will lock.
    pub aggregate_size: i64,
    /// Resumption callback for queued progress.
    pub callback: Option<LockCallback>,
}

impl std::fmt::Debug for AcquireParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AcquireParams")
            .field("refn", &self.refn)
            .field("direction", &self.direction)
            .field("kind", &self.kind)
            .field("client_req_id", &self.client_req_id)
            .field("final_offset", &self.final_offset)
            .field("aggregate_size", &self.aggregate_size)
            .finish()
    }
}

/// Result of an acquire call.
#[derive(Debug, Clone, Copy)]
pub struct AcquireOutcome {
    /// Id naming this request in later `Continue*`/`revise` calls.
    pub lock_id: ReqId,
    /// Lowest absolute logical offset not granted; -1 when none remain.
    pub next_offset: i64,
    /// Highest absolute logical offset granted; -1 when nothing is held.
    pub last_locked: i64,
    /// Bytes granted by this call.
    pub bytes_granted: i64,
    /// True when every requested byte is locked.
    pub complete: bool,
    /// True when the request stays queued with its wait offset armed; the
    /// callback will report further progress.
    pub waiting: bool,
}

/// How revise releases bytes.
#[derive(Debug, Clone, Copy)]
pub enum ReviseMode {
    /// Release every byte above the given absolute logical offset into the
    /// request's reclaimable list.
    ReleaseSome(i64),
    /// Tear the request down entirely.
    ReleaseAll,
}

/// Result of a revise call.
#[derive(Debug, Clone, Copy)]
pub struct ReviseOutcome {
    /// Bytes released.
    pub released_bytes: i64,
    /// Lowest absolute logical offset now unlocked for the request; -1
    /// after `ReleaseAll` or when the request has nothing left to lock.
    pub next_offset: i64,
    /// Highest absolute logical offset still locked; -1 when none.
    pub last_locked: i64,
    /// True when the revision applied fully.
    pub complete: bool,
}

#[derive(Debug)]
struct ObjectLockState {
    refn: ObjectRef,
    dist: Arc<dyn Distribution>,
    write_tree: IntervalTree,
    read_tree: IntervalTree,
    /// Fully granted requests by id.
    granted: RbMap,
    /// Partially granted requests, arrival order.
    queued: VecDeque<u32>,
    /// Every live request, arrival order.
    all: Vec<u32>,
}

#[derive(Debug)]
struct Pool<T> {
    slots: Vec<Option<T>>,
    free: Vec<u32>,
}

impl<T> Pool<T> {
    fn new() -> Pool<T> {
        Pool {
            slots: Vec::new(),
            free: Vec::new(),
        }
    }

    fn insert(&mut self, item: T) -> u32 {
        if let Some(ix) = self.free.pop() {
            self.slots[ix as usize] = Some(item);
            ix
        } else {
            self.slots.push(Some(item));
            (self.slots.len() - 1) as u32
        }
    }

    fn get(&self, ix: u32) -> &T {
        self.slots[ix as usize].as_ref().expect("stale pool index")
    }

    fn get_mut(&mut self, ix: u32) -> &mut T {
        self.slots[ix as usize].as_mut().expect("stale pool index")
    }

    fn remove(&mut self, ix: u32) -> T {
        let item = self.slots[ix as usize].take().expect("stale pool index");
        self.free.push(ix);
        item
    }
}

enum AddOutcome {
    Complete,
    Partial,
}

struct AddProgress {
    last_locked: i64,
    next_offset: i64,
    bytes: i64,
}

/// The table proper. One instance per manager, always behind its mutex.
#[derive(Debug)]
pub(crate) struct LockTable {
    objects: Pool<ObjectLockState>,
    requests: Pool<LockReq>,
    index: ChainTable<(ObjectRef, u32)>,
    next_req_id: u64,
}

impl LockTable {
    pub(crate) fn new() -> LockTable {
        LockTable {
            objects: Pool::new(),
            requests: Pool::new(),
            index: ChainTable::new(TABLE_BUCKETS),
            next_req_id: 0,
        }
    }

    fn bucket(refn: &ObjectRef) -> usize {
        refn.bucket_hash() as usize
    }

    fn find_object(&self, refn: &ObjectRef) -> Option<u32> {
        self.index
            .search(Self::bucket(refn), |(r, _)| r == refn)
            .map(|&(_, ix)| ix)
    }

    fn find_or_create_object(&mut self, refn: ObjectRef, dist: &Arc<dyn Distribution>) -> u32 {
        if let Some(ix) = self.find_object(&refn) {
            return ix;
        }
        let ix = self.objects.insert(ObjectLockState {
            refn,
            dist: Arc::clone(dist),
            write_tree: IntervalTree::new(),
            read_tree: IntervalTree::new(),
            granted: RbMap::new(),
            queued: VecDeque::new(),
            all: Vec::new(),
        });
        self.index.insert_head(Self::bucket(&refn), (refn, ix));
        debug!("lock table: created state for {refn}");
        ix
    }

    fn destroy_object_if_idle(&mut self, oix: u32) {
        if !self.objects.get(oix).all.is_empty() {
            return;
        }
        let refn = self.objects.get(oix).refn;
        self.index
            .search_remove(Self::bucket(&refn), |(r, _)| *r == refn);
        self.objects.remove(oix);
        debug!("lock table: no requests left on {refn}, state removed");
    }

    /// Number of live per-object states.
    pub(crate) fn object_count(&self) -> usize {
        self.index.len()
    }

    /// Granted intervals of one tree, ascending, for diagnostics and tests.
    pub(crate) fn locked_ranges(
        &self,
        refn: &ObjectRef,
        direction: Direction,
    ) -> Vec<(i64, i64, ReqId)> {
        let Some(oix) = self.find_object(refn) else {
            return Vec::new();
        };
        let obj = self.objects.get(oix);
        let tree = match direction {
            Direction::Write => &obj.write_tree,
            Direction::Read => &obj.read_tree,
        };
        tree.inorder()
            .into_iter()
            .map(|ix| (tree.start(ix), tree.end(ix), tree.owner(ix)))
            .collect()
    }

    /// Current status of a request, if it is still live.
    pub(crate) fn request_status(&self, refn: &ObjectRef, id: ReqId) -> Option<LockStatus> {
        let oix = self.find_object(refn)?;
        let obj = self.objects.get(oix);
        obj.all
            .iter()
            .find(|&&rix| self.requests.get(rix).id == id)
            .map(|&rix| self.requests.get(rix).status)
    }

    pub(crate) fn acquire(&mut self, params: AcquireParams) -> Result<AcquireOutcome> {
        let oix = self.find_or_create_object(params.refn, &params.dist);

        let rix = if params.kind.is_new() {
            let state = RequestState::new(
                &params.file_req,
                params.file_req_offset,
                params.aggregate_size,
            )?;
            let id = ReqId(self.next_req_id);
            self.next_req_id += 1;
            let rix = self.requests.insert(LockReq {
                id,
                refn: params.refn,
                direction: params.direction,
                status: LockStatus::New,
                state,
                aggregate_size: params.aggregate_size,
                actual_locked_bytes: 0,
                wait_offset: -1,
                granted: Vec::new(),
                removed: SmallVec::new(),
                pending_bytes: 0,
                suspended: false,
                callback: params.callback,
            });
            self.objects.get_mut(oix).all.push(rix);
            debug!(
                "acquire: new {:?} request id={id} on {} ({} aggregate bytes)",
                params.direction, params.refn, params.aggregate_size
            );
            rix
        } else {
            let id = params.client_req_id.ok_or(Error::BadArg("continue without request id"))?;
            let obj = self.objects.get(oix);
            let rix = obj
                .queued
                .iter()
                .copied()
                .find(|&rix| self.requests.get(rix).id == id)
                .ok_or(Error::NotFound)?;
            let req = self.requests.get_mut(rix);
            req.suspended = false;
            if params.callback.is_some() {
                req.callback = params.callback;
            }
            rix
        };

        let (outcome, progress) = {
            let obj = self.objects.get_mut(oix);
            let req = self.requests.get_mut(rix);
            add_locks(req, obj, params.final_offset)?
        };

        let req = self.requests.get_mut(rix);
        let lock_id = req.id;
        let mut out = AcquireOutcome {
            lock_id,
            next_offset: progress.next_offset,
            last_locked: progress.last_locked,
            bytes_granted: progress.bytes,
            complete: false,
            waiting: false,
        };

        match outcome {
            AddOutcome::Complete => {
                let was_queued = req.status == LockStatus::Incomplete;
                req.status = LockStatus::AllGranted;
                req.wait_offset = -1;
                let obj = self.objects.get_mut(oix);
                if was_queued {
                    obj.queued.retain(|&r| r != rix);
                }
                obj.granted.insert(lock_id.0, rix);
                out.complete = true;
                debug!(
                    "acquire: all {} aggregate bytes granted to id={lock_id}",
                    params.aggregate_size
                );
            }
            AddOutcome::Partial => {
                if req.status == LockStatus::New {
                    req.status = LockStatus::Incomplete;
                    self.objects.get_mut(oix).queued.push_back(rix);
                    debug!("acquire: id={lock_id} queued");
                }
                let req = self.requests.get_mut(rix);
                if params.kind == AcquireKind::ContinueBlock
                    && progress.next_offset < params.final_offset
                {
                    req.wait_offset = params.final_offset;
                    // bytes granted so far ride along in the eventual report
                    req.pending_bytes = progress.bytes;
                    out.waiting = true;
                    debug!(
                        "acquire: id={lock_id} waiting until offset {}",
                        params.final_offset
                    );
                } else {
                    req.wait_offset = -1;
                    debug!(
                        "acquire: id={lock_id} returning at next offset {} ({} of {} bytes held)",
                        progress.next_offset, req.actual_locked_bytes, req.aggregate_size
                    );
                }
            }
        }
        Ok(out)
    }

    pub(crate) fn revise(
        &mut self,
        refn: &ObjectRef,
        mode: ReviseMode,
        req_id: ReqId,
    ) -> Result<ReviseOutcome> {
        let Some(oix) = self.find_object(refn) else {
            return match mode {
                // cancellation is idempotent
                ReviseMode::ReleaseAll => Ok(ReviseOutcome {
                    released_bytes: 0,
                    next_offset: -1,
                    last_locked: -1,
                    complete: true,
                }),
                ReviseMode::ReleaseSome(_) => Err(Error::NotFound),
            };
        };

        let obj = self.objects.get(oix);
        let found = obj
            .granted
            .get(req_id.0)
            .or_else(|| {
                obj.queued
                    .iter()
                    .copied()
                    .find(|&rix| self.requests.get(rix).id == req_id)
            });
        let Some(rix) = found else {
            return match mode {
                ReviseMode::ReleaseAll => Ok(ReviseOutcome {
                    released_bytes: 0,
                    next_offset: -1,
                    last_locked: -1,
                    complete: true,
                }),
                ReviseMode::ReleaseSome(_) => Err(Error::NotFound),
            };
        };

        match mode {
            ReviseMode::ReleaseAll => self.release_all(oix, rix),
            ReviseMode::ReleaseSome(final_offset) => self.release_some(oix, rix, final_offset),
        }
    }

    fn release_all(&mut self, oix: u32, rix: u32) -> Result<ReviseOutcome> {
        let obj = self.objects.get_mut(oix);
        let req = self.requests.get_mut(rix);
        let tree = match req.direction {
            Direction::Write => &mut obj.write_tree,
            Direction::Read => &mut obj.read_tree,
        };
        let mut released = 0i64;
        for &ix in &req.granted {
            released += tree.end(ix) - tree.start(ix) + 1;
            tree.remove(ix);
        }
        req.granted.clear();
        debug!("revise: released all {released} bytes of id={}", req.id);

        match req.status {
            LockStatus::Incomplete => {
                obj.queued.retain(|&r| r != rix);
            }
            LockStatus::AllGranted => {
                obj.granted.remove(req.id.0);
            }
            LockStatus::New => {}
        }
        obj.all.retain(|&r| r != rix);
        self.requests.remove(rix);
        self.destroy_object_if_idle(oix);

        Ok(ReviseOutcome {
            released_bytes: released,
            next_offset: -1,
            last_locked: -1,
            complete: true,
        })
    }

    fn release_some(&mut self, oix: u32, rix: u32, final_offset: i64) -> Result<ReviseOutcome> {
        let obj = self.objects.get_mut(oix);
        let req = self.requests.get_mut(rix);
        let dist = Arc::clone(&obj.dist);
        let tree = match req.direction {
            Direction::Write => &mut obj.write_tree,
            Direction::Read => &mut obj.read_tree,
        };
        let final_phys = dist.logical_to_physical(final_offset);
        let mut released = 0i64;

        while let Some(&ix) = req.granted.last() {
            let (start, end) = (tree.start(ix), tree.end(ix));
            if final_phys > end {
                break;
            }
            if final_phys > start {
                // split: keep the prefix, park the suffix for reclaim
                req.removed.push(RemovedRange {
                    start: final_phys,
                    end,
                });
                released += end - final_phys + 1;
                tree.trim_end(ix, final_phys - 1);
                debug!(
                    "revise: id={} trimmed ({start},{end}) to ({start},{})",
                    req.id,
                    final_phys - 1
                );
                break;
            }
            req.removed.push(RemovedRange { start, end });
            released += end - start + 1;
            tree.remove(ix);
            req.granted.pop();
            debug!("revise: id={} released ({start},{end})", req.id);
        }

        req.actual_locked_bytes -= released;
        req.wait_offset = -1;
        req.suspended = true;
        if released == 0 {
            warn!("revise: zero bytes released for id={}", req.id);
        }

        if req.status == LockStatus::AllGranted {
            obj.granted.remove(req.id.0);
            req.status = LockStatus::Incomplete;
            // requeue where arrival order puts it: before the first queued
            // request that arrived after this one
            let my_pos = obj.all.iter().position(|&r| r == rix);
            let successor = my_pos.and_then(|pos| {
                obj.all[pos + 1..]
                    .iter()
                    .copied()
                    .find(|r| obj.queued.contains(r))
            });
            match successor.and_then(|succ| obj.queued.iter().position(|&q| q == succ)) {
                Some(qpos) => obj.queued.insert(qpos, rix),
                None => obj.queued.push_back(rix),
            }
            debug!("revise: id={} moved back to the queued list", req.id);
        }

        let last_locked = req
            .granted
            .last()
            .map(|&ix| dist.physical_to_logical(tree.end(ix)))
            .unwrap_or(-1);
        let next_offset = if let Some(r) = req.removed.last() {
            dist.physical_to_logical(r.start)
        } else if let Some((s, _)) = req.state.peek() {
            dist.physical_to_logical(s)
        } else {
            -1
        };

        Ok(ReviseOutcome {
            released_bytes: released,
            next_offset,
            last_locked,
            complete: true,
        })
    }

    /// Advance every queued request on `refn` toward its wait offset.
    /// Returns the callbacks to fire once the table lock is dropped.
    pub(crate) fn progress(
        &mut self,
        refn: &ObjectRef,
    ) -> Vec<(LockCallback, ProgressUpdate)> {
        let mut fired = Vec::new();
        let Some(oix) = self.find_object(refn) else {
            return fired;
        };

        let queued: Vec<u32> = self.objects.get(oix).queued.iter().copied().collect();
        for rix in queued {
            if self.requests.get(rix).suspended {
                continue;
            }
            // an unarmed request still advances, but only completion wakes it
            let wait = self.requests.get(rix).wait_offset;
            let target = if wait >= 0 { wait } else { i64::MAX };
            let result = {
                let obj = self.objects.get_mut(oix);
                let req = self.requests.get_mut(rix);
                add_locks(req, obj, target)
            };
            if wait < 0 {
                self.requests.get_mut(rix).wait_offset = -1;
            }
            let (outcome, progress) = match result {
                Ok(v) => v,
                Err(err) => {
                    // attach the failure to this request and keep scanning
                    warn!(
                        "progress: request id={} failed: {err}",
                        self.requests.get(rix).id
                    );
                    continue;
                }
            };

            let req = self.requests.get_mut(rix);
            let id = req.id;
            req.pending_bytes += progress.bytes;
            match outcome {
                AddOutcome::Complete => {
                    req.status = LockStatus::AllGranted;
                    req.wait_offset = -1;
                    let update = ProgressUpdate {
                        req_id: id,
                        bytes_granted: std::mem::take(&mut req.pending_bytes),
                        last_locked: progress.last_locked,
                        next_offset: -1,
                        complete: true,
                    };
                    let cb = req.callback.clone();
                    let obj = self.objects.get_mut(oix);
                    obj.queued.retain(|&r| r != rix);
                    obj.granted.insert(id.0, rix);
                    debug!("progress: id={id} fully granted");
                    if let Some(cb) = cb {
                        fired.push((cb, update));
                    }
                }
                AddOutcome::Partial => {
                    if wait >= 0 && progress.next_offset > wait {
                        // went as far as the caller asked; hand it back
                        req.wait_offset = -1;
                        let update = ProgressUpdate {
                            req_id: id,
                            bytes_granted: std::mem::take(&mut req.pending_bytes),
                            last_locked: progress.last_locked,
                            next_offset: progress.next_offset,
                            complete: false,
                        };
                        debug!(
                            "progress: id={id} advanced past wait offset {wait}, waking caller"
                        );
                        if let Some(cb) = req.callback.clone() {
                            fired.push((cb, update));
                        }
                    }
                }
            }
        }
        fired
    }
}

/// Grant as much of `req` as fits below `final_abs`, reclaiming released
/// ranges before consuming fresh extents.
fn add_locks(
    req: &mut LockReq,
    obj: &mut ObjectLockState,
    final_abs: i64,
) -> Result<(AddOutcome, AddProgress)> {
    let ObjectLockState {
        dist,
        write_tree,
        read_tree,
        ..
    } = obj;

    req.wait_offset = final_abs;
    let mut bytes = 0i64;
    let mut next_offset = -1i64;

    let outcome = loop {
        let (start, orig_end, from_removed) = match req.removed.last() {
            Some(r) => (r.start, r.end, true),
            None => match req.state.peek() {
                Some((s, e)) => (s, e, false),
                None => break AddOutcome::Complete,
            },
        };
        let mut end = orig_end;

        let abs = dist.physical_to_logical(start);
        if abs >= final_abs {
            next_offset = abs;
            break AddOutcome::Partial;
        }
        if final_abs < abs + (end - start + 1) {
            end = start + (final_abs - abs - 1);
        }

        // writers already in the tree block everyone
        if let Some(c) = write_tree.overlap_search(start, end) {
            if write_tree.start(c) > start && write_tree.clear_below(c, start) {
                end = write_tree.start(c) - 1;
            } else {
                next_offset = abs;
                break AddOutcome::Partial;
            }
        }
        // writers additionally yield to granted readers
        if req.direction == Direction::Write {
            if let Some(c) = read_tree.overlap_search(start, end) {
                if read_tree.start(c) > start && read_tree.clear_below(c, start) {
                    end = read_tree.start(c) - 1;
                } else {
                    next_offset = abs;
                    break AddOutcome::Partial;
                }
            }
        }

        let tree = match req.direction {
            Direction::Write => &mut *write_tree,
            Direction::Read => &mut *read_tree,
        };
        let ix = tree.insert(start, end, req.id)?;
        req.granted.push(ix);
        let granted_len = end - start + 1;
        debug!(
            "add_locks: id={} granted ({start},{end}) {:?}",
            req.id, req.direction
        );

        if from_removed {
            let r = req.removed.last_mut().ok_or(Error::Internal("removed list emptied"))?;
            if r.end == end {
                req.removed.pop();
            } else {
                r.start = end + 1;
            }
        } else {
            req.state.consume(granted_len);
        }
        bytes += granted_len;
    };

    req.actual_locked_bytes += bytes;

    let tree = match req.direction {
        Direction::Write => &*write_tree,
        Direction::Read => &*read_tree,
    };
    let last_locked = req
        .granted
        .last()
        .map(|&ix| dist.physical_to_logical(tree.end(ix)))
        .unwrap_or(-1);

    Ok((
        outcome,
        AddProgress {
            last_locked,
            next_offset,
            bytes,
        },
    ))
}
