//! Job ids and the completion queue surface.
//!
//! Subsystems that answer asynchronously allocate a [`JobId`] per operation
//! and post the finished result onto a caller-supplied [`CompletionQueue`].
//! The queue is deliberately dumb: it stores results and wakes waiters, and
//! interprets nothing.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Condvar, Mutex};

/// Identifier handed back when an operation is submitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JobId(pub u64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "job-{}", self.0)
    }
}

static NEXT_JOB_ID: AtomicU64 = AtomicU64::new(1);

impl JobId {
    /// Allocate a fresh process-unique id.
    pub fn next() -> JobId {
        JobId(NEXT_JOB_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// A finished operation waiting to be collected.
#[derive(Debug)]
pub struct Completion<T> {
    /// The id returned at submit time.
    pub job: JobId,
    /// Operation outcome.
    pub result: T,
}

/// Multi-producer completion queue with blocking collection.
#[derive(Debug, Default)]
pub struct CompletionQueue<T> {
    queue: Mutex<VecDeque<Completion<T>>>,
    ready: Condvar,
}

impl<T> CompletionQueue<T> {
    /// Empty queue.
    pub fn new() -> CompletionQueue<T> {
        CompletionQueue {
            queue: Mutex::new(VecDeque::new()),
            ready: Condvar::new(),
        }
    }

    /// Post a finished operation and wake one waiter.
    pub fn post(&self, job: JobId, result: T) {
        self.queue.lock().push_back(Completion { job, result });
        self.ready.notify_one();
    }

    /// Take the oldest completion without blocking.
    pub fn try_collect(&self) -> Option<Completion<T>> {
        self.queue.lock().pop_front()
    }

    /// Block until a completion is available and take it.
    pub fn collect(&self) -> Completion<T> {
        let mut queue = self.queue.lock();
        loop {
            if let Some(done) = queue.pop_front() {
                return done;
            }
            self.ready.wait(&mut queue);
        }
    }

    /// Number of uncollected completions.
    pub fn pending(&self) -> usize {
        self.queue.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn post_and_collect() {
        let q: CompletionQueue<u32> = CompletionQueue::new();
        assert!(q.try_collect().is_none());
        let id = JobId::next();
        q.post(id, 7);
        let done = q.try_collect().unwrap();
        assert_eq!(done.job, id);
        assert_eq!(done.result, 7);
    }

    #[test]
    fn collect_blocks_until_posted() {
        let q = Arc::new(CompletionQueue::<&'static str>::new());
        let q2 = Arc::clone(&q);
        let id = JobId::next();
        let handle = std::thread::spawn(move || q2.collect());
        q.post(id, "done");
        let got = handle.join().expect("collector thread");
        assert_eq!(got.job, id);
        assert_eq!(got.result, "done");
    }

    #[test]
    fn ids_are_unique() {
        let a = JobId::next();
        let b = JobId::next();
        assert_ne!(a, b);
    }
}
