//! Concurrency-limiting semaphores attachable to tasks.
//!
//! Acquisition is non-blocking: when a task's semaphore has no capacity the
//! task is parked on the semaphore's waiter list and the worker moves on to
//! other work. A release re-enqueues every parked task; each re-attempts its
//! full acquire list, so multi-semaphore tasks must acquire in a consistent
//! global order (insertion order of `Task::acquire` calls) to avoid
//! livelocking each other.

use crate::builder::Task;
use crate::executor::Job;
use crate::topology::RunCtx;
use derive_more::Debug;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Default)]
struct SemState {
    /// Remaining capacity.
    counter: usize,
    /// Tasks parked on a failed acquire, FIFO.
    #[debug(skip)]
    waiters: VecDeque<Job>,
}

/// Counting semaphore limiting how many attached tasks run concurrently.
///
/// Attach with [`Task::acquire`] and [`Task::release`]; a task may acquire
/// and release the same semaphore (the common case, see
/// [`CriticalSection`]), or pass capacity along a chain by acquiring in one
/// task and releasing in another.
#[derive(Debug)]
pub struct Semaphore {
    state: Mutex<SemState>,
}

impl Semaphore {
    /// New semaphore with `capacity` concurrent slots.
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(SemState {
                counter: capacity,
                waiters: VecDeque::new(),
            }),
        })
    }

    /// Currently available capacity.
    pub fn count(&self) -> usize {
        self.lock().counter
    }

    fn lock(&self) -> MutexGuard<'_, SemState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Take one slot, or park the job built by `waiter`.
    pub(crate) fn try_acquire(&self, waiter: impl FnOnce() -> Job) -> bool {
        let mut state = self.lock();
        if state.counter > 0 {
            state.counter -= 1;
            true
        } else {
            state.waiters.push_back(waiter());
            false
        }
    }

    /// Put one slot back and hand every parked task to the caller for
    /// rescheduling. Woken tasks re-attempt their acquire lists and may park
    /// again if another waiter got the slot first.
    pub(crate) fn release_one(&self) -> Vec<Job> {
        let mut state = self.lock();
        state.counter += 1;
        state.waiters.drain(..).collect()
    }

    /// Remove waiters belonging to the given run so cancellation is not
    /// stalled by parked tasks. The jobs are handed back for rescheduling;
    /// the scheduler drops them on dequeue once it sees the cancel flag.
    pub(crate) fn purge(&self, ctx: &Arc<RunCtx>) -> Vec<Job> {
        let mut state = self.lock();
        let mut purged = Vec::new();
        state.waiters.retain_mut(|job| {
            let matches = job
                .run_ctx()
                .is_some_and(|job_ctx| Arc::ptr_eq(job_ctx, ctx));
            if matches {
                purged.push(job.take());
            }
            !matches
        });
        purged
    }
}

/// A [`Semaphore`] of fixed capacity plus a helper that attaches the
/// acquire/release pair to tasks, bounding how many of them run at once.
#[derive(Debug, Clone)]
pub struct CriticalSection {
    semaphore: Arc<Semaphore>,
}

impl CriticalSection {
    /// Critical section admitting at most `max_concurrency` tasks at a time.
    pub fn new(max_concurrency: usize) -> Self {
        Self {
            semaphore: Semaphore::new(max_concurrency),
        }
    }

    /// Attach the section's semaphore to every given task.
    pub fn add<'a>(&self, tasks: impl IntoIterator<Item = &'a Task>) {
        for task in tasks {
            task.acquire(&self.semaphore);
            task.release(&self.semaphore);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_until_exhausted_then_park() {
        let sem = Semaphore::new(2);
        assert!(sem.try_acquire(|| unreachable!()));
        assert!(sem.try_acquire(|| unreachable!()));
        assert_eq!(sem.count(), 0);
        assert!(!sem.try_acquire(Job::noop));
        let woken = sem.release_one();
        assert_eq!(woken.len(), 1);
        assert_eq!(sem.count(), 1);
    }

    #[test]
    fn release_without_waiters_restores_capacity() {
        let sem = Semaphore::new(1);
        assert!(sem.try_acquire(|| unreachable!()));
        assert!(sem.release_one().is_empty());
        assert_eq!(sem.count(), 1);
    }
}
