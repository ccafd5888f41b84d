//! Two-phase eventcount for putting idle workers to sleep.
//!
//! A worker that found no work *prepares* a wait, re-checks every queue, and
//! only then *commits* to sleeping; if the re-check finds work it *cancels*
//! instead. A producer making work visible calls [`Notifier::notify`] after
//! its store. The seq-cst fences on both sides guarantee that either the
//! sleeper sees the new work during its re-check or the producer sees the
//! registered waiter, so no wakeup is lost.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex};

#[derive(Debug, Default)]
pub(crate) struct Notifier {
    /// Bumped on every notification; a committed wait sleeps only while the
    /// epoch still matches the one captured at prepare time.
    epoch: AtomicU64,
    /// Number of workers between prepare and wake.
    waiters: AtomicUsize,
    lock: Mutex<()>,
    cv: Condvar,
}

impl Notifier {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// First phase: register intent to sleep and capture the current epoch.
    ///
    /// Must be followed by exactly one of [`commit_wait`](Self::commit_wait)
    /// or [`cancel_wait`](Self::cancel_wait).
    pub(crate) fn prepare_wait(&self) -> u64 {
        self.waiters.fetch_add(1, Ordering::SeqCst);
        // Order the waiter registration before the caller's queue re-check;
        // pairs with the fence in `notify`.
        std::sync::atomic::fence(Ordering::SeqCst);
        self.epoch.load(Ordering::SeqCst)
    }

    /// Second phase: sleep until the epoch moves past the captured one.
    pub(crate) fn commit_wait(&self, epoch: u64) {
        let mut guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        while self.epoch.load(Ordering::SeqCst) == epoch {
            guard = self.cv.wait(guard).unwrap_or_else(|e| e.into_inner());
        }
        drop(guard);
        self.waiters.fetch_sub(1, Ordering::SeqCst);
    }

    /// Abort a prepared wait because the re-check found work.
    pub(crate) fn cancel_wait(&self) {
        self.waiters.fetch_sub(1, Ordering::SeqCst);
    }

    /// Wake sleepers. `all` wakes every sleeper, otherwise one.
    ///
    /// Call after the store that made new work visible.
    pub(crate) fn notify(&self, all: bool) {
        // Order the producer's work publication before the waiter check;
        // pairs with the fence in `prepare_wait`.
        std::sync::atomic::fence(Ordering::SeqCst);
        if self.waiters.load(Ordering::SeqCst) == 0 {
            return;
        }
        {
            let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
            self.epoch.fetch_add(1, Ordering::SeqCst);
        }
        if all {
            self.cv.notify_all();
        } else {
            self.cv.notify_one();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn notify_wakes_committed_waiter() {
        let notifier = Arc::new(Notifier::new());
        let woke = Arc::new(AtomicBool::new(false));

        let handle = {
            let notifier = notifier.clone();
            let woke = woke.clone();
            std::thread::spawn(move || {
                let epoch = notifier.prepare_wait();
                notifier.commit_wait(epoch);
                woke.store(true, Ordering::SeqCst);
            })
        };

        // Keep notifying until the waiter reports back; a single notify could
        // land before the prepare.
        while !woke.load(Ordering::SeqCst) {
            notifier.notify(false);
            std::thread::sleep(Duration::from_millis(1));
        }
        handle.join().unwrap();
    }

    #[test]
    fn cancel_leaves_no_waiter() {
        let notifier = Notifier::new();
        let _epoch = notifier.prepare_wait();
        notifier.cancel_wait();
        assert_eq!(notifier.waiters.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn notify_all_wakes_everyone() {
        let notifier = Arc::new(Notifier::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let notifier = notifier.clone();
                std::thread::spawn(move || {
                    let epoch = notifier.prepare_wait();
                    notifier.commit_wait(epoch);
                })
            })
            .collect();

        while notifier.waiters.load(Ordering::SeqCst) > 0 {
            notifier.notify(true);
            std::thread::sleep(Duration::from_millis(1));
        }
        for handle in handles {
            handle.join().unwrap();
        }
    }
}
