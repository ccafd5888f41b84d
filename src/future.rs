//! Blocking futures for submitted runs and fire-and-forget tasks.

use crate::error::RunError;
use crate::topology::RunCtx;
use derive_more::Debug;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};

/// One-shot rendezvous between the worker that completes a run (or a plain
/// async task) and the caller holding its future.
#[derive(Debug)]
pub(crate) struct Shared<T> {
    #[debug(skip)]
    slot: Mutex<Option<Result<T, RunError>>>,
    #[debug(skip)]
    cv: Condvar,
}

impl<T> Shared<T> {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            slot: Mutex::new(None),
            cv: Condvar::new(),
        })
    }

    /// Deliver the result. The first resolution wins; later ones are dropped.
    pub(crate) fn resolve(&self, result: Result<T, RunError>) {
        let mut slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
        if slot.is_none() {
            *slot = Some(result);
            self.cv.notify_all();
        }
    }

    fn wait_cloned(&self) -> Result<T, RunError>
    where
        T: Clone,
    {
        let mut slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            if let Some(result) = slot.as_ref() {
                return result.clone();
            }
            slot = self.cv.wait(slot).unwrap_or_else(|e| e.into_inner());
        }
    }

    fn is_ready(&self) -> bool {
        self.slot
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }
}

/// How a future propagates a cancel request back to its producer.
#[derive(Debug, Default)]
pub(crate) enum CancelHook {
    /// A whole-run future: flips the run context's cancellation flag, which
    /// stops scheduling of not-yet-started tasks of that run.
    Ctx(#[debug(skip)] Arc<RunCtx>),
    /// A standalone async task: the flag is checked right before the body
    /// would execute.
    Flag(Arc<AtomicBool>),
    /// Nothing to cancel (already-resolved futures).
    #[default]
    None,
}

/// Handle to a value produced asynchronously on the executor.
///
/// Dropping the future does not cancel or detach anything; the underlying
/// work keeps running. Use [`cancel`](TaskFuture::cancel) to request that
/// tasks which have not yet started are skipped. Tasks already running are
/// never interrupted.
#[derive(Debug)]
pub struct TaskFuture<T> {
    pub(crate) shared: Arc<Shared<T>>,
    pub(crate) hook: CancelHook,
}

/// Future of a whole workflow run.
pub type RunFuture = TaskFuture<()>;

impl<T: Clone> TaskFuture<T> {
    pub(crate) fn new(shared: Arc<Shared<T>>, hook: CancelHook) -> Self {
        Self { shared, hook }
    }

    /// An already-resolved future (empty graphs, zero-repeat runs).
    pub(crate) fn ready(result: Result<T, RunError>) -> Self {
        let shared = Shared::new();
        shared.resolve(result);
        Self {
            shared,
            hook: CancelHook::None,
        }
    }

    /// Block until the result is available and return it.
    pub fn get(self) -> Result<T, RunError> {
        self.shared.wait_cloned()
    }

    /// Block until the result is available without consuming the future.
    pub fn wait(&self) -> Result<T, RunError> {
        self.shared.wait_cloned()
    }

    /// Whether the result has been delivered.
    pub fn is_ready(&self) -> bool {
        self.shared.is_ready()
    }

    /// Request cancellation.
    ///
    /// For a run future this prevents tasks of the run that have not started
    /// from being scheduled; the future then resolves to
    /// [`RunError::Canceled`] once in-flight tasks drain. Cancelling an
    /// already-finished run has no effect.
    pub fn cancel(&self) {
        match &self.hook {
            CancelHook::Ctx(ctx) => ctx.request_cancel(),
            CancelHook::Flag(flag) => flag.store(true, Ordering::Release),
            CancelHook::None => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_then_get() {
        let shared = Shared::new();
        shared.resolve(Ok(42));
        let future = TaskFuture::new(shared, CancelHook::None);
        assert!(future.is_ready());
        assert_eq!(future.get(), Ok(42));
    }

    #[test]
    fn first_resolution_wins() {
        let shared = Shared::new();
        shared.resolve(Err(RunError::Canceled));
        shared.resolve(Ok(1));
        let future: TaskFuture<i32> = TaskFuture::new(shared, CancelHook::None);
        assert_eq!(future.get(), Err(RunError::Canceled));
    }

    #[test]
    fn wait_blocks_until_resolved() {
        let shared = Shared::new();
        let future = TaskFuture::new(shared.clone(), CancelHook::None);
        let handle = std::thread::spawn(move || future.get());
        std::thread::sleep(std::time::Duration::from_millis(10));
        shared.resolve(Ok("done"));
        assert_eq!(handle.join().unwrap(), Ok("done"));
    }

    #[test]
    fn cancel_flag_hook() {
        let flag = Arc::new(AtomicBool::new(false));
        let future: TaskFuture<()> =
            TaskFuture::new(Shared::new(), CancelHook::Flag(flag.clone()));
        future.cancel();
        assert!(flag.load(Ordering::Acquire));
    }
}
