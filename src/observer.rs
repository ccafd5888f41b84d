//! Execution observation hooks.

/// Callbacks invoked around every task body execution.
///
/// Register with [`Executor::observe`](crate::Executor::observe). Callbacks
/// run on the worker thread executing the task, so they should be cheap and
/// must not block.
pub trait Observer: Send + Sync {
    /// Worker `worker` is about to run the task named `task`.
    fn on_entry(&self, worker: usize, task: &str) {
        let _ = (worker, task);
    }

    /// Worker `worker` finished running the task named `task`.
    fn on_exit(&self, worker: usize, task: &str) {
        let _ = (worker, task);
    }
}
