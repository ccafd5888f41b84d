use thiserror::Error;

/// Error delivered through the future of a failed run.
///
/// Errors are scoped to the run that produced them: they never poison the
/// executor or runs of other workflows. `Executor::wait_for_all` waits for
/// every outstanding run regardless of individual failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum RunError {
    /// The dependency graph contains cycle(s); no topological order exists.
    #[error("graph contains cycle(s)")]
    Cycle,
    /// A module node references a workflow that is currently executing.
    #[error("composed workflow is already executing")]
    ModuleBusy,
    /// The run was canceled through its future.
    #[error("run canceled")]
    Canceled,
    /// A task body panicked; the first panic per run is captured here and
    /// scheduling of the remaining tasks of that run is suppressed.
    #[error("task panicked: {message}")]
    TaskPanicked {
        /// Panic payload rendered to a string, if it was one.
        message: String,
    },
    /// An internal queue outgrew its maximum capacity.
    #[error("scheduler resources exhausted: {0}")]
    ResourceExhausted(&'static str),
}
