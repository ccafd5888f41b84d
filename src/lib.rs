//! Work-stealing executor for task dependency graphs.
//!
//! This crate runs Directed Acyclic Graphs (DAGs) of tasks on a pool of
//! worker threads. It:
//! - Compiles a submitted workflow into a flat slot table, detecting cycles
//!   and inlining composed workflows at submission time.
//! - Schedules ready tasks over per-worker Chase-Lev deques with randomized
//!   stealing, parking idle workers on a two-phase eventcount.
//! - Eliminates the branches a condition task did not select, draining their
//!   dependency counters without running their bodies.
//! - Lets running tasks extend the graph dynamically (subflows), spawn
//!   detached work, and cooperatively run nested workflows on their own
//!   worker's stack.
//!
//! Key modules:
//! - `builder`: [`Workflow`], [`Task`] handles and the task emplacement API.
//! - `executor`: the worker pool, [`Executor`] submission surface and the
//!   in-task [`Runtime`]/[`Subflow`] control objects.
//! - `topology`: workflow compilation into executable slot tables.
//! - `algorithm`: parallel loops, reductions, scans, sorting and pipelines
//!   built on top of the executor.
//!
//! Quick start:
//! 1. Build a [`Workflow`] and add tasks with [`FlowBuilder::emplace`].
//! 2. Wire dependencies with [`Task::precede`]/[`Task::succeed`].
//! 3. Create an [`Executor`] and call [`Executor::run`]; the returned
//!    [`RunFuture`] resolves when every task in the graph has finished.
//!
//! Workflows are reusable: the same graph can be submitted repeatedly or run
//! for several iterations per submission, and a workflow may be composed
//! into another one as a module task.

/// Parallel algorithm adapters built on the executor core.
///
/// Provides partitioned loops (`for_each`), reductions, prefix scans,
/// parallel sort, early-exit search and token [`Pipeline`]s, all exposed as
/// tasks added to a [`FlowBuilder`].
pub mod algorithm;
mod builder;
mod deque;
mod error;
/// The work-stealing worker pool and everything tasks see at run time.
mod executor;
mod future;
mod graph;
mod notifier;
mod observer;
mod semaphore;
mod sync;
/// Workflow compilation: slot tables, module inlining, cycle detection.
mod topology;
mod types;

pub use algorithm::{DataPipe, DataPipeline, Partitioner, Pipe, PipeKind, Pipeflow, Pipeline};
pub use builder::{FlowBuilder, Subflow, Task, Workflow};
pub use error::RunError;
pub use executor::{Executor, Runtime};
pub use future::{RunFuture, TaskFuture};
pub use observer::Observer;
pub use semaphore::{CriticalSection, Semaphore};
