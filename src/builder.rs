//! Public graph-building surface: workflows, tasks, and subflows.

use crate::error::RunError;
use crate::executor::{Runtime, WorkerLocal, panic_message};
use crate::future::{CancelHook, Shared, TaskFuture};
use crate::graph::{GraphInner, NodeBody};
use crate::semaphore::Semaphore;
use crate::topology::{RunCtx, Topology};
use derive_more::{Debug, Deref};
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Graph-building operations shared by [`Workflow`] and [`Subflow`] (both
/// deref to this).
#[derive(Debug)]
pub struct FlowBuilder {
    pub(crate) graph: Arc<GraphInner>,
}

impl FlowBuilder {
    pub(crate) fn add(&self, body: NodeBody) -> Task {
        let idx = self.graph.add_node(body);
        Task {
            graph: self.graph.clone(),
            idx,
        }
    }

    /// Add a static task.
    pub fn emplace<F>(&self, body: F) -> Task
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.add(NodeBody::Static(Box::new(body)))
    }

    /// Add a condition task; its return value picks the successor branch
    /// (the position among this task's `precede` targets) to follow.
    pub fn emplace_condition<F>(&self, body: F) -> Task
    where
        F: Fn() -> usize + Send + Sync + 'static,
    {
        self.add(NodeBody::Condition(Box::new(body)))
    }

    /// Add a multi-condition task following every returned branch.
    pub fn emplace_multi_condition<F>(&self, body: F) -> Task
    where
        F: Fn() -> Vec<usize> + Send + Sync + 'static,
    {
        self.add(NodeBody::MultiCondition(Box::new(body)))
    }

    /// Add a task that builds a child graph when it executes. The subflow is
    /// joined when the body returns unless it called [`Subflow::join`] or
    /// [`Subflow::detach`] itself.
    pub fn emplace_subflow<F>(&self, body: F) -> Task
    where
        F: Fn(&mut Subflow<'_>) + Send + Sync + 'static,
    {
        self.add(NodeBody::Subflow(Box::new(body)))
    }

    /// Add a task receiving a [`Runtime`] scheduling handle.
    pub fn emplace_runtime<F>(&self, body: F) -> Task
    where
        F: Fn(&mut Runtime<'_>) + Send + Sync + 'static,
    {
        self.add(NodeBody::Runtime(Box::new(body)))
    }

    /// Add a do-nothing task, useful as a join or fork point.
    pub fn placeholder(&self) -> Task {
        self.add(NodeBody::Noop)
    }

    /// Add a module task running `module` as a nested subgraph. The module
    /// workflow must not be executing when this workflow is submitted.
    pub fn composed_of(&self, module: &Workflow) -> Task {
        self.add(NodeBody::Module(module.graph_ref().clone()))
    }

    pub fn num_tasks(&self) -> usize {
        self.graph.num_nodes()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.num_nodes() == 0
    }
}

/// A buildable, reusable task graph.
///
/// Build with the [`FlowBuilder`] surface (deref), submit with
/// [`Executor::run`](crate::Executor::run) and friends. Submitting snapshots
/// the graph, so edits made while a run is in flight only affect later
/// submissions.
#[derive(Debug, Deref)]
pub struct Workflow {
    builder: FlowBuilder,
}

impl Default for Workflow {
    fn default() -> Self {
        Self::new()
    }
}

impl Workflow {
    pub fn new() -> Self {
        Self::named("workflow")
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self {
            builder: FlowBuilder {
                graph: GraphInner::new(name.into()),
            },
        }
    }

    pub fn name(&self) -> &str {
        &self.graph_ref().name
    }

    /// Write the graph in DOT format: tasks labeled by name, condition edges
    /// dashed and labeled with their branch index, composed modules rendered
    /// as clusters.
    pub fn dump<W: fmt::Write>(&self, writer: &mut W) -> fmt::Result {
        self.graph_ref().dump(writer)
    }

    pub(crate) fn graph_ref(&self) -> &Arc<GraphInner> {
        &self.builder.graph
    }
}

/// Handle to one task of a workflow. Cheap to clone; all handles to the same
/// task are interchangeable.
#[derive(Debug, Clone)]
pub struct Task {
    #[debug(skip)]
    pub(crate) graph: Arc<GraphInner>,
    pub(crate) idx: u32,
}

impl Task {
    /// Name the task (shown in dumps and observers).
    pub fn name(&self, name: impl Into<String>) -> &Self {
        self.graph.lock_nodes()[self.idx as usize]
            .lock_state()
            .name = Some(name.into());
        self
    }

    /// Make `other` run after this task.
    pub fn precede(&self, other: &Task) -> &Self {
        assert!(
            Arc::ptr_eq(&self.graph, &other.graph),
            "tasks of different workflows cannot be linked"
        );
        self.graph.precede(self.idx, other.idx);
        self
    }

    /// Make `other` run before this task.
    pub fn succeed(&self, other: &Task) -> &Self {
        assert!(
            Arc::ptr_eq(&self.graph, &other.graph),
            "tasks of different workflows cannot be linked"
        );
        self.graph.precede(other.idx, self.idx);
        self
    }

    /// Acquire `semaphore` before the task body runs. Multiple semaphores
    /// are acquired in the order of these calls.
    pub fn acquire(&self, semaphore: &Arc<Semaphore>) -> &Self {
        self.graph.lock_nodes()[self.idx as usize]
            .lock_state()
            .acquires
            .push(semaphore.clone());
        self
    }

    /// Release `semaphore` after the task body ran.
    pub fn release(&self, semaphore: &Arc<Semaphore>) -> &Self {
        self.graph.lock_nodes()[self.idx as usize]
            .lock_state()
            .releases
            .push(semaphore.clone());
        self
    }

    pub fn num_successors(&self) -> usize {
        self.graph.lock_nodes()[self.idx as usize]
            .lock_state()
            .successors
            .len()
    }

    pub fn num_dependents(&self) -> usize {
        self.graph.lock_nodes()[self.idx as usize]
            .lock_state()
            .predecessors
            .len()
    }

    /// Visit every direct successor.
    pub fn for_each_successor(&self, mut visit: impl FnMut(Task)) {
        let successors = self.graph.lock_nodes()[self.idx as usize]
            .lock_state()
            .successors
            .clone();
        for idx in successors {
            visit(Task {
                graph: self.graph.clone(),
                idx,
            });
        }
    }

    /// Visit every direct predecessor.
    pub fn for_each_dependent(&self, mut visit: impl FnMut(Task)) {
        let predecessors = self.graph.lock_nodes()[self.idx as usize]
            .lock_state()
            .predecessors
            .clone();
        for idx in predecessors {
            visit(Task {
                graph: self.graph.clone(),
                idx,
            });
        }
    }

    pub(crate) fn index(&self) -> u32 {
        self.idx
    }

    pub(crate) fn graph_ref(&self) -> &Arc<GraphInner> {
        &self.graph
    }
}

#[derive(PartialEq, Eq)]
enum SubflowState {
    Open,
    Joined,
    Detached,
}

/// Builder for a graph spawned from inside a running task.
///
/// Exposes the full [`FlowBuilder`] surface via deref. The child graph is
/// scheduled on [`join`](Self::join) (cooperative: the spawning task blocks
/// on it while helping with other pool work) or [`detach`](Self::detach)
/// (independent execution, awaited only by
/// [`Executor::wait_for_all`](crate::Executor::wait_for_all)). A subflow
/// left open when the task body returns is joined implicitly.
#[derive(Deref)]
pub struct Subflow<'w> {
    #[deref]
    builder: FlowBuilder,
    worker: &'w WorkerLocal,
    topo: &'w Arc<Topology>,
    /// Asyncs spawned through this handle and not yet finished.
    latch: Arc<AtomicUsize>,
    state: SubflowState,
}

impl<'w> Subflow<'w> {
    pub(crate) fn new(worker: &'w WorkerLocal, topo: &'w Arc<Topology>, idx: u32) -> Self {
        let slot_name = topo.slots[idx as usize].display_name(idx);
        Self {
            builder: FlowBuilder {
                graph: GraphInner::new(format!("{}/{slot_name}", topo.graph.name)),
            },
            worker,
            topo,
            latch: Arc::new(AtomicUsize::new(0)),
            state: SubflowState::Open,
        }
    }

    /// Schedule the child graph and block cooperatively until it and every
    /// async spawned on this handle have finished.
    pub fn join(&mut self) {
        assert!(
            self.state == SubflowState::Open,
            "subflow already joined or detached"
        );
        self.state = SubflowState::Joined;
        let graph = self.builder.graph.clone();
        if graph.num_nodes() > 0 {
            // The child shares the parent's run context: its slots count
            // toward the same iteration and its failures fail the run.
            match Topology::compile(graph, self.topo.ctx.clone()) {
                Ok(child) => {
                    self.worker.start_topology_local(&child);
                    self.worker
                        .corun_until(|| child.pending.load(Ordering::Acquire) == 0);
                }
                Err(error) => self.topo.ctx.store_error(error),
            }
        }
        let latch = self.latch.clone();
        self.worker
            .corun_until(|| latch.load(Ordering::Acquire) == 0);
    }

    /// Schedule the child graph to run independently; the spawning task
    /// returns without waiting for it.
    pub fn detach(&mut self) {
        assert!(
            self.state == SubflowState::Open,
            "subflow already joined or detached"
        );
        self.state = SubflowState::Detached;
        let graph = self.builder.graph.clone();
        if graph.num_nodes() == 0 {
            return;
        }
        let inner = &self.worker.inner;
        let ctx = RunCtx::new(Arc::downgrade(inner), Box::new(|| true), true);
        match Topology::compile(graph, ctx.clone()) {
            Ok(child) => {
                ctx.set_root(&child);
                inner.begin_outstanding();
                let tracker = inner.clone();
                *ctx.callback.lock().unwrap_or_else(|e| e.into_inner()) =
                    Some(Box::new(move || tracker.finish_outstanding()));
                self.worker.start_topology_local(&child);
            }
            Err(error) => self.topo.ctx.store_error(error),
        }
    }

    /// Spawn a fire-and-forget callable, awaited by this subflow's join.
    /// A panic in it fails the spawning run.
    pub fn silent_async<F>(&self, body: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let ctx = self.topo.ctx.clone();
        self.latch.fetch_add(1, Ordering::AcqRel);
        let latch = self.latch.clone();
        self.worker.inner.begin_outstanding();
        let tracker = self.worker.inner.clone();
        self.worker
            .push_job(crate::executor::Job::Call(Box::new(move |_worker| {
                if let Err(payload) = catch_unwind(AssertUnwindSafe(body)) {
                    ctx.store_error(RunError::TaskPanicked {
                        message: panic_message(payload.as_ref()),
                    });
                }
                latch.fetch_sub(1, Ordering::AcqRel);
                tracker.finish_outstanding();
            })));
    }

    /// Spawn a callable returning a value, awaited by this subflow's join.
    pub fn async_task<F, T>(&self, body: F) -> TaskFuture<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Clone + Send + 'static,
    {
        let shared = Shared::new();
        self.latch.fetch_add(1, Ordering::AcqRel);
        let latch = self.latch.clone();
        self.worker.inner.begin_outstanding();
        let tracker = self.worker.inner.clone();
        let job_shared = shared.clone();
        self.worker
            .push_job(crate::executor::Job::Call(Box::new(move |_worker| {
                match catch_unwind(AssertUnwindSafe(body)) {
                    Ok(value) => job_shared.resolve(Ok(value)),
                    Err(payload) => job_shared.resolve(Err(RunError::TaskPanicked {
                        message: panic_message(payload.as_ref()),
                    })),
                }
                latch.fetch_sub(1, Ordering::AcqRel);
                tracker.finish_outstanding();
            })));
        TaskFuture::new(shared, CancelHook::None)
    }

    /// Implicit join for subflows left open by the task body.
    pub(crate) fn finish(mut self) {
        if self.state == SubflowState::Open {
            self.join();
        }
    }
}
