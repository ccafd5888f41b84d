//! Per-submission compiled snapshot of a graph.
//!
//! Submitting a workflow compiles its graph into a flat slot arena: each
//! slot carries resolved successor indices, a static predecessor count, and
//! an atomic join counter counted down as predecessors finish. Module
//! references are inlined here, each instance getting fresh slots, so the
//! running topology never chases `Arc`s across graphs.

use crate::error::RunError;
use crate::executor::Inner;
use crate::future::Shared;
use crate::graph::{GraphInner, Node, NodeBody};
use crate::semaphore::Semaphore;
use crate::types::IndexSet;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use tracing::debug;

pub(crate) enum SlotBody {
    /// Snapshot of a user node; the body is dispatched on at execution.
    User(Arc<Node>),
    /// Synthetic join point inserted after an inlined module: fires the
    /// module node's original successors once every module sink finished.
    Gate,
}

pub(crate) struct Slot {
    pub(crate) body: SlotBody,
    /// Name snapshot taken at compile time.
    pub(crate) name: Option<Box<str>>,
    pub(crate) successors: Vec<u32>,
    pub(crate) num_predecessors: u32,
    /// Remaining predecessors this iteration; the slot fires at zero.
    pub(crate) join: AtomicU32,
    /// Whether at least one predecessor completed for real (was not skipped
    /// away by condition routing). A slot whose join hits zero without a
    /// real completion is skipped transitively.
    pub(crate) seen_real: AtomicBool,
    pub(crate) acquires: Vec<Arc<Semaphore>>,
    pub(crate) releases: Vec<Arc<Semaphore>>,
}

impl Slot {
    fn from_node(node: &Arc<Node>, base: u32) -> Self {
        let state = node.lock_state();
        Self {
            body: SlotBody::User(node.clone()),
            name: state.name.as_deref().map(Box::from),
            successors: state.successors.iter().map(|&s| s + base).collect(),
            num_predecessors: u32::try_from(state.predecessors.len())
                .expect("predecessor count overflows u32"),
            join: AtomicU32::new(0),
            seen_real: AtomicBool::new(false),
            acquires: state.acquires.clone(),
            releases: state.releases.clone(),
        }
    }

    fn gate(successors: Vec<u32>, num_predecessors: u32) -> Self {
        Self {
            body: SlotBody::Gate,
            name: None,
            successors,
            num_predecessors,
            join: AtomicU32::new(0),
            seen_real: AtomicBool::new(false),
            acquires: Vec::new(),
            releases: Vec::new(),
        }
    }

    /// Name for observers and traces.
    pub(crate) fn display_name(&self, idx: u32) -> String {
        match &self.name {
            Some(name) => name.to_string(),
            None => match &self.body {
                SlotBody::User(node) => format!("{}{idx}", node.body.kind()),
                SlotBody::Gate => format!("gate{idx}"),
            },
        }
    }
}

/// Shared state of one run: spans the root topology and every joined subflow
/// topology it spawns.
pub(crate) struct RunCtx {
    /// Executor the run was submitted to; used to reschedule semaphore
    /// waiters purged by cancellation.
    pub(crate) executor: Weak<Inner>,
    /// Slots not yet finished across all topologies of the current
    /// iteration. The iteration ends at zero.
    pub(crate) pending: AtomicUsize,
    pub(crate) cancelled: AtomicBool,
    /// First failure of the run; later ones are dropped.
    pub(crate) error: OnceLock<RunError>,
    /// Stop predicate, evaluated after each completed iteration. `true`
    /// resolves the future, `false` restarts the sources.
    pub(crate) predicate: Mutex<Box<dyn FnMut() -> bool + Send>>,
    pub(crate) promise: Arc<Shared<()>>,
    /// Completion callback for `run_then`.
    pub(crate) callback: Mutex<Option<Box<dyn FnOnce() + Send>>>,
    /// Semaphores some task of this run parked on; purged on cancel.
    pub(crate) touched: Mutex<Vec<Arc<Semaphore>>>,
    /// Root topology of the run; iteration completion is driven through it.
    root: OnceLock<Weak<Topology>>,
    /// Set for topologies driven by `corun`: completion must not touch the
    /// owning graph's run queue.
    pub(crate) inline_run: bool,
}

impl RunCtx {
    pub(crate) fn new(
        executor: Weak<Inner>,
        predicate: Box<dyn FnMut() -> bool + Send>,
        inline_run: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            executor,
            pending: AtomicUsize::new(0),
            cancelled: AtomicBool::new(false),
            error: OnceLock::new(),
            predicate: Mutex::new(predicate),
            promise: Shared::new(),
            callback: Mutex::new(None),
            touched: Mutex::new(Vec::new()),
            root: OnceLock::new(),
            inline_run,
        })
    }

    pub(crate) fn set_root(&self, root: &Arc<Topology>) {
        let _ = self.root.set(Arc::downgrade(root));
    }

    pub(crate) fn root_topology(&self) -> Option<Arc<Topology>> {
        self.root.get().and_then(Weak::upgrade)
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Record the run's first error; scheduling checks stop dispatching
    /// bodies once set. The first error also unparks the run's semaphore
    /// waiters: their releasers get skip-drained, so nothing else would.
    pub(crate) fn store_error(self: &Arc<Self>, error: RunError) {
        if self.error.set(error).is_ok() {
            self.purge_waiters();
        }
    }

    pub(crate) fn remember_semaphore(&self, semaphore: &Arc<Semaphore>) {
        let mut touched = self.touched.lock().unwrap_or_else(|e| e.into_inner());
        if !touched.iter().any(|s| Arc::ptr_eq(s, semaphore)) {
            touched.push(semaphore.clone());
        }
    }

    /// Flip the cancel flag and unpark any semaphore waiters of this run so
    /// the countdown can drain.
    pub(crate) fn request_cancel(self: &Arc<Self>) {
        if self.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!("run cancellation requested");
        self.purge_waiters();
    }

    /// Hand every semaphore waiter of this run back to the scheduler, which
    /// drains the jobs as skips once it sees the run has stopped.
    pub(crate) fn purge_waiters(self: &Arc<Self>) {
        let touched = {
            let guard = self.touched.lock().unwrap_or_else(|e| e.into_inner());
            guard.clone()
        };
        if touched.is_empty() {
            return;
        }
        let Some(executor) = self.executor.upgrade() else {
            return;
        };
        for semaphore in touched {
            let purged = semaphore.purge(self);
            executor.inject_many(purged);
        }
    }
}

/// A compiled run instance of one graph.
pub(crate) struct Topology {
    pub(crate) graph: Arc<GraphInner>,
    pub(crate) slots: Box<[Slot]>,
    pub(crate) sources: Box<[u32]>,
    /// Slots of this topology not yet finished in the current iteration;
    /// subflow joins wait for this one, not the run-wide counter.
    pub(crate) pending: AtomicUsize,
    pub(crate) ctx: Arc<RunCtx>,
}

impl Topology {
    /// Compile `graph` into a fresh topology. Detects module recursion and
    /// cycles, and rejects modules whose workflow is currently executing.
    pub(crate) fn compile(
        graph: Arc<GraphInner>,
        ctx: Arc<RunCtx>,
    ) -> Result<Arc<Self>, RunError> {
        let mut slots = Vec::new();
        let mut chain = IndexSet::default();
        chain.insert(Arc::as_ptr(&graph) as usize);
        inline_graph(&graph, &mut slots, &mut chain)?;

        verify_acyclic(&slots)?;
        let sources = slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.num_predecessors == 0)
            .map(|(idx, _)| idx as u32)
            .collect();
        debug!(graph = %graph.name, slots = slots.len(), "topology compiled");
        Ok(Arc::new(Self {
            graph,
            slots: slots.into_boxed_slice(),
            sources,
            pending: AtomicUsize::new(0),
            ctx,
        }))
    }

    /// Arm all join counters for a (re)run of this topology and account its
    /// slots in both the local and the run-wide pending counters.
    pub(crate) fn reset_iteration(&self) {
        for slot in &self.slots {
            slot.join.store(slot.num_predecessors, Ordering::Relaxed);
            slot.seen_real.store(false, Ordering::Relaxed);
        }
        self.pending.store(self.slots.len(), Ordering::Relaxed);
        self.ctx.pending.fetch_add(self.slots.len(), Ordering::AcqRel);
    }
}

/// Append slots for `graph` (and, recursively, its modules) to `slots`.
fn inline_graph(
    graph: &Arc<GraphInner>,
    slots: &mut Vec<Slot>,
    chain: &mut IndexSet<usize>,
) -> Result<(), RunError> {
    let nodes = graph.lock_nodes().clone();
    let base = u32::try_from(slots.len()).expect("topology slot count overflows u32");
    for node in &nodes {
        slots.push(Slot::from_node(node, base));
    }
    for (offset, node) in nodes.iter().enumerate() {
        let NodeBody::Module(module) = &node.body else {
            continue;
        };
        if module.is_executing() {
            return Err(RunError::ModuleBusy);
        }
        let key = Arc::as_ptr(module) as usize;
        if !chain.insert(key) {
            // The module chain loops back on itself.
            return Err(RunError::Cycle);
        }
        let module_base = slots.len() as u32;
        inline_graph(module, slots, chain)?;
        let module_end = slots.len() as u32;
        chain.swap_remove(&key);

        let mut module_sources = Vec::new();
        let mut module_sinks = Vec::new();
        for idx in module_base..module_end {
            let slot = &slots[idx as usize];
            if slot.num_predecessors == 0 {
                module_sources.push(idx);
            }
            if slot.successors.is_empty() {
                module_sinks.push(idx);
            }
        }
        if module_sources.is_empty() {
            // Empty module graph: keep the original edges, nothing to run.
            continue;
        }

        // Module node fires the module's sources; its original successors
        // move behind a gate fed by the module's sinks.
        let module_slot = base + offset as u32;
        let gate_idx = module_end;
        let original_successors = std::mem::take(&mut slots[module_slot as usize].successors);
        for &src in &module_sources {
            slots[src as usize].num_predecessors += 1;
        }
        for &sink in &module_sinks {
            slots[sink as usize].successors.push(gate_idx);
        }
        slots[module_slot as usize].successors = module_sources;
        slots.push(Slot::gate(original_successors, module_sinks.len() as u32));
    }
    Ok(())
}

/// Kahn-style drain over the compiled slots; fails if any slot stays
/// unreachable from the zero-predecessor frontier.
fn verify_acyclic(slots: &[Slot]) -> Result<(), RunError> {
    let mut indegree: Vec<u32> = slots.iter().map(|s| s.num_predecessors).collect();
    let mut frontier: VecDeque<u32> = indegree
        .iter()
        .enumerate()
        .filter(|&(_, &d)| d == 0)
        .map(|(idx, _)| idx as u32)
        .collect();
    let mut visited = 0usize;
    while let Some(idx) = frontier.pop_front() {
        visited += 1;
        for &succ in &slots[idx as usize].successors {
            let d = &mut indegree[succ as usize];
            *d -= 1;
            if *d == 0 {
                frontier.push_back(succ);
            }
        }
    }
    if visited == slots.len() {
        Ok(())
    } else {
        Err(RunError::Cycle)
    }
}
