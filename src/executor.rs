//! Thread pool core: workers, job scheduling, and run lifecycle.
//!
//! Each worker owns a work-stealing deque and loops: pop local, steal from a
//! random victim, drain the shared injector, then sleep through the
//! two-phase notifier. Nested waits (`Runtime::corun`, `Subflow::join`,
//! algorithm latches) re-enter the same loop on the caller's stack instead
//! of parking, so a saturated pool cannot deadlock on its own nesting.

use crate::builder::{Subflow, Workflow};
use crate::deque::{StealResult, WsOwner, WsStealer, ws_deque};
use crate::error::RunError;
use crate::future::{CancelHook, RunFuture, Shared, TaskFuture};
use crate::graph::{GraphInner, NodeBody};
use crate::notifier::Notifier;
use crate::observer::Observer;
use crate::topology::{RunCtx, SlotBody, Topology};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use std::any::Any;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::io;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::thread::{self, JoinHandle};
use tracing::{debug, trace, warn};

const INITIAL_DEQUE_CAPACITY: usize = 256;

/// Unit of scheduled work.
pub(crate) enum Job {
    /// One slot of a compiled topology.
    Node { topo: Arc<Topology>, idx: u32 },
    /// Detached callable (async tasks, algorithm chunk drivers). Receives
    /// the executing worker so it can help-schedule while it waits.
    Call(Box<dyn FnOnce(&WorkerLocal) + Send>),
}

impl Job {
    pub(crate) fn noop() -> Self {
        Self::Call(Box::new(|_| {}))
    }

    pub(crate) fn take(&mut self) -> Self {
        std::mem::replace(self, Self::noop())
    }

    pub(crate) fn run_ctx(&self) -> Option<&Arc<RunCtx>> {
        match self {
            Self::Node { topo, .. } => Some(&topo.ctx),
            Self::Call(_) => None,
        }
    }
}

/// Which successor edges fired for real after a body ran.
enum Selected {
    All,
    Branches(Vec<usize>),
}

impl Selected {
    fn contains(&self, branch: usize) -> bool {
        match self {
            Self::All => true,
            Self::Branches(branches) => branches.contains(&branch),
        }
    }
}

/// Executor state shared by workers and submission handles.
pub(crate) struct Inner {
    stealers: Box<[WsStealer<Job>]>,
    /// Overflow and external-submission queue.
    injector: Mutex<VecDeque<Job>>,
    notifier: Notifier,
    shutdown: AtomicBool,
    /// Fire-and-forget work not tied to a run future: async tasks and
    /// detached subflows. `wait_for_all` waits for these too.
    outstanding: AtomicUsize,
    /// Root runs submitted and not yet finished (active or queued).
    num_topologies: AtomicUsize,
    /// Workflows with an active root run.
    num_active_graphs: AtomicUsize,
    done: Mutex<()>,
    done_cv: Condvar,
    observers: RwLock<Vec<Arc<dyn Observer>>>,
    has_observers: AtomicBool,
    num_workers: usize,
}

impl Inner {
    pub(crate) fn inject(&self, job: Job) {
        self.injector
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(job);
        self.notifier.notify(false);
    }

    pub(crate) fn inject_many(&self, jobs: Vec<Job>) {
        if jobs.is_empty() {
            return;
        }
        let all = jobs.len() > 1;
        self.injector
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend(jobs);
        self.notifier.notify(all);
    }

    fn pop_injected(&self) -> Option<Job> {
        self.injector
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
    }

    fn injector_is_empty(&self) -> bool {
        self.injector
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_empty()
    }

    /// Start a root or queued topology from outside a worker.
    fn start_topology(&self, topo: &Arc<Topology>) {
        topo.reset_iteration();
        let jobs = topo
            .sources
            .iter()
            .map(|&idx| Job::Node {
                topo: topo.clone(),
                idx,
            })
            .collect();
        self.inject_many(jobs);
    }

    /// Track one unit of fire-and-forget work for `wait_for_all`.
    pub(crate) fn begin_outstanding(&self) {
        self.outstanding.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn finish_outstanding(&self) {
        if self.outstanding.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.signal_done();
        }
    }

    fn signal_done(&self) {
        let _guard = self.done.lock().unwrap_or_else(|e| e.into_inner());
        self.done_cv.notify_all();
    }
}

/// Per-worker-thread state.
pub(crate) struct WorkerLocal {
    id: usize,
    deque: WsOwner<Job>,
    rng: RefCell<SmallRng>,
    pub(crate) inner: Arc<Inner>,
}

fn worker_main(worker: WorkerLocal) {
    trace!(worker = worker.id, "worker started");
    loop {
        while let Some(job) = worker.next_job() {
            worker.execute(job);
        }
        if worker.inner.shutdown.load(Ordering::Acquire) {
            trace!(worker = worker.id, "worker shutting down");
            return;
        }
        let epoch = worker.inner.notifier.prepare_wait();
        if worker.inner.shutdown.load(Ordering::Acquire) || worker.has_visible_work() {
            worker.inner.notifier.cancel_wait();
            continue;
        }
        worker.inner.notifier.commit_wait(epoch);
    }
}

impl WorkerLocal {
    pub(crate) fn num_workers(&self) -> usize {
        self.inner.num_workers
    }

    /// Queue a job, preferring the local deque for cache locality.
    pub(crate) fn push_job(&self, job: Job) {
        if let Err(job) = self.deque.push(job) {
            // Deque cannot grow further; surface the failure on the run and
            // fall back to the unbounded injector so the countdown drains.
            if let Some(ctx) = job.run_ctx() {
                ctx.store_error(RunError::ResourceExhausted("worker deque"));
            }
            self.inner.inject(job);
            return;
        }
        self.inner.notifier.notify(false);
    }

    fn next_job(&self) -> Option<Job> {
        if let Some(job) = self.deque.pop() {
            return Some(job);
        }
        self.steal_job()
    }

    fn steal_job(&self) -> Option<Job> {
        let num = self.inner.stealers.len();
        if num > 1 {
            let start = self.rng.borrow_mut().random_range(0..num);
            for i in 0..num {
                let victim = (start + i) % num;
                if victim == self.id {
                    continue;
                }
                loop {
                    match self.inner.stealers[victim].steal() {
                        StealResult::Success(job) => return Some(job),
                        StealResult::Retry => continue,
                        StealResult::Empty => break,
                    }
                }
            }
        }
        self.inner.pop_injected()
    }

    fn has_visible_work(&self) -> bool {
        !self.inner.injector_is_empty()
            || self
                .inner
                .stealers
                .iter()
                .any(|stealer| !stealer.is_empty())
    }

    fn execute(&self, job: Job) {
        match job {
            Job::Call(call) => call(self),
            Job::Node { topo, idx } => self.invoke(&topo, idx),
        }
    }

    /// Run one slot: semaphores, body dispatch, successor propagation.
    fn invoke(&self, topo: &Arc<Topology>, idx: u32) {
        let ctx = &topo.ctx;
        let stopped = ctx.is_cancelled() || ctx.error.get().is_some();
        let slot = &topo.slots[idx as usize];

        if !stopped && !slot.acquires.is_empty() && !self.acquire_semaphores(topo, idx) {
            // Parked on a semaphore; the job re-runs on release.
            return;
        }

        let mut selected = Selected::All;
        if !stopped {
            let observed = matches!(slot.body, SlotBody::User(_))
                && self.inner.has_observers.load(Ordering::Acquire);
            let name = observed.then(|| slot.display_name(idx));
            if let Some(name) = &name {
                for observer in self
                    .inner
                    .observers
                    .read()
                    .unwrap_or_else(|e| e.into_inner())
                    .iter()
                {
                    observer.on_entry(self.id, name);
                }
            }
            match catch_unwind(AssertUnwindSafe(|| self.dispatch(topo, idx))) {
                Ok(sel) => selected = sel,
                Err(payload) => {
                    let message = panic_message(payload.as_ref());
                    warn!(graph = %topo.graph.name, slot = idx, %message, "task panicked");
                    ctx.store_error(RunError::TaskPanicked { message });
                }
            }
            if let Some(name) = &name {
                for observer in self
                    .inner
                    .observers
                    .read()
                    .unwrap_or_else(|e| e.into_inner())
                    .iter()
                {
                    observer.on_exit(self.id, name);
                }
            }
            for semaphore in &slot.releases {
                let woken = semaphore.release_one();
                for job in woken {
                    self.push_job(job);
                }
            }
        }

        // Propagate: successors of a stopped or failed slot count down as
        // skips so the iteration drains without executing bodies.
        let stopped = ctx.is_cancelled() || ctx.error.get().is_some();
        for (branch, &succ) in slot.successors.iter().enumerate() {
            let real = !stopped && selected.contains(branch);
            self.propagate(topo, succ, real);
        }
        self.complete_one(topo);
    }

    /// Take all of the slot's semaphores in insertion order, or park the job
    /// on the first one without capacity (rolling back the ones taken).
    fn acquire_semaphores(&self, topo: &Arc<Topology>, idx: u32) -> bool {
        let slot = &topo.slots[idx as usize];
        for (i, semaphore) in slot.acquires.iter().enumerate() {
            let acquired = semaphore.try_acquire(|| Job::Node {
                topo: topo.clone(),
                idx,
            });
            if !acquired {
                topo.ctx.remember_semaphore(semaphore);
                for taken in &slot.acquires[..i] {
                    for job in taken.release_one() {
                        self.push_job(job);
                    }
                }
                // The run may have stopped between the dispatch check and
                // the park; purge again so this job is not stranded.
                if topo.ctx.is_cancelled() || topo.ctx.error.get().is_some() {
                    topo.ctx.purge_waiters();
                }
                trace!(slot = idx, "task parked on semaphore");
                return false;
            }
        }
        true
    }

    fn dispatch(&self, topo: &Arc<Topology>, idx: u32) -> Selected {
        let slot = &topo.slots[idx as usize];
        let SlotBody::User(node) = &slot.body else {
            return Selected::All;
        };
        match &node.body {
            NodeBody::Static(body) => {
                body();
                Selected::All
            }
            NodeBody::Condition(body) => Selected::Branches(vec![body()]),
            NodeBody::MultiCondition(body) => Selected::Branches(body()),
            NodeBody::Runtime(body) => {
                let latch = Arc::new(AtomicUsize::new(0));
                let mut runtime = Runtime {
                    worker: self,
                    topo,
                    latch: latch.clone(),
                };
                body(&mut runtime);
                // Implicit corun_all: spawned asyncs finish before the task
                // is observed complete.
                self.corun_until(|| latch.load(Ordering::Acquire) == 0);
                Selected::All
            }
            NodeBody::Subflow(body) => {
                let mut subflow = Subflow::new(self, topo, idx);
                body(&mut subflow);
                subflow.finish();
                Selected::All
            }
            // Module bodies were inlined at compile time; the slot only
            // forwards to the module's sources.
            NodeBody::Module(_) | NodeBody::Noop => Selected::All,
        }
    }

    /// Count down a successor. A real completion arms the slot for
    /// execution; a join counter that drains on skips alone cascades the
    /// skip to its own successors.
    fn propagate(&self, topo: &Arc<Topology>, idx: u32, real: bool) {
        let mut stack = vec![(idx, real)];
        while let Some((idx, real)) = stack.pop() {
            let slot = &topo.slots[idx as usize];
            if real {
                slot.seen_real.store(true, Ordering::Release);
            }
            if slot.join.fetch_sub(1, Ordering::AcqRel) != 1 {
                continue;
            }
            if slot.seen_real.load(Ordering::Acquire) {
                self.push_job(Job::Node {
                    topo: topo.clone(),
                    idx,
                });
            } else {
                for &succ in &slot.successors {
                    stack.push((succ, false));
                }
                self.complete_one(topo);
            }
        }
    }

    fn complete_one(&self, topo: &Arc<Topology>) {
        topo.pending.fetch_sub(1, Ordering::AcqRel);
        self.finish_ctx_job(&topo.ctx);
    }

    /// Count one finished unit against the run; the last one completes the
    /// iteration.
    pub(crate) fn finish_ctx_job(&self, ctx: &Arc<RunCtx>) {
        if ctx.pending.fetch_sub(1, Ordering::AcqRel) == 1 {
            if let Some(root) = ctx.root_topology() {
                self.complete_iteration(&root);
            }
        }
    }

    fn complete_iteration(&self, root: &Arc<Topology>) {
        let ctx = &root.ctx;
        if let Some(error) = ctx.error.get() {
            self.finish_run(root, Err(error.clone()));
            return;
        }
        if ctx.is_cancelled() {
            self.finish_run(root, Err(RunError::Canceled));
            return;
        }
        let stop = {
            let mut predicate = ctx.predicate.lock().unwrap_or_else(|e| e.into_inner());
            predicate()
        };
        if stop {
            self.finish_run(root, Ok(()));
        } else {
            trace!(graph = %root.graph.name, "iteration restarting");
            self.start_topology_local(root);
        }
    }

    fn finish_run(&self, root: &Arc<Topology>, result: Result<(), RunError>) {
        let ctx = &root.ctx;
        debug!(graph = %root.graph.name, ok = result.is_ok(), "run finished");
        let callback = ctx
            .callback
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(callback) = callback {
            callback();
        }
        ctx.promise.resolve(result);
        if ctx.inline_run {
            return;
        }
        // Hand the workflow to its next queued run, if any.
        let next = {
            let mut sched = root.graph.lock_sched();
            sched.active = sched.queue.pop_front();
            sched.active.clone()
        };
        match next {
            Some(topo) => self.start_topology_local(&topo),
            None => {
                self.inner.num_active_graphs.fetch_sub(1, Ordering::AcqRel);
            }
        }
        self.inner.num_topologies.fetch_sub(1, Ordering::AcqRel);
        self.inner.signal_done();
    }

    /// Arm a topology and push its sources onto the local deque.
    pub(crate) fn start_topology_local(&self, topo: &Arc<Topology>) {
        topo.reset_iteration();
        for &src in topo.sources.iter() {
            self.push_job(Job::Node {
                topo: topo.clone(),
                idx: src,
            });
        }
    }

    /// Keep executing other work on this stack until the condition holds.
    pub(crate) fn corun_until(&self, mut condition: impl FnMut() -> bool) {
        while !condition() {
            match self.next_job() {
                Some(job) => self.execute(job),
                None => thread::yield_now(),
            }
        }
    }

    /// Compile and drive one iteration of `graph` on this worker's stack.
    pub(crate) fn corun_graph(&self, graph: &Arc<GraphInner>) -> Result<(), RunError> {
        if graph.num_nodes() == 0 {
            return Ok(());
        }
        let ctx = RunCtx::new(Arc::downgrade(&self.inner), Box::new(|| true), true);
        let topo = Topology::compile(graph.clone(), ctx.clone())?;
        ctx.set_root(&topo);
        let future: RunFuture = TaskFuture::new(ctx.promise.clone(), CancelHook::None);
        self.start_topology_local(&topo);
        self.corun_until(|| future.is_ready());
        future.get()
    }

    /// Run caller-scoped jobs on the pool and join them before returning.
    ///
    /// The jobs may borrow the caller's stack: the lifetime is erased, which
    /// is sound because this function does not return until every job has
    /// finished (job panics are captured, counted, and re-thrown here; jobs
    /// executed while helping are caught by their own `invoke`/`Call`
    /// wrappers and cannot unwind through this frame).
    pub(crate) fn corun_scoped<'s>(
        &self,
        jobs: Vec<Box<dyn FnOnce(&WorkerLocal) + Send + 's>>,
    ) {
        if jobs.is_empty() {
            return;
        }
        let latch = Arc::new(AtomicUsize::new(jobs.len()));
        let panic_slot: Arc<Mutex<Option<Box<dyn Any + Send>>>> = Arc::new(Mutex::new(None));
        for job in jobs {
            // SAFETY: The erased borrow outlives the jobs because the latch
            // below is joined before this frame returns.
            let job: Box<dyn FnOnce(&WorkerLocal) + Send + 'static> =
                unsafe { std::mem::transmute(job) };
            let latch = latch.clone();
            let panic_slot = panic_slot.clone();
            self.push_job(Job::Call(Box::new(move |worker| {
                if let Err(payload) = catch_unwind(AssertUnwindSafe(|| job(worker))) {
                    let mut slot = panic_slot.lock().unwrap_or_else(|e| e.into_inner());
                    if slot.is_none() {
                        *slot = Some(payload);
                    }
                }
                latch.fetch_sub(1, Ordering::AcqRel);
            })));
        }
        self.corun_until(|| latch.load(Ordering::Acquire) == 0);
        let payload = panic_slot.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(payload) = payload {
            std::panic::resume_unwind(payload);
        }
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}

/// In-task scheduling handle passed to runtime tasks.
///
/// Lets a task push extra work onto its own worker, run whole workflows
/// cooperatively on its stack, and spawn executor-level asyncs whose
/// completion the task implicitly waits for.
pub struct Runtime<'w> {
    worker: &'w WorkerLocal,
    topo: &'w Arc<Topology>,
    latch: Arc<AtomicUsize>,
}

impl Runtime<'_> {
    /// Index of the worker executing this task.
    pub fn worker_id(&self) -> usize {
        self.worker.id
    }

    /// Force-schedule another task of the same workflow this iteration,
    /// regardless of its remaining predecessors. The task must belong to
    /// the workflow this task was submitted from.
    pub fn schedule(&mut self, task: &crate::builder::Task) {
        assert!(
            Arc::ptr_eq(task.graph_ref(), &self.topo.graph),
            "Runtime::schedule: task belongs to a different workflow"
        );
        let idx = task.index();
        assert!(
            (idx as usize) < self.topo.slots.len(),
            "Runtime::schedule: task was emplaced after this run was submitted"
        );
        let slot = &self.topo.slots[idx as usize];
        slot.seen_real.store(true, Ordering::Release);
        self.topo.pending.fetch_add(1, Ordering::AcqRel);
        self.topo.ctx.pending.fetch_add(1, Ordering::AcqRel);
        self.worker.push_job(Job::Node {
            topo: self.topo.clone(),
            idx,
        });
    }

    /// Run one iteration of `workflow` on this worker's stack, helping with
    /// other pool work while waiting.
    pub fn corun(&mut self, workflow: &Workflow) -> Result<(), RunError> {
        self.worker.corun_graph(workflow.graph_ref())
    }

    /// Wait for every async spawned through this handle, executing other
    /// work meanwhile. Also performed implicitly when the task body returns.
    pub fn corun_all(&mut self) {
        let latch = self.latch.clone();
        self.worker
            .corun_until(|| latch.load(Ordering::Acquire) == 0);
    }

    /// Spawn a fire-and-forget callable; a panic in it fails the run.
    pub fn silent_async<F>(&mut self, body: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let ctx = self.topo.ctx.clone();
        self.latch.fetch_add(1, Ordering::AcqRel);
        let latch = self.latch.clone();
        self.worker.push_job(Job::Call(Box::new(move |_worker| {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(body)) {
                ctx.store_error(RunError::TaskPanicked {
                    message: panic_message(payload.as_ref()),
                });
            }
            latch.fetch_sub(1, Ordering::AcqRel);
        })));
    }

    /// Spawn a callable returning a value; the future resolves when it ran.
    pub fn async_task<F, T>(&mut self, body: F) -> TaskFuture<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Clone + Send + 'static,
    {
        let shared = Shared::new();
        self.latch.fetch_add(1, Ordering::AcqRel);
        let latch = self.latch.clone();
        let job_shared = shared.clone();
        self.worker.push_job(Job::Call(Box::new(move |_worker| {
            match catch_unwind(AssertUnwindSafe(body)) {
                Ok(value) => job_shared.resolve(Ok(value)),
                Err(payload) => job_shared.resolve(Err(RunError::TaskPanicked {
                    message: panic_message(payload.as_ref()),
                })),
            }
            latch.fetch_sub(1, Ordering::AcqRel);
        })));
        TaskFuture::new(shared, CancelHook::None)
    }

    pub(crate) fn worker(&self) -> &WorkerLocal {
        self.worker
    }

    pub(crate) fn run_ctx(&self) -> &Arc<RunCtx> {
        &self.topo.ctx
    }
}

/// Work-stealing executor driving workflows on a fixed set of worker
/// threads.
///
/// Dropping the executor waits for all outstanding work, then joins the
/// workers.
pub struct Executor {
    inner: Arc<Inner>,
    threads: Vec<JoinHandle<()>>,
}

impl Default for Executor {
    fn default() -> Self {
        Self::new()
    }
}

impl Executor {
    /// Executor with one worker per available hardware thread.
    ///
    /// Panics if worker threads cannot be spawned; use
    /// [`try_with_workers`](Self::try_with_workers) to handle that.
    pub fn new() -> Self {
        let workers = thread::available_parallelism().map_or(1, |n| n.get());
        Self::try_with_workers(workers).expect("failed to spawn worker threads")
    }

    /// Executor with exactly `num_workers` workers (at least one).
    pub fn try_with_workers(num_workers: usize) -> io::Result<Self> {
        let num_workers = num_workers.max(1);
        let mut owners = Vec::with_capacity(num_workers);
        let mut stealers = Vec::with_capacity(num_workers);
        for _ in 0..num_workers {
            let (owner, stealer) = ws_deque(INITIAL_DEQUE_CAPACITY);
            owners.push(owner);
            stealers.push(stealer);
        }
        let inner = Arc::new(Inner {
            stealers: stealers.into_boxed_slice(),
            injector: Mutex::new(VecDeque::new()),
            notifier: Notifier::new(),
            shutdown: AtomicBool::new(false),
            outstanding: AtomicUsize::new(0),
            num_topologies: AtomicUsize::new(0),
            num_active_graphs: AtomicUsize::new(0),
            done: Mutex::new(()),
            done_cv: Condvar::new(),
            observers: RwLock::new(Vec::new()),
            has_observers: AtomicBool::new(false),
            num_workers,
        });
        let mut threads = Vec::with_capacity(num_workers);
        for (id, deque) in owners.into_iter().enumerate() {
            let worker = WorkerLocal {
                id,
                deque,
                rng: RefCell::new(SmallRng::seed_from_u64(
                    0x9e37_79b9_7f4a_7c15 ^ id as u64,
                )),
                inner: inner.clone(),
            };
            let spawned = thread::Builder::new()
                .name(format!("taskdag-worker-{id}"))
                .spawn(move || worker_main(worker));
            match spawned {
                Ok(handle) => threads.push(handle),
                Err(error) => {
                    inner.shutdown.store(true, Ordering::Release);
                    inner.notifier.notify(true);
                    for handle in threads {
                        let _ = handle.join();
                    }
                    return Err(error);
                }
            }
        }
        debug!(num_workers, "executor started");
        Ok(Self { inner, threads })
    }

    /// Run one iteration of the workflow.
    pub fn run(&self, workflow: &Workflow) -> RunFuture {
        self.run_until(workflow, || true)
    }

    /// Run `n` iterations of the workflow.
    pub fn run_n(&self, workflow: &Workflow, n: usize) -> RunFuture {
        if n == 0 {
            return TaskFuture::ready(Ok(()));
        }
        let mut left = n;
        self.run_until(workflow, move || {
            left -= 1;
            left == 0
        })
    }

    /// Run iterations until `stop` returns true. The predicate is evaluated
    /// after each completed iteration.
    pub fn run_until<P>(&self, workflow: &Workflow, stop: P) -> RunFuture
    where
        P: FnMut() -> bool + Send + 'static,
    {
        self.submit(workflow.graph_ref().clone(), Box::new(stop), None)
    }

    /// Run one iteration of an owned workflow; the executor keeps the graph
    /// alive for the duration of the run.
    pub fn run_owned(&self, workflow: Workflow) -> RunFuture {
        self.run(&workflow)
    }

    /// Run `n` iterations of an owned workflow.
    pub fn run_owned_n(&self, workflow: Workflow, n: usize) -> RunFuture {
        self.run_n(&workflow, n)
    }

    /// Run one iteration, invoking `callback` when the run finishes (before
    /// the future resolves), whether it succeeded or not.
    pub fn run_then<C>(&self, workflow: &Workflow, callback: C) -> RunFuture
    where
        C: FnOnce() + Send + 'static,
    {
        self.submit(
            workflow.graph_ref().clone(),
            Box::new(|| true),
            Some(Box::new(callback)),
        )
    }

    fn submit(
        &self,
        graph: Arc<GraphInner>,
        predicate: Box<dyn FnMut() -> bool + Send>,
        callback: Option<Box<dyn FnOnce() + Send>>,
    ) -> RunFuture {
        if graph.num_nodes() == 0 {
            if let Some(callback) = callback {
                callback();
            }
            return TaskFuture::ready(Ok(()));
        }
        let ctx = RunCtx::new(Arc::downgrade(&self.inner), predicate, false);
        let topo = match Topology::compile(graph.clone(), ctx.clone()) {
            Ok(topo) => topo,
            Err(error) => {
                debug!(graph = %graph.name, %error, "submission rejected");
                if let Some(callback) = callback {
                    callback();
                }
                return TaskFuture::ready(Err(error));
            }
        };
        ctx.set_root(&topo);
        if let Some(callback) = callback {
            *ctx.callback.lock().unwrap_or_else(|e| e.into_inner()) = Some(callback);
        }
        self.inner.num_topologies.fetch_add(1, Ordering::AcqRel);
        let start_now = {
            let mut sched = graph.lock_sched();
            if sched.active.is_some() {
                sched.queue.push_back(topo.clone());
                false
            } else {
                sched.active = Some(topo.clone());
                true
            }
        };
        if start_now {
            self.inner.num_active_graphs.fetch_add(1, Ordering::AcqRel);
            self.inner.start_topology(&topo);
        } else {
            trace!(graph = %graph.name, "run queued behind active run");
        }
        TaskFuture::new(ctx.promise.clone(), CancelHook::Ctx(ctx))
    }

    /// Spawn a standalone callable and get a future for its result.
    pub fn async_task<F, T>(&self, body: F) -> TaskFuture<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Clone + Send + 'static,
    {
        let shared = Shared::new();
        let flag = Arc::new(AtomicBool::new(false));
        self.inner.outstanding.fetch_add(1, Ordering::AcqRel);
        let inner = self.inner.clone();
        let job_shared = shared.clone();
        let job_flag = flag.clone();
        self.inner.inject(Job::Call(Box::new(move |_worker| {
            if job_flag.load(Ordering::Acquire) {
                job_shared.resolve(Err(RunError::Canceled));
            } else {
                match catch_unwind(AssertUnwindSafe(body)) {
                    Ok(value) => job_shared.resolve(Ok(value)),
                    Err(payload) => job_shared.resolve(Err(RunError::TaskPanicked {
                        message: panic_message(payload.as_ref()),
                    })),
                }
            }
            inner.finish_outstanding();
        })));
        TaskFuture::new(shared, CancelHook::Flag(flag))
    }

    /// Spawn a fire-and-forget callable. Panics in it are logged and
    /// swallowed.
    pub fn silent_async<F>(&self, body: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner.outstanding.fetch_add(1, Ordering::AcqRel);
        let inner = self.inner.clone();
        self.inner.inject(Job::Call(Box::new(move |_worker| {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(body)) {
                warn!(
                    message = %panic_message(payload.as_ref()),
                    "silent_async task panicked"
                );
            }
            inner.finish_outstanding();
        })));
    }

    /// Block until every submitted run and async task has finished.
    pub fn wait_for_all(&self) {
        let mut guard = self.inner.done.lock().unwrap_or_else(|e| e.into_inner());
        while self.inner.num_topologies.load(Ordering::Acquire) > 0
            || self.inner.outstanding.load(Ordering::Acquire) > 0
        {
            guard = self
                .inner
                .done_cv
                .wait(guard)
                .unwrap_or_else(|e| e.into_inner());
        }
    }

    /// Register an observer notified around every task body execution.
    pub fn observe(&self, observer: Arc<dyn Observer>) {
        self.inner
            .observers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(observer);
        self.inner.has_observers.store(true, Ordering::Release);
    }

    pub fn num_workers(&self) -> usize {
        self.inner.num_workers
    }

    /// Root runs submitted and not yet finished.
    pub fn num_topologies(&self) -> usize {
        self.inner.num_topologies.load(Ordering::Acquire)
    }

    /// Workflows with a currently executing run.
    pub fn num_taskflows(&self) -> usize {
        self.inner.num_active_graphs.load(Ordering::Acquire)
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        self.wait_for_all();
        self.inner.shutdown.store(true, Ordering::Release);
        self.inner.notifier.notify(true);
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
        debug!("executor stopped");
    }
}
