//! Token pipelines: linear stage chains over a fixed number of lines.
//!
//! A pipeline with `L` lines processes up to `L` tokens concurrently; token
//! `t` runs on line `t % L`. Serial pipes admit tokens strictly in order
//! through a gate (a cursor plus parked tokens); parallel pipes admit any
//! token whose previous pipe finished. A parked token releases its worker,
//! so pipelines of any width run on pools of any size.

use crate::builder::Workflow;
use crate::error::RunError;
use crate::executor::{Job, WorkerLocal, panic_message};
use crate::topology::RunCtx;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeKind {
    /// Processes tokens one at a time, in token order.
    Serial,
    /// Processes any ready token, up to one per line.
    Parallel,
}

/// Per-invocation view passed to pipe callables.
pub struct Pipeflow {
    line: usize,
    pipe: usize,
    token: usize,
    stopped: bool,
}

impl Pipeflow {
    /// Line this token is processed on.
    pub fn line(&self) -> usize {
        self.line
    }

    /// Index of the pipe currently running.
    pub fn pipe(&self) -> usize {
        self.pipe
    }

    /// Token number, counted from zero.
    pub fn token(&self) -> usize {
        self.token
    }

    /// Stop the pipeline: this token and all later ones are not produced.
    /// Only honored in the first pipe.
    pub fn stop(&mut self) {
        self.stopped = true;
    }
}

/// One stage of a [`Pipeline`].
pub struct Pipe {
    kind: PipeKind,
    call: Box<dyn Fn(&mut Pipeflow) + Send + Sync>,
}

impl Pipe {
    pub fn new<F>(kind: PipeKind, call: F) -> Self
    where
        F: Fn(&mut Pipeflow) + Send + Sync + 'static,
    {
        Self {
            kind,
            call: Box::new(call),
        }
    }

    pub fn serial<F>(call: F) -> Self
    where
        F: Fn(&mut Pipeflow) + Send + Sync + 'static,
    {
        Self::new(PipeKind::Serial, call)
    }

    pub fn parallel<F>(call: F) -> Self
    where
        F: Fn(&mut Pipeflow) + Send + Sync + 'static,
    {
        Self::new(PipeKind::Parallel, call)
    }
}

/// Token-order cursor of one serial pipe.
struct Gate {
    state: Mutex<GateState>,
}

struct GateState {
    /// Token currently allowed through.
    next: usize,
    /// Tokens that arrived out of turn.
    waiters: Vec<usize>,
}

impl Gate {
    fn new() -> Self {
        Self {
            state: Mutex::new(GateState {
                next: 0,
                waiters: Vec::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, GateState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Whether `token` may proceed now; parks it otherwise.
    fn try_enter(&self, token: usize) -> bool {
        let mut state = self.lock();
        if state.next == token {
            true
        } else {
            state.waiters.push(token);
            false
        }
    }

    /// Open the gate for the next token, unparking it if it already arrived.
    fn advance(&self) -> Option<usize> {
        let mut state = self.lock();
        state.next += 1;
        let next = state.next;
        state
            .waiters
            .iter()
            .position(|&t| t == next)
            .map(|i| state.waiters.swap_remove(i))
    }
}

struct PipelineState {
    lines: usize,
    pipes: Arc<Vec<Pipe>>,
    /// One gate per serial pipe.
    gates: Vec<Option<Gate>>,
    /// First token not produced; everything at or past it drains.
    stop_at: AtomicUsize,
    produced: AtomicUsize,
    /// In-flight tokens; the run completes at zero.
    alive: AtomicUsize,
    ctx: Arc<RunCtx>,
}

impl PipelineState {
    fn finish_token(&self) {
        self.alive.fetch_sub(1, Ordering::AcqRel);
    }

    fn run_failed(&self) -> bool {
        self.ctx.error.get().is_some() || self.ctx.is_cancelled()
    }

    fn spawn(self: &Arc<Self>, worker: &WorkerLocal, token: usize, pipe: usize, entered: bool) {
        let state = self.clone();
        worker.push_job(Job::Call(Box::new(move |w| {
            drive(&state, w, token, pipe, entered);
        })));
    }
}

/// Push token `token` through the pipes starting at `pipe`. `entered` marks
/// a token woken by a gate it already passed.
///
/// Protocol invariant: every spawned token enters the first pipe's gate
/// exactly once and every gate it enters is advanced exactly once, so token
/// order cursors never stall; a completed token always spawns its line's
/// next token, which drains via the stop check if the pipeline stopped.
fn drive(state: &Arc<PipelineState>, worker: &WorkerLocal, token: usize, pipe: usize, entered: bool) {
    let mut pipe = pipe;
    let mut entered = entered;
    loop {
        if pipe == state.pipes.len() {
            state.spawn(worker, token + state.lines, 0, false);
            return;
        }
        let gate = state.gates[pipe].as_ref();
        if let Some(gate) = gate {
            if !entered && !gate.try_enter(token) {
                return;
            }
        }
        entered = false;
        if pipe == 0 && (state.stop_at.load(Ordering::Acquire) <= token || state.run_failed()) {
            if let Some(gate) = gate {
                if let Some(woken) = gate.advance() {
                    state.spawn(worker, woken, pipe, true);
                }
            }
            state.finish_token();
            return;
        }
        let mut flow = Pipeflow {
            line: token % state.lines,
            pipe,
            token,
            stopped: false,
        };
        if !state.run_failed() {
            if let Err(payload) =
                catch_unwind(AssertUnwindSafe(|| (state.pipes[pipe].call)(&mut flow)))
            {
                state.ctx.store_error(RunError::TaskPanicked {
                    message: panic_message(payload.as_ref()),
                });
                state.stop_at.fetch_min(token, Ordering::AcqRel);
                flow.stopped = true;
            }
        }
        let stopped = pipe == 0 && flow.stopped;
        if pipe == 0 {
            if flow.stopped {
                state.stop_at.fetch_min(token, Ordering::AcqRel);
            } else {
                state.produced.fetch_add(1, Ordering::AcqRel);
            }
        }
        if let Some(gate) = gate {
            if let Some(woken) = gate.advance() {
                state.spawn(worker, woken, pipe, true);
            }
        }
        if stopped {
            state.finish_token();
            return;
        }
        pipe += 1;
    }
}

/// A stage chain composable into workflows via
/// [`composed_of`](crate::FlowBuilder::composed_of).
///
/// The first pipe must be serial; it is the token source and the only pipe
/// whose [`Pipeflow::stop`] is honored.
pub struct Pipeline {
    workflow: Workflow,
    num_lines: usize,
    num_pipes: usize,
    num_tokens: Arc<AtomicUsize>,
}

impl Pipeline {
    pub fn new(num_lines: usize, pipes: Vec<Pipe>) -> Self {
        assert!(num_lines > 0, "a pipeline needs at least one line");
        assert!(!pipes.is_empty(), "a pipeline needs at least one pipe");
        assert!(
            pipes[0].kind == PipeKind::Serial,
            "the first pipe must be serial"
        );
        let num_pipes = pipes.len();
        let pipes = Arc::new(pipes);
        let num_tokens = Arc::new(AtomicUsize::new(0));
        let workflow = Workflow::named("pipeline");
        let counter = num_tokens.clone();
        let task = workflow.emplace_runtime(move |rt| {
            let state = Arc::new(PipelineState {
                lines: num_lines,
                pipes: pipes.clone(),
                gates: pipes
                    .iter()
                    .map(|pipe| (pipe.kind == PipeKind::Serial).then(Gate::new))
                    .collect(),
                stop_at: AtomicUsize::new(usize::MAX),
                produced: AtomicUsize::new(0),
                alive: AtomicUsize::new(num_lines),
                ctx: rt.run_ctx().clone(),
            });
            for token in 0..num_lines {
                state.spawn(rt.worker(), token, 0, false);
            }
            let alive = &state.alive;
            rt.worker()
                .corun_until(|| alive.load(Ordering::Acquire) == 0);
            counter.store(state.produced.load(Ordering::Acquire), Ordering::Release);
        });
        task.name("pipeline");
        Self {
            workflow,
            num_lines,
            num_pipes,
            num_tokens,
        }
    }

    /// Workflow wrapping the pipeline, for composition.
    pub fn workflow(&self) -> &Workflow {
        &self.workflow
    }

    pub fn num_lines(&self) -> usize {
        self.num_lines
    }

    pub fn num_pipes(&self) -> usize {
        self.num_pipes
    }

    /// Tokens produced by the last completed run.
    pub fn num_tokens(&self) -> usize {
        self.num_tokens.load(Ordering::Acquire)
    }
}

enum DataPipeCall<D> {
    /// First pipe: produces tokens, `None` stops the pipeline.
    Source(Box<dyn Fn(&mut Pipeflow) -> Option<D> + Send + Sync>),
    /// Later pipes: transform the token's value.
    Stage(Box<dyn Fn(&mut Pipeflow, D) -> D + Send + Sync>),
}

/// One stage of a [`DataPipeline`].
pub struct DataPipe<D> {
    kind: PipeKind,
    call: DataPipeCall<D>,
}

impl<D> DataPipe<D> {
    /// The token source; always serial.
    pub fn serial_source<F>(call: F) -> Self
    where
        F: Fn(&mut Pipeflow) -> Option<D> + Send + Sync + 'static,
    {
        Self {
            kind: PipeKind::Serial,
            call: DataPipeCall::Source(Box::new(call)),
        }
    }

    pub fn serial<F>(call: F) -> Self
    where
        F: Fn(&mut Pipeflow, D) -> D + Send + Sync + 'static,
    {
        Self {
            kind: PipeKind::Serial,
            call: DataPipeCall::Stage(Box::new(call)),
        }
    }

    pub fn parallel<F>(call: F) -> Self
    where
        F: Fn(&mut Pipeflow, D) -> D + Send + Sync + 'static,
    {
        Self {
            kind: PipeKind::Parallel,
            call: DataPipeCall::Stage(Box::new(call)),
        }
    }
}

/// Token-order cursor of a serial stage; parked tokens keep their value.
struct DataGate<D> {
    state: Mutex<DataGateState<D>>,
}

struct DataGateState<D> {
    next: usize,
    waiters: Vec<(usize, Option<D>)>,
}

enum TryEnter<D> {
    Entered(Option<D>),
    Parked,
}

impl<D> DataGate<D> {
    fn new() -> Self {
        Self {
            state: Mutex::new(DataGateState {
                next: 0,
                waiters: Vec::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, DataGateState<D>> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn try_enter(&self, token: usize, value: Option<D>) -> TryEnter<D> {
        let mut state = self.lock();
        if state.next == token {
            TryEnter::Entered(value)
        } else {
            state.waiters.push((token, value));
            TryEnter::Parked
        }
    }

    fn advance(&self) -> Option<(usize, Option<D>)> {
        let mut state = self.lock();
        state.next += 1;
        let next = state.next;
        state
            .waiters
            .iter()
            .position(|(t, _)| *t == next)
            .map(|i| state.waiters.swap_remove(i))
    }
}

struct DataState<D> {
    lines: usize,
    pipes: Arc<Vec<DataPipe<D>>>,
    source_gate: Gate,
    /// One gate per serial stage pipe; entry 0 is unused (the source has
    /// its own token-only gate).
    gates: Vec<Option<DataGate<D>>>,
    stop_at: AtomicUsize,
    produced: AtomicUsize,
    alive: AtomicUsize,
    ctx: Arc<RunCtx>,
}

impl<D: Send + 'static> DataState<D> {
    fn finish_token(&self) {
        self.alive.fetch_sub(1, Ordering::AcqRel);
    }

    fn run_failed(&self) -> bool {
        self.ctx.error.get().is_some() || self.ctx.is_cancelled()
    }

    fn spawn_source(self: &Arc<Self>, worker: &WorkerLocal, token: usize, entered: bool) {
        let state = self.clone();
        worker.push_job(Job::Call(Box::new(move |w| {
            drive_source(&state, w, token, entered);
        })));
    }

    fn spawn_stage(
        self: &Arc<Self>,
        worker: &WorkerLocal,
        token: usize,
        pipe: usize,
        value: Option<D>,
    ) {
        let state = self.clone();
        worker.push_job(Job::Call(Box::new(move |w| {
            drive_stages(&state, w, token, pipe, value, true);
        })));
    }
}

fn drive_source<D: Send + 'static>(
    state: &Arc<DataState<D>>,
    worker: &WorkerLocal,
    token: usize,
    entered: bool,
) {
    if !entered && !state.source_gate.try_enter(token) {
        return;
    }
    if state.stop_at.load(Ordering::Acquire) <= token || state.run_failed() {
        if let Some(woken) = state.source_gate.advance() {
            state.spawn_source(worker, woken, true);
        }
        state.finish_token();
        return;
    }
    let mut flow = Pipeflow {
        line: token % state.lines,
        pipe: 0,
        token,
        stopped: false,
    };
    let DataPipeCall::Source(source) = &state.pipes[0].call else {
        unreachable!("the first data pipe is always a source");
    };
    let value = match catch_unwind(AssertUnwindSafe(|| source(&mut flow))) {
        Ok(Some(value)) => {
            state.produced.fetch_add(1, Ordering::AcqRel);
            Some(value)
        }
        Ok(None) => {
            state.stop_at.fetch_min(token, Ordering::AcqRel);
            None
        }
        Err(payload) => {
            state.ctx.store_error(RunError::TaskPanicked {
                message: panic_message(payload.as_ref()),
            });
            state.stop_at.fetch_min(token, Ordering::AcqRel);
            None
        }
    };
    if let Some(woken) = state.source_gate.advance() {
        state.spawn_source(worker, woken, true);
    }
    match value {
        Some(value) => drive_stages(state, worker, token, 1, Some(value), false),
        None => state.finish_token(),
    }
}

/// Same gate protocol as [`drive`]; the token's value rides along and is
/// dropped (with the stage skipped) once the run has failed.
fn drive_stages<D: Send + 'static>(
    state: &Arc<DataState<D>>,
    worker: &WorkerLocal,
    token: usize,
    pipe: usize,
    value: Option<D>,
    entered: bool,
) {
    let mut pipe = pipe;
    let mut value = value;
    let mut entered = entered;
    loop {
        if pipe == state.pipes.len() {
            drop(value);
            state.spawn_source(worker, token + state.lines, false);
            return;
        }
        if let Some(gate) = state.gates[pipe].as_ref() {
            if !entered {
                match gate.try_enter(token, value) {
                    TryEnter::Entered(v) => value = v,
                    TryEnter::Parked => return,
                }
            }
        }
        entered = false;
        if !state.run_failed() {
            if let Some(input) = value.take() {
                let mut flow = Pipeflow {
                    line: token % state.lines,
                    pipe,
                    token,
                    stopped: false,
                };
                let DataPipeCall::Stage(stage) = &state.pipes[pipe].call else {
                    unreachable!("data pipes past the first are always stages");
                };
                match catch_unwind(AssertUnwindSafe(move || stage(&mut flow, input))) {
                    Ok(output) => value = Some(output),
                    Err(payload) => {
                        state.ctx.store_error(RunError::TaskPanicked {
                            message: panic_message(payload.as_ref()),
                        });
                        state.stop_at.fetch_min(token, Ordering::AcqRel);
                    }
                }
            }
        } else {
            value = None;
        }
        if let Some(gate) = state.gates[pipe].as_ref() {
            if let Some((woken, woken_value)) = gate.advance() {
                state.spawn_stage(worker, woken, pipe, woken_value);
            }
        }
        pipe += 1;
    }
}

/// A [`Pipeline`] whose tokens carry a value of type `D` from stage to
/// stage. The first pipe produces values and stops the pipeline by
/// returning `None`.
pub struct DataPipeline<D> {
    workflow: Workflow,
    num_lines: usize,
    num_pipes: usize,
    num_tokens: Arc<AtomicUsize>,
    _marker: std::marker::PhantomData<fn() -> D>,
}

impl<D: Send + 'static> DataPipeline<D> {
    pub fn new(num_lines: usize, pipes: Vec<DataPipe<D>>) -> Self {
        assert!(num_lines > 0, "a pipeline needs at least one line");
        assert!(
            matches!(
                pipes.first(),
                Some(DataPipe {
                    kind: PipeKind::Serial,
                    call: DataPipeCall::Source(_),
                })
            ),
            "the first data pipe must be a serial source"
        );
        assert!(
            pipes[1..]
                .iter()
                .all(|pipe| matches!(pipe.call, DataPipeCall::Stage(_))),
            "data pipes past the first must be stages"
        );
        let num_pipes = pipes.len();
        let pipes = Arc::new(pipes);
        let num_tokens = Arc::new(AtomicUsize::new(0));
        let workflow = Workflow::named("data_pipeline");
        let counter = num_tokens.clone();
        let task = workflow.emplace_runtime(move |rt| {
            let state = Arc::new(DataState {
                lines: num_lines,
                pipes: pipes.clone(),
                source_gate: Gate::new(),
                gates: pipes
                    .iter()
                    .enumerate()
                    .map(|(i, pipe)| {
                        (i > 0 && pipe.kind == PipeKind::Serial).then(DataGate::new)
                    })
                    .collect(),
                stop_at: AtomicUsize::new(usize::MAX),
                produced: AtomicUsize::new(0),
                alive: AtomicUsize::new(num_lines),
                ctx: rt.run_ctx().clone(),
            });
            for token in 0..num_lines {
                state.spawn_source(rt.worker(), token, false);
            }
            let alive = &state.alive;
            rt.worker()
                .corun_until(|| alive.load(Ordering::Acquire) == 0);
            counter.store(state.produced.load(Ordering::Acquire), Ordering::Release);
        });
        task.name("data_pipeline");
        Self {
            workflow,
            num_lines,
            num_pipes,
            num_tokens,
            _marker: std::marker::PhantomData,
        }
    }

    /// Workflow wrapping the pipeline, for composition.
    pub fn workflow(&self) -> &Workflow {
        &self.workflow
    }

    pub fn num_lines(&self) -> usize {
        self.num_lines
    }

    pub fn num_pipes(&self) -> usize {
        self.num_pipes
    }

    /// Tokens produced by the last completed run.
    pub fn num_tokens(&self) -> usize {
        self.num_tokens.load(Ordering::Acquire)
    }
}
