//! Pipeline scheduler: stages, adaptors, and the run loop.
//!
//! The pipeline splits the task graph into stages, compiles one plan per
//! stage, and connects adjacent stages with an adaptor. Every `exec` call
//! runs each stage thread in a scoped thread:
//!
//! ```text
//! stage 0 (1 thread)    stage 1 (n threads)     stage 2 (1 thread)
//! [source] ─► OneToN ─► [relay] × n ─► NToOne ─► [sink]
//! ```
//!
//! While adaptors are bound, the bindings that cross a stage boundary are
//! removed from the graph; `unbind_adaptors` puts them back.

use crate::pipeline::adaptor::{Adaptor, ChannelSpec, Topology};
use crate::pipeline::compiled_plan::CompiledPlan;
use crate::pipeline::compiler::PipelineCompiler;
use crate::pipeline::error::{panic_message, PipelineError, PipelineResult};
use crate::pipeline::graph::Graph;
use crate::pipeline::id::{SocketId, TaskId};
use crate::pipeline::pinning::{self, PinningPolicy, Placement};
use crate::pipeline::stage::{self, RunContext, Stage, StageReport};
use crate::pipeline::task::TaskState;
use crate::pipeline::worker::Worker;
use std::io::{self, Write};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

/// Where a stage begins and ends in the task graph.
///
/// The stage holds every task reachable from `entries` without walking past
/// `exits`. Empty `exits` walks to the end of the graph.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StageBounds {
    pub entries: Vec<TaskId>,
    pub exits: Vec<TaskId>,
}

impl StageBounds {
    pub fn new(entries: Vec<TaskId>, exits: Vec<TaskId>) -> Self {
        Self { entries, exits }
    }

    /// Stage made of a single task.
    pub fn single(task: TaskId) -> Self {
        Self::new(vec![task], vec![task])
    }
}

/// Per-stage and per-adaptor settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineOptions {
    /// Threads per stage.
    pub n_threads: Vec<usize>,
    /// Slots per endpoint, one entry per adaptor.
    pub buffer_sizes: Vec<usize>,
    /// Spin instead of blocking, one entry per adaptor.
    pub active_waiting: Vec<bool>,
    /// Whether each stage is pinned. Empty means no stage is.
    pub pinning: Vec<bool>,
    /// Pinning policy, see [`PinningPolicy::parse`].
    pub policy: String,
}

impl PipelineOptions {
    /// Options for the given thread counts, with single-slot blocking
    /// adaptors and no pinning.
    pub fn new(n_threads: Vec<usize>) -> Self {
        let n_adaptors = n_threads.len().saturating_sub(1);
        Self {
            buffer_sizes: vec![1; n_adaptors],
            active_waiting: vec![false; n_adaptors],
            pinning: Vec::new(),
            policy: String::new(),
            n_threads,
        }
    }

    pub fn with_buffer_sizes(mut self, buffer_sizes: Vec<usize>) -> Self {
        self.buffer_sizes = buffer_sizes;
        self
    }

    pub fn with_active_waiting(mut self, active_waiting: Vec<bool>) -> Self {
        self.active_waiting = active_waiting;
        self
    }

    pub fn with_pinning(mut self, pinning: Vec<bool>, policy: impl Into<String>) -> Self {
        self.pinning = pinning;
        self.policy = policy.into();
        self
    }

    fn validate(&self, n_stages: usize) -> PipelineResult<()> {
        let check = |what: &str, len: usize, expected: usize| {
            if len == expected {
                Ok(())
            } else {
                Err(PipelineError::Config(format!(
                    "{} {} given for {} stage(s), expected {}",
                    len, what, n_stages, expected
                )))
            }
        };
        if n_stages == 0 {
            return Err(PipelineError::Config("a pipeline needs at least one stage".to_string()));
        }
        check("thread counts", self.n_threads.len(), n_stages)?;
        check("buffer sizes", self.buffer_sizes.len(), n_stages - 1)?;
        check("active waiting flags", self.active_waiting.len(), n_stages - 1)?;
        if !self.pinning.is_empty() {
            check("pinning flags", self.pinning.len(), n_stages)?;
        }

        if let Some(s) = self.n_threads.iter().position(|&t| t == 0) {
            return Err(PipelineError::Config(format!("stage {} has no thread", s)));
        }
        if self.n_threads[0] != 1 {
            return Err(PipelineError::Config(format!(
                "the first stage runs the initial task on one thread, {} requested",
                self.n_threads[0]
            )));
        }
        if let Some(b) = self.n_threads.windows(2).position(|w| w[0] > 1 && w[1] > 1) {
            return Err(PipelineError::Config(format!(
                "stages {} and {} are both multi-threaded; put a single-threaded stage between them",
                b,
                b + 1
            )));
        }
        if let Some(b) = self.buffer_sizes.iter().position(|&s| s == 0) {
            return Err(PipelineError::Config(format!("adaptor {} has a buffer size of 0", b)));
        }
        Ok(())
    }
}

/// Staged multi-threaded executor.
pub struct Pipeline {
    graph: Graph,
    first: TaskId,
    options: PipelineOptions,
    placement: Placement,
    /// Tasks of every stage, in execution order.
    membership: Vec<Vec<TaskId>>,
    /// Stage of every task, indexed by task.
    stage_of: Vec<Option<usize>>,
    /// Values carried by every adaptor, as writer sockets.
    channels: Vec<Vec<SocketId>>,
    /// `(reader, writer)` bindings removed from the graph while bound.
    crossings: Vec<(SocketId, SocketId)>,
    stages: Vec<Stage>,
    adaptors: Vec<Adaptor>,
    bound: bool,
    no_copy: bool,
    n_frames: usize,
    next_frame: u64,
    exhausted: bool,
}

impl Pipeline {
    /// Split `graph` into stages and bind the adaptors between them.
    ///
    /// # Errors
    /// Any configuration, binding, or pinning problem is reported here,
    /// before a thread exists.
    pub fn new(
        graph: Graph,
        first: TaskId,
        stages: Vec<StageBounds>,
        options: PipelineOptions,
    ) -> PipelineResult<Self> {
        options.validate(stages.len())?;

        let policy = PinningPolicy::parse(&options.policy)?;
        let enabled = if options.pinning.is_empty() {
            vec![false; stages.len()]
        } else {
            options.pinning.clone()
        };
        let placement = policy.resolve(&options.n_threads, &enabled, pinning::available_cores())?;

        let (membership, stage_of) = partition(&graph, first, &stages)?;
        let channels = (0..stages.len() - 1)
            .map(|b| crossing_values(&graph, &membership, &stage_of, b))
            .collect::<PipelineResult<Vec<_>>>()?;

        tracing::info!(
            "Pipeline: {} stage(s), threads {:?}, pinning '{}'",
            stages.len(),
            options.n_threads,
            policy
        );

        let mut pipeline = Self {
            graph,
            first,
            options,
            placement,
            membership,
            stage_of,
            channels,
            crossings: Vec::new(),
            stages: Vec::new(),
            adaptors: Vec::new(),
            bound: false,
            no_copy: true,
            n_frames: 1,
            next_frame: 0,
            exhausted: false,
        };
        pipeline.bind_adaptors()?;
        Ok(pipeline)
    }

    // ── Accessors ──

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn first_task(&self) -> TaskId {
        self.first
    }

    pub fn n_stages(&self) -> usize {
        self.membership.len()
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn adaptors(&self) -> &[Adaptor] {
        &self.adaptors
    }

    /// Values carried across the boundary after stage `b`.
    pub fn channels(&self, b: usize) -> &[SocketId] {
        self.channels.get(b).map_or(&[], Vec::as_slice)
    }

    pub fn is_bound(&self) -> bool {
        self.bound
    }

    pub fn is_no_copy_mode(&self) -> bool {
        self.no_copy
    }

    pub fn n_frames(&self) -> usize {
        self.n_frames
    }

    /// Whether the initial task ended its stream.
    pub fn is_done(&self) -> bool {
        self.exhausted
    }

    /// Frames produced by the first stage since the last reset.
    pub fn frames_processed(&self) -> u64 {
        self.next_frame
    }

    /// Task states of every thread of every stage.
    pub fn task_states_mut(&mut self) -> impl Iterator<Item = &mut TaskState> {
        self.stages.iter_mut().flat_map(|s| s.task_states_mut())
    }

    /// Thread count and statistics of every stage.
    pub fn get_stages(&self) -> Vec<StageReport> {
        self.stages.iter().map(Stage::report).collect()
    }

    /// Give the graph back, with every binding restored.
    pub fn into_graph(mut self) -> PipelineResult<Graph> {
        self.unbind_adaptors()?;
        Ok(self.graph)
    }

    // ── Binding ──

    /// Build stage workers and adaptors, then detach the crossing bindings
    /// from the graph. Does nothing when already bound.
    pub fn bind_adaptors(&mut self) -> PipelineResult<()> {
        if self.bound {
            return Ok(());
        }
        let n_stages = self.membership.len();

        let plans = self.compile_plans()?;
        let mut stages = Vec::with_capacity(n_stages);
        for (s, plan) in plans.into_iter().enumerate() {
            let workers = (0..self.options.n_threads[s])
                .map(|_| Worker::new(&self.graph, plan.clone(), self.n_frames))
                .collect::<PipelineResult<Vec<_>>>()?;
            stages.push(Stage::new(
                s,
                self.membership[s].clone(),
                self.placement[s].clone(),
                workers,
            ));
        }

        let mut adaptors = Vec::with_capacity(n_stages.saturating_sub(1));
        for (b, values) in self.channels.iter().enumerate() {
            let specs = values
                .iter()
                .map(|&w| {
                    self.graph
                        .socket_spec(w)
                        .map(|spec| ChannelSpec::new(spec.datatype, spec.n_elmts))
                })
                .collect::<PipelineResult<Vec<_>>>()?;
            let (up, down) = (self.options.n_threads[b], self.options.n_threads[b + 1]);
            let (topology, n_endpoints) = if up == 1 {
                (Topology::OneToN, down)
            } else {
                (Topology::NToOne, up)
            };
            let mut adaptor = Adaptor::new(
                topology,
                n_endpoints,
                specs,
                self.options.buffer_sizes[b],
                self.options.active_waiting[b],
            )?;
            adaptor.set_n_frames(self.n_frames);
            tracing::debug!(
                "Adaptor {}: {:?} x{}, {} channel(s), {} slot(s)",
                b,
                topology,
                n_endpoints,
                values.len(),
                self.options.buffer_sizes[b]
            );
            adaptors.push(adaptor);
        }

        let crossings: Vec<(SocketId, SocketId)> = self
            .graph
            .bindings()
            .into_iter()
            .filter(|&(r, w)| {
                matches!(
                    (self.stage(r.task()), self.stage(w.task())),
                    (Some(sr), Some(sw)) if sr != sw
                )
            })
            .collect();
        for &(r, w) in &crossings {
            self.graph.unbind(r, w)?;
        }

        self.crossings = crossings;
        self.stages = stages;
        self.adaptors = adaptors;
        self.bound = true;
        Ok(())
    }

    /// Put the crossing bindings back and drop stages and adaptors.
    pub fn unbind_adaptors(&mut self) -> PipelineResult<()> {
        if !self.bound {
            return Ok(());
        }
        for &(r, w) in &self.crossings {
            self.graph.bind(r, w)?;
        }
        self.crossings.clear();
        self.stages.clear();
        self.adaptors.clear();
        self.bound = false;
        Ok(())
    }

    fn stage(&self, task: TaskId) -> Option<usize> {
        self.stage_of.get(task.index()).copied().flatten()
    }

    /// One plan per stage. Needs the crossing bindings in the graph.
    fn compile_plans(&mut self) -> PipelineResult<Vec<CompiledPlan>> {
        for &(r, w) in &self.crossings {
            self.graph.bind(r, w)?;
        }
        let n_stages = self.membership.len();
        let plans = (0..n_stages)
            .map(|s| {
                let imports = if s == 0 { &[][..] } else { &self.channels[s - 1][..] };
                let exports = self.channels.get(s).map_or(&[][..], Vec::as_slice);
                let mut plan = PipelineCompiler::compile(
                    &self.graph,
                    &self.membership[s],
                    imports,
                    exports,
                    self.no_copy,
                )?;
                plan.leads_stream = s == 0;
                Ok(plan)
            })
            .collect::<PipelineResult<Vec<_>>>();
        for &(r, w) in &self.crossings {
            self.graph.unbind(r, w)?;
        }
        plans
    }

    // ── Configuration (idle only) ──

    /// Frames batched into one task invocation.
    pub fn set_n_frames(&mut self, n_frames: usize) {
        self.n_frames = n_frames.max(1);
        for stage in &mut self.stages {
            stage.set_n_frames(self.n_frames);
        }
        for adaptor in &mut self.adaptors {
            adaptor.set_n_frames(self.n_frames);
        }
    }

    /// Let forward sockets work in place and hand buffers to adaptors by
    /// exchange instead of copy.
    pub fn set_no_copy_mode(&mut self, no_copy: bool) -> PipelineResult<()> {
        if no_copy == self.no_copy {
            return Ok(());
        }
        self.no_copy = no_copy;
        if self.bound {
            let plans = self.compile_plans()?;
            for (stage, plan) in self.stages.iter_mut().zip(&plans) {
                stage.replace_plan(plan)?;
            }
        }
        Ok(())
    }

    /// Rewind modules, counters, and the frame counter.
    pub fn reset(&mut self) {
        for stage in &mut self.stages {
            stage.reset();
        }
        for adaptor in &mut self.adaptors {
            adaptor.reset();
        }
        self.next_frame = 0;
        self.exhausted = false;
    }

    // ── Execution ──

    /// Run until the initial task ends its stream.
    pub fn exec(&mut self) -> PipelineResult<()> {
        self.run(None)
    }

    /// Run at most `n` invocations of the initial task, then drain.
    pub fn exec_frames(&mut self, n: u64) -> PipelineResult<()> {
        self.run(Some(n))
    }

    fn run(&mut self, frames: Option<u64>) -> PipelineResult<()> {
        if !self.bound {
            return Err(PipelineError::Config(
                "adaptors are unbound; call bind_adaptors before exec".to_string(),
            ));
        }
        if self.exhausted {
            tracing::debug!("Pipeline stream already ended; reset to run again");
            return Ok(());
        }
        for adaptor in &mut self.adaptors {
            adaptor.reset();
        }

        let first_frame = self.next_frame;
        let stop = AtomicBool::new(false);
        let progress = AtomicU64::new(first_frame);
        let ctx = RunContext {
            stop: &stop,
            target: frames.map(|n| first_frame + n),
            swap: self.no_copy,
            progress: &progress,
        };
        let (err_tx, err_rx) = crossbeam_channel::unbounded::<PipelineError>();
        let started = Instant::now();

        let stages = &mut self.stages;
        let adaptors = self.adaptors.as_slice();
        let end = std::thread::scope(|scope| {
            let mut first_stage = None;
            for stage in stages.iter_mut() {
                let s = stage.index();
                let input = s.checked_sub(1).map(|b| &adaptors[b]);
                let output = adaptors.get(s);
                let cores: Vec<Option<usize>> = (0..stage.n_threads()).map(|t| stage.core(t)).collect();

                for (tid, worker) in stage.workers.iter_mut().enumerate() {
                    let core = cores[tid];
                    let err_tx = err_tx.clone();
                    let ctx = &ctx;
                    let handle = scope.spawn(move || {
                        stage::pin(s, tid, core);
                        let result = panic::catch_unwind(AssertUnwindSafe(|| match input {
                            None => stage::run_first(worker, output, first_frame, ctx).map(Some),
                            Some(input) => {
                                stage::run_next(worker, tid, input, output, ctx).map(|()| None)
                            }
                        }))
                        .unwrap_or_else(|payload| {
                            Err(PipelineError::WorkerPanicked {
                                stage: s,
                                message: panic_message(payload.as_ref()),
                            })
                        });

                        result.unwrap_or_else(|e| {
                            tracing::error!("Stage {} thread {} failed: {}", s, tid, e);
                            ctx.stop.store(true, Ordering::Release);
                            for adaptor in adaptors.iter().rev() {
                                adaptor.cancel_waiting();
                            }
                            let _ = err_tx.send(e);
                            None
                        })
                    });
                    if s == 0 {
                        first_stage = Some(handle);
                    }
                }
            }
            first_stage.and_then(|h| h.join().ok()).flatten()
        });
        drop(err_tx);

        match end {
            Some(end) => {
                self.next_frame = end.next_frame;
                self.exhausted = end.exhausted;
            }
            // The first stage failed; keep the frames it did push.
            None => self.next_frame = progress.load(Ordering::Acquire),
        }
        if let Some(e) = err_rx.try_iter().next() {
            return Err(e);
        }

        tracing::info!(
            "Pipeline ran {} frame(s) in {:.3?}{}",
            self.next_frame - first_frame,
            started.elapsed(),
            if self.exhausted { ", stream ended" } else { "" }
        );
        Ok(())
    }

    // ── Diagnostics ──

    /// Write the stages, their tasks, and the adaptor crossings in dot format.
    ///
    /// Crossing bindings are drawn dashed and labelled with the adaptors
    /// they go through.
    pub fn export_dot<W: Write>(&self, out: &mut W) -> io::Result<()> {
        let clusters: Vec<(String, Vec<TaskId>)> = self
            .membership
            .iter()
            .enumerate()
            .map(|(s, tasks)| {
                (
                    format!("Stage {} ({} thread(s))", s, self.options.n_threads[s]),
                    tasks.clone(),
                )
            })
            .collect();

        let extra: Vec<(SocketId, SocketId, String)> = self
            .crossings
            .iter()
            .map(|&(r, w)| {
                let from = self.stage(w.task()).unwrap_or(0);
                let to = self.stage(r.task()).unwrap_or(from);
                let via: Vec<String> = (from..to)
                    .map(|b| match self.adaptors.get(b) {
                        Some(a) => format!("A{} {:?} x{}", b, a.topology(), a.n_endpoints()),
                        None => format!("A{}", b),
                    })
                    .collect();
                (r, w, via.join(", "))
            })
            .collect();

        self.graph.write_dot(out, "Pipeline", &clusters, &extra)
    }
}

/// Stage membership of the tasks reachable from `first`.
///
/// Returns the tasks of every stage in execution order, and the stage of
/// every task of the graph.
fn partition(
    graph: &Graph,
    first: TaskId,
    bounds: &[StageBounds],
) -> PipelineResult<(Vec<Vec<TaskId>>, Vec<Option<usize>>)> {
    let order = graph.topological_order(first)?;
    let reachable = graph.reachable_from(first);
    let mut stage_of: Vec<Option<usize>> = vec![None; graph.n_tasks()];

    for (s, b) in bounds.iter().enumerate() {
        if b.entries.is_empty() {
            return Err(PipelineError::Config(format!("stage {} has no entry task", s)));
        }
        let mut stack = b.entries.clone();
        while let Some(t) = stack.pop() {
            graph.node(t)?;
            if !reachable[t.index()] {
                return Err(PipelineError::Config(format!(
                    "{} (stage {}) is not reachable from {}",
                    graph.task_label(t),
                    s,
                    graph.task_label(first)
                )));
            }
            match stage_of[t.index()] {
                Some(other) if other == s => continue,
                Some(other) => {
                    return Err(PipelineError::Config(format!(
                        "{} belongs to stages {} and {}",
                        graph.task_label(t),
                        other,
                        s
                    )))
                }
                None => stage_of[t.index()] = Some(s),
            }
            if !b.exits.contains(&t) {
                stack.extend(graph.successors(t));
            }
        }
    }

    if stage_of[first.index()] != Some(0) {
        return Err(PipelineError::Config(format!(
            "the initial task {} must be in the first stage",
            graph.task_label(first)
        )));
    }
    if let Some(&t) = order.iter().find(|t| stage_of[t.index()].is_none()) {
        return Err(PipelineError::Config(format!(
            "{} belongs to no stage",
            graph.task_label(t)
        )));
    }
    for (r, w) in graph.bindings() {
        if let (Some(sr), Some(sw)) = (stage_of[r.task().index()], stage_of[w.task().index()]) {
            if sw > sr {
                return Err(PipelineError::Config(format!(
                    "{} (stage {}) reads {} from a later stage ({})",
                    graph.socket_label(r),
                    sr,
                    graph.socket_label(w),
                    sw
                )));
            }
        }
    }

    let membership = (0..bounds.len())
        .map(|s| {
            order
                .iter()
                .copied()
                .filter(|t| stage_of[t.index()] == Some(s))
                .collect()
        })
        .collect();
    Ok((membership, stage_of))
}

/// Writer sockets of stages `<= b` read by a stage `> b`, in execution order.
fn crossing_values(
    graph: &Graph,
    membership: &[Vec<TaskId>],
    stage_of: &[Option<usize>],
    b: usize,
) -> PipelineResult<Vec<SocketId>> {
    let after = |t: TaskId| stage_of[t.index()].is_some_and(|s| s > b);
    let mut values = Vec::new();
    for &task in membership[..=b].iter().flatten() {
        let node = graph.node(task)?;
        for (i, spec) in node.sockets.iter().enumerate() {
            let writer = task.socket(i as u16);
            if spec.direction.is_writer()
                && graph.readers_of(writer).iter().any(|r| after(r.task()))
            {
                values.push(writer);
            }
        }
    }
    Ok(values)
}
