//! One pipeline stage: a slice of the task graph and its worker threads.
//!
//! A stage owns one `Worker` per thread. It does not own the adaptors around
//! it; the pipeline lends them to the thread loops below for the duration of
//! a run.

use crate::pipeline::adaptor::Adaptor;
use crate::pipeline::compiled_plan::CompiledPlan;
use crate::pipeline::error::PipelineResult;
use crate::pipeline::id::TaskId;
use crate::pipeline::pinning;
use crate::pipeline::stats::{self, TaskTypeReport};
use crate::pipeline::task::{Flow, TaskState};
use crate::pipeline::worker::Worker;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Thread count and statistics of one stage.
#[derive(Debug, Clone, Serialize)]
pub struct StageReport {
    pub n_threads: usize,
    pub tasks: Vec<TaskTypeReport>,
}

pub struct Stage {
    index: usize,
    tasks: Vec<TaskId>,
    /// Core per thread, `None` when unpinned.
    cores: Vec<Option<usize>>,
    pub(crate) workers: Vec<Worker>,
}

impl Stage {
    pub(crate) fn new(
        index: usize,
        tasks: Vec<TaskId>,
        cores: Vec<Option<usize>>,
        workers: Vec<Worker>,
    ) -> Self {
        Self {
            index,
            tasks,
            cores,
            workers,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn n_threads(&self) -> usize {
        self.workers.len()
    }

    /// Tasks of the stage, in execution order.
    pub fn tasks(&self) -> &[TaskId] {
        &self.tasks
    }

    /// Core of thread `tid`, if pinned.
    pub fn core(&self, tid: usize) -> Option<usize> {
        self.cores.get(tid).copied().flatten()
    }

    pub fn set_n_frames(&mut self, n_frames: usize) {
        for w in &mut self.workers {
            w.set_n_frames(n_frames);
        }
    }

    pub(crate) fn replace_plan(&mut self, plan: &CompiledPlan) -> PipelineResult<()> {
        for w in &mut self.workers {
            w.replace_plan(plan.clone())?;
        }
        Ok(())
    }

    pub fn reset(&mut self) {
        for w in &mut self.workers {
            w.reset_modules();
            w.reset_stats();
        }
    }

    pub fn task_states_mut(&mut self) -> impl Iterator<Item = &mut TaskState> {
        self.workers.iter_mut().flat_map(|w| w.states_mut().iter_mut())
    }

    /// Statistics folded across the threads of the stage.
    pub fn report(&self) -> StageReport {
        StageReport {
            n_threads: self.workers.len(),
            tasks: self.tasks_per_types(),
        }
    }

    pub fn tasks_per_types(&self) -> Vec<TaskTypeReport> {
        stats::aggregate(self.workers.iter().flat_map(|w| w.stats()))
    }
}

/// Run-wide settings shared by every thread loop.
pub(crate) struct RunContext<'a> {
    /// Raised when any thread failed; only the first stage polls it.
    pub stop: &'a AtomicBool,
    /// Frame id at which the first stage stops, if any.
    pub target: Option<u64>,
    /// Hand buffers to adaptors by exchange instead of copy.
    pub swap: bool,
    /// Next frame id of the first stage, kept current while it runs.
    pub progress: &'a AtomicU64,
}

/// Where the first stage stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FirstStageEnd {
    /// Id of the next frame to produce.
    pub next_frame: u64,
    /// The initial task ended its stream.
    pub exhausted: bool,
}

/// Loop of the first stage: drive the initial task and feed `output`.
pub(crate) fn run_first(
    worker: &mut Worker,
    output: Option<&Adaptor>,
    first_frame: u64,
    ctx: &RunContext<'_>,
) -> PipelineResult<FirstStageEnd> {
    let mut frame_id = first_frame;
    let mut exhausted = false;

    while !ctx.stop.load(Ordering::Acquire) {
        if ctx.target.is_some_and(|t| frame_id >= t) {
            break;
        }
        let flow = worker.run(frame_id)?;
        if flow == Flow::Empty {
            exhausted = true;
            break;
        }
        if let Some(out) = output {
            if !worker.push_to(out, 0, frame_id, ctx.swap)? {
                break;
            }
        }
        frame_id += 1;
        ctx.progress.store(frame_id, Ordering::Release);
        if flow == Flow::Last {
            exhausted = true;
            break;
        }
    }

    if let Some(out) = output {
        out.finish(0);
    }
    Ok(FirstStageEnd {
        next_frame: frame_id,
        exhausted,
    })
}

/// Loop of a later stage: pull, run, push until the input is drained or
/// cancelled.
pub(crate) fn run_next(
    worker: &mut Worker,
    tid: usize,
    input: &Adaptor,
    output: Option<&Adaptor>,
    ctx: &RunContext<'_>,
) -> PipelineResult<()> {
    while let Some(frame_id) = worker.pull_from(input, tid, ctx.swap)? {
        worker.run(frame_id)?;
        if let Some(out) = output {
            if !worker.push_to(out, tid, frame_id, ctx.swap)? {
                break;
            }
        }
    }

    if let Some(out) = output {
        out.finish(tid);
    }
    Ok(())
}

/// Pin the calling thread of `stage` if a core was assigned to it.
pub(crate) fn pin(stage: usize, tid: usize, core: Option<usize>) {
    if let Some(core) = core {
        if pinning::pin_current_thread(core) {
            tracing::debug!("Stage {} thread {} pinned to core {}", stage, tid, core);
        }
    }
}
