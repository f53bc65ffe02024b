//! Per-thread executor of a compiled plan.
//!
//! A worker owns its module replicas, the task states (flags and counters)
//! of its steps, and one byte buffer per plan value. Writable buffers are
//! moved out of the buffer table while a task runs and put back afterwards,
//! so readers and writers of one invocation never alias.

use crate::pipeline::adaptor::{Adaptor, Pulled, WaitStatus};
use crate::pipeline::compiled_plan::CompiledPlan;
use crate::pipeline::error::{PipelineError, PipelineResult};
use crate::pipeline::graph::Graph;
use crate::pipeline::stats::TaskStats;
use crate::pipeline::task::{AnyModule, Flow, SocketData, TaskIo, TaskState};
use crate::types::DataType;
use std::time::Instant;

pub struct Worker {
    plan: CompiledPlan,
    modules: Vec<AnyModule>,
    states: Vec<TaskState>,
    /// Socket shape per step: `(datatype, bytes per frame)`.
    shapes: Vec<Vec<(DataType, usize)>>,
    buffers: Vec<Vec<u8>>,
    n_frames: usize,
}

impl Worker {
    /// Build a worker with fresh replicas of the modules used by `plan`.
    pub fn new(graph: &Graph, plan: CompiledPlan, n_frames: usize) -> PipelineResult<Self> {
        let modules = plan
            .modules
            .iter()
            .map(|&m| graph.clone_module(m))
            .collect::<PipelineResult<Vec<_>>>()?;

        let mut states = Vec::with_capacity(plan.steps.len());
        let mut shapes = Vec::with_capacity(plan.steps.len());
        for step in &plan.steps {
            let node = graph.node(step.task)?;
            states.push(node.state.clone());
            shapes.push(
                node.sockets
                    .iter()
                    .map(|s| (s.datatype, s.frame_bytes()))
                    .collect(),
            );
        }

        let mut worker = Self {
            plan,
            modules,
            states,
            shapes,
            buffers: Vec::new(),
            n_frames: n_frames.max(1),
        };
        worker.allocate();
        Ok(worker)
    }

    fn allocate(&mut self) {
        self.buffers = self
            .plan
            .buffer_sizes(self.n_frames)
            .map(|len| vec![0u8; len])
            .collect();
    }

    pub fn plan(&self) -> &CompiledPlan {
        &self.plan
    }

    pub fn n_steps(&self) -> usize {
        self.plan.steps.len()
    }

    pub fn n_frames(&self) -> usize {
        self.n_frames
    }

    /// Resize every buffer for batches of `n_frames`.
    pub fn set_n_frames(&mut self, n_frames: usize) {
        self.n_frames = n_frames.max(1);
        self.allocate();
    }

    /// Swap in a plan compiled from the same task list.
    ///
    /// Module replicas keep their state; buffers are reallocated.
    pub fn replace_plan(&mut self, plan: CompiledPlan) -> PipelineResult<()> {
        if plan.modules != self.plan.modules || plan.steps.len() != self.plan.steps.len() {
            return Err(PipelineError::Config(
                "replacement plan does not use the same tasks".to_string(),
            ));
        }
        self.plan = plan;
        self.allocate();
        Ok(())
    }

    /// Restore every module replica to its initial state.
    pub fn reset_modules(&mut self) {
        for module in &mut self.modules {
            module.reset();
        }
    }

    /// Clear the counters of every step.
    pub fn reset_stats(&mut self) {
        for state in &mut self.states {
            state.reset();
        }
    }

    pub fn states(&self) -> &[TaskState] {
        &self.states
    }

    pub fn states_mut(&mut self) -> &mut [TaskState] {
        &mut self.states
    }

    /// `(module, task, stats)` of every step, for aggregation.
    pub fn stats(&self) -> impl Iterator<Item = (&str, &str, &TaskStats)> {
        self.states
            .iter()
            .map(|s| (s.module_name(), s.task_name(), s.stats()))
    }

    /// Run every step once.
    ///
    /// When the plan leads the stream, the flow of the initial task is
    /// returned and `Flow::Empty` stops the pass before any other step.
    pub fn run(&mut self, frame_id: u64) -> PipelineResult<Flow> {
        let mut stream = Flow::Continue;
        for i in 0..self.plan.steps.len() {
            let flow = self.step(i, frame_id)?;
            if i == 0 && self.plan.leads_stream {
                if flow == Flow::Empty {
                    return Ok(Flow::Empty);
                }
                stream = flow;
            }
        }
        Ok(stream)
    }

    /// Run step `i` once.
    pub fn step(&mut self, i: usize, frame_id: u64) -> PipelineResult<Flow> {
        let Self {
            plan,
            modules,
            states,
            shapes,
            buffers,
            n_frames,
        } = self;
        let step = plan
            .steps
            .get(i)
            .ok_or_else(|| PipelineError::Config(format!("plan has no step {}", i)))?;
        let state = &mut states[i];
        let shape = &shapes[i];

        for &(src, dst) in &step.copies {
            let data = std::mem::take(&mut buffers[src]);
            buffers[dst].copy_from_slice(&data);
            buffers[src] = data;
        }

        if !state.is_fast() {
            for (s, route) in step.routes.iter().enumerate() {
                let expected = shape[s].1 * *n_frames;
                let actual = buffers[route.buffer].len();
                if actual != expected {
                    return Err(PipelineError::SocketSize {
                        socket: format!("{}#{}", state.full_name(), s),
                        expected,
                        actual,
                    });
                }
            }
        }

        if state.is_debug() {
            for (s, route) in step.routes.iter().enumerate() {
                if !route.writable {
                    tracing::debug!(
                        "{} frame {} in#{}: {}",
                        state.full_name(),
                        frame_id,
                        s,
                        shape[s].0.format_elements(&buffers[route.buffer], state.debug_limit())
                    );
                }
            }
        }

        let mut writes: Vec<Vec<u8>> = step
            .routes
            .iter()
            .filter(|r| r.writable)
            .map(|r| std::mem::take(&mut buffers[r.buffer]))
            .collect();

        let started = state.is_stats().then(Instant::now);
        let result = {
            let mut pending = writes.iter_mut();
            let mut sockets = Vec::with_capacity(step.routes.len());
            for route in &step.routes {
                if route.writable {
                    match pending.next() {
                        Some(buf) => sockets.push(SocketData::Write(buf.as_mut_slice())),
                        None => break,
                    }
                } else {
                    sockets.push(SocketData::Read(buffers[route.buffer].as_slice()));
                }
            }
            let mut io = TaskIo::new(sockets, *n_frames, frame_id);
            modules[step.module].exec(step.task_index, &mut io)
        };

        let stats = state.stats_mut();
        stats.record_call();
        if let Some(started) = started {
            stats.record_duration(started.elapsed());
        }

        for (route, buf) in step.routes.iter().filter(|r| r.writable).zip(writes.drain(..)) {
            buffers[route.buffer] = buf;
        }

        let flow = result.map_err(|e| PipelineError::Task {
            task: state.full_name(),
            frame_id,
            message: e.to_string(),
        })?;

        if state.is_debug() {
            for (s, route) in step.routes.iter().enumerate().filter(|(_, r)| r.writable) {
                tracing::debug!(
                    "{} frame {} out#{}: {}",
                    state.full_name(),
                    frame_id,
                    s,
                    shape[s].0.format_elements(&buffers[route.buffer], state.debug_limit())
                );
            }
        }

        Ok(flow)
    }

    // ── Adaptor hand-off ──

    /// Receive the imported values from `adaptor`.
    ///
    /// Returns the frame id of the pulled batch, or `None` when the input is
    /// drained or cancelled.
    pub fn pull_from(
        &mut self,
        adaptor: &Adaptor,
        sid: usize,
        swap: bool,
    ) -> PipelineResult<Option<u64>> {
        let mut frames: Vec<Vec<u8>> = self
            .plan
            .imports
            .iter()
            .map(|&b| std::mem::take(&mut self.buffers[b]))
            .collect();

        let consumer = adaptor.consumer(sid);
        let pulled = if swap {
            consumer.pull_swap(&mut frames)
        } else {
            consumer.pull(&mut frames)
        };

        for (&b, buf) in self.plan.imports.iter().zip(frames) {
            self.buffers[b] = buf;
        }

        Ok(match pulled? {
            Pulled::Frame(frame_id) => Some(frame_id),
            Pulled::Drained | Pulled::Cancelled => None,
        })
    }

    /// Hand the exported values to `adaptor`.
    ///
    /// Returns `false` when the adaptor was cancelled.
    pub fn push_to(
        &mut self,
        adaptor: &Adaptor,
        sid: usize,
        frame_id: u64,
        swap: bool,
    ) -> PipelineResult<bool> {
        // Two channels can carry the same aliased value: the first takes the
        // buffer, later ones get a copy.
        let exports = &self.plan.exports;
        let mut frames: Vec<Vec<u8>> = Vec::with_capacity(exports.len());
        for (c, &b) in exports.iter().enumerate() {
            match exports[..c].iter().position(|&prev| prev == b) {
                Some(first) => {
                    let copy = frames[first].clone();
                    frames.push(copy);
                }
                None => frames.push(std::mem::take(&mut self.buffers[b])),
            }
        }

        let producer = adaptor.producer(sid);
        let status = if swap {
            producer.push_swap(&mut frames, frame_id)
        } else {
            producer.push(&frames, frame_id)
        };

        for (c, (&b, buf)) in exports.iter().zip(frames).enumerate() {
            if !exports[..c].contains(&b) {
                self.buffers[b] = buf;
            }
        }

        Ok(status? == WaitStatus::Ready)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::compiler::PipelineCompiler;
    use crate::pipeline::id::TaskId;
    use crate::pipeline::modules::{Relayer, Sink, SinkTarget, Source};

    fn chain(data: Vec<u8>, n: usize) -> (Graph, TaskId, SinkTarget) {
        let mut g = Graph::new();
        let target = SinkTarget::memory();
        let src = g.add_module(Source::from_bytes(data, n));
        let rly = g.add_module(Relayer::new(n));
        let snk = g.add_module(Sink::new(n, target.clone()));
        let gen = g.task(src, "generate").unwrap();
        let relay = g.task(rly, "relayf").unwrap();
        let send = g.task(snk, "send_count").unwrap();
        g.bind(relay.socket(Relayer::FWD), gen.socket(Source::OUT_DATA)).unwrap();
        g.bind(send.socket(Sink::IN_DATA), relay.socket(Relayer::FWD)).unwrap();
        g.bind(send.socket(Sink::IN_COUNT), gen.socket(Source::OUT_COUNT)).unwrap();
        (g, gen, target)
    }

    fn worker(g: &Graph, first: TaskId, no_copy: bool, n_frames: usize) -> Worker {
        let order = g.topological_order(first).unwrap();
        let mut plan = PipelineCompiler::compile(g, &order, &[], &[], no_copy).unwrap();
        plan.leads_stream = true;
        Worker::new(g, plan, n_frames).unwrap()
    }

    #[test]
    fn test_run_until_last() {
        let data: Vec<u8> = (0..10).collect();
        let (g, gen, target) = chain(data.clone(), 4);
        let mut w = worker(&g, gen, true, 1);

        assert_eq!(w.run(0).unwrap(), Flow::Continue);
        assert_eq!(w.run(1).unwrap(), Flow::Continue);
        assert_eq!(w.run(2).unwrap(), Flow::Last);
        assert_eq!(w.run(3).unwrap(), Flow::Empty);
        assert_eq!(target.contents().unwrap(), data);
        // The empty pass stops at the source.
        assert_eq!(w.states()[0].n_calls(), 4);
        assert_eq!(w.states()[2].n_calls(), 3);
    }

    #[test]
    fn test_copy_mode_batched() {
        let data: Vec<u8> = (0..12).collect();
        let (g, gen, target) = chain(data.clone(), 2);
        let mut w = worker(&g, gen, false, 3);
        assert_eq!(w.n_frames(), 3);

        assert_eq!(w.run(0).unwrap(), Flow::Continue);
        assert_eq!(w.run(1).unwrap(), Flow::Last);
        assert_eq!(target.contents().unwrap(), data);
    }

    #[test]
    fn test_step_by_step_and_stats() {
        let (mut g, gen, target) = chain(vec![9u8; 4], 4);
        for state in g.task_states_mut() {
            state.set_stats(true);
            state.set_debug(true);
            state.set_debug_limit(2);
        }
        let mut w = worker(&g, gen, true, 1);
        assert_eq!(w.n_steps(), 3);
        assert_eq!(w.step(0, 0).unwrap(), Flow::Last);
        assert!(target.contents().unwrap().is_empty());
        w.step(1, 0).unwrap();
        w.step(2, 0).unwrap();
        assert_eq!(target.contents().unwrap(), vec![9u8; 4]);
        assert!(w.step(3, 0).is_err());

        let stats: Vec<_> = w.stats().collect();
        assert_eq!(stats.len(), 3);
        assert_eq!(stats[0].0, "Source");
        assert_eq!(stats[0].2.n_timed, 1);
    }

    #[test]
    fn test_task_failure_is_reported() {
        let (g, gen, _) = chain(vec![1u8; 4], 4);
        let mut w = worker(&g, gen, true, 1);
        // Corrupt the count so the sink rejects it.
        w.step(0, 7).unwrap();
        let count = w.plan().steps[2].routes[1].buffer;
        w.buffers[count] = 99u32.to_le_bytes().to_vec();
        w.step(1, 7).unwrap();
        match w.step(2, 7) {
            Err(PipelineError::Task { task, frame_id, .. }) => {
                assert_eq!(task, "Sink::send_count");
                assert_eq!(frame_id, 7);
            }
            other => panic!("unexpected {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_size_check_and_fast_mode() {
        let (mut g, gen, _) = chain(vec![1u8; 4], 4);
        let mut w = worker(&g, gen, true, 1);
        w.buffers[0] = vec![0u8; 3];
        assert!(matches!(w.step(0, 0), Err(PipelineError::SocketSize { .. })));

        for state in g.task_states_mut() {
            state.set_fast(true);
        }
        let mut fast = worker(&g, gen, true, 1);
        assert!(fast.step(0, 0).is_ok());
    }

    #[test]
    fn test_reset_modules_rewinds_source() {
        let (g, gen, target) = chain(vec![5u8; 4], 4);
        let mut w = worker(&g, gen, true, 1);
        assert_eq!(w.run(0).unwrap(), Flow::Last);
        assert_eq!(w.run(1).unwrap(), Flow::Empty);
        w.reset_modules();
        w.reset_stats();
        assert_eq!(w.states()[0].n_calls(), 0);
        assert_eq!(w.run(0).unwrap(), Flow::Last);
        assert_eq!(target.contents().unwrap(), vec![5u8; 8]);
    }
}
