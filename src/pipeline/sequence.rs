//! Sequence: the non-staged executor.
//!
//! Runs every task reachable from the first task in topological order on
//! each of `n_threads` threads. Each thread owns an independent replica of
//! the modules and processes its own stream. Useful for validating a graph
//! before staging it, and for step-by-step debugging.

use crate::pipeline::compiler::PipelineCompiler;
use crate::pipeline::error::{panic_message, PipelineError, PipelineResult};
use crate::pipeline::graph::Graph;
use crate::pipeline::id::TaskId;
use crate::pipeline::stats::{self, TaskTypeReport};
use crate::pipeline::task::{Flow, TaskState};
use crate::pipeline::worker::Worker;
use std::io::{self, Write};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};

struct Replica {
    worker: Worker,
    /// Next step of the current pass.
    cursor: usize,
    frame_id: u64,
    /// The initial task reported the end of its stream in this pass.
    last: bool,
    done: bool,
}

impl Replica {
    /// Run one step; returns whether this replica has more work.
    fn step(&mut self) -> PipelineResult<bool> {
        if self.done {
            return Ok(false);
        }
        let flow = self.worker.step(self.cursor, self.frame_id)?;
        if self.cursor == 0 {
            match flow {
                Flow::Empty => {
                    self.done = true;
                    return Ok(false);
                }
                Flow::Last => self.last = true,
                Flow::Continue => {}
            }
        }

        self.cursor += 1;
        if self.cursor == self.worker.n_steps() {
            self.cursor = 0;
            self.frame_id += 1;
            if self.last {
                self.done = true;
            }
        }
        Ok(!self.done)
    }

    /// Run whole passes until the stream ends, `target` frames were
    /// processed, or `stop` is raised.
    fn run(&mut self, target: Option<u64>, stop: &AtomicBool) -> PipelineResult<()> {
        // Finish a pass left open by `exec_step`
        while self.cursor != 0 && self.step()? {}

        let start = self.frame_id;
        while !self.done && !stop.load(Ordering::Acquire) {
            if target.is_some_and(|t| self.frame_id - start >= t) {
                break;
            }
            match self.worker.run(self.frame_id)? {
                Flow::Empty => self.done = true,
                Flow::Last => {
                    self.frame_id += 1;
                    self.done = true;
                }
                Flow::Continue => self.frame_id += 1,
            }
        }
        Ok(())
    }
}

pub struct Sequence {
    graph: Graph,
    first: TaskId,
    order: Vec<TaskId>,
    no_copy: bool,
    n_frames: usize,
    replicas: Vec<Replica>,
}

impl Sequence {
    /// Build a sequence over the tasks reachable from `first`.
    pub fn new(graph: &Graph, first: TaskId, n_threads: usize) -> PipelineResult<Self> {
        if n_threads == 0 {
            return Err(PipelineError::Config(
                "a sequence needs at least one thread".to_string(),
            ));
        }
        let order = graph.topological_order(first)?;
        let mut sequence = Self {
            graph: graph.clone(),
            first,
            order,
            no_copy: true,
            n_frames: 1,
            replicas: Vec::new(),
        };
        for _ in 0..n_threads {
            let worker = Worker::new(&sequence.graph, sequence.compile()?, sequence.n_frames)?;
            sequence.replicas.push(Replica {
                worker,
                cursor: 0,
                frame_id: 0,
                last: false,
                done: false,
            });
        }
        tracing::info!(
            "Sequence ready: {} task(s) on {} thread(s)",
            sequence.order.len(),
            n_threads
        );
        Ok(sequence)
    }

    fn compile(&self) -> PipelineResult<crate::pipeline::compiled_plan::CompiledPlan> {
        let mut plan = PipelineCompiler::compile(&self.graph, &self.order, &[], &[], self.no_copy)?;
        plan.leads_stream = true;
        Ok(plan)
    }

    pub fn n_threads(&self) -> usize {
        self.replicas.len()
    }

    pub fn first_task(&self) -> TaskId {
        self.first
    }

    /// Tasks in execution order.
    pub fn tasks(&self) -> &[TaskId] {
        &self.order
    }

    pub fn n_frames(&self) -> usize {
        self.n_frames
    }

    pub fn is_no_copy_mode(&self) -> bool {
        self.no_copy
    }

    /// Frames batched into one task invocation.
    pub fn set_n_frames(&mut self, n_frames: usize) {
        self.n_frames = n_frames.max(1);
        for r in &mut self.replicas {
            r.worker.set_n_frames(self.n_frames);
        }
    }

    /// Let forward sockets work in place on their writer's buffer.
    pub fn set_no_copy_mode(&mut self, no_copy: bool) -> PipelineResult<()> {
        if no_copy == self.no_copy {
            return Ok(());
        }
        self.no_copy = no_copy;
        let plan = self.compile()?;
        for r in &mut self.replicas {
            r.worker.replace_plan(plan.clone())?;
            r.cursor = 0;
        }
        Ok(())
    }

    /// Task states of every replica, for flag changes.
    pub fn task_states_mut(&mut self) -> impl Iterator<Item = &mut TaskState> {
        self.replicas
            .iter_mut()
            .flat_map(|r| r.worker.states_mut().iter_mut())
    }

    /// Whether every replica reached the end of its stream.
    pub fn is_done(&self) -> bool {
        self.replicas.iter().all(|r| r.done)
    }

    /// Rewind every replica: modules, counters, and stream state.
    pub fn reset(&mut self) {
        for r in &mut self.replicas {
            r.worker.reset_modules();
            r.worker.reset_stats();
            r.cursor = 0;
            r.frame_id = 0;
            r.last = false;
            r.done = false;
        }
    }

    /// Run every replica until its stream ends.
    pub fn exec(&mut self) -> PipelineResult<()> {
        self.run(None)
    }

    /// Run at most `n` passes per replica.
    pub fn exec_frames(&mut self, n: u64) -> PipelineResult<()> {
        self.run(Some(n))
    }

    /// Advance replica `tid` by a single task invocation.
    ///
    /// Returns whether the replica has more work.
    pub fn exec_step(&mut self, tid: usize) -> PipelineResult<bool> {
        let n = self.replicas.len();
        self.replicas
            .get_mut(tid)
            .ok_or_else(|| PipelineError::Config(format!("thread {} out of range ({})", tid, n)))?
            .step()
    }

    fn run(&mut self, target: Option<u64>) -> PipelineResult<()> {
        let stop = AtomicBool::new(false);

        if let [replica] = self.replicas.as_mut_slice() {
            return panic::catch_unwind(AssertUnwindSafe(|| replica.run(target, &stop)))
                .unwrap_or_else(|payload| {
                    Err(PipelineError::WorkerPanicked {
                        stage: 0,
                        message: format!("thread 0: {}", panic_message(payload.as_ref())),
                    })
                });
        }

        let (err_tx, err_rx) = crossbeam_channel::unbounded();
        std::thread::scope(|scope| {
            for (tid, replica) in self.replicas.iter_mut().enumerate() {
                let stop = &stop;
                let err_tx = err_tx.clone();
                scope.spawn(move || {
                    let result = panic::catch_unwind(AssertUnwindSafe(|| replica.run(target, stop)))
                        .unwrap_or_else(|payload| {
                            Err(PipelineError::WorkerPanicked {
                                stage: 0,
                                message: format!("thread {}: {}", tid, panic_message(payload.as_ref())),
                            })
                        });
                    if let Err(e) = result {
                        stop.store(true, Ordering::Release);
                        let _ = err_tx.send(e);
                    }
                });
            }
        });
        drop(err_tx);

        match err_rx.try_recv() {
            Ok(e) => Err(e),
            Err(_) => Ok(()),
        }
    }

    /// Statistics of every task type, folded across replicas.
    pub fn tasks_per_types(&self) -> Vec<TaskTypeReport> {
        stats::aggregate(self.replicas.iter().flat_map(|r| r.worker.stats()))
    }

    /// Write the sequence's tasks and bindings in dot format.
    pub fn export_dot<W: Write>(&self, out: &mut W) -> io::Result<()> {
        let label = format!("Sequence ({} thread(s))", self.replicas.len());
        self.graph
            .write_dot(out, "Sequence", &[(label, self.order.clone())], &[])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::modules::{Relayer, Sink, SinkTarget, Source};

    fn chain(data: Vec<u8>, n: usize, forward: bool) -> (Graph, TaskId, SinkTarget) {
        let mut g = Graph::new();
        let target = SinkTarget::memory();
        let src = g.add_module(Source::from_bytes(data, n));
        let rly = g.add_module(Relayer::new(n));
        let snk = g.add_module(Sink::new(n, target.clone()));
        let gen = g.task(src, "generate").unwrap();
        let send = g.task(snk, "send_count").unwrap();
        let out = if forward {
            let t = g.task(rly, "relayf").unwrap();
            g.bind(t.socket(Relayer::FWD), gen.socket(Source::OUT_DATA)).unwrap();
            t.socket(Relayer::FWD)
        } else {
            let t = g.task(rly, "relay").unwrap();
            g.bind(t.socket(Relayer::IN), gen.socket(Source::OUT_DATA)).unwrap();
            t.socket(Relayer::OUT)
        };
        g.bind(send.socket(Sink::IN_DATA), out).unwrap();
        g.bind(send.socket(Sink::IN_COUNT), gen.socket(Source::OUT_COUNT)).unwrap();
        (g, gen, target)
    }

    #[test]
    fn test_exec_reproduces_input() {
        let data: Vec<u8> = (0..=255).cycle().take(1000).collect();
        for forward in [false, true] {
            for no_copy in [false, true] {
                let (g, gen, target) = chain(data.clone(), 64, forward);
                let mut seq = Sequence::new(&g, gen, 1).unwrap();
                assert_eq!(seq.first_task(), gen);
                seq.set_no_copy_mode(no_copy).unwrap();
                seq.set_n_frames(3);
                seq.exec().unwrap();
                assert!(seq.is_done());
                assert_eq!(target.contents().unwrap(), data);
            }
        }
    }

    #[test]
    fn test_exec_step_walks_tasks() {
        let (g, gen, target) = chain(vec![1u8, 2, 3, 4, 5, 6], 3, false);
        let mut seq = Sequence::new(&g, gen, 1).unwrap();
        assert_eq!(seq.tasks().len(), 3);

        let mut steps = 0;
        while seq.exec_step(0).unwrap() {
            steps += 1;
        }
        // Two passes of three tasks; the last step reports completion.
        assert_eq!(steps, 5);
        assert!(seq.is_done());
        assert!(!seq.exec_step(0).unwrap());
        assert_eq!(target.contents().unwrap(), vec![1, 2, 3, 4, 5, 6]);
        assert!(seq.exec_step(3).is_err());
    }

    #[test]
    fn test_exec_frames_then_resume() {
        let data: Vec<u8> = (0..40).collect();
        let (g, gen, target) = chain(data.clone(), 4, true);
        let mut seq = Sequence::new(&g, gen, 1).unwrap();
        seq.exec_frames(3).unwrap();
        assert!(!seq.is_done());
        assert_eq!(target.contents().unwrap(), data[..12].to_vec());

        // Half a pass, then exec finishes it and the rest of the stream.
        seq.exec_step(0).unwrap();
        seq.exec().unwrap();
        assert!(seq.is_done());
        assert_eq!(target.contents().unwrap(), data);
    }

    #[test]
    fn test_multi_thread_replicas() {
        let data = vec![7u8; 100];
        let (g, gen, target) = chain(data, 10, false);
        let mut seq = Sequence::new(&g, gen, 4).unwrap();
        for state in seq.task_states_mut() {
            state.set_stats(true);
        }
        seq.exec().unwrap();
        assert!(seq.is_done());
        // Each replica streams the whole input.
        assert_eq!(target.contents().unwrap().len(), 400);

        let reports = seq.tasks_per_types();
        assert_eq!(reports.len(), 3);
        assert_eq!(reports[0].replicas, 4);
        assert_eq!(reports[1].n_calls, 40);
        assert!(reports[1].average_us.is_some());

        seq.reset();
        assert!(!seq.is_done());
        assert_eq!(seq.tasks_per_types()[0].n_calls, 0);
    }

    #[test]
    fn test_unbound_graph_rejected() {
        let mut g = Graph::new();
        let src = g.add_module(Source::from_bytes(vec![0u8; 4], 4));
        let snk = g.add_module(Sink::new(4, SinkTarget::memory()));
        let gen = g.task(src, "generate").unwrap();
        let send = g.task(snk, "send_count").unwrap();
        g.bind(send.socket(Sink::IN_COUNT), gen.socket(Source::OUT_COUNT)).unwrap();
        assert!(matches!(
            Sequence::new(&g, gen, 1),
            Err(PipelineError::Unbound { .. })
        ));
        assert!(Sequence::new(&g, gen, 0).is_err());
    }

    #[test]
    fn test_export_dot() {
        let (g, gen, _) = chain(vec![0u8; 4], 4, true);
        let seq = Sequence::new(&g, gen, 2).unwrap();
        let mut out = Vec::new();
        seq.export_dot(&mut out).unwrap();
        let dot = String::from_utf8(out).unwrap();
        assert!(dot.contains("subgraph cluster_0"));
        assert!(dot.contains("Sequence (2 thread(s))"));
        assert!(dot.contains("Relayer::relayf"));
    }
}
