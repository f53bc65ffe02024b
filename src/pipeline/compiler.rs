use super::compiled_plan::{BufferSpec, CompiledPlan, PlanStats, Route, Step};
use super::error::{PipelineError, PipelineResult};
use super::graph::Graph;
use super::id::{ModuleId, SocketId, TaskId};
use super::socket::SocketDirection;
use std::collections::{HashMap, HashSet};

/// Compiles an ordered task list into a buffer-indexed execution plan
pub struct PipelineCompiler;

impl PipelineCompiler {
    /// Compile `tasks` (already in execution order) into a plan.
    ///
    /// # Arguments
    /// * `graph` - The task graph holding sockets and bindings
    /// * `tasks` - Tasks of the plan, in execution order
    /// * `imports` - Writer sockets whose values arrive from an input adaptor
    /// * `exports` - Writer sockets whose values leave through an output adaptor
    /// * `no_copy` - Let forward sockets alias their writer instead of copying
    ///
    /// # Errors
    /// A reader whose writer is neither in `tasks` nor in `imports`, or a task
    /// touching an aliased buffer through a writable socket and another socket.
    pub fn compile(
        graph: &Graph,
        tasks: &[TaskId],
        imports: &[SocketId],
        exports: &[SocketId],
        no_copy: bool,
    ) -> PipelineResult<CompiledPlan> {
        let start_time = std::time::Instant::now();

        let mut values = ValueTable {
            graph,
            in_plan: tasks.iter().copied().collect(),
            no_copy,
            keys: HashMap::new(),
            buffers: Vec::new(),
            aliased: 0,
        };

        // Imported values first, so their buffers are laid out in channel order
        let imports = imports
            .iter()
            .map(|&w| values.alloc(w))
            .collect::<PipelineResult<Vec<_>>>()?;

        let mut modules: Vec<ModuleId> = Vec::new();
        let mut steps = Vec::with_capacity(tasks.len());
        let mut n_copies = 0;

        for &task in tasks {
            let node = graph.node(task)?;
            let module = match modules.iter().position(|&m| m == node.module) {
                Some(i) => i,
                None => {
                    modules.push(node.module);
                    modules.len() - 1
                }
            };

            let mut routes = Vec::with_capacity(node.sockets.len());
            let mut copies = Vec::new();
            for (s, spec) in node.sockets.iter().enumerate() {
                let socket = task.socket(s as u16);
                let route = match spec.direction {
                    SocketDirection::Output => Route {
                        buffer: values.value_of(socket)?,
                        writable: true,
                    },
                    SocketDirection::Input => Route {
                        buffer: values.value_of(values.writer(socket)?)?,
                        writable: false,
                    },
                    SocketDirection::Forward => {
                        let source = values.value_of(values.writer(socket)?)?;
                        let own = values.value_of(socket)?;
                        if own != source {
                            copies.push((source, own));
                        }
                        Route {
                            buffer: own,
                            writable: true,
                        }
                    }
                };
                routes.push(route);
            }

            Self::check_aliasing(graph, task, &routes)?;
            n_copies += copies.len();
            steps.push(Step {
                task,
                module,
                task_index: node.index,
                routes,
                copies,
            });
        }

        let exports = exports
            .iter()
            .map(|&w| values.value_of(w))
            .collect::<PipelineResult<Vec<_>>>()?;

        let stats = PlanStats {
            steps: steps.len(),
            buffers: values.buffers.len(),
            aliased: values.aliased,
            copies: n_copies,
            compile_time_us: start_time.elapsed().as_micros() as u64,
        };

        tracing::debug!(
            "Compiled plan: {} steps, {} buffers ({} aliased, {} copies) in {}us",
            stats.steps,
            stats.buffers,
            stats.aliased,
            stats.copies,
            stats.compile_time_us
        );

        Ok(CompiledPlan {
            steps,
            buffers: values.buffers,
            modules,
            imports,
            exports,
            leads_stream: false,
            stats,
        })
    }

    /// A writable buffer must not be reachable through any other socket of
    /// the same task.
    fn check_aliasing(graph: &Graph, task: TaskId, routes: &[Route]) -> PipelineResult<()> {
        for (i, route) in routes.iter().enumerate() {
            if !route.writable {
                continue;
            }
            if let Some(j) = routes
                .iter()
                .enumerate()
                .position(|(j, other)| j != i && other.buffer == route.buffer)
            {
                return Err(PipelineError::Config(format!(
                    "{} and {} share one buffer while one of them is written in place; \
                     disable no-copy mode or bind them to different writers",
                    graph.socket_label(task.socket(i as u16)),
                    graph.socket_label(task.socket(j as u16)),
                )));
            }
        }
        Ok(())
    }
}

/// Maps writer sockets to local buffers.
struct ValueTable<'g> {
    graph: &'g Graph,
    in_plan: HashSet<TaskId>,
    no_copy: bool,
    keys: HashMap<SocketId, usize>,
    buffers: Vec<BufferSpec>,
    aliased: usize,
}

impl ValueTable<'_> {
    fn writer(&self, reader: SocketId) -> PipelineResult<SocketId> {
        self.graph
            .writer_of(reader)
            .ok_or_else(|| PipelineError::Unbound {
                socket: reader,
                message: format!("{} has no writer", self.graph.socket_label(reader)),
            })
    }

    fn alloc(&mut self, key: SocketId) -> PipelineResult<usize> {
        if let Some(&b) = self.keys.get(&key) {
            return Ok(b);
        }
        let spec = self.graph.socket_spec(key)?;
        let index = self.buffers.len();
        self.buffers.push(BufferSpec {
            key,
            frame_bytes: spec.frame_bytes(),
        });
        self.keys.insert(key, index);
        Ok(index)
    }

    /// Buffer holding the value written by `writer`.
    fn value_of(&mut self, writer: SocketId) -> PipelineResult<usize> {
        if let Some(&b) = self.keys.get(&writer) {
            return Ok(b);
        }
        if !self.in_plan.contains(&writer.task()) {
            return Err(PipelineError::Config(format!(
                "{} is read here but is neither produced nor imported",
                self.graph.socket_label(writer)
            )));
        }

        match self.graph.socket_spec(writer)?.direction {
            SocketDirection::Output => self.alloc(writer),
            SocketDirection::Forward if self.no_copy => {
                let upstream = self.writer(writer)?;
                let b = self.value_of(upstream)?;
                self.keys.insert(writer, b);
                self.aliased += 1;
                Ok(b)
            }
            SocketDirection::Forward => self.alloc(writer),
            SocketDirection::Input => Err(PipelineError::InvalidBinding(format!(
                "{} is an input and cannot be read from",
                self.graph.socket_label(writer)
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::modules::{Relayer, Sink, SinkTarget, Source};
    use crate::pipeline::socket::SocketSpec;
    use crate::pipeline::task::{Flow, ModulePlugin, TaskError, TaskIo, TaskSpec};
    use crate::types::DataType;

    // Graph: [generate] → [relayf] → [relay] → [send_count], count straight to the sink
    fn forward_chain() -> (Graph, Vec<TaskId>) {
        let mut g = Graph::new();
        let src = g.add_module(Source::from_bytes(vec![3u8; 8], 4));
        let a = g.add_module(Relayer::new(4));
        let b = g.add_module(Relayer::new(4));
        let snk = g.add_module(Sink::new(4, SinkTarget::memory()));
        let gen = g.task(src, "generate").unwrap();
        let fwd = g.task(a, "relayf").unwrap();
        let relay = g.task(b, "relay").unwrap();
        let send = g.task(snk, "send_count").unwrap();
        g.bind(fwd.socket(Relayer::FWD), gen.socket(Source::OUT_DATA)).unwrap();
        g.bind(relay.socket(Relayer::IN), fwd.socket(Relayer::FWD)).unwrap();
        g.bind(send.socket(Sink::IN_DATA), relay.socket(Relayer::OUT)).unwrap();
        g.bind(send.socket(Sink::IN_COUNT), gen.socket(Source::OUT_COUNT)).unwrap();
        let order = g.topological_order(gen).unwrap();
        (g, order)
    }

    #[test]
    fn test_compile_no_copy_aliases_forward() {
        let (g, order) = forward_chain();
        let plan = PipelineCompiler::compile(&g, &order, &[], &[], true).unwrap();

        assert_eq!(plan.stats.steps, 4);
        // out_data, out_count, relay::out
        assert_eq!(plan.stats.buffers, 3);
        assert_eq!(plan.stats.aliased, 1);
        assert_eq!(plan.stats.copies, 0);
        assert_eq!(plan.steps[1].routes[0].buffer, plan.steps[0].routes[0].buffer);
        assert!(plan.steps[1].routes[0].writable);
    }

    #[test]
    fn test_compile_copy_mode_inserts_copy() {
        let (g, order) = forward_chain();
        let plan = PipelineCompiler::compile(&g, &order, &[], &[], false).unwrap();

        assert_eq!(plan.stats.buffers, 4);
        assert_eq!(plan.stats.aliased, 0);
        assert_eq!(plan.stats.copies, 1);
        let out_data = plan.steps[0].routes[0].buffer;
        let fwd = plan.steps[1].routes[0].buffer;
        assert_ne!(out_data, fwd);
        assert_eq!(plan.steps[1].copies, vec![(out_data, fwd)]);
    }

    #[test]
    fn test_compile_with_imports_and_exports() {
        let (g, order) = forward_chain();
        let gen = order[0];
        let relay = order[2];
        // Stage holding only the relay tasks: values of the source come in,
        // relay::out and out_count leave.
        let imports = [gen.socket(Source::OUT_DATA), gen.socket(Source::OUT_COUNT)];
        let exports = [relay.socket(Relayer::OUT), gen.socket(Source::OUT_COUNT)];
        let plan = PipelineCompiler::compile(&g, &order[1..3], &imports, &exports, true).unwrap();

        assert_eq!(plan.imports, vec![0, 1]);
        assert_eq!(plan.exports, vec![2, 1]);
        assert_eq!(plan.modules.len(), 2);
        assert_eq!(plan.buffers[0].frame_bytes, 4);
        assert_eq!(plan.buffers[1].frame_bytes, 4);
        assert_eq!(plan.buffer_sizes(3).collect::<Vec<_>>(), vec![12, 12, 12]);
    }

    #[test]
    fn test_compile_missing_value_is_error() {
        let (g, order) = forward_chain();
        // The relay tasks alone, without importing the source values.
        let err = PipelineCompiler::compile(&g, &order[1..3], &[], &[], true);
        assert!(matches!(err, Err(PipelineError::Config(_))));
    }

    /// Task reading a value and modifying it in place through two sockets.
    #[derive(Clone)]
    struct Mix;

    impl ModulePlugin for Mix {
        fn name(&self) -> &str {
            "Mix"
        }

        fn tasks(&self) -> Vec<TaskSpec> {
            vec![TaskSpec {
                name: "mix",
                sockets: vec![
                    SocketSpec::input("a", DataType::U8, 4),
                    SocketSpec::forward("b", DataType::U8, 4),
                ],
            }]
        }

        fn exec(&mut self, _task: usize, _io: &mut TaskIo<'_>) -> Result<Flow, TaskError> {
            Ok(Flow::Continue)
        }

        fn clone_module(&self) -> Box<dyn ModulePlugin> {
            Box::new(self.clone())
        }
    }

    #[test]
    fn test_compile_rejects_in_place_hazard() {
        let mut g = Graph::new();
        let src = g.add_module(Source::from_bytes(vec![0u8; 4], 4));
        let mix = g.add_module(Box::new(Mix) as Box<dyn ModulePlugin>);
        let gen = g.task(src, "generate").unwrap();
        let m = g.task(mix, "mix").unwrap();
        g.bind(m.socket(0), gen.socket(Source::OUT_DATA)).unwrap();
        g.bind(m.socket(1), gen.socket(Source::OUT_DATA)).unwrap();
        let order = g.topological_order(gen).unwrap();

        assert!(matches!(
            PipelineCompiler::compile(&g, &order, &[], &[], true),
            Err(PipelineError::Config(_))
        ));
        // With a private copy the task no longer aliases its input.
        assert!(PipelineCompiler::compile(&g, &order, &[], &[], false).is_ok());
    }
}
