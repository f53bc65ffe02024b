//! Task graph: modules, their tasks, and socket bindings.
//!
//! A module is added once and expands into one graph task per declared task.
//! Bindings connect a reader socket (input or forward) to exactly one writer
//! socket (output or forward); a writer may feed any number of readers.
//!
//! The graph itself never executes anything. `Sequence` and `Pipeline` read
//! it, compile an execution plan, and clone the modules they need per thread.

use crate::pipeline::error::{PipelineError, PipelineResult};
use crate::pipeline::id::{ModuleId, SocketId, TaskId};
use crate::pipeline::socket::{SocketDirection, SocketSpec};
use crate::pipeline::task::{AnyModule, TaskState};
use std::collections::VecDeque;
use std::io::{self, Write};

/// One task of a module, as stored in the graph.
#[derive(Clone)]
pub struct TaskNode {
    pub module: ModuleId,
    /// Task index inside its module.
    pub index: usize,
    pub sockets: Vec<SocketSpec>,
    /// Writer bound to each socket. Always `None` for outputs.
    pub bindings: Vec<Option<SocketId>>,
    pub state: TaskState,
}

/// Static task graph.
#[derive(Clone, Default)]
pub struct Graph {
    modules: Vec<AnyModule>,
    module_tasks: Vec<Vec<TaskId>>,
    tasks: Vec<TaskNode>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Building ──

    /// Add a module; one graph task is created per declared task.
    pub fn add_module(&mut self, module: impl Into<AnyModule>) -> ModuleId {
        let module = module.into();
        let id = ModuleId(self.modules.len() as u32);
        let mut ids = Vec::new();

        for (index, spec) in module.tasks().into_iter().enumerate() {
            let tid = TaskId(self.tasks.len() as u32);
            let n = spec.sockets.len();
            self.tasks.push(TaskNode {
                module: id,
                index,
                sockets: spec.sockets,
                bindings: vec![None; n],
                state: TaskState::new(module.name(), spec.name),
            });
            ids.push(tid);
        }

        tracing::debug!("Added module {:?} ({}) with {} task(s)", id, module.name(), ids.len());
        self.modules.push(module);
        self.module_tasks.push(ids);
        id
    }

    /// Look up a task of `module` by name.
    pub fn task(&self, module: ModuleId, name: &str) -> PipelineResult<TaskId> {
        self.module_tasks
            .get(module.index())
            .into_iter()
            .flatten()
            .copied()
            .find(|&t| self.tasks[t.index()].state.task_name() == name)
            .ok_or_else(|| PipelineError::Config(format!("module {:?} has no task '{}'", module, name)))
    }

    /// Look up a socket of `task` by name.
    pub fn socket(&self, task: TaskId, name: &str) -> PipelineResult<SocketId> {
        let node = self.node(task)?;
        node.sockets
            .iter()
            .position(|s| s.name == name)
            .map(|i| task.socket(i as u16))
            .ok_or_else(|| PipelineError::UnknownSocket {
                task,
                name: name.to_string(),
            })
    }

    /// Bind `reader` to `writer` (`reader = writer`).
    pub fn bind(&mut self, reader: SocketId, writer: SocketId) -> PipelineResult<()> {
        let writer_spec = self.socket_spec(writer)?.clone();
        let reader_spec = self.socket_spec(reader)?;

        if reader.task() == writer.task() {
            return Err(PipelineError::InvalidBinding(format!(
                "{} cannot read its own socket {}",
                self.socket_label(reader),
                self.socket_label(writer)
            )));
        }
        if !reader_spec.accepts(&writer_spec) {
            return Err(PipelineError::InvalidBinding(format!(
                "{} ({:?} {}[{}]) cannot be bound to {} ({:?} {}[{}])",
                self.socket_label(reader),
                reader_spec.direction,
                reader_spec.datatype,
                reader_spec.n_elmts,
                self.socket_label(writer),
                writer_spec.direction,
                writer_spec.datatype,
                writer_spec.n_elmts,
            )));
        }
        if let Some(current) = self.writer_of(reader) {
            return Err(PipelineError::InvalidBinding(format!(
                "{} is already bound to {}",
                self.socket_label(reader),
                self.socket_label(current)
            )));
        }

        self.tasks[reader.task().index()].bindings[reader.socket_index() as usize] = Some(writer);
        Ok(())
    }

    /// Undo `bind(reader, writer)`.
    pub fn unbind(&mut self, reader: SocketId, writer: SocketId) -> PipelineResult<()> {
        self.socket_spec(reader)?;
        if self.writer_of(reader) != Some(writer) {
            return Err(PipelineError::InvalidBinding(format!(
                "{} is not bound to {}",
                self.socket_label(reader),
                self.socket_label(writer)
            )));
        }
        self.tasks[reader.task().index()].bindings[reader.socket_index() as usize] = None;
        Ok(())
    }

    // ── Queries ──

    pub fn n_tasks(&self) -> usize {
        self.tasks.len()
    }

    pub fn module(&self, id: ModuleId) -> Option<&AnyModule> {
        self.modules.get(id.index())
    }

    /// Tasks of a module, in declaration order.
    pub fn module_tasks(&self, id: ModuleId) -> &[TaskId] {
        self.module_tasks.get(id.index()).map_or(&[], |v| v.as_slice())
    }

    pub fn node(&self, task: TaskId) -> PipelineResult<&TaskNode> {
        self.tasks
            .get(task.index())
            .ok_or_else(|| PipelineError::Config(format!("unknown task {:?}", task)))
    }

    /// Every task state, for bulk flag changes (`set_debug`, `set_stats`...).
    pub fn task_states_mut(&mut self) -> impl Iterator<Item = &mut TaskState> {
        self.tasks.iter_mut().map(|t| &mut t.state)
    }

    pub fn socket_spec(&self, socket: SocketId) -> PipelineResult<&SocketSpec> {
        let node = self.node(socket.task())?;
        node.sockets
            .get(socket.socket_index() as usize)
            .ok_or_else(|| PipelineError::Config(format!("unknown socket {:?}", socket)))
    }

    /// Writer bound to `reader`, if any.
    pub fn writer_of(&self, reader: SocketId) -> Option<SocketId> {
        self.tasks
            .get(reader.task().index())?
            .bindings
            .get(reader.socket_index() as usize)
            .copied()
            .flatten()
    }

    /// Reader sockets bound to `writer`.
    pub fn readers_of(&self, writer: SocketId) -> Vec<SocketId> {
        self.bindings()
            .into_iter()
            .filter(|&(_, w)| w == writer)
            .map(|(r, _)| r)
            .collect()
    }

    /// Every `(reader, writer)` binding, ordered by reader.
    pub fn bindings(&self) -> Vec<(SocketId, SocketId)> {
        self.tasks
            .iter()
            .enumerate()
            .flat_map(|(t, node)| {
                node.bindings.iter().enumerate().filter_map(move |(s, w)| {
                    w.map(|w| (TaskId(t as u32).socket(s as u16), w))
                })
            })
            .collect()
    }

    /// `Module::task`
    pub fn task_label(&self, task: TaskId) -> String {
        self.tasks
            .get(task.index())
            .map_or_else(|| format!("{:?}", task), |t| t.state.full_name())
    }

    /// `Module::task::socket`
    pub fn socket_label(&self, socket: SocketId) -> String {
        match self.socket_spec(socket) {
            Ok(spec) => format!("{}::{}", self.task_label(socket.task()), spec.name),
            Err(_) => format!("{:?}", socket),
        }
    }

    /// Tasks reading at least one socket of `task`.
    pub fn successors(&self, task: TaskId) -> Vec<TaskId> {
        let mut out: Vec<TaskId> = self
            .bindings()
            .into_iter()
            .filter(|&(_, w)| w.task() == task)
            .map(|(r, _)| r.task())
            .collect();
        out.dedup();
        out
    }

    /// Reachability from `first` along bindings, indexed by task.
    pub fn reachable_from(&self, first: TaskId) -> Vec<bool> {
        let mut reachable = vec![false; self.tasks.len()];
        if first.index() >= self.tasks.len() {
            return reachable;
        }
        let adj = self.adjacency();
        let mut stack = vec![first.index()];
        reachable[first.index()] = true;

        while let Some(t) = stack.pop() {
            for &next in &adj[t] {
                if !reachable[next] {
                    reachable[next] = true;
                    stack.push(next);
                }
            }
        }
        reachable
    }

    /// Tasks reachable from `first`, in execution order (Kahn's algorithm).
    ///
    /// Fails if a reachable reader is unbound, reads a task that is not
    /// reachable, or if the reachable subgraph has a cycle.
    pub fn topological_order(&self, first: TaskId) -> PipelineResult<Vec<TaskId>> {
        self.node(first)?;
        let reachable = self.reachable_from(first);
        self.check_bound(&reachable)?;

        let n = self.tasks.len();
        let adj = self.adjacency();
        let mut in_degree = vec![0u32; n];
        for (from, succ) in adj.iter().enumerate() {
            if !reachable[from] {
                continue;
            }
            for &to in succ {
                in_degree[to] += 1;
            }
        }

        let mut queue: VecDeque<usize> = VecDeque::from([first.index()]);
        let mut order = Vec::new();
        while let Some(t) = queue.pop_front() {
            order.push(TaskId(t as u32));
            for &next in &adj[t] {
                in_degree[next] -= 1;
                if in_degree[next] == 0 {
                    queue.push_back(next);
                }
            }
        }

        let expected = reachable.iter().filter(|&&r| r).count();
        if order.len() != expected {
            tracing::warn!(
                "Task graph has a cycle! Only {} of {} tasks scheduled.",
                order.len(),
                expected
            );
            return Err(PipelineError::CycleDetected);
        }
        Ok(order)
    }

    /// Clone the module owning `task` for another thread.
    pub(crate) fn clone_module(&self, id: ModuleId) -> PipelineResult<AnyModule> {
        self.module(id)
            .cloned()
            .ok_or_else(|| PipelineError::Config(format!("unknown module {:?}", id)))
    }

    /// Write the tasks reachable from `first` and their bindings in dot format.
    pub fn export_dot<W: Write>(&self, first: TaskId, out: &mut W) -> io::Result<()> {
        let reachable = self.reachable_from(first);
        let tasks: Vec<TaskId> = (0..self.tasks.len())
            .filter(|&t| reachable[t])
            .map(|t| TaskId(t as u32))
            .collect();
        self.write_dot(out, "Graph", &[(String::new(), tasks)], &[])
    }

    /// Dot writer shared by the graph, the sequence, and the pipeline.
    ///
    /// `clusters` with an empty label are written flat. `extra` edges are
    /// drawn dashed with their label.
    pub(crate) fn write_dot<W: Write>(
        &self,
        out: &mut W,
        name: &str,
        clusters: &[(String, Vec<TaskId>)],
        extra: &[(SocketId, SocketId, String)],
    ) -> io::Result<()> {
        writeln!(out, "digraph {} {{", name)?;
        writeln!(out, "  rankdir=LR;")?;
        writeln!(out, "  node [shape=box];")?;

        let mut shown = vec![false; self.tasks.len()];
        for (c, (label, tasks)) in clusters.iter().enumerate() {
            let indent = if label.is_empty() {
                "  "
            } else {
                writeln!(out, "  subgraph cluster_{} {{", c)?;
                writeln!(out, "    label=\"{}\";", label)?;
                "    "
            };
            for &t in tasks {
                if let Some(flag) = shown.get_mut(t.index()) {
                    *flag = true;
                }
                writeln!(out, "{}t{} [label=\"{}\"];", indent, t.0, self.task_label(t))?;
            }
            if !label.is_empty() {
                writeln!(out, "  }}")?;
            }
        }

        for (reader, writer) in self.bindings() {
            if !shown[reader.task().index()] || !shown[writer.task().index()] {
                continue;
            }
            writeln!(
                out,
                "  t{} -> t{} [label=\"{} -> {}\"];",
                writer.task().0,
                reader.task().0,
                self.socket_spec(writer).map_or("?", |s| s.name),
                self.socket_spec(reader).map_or("?", |s| s.name),
            )?;
        }
        for (reader, writer, label) in extra {
            writeln!(
                out,
                "  t{} -> t{} [label=\"{}\", style=dashed];",
                writer.task().0,
                reader.task().0,
                label
            )?;
        }
        writeln!(out, "}}")
    }

    fn adjacency(&self) -> Vec<Vec<usize>> {
        let mut adj = vec![Vec::new(); self.tasks.len()];
        for (reader, writer) in self.bindings() {
            let from = writer.task().index();
            let to = reader.task().index();
            if !adj[from].contains(&to) {
                adj[from].push(to);
            }
        }
        adj
    }

    fn check_bound(&self, reachable: &[bool]) -> PipelineResult<()> {
        for (t, node) in self.tasks.iter().enumerate() {
            if !reachable[t] {
                continue;
            }
            for (s, spec) in node.sockets.iter().enumerate() {
                let socket = TaskId(t as u32).socket(s as u16);
                match (spec.direction, node.bindings[s]) {
                    (SocketDirection::Output, _) => {}
                    (_, None) => {
                        return Err(PipelineError::Unbound {
                            socket,
                            message: format!("{} has no writer", self.socket_label(socket)),
                        })
                    }
                    (_, Some(writer)) if !reachable[writer.task().index()] => {
                        return Err(PipelineError::Unbound {
                            socket,
                            message: format!(
                                "{} reads {}, which is not reachable from the first task",
                                self.socket_label(socket),
                                self.socket_label(writer)
                            ),
                        })
                    }
                    _ => {}
                }
            }
        }
        Ok(())
    }
}
