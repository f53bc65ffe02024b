//! Module and task abstraction for the pipeline.
//!
//! A *module* owns state and exposes one or more *tasks*; each task declares
//! a fixed list of sockets and an execution entry point.
//!
//! Two-layer design:
//! - **`ModulePlugin` trait**: for user-defined modules.
//! - **`BuiltinModule` enum**: for the built-in modules. The compiler can
//!   inline match arms, eliminating dynamic dispatch overhead on the hot path.
//!
//! `AnyModule` wraps either variant so the graph can handle both uniformly.
//! Modules are cloned once per worker thread, so every thread runs its own
//! replica.

use crate::pipeline::modules::{Relayer, Sink, Source};
use crate::pipeline::socket::SocketSpec;
use crate::pipeline::stats::TaskStats;
use thiserror::Error;

/// Outcome of one task invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// A frame was produced and more will follow.
    Continue,
    /// A frame was produced and it is the final one of the stream.
    Last,
    /// No frame was produced: the stream is already exhausted.
    Empty,
}

/// Failure reported by a task body.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct TaskError(pub String);

impl TaskError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Declaration of one task of a module.
#[derive(Debug, Clone)]
pub struct TaskSpec {
    pub name: &'static str,
    pub sockets: Vec<SocketSpec>,
}

/// Data view of one socket during an invocation.
pub enum SocketData<'a> {
    Read(&'a [u8]),
    Write(&'a mut [u8]),
}

/// Socket buffers handed to a task body, indexed like the task's sockets.
pub struct TaskIo<'a> {
    sockets: Vec<SocketData<'a>>,
    n_frames: usize,
    frame_id: u64,
}

impl<'a> TaskIo<'a> {
    pub fn new(sockets: Vec<SocketData<'a>>, n_frames: usize, frame_id: u64) -> Self {
        Self {
            sockets,
            n_frames,
            frame_id,
        }
    }

    /// Frames batched into this invocation.
    #[inline]
    pub fn n_frames(&self) -> usize {
        self.n_frames
    }

    /// Id of the first frame of this invocation.
    #[inline]
    pub fn frame_id(&self) -> u64 {
        self.frame_id
    }

    /// Read-only bytes of an input socket.
    ///
    /// The returned slice is not tied to `self`, so it can be held while an
    /// output is borrowed mutably.
    pub fn input(&self, index: usize) -> Result<&'a [u8], TaskError> {
        match self.sockets.get(index) {
            Some(SocketData::Read(data)) => Ok(*data),
            Some(SocketData::Write(_)) => Err(TaskError::new(format!(
                "socket {} is writable, not an input",
                index
            ))),
            None => Err(TaskError::new(format!("no socket {}", index))),
        }
    }

    /// Writable bytes of an output or forward socket.
    pub fn output(&mut self, index: usize) -> Result<&mut [u8], TaskError> {
        match self.sockets.get_mut(index) {
            Some(SocketData::Write(data)) => Ok(&mut **data),
            Some(SocketData::Read(_)) => Err(TaskError::new(format!(
                "socket {} is read-only, not an output",
                index
            ))),
            None => Err(TaskError::new(format!("no socket {}", index))),
        }
    }
}

/// Trait for user-defined modules.
pub trait ModulePlugin: Send {
    /// Module type name, used to group statistics.
    fn name(&self) -> &str;

    /// Task declarations. Must return the same list on every call.
    fn tasks(&self) -> Vec<TaskSpec>;

    /// Run task `task` (index into `tasks()`) on the given sockets.
    fn exec(&mut self, task: usize, io: &mut TaskIo<'_>) -> Result<Flow, TaskError>;

    /// Restore the module to its freshly constructed state.
    fn reset(&mut self) {}

    /// Independent replica for another worker thread.
    fn clone_module(&self) -> Box<dyn ModulePlugin>;
}

/// Enum dispatch for built-in modules, no dynamic dispatch.
#[derive(Clone)]
pub enum BuiltinModule {
    Source(Source),
    Sink(Sink),
    Relayer(Relayer),
}

impl BuiltinModule {
    pub fn name(&self) -> &str {
        match self {
            BuiltinModule::Source(m) => m.name(),
            BuiltinModule::Sink(m) => m.name(),
            BuiltinModule::Relayer(m) => m.name(),
        }
    }

    pub fn tasks(&self) -> Vec<TaskSpec> {
        match self {
            BuiltinModule::Source(m) => m.tasks(),
            BuiltinModule::Sink(m) => m.tasks(),
            BuiltinModule::Relayer(m) => m.tasks(),
        }
    }

    pub fn exec(&mut self, task: usize, io: &mut TaskIo<'_>) -> Result<Flow, TaskError> {
        match self {
            BuiltinModule::Source(m) => m.exec(task, io),
            BuiltinModule::Sink(m) => m.exec(task, io),
            BuiltinModule::Relayer(m) => m.exec(task, io),
        }
    }

    pub fn reset(&mut self) {
        match self {
            BuiltinModule::Source(m) => m.reset(),
            BuiltinModule::Sink(m) => m.reset(),
            BuiltinModule::Relayer(m) => m.reset(),
        }
    }
}

/// Wrapper that holds either a built-in module (enum dispatch) or a plugin (trait object).
pub enum AnyModule {
    Builtin(BuiltinModule),
    Plugin(Box<dyn ModulePlugin>),
}

impl AnyModule {
    pub fn name(&self) -> &str {
        match self {
            AnyModule::Builtin(m) => m.name(),
            AnyModule::Plugin(m) => m.name(),
        }
    }

    pub fn tasks(&self) -> Vec<TaskSpec> {
        match self {
            AnyModule::Builtin(m) => m.tasks(),
            AnyModule::Plugin(m) => m.tasks(),
        }
    }

    pub fn exec(&mut self, task: usize, io: &mut TaskIo<'_>) -> Result<Flow, TaskError> {
        match self {
            AnyModule::Builtin(m) => m.exec(task, io),
            AnyModule::Plugin(m) => m.exec(task, io),
        }
    }

    pub fn reset(&mut self) {
        match self {
            AnyModule::Builtin(m) => m.reset(),
            AnyModule::Plugin(m) => m.reset(),
        }
    }
}

impl Clone for AnyModule {
    fn clone(&self) -> Self {
        match self {
            AnyModule::Builtin(m) => AnyModule::Builtin(m.clone()),
            AnyModule::Plugin(m) => AnyModule::Plugin(m.clone_module()),
        }
    }
}

impl From<Source> for AnyModule {
    fn from(m: Source) -> Self {
        AnyModule::Builtin(BuiltinModule::Source(m))
    }
}

impl From<Sink> for AnyModule {
    fn from(m: Sink) -> Self {
        AnyModule::Builtin(BuiltinModule::Sink(m))
    }
}

impl From<Relayer> for AnyModule {
    fn from(m: Relayer) -> Self {
        AnyModule::Builtin(BuiltinModule::Relayer(m))
    }
}

impl From<Box<dyn ModulePlugin>> for AnyModule {
    fn from(m: Box<dyn ModulePlugin>) -> Self {
        AnyModule::Plugin(m)
    }
}

/// Per-task execution flags and counters.
///
/// Lives in the graph and is copied into every replica when a sequence or a
/// pipeline is built.
#[derive(Debug, Clone)]
pub struct TaskState {
    module_name: String,
    task_name: &'static str,
    debug: bool,
    debug_limit: usize,
    stats_enabled: bool,
    fast: bool,
    stats: TaskStats,
}

impl TaskState {
    pub fn new(module_name: impl Into<String>, task_name: &'static str) -> Self {
        Self {
            module_name: module_name.into(),
            task_name,
            debug: false,
            debug_limit: usize::MAX,
            stats_enabled: false,
            fast: false,
            stats: TaskStats::default(),
        }
    }

    pub fn module_name(&self) -> &str {
        &self.module_name
    }

    pub fn task_name(&self) -> &'static str {
        self.task_name
    }

    /// `module::task`
    pub fn full_name(&self) -> String {
        format!("{}::{}", self.module_name, self.task_name)
    }

    /// Clear the counters.
    pub fn reset(&mut self) {
        self.stats = TaskStats::default();
    }

    /// Dump socket contents on every invocation.
    pub fn set_debug(&mut self, debug: bool) {
        self.debug = debug;
    }

    /// Maximum number of elements printed per socket in debug mode.
    pub fn set_debug_limit(&mut self, limit: usize) {
        self.debug_limit = limit;
    }

    /// Time every invocation.
    pub fn set_stats(&mut self, stats: bool) {
        self.stats_enabled = stats;
    }

    /// Skip the per-invocation socket size checks.
    pub fn set_fast(&mut self, fast: bool) {
        self.fast = fast;
    }

    pub fn is_debug(&self) -> bool {
        self.debug
    }

    pub fn debug_limit(&self) -> usize {
        self.debug_limit
    }

    pub fn is_stats(&self) -> bool {
        self.stats_enabled
    }

    pub fn is_fast(&self) -> bool {
        self.fast
    }

    pub fn n_calls(&self) -> u64 {
        self.stats.n_calls
    }

    pub fn stats(&self) -> &TaskStats {
        &self.stats
    }

    pub(crate) fn stats_mut(&mut self) -> &mut TaskStats {
        &mut self.stats
    }
}
