use crate::pipeline::id::{ModuleId, SocketId, TaskId};

/// Compiled execution plan for one thread of a sequence or a stage.
///
/// Every value that flows between tasks gets one local buffer. Steps address
/// buffers by index only, so a worker can run the plan without touching the
/// graph.
#[derive(Debug, Clone, Default)]
pub struct CompiledPlan {
    /// Steps in execution order.
    pub steps: Vec<Step>,

    /// Local buffers, indexed by `Route::buffer`.
    pub buffers: Vec<BufferSpec>,

    /// Graph modules used by the steps; `Step::module` indexes this list.
    pub modules: Vec<ModuleId>,

    /// Buffers filled from the input adaptor, one per channel.
    pub imports: Vec<usize>,

    /// Buffers handed to the output adaptor, one per channel.
    pub exports: Vec<usize>,

    /// Whether step 0 is the initial task, whose flow controls the stream.
    pub leads_stream: bool,

    /// Compilation statistics
    pub stats: PlanStats,
}

/// One task invocation.
#[derive(Debug, Clone)]
pub struct Step {
    pub task: TaskId,
    /// Index into `CompiledPlan::modules`.
    pub module: usize,
    /// Task index inside the module.
    pub task_index: usize,
    /// One route per socket, in socket order.
    pub routes: Vec<Route>,
    /// `(source, destination)` buffer copies done before the task runs.
    pub copies: Vec<(usize, usize)>,
}

/// Where a socket's bytes live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Route {
    pub buffer: usize,
    pub writable: bool,
}

/// Shape of a local buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferSpec {
    /// Writer socket owning the value.
    pub key: SocketId,
    /// Bytes per frame.
    pub frame_bytes: usize,
}

/// Statistics about the compiled plan
#[derive(Debug, Clone, Default)]
pub struct PlanStats {
    /// Number of steps
    pub steps: usize,

    /// Number of local buffers
    pub buffers: usize,

    /// Readers that share the storage of their writer
    pub aliased: usize,

    /// Copies inserted in front of forward sockets
    pub copies: usize,

    /// Compilation time in microseconds
    pub compile_time_us: u64,
}

impl CompiledPlan {
    /// Check if the plan has any steps
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Bytes of every local buffer for a batch of `n_frames`.
    pub fn buffer_sizes(&self, n_frames: usize) -> impl Iterator<Item = usize> + '_ {
        self.buffers.iter().map(move |b| b.frame_bytes * n_frames)
    }
}
