//! Staged pipeline runtime.
//!
//! Modules expose tasks; tasks exchange typed frames through sockets. A
//! `Graph` holds modules and bindings. It runs either as a `Sequence` (every
//! task on each thread, in topological order) or as a `Pipeline` (stages on
//! their own threads, joined by adaptors).
//!
//! # Architecture
//!
//! ```text
//! Graph ──► PipelineCompiler ──► CompiledPlan ──► Worker (one per thread)
//!   │
//!   ├──► Sequence:  Worker × n_threads
//!   └──► Pipeline:  Stage[Worker × t] ─► Adaptor ─► Stage[Worker × t] ─► ...
//! ```
//!
//! # Design
//!
//! - **Enum dispatch on hot path**: `BuiltinModule` enum for the built-in modules.
//! - **Compiled plans**: socket bindings are resolved once into buffer indices.
//! - **Single owner per buffer**: frames move between stages by copy or by
//!   exchanging `Vec`s, never by sharing.

pub mod adaptor;
pub mod compiled_plan;
pub mod compiler;
pub mod error;
pub mod executor;
pub mod graph;
pub mod id;
pub mod modules;
pub mod pinning;
pub mod sequence;
pub mod socket;
pub mod stage;
pub mod stats;
pub mod task;
pub mod worker;

pub use adaptor::{Adaptor, ChannelSpec, Consumer, Producer, Pulled, Topology, WaitStatus};
pub use error::{PipelineError, PipelineResult};
pub use executor::{Pipeline, PipelineOptions, StageBounds};
pub use graph::Graph;
pub use id::{ModuleId, SocketId, TaskId};
pub use modules::{Relayer, Sink, SinkTarget, Source};
pub use pinning::PinningPolicy;
pub use sequence::Sequence;
pub use socket::{SocketDirection, SocketSpec};
pub use stage::{Stage, StageReport};
pub use stats::{TaskStats, TaskTypeReport};
pub use task::{AnyModule, BuiltinModule, Flow, ModulePlugin, TaskError, TaskIo, TaskSpec, TaskState};
