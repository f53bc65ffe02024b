//! # Frameline: staged pipeline runtime for frame streams
//!
//! Modules expose tasks, tasks exchange fixed-size frames through typed
//! sockets, and a task graph runs either as a sequence (every task on each
//! thread) or as a pipeline of stages on their own threads, joined by bounded
//! fan-out/fan-in adaptors.
//!
//! ## Architecture
//!
//! - **Pipeline**: graph, compiler, workers, adaptors, and the stage scheduler
//! - **Chain**: the generic source → relays → sink benchmark graph
//! - **Config**: `ChainConfig`, loaded from TOML or JSON
//!
//! ## Example
//!
//! ```no_run
//! use frameline::pipeline::{
//!     Graph, Pipeline, PipelineOptions, Relayer, Sink, SinkTarget, Source, StageBounds,
//! };
//!
//! fn main() -> frameline::Result<()> {
//!     let mut graph = Graph::new();
//!     let src = graph.add_module(Source::from_bytes(vec![7u8; 4096], 256));
//!     let rly = graph.add_module(Relayer::new(256));
//!     let snk = graph.add_module(Sink::new(256, SinkTarget::memory()));
//!
//!     let gen = graph.task(src, "generate")?;
//!     let relay = graph.task(rly, "relay")?;
//!     let send = graph.task(snk, "send_count")?;
//!     graph.bind(relay.socket(Relayer::IN), gen.socket(Source::OUT_DATA))?;
//!     graph.bind(send.socket(Sink::IN_DATA), relay.socket(Relayer::OUT))?;
//!     graph.bind(send.socket(Sink::IN_COUNT), gen.socket(Source::OUT_COUNT))?;
//!
//!     let stages = vec![
//!         StageBounds::single(gen),
//!         StageBounds::new(vec![relay], vec![relay]),
//!         StageBounds::new(vec![send], vec![]),
//!     ];
//!     let options = PipelineOptions::new(vec![1, 4, 1]).with_buffer_sizes(vec![8, 8]);
//!     let mut pipeline = Pipeline::new(graph, gen, stages, options)?;
//!     pipeline.exec()?;
//!     Ok(())
//! }
//! ```

pub mod chain;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod types;

// Re-export commonly used types
pub use chain::{Chain, RunSummary};
pub use config::{ChainConfig, SocketKind};
pub use error::{FramelineError, Result, ResultExt};
pub use pipeline::{Pipeline, PipelineError, PipelineOptions, Sequence, StageBounds};
pub use types::DataType;
