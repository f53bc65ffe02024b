//! Built-in pipeline module implementations.

pub mod relayer;
pub mod sink;
pub mod source;

pub use relayer::Relayer;
pub use sink::{Sink, SinkTarget};
pub use source::Source;
