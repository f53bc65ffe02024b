//! Pipeline-specific error types.

use crate::pipeline::id::{SocketId, TaskId};
use thiserror::Error;

/// Errors that can occur within the pipeline runtime.
///
/// Configuration and binding errors are raised before any worker thread is
/// spawned. Task failures and worker panics are raised by `exec` after every
/// worker has unwound.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Socket {socket:?} is not bound: {message}")]
    Unbound { socket: SocketId, message: String },

    #[error("Invalid binding: {0}")]
    InvalidBinding(String),

    #[error("Cycle detected in task graph")]
    CycleDetected,

    #[error("Unknown socket '{name}' on task {task:?}")]
    UnknownSocket { task: TaskId, name: String },

    #[error("Pinning policy '{policy}' cannot be resolved: {message}")]
    Pinning { policy: String, message: String },

    #[error("Task '{task}' failed on frame {frame_id}: {message}")]
    Task {
        task: String,
        frame_id: u64,
        message: String,
    },

    #[error("Socket '{socket}' holds {actual} bytes, expected {expected}")]
    SocketSize {
        socket: String,
        expected: usize,
        actual: usize,
    },

    #[error("Frame shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("Worker thread of stage {stage} panicked: {message}")]
    WorkerPanicked { stage: usize, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type PipelineResult<T> = std::result::Result<T, PipelineError>;

/// Best-effort text of a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
