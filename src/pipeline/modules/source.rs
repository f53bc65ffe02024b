//! Source module: streams a byte buffer in fixed-size frames.
//!
//! Task `generate` writes `n_elmts` bytes per frame to `out_data` and the
//! number of valid bytes to `out_count`. The final frame is zero-padded.

use crate::pipeline::socket::SocketSpec;
use crate::pipeline::task::{Flow, TaskError, TaskIo, TaskSpec};
use crate::types::DataType;
use std::path::Path;
use std::sync::Arc;

/// Byte stream source.
///
/// Replicas share the underlying bytes but keep their own read position.
#[derive(Clone)]
pub struct Source {
    data: Arc<[u8]>,
    n_elmts: usize,
    position: usize,
    auto_reset: bool,
    done: bool,
}

impl Source {
    /// Task index of `generate`.
    pub const GENERATE: usize = 0;
    /// Socket index of `generate::out_data`.
    pub const OUT_DATA: u16 = 0;
    /// Socket index of `generate::out_count`.
    pub const OUT_COUNT: u16 = 1;

    pub fn from_bytes(data: impl Into<Arc<[u8]>>, n_elmts: usize) -> Self {
        Self {
            data: data.into(),
            n_elmts,
            position: 0,
            auto_reset: false,
            done: false,
        }
    }

    pub fn from_file(path: impl AsRef<Path>, n_elmts: usize) -> std::io::Result<Self> {
        let bytes = std::fs::read(path)?;
        Ok(Self::from_bytes(bytes, n_elmts))
    }

    /// Rewind at the end of the data instead of ending the stream.
    pub fn with_auto_reset(mut self, auto_reset: bool) -> Self {
        self.auto_reset = auto_reset;
        self
    }

    pub fn name(&self) -> &str {
        "Source"
    }

    pub fn tasks(&self) -> Vec<TaskSpec> {
        vec![TaskSpec {
            name: "generate",
            sockets: vec![
                SocketSpec::output("out_data", DataType::U8, self.n_elmts),
                SocketSpec::output("out_count", DataType::U32, 1),
            ],
        }]
    }

    /// Whether the whole buffer has been emitted.
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Total number of bytes in the stream.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn exec(&mut self, task: usize, io: &mut TaskIo<'_>) -> Result<Flow, TaskError> {
        if task != Self::GENERATE {
            return Err(TaskError::new(format!("Source has no task {}", task)));
        }
        if self.done || self.data.is_empty() || self.n_elmts == 0 {
            return Ok(Flow::Empty);
        }

        let n = self.n_elmts;
        let mut counts = Vec::with_capacity(io.n_frames());
        {
            let out = io.output(Self::OUT_DATA as usize)?;
            for frame in out.chunks_exact_mut(n) {
                let remaining = self.data.len() - self.position;
                let take = n.min(remaining);
                frame[..take].copy_from_slice(&self.data[self.position..self.position + take]);
                frame[take..].fill(0);
                counts.push(take as u32);

                self.position += take;
                if self.position >= self.data.len() {
                    if self.auto_reset {
                        self.position = 0;
                    } else {
                        self.done = true;
                    }
                }
            }
        }

        let out_count = io.output(Self::OUT_COUNT as usize)?;
        for (slot, count) in out_count.chunks_exact_mut(4).zip(counts) {
            slot.copy_from_slice(&count.to_le_bytes());
        }

        Ok(if self.done { Flow::Last } else { Flow::Continue })
    }

    pub fn reset(&mut self) {
        self.position = 0;
        self.done = false;
    }
}
