//! Sink module: appends the valid bytes of every frame to a target.
//!
//! Task `send_count` reads `n_elmts` bytes per frame from `in_data` and the
//! number of valid bytes from `in_count`, then writes that prefix out.

use crate::pipeline::socket::SocketSpec;
use crate::pipeline::task::{Flow, TaskError, TaskIo, TaskSpec};
use crate::types::DataType;
use parking_lot::Mutex;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Arc;

/// Where a sink writes. Cloning shares the destination.
#[derive(Clone)]
pub enum SinkTarget {
    Memory(Arc<Mutex<Vec<u8>>>),
    File(Arc<Mutex<BufWriter<File>>>),
}

impl SinkTarget {
    pub fn memory() -> Self {
        SinkTarget::Memory(Arc::new(Mutex::new(Vec::new())))
    }

    /// Create (or truncate) `path`.
    pub fn file(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let file = File::create(path)?;
        Ok(SinkTarget::File(Arc::new(Mutex::new(BufWriter::new(file)))))
    }

    fn write_all(&self, bytes: &[u8]) -> std::io::Result<()> {
        match self {
            SinkTarget::Memory(buf) => {
                buf.lock().extend_from_slice(bytes);
                Ok(())
            }
            SinkTarget::File(w) => w.lock().write_all(bytes),
        }
    }

    pub fn flush(&self) -> std::io::Result<()> {
        match self {
            SinkTarget::Memory(_) => Ok(()),
            SinkTarget::File(w) => w.lock().flush(),
        }
    }

    /// Bytes written so far (memory targets only).
    pub fn contents(&self) -> Option<Vec<u8>> {
        match self {
            SinkTarget::Memory(buf) => Some(buf.lock().clone()),
            SinkTarget::File(_) => None,
        }
    }
}

/// Byte stream sink.
#[derive(Clone)]
pub struct Sink {
    n_elmts: usize,
    target: SinkTarget,
}

impl Sink {
    /// Task index of `send_count`.
    pub const SEND_COUNT: usize = 0;
    /// Socket index of `send_count::in_data`.
    pub const IN_DATA: u16 = 0;
    /// Socket index of `send_count::in_count`.
    pub const IN_COUNT: u16 = 1;

    pub fn new(n_elmts: usize, target: SinkTarget) -> Self {
        Self { n_elmts, target }
    }

    pub fn target(&self) -> &SinkTarget {
        &self.target
    }

    pub fn name(&self) -> &str {
        "Sink"
    }

    pub fn tasks(&self) -> Vec<TaskSpec> {
        vec![TaskSpec {
            name: "send_count",
            sockets: vec![
                SocketSpec::input("in_data", DataType::U8, self.n_elmts),
                SocketSpec::input("in_count", DataType::U32, 1),
            ],
        }]
    }

    pub fn exec(&mut self, task: usize, io: &mut TaskIo<'_>) -> Result<Flow, TaskError> {
        if task != Self::SEND_COUNT {
            return Err(TaskError::new(format!("Sink has no task {}", task)));
        }
        if self.n_elmts == 0 {
            return Ok(Flow::Continue);
        }
        let data = io.input(Self::IN_DATA as usize)?;
        let counts = io.input(Self::IN_COUNT as usize)?;

        for (frame, count) in data.chunks_exact(self.n_elmts).zip(counts.chunks_exact(4)) {
            let count = u32::from_le_bytes([count[0], count[1], count[2], count[3]]) as usize;
            if count > self.n_elmts {
                return Err(TaskError::new(format!(
                    "count {} exceeds frame size {}",
                    count, self.n_elmts
                )));
            }
            self.target
                .write_all(&frame[..count])
                .map_err(|e| TaskError::new(format!("write failed: {}", e)))?;
        }
        Ok(Flow::Continue)
    }

    pub fn reset(&mut self) {}
}
