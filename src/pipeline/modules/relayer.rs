//! Relayer module: identity tasks with an optional simulated workload.
//!
//! - `relay`: copies `in` to `out`.
//! - `relayf`: leaves `fwd` untouched (in-place forward).

use crate::pipeline::socket::SocketSpec;
use crate::pipeline::task::{Flow, TaskError, TaskIo, TaskSpec};
use crate::types::DataType;
use std::time::{Duration, Instant};

/// Identity relay.
#[derive(Clone)]
pub struct Relayer {
    name: String,
    datatype: DataType,
    n_elmts: usize,
    ns: u64,
}

impl Relayer {
    /// Task index of `relay`.
    pub const RELAY: usize = 0;
    /// Task index of `relayf`.
    pub const RELAYF: usize = 1;
    /// Socket index of `relay::in`.
    pub const IN: u16 = 0;
    /// Socket index of `relay::out`.
    pub const OUT: u16 = 1;
    /// Socket index of `relayf::fwd`.
    pub const FWD: u16 = 0;

    pub fn new(n_elmts: usize) -> Self {
        Self::with_datatype(DataType::U8, n_elmts)
    }

    pub fn with_datatype(datatype: DataType, n_elmts: usize) -> Self {
        Self {
            name: "Relayer".to_string(),
            datatype,
            n_elmts,
            ns: 0,
        }
    }

    /// Name reported in statistics and graph exports.
    pub fn with_custom_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Simulated processing time per frame, in nanoseconds.
    pub fn set_ns(&mut self, ns: u64) {
        self.ns = ns;
    }

    pub fn ns(&self) -> u64 {
        self.ns
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tasks(&self) -> Vec<TaskSpec> {
        vec![
            TaskSpec {
                name: "relay",
                sockets: vec![
                    SocketSpec::input("in", self.datatype, self.n_elmts),
                    SocketSpec::output("out", self.datatype, self.n_elmts),
                ],
            },
            TaskSpec {
                name: "relayf",
                sockets: vec![SocketSpec::forward("fwd", self.datatype, self.n_elmts)],
            },
        ]
    }

    pub fn exec(&mut self, task: usize, io: &mut TaskIo<'_>) -> Result<Flow, TaskError> {
        match task {
            Self::RELAY => {
                let input = io.input(Self::IN as usize)?;
                io.output(Self::OUT as usize)?.copy_from_slice(input);
            }
            Self::RELAYF => {}
            _ => return Err(TaskError::new(format!("Relayer has no task {}", task))),
        }
        self.busy_wait(io.n_frames());
        Ok(Flow::Continue)
    }

    pub fn reset(&mut self) {}

    fn busy_wait(&self, n_frames: usize) {
        if self.ns == 0 {
            return;
        }
        let target = Duration::from_nanos(self.ns.saturating_mul(n_frames as u64));
        let start = Instant::now();
        // Sleep for the bulk, spin for sub-millisecond accuracy
        if target > Duration::from_millis(2) {
            std::thread::sleep(target - Duration::from_millis(1));
        }
        while start.elapsed() < target {
            std::hint::spin_loop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::task::SocketData;

    #[test]
    fn test_relay_copies() {
        let mut relayer = Relayer::new(4);
        let input = [1u8, 2, 3, 4];
        let mut output = [0u8; 4];
        let mut io = TaskIo::new(
            vec![SocketData::Read(&input), SocketData::Write(&mut output)],
            1,
            0,
        );
        assert_eq!(relayer.exec(Relayer::RELAY, &mut io).unwrap(), Flow::Continue);
        drop(io);
        assert_eq!(output, input);
    }

    #[test]
    fn test_relayf_keeps_data() {
        let mut relayer = Relayer::new(2);
        let mut fwd = [5u8, 6];
        let mut io = TaskIo::new(vec![SocketData::Write(&mut fwd)], 1, 0);
        relayer.exec(Relayer::RELAYF, &mut io).unwrap();
        drop(io);
        assert_eq!(fwd, [5, 6]);
    }

    #[test]
    fn test_busy_wait_lasts() {
        let mut relayer = Relayer::new(1).with_custom_name("Relayer0");
        relayer.set_ns(200_000);
        let mut fwd = [0u8];
        let mut io = TaskIo::new(vec![SocketData::Write(&mut fwd)], 2, 0);
        let start = Instant::now();
        relayer.exec(Relayer::RELAYF, &mut io).unwrap();
        assert!(start.elapsed() >= Duration::from_micros(400));
        assert_eq!(relayer.name(), "Relayer0");
    }

    #[test]
    fn test_unknown_task() {
        let mut relayer = Relayer::new(1);
        let mut io = TaskIo::new(vec![], 1, 0);
        assert!(relayer.exec(7, &mut io).is_err());
    }
}
