//! Relay-shaped plugin modules that misbehave on purpose

use frameline::pipeline::{Flow, ModulePlugin, SocketSpec, TaskError, TaskIo, TaskSpec};
use frameline::DataType;

/// What a [`Faulty`] relay does when it reaches its frame.
#[derive(Clone, Copy, Debug)]
pub enum Fault {
    Error,
    Panic,
}

/// Copies `in` to `out` until frame `at`, then fails.
#[derive(Clone)]
pub struct Faulty {
    n_elmts: usize,
    at: u64,
    fault: Fault,
}

impl Faulty {
    pub const IN: u16 = 0;
    pub const OUT: u16 = 1;

    pub fn new(n_elmts: usize, at: u64, fault: Fault) -> Self {
        Self { n_elmts, at, fault }
    }
}

impl ModulePlugin for Faulty {
    fn name(&self) -> &str {
        "Faulty"
    }

    fn tasks(&self) -> Vec<TaskSpec> {
        vec![TaskSpec {
            name: "relay",
            sockets: vec![
                SocketSpec::input("in", DataType::U8, self.n_elmts),
                SocketSpec::output("out", DataType::U8, self.n_elmts),
            ],
        }]
    }

    fn exec(&mut self, _task: usize, io: &mut TaskIo<'_>) -> Result<Flow, TaskError> {
        if io.frame_id() == self.at {
            match self.fault {
                Fault::Error => return Err(TaskError::new(format!("refusing frame {}", self.at))),
                Fault::Panic => panic!("faulty relay hit frame {}", self.at),
            }
        }
        let input = io.input(Self::IN as usize)?;
        io.output(Self::OUT as usize)?.copy_from_slice(input);
        Ok(Flow::Continue)
    }

    fn clone_module(&self) -> Box<dyn ModulePlugin> {
        Box::new(self.clone())
    }
}
