//! Test data builders for chain configurations

use frameline::{ChainConfig, SocketKind};

/// Builder for relay chain configurations
pub struct ChainBuilder {
    config: ChainConfig,
}

impl ChainBuilder {
    /// One stage with one `SIO` relay, small frames, no simulated work.
    pub fn new() -> Self {
        Self {
            config: ChainConfig {
                data_length: 64,
                sleep_time_us: 0,
                buffer_size: 2,
                ..Default::default()
            },
        }
    }

    /// One relay stage per entry of `threads`, each holding `kinds`.
    pub fn stages(mut self, threads: &[usize], kinds: &[SocketKind]) -> Self {
        self.config.n_threads = threads.to_vec();
        self.config.tasks_per_stage = vec![kinds.len(); threads.len()];
        self.config.socket_types = vec![kinds.to_vec(); threads.len()];
        self
    }

    pub fn data_length(mut self, n: usize) -> Self {
        self.config.data_length = n;
        self
    }

    pub fn buffer_size(mut self, n: usize) -> Self {
        self.config.buffer_size = n;
        self
    }

    pub fn inter_frames(mut self, n: usize) -> Self {
        self.config.n_inter_frames = n;
        self
    }

    pub fn copy_mode(mut self) -> Self {
        self.config.no_copy = false;
        self
    }

    pub fn active_waiting(mut self) -> Self {
        self.config.active_waiting = true;
        self
    }

    pub fn build(self) -> ChainConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chain_builder() {
        let config = ChainBuilder::new()
            .stages(&[1, 3], &[SocketKind::Sio, SocketKind::Sfwd])
            .data_length(32)
            .build();

        assert_eq!(config.n_stages(), 2);
        assert_eq!(config.n_relays(), 4);
        assert_eq!(config.data_length, 32);
        config.validate().unwrap();
    }
}
