//! Configuration module for frameline
//!
//! This module describes the generic relay chain run by the `frameline`
//! binary:
//!
//! ```text
//! [Source] ─► stage 1: Relayer × tasks ─► ... ─► stage n ─► [Sink]
//! ```
//!
//! A [`ChainConfig`] can be built from command line flags or loaded from a
//! TOML or JSON file; the format is picked from the file extension.
//!
//! # Example
//!
//! ```ignore
//! use frameline::config::ChainConfig;
//!
//! let mut config = ChainConfig::load("chain.toml")?;
//! config.buffer_size = 4;
//! config.validate()?;
//! config.save("chain.json")?;
//! ```

use crate::error::{FramelineError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Default bytes per frame
pub const DEFAULT_DATA_LENGTH: usize = 2048;

/// Default adaptor slots per endpoint
pub const DEFAULT_BUFFER_SIZE: usize = 16;

/// Default simulated work per relay and frame, in microseconds
pub const DEFAULT_SLEEP_TIME_US: u64 = 5;

/// Default output file of the sink
pub const DEFAULT_OUT_FILEPATH: &str = "file.out";

/// Elements printed per socket when task debugging is on
pub const DEBUG_LIMIT: usize = 16;

// ==================== Socket Kind ====================

/// How a relay task passes its frame on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SocketKind {
    /// `relay`: separate input and output sockets
    #[serde(rename = "SIO")]
    Sio,
    /// `relayf`: one forward socket, modified in place
    #[serde(rename = "SFWD")]
    Sfwd,
}

impl SocketKind {
    /// Name of the relay task using this kind of socket
    pub fn task_name(self) -> &'static str {
        match self {
            SocketKind::Sio => "relay",
            SocketKind::Sfwd => "relayf",
        }
    }
}

impl FromStr for SocketKind {
    type Err = FramelineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "SIO" => Ok(SocketKind::Sio),
            "SFWD" => Ok(SocketKind::Sfwd),
            other => Err(FramelineError::Config(format!(
                "Invalid socket type '{}', it should be SFWD or SIO",
                other
            ))),
        }
    }
}

impl fmt::Display for SocketKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SocketKind::Sio => write!(f, "SIO"),
            SocketKind::Sfwd => write!(f, "SFWD"),
        }
    }
}

// ==================== Chain Config ====================

/// Shape and runtime settings of the generic relay chain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChainConfig {
    /// Threads of every relay stage (source and sink stages always run on one)
    pub n_threads: Vec<usize>,

    /// Relay tasks of every relay stage
    pub tasks_per_stage: Vec<usize>,

    /// Socket kind of every relay task, grouped by stage
    pub socket_types: Vec<Vec<SocketKind>>,

    /// Frames processed by one task invocation
    pub n_inter_frames: usize,

    /// Simulated work per relay and frame, in microseconds
    pub sleep_time_us: u64,

    /// Bytes per frame
    pub data_length: usize,

    /// Adaptor slots per endpoint
    pub buffer_size: usize,

    /// Where to write the graph in dot format
    pub dot_filepath: Option<PathBuf>,

    /// File streamed by the source
    pub in_filepath: Option<PathBuf>,

    /// File written by the sink
    pub out_filepath: PathBuf,

    /// Work in place on forward sockets and swap buffers with adaptors
    pub no_copy: bool,

    /// Time every task and print the statistics
    pub print_stats: bool,

    /// Run the sequence one task at a time
    pub step_by_step: bool,

    /// Dump socket contents on every task invocation
    pub debug: bool,

    /// Run a sequence instead of a pipeline
    pub force_sequence: bool,

    /// Spin instead of blocking in adaptors
    pub active_waiting: bool,

    /// Thread pinning policy of the relay stages, empty for none
    pub pinning_policy: String,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            n_threads: vec![1],
            tasks_per_stage: vec![1],
            socket_types: vec![vec![SocketKind::Sio]],
            n_inter_frames: 1,
            sleep_time_us: DEFAULT_SLEEP_TIME_US,
            data_length: DEFAULT_DATA_LENGTH,
            buffer_size: DEFAULT_BUFFER_SIZE,
            dot_filepath: None,
            in_filepath: None,
            out_filepath: PathBuf::from(DEFAULT_OUT_FILEPATH),
            no_copy: true,
            print_stats: false,
            step_by_step: false,
            debug: false,
            force_sequence: false,
            active_waiting: false,
            pinning_policy: String::new(),
        }
    }
}

impl ChainConfig {
    /// Number of relay stages
    pub fn n_stages(&self) -> usize {
        self.tasks_per_stage.len()
    }

    /// Total number of relay tasks
    pub fn n_relays(&self) -> usize {
        self.tasks_per_stage.iter().sum()
    }

    /// Give every task of a stage the same socket kind
    pub fn set_socket_types_per_stage(&mut self, kinds: &[SocketKind]) -> Result<()> {
        if kinds.len() != self.tasks_per_stage.len() {
            return Err(FramelineError::Config(format!(
                "{} socket types for {} stages",
                kinds.len(),
                self.tasks_per_stage.len()
            )));
        }
        self.socket_types = kinds
            .iter()
            .zip(&self.tasks_per_stage)
            .map(|(&kind, &n)| vec![kind; n])
            .collect();
        Ok(())
    }

    /// Check the stage vectors against each other and the scalar settings
    pub fn validate(&self) -> Result<()> {
        let n_stages = self.n_stages();
        if n_stages == 0 {
            return Err(FramelineError::Config(
                "At least one relay stage is required".to_string(),
            ));
        }
        if n_stages != self.n_threads.len() || n_stages != self.socket_types.len() {
            return Err(FramelineError::Config(format!(
                "Number of stages is incoherent: {} thread counts, {} task counts, {} socket type lists",
                self.n_threads.len(),
                n_stages,
                self.socket_types.len()
            )));
        }
        for (i, (kinds, &n)) in self.socket_types.iter().zip(&self.tasks_per_stage).enumerate() {
            if n == 0 {
                return Err(FramelineError::Config(format!("Stage {} has no task", i)));
            }
            if kinds.len() != n {
                return Err(FramelineError::Config(format!(
                    "Number of tasks is incompatible with number of sockets for stage {}",
                    i
                )));
            }
        }
        if self.n_threads.contains(&0) {
            return Err(FramelineError::Config(
                "Every stage needs at least one thread".to_string(),
            ));
        }
        if self.data_length == 0 {
            return Err(FramelineError::Config("Data length must be positive".to_string()));
        }
        if self.n_inter_frames == 0 {
            return Err(FramelineError::Config(
                "Number of inter frames must be positive".to_string(),
            ));
        }
        if self.buffer_size == 0 {
            return Err(FramelineError::Config("Buffer size must be positive".to_string()));
        }
        Ok(())
    }

    // ==================== Files ====================

    /// Load a config from a `.toml` or `.json` file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let format = ConfigFormat::of(path)?;
        let content = std::fs::read_to_string(path).map_err(|e| {
            FramelineError::Config(format!("Failed to read chain config {:?}: {}", path, e))
        })?;

        let config: ChainConfig = match format {
            ConfigFormat::Toml => toml::from_str(&content)?,
            ConfigFormat::Json => serde_json::from_str(&content)?,
        };
        tracing::debug!("Loaded chain config from {:?}", path);
        Ok(config)
    }

    /// Save the config as `.toml` or `.json`, following the file extension
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let content = match ConfigFormat::of(path)? {
            ConfigFormat::Toml => toml::to_string_pretty(self)?,
            ConfigFormat::Json => serde_json::to_string_pretty(self)?,
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content).map_err(|e| {
            FramelineError::Config(format!("Failed to write chain config {:?}: {}", path, e))
        })
    }
}

enum ConfigFormat {
    Toml,
    Json,
}

impl ConfigFormat {
    fn of(path: &Path) -> Result<Self> {
        match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => Ok(ConfigFormat::Toml),
            Some("json") => Ok(ConfigFormat::Json),
            _ => Err(FramelineError::Config(format!(
                "Unsupported config file {:?}: expected a .toml or .json extension",
                path
            ))),
        }
    }
}

// ==================== Flag Parsing ====================

/// Parse `"(2,1,4)"` (parentheses optional) into a list of counts
pub fn parse_counts(text: &str) -> Result<Vec<usize>> {
    split_list(text)
        .into_iter()
        .map(|item| {
            item.parse::<usize>().map_err(|_| {
                FramelineError::Config(format!("'{}' is not a count in '{}'", item, text))
            })
        })
        .collect()
}

/// Parse `"(SIO,SFWD)"`: one socket kind per stage
pub fn parse_socket_types_per_stage(text: &str) -> Result<Vec<SocketKind>> {
    split_list(text).into_iter().map(str::parse).collect()
}

/// Parse `"((SIO,SFWD),(SFWD))"`: one socket kind per task, grouped by stage
pub fn parse_socket_types_per_task(text: &str) -> Result<Vec<Vec<SocketKind>>> {
    let inner = strip_parens(text);
    let mut stages = Vec::new();
    let mut rest = inner;
    while let Some(open) = rest.find('(') {
        let close = rest[open..]
            .find(')')
            .map(|c| open + c)
            .ok_or_else(|| FramelineError::Config(format!("Unbalanced parentheses in '{}'", text)))?;
        stages.push(parse_socket_types_per_stage(&rest[open + 1..close])?);
        rest = &rest[close + 1..];
    }
    if stages.is_empty() && !inner.trim().is_empty() {
        return Err(FramelineError::Config(format!(
            "Expected one parenthesized list per stage in '{}'",
            text
        )));
    }
    Ok(stages)
}

fn strip_parens(text: &str) -> &str {
    let text = text.trim();
    text.strip_prefix('(')
        .and_then(|t| t.strip_suffix(')'))
        .unwrap_or(text)
}

fn split_list(text: &str) -> Vec<&str> {
    strip_parens(text)
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect()
}
