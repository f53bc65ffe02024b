//! Frameline - Generic relay chain benchmark
//!
//! Streams a file through a chain of relay tasks, run as a multi-stage
//! pipeline or as a sequence, and checks that the output file matches the
//! input.

use anyhow::Context;
use clap::Parser;
use frameline::chain::{self, RunSummary};
use frameline::config::{self, ChainConfig};
use frameline::pipeline::stats;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "frameline", version, about = "Micro-benchmark: generic pipeline")]
struct Cli {
    /// Chain configuration file (TOML or JSON); options below override it
    #[arg(long)]
    config: Option<PathBuf>,

    /// Threads per relay stage, e.g. "(1,4,1)"
    #[arg(short = 't', long = "n-threads")]
    n_threads: Option<String>,

    /// Frames processed by one task invocation
    #[arg(short = 'f', long = "n-inter-frames")]
    n_inter_frames: Option<usize>,

    /// Simulated work per relay and frame, in microseconds
    #[arg(short = 's', long = "sleep-time")]
    sleep_time: Option<u64>,

    /// Bytes per frame
    #[arg(short = 'd', long = "data-length")]
    data_length: Option<usize>,

    /// Adaptor slots per endpoint
    #[arg(short = 'u', long = "buffer-size")]
    buffer_size: Option<usize>,

    /// Write the graph in dot format
    #[arg(short = 'o', long = "dot-filepath")]
    dot_filepath: Option<PathBuf>,

    /// File streamed through the chain
    #[arg(short = 'i', long = "in-filepath")]
    in_filepath: Option<PathBuf>,

    /// File written by the sink
    #[arg(short = 'j', long = "out-filepath")]
    out_filepath: Option<PathBuf>,

    /// Copy frames instead of working in place
    #[arg(short = 'c', long = "copy-mode")]
    copy_mode: bool,

    /// Print per-task statistics
    #[arg(short = 'p', long = "print-stats")]
    print_stats: bool,

    /// Run the sequence one task at a time
    #[arg(short = 'b', long = "step-by-step")]
    step_by_step: bool,

    /// Dump socket contents on every task invocation
    #[arg(short = 'g', long = "debug")]
    debug: bool,

    /// Run a sequence instead of a pipeline
    #[arg(short = 'q', long = "force-sequence")]
    force_sequence: bool,

    /// Spin instead of blocking in adaptors
    #[arg(short = 'w', long = "active-waiting")]
    active_waiting: bool,

    /// Relay tasks per stage, e.g. "(2,3)"
    #[arg(short = 'n', long = "tsk-per-sta")]
    tasks_per_stage: Option<String>,

    /// Socket kind of every task, e.g. "((SIO,SFWD),(SFWD))"
    #[arg(short = 'r', long = "sck-type-tsk", conflicts_with = "socket_types_per_stage")]
    socket_types_per_task: Option<String>,

    /// Socket kind of every stage, e.g. "(SIO,SFWD)"
    #[arg(short = 'R', long = "sck-type-sta")]
    socket_types_per_stage: Option<String>,

    /// Thread pinning policy of the relay stages
    #[arg(short = 'P', long = "pinning-policy")]
    pinning_policy: Option<String>,

    /// Log level (error, warn, info, debug, trace), overridden by RUST_LOG
    #[arg(long, default_value = "warn")]
    log_level: String,
}

impl Cli {
    fn into_config(self) -> anyhow::Result<ChainConfig> {
        let mut config = match &self.config {
            Some(path) => ChainConfig::load(path)
                .with_context(|| format!("Failed to load config {:?}", path))?,
            None => ChainConfig::default(),
        };

        if let Some(text) = &self.n_threads {
            config.n_threads = config::parse_counts(text)?;
        }
        if let Some(text) = &self.tasks_per_stage {
            config.tasks_per_stage = config::parse_counts(text)?;
        }
        if let Some(text) = &self.socket_types_per_task {
            config.socket_types = config::parse_socket_types_per_task(text)?;
        }
        if let Some(text) = &self.socket_types_per_stage {
            let kinds = config::parse_socket_types_per_stage(text)?;
            config.set_socket_types_per_stage(&kinds)?;
        }
        if let Some(n) = self.n_inter_frames {
            config.n_inter_frames = n;
        }
        if let Some(us) = self.sleep_time {
            config.sleep_time_us = us;
        }
        if let Some(n) = self.data_length {
            config.data_length = n;
        }
        if let Some(n) = self.buffer_size {
            config.buffer_size = n;
        }
        if self.dot_filepath.is_some() {
            config.dot_filepath = self.dot_filepath;
        }
        if self.in_filepath.is_some() {
            config.in_filepath = self.in_filepath;
        }
        if let Some(path) = self.out_filepath {
            config.out_filepath = path;
        }
        if let Some(policy) = self.pinning_policy {
            config.pinning_policy = policy;
        }
        config.no_copy &= !self.copy_mode;
        config.print_stats |= self.print_stats;
        config.step_by_step |= self.step_by_step;
        config.debug |= self.debug;
        config.force_sequence |= self.force_sequence;
        config.active_waiting |= self.active_waiting;

        config.validate()?;
        Ok(config)
    }
}

fn print_header(config: &ChainConfig) {
    fn or_empty(value: Option<String>) -> String {
        value
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "[empty]".to_string())
    }
    let path = |p: &Option<PathBuf>| or_empty(p.as_ref().map(|p| p.display().to_string()));

    println!("#####################################");
    println!("# Micro-benchmark: Generic pipeline #");
    println!("#####################################");
    println!("#");
    println!("# Configuration:");
    println!("#   - n_threads      = {:?}", config.n_threads);
    println!("#   - tsk_per_sta    = {:?}", config.tasks_per_stage);
    println!("#   - sck_type_tsk   = {:?}", config.socket_types);
    println!("#   - pinning_policy = {}", or_empty(Some(config.pinning_policy.clone())));
    println!("#   - n_inter_frames = {}", config.n_inter_frames);
    println!("#   - sleep_time_us  = {}", config.sleep_time_us);
    println!("#   - data_length    = {}", config.data_length);
    println!("#   - buffer_size    = {}", config.buffer_size);
    println!("#   - dot_filepath   = {}", path(&config.dot_filepath));
    println!("#   - in_filepath    = {}", path(&config.in_filepath));
    println!("#   - out_filepath   = {}", config.out_filepath.display());
    println!("#   - no_copy_mode   = {}", config.no_copy);
    println!("#   - print_stats    = {}", config.print_stats);
    println!("#   - step_by_step   = {}", config.step_by_step);
    println!("#   - debug          = {}", config.debug);
    println!("#   - force_sequence = {}", config.force_sequence);
    println!("#   - active_waiting = {}", config.active_waiting);
    println!("#");
}

fn print_summary(config: &ChainConfig, summary: &RunSummary) {
    let kind = if config.force_sequence { "Sequence" } else { "Pipeline" };
    println!("{} elapsed time: {:.3} ms", kind, summary.elapsed.as_secs_f64() * 1e3);
    println!("{} theoretical time: {:.3} ms", kind, summary.theoretical.as_secs_f64() * 1e3);
    println!("#");
    if summary.passed {
        println!("# Tests passed!");
    } else {
        println!("# Tests failed :-(");
    }

    if config.print_stats {
        println!("#");
        if config.force_sequence {
            if let Some(stage) = summary.stages.first() {
                print!("{}", stats::format_table(&stage.tasks));
            }
        } else {
            for (s, stage) in summary.stages.iter().enumerate() {
                println!("#");
                println!("# Pipeline stage {} ({} thread(s)):", s, stage.n_threads);
                print!("{}", stats::format_table(&stage.tasks));
            }
        }
    }
}

fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(format!("{},frameline={}", cli.log_level, cli.log_level))),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = cli.into_config()?;
    print_header(&config);

    let summary = chain::run(&config).context("Chain run failed")?;
    tracing::info!("Processed {} invocation(s) of the source", summary.n_frames);
    print_summary(&config, &summary);

    Ok(if summary.passed {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
