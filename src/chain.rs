//! Generic relay chain: source, relay stages, sink.
//!
//! Builds the task graph described by a [`ChainConfig`], runs it as a
//! pipeline or a sequence, and checks that the sink wrote back exactly what
//! the source read.

use crate::config::{ChainConfig, SocketKind, DEBUG_LIMIT};
use crate::error::{FramelineError, Result, ResultExt};
use crate::pipeline::{
    Graph, Pipeline, PipelineOptions, Relayer, Sequence, Sink, SinkTarget, SocketId, Source,
    StageBounds, StageReport, TaskId, TaskState, TaskTypeReport,
};
use std::time::{Duration, Instant};

/// Task graph of a relay chain.
pub struct Chain {
    pub graph: Graph,
    /// `Source::generate`
    pub source: TaskId,
    /// Relay tasks, grouped by stage.
    pub relays: Vec<Vec<TaskId>>,
    /// `Sink::send_count`
    pub sink: TaskId,
}

impl Chain {
    /// Wire `source`, one `Relayer` per configured task, and `sink`.
    pub fn build(config: &ChainConfig, source: Source, sink: Sink) -> Result<Self> {
        config.validate()?;
        let mut graph = Graph::new();
        let src = graph.add_module(source);
        let snk = graph.add_module(sink);
        let gen = graph.task(src, "generate")?;
        let send = graph.task(snk, "send_count")?;

        let mut relays = Vec::with_capacity(config.n_stages());
        let mut upstream = gen.socket(Source::OUT_DATA);
        let mut n = 0;
        for kinds in &config.socket_types {
            let mut stage = Vec::with_capacity(kinds.len());
            for &kind in kinds {
                let mut relayer = Relayer::new(config.data_length)
                    .with_custom_name(format!("Relayer{}", n));
                relayer.set_ns(config.sleep_time_us * 1000);
                let module = graph.add_module(relayer);
                let task = graph.task(module, kind.task_name())?;

                let (input, output) = relay_sockets(task, kind);
                graph.bind(input, upstream)?;
                upstream = output;
                stage.push(task);
                n += 1;
            }
            relays.push(stage);
        }

        graph.bind(send.socket(Sink::IN_DATA), upstream)?;
        graph.bind(send.socket(Sink::IN_COUNT), gen.socket(Source::OUT_COUNT))?;

        tracing::debug!("Chain built: {} relay(s) in {} stage(s)", n, relays.len());
        Ok(Self {
            graph,
            source: gen,
            relays,
            sink: send,
        })
    }

    /// Source stage, one stage per relay group, sink stage.
    pub fn stage_bounds(&self) -> Vec<StageBounds> {
        let mut bounds = vec![StageBounds::single(self.source)];
        for stage in &self.relays {
            if let (Some(&first), Some(&last)) = (stage.first(), stage.last()) {
                bounds.push(StageBounds::new(vec![first], vec![last]));
            }
        }
        bounds.push(StageBounds::new(vec![self.sink], Vec::new()));
        bounds
    }

    /// Remove every binding added by [`Chain::build`].
    pub fn unbind(&mut self) -> Result<()> {
        for (reader, writer) in self.graph.bindings() {
            self.graph.unbind(reader, writer)?;
        }
        Ok(())
    }
}

fn relay_sockets(task: TaskId, kind: SocketKind) -> (SocketId, SocketId) {
    match kind {
        SocketKind::Sio => (task.socket(Relayer::IN), task.socket(Relayer::OUT)),
        SocketKind::Sfwd => (task.socket(Relayer::FWD), task.socket(Relayer::FWD)),
    }
}

/// Pipeline options matching the chain: single-threaded source and sink
/// stages around the configured relay stages.
pub fn pipeline_options(config: &ChainConfig) -> PipelineOptions {
    let n_adaptors = config.n_stages() + 1;
    let mut n_threads = Vec::with_capacity(config.n_stages() + 2);
    n_threads.push(1);
    n_threads.extend_from_slice(&config.n_threads);
    n_threads.push(1);

    let mut options = PipelineOptions::new(n_threads)
        .with_buffer_sizes(vec![config.buffer_size; n_adaptors])
        .with_active_waiting(vec![config.active_waiting; n_adaptors]);
    if !config.pinning_policy.is_empty() {
        let mut pinning = vec![true; config.n_stages() + 2];
        pinning[0] = false;
        pinning[config.n_stages() + 1] = false;
        options = options.with_pinning(pinning, config.pinning_policy.clone());
    }
    options
}

/// Apply the debug, stats, and fast flags of `config` to every task.
pub fn configure_tasks<'a>(states: impl Iterator<Item = &'a mut TaskState>, config: &ChainConfig) {
    for state in states {
        state.reset();
        state.set_debug(config.debug);
        state.set_debug_limit(DEBUG_LIMIT);
        state.set_stats(config.print_stats);
        state.set_fast(true);
    }
}

/// Outcome of [`run`].
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub elapsed: Duration,
    /// Time the relays' simulated work alone would take.
    pub theoretical: Duration,
    /// Invocations of the source task.
    pub n_frames: u64,
    /// The sink output equals the source input.
    pub passed: bool,
    /// Per-stage statistics (a single entry for a sequence).
    pub stages: Vec<StageReport>,
}

impl RunSummary {
    /// Task statistics of every stage, flattened.
    pub fn tasks(&self) -> impl Iterator<Item = &TaskTypeReport> {
        self.stages.iter().flat_map(|s| s.tasks.iter())
    }
}

/// Stream the input file through the chain into the output file and compare.
pub fn run(config: &ChainConfig) -> Result<RunSummary> {
    config.validate()?;
    let in_filepath = config
        .in_filepath
        .as_ref()
        .ok_or_else(|| FramelineError::Config("An input file is required".to_string()))?;
    let source = Source::from_file(in_filepath, config.data_length)
        .with_context(|| format!("Failed to read input file {:?}", in_filepath))?;
    let input_len = source.len();

    let target = SinkTarget::file(&config.out_filepath)
        .with_context(|| format!("Failed to create output file {:?}", config.out_filepath))?;
    let sink = Sink::new(config.data_length, target.clone());
    let mut chain = Chain::build(config, source, sink)?;

    if !config.force_sequence && config.step_by_step {
        tracing::warn!("'step_by_step' is not available with pipeline");
    }

    let (elapsed, n_frames, stages) = if config.force_sequence {
        run_sequence(&mut chain, config)?
    } else {
        run_pipeline(chain, config)?
    };
    target.flush()?;

    let passed = files_equal(in_filepath, &config.out_filepath)?;
    let batch = (config.data_length * config.n_inter_frames) as u64;
    let batches = (input_len as u64).div_ceil(batch);
    let theoretical = Duration::from_micros(
        batches * config.n_relays() as u64 * config.sleep_time_us * config.n_inter_frames as u64,
    );

    Ok(RunSummary {
        elapsed,
        theoretical,
        n_frames,
        passed,
        stages,
    })
}

fn run_sequence(
    chain: &mut Chain,
    config: &ChainConfig,
) -> Result<(Duration, u64, Vec<StageReport>)> {
    let mut sequence = Sequence::new(&chain.graph, chain.source, 1)?;
    sequence.set_n_frames(config.n_inter_frames);
    sequence.set_no_copy_mode(config.no_copy)?;
    configure_tasks(sequence.task_states_mut(), config);
    export_dot(config, |out| sequence.export_dot(out))?;

    let started = Instant::now();
    if config.step_by_step {
        while sequence.exec_step(0)? {}
    } else {
        sequence.exec()?;
    }
    let elapsed = started.elapsed();

    let tasks = sequence.tasks_per_types();
    let n_frames = tasks
        .iter()
        .find(|t| t.task == "generate")
        .map_or(0, |t| t.n_calls);
    sequence.set_n_frames(1);
    chain.unbind()?;
    Ok((elapsed, n_frames, vec![StageReport { n_threads: 1, tasks }]))
}

fn run_pipeline(chain: Chain, config: &ChainConfig) -> Result<(Duration, u64, Vec<StageReport>)> {
    let bounds = chain.stage_bounds();
    let mut pipeline = Pipeline::new(chain.graph, chain.source, bounds, pipeline_options(config))?;
    pipeline.set_n_frames(config.n_inter_frames);
    pipeline.set_no_copy_mode(config.no_copy)?;
    configure_tasks(pipeline.task_states_mut(), config);
    export_dot(config, |out| pipeline.export_dot(out))?;

    let started = Instant::now();
    pipeline.exec()?;
    let elapsed = started.elapsed();

    let stages = pipeline.get_stages();
    let n_frames = pipeline.frames_processed();
    pipeline.set_n_frames(1);
    pipeline.unbind_adaptors()?;
    Ok((elapsed, n_frames, stages))
}

fn export_dot<F>(config: &ChainConfig, write: F) -> Result<()>
where
    F: FnOnce(&mut std::io::BufWriter<std::fs::File>) -> std::io::Result<()>,
{
    if let Some(path) = &config.dot_filepath {
        let file = std::fs::File::create(path)
            .with_context(|| format!("Failed to create dot file {:?}", path))?;
        let mut out = std::io::BufWriter::new(file);
        write(&mut out)?;
        std::io::Write::flush(&mut out)?;
        tracing::info!("Graph written to {:?}", path);
    }
    Ok(())
}

/// Byte-for-byte file comparison.
pub fn files_equal(a: impl AsRef<std::path::Path>, b: impl AsRef<std::path::Path>) -> Result<bool> {
    let a = std::fs::read(a.as_ref())?;
    let b = std::fs::read(b.as_ref())?;
    Ok(a == b)
}
