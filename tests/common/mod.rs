//! Common test utilities and helpers

#![allow(dead_code)] // Test utilities may not all be used in every test file

pub mod builders;
pub mod plugins;

use frameline::chain::Chain;
use frameline::pipeline::{Pipeline, Sequence, Sink, SinkTarget, Source};
use frameline::ChainConfig;
use std::time::Duration;

/// Upper bound for tests that wait on worker threads.
pub fn test_timeout() -> Duration {
    Duration::from_secs(10)
}

/// Deterministic, non-periodic byte pattern.
pub fn pattern(len: usize) -> Vec<u8> {
    (0..len as u32)
        .map(|i| (i.wrapping_mul(2_654_435_761) >> 13) as u8)
        .collect()
}

/// Chain of `config` reading `data` into a memory sink.
pub fn memory_chain(config: &ChainConfig, data: Vec<u8>) -> (Chain, SinkTarget) {
    let target = SinkTarget::memory();
    let chain = Chain::build(
        config,
        Source::from_bytes(data, config.data_length),
        Sink::new(config.data_length, target.clone()),
    )
    .expect("chain should build");
    (chain, target)
}

/// Run `data` through the chain of `config` as a pipeline and return what the
/// sink received.
pub fn run_pipeline(config: &ChainConfig, data: Vec<u8>) -> Vec<u8> {
    let (chain, target) = memory_chain(config, data);
    let bounds = chain.stage_bounds();
    let mut pipeline = Pipeline::new(
        chain.graph,
        chain.source,
        bounds,
        frameline::chain::pipeline_options(config),
    )
    .expect("pipeline should build");
    pipeline.set_n_frames(config.n_inter_frames);
    pipeline.set_no_copy_mode(config.no_copy).expect("plans recompile");
    pipeline.exec().expect("pipeline run");
    assert!(pipeline.is_done());
    target.contents().expect("memory sink")
}

/// Same as [`run_pipeline`] with a single-threaded sequence.
pub fn run_sequence(config: &ChainConfig, data: Vec<u8>) -> Vec<u8> {
    let (chain, target) = memory_chain(config, data);
    let mut sequence = Sequence::new(&chain.graph, chain.source, 1).expect("sequence should build");
    sequence.set_n_frames(config.n_inter_frames);
    sequence.set_no_copy_mode(config.no_copy).expect("plans recompile");
    sequence.exec().expect("sequence run");
    target.contents().expect("memory sink")
}
