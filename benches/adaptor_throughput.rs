//! Benchmarks for adaptor hand-off and relay chain throughput
//!
//! Run with: cargo bench

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use frameline::chain::{pipeline_options, Chain};
use frameline::pipeline::{Adaptor, Pipeline, Pulled, Sink, SinkTarget, Source, Topology};
use frameline::{ChainConfig, DataType, SocketKind};

const FRAME: usize = 2048;
const N_FRAMES: u64 = 4096;

#[cfg(unix)]
const NULL_DEVICE: &str = "/dev/null";
#[cfg(windows)]
const NULL_DEVICE: &str = "NUL";

/// One producer thread and one consumer thread over a single-endpoint adaptor.
fn bench_adaptor_hand_off(c: &mut Criterion) {
    let mut group = c.benchmark_group("adaptor_hand_off");
    group.throughput(Throughput::Bytes(FRAME as u64 * N_FRAMES));

    for &depth in &[1usize, 4, 16] {
        for &(swap, active) in &[(false, false), (true, false), (true, true)] {
            let name = format!(
                "{}_{}",
                if swap { "swap" } else { "copy" },
                if active { "spin" } else { "block" }
            );
            group.bench_with_input(BenchmarkId::new(name, depth), &depth, |b, &depth| {
                let mut adaptor =
                    Adaptor::with_channel(Topology::OneToN, 1, DataType::U8, FRAME, depth, active)
                        .unwrap();
                b.iter(|| {
                    adaptor.reset();
                    let adaptor = &adaptor;
                    std::thread::scope(|s| {
                        s.spawn(|| {
                            let mut frames = vec![vec![7u8; FRAME]];
                            for id in 0..N_FRAMES {
                                if swap {
                                    adaptor.push_swap(0, &mut frames, id).unwrap();
                                } else {
                                    adaptor.push(0, &frames, id).unwrap();
                                }
                            }
                            adaptor.finish(0);
                        });
                        let mut frames = vec![vec![0u8; FRAME]];
                        loop {
                            let pulled = if swap {
                                adaptor.pull_swap(0, &mut frames).unwrap()
                            } else {
                                adaptor.pull(0, &mut frames).unwrap()
                            };
                            if !matches!(pulled, Pulled::Frame(_)) {
                                break;
                            }
                            black_box(&frames);
                        }
                    });
                });
            });
        }
    }
    group.finish();
}

/// Whole relay chains, with and without a replicated middle stage.
fn bench_relay_chain(c: &mut Criterion) {
    let data = vec![42u8; FRAME * 1024];
    let mut group = c.benchmark_group("relay_chain");
    group.throughput(Throughput::Bytes(data.len() as u64));
    group.sample_size(20);

    for &(label, threads) in &[("1-1-1", [1usize, 1, 1]), ("1-4-1", [1, 4, 1])] {
        for no_copy in [false, true] {
            let config = ChainConfig {
                n_threads: threads.to_vec(),
                tasks_per_stage: vec![2; 3],
                socket_types: vec![vec![SocketKind::Sio, SocketKind::Sfwd]; 3],
                sleep_time_us: 0,
                no_copy,
                ..Default::default()
            };
            let mode = if no_copy { "no_copy" } else { "copy" };
            group.bench_function(BenchmarkId::new(mode, label), |b| {
                let chain = Chain::build(
                    &config,
                    Source::from_bytes(data.clone(), FRAME),
                    Sink::new(FRAME, SinkTarget::file(NULL_DEVICE).unwrap()),
                )
                .unwrap();
                let bounds = chain.stage_bounds();
                let mut pipeline =
                    Pipeline::new(chain.graph, chain.source, bounds, pipeline_options(&config))
                        .unwrap();
                pipeline.set_no_copy_mode(no_copy).unwrap();
                b.iter(|| {
                    pipeline.reset();
                    pipeline.exec().unwrap();
                });
            });
        }
    }
    group.finish();
}

criterion_group!(benches, bench_adaptor_hand_off, bench_relay_chain);
criterion_main!(benches);
