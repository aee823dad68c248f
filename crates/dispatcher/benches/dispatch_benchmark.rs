//! Dispatcher throughput benchmarks
//!
//! Run with: cargo bench --bench dispatch_benchmark

use coreloop_common::WeightDType;
use coreloop_dispatcher::{
    compile, CompileOptions, CpuLoader, DataParallel, DenseLayer, Dispatcher, DispatcherOptions,
    ModelGraph, Tensor, Activation,
};
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::sync::Arc;
use tempfile::TempDir;

const INPUT_WIDTH: usize = 64;
const ROWS: usize = 512;

/// Deterministic values in [-1, 1)
fn pseudo_random(count: usize, seed: u64) -> Vec<f32> {
    (0..count)
        .map(|i| {
            let x = (seed.wrapping_mul(i as u64 + 1).wrapping_mul(0x5DEECE66D) % 1000) as f32;
            x / 500.0 - 1.0
        })
        .collect()
}

fn dense(name: &str, inputs: usize, outputs: usize, activation: Activation, seed: u64) -> DenseLayer {
    let flat = pseudo_random(inputs * outputs, seed);
    DenseLayer {
        name: name.to_string(),
        weights: flat.chunks(inputs).map(|row| row.iter().map(|v| v * 0.1).collect()).collect(),
        bias: Some(pseudo_random(outputs, seed + 1)),
        activation,
    }
}

fn mlp() -> ModelGraph {
    ModelGraph {
        name: "bench-mlp".to_string(),
        input_width: INPUT_WIDTH,
        layers: vec![
            dense("fc1", INPUT_WIDTH, 128, Activation::Relu, 1),
            dense("fc2", 128, 128, Activation::Gelu, 2),
            dense("head", 128, 10, Activation::Softmax, 3),
        ],
    }
}

fn bench_data_parallel(c: &mut Criterion) {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("bench.artifact");
    let example = Tensor::new(pseudo_random(4 * INPUT_WIDTH, 7), vec![4, INPUT_WIDTH]).unwrap();
    compile(
        &mlp(),
        &[example],
        &CompileOptions {
            weight_dtype: WeightDType::F32,
        },
        &path,
    )
    .unwrap();

    let input = Tensor::new(pseudo_random(ROWS * INPUT_WIDTH, 42), vec![ROWS, INPUT_WIDTH]).unwrap();
    let available = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1);

    let mut group = c.benchmark_group("data_parallel");
    group.throughput(Throughput::Elements(ROWS as u64));

    for workers in [1, 2, 4].into_iter().filter(|w| *w <= available.max(1)) {
        let dispatcher = Dispatcher::start(
            Arc::new(CpuLoader),
            DispatcherOptions::new(&path, (0..workers).collect()),
        )
        .unwrap();
        let parallel = DataParallel::new();

        group.bench_with_input(BenchmarkId::new("workers", workers), &workers, |b, _| {
            b.iter(|| parallel.run(&dispatcher, &input, 32).unwrap())
        });

        dispatcher.stop();
    }

    group.finish();
}

fn bench_submit_latency(c: &mut Criterion) {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("bench.artifact");
    let example = Tensor::new(pseudo_random(INPUT_WIDTH, 9), vec![1, INPUT_WIDTH]).unwrap();
    compile(&mlp(), &[example.clone()], &CompileOptions::default(), &path).unwrap();

    let dispatcher =
        Dispatcher::start(Arc::new(CpuLoader), DispatcherOptions::new(&path, vec![0])).unwrap();

    c.bench_function("single_request_round_trip", |b| {
        let mut id = 0u64;
        b.iter(|| {
            id += 1;
            let rx = dispatcher
                .submit_async(coreloop_dispatcher::InferenceRequest::single(id, example.clone()))
                .unwrap();
            rx.blocking_recv().unwrap()
        })
    });

    dispatcher.stop();
}

criterion_group!(benches, bench_data_parallel, bench_submit_latency);
criterion_main!(benches);
