//! Benchmarks for the per-job hot paths using criterion.
//!
//! These benchmarks measure:
//! - Hyperparameter resolution for typical, mixed-spelling and malformed payloads
//! - Rendering resolved parameters into train flags
//! - JSON payload extraction from noisy script output

#![allow(missing_docs)]

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use serde_json::json;

use synthforge::params;
use synthforge::runner::extract_json_object;

fn bench_resolve(c: &mut Criterion) {
    let mut group = c.benchmark_group("resolve");
    group.throughput(Throughput::Elements(1));

    let canonical = json!({
        "epochs": 300,
        "batchSize": 500,
        "learningRate": 0.0002,
        "discriminatorSteps": 1,
        "generatorDim": [256, 256],
    });
    group.bench_function("canonical", |b| {
        b.iter(|| params::resolve(black_box(Some(&canonical))));
    });

    let mixed = json!({
        "epochs": "300",
        "batchSize": "oops",
        "batch_size": 64.0,
        "learning_rate": "0.001",
        "discriminator_dim": "128,128",
        "unrelated": {"nested": true},
    });
    group.bench_function("mixed_spellings", |b| {
        b.iter(|| params::resolve(black_box(Some(&mixed))));
    });

    group.bench_function("text_payload", |b| {
        let raw = r#"{"epochs": 10, "batch_size": 32}"#;
        b.iter(|| params::resolve_str(black_box(Some(raw))));
    });

    group.finish();
}

fn bench_to_args(c: &mut Criterion) {
    let params = params::resolve(Some(&json!({
        "epochs": 50,
        "generatorDim": "256,256",
        "discriminatorDim": "256,256",
    })));
    c.bench_function("to_args", |b| {
        b.iter(|| black_box(&params).to_args());
    });
}

fn bench_extract_json(c: &mut Criterion) {
    let mut group = c.benchmark_group("extract_json_object");

    let mut noisy = String::new();
    for epoch in 0..500 {
        noisy.push_str(&format!("Epoch {epoch}, Loss G: 0.9312, Loss D: -0.1200\n"));
    }
    noisy.push_str(
        "{\"overall_score\": 0.87, \"column_shapes\": 0.91, \"column_pair_trends\": 0.83}\n",
    );
    noisy.push_str("evaluation finished\n");

    group.throughput(Throughput::Bytes(noisy.len() as u64));
    group.bench_function("long_output", |b| {
        b.iter(|| extract_json_object(black_box(&noisy)));
    });
    group.finish();
}

criterion_group!(benches, bench_resolve, bench_to_args, bench_extract_json);
criterion_main!(benches);
