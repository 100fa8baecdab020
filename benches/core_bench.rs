//! Benchmarks for shardform synthesis phases.
//!
//! Run with: cargo bench
//!
//! Results include 95% confidence intervals via Criterion.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use shardform::core::context::SynthesisContext;
use shardform::core::parser::parse_graph;
use shardform::core::types::{DeployConfig, ResourceGraph};
use shardform::core::{assigner, collector, generator, tiering};

/// Chain of `n` resources, each reading its predecessor's endpoint.
fn chain_graph(n: usize) -> ResourceGraph {
    let mut yaml = String::from("name: bench\nresources:\n");
    for i in 0..n {
        yaml.push_str(&format!(
            "  - id: r{i}\n    type: Microsoft.Web/sites\n    properties:\n      sku: B1\n      tags: {{ owner: bench, ordinal: \"{i}\" }}\n"
        ));
        if i > 0 {
            yaml.push_str(&format!(
                "      upstream: \"${{ref:r{}.properties.endpoint}}\"\n",
                i - 1
            ));
        }
    }
    parse_graph(&yaml).unwrap()
}

fn split_config() -> DeployConfig {
    DeployConfig {
        max_resources_per_template: 25,
        ..DeployConfig::default()
    }
}

fn bench_collect(c: &mut Criterion) {
    let mut group = c.benchmark_group("collect");
    for n in [50, 200, 800] {
        let graph = chain_graph(n);
        group.bench_with_input(BenchmarkId::from_parameter(n), &graph, |b, graph| {
            b.iter(|| black_box(collector::collect(black_box(graph)).unwrap()));
        });
    }
    group.finish();
}

fn bench_assign(c: &mut Criterion) {
    let config = split_config();
    let mut group = c.benchmark_group("assign");
    for n in [50, 200, 800] {
        let metadata = collector::collect(&chain_graph(n)).unwrap();
        group.bench_with_input(BenchmarkId::from_parameter(n), &metadata, |b, metadata| {
            b.iter(|| black_box(assigner::assign(black_box(metadata), &config).unwrap()));
        });
    }
    group.finish();
}

fn bench_generate(c: &mut Criterion) {
    let config = split_config();
    let mut group = c.benchmark_group("generate");
    for n in [50, 200] {
        let graph = chain_graph(n);
        let metadata = collector::collect(&graph).unwrap();
        let assignment = assigner::assign(&metadata, &config).unwrap();
        group.bench_with_input(BenchmarkId::from_parameter(n), &graph, |b, graph| {
            b.iter(|| {
                let ctx = SynthesisContext::new(graph, &assignment).unwrap();
                black_box(generator::generate(graph, &ctx, &config).unwrap())
            });
        });
    }
    group.finish();
}

fn bench_tiers(c: &mut Criterion) {
    let config = split_config();
    let graph = chain_graph(800);
    let metadata = collector::collect(&graph).unwrap();
    let assignment = assigner::assign(&metadata, &config).unwrap();
    c.bench_function("compute_tiers_800", |b| {
        b.iter(|| {
            let docs = tiering::DocumentGraph::from_metadata(&assignment, &metadata);
            black_box(tiering::compute_tiers(&docs).unwrap())
        });
    });
}

criterion_group!(benches, bench_collect, bench_assign, bench_generate, bench_tiers);
criterion_main!(benches);
