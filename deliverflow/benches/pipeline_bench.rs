//! Benchmarks for pipeline scheduling.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use deliverflow::artifacts::ArtifactStore;
use deliverflow::config::OrchestratorConfig;
use deliverflow::context::{ref_slug, PipelineContext, RunEnvironment};
use deliverflow::pipeline::{PipelineBuilder, StageGraph};
use deliverflow::stages::{NoOpStage, Stage};
use deliverflow::testing::ScriptedRunner;
use std::sync::Arc;

/// A fan-out of `width` chains, each `depth` stages long, after one root.
fn layered_graph(width: usize, depth: usize) -> StageGraph {
    let mut builder = PipelineBuilder::new("bench")
        .stage("build", Arc::new(NoOpStage::new("build")) as Arc<dyn Stage>, &[])
        .expect("root stage");
    for lane in 0..width {
        let mut previous = "build".to_string();
        for level in 0..depth {
            let name = format!("lane{lane}-step{level}");
            builder = builder
                .stage(&name, Arc::new(NoOpStage::new(&name)), &[previous.as_str()])
                .expect("valid stage");
            previous = name;
        }
    }
    builder.build().expect("valid graph")
}

fn pipeline_benchmark(c: &mut Criterion) {
    c.bench_function("build_graph_10x10", |b| b.iter(|| black_box(layered_graph(10, 10))));

    c.bench_function("ref_slug", |b| {
        b.iter(|| black_box(ref_slug(black_box("feature/ROS2-Humble_perf.Tests"))));
    });

    let runtime = tokio::runtime::Runtime::new().expect("runtime");
    let dir = tempfile::tempdir().expect("tempdir");
    let graph = layered_graph(4, 4);
    c.bench_function("execute_noop_graph_4x4", |b| {
        b.iter(|| {
            let store = Arc::new(ArtifactStore::open(dir.path().join("artifacts")).expect("store"));
            let ctx = Arc::new(PipelineContext::new(
                Arc::new(RunEnvironment::new("abc123", "main")),
                store,
                Arc::new(ScriptedRunner::new()),
            ));
            let config = OrchestratorConfig::default().with_work_root(dir.path().join("work"));
            runtime.block_on(graph.execute(ctx, &config)).expect("run")
        });
    });
}

criterion_group!(benches, pipeline_benchmark);
criterion_main!(benches);
