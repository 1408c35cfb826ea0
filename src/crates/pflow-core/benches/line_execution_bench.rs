use criterion::{black_box, criterion_group, criterion_main, Criterion};
use pflow_core::input_mapping::{apply_inputs_mapping_for_all_lines, InputSources, InputsMapping};
use pflow_core::prelude::*;
use serde_json::{json, Value};
use std::sync::Arc;

fn registry() -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry.register_function("add_one", ToolSignature::new(), |args: ToolArgs| async move {
        let x = args.require("x")?.as_i64().unwrap_or_default();
        Ok(NodeOutput::from(json!(x + 1)))
    });
    registry
}

/// A linear chain of `len` nodes
fn chain(len: usize) -> Flow {
    let mut flow = Flow::new("chain")
        .with_tool(Tool::new("add_one", ToolType::Python))
        .with_input("x", FlowInputDefinition::new(ValueType::Int));
    for i in 0..len {
        let source = if i == 0 {
            InputAssignment::flow_input("x")
        } else {
            InputAssignment::node_output(format!("n{}", i - 1))
        };
        flow = flow.with_node(Node::new(format!("n{}", i), "add_one").with_input("x", source));
    }
    flow.with_output("result", InputAssignment::node_output(format!("n{}", len - 1)))
}

fn executor(len: usize) -> Arc<LineExecutor> {
    Arc::new(
        LineExecutor::create(
            chain(len),
            &ConnectionSet::new(),
            Arc::new(registry()),
            Arc::new(FileCodeLoader::new(".")),
            ExecutorConfig::default(),
        )
        .unwrap(),
    )
}

fn validation_benchmark(c: &mut Criterion) {
    let registry = registry();
    c.bench_function("validate 50-node chain", |b| {
        b.iter(|| {
            pflow_core::validator::ensure_flow_valid(
                black_box(chain(50)),
                &ConnectionSet::new(),
                &registry,
            )
            .unwrap()
        });
    });
}

fn line_benchmark(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let executor = executor(20);
    let inputs = json!({"x": 1}).as_object().cloned().unwrap();

    c.bench_function("exec_line 20-node chain", |b| {
        b.to_async(&runtime).iter(|| async {
            executor
                .exec_line(black_box(inputs.clone()), 0, &LineOptions::default())
                .await
                .unwrap();
        });
    });
}

fn batch_benchmark(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let coordinator = BatchCoordinator::new(executor(5));
    let mut sources = InputSources::new();
    sources.insert(
        "data".to_string(),
        (0..100)
            .map(|i| json!({"value": i}).as_object().cloned().unwrap())
            .collect(),
    );
    let mut mapping = InputsMapping::new();
    mapping.insert("x".to_string(), Value::String("${data.value}".to_string()));

    c.bench_function("map 100 lines", |b| {
        b.iter(|| apply_inputs_mapping_for_all_lines(black_box(&sources), &mapping).unwrap());
    });

    c.bench_function("exec_batch 100 lines", |b| {
        b.to_async(&runtime).iter(|| async {
            coordinator
                .exec_batch(black_box(&sources), &mapping, None)
                .await
                .unwrap();
        });
    });
}

criterion_group!(benches, validation_benchmark, line_benchmark, batch_benchmark);
criterion_main!(benches);
