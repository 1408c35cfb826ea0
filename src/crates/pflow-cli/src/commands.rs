//! Command handlers for the pflow binary

use std::collections::HashMap;
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use futures::StreamExt;
use pflow_core::input_mapping::default_inputs_mapping;
use pflow_core::{
    BatchCoordinator, BatchResult, ConnectionSet, ExecutorConfig, FileCodeLoader, Flow, FlowValidator, LineExecutor,
    LineOptions, Status, ToolRegistry, ToolResolver,
};
use serde_json::{Map, Value};
use tooling::logging::{format_duration, timed};
use tracing::{info, warn};

use crate::args::BatchArgs;
use crate::data::{column_mapping, load_sources, write_outputs};

/// File name looked up when a flow path is a directory
pub const FLOW_FILE_NAME: &str = "flow.dag.yaml";

/// Source name the default column mapping reads from
pub const DEFAULT_SOURCE: &str = "data";

/// Flow definition file for `path`
pub fn flow_file(path: &Path) -> PathBuf {
    if path.is_dir() {
        path.join(FLOW_FILE_NAME)
    } else {
        path.to_path_buf()
    }
}

/// Directory tool sources are loaded from
fn working_dir(flow_file: &Path) -> PathBuf {
    match flow_file.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

/// Load a flow and apply the selected variants
pub fn load_flow(path: &Path, variants: &[(String, String)]) -> Result<Flow> {
    let file = flow_file(path);
    let flow = Flow::from_file(&file).with_context(|| format!("loading flow {}", file.display()))?;
    let selected: HashMap<String, String> = variants.iter().cloned().collect();
    Ok(flow.apply_variants(&selected)?)
}

pub fn load_connections(path: Option<&Path>) -> Result<ConnectionSet> {
    match path {
        Some(path) => ConnectionSet::from_file(path).with_context(|| format!("loading connections {}", path.display())),
        None => Ok(ConnectionSet::new()),
    }
}

/// Registry holding the provider actions available to LLM nodes
pub fn builtin_registry() -> Result<Arc<ToolRegistry>> {
    let mut registry = ToolRegistry::new();
    llm::register_builtin_actions(&mut registry)?;
    Ok(Arc::new(registry))
}

pub fn create_executor(
    flow_path: &Path,
    variants: &[(String, String)],
    connections: &ConnectionSet,
    registry: Arc<ToolRegistry>,
    config: ExecutorConfig,
) -> Result<LineExecutor> {
    let flow = load_flow(flow_path, variants)?;
    let loader = Arc::new(FileCodeLoader::new(working_dir(&flow_file(flow_path))));
    Ok(LineExecutor::create(flow, connections, registry, loader, config)?)
}

/// What `pflow validate` reports for a valid flow
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationReport {
    pub name: String,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
    /// Line nodes in execution order
    pub nodes: Vec<String>,
    pub aggregation_nodes: Vec<String>,
}

impl fmt::Display for ValidationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "✓ Flow is valid")?;
        writeln!(f, "  Name: {}", self.name)?;
        writeln!(f, "  Inputs: {}", self.inputs.join(", "))?;
        writeln!(f, "  Outputs: {}", self.outputs.join(", "))?;
        writeln!(f, "  Execution order: {}", self.nodes.join(" -> "))?;
        if !self.aggregation_nodes.is_empty() {
            writeln!(f, "  Aggregation: {}", self.aggregation_nodes.join(", "))?;
        }
        Ok(())
    }
}

/// Validate a flow and bind every node to its tool without running anything
pub fn validate(flow_path: &Path, connections: &ConnectionSet) -> Result<ValidationReport> {
    let registry = builtin_registry()?;
    let flow = load_flow(flow_path, &[])?;
    let validated = FlowValidator::new(&registry).ensure_flow_valid(flow, connections)?;

    let loader = Arc::new(FileCodeLoader::new(working_dir(&flow_file(flow_path))));
    ToolResolver::new(registry, loader).resolve_all(&validated)?;

    let flow = validated.flow();
    Ok(ValidationReport {
        name: validated.name().to_string(),
        inputs: flow.inputs.keys().cloned().collect(),
        outputs: flow.outputs.keys().cloned().collect(),
        nodes: validated.line_nodes().map(|n| n.name.clone()).collect(),
        aggregation_nodes: validated.aggregation_nodes().map(|n| n.name.clone()).collect(),
    })
}

/// Parse `--inputs`; absent means no inputs
pub fn parse_inputs(raw: Option<&str>) -> Result<Map<String, Value>> {
    let Some(raw) = raw else {
        return Ok(Map::new());
    };
    match serde_json::from_str(raw).context("--inputs is not valid JSON")? {
        Value::Object(inputs) => Ok(inputs),
        other => bail!("--inputs must be a JSON object, got {}", other),
    }
}

/// Run one line, writing streamed outputs to `out` as chunks arrive
///
/// Returns every output, streamed ones included once drained.
pub async fn test_line<W: Write>(
    executor: &LineExecutor,
    inputs: Map<String, Value>,
    out: &mut W,
) -> Result<Map<String, Value>> {
    let options = LineOptions::from_config(executor.config());
    let result = timed("test line", executor.exec_line(inputs, 0, &options)).await?;
    if !result.is_completed() {
        match result.error() {
            Some(err) => bail!("{}: {}", err.code, err.message),
            None => bail!("line finished with status {:?}", result.status),
        }
    }

    let mut output = result.output;
    for (name, mut stream) in result.streams {
        writeln!(out, "{}:", name)?;
        let mut text = String::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.with_context(|| format!("streaming output '{}'", name))?;
            write!(out, "{}", chunk)?;
            out.flush()?;
            text.push_str(&chunk);
        }
        writeln!(out)?;
        output.insert(name, Value::String(text));
    }
    Ok(output)
}

/// Load sources, map columns and run the batch
pub async fn run_batch(args: &BatchArgs, executor: LineExecutor) -> Result<BatchResult> {
    let sources = load_sources(&args.data, Path::new("."))?;
    let mut mapping = column_mapping(&args.column_mapping);
    if mapping.is_empty() && sources.contains_key(DEFAULT_SOURCE) {
        mapping = default_inputs_mapping(executor.flow().flow());
        info!(inputs = mapping.len(), "no column mapping given, reading flow inputs from '{}'", DEFAULT_SOURCE);
    }

    let coordinator = BatchCoordinator::new(Arc::new(executor));
    let result = timed("batch", coordinator.exec_batch(&sources, &mapping, args.run_id.clone())).await?;

    if let Some(path) = &args.output {
        let rows = write_outputs(path, &result)?;
        info!(rows, path = %path.display(), "line outputs written");
    }
    if result.status == Status::Failed {
        warn!(run_id = %result.run_id, "every line failed");
    }
    Ok(result)
}

/// Human-readable summary of a finished batch
pub fn batch_summary(result: &BatchResult) -> String {
    let duration = result.duration().to_std().map(format_duration).unwrap_or_default();
    let mut summary = format!(
        "Run: {}\nStatus: {:?}\nLines: {} completed, {} failed\nDuration: {}\n",
        result.run_id,
        result.status,
        result.completed_lines(),
        result.failed_lines(),
        duration
    );
    for line in result.lines.iter().filter(|l| !l.is_completed()) {
        if let Some(err) = &line.error {
            summary.push_str(&format!("  line {}: {}: {}\n", line.line_number, err.code, err.message));
        }
    }
    if !result.metrics.is_empty() {
        summary.push_str(&format!("Metrics: {}\n", Value::Object(result.metrics.clone())));
    }
    if let Some(err) = &result.aggregation_error {
        summary.push_str(&format!("Aggregation failed: {}: {}\n", err.code, err.message));
    }
    summary
}
