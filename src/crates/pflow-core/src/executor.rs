//! Line execution
//!
//! A [`LineExecutor`] owns a validated flow and the callables resolved for it. It
//! runs one input record at a time through the per-line nodes in topological
//! order, strictly sequentially:
//!
//! ```text
//! inputs ──▶ defaults + coercion ──▶ node 1 ──▶ node 2 ──▶ ... ──▶ outputs
//!                                      │ skip.when truthy
//!                                      └──▶ skip.return (tool not called)
//! ```
//!
//! The first failing node stops the line. Its run info carries the error, the
//! line is marked failed and, with `raise_ex`, the error is returned to the
//! caller once run info is final.
//!
//! Streamed tool results are drained before they are stored. The only exception
//! is a node read by exactly one flow output and nothing else, which may hand its
//! live stream to the caller when generator output is allowed.
//!
//! Aggregation nodes never run here; [`LineExecutor::exec_aggregation`] runs them
//! once over the columns collected from every line.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use indexmap::IndexMap;
use serde_json::{Map, Value};
use tooling::logging::format_duration;
use tracing::{debug, error, info, warn};

use crate::config::ExecutorConfig;
use crate::connection::ConnectionSet;
use crate::error::{FlowError, Result, SerializedError};
use crate::flow::{Flow, InputAssignment, Node, NodeReference};
use crate::resolver::{CodeLoader, ResolvedTool, ToolResolver};
use crate::run_info::{FlowRunInfo, NodeRunKey, RunInfo, RunTracker, Status};
use crate::streaming::{ensure_node_result_is_serializable, LiveStream, StreamEnd};
use crate::tool::{NodeOutput, ToolArgs, ToolError, ToolRegistry};
use crate::validator::{FlowValidator, ValidatedFlow};

/// Per-call switches for [`LineExecutor::exec_line`]
#[derive(Debug, Clone, Default)]
pub struct LineOptions {
    /// Root run id; a fresh one is generated when absent
    pub run_id: Option<String>,
    pub raise_ex: bool,
    pub allow_generator_output: bool,
}

impl LineOptions {
    pub fn from_config(config: &ExecutorConfig) -> Self {
        Self {
            run_id: None,
            raise_ex: config.raise_ex,
            allow_generator_output: config.allow_generator_output,
        }
    }

    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }
}

/// Outcome of one line
#[derive(Debug)]
pub struct LineResult {
    pub line_number: usize,
    pub run_id: String,
    pub status: Status,
    /// Declared outputs, minus those referencing aggregation nodes
    pub output: Map<String, Value>,
    /// Outputs handed over as live streams
    pub streams: IndexMap<String, LiveStream>,
    /// Values captured for aggregation nodes, keyed by reference expression
    pub aggregation_inputs: Map<String, Value>,
    pub run_info: FlowRunInfo,
    pub node_run_infos: Vec<RunInfo>,
}

impl LineResult {
    pub fn is_completed(&self) -> bool {
        self.status == Status::Completed
    }

    pub fn error(&self) -> Option<&SerializedError> {
        self.run_info.error.as_ref()
    }

    /// Drain live streams into the output map
    pub async fn into_output(self) -> Result<Map<String, Value>> {
        let mut output = self.output;
        for (name, stream) in self.streams {
            let text = stream
                .drain()
                .await
                .map_err(|e| FlowError::tool_execution(name.as_str(), e))?;
            output.insert(name, text.into_value());
        }
        Ok(output)
    }
}

/// Outcome of the aggregation pass
#[derive(Debug, Clone, Default)]
pub struct AggregationResult {
    /// Output of every aggregation node, keyed by node name
    pub node_outputs: Map<String, Value>,
    /// Flow outputs that reference aggregation nodes
    pub outputs: Map<String, Value>,
    pub metrics: Map<String, Value>,
    pub node_run_infos: Vec<RunInfo>,
}

enum Invocation {
    Value(Value),
    Stream(LiveStream),
}

enum Prepared {
    Skip(Value),
    Call {
        args: ToolArgs,
        recorded: Map<String, Value>,
    },
}

/// Where assignments are resolved from
struct Scope<'a> {
    inputs: &'a Map<String, Value>,
    outputs: &'a HashMap<String, Value>,
    /// Columnar values, set only for the aggregation pass
    columns: Option<&'a Map<String, Value>>,
}

#[derive(Default)]
struct LineState {
    inputs: Map<String, Value>,
    outputs: HashMap<String, Value>,
    streams: HashMap<String, LiveStream>,
}

struct LineOutputs {
    output: Map<String, Value>,
    streams: IndexMap<String, LiveStream>,
    aggregation_inputs: Map<String, Value>,
}

/// Runs lines of one validated flow
pub struct LineExecutor {
    flow: Arc<ValidatedFlow>,
    tools: IndexMap<String, ResolvedTool>,
    tracker: Arc<RunTracker>,
    aggregation_references: Vec<InputAssignment>,
    pass_through: HashSet<String>,
    config: ExecutorConfig,
}

impl LineExecutor {
    /// Bind every node of a validated flow through `resolver`
    pub fn new(flow: ValidatedFlow, resolver: &ToolResolver, config: ExecutorConfig) -> Result<Self> {
        let tools = resolver.resolve_all(&flow)?;
        let aggregation_references = flow.aggregation_references();
        let pass_through = pass_through_nodes(&flow);
        Ok(Self {
            flow: Arc::new(flow),
            tools,
            tracker: Arc::new(RunTracker::new()),
            aggregation_references,
            pass_through,
            config,
        })
    }

    /// Validate, resolve and build an executor in one step
    pub fn create(
        flow: Flow,
        connections: &ConnectionSet,
        registry: Arc<ToolRegistry>,
        loader: Arc<dyn CodeLoader>,
        config: ExecutorConfig,
    ) -> Result<Self> {
        let validated = FlowValidator::new(&registry).ensure_flow_valid(flow, connections)?;
        let resolver =
            ToolResolver::new(registry, loader).with_streaming(config.allow_generator_output);
        Self::new(validated, &resolver, config)
    }

    pub fn flow(&self) -> &ValidatedFlow {
        &self.flow
    }

    pub fn tracker(&self) -> &Arc<RunTracker> {
        &self.tracker
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Run id of one line of a root run
    pub fn line_run_id(root_run_id: &str, index: usize) -> String {
        format!("{}_{}", root_run_id, index)
    }

    /// Run id of the aggregation pass of a root run
    pub fn aggregation_run_id(root_run_id: &str) -> String {
        format!("{}_reduce", root_run_id)
    }

    /// Execute one line
    ///
    /// A failing line yields `Ok` with [`Status::Failed`] and whatever outputs
    /// were computed, unless `options.raise_ex` is set.
    pub async fn exec_line(
        &self,
        inputs: Map<String, Value>,
        index: usize,
        options: &LineOptions,
    ) -> Result<LineResult> {
        let root_run_id = options
            .run_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let run_id = Self::line_run_id(&root_run_id, index);
        let started = self.tracker.start_flow_run(
            &self.flow.flow().id,
            &root_run_id,
            &run_id,
            Some(index),
            inputs.clone(),
        );
        let start = Instant::now();

        let mut state = LineState::default();
        match self
            .run_line(&mut state, inputs, &run_id, index, options)
            .await
        {
            Ok(outputs) => {
                self.tracker
                    .complete_flow_run(&run_id, outputs.output.clone());
                info!(
                    flow = %self.flow.name(),
                    line = index,
                    elapsed = %format_duration(start.elapsed()),
                    "line completed"
                );
                Ok(LineResult {
                    line_number: index,
                    status: Status::Completed,
                    output: outputs.output,
                    streams: outputs.streams,
                    aggregation_inputs: outputs.aggregation_inputs,
                    run_info: self.tracker.get_flow_run(&run_id).unwrap_or(started),
                    node_run_infos: self.tracker.node_runs_for(&run_id),
                    run_id,
                })
            }
            Err(err) => {
                self.tracker.fail_flow_run(&run_id, &err);
                warn!(
                    flow = %self.flow.name(),
                    line = index,
                    code = err.code(),
                    error = %err,
                    "line failed"
                );
                if options.raise_ex {
                    return Err(err);
                }
                Ok(LineResult {
                    line_number: index,
                    status: Status::Failed,
                    output: self.partial_output(&state),
                    streams: IndexMap::new(),
                    aggregation_inputs: Map::new(),
                    run_info: self.tracker.get_flow_run(&run_id).unwrap_or(started),
                    node_run_infos: self.tracker.node_runs_for(&run_id),
                    run_id,
                })
            }
        }
    }

    async fn run_line(
        &self,
        state: &mut LineState,
        inputs: Map<String, Value>,
        run_id: &str,
        index: usize,
        options: &LineOptions,
    ) -> Result<LineOutputs> {
        state.inputs = self.prepare_inputs(inputs)?;

        for node in self.flow.line_nodes() {
            let key = NodeRunKey {
                node: &node.name,
                flow_run_id: run_id,
                parent_run_id: run_id,
                index: Some(index),
            };
            let scope = Scope {
                inputs: &state.inputs,
                outputs: &state.outputs,
                columns: None,
            };
            let pass_through =
                options.allow_generator_output && self.pass_through.contains(&node.name);
            match self.run_node(node, &key, &scope, pass_through).await? {
                Invocation::Value(value) => {
                    state.outputs.insert(node.name.clone(), value);
                }
                Invocation::Stream(stream) => {
                    state.streams.insert(node.name.clone(), stream);
                }
            }
        }

        let (output, streams) = self.assemble_output(state)?;
        let aggregation_inputs = self.capture_aggregation_inputs(state)?;
        Ok(LineOutputs {
            output,
            streams,
            aggregation_inputs,
        })
    }

    /// Fill defaults and coerce declared flow inputs
    fn prepare_inputs(&self, mut inputs: Map<String, Value>) -> Result<Map<String, Value>> {
        let mut prepared = Map::new();
        for (name, definition) in &self.flow.flow().inputs {
            let value = match inputs.remove(name) {
                Some(value) => value,
                None => definition
                    .default
                    .clone()
                    .ok_or_else(|| FlowError::InputNotFound {
                        input: name.clone(),
                    })?,
            };
            let value = definition
                .value_type
                .parse_value(&value)
                .map_err(|message| FlowError::InputTypeError {
                    input: name.clone(),
                    expected: definition.value_type.as_str().to_string(),
                    message,
                })?;
            prepared.insert(name.clone(), value);
        }
        prepared.extend(inputs);
        Ok(prepared)
    }

    async fn run_node(
        &self,
        node: &Node,
        key: &NodeRunKey<'_>,
        scope: &Scope<'_>,
        pass_through: bool,
    ) -> Result<Invocation> {
        let start = Instant::now();
        let (tool, prepared) = match self.prepare_node(node, scope) {
            Ok(prepared) => prepared,
            Err(err) => {
                let run_id = self.tracker.start_node_run(key, Map::new());
                self.tracker.fail_node_run(&run_id, &err);
                return Err(err);
            }
        };
        let (args, recorded) = match prepared {
            Prepared::Skip(value) => {
                self.tracker.bypass_node_run(key, value.clone());
                debug!(node = %node.name, "node bypassed by skip condition");
                return Ok(Invocation::Value(value));
            }
            Prepared::Call { args, recorded } => (args, recorded),
        };

        let run_id = self.tracker.start_node_run(key, recorded);
        debug!(node = %node.name, run_id = %run_id, "node started");
        let output = match (tool.callable)(args).await {
            Ok(output) => output,
            Err(e) => return Err(self.fail_node(&run_id, node, e)),
        };

        match output {
            NodeOutput::Stream(stream) if pass_through => {
                debug!(node = %node.name, "node output passed through as a live stream");
                let tracker = self.tracker.clone();
                let node_name = node.name.clone();
                Ok(Invocation::Stream(stream.on_finish(move |end| match end {
                    StreamEnd::Completed(text) => tracker.complete_node_run(&run_id, text.into_value()),
                    StreamEnd::Failed { error, .. } => {
                        let err = FlowError::tool_execution(node_name.as_str(), error);
                        warn!(node = %node_name, error = %err, "streamed output failed");
                        tracker.fail_node_run(&run_id, &err);
                    }
                    StreamEnd::Dropped(partial) => {
                        debug!(node = %node_name, "streamed output dropped before the end");
                        tracker.cancel_node_run(&run_id, Some(partial.into_value()));
                    }
                })))
            }
            output => match ensure_node_result_is_serializable(output).await {
                Ok(value) => {
                    self.tracker.complete_node_run(&run_id, value.clone());
                    debug!(
                        node = %node.name,
                        elapsed = %format_duration(start.elapsed()),
                        "node completed"
                    );
                    Ok(Invocation::Value(value))
                }
                Err(e) => Err(self.fail_node(&run_id, node, e)),
            },
        }
    }

    fn fail_node(&self, run_id: &str, node: &Node, source: ToolError) -> FlowError {
        let err = FlowError::tool_execution(node.name.as_str(), source);
        self.tracker.fail_node_run(run_id, &err);
        debug!(node = %node.name, error = %err, "node failed");
        err
    }

    /// Evaluate the skip condition, then resolve call arguments
    fn prepare_node(&self, node: &Node, scope: &Scope<'_>) -> Result<(&ResolvedTool, Prepared)> {
        let tool = self
            .tools
            .get(&node.name)
            .ok_or_else(|| FlowError::ToolNotRegistered {
                node: node.name.clone(),
                key: node.tool.clone().unwrap_or_default(),
            })?;

        if let Some(skip) = &node.skip {
            let condition = self.resolve_assignment(scope, &node.name, &skip.condition)?;
            if is_truthy(&condition) {
                let value = self.resolve_assignment(scope, &node.name, &skip.return_value)?;
                return Ok((tool, Prepared::Skip(value)));
            }
        }

        let connections = self.flow.node_connections(&node.name);
        let mut args = ToolArgs::new();
        let mut recorded = Map::new();
        for (name, assignment) in &node.inputs {
            if tool.init_args.contains_key(name) {
                continue;
            }
            if let Some(connection) = connections.and_then(|c| c.get(name)) {
                args.insert(name.as_str(), connection.to_value());
                recorded.insert(name.clone(), Value::String(connection.name.clone()));
                continue;
            }
            let value = self.resolve_assignment(scope, &node.name, assignment)?;
            recorded.insert(name.clone(), value.clone());
            args.insert(name.as_str(), value);
        }
        Ok((tool, Prepared::Call { args, recorded }))
    }

    fn resolve_assignment(
        &self,
        scope: &Scope<'_>,
        consumer: &str,
        assignment: &InputAssignment,
    ) -> Result<Value> {
        match assignment {
            InputAssignment::Literal(value) => Ok(value.clone()),
            InputAssignment::FlowInput(name) => match scope.columns {
                Some(columns) => Ok(column(columns, assignment)),
                None => scope
                    .inputs
                    .get(name)
                    .cloned()
                    .ok_or_else(|| FlowError::InputNotFound {
                        input: name.clone(),
                    }),
            },
            InputAssignment::NodeReference(reference) => {
                if let Some(columns) = scope.columns {
                    if !self.flow.flow().is_aggregation_node(&reference.node) {
                        return Ok(column(columns, assignment));
                    }
                }
                let output = scope.outputs.get(&reference.node).ok_or_else(|| {
                    FlowError::NodeReferenceNotFound {
                        node: consumer.to_string(),
                        reference: reference.node.clone(),
                    }
                })?;
                resolve_property(consumer, reference, output)
            }
        }
    }

    fn assemble_output(
        &self,
        state: &mut LineState,
    ) -> Result<(Map<String, Value>, IndexMap<String, LiveStream>)> {
        let mut output = Map::new();
        let mut streams = IndexMap::new();
        for (name, definition) in &self.flow.flow().outputs {
            if let InputAssignment::NodeReference(reference) = &definition.reference {
                if let Some(stream) = state.streams.remove(&reference.node) {
                    streams.insert(name.clone(), stream);
                    continue;
                }
            }
            let scope = Scope {
                inputs: &state.inputs,
                outputs: &state.outputs,
                columns: None,
            };
            let value = self.resolve_assignment(&scope, name, &definition.reference)?;
            output.insert(name.clone(), value);
        }
        Ok((output, streams))
    }

    /// Outputs resolvable from the nodes that ran before a failure
    fn partial_output(&self, state: &LineState) -> Map<String, Value> {
        let scope = Scope {
            inputs: &state.inputs,
            outputs: &state.outputs,
            columns: None,
        };
        self.flow
            .flow()
            .outputs
            .iter()
            .filter_map(|(name, definition)| {
                self.resolve_assignment(&scope, name, &definition.reference)
                    .ok()
                    .map(|value| (name.clone(), value))
            })
            .collect()
    }

    fn capture_aggregation_inputs(&self, state: &LineState) -> Result<Map<String, Value>> {
        let scope = Scope {
            inputs: &state.inputs,
            outputs: &state.outputs,
            columns: None,
        };
        let mut captured = Map::new();
        for assignment in &self.aggregation_references {
            let value = self.resolve_assignment(&scope, self.flow.name(), assignment)?;
            captured.insert(assignment.expression(), value);
        }
        Ok(captured)
    }

    /// Run every aggregation node once over `columns`
    ///
    /// `columns` maps each captured reference expression to the list of its
    /// values across the successful lines.
    pub async fn exec_aggregation(
        &self,
        columns: &Map<String, Value>,
        run_id: &str,
    ) -> Result<AggregationResult> {
        let flow_run_id = Self::aggregation_run_id(run_id);
        self.tracker.start_flow_run(
            &self.flow.flow().id,
            run_id,
            &flow_run_id,
            None,
            columns.clone(),
        );
        let start = Instant::now();

        let mut node_outputs = HashMap::new();
        match self
            .run_aggregation_nodes(columns, &flow_run_id, &mut node_outputs)
            .await
        {
            Ok(()) => {
                let scope = Scope {
                    inputs: &Map::new(),
                    outputs: &node_outputs,
                    columns: Some(columns),
                };
                let mut outputs = Map::new();
                for (name, definition) in self.flow.aggregation_outputs() {
                    match self.resolve_assignment(&scope, name, &definition.reference) {
                        Ok(value) => {
                            outputs.insert(name.clone(), value);
                        }
                        Err(e) => warn!(output = %name, error = %e, "aggregation output not resolved"),
                    }
                }
                let metrics = self.extract_metrics(&node_outputs, &outputs);
                self.tracker.complete_flow_run(&flow_run_id, outputs.clone());
                info!(
                    flow = %self.flow.name(),
                    metrics = metrics.len(),
                    elapsed = %format_duration(start.elapsed()),
                    "aggregation completed"
                );

                let node_outputs = self
                    .flow
                    .aggregation_nodes()
                    .filter_map(|node| {
                        node_outputs
                            .get(&node.name)
                            .map(|value| (node.name.clone(), value.clone()))
                    })
                    .collect();
                Ok(AggregationResult {
                    node_outputs,
                    outputs,
                    metrics,
                    node_run_infos: self.tracker.node_runs_for(&flow_run_id),
                })
            }
            Err(err) => {
                self.tracker.fail_flow_run(&flow_run_id, &err);
                error!(flow = %self.flow.name(), error = %err, "aggregation failed");
                Err(err)
            }
        }
    }

    async fn run_aggregation_nodes(
        &self,
        columns: &Map<String, Value>,
        flow_run_id: &str,
        outputs: &mut HashMap<String, Value>,
    ) -> Result<()> {
        let inputs = Map::new();
        for node in self.flow.aggregation_nodes() {
            let key = NodeRunKey {
                node: &node.name,
                flow_run_id,
                parent_run_id: flow_run_id,
                index: None,
            };
            let scope = Scope {
                inputs: &inputs,
                outputs,
                columns: Some(columns),
            };
            let value = match self.run_node(node, &key, &scope, false).await? {
                Invocation::Value(value) => value,
                Invocation::Stream(stream) => stream
                    .drain()
                    .await
                    .map_err(|e| FlowError::tool_execution(node.name.as_str(), e))?
                    .into_value(),
            };
            outputs.insert(node.name.clone(), value);
        }
        Ok(())
    }

    /// Numeric values among aggregation results
    fn extract_metrics(
        &self,
        node_outputs: &HashMap<String, Value>,
        outputs: &Map<String, Value>,
    ) -> Map<String, Value> {
        let mut metrics = Map::new();
        for node in self.flow.aggregation_nodes() {
            match node_outputs.get(&node.name) {
                Some(value) if value.is_number() => {
                    metrics.insert(node.name.clone(), value.clone());
                }
                Some(Value::Object(fields)) => {
                    for (field, value) in fields {
                        if value.is_number() {
                            metrics.insert(field.clone(), value.clone());
                        }
                    }
                }
                _ => {}
            }
        }
        for (name, value) in outputs {
            if value.is_number() {
                metrics.insert(name.clone(), value.clone());
            }
        }
        metrics
    }
}

/// Per-line nodes whose output feeds exactly one flow output, unmodified, and
/// nothing else
fn pass_through_nodes(flow: &ValidatedFlow) -> HashSet<String> {
    let referenced: HashSet<&str> = flow
        .flow()
        .nodes
        .iter()
        .flat_map(|n| n.node_references())
        .map(|r| r.node.as_str())
        .collect();

    let mut counts: HashMap<&str, usize> = HashMap::new();
    let mut with_property = HashSet::new();
    for definition in flow.flow().outputs.values() {
        if let InputAssignment::NodeReference(reference) = &definition.reference {
            *counts.entry(reference.node.as_str()).or_default() += 1;
            if reference.property.is_some() {
                with_property.insert(reference.node.as_str());
            }
        }
    }

    counts
        .into_iter()
        .filter(|(node, count)| {
            *count == 1
                && !with_property.contains(node)
                && !referenced.contains(node)
                && !flow.flow().is_aggregation_node(node)
        })
        .map(|(node, _)| node.to_string())
        .collect()
}

fn column(columns: &Map<String, Value>, assignment: &InputAssignment) -> Value {
    columns
        .get(&assignment.expression())
        .cloned()
        .unwrap_or_else(|| Value::Array(Vec::new()))
}

/// Walk a dotted property path through objects and array indices
fn resolve_property(consumer: &str, reference: &NodeReference, output: &Value) -> Result<Value> {
    let mut current = output;
    for segment in reference.property_path() {
        let next = match current {
            Value::Object(fields) => fields.get(segment),
            Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        };
        current = next.ok_or_else(|| FlowError::InvalidReferenceProperty {
            node: consumer.to_string(),
            reference: reference.node.clone(),
            property: segment.to_string(),
        })?;
    }
    Ok(current.clone())
}

/// Truthiness of a skip condition
fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map_or(true, |f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(fields) => !fields.is_empty(),
    }
}
