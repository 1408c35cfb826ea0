//! Batch coordination
//!
//! [`BatchCoordinator::exec_bulk`] fans lines out over a bounded worker pool, one
//! tokio task per line gated by a semaphore of `worker_count` permits. Each
//! task owns its line exclusively and returns its outcome through its join
//! handle. Handles are awaited in submission order, so results are rebuilt in
//! input order regardless of completion order.
//!
//! A line that fails or outlives `line_timeout` is recorded as failed; the
//! batch keeps going unless `raise_ex` is set, in which case the first failure
//! stops every other line and becomes the batch's error. Once every line is
//! settled, the captured aggregation inputs of the successful lines are
//! pivoted into columns and the aggregation nodes run once over them.
//!
//! Each line's records are evicted from the executor's [`RunTracker`] as its
//! result is collected, so a long batch does not keep every line in memory
//! twice.
//!
//! [`RunTracker`]: crate::run_info::RunTracker

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::{watch, Semaphore};
use tooling::async_utils::timeout::{with_timeout, TimeoutError};
use tooling::logging::format_duration;
use tracing::{debug, error, info, warn};

use crate::config::ExecutorConfig;
use crate::error::{FlowError, Result, SerializedError};
use crate::executor::{LineExecutor, LineOptions, LineResult};
use crate::input_mapping::{apply_inputs_mapping_for_all_lines, InputSources, InputsMapping, LineInputs};
use crate::run_info::{FlowRunInfo, RunInfo, Status};

/// Outcome of one line within a batch
#[derive(Debug, Clone, Serialize)]
pub struct BatchLineResult {
    pub line_number: usize,
    pub run_id: String,
    pub status: Status,
    pub output: Map<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<SerializedError>,
    /// Flow run record of the line, as it stood when the line was collected
    #[serde(skip)]
    pub run_info: Option<FlowRunInfo>,
    #[serde(skip)]
    pub node_run_infos: Vec<RunInfo>,
}

impl BatchLineResult {
    fn from_line(result: LineResult) -> Self {
        Self {
            line_number: result.line_number,
            error: result.run_info.error.clone(),
            run_id: result.run_id,
            status: result.status,
            output: result.output,
            run_info: Some(result.run_info),
            node_run_infos: result.node_run_infos,
        }
    }

    fn from_error(line_number: usize, run_id: String, err: &FlowError, node_run_infos: Vec<RunInfo>) -> Self {
        Self {
            line_number,
            run_id,
            status: Status::Failed,
            output: Map::new(),
            error: Some(err.to_serialized()),
            run_info: None,
            node_run_infos,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.status == Status::Completed
    }
}

/// Outcome of a batch run
#[derive(Debug, Clone, Serialize)]
pub struct BatchResult {
    pub run_id: String,
    /// `Failed` only when every line failed
    pub status: Status,
    /// One entry per line, ordered as submitted
    pub lines: Vec<BatchLineResult>,
    pub metrics: Map<String, Value>,
    /// Flow outputs that reference aggregation nodes
    pub aggregation_outputs: Map<String, Value>,
    #[serde(skip)]
    pub aggregation_run_infos: Vec<RunInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aggregation_error: Option<SerializedError>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}

impl BatchResult {
    pub fn completed_lines(&self) -> usize {
        self.lines.iter().filter(|l| l.is_completed()).count()
    }

    pub fn failed_lines(&self) -> usize {
        self.lines.len() - self.completed_lines()
    }

    /// Outputs of successful lines, in line order
    pub fn outputs(&self) -> impl Iterator<Item = (usize, &Map<String, Value>)> {
        self.lines
            .iter()
            .filter(|l| l.is_completed())
            .map(|l| (l.line_number, &l.output))
    }

    pub fn duration(&self) -> chrono::Duration {
        self.end_time - self.start_time
    }
}

enum LineOutcome {
    Finished(LineResult),
    Failed { run_id: String, error: FlowError },
    /// Canceled because another line failed under `raise_ex`
    Stopped { run_id: String, error: FlowError },
}

/// Runs many lines of one flow concurrently
pub struct BatchCoordinator {
    executor: Arc<LineExecutor>,
    config: ExecutorConfig,
}

impl BatchCoordinator {
    /// Coordinator using the executor's own configuration
    pub fn new(executor: Arc<LineExecutor>) -> Self {
        let config = executor.config().clone();
        Self { executor, config }
    }

    pub fn with_config(mut self, config: ExecutorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn executor(&self) -> &Arc<LineExecutor> {
        &self.executor
    }

    /// Map raw input sources to lines, then run them
    pub async fn exec_batch(
        &self,
        sources: &InputSources,
        mapping: &InputsMapping,
        run_id: Option<String>,
    ) -> Result<BatchResult> {
        let lines = apply_inputs_mapping_for_all_lines(sources, mapping)?;
        debug!(lines = lines.len(), sources = sources.len(), "inputs mapped");
        self.exec_bulk(lines, run_id).await
    }

    /// Run every line, then the aggregation nodes over the successful ones
    pub async fn exec_bulk(&self, lines: Vec<LineInputs>, run_id: Option<String>) -> Result<BatchResult> {
        let run_id = run_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let start_time = Utc::now();
        let start = Instant::now();
        let total = lines.len();
        info!(
            flow = %self.executor.flow().name(),
            run_id = %run_id,
            lines = total,
            workers = self.config.worker_count,
            "batch started"
        );

        let raise_ex = self.config.raise_ex;
        let (stop, _) = watch::channel(false);
        let stop = Arc::new(stop);
        let semaphore = Arc::new(Semaphore::new(self.config.worker_count));
        let mut handles = Vec::with_capacity(total);
        for line in lines {
            if *stop.borrow() {
                break;
            }
            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| FlowError::LineAborted {
                    line: line.line_number,
                    message: e.to_string(),
                })?;
            if *stop.borrow() {
                break;
            }
            let executor = self.executor.clone();
            let root_run_id = run_id.clone();
            let line_timeout = self.config.line_timeout;
            let line_number = line.line_number;
            let stop_tx = stop.clone();
            let mut stopped = stop.subscribe();
            let handle = tokio::spawn(async move {
                let _permit = permit;
                let options = LineOptions {
                    raise_ex,
                    ..Default::default()
                }
                .with_run_id(root_run_id.as_str());
                let line_run_id = LineExecutor::line_run_id(&root_run_id, line.line_number);
                let run = with_timeout(
                    line_timeout,
                    executor.exec_line(line.inputs, line.line_number, &options),
                );
                let outcome = tokio::select! {
                    outcome = run => match outcome {
                        Ok(result) => LineOutcome::Finished(result),
                        Err(TimeoutError::OperationFailed(error)) => LineOutcome::Failed {
                            run_id: line_run_id,
                            error,
                        },
                        Err(TimeoutError::Timeout(elapsed)) => {
                            let error = FlowError::LineTimeout {
                                line: line.line_number,
                                timeout_secs: elapsed.as_secs(),
                            };
                            executor.tracker().cancel_flow_run(&line_run_id, &error);
                            warn!(line = line.line_number, "line timed out");
                            LineOutcome::Failed {
                                run_id: line_run_id,
                                error,
                            }
                        }
                    },
                    true = async { stopped.wait_for(|flag| *flag).await.is_ok() } => {
                        let error = FlowError::LineAborted {
                            line: line.line_number,
                            message: "batch stopped by a failed line".to_string(),
                        };
                        executor.tracker().cancel_flow_run(&line_run_id, &error);
                        debug!(line = line.line_number, "line stopped");
                        LineOutcome::Stopped {
                            run_id: line_run_id,
                            error,
                        }
                    }
                };
                if raise_ex && matches!(outcome, LineOutcome::Failed { .. }) {
                    stop_tx.send_replace(true);
                }
                outcome
            });
            handles.push((line_number, handle));
        }

        let mut outcomes = Vec::with_capacity(handles.len());
        for (line_number, handle) in handles {
            let outcome = match handle.await {
                Ok(outcome) => outcome,
                Err(join_error) => {
                    let error = FlowError::LineAborted {
                        line: line_number,
                        message: join_error.to_string(),
                    };
                    let line_run_id = LineExecutor::line_run_id(&run_id, line_number);
                    self.executor.tracker().fail_flow_run(&line_run_id, &error);
                    warn!(line = line_number, error = %error, "line aborted");
                    LineOutcome::Failed {
                        run_id: line_run_id,
                        error,
                    }
                }
            };
            outcomes.push((line_number, outcome));
        }

        if raise_ex {
            let first_failure = outcomes
                .iter()
                .position(|(_, outcome)| matches!(outcome, LineOutcome::Failed { .. }));
            if let Some((line_number, LineOutcome::Failed { error, .. })) =
                first_failure.map(|position| outcomes.swap_remove(position))
            {
                error!(
                    run_id = %run_id,
                    line = line_number,
                    error = %error,
                    "batch stopped by a failed line"
                );
                return Err(error);
            }
        }

        let tracker = self.executor.tracker();
        let mut columns = Map::new();
        let mut lines = Vec::with_capacity(outcomes.len());
        for (line_number, outcome) in outcomes {
            let mut line = match outcome {
                LineOutcome::Finished(result) => {
                    if result.is_completed() {
                        collect_columns(&mut columns, &result.aggregation_inputs);
                    }
                    BatchLineResult::from_line(result)
                }
                LineOutcome::Failed { run_id, error } | LineOutcome::Stopped { run_id, error } => {
                    let node_run_infos = tracker.node_runs_for(&run_id);
                    BatchLineResult::from_error(line_number, run_id, &error, node_run_infos)
                }
            };
            let evicted = tracker.evict_flow_run(&line.run_id);
            if line.run_info.is_none() {
                line.run_info = evicted;
            }
            lines.push(line);
        }

        let completed = lines.iter().filter(|l| l.is_completed()).count();
        let mut metrics = Map::new();
        let mut aggregation_outputs = Map::new();
        let mut aggregation_run_infos = Vec::new();
        let mut aggregation_error = None;
        if self.executor.flow().has_aggregation_nodes() {
            if completed == 0 {
                warn!(run_id = %run_id, "no line succeeded, aggregation skipped");
            } else {
                match self.executor.exec_aggregation(&columns, &run_id).await {
                    Ok(result) => {
                        metrics = result.metrics;
                        aggregation_outputs = result.outputs;
                        aggregation_run_infos = result.node_run_infos;
                    }
                    Err(err) => {
                        error!(run_id = %run_id, error = %err, "aggregation failed");
                        aggregation_run_infos =
                            tracker.node_runs_for(&LineExecutor::aggregation_run_id(&run_id));
                        aggregation_error = Some(err.to_serialized());
                    }
                }
                tracker.evict_flow_run(&LineExecutor::aggregation_run_id(&run_id));
            }
        }

        let status = if total > 0 && completed == 0 {
            Status::Failed
        } else {
            Status::Completed
        };
        info!(
            flow = %self.executor.flow().name(),
            run_id = %run_id,
            completed,
            failed = total - completed,
            elapsed = %format_duration(start.elapsed()),
            "batch finished"
        );
        Ok(BatchResult {
            run_id,
            status,
            lines,
            metrics,
            aggregation_outputs,
            aggregation_run_infos,
            aggregation_error,
            start_time,
            end_time: Utc::now(),
        })
    }
}

/// Append one line's captured values to the per-expression columns
fn collect_columns(columns: &mut Map<String, Value>, captured: &Map<String, Value>) {
    for (expression, value) in captured {
        let column = columns
            .entry(expression.clone())
            .or_insert_with(|| Value::Array(Vec::new()));
        if let Value::Array(values) = column {
            values.push(value.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionSet;
    use crate::flow::{Flow, FlowInputDefinition, InputAssignment, InputType, Node, Tool, ToolType, ValueType};
    use crate::resolver::FileCodeLoader;
    use crate::tool::{NodeOutput, ToolArgs, ToolError, ToolRegistry, ToolSignature};
    use indexmap::IndexMap;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn registry(active: Arc<AtomicUsize>, peak: Arc<AtomicUsize>) -> ToolRegistry {
        let mut registry = ToolRegistry::new();
        registry.register_function(
            "slow_square",
            ToolSignature::new().with_input("x", vec![InputType::Value(ValueType::Int)]),
            move |args: ToolArgs| {
                let active = active.clone();
                let peak = peak.clone();
                async move {
                    let x = args.require("x")?.as_i64().unwrap_or_default();
                    if x < 0 {
                        return Err(ToolError::execution("negative input"));
                    }
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_secs((10 - x.min(10)) as u64)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    Ok(NodeOutput::from(json!(x * x)))
                }
            },
        );
        registry.register_function(
            "total",
            ToolSignature::new().with_input("values", vec![InputType::Value(ValueType::List)]),
            |args: ToolArgs| async move {
                let values = args.require("values")?.as_array().cloned().unwrap_or_default();
                let sum: i64 = values.iter().filter_map(Value::as_i64).sum();
                Ok(NodeOutput::from(json!(sum)))
            },
        );
        registry
    }

    fn flow() -> Flow {
        Flow::new("squares")
            .with_tool(Tool::new("slow_square", ToolType::Python))
            .with_tool(Tool::new("total", ToolType::Python))
            .with_input("x", FlowInputDefinition::new(ValueType::Int))
            .with_node(Node::new("square", "slow_square").with_input("x", InputAssignment::flow_input("x")))
            .with_node(
                Node::new("sum", "total")
                    .with_input("values", InputAssignment::node_output("square"))
                    .reduce(),
            )
            .with_output("squared", InputAssignment::node_output("square"))
            .with_output("total", InputAssignment::node_output("sum"))
    }

    fn coordinator(config: ExecutorConfig) -> (BatchCoordinator, Arc<AtomicUsize>) {
        let peak = Arc::new(AtomicUsize::new(0));
        let executor = LineExecutor::create(
            flow(),
            &ConnectionSet::new(),
            Arc::new(registry(Arc::new(AtomicUsize::new(0)), peak.clone())),
            Arc::new(FileCodeLoader::new(".")),
            config,
        )
        .unwrap();
        (BatchCoordinator::new(Arc::new(executor)), peak)
    }

    fn lines(values: &[i64]) -> Vec<LineInputs> {
        values
            .iter()
            .enumerate()
            .map(|(line_number, x)| LineInputs {
                line_number,
                inputs: json!({ "x": x }).as_object().cloned().unwrap_or_default(),
            })
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_results_keep_line_order_and_aggregate() {
        let (coordinator, _) = coordinator(ExecutorConfig::default().with_worker_count(4));
        let result = coordinator
            .exec_bulk(lines(&[1, 2, 3, 4]), Some("run".to_string()))
            .await
            .unwrap();

        assert_eq!(result.status, Status::Completed);
        let squared: Vec<Value> = result.outputs().map(|(_, o)| o["squared"].clone()).collect();
        assert_eq!(squared, vec![json!(1), json!(4), json!(9), json!(16)]);
        assert!(result.lines.iter().all(|l| !l.output.contains_key("total")));
        assert_eq!(result.metrics.get("sum"), Some(&json!(30)));
        assert_eq!(result.metrics.get("total"), Some(&json!(30)));
        assert_eq!(result.aggregation_outputs.get("total"), Some(&json!(30)));
        assert_eq!(result.lines[2].run_id, "run_2");
    }

    #[tokio::test(start_paused = true)]
    async fn test_worker_count_bounds_concurrency() {
        let (coordinator, peak) = coordinator(ExecutorConfig::default().with_worker_count(2));
        coordinator
            .exec_bulk(lines(&[1, 2, 3, 4, 5, 6]), None)
            .await
            .unwrap();
        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert!(peak.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_line_does_not_abort_batch() {
        let (coordinator, _) = coordinator(ExecutorConfig::default());
        let result = coordinator
            .exec_bulk(lines(&[3, -1, 4]), None)
            .await
            .unwrap();

        assert_eq!(result.status, Status::Completed);
        assert_eq!(result.completed_lines(), 2);
        assert_eq!(result.failed_lines(), 1);
        let failed = &result.lines[1];
        assert_eq!(failed.status, Status::Failed);
        assert_eq!(failed.error.as_ref().unwrap().code, "ToolExecutionError");
        assert_eq!(result.metrics.get("sum"), Some(&json!(25)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_lines_failing_skips_aggregation() {
        let (coordinator, _) = coordinator(ExecutorConfig::default());
        let result = coordinator.exec_bulk(lines(&[-1, -2]), None).await.unwrap();
        assert_eq!(result.status, Status::Failed);
        assert!(result.metrics.is_empty());
        assert!(result.aggregation_run_infos.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_line_timeout_fails_only_that_line() {
        let config = ExecutorConfig::default().with_line_timeout(Duration::from_secs(5));
        let (coordinator, _) = coordinator(config);
        let result = coordinator
            .exec_bulk(lines(&[9, 1]), Some("slow".to_string()))
            .await
            .unwrap();

        assert!(result.lines[0].is_completed());
        let timed_out = &result.lines[1];
        assert_eq!(timed_out.status, Status::Failed);
        assert_eq!(
            timed_out.error.as_ref().unwrap().code,
            "LineExecutionTimeoutError"
        );
        let run = timed_out.run_info.as_ref().unwrap();
        assert_eq!(run.status, Status::Canceled);
        assert_eq!(timed_out.node_run_infos[0].status, Status::Canceled);
        assert!(coordinator.executor().tracker().get_flow_run("slow_1").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_tracker_is_drained_after_batch() {
        let (coordinator, _) = coordinator(ExecutorConfig::default().with_worker_count(8));
        let mut values: Vec<i64> = (0..40).map(|x| x % 10).collect();
        values.push(-1);
        let result = coordinator
            .exec_bulk(lines(&values), Some("bulk".to_string()))
            .await
            .unwrap();

        assert_eq!(result.lines.len(), 41);
        assert_eq!(result.failed_lines(), 1);
        assert!(result.lines.iter().all(|l| l.run_info.is_some()));
        assert_eq!(result.lines[40].node_run_infos[0].status, Status::Failed);
        assert_eq!(result.aggregation_run_infos[0].status, Status::Completed);

        let tracker = coordinator.executor().tracker();
        assert_eq!(tracker.flow_run_count(), 0);
        assert_eq!(tracker.node_run_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_raise_ex_stops_batch_on_first_failure() {
        let config = ExecutorConfig::default().with_worker_count(4).with_raise_ex(true);
        let (coordinator, _) = coordinator(config);
        let err = coordinator
            .exec_bulk(lines(&[3, -1, 4]), Some("strict".to_string()))
            .await
            .unwrap_err();

        assert_eq!(err.code(), "ToolExecutionError");
        let tracker = coordinator.executor().tracker();
        assert_eq!(tracker.get_flow_run("strict_1").unwrap().status, Status::Failed);
        let stopped = tracker.get_flow_run("strict_0").unwrap();
        assert_eq!(stopped.status, Status::Canceled);
        assert_eq!(stopped.error.unwrap().code, "LineAborted");
        assert_eq!(tracker.get_node_run("strict_0_square").unwrap().status, Status::Canceled);
        assert!(tracker.get_flow_run("strict_reduce").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_raise_ex_without_failures_runs_to_the_end() {
        let config = ExecutorConfig::default().with_raise_ex(true);
        let (coordinator, _) = coordinator(config);
        let result = coordinator.exec_bulk(lines(&[1, 2]), None).await.unwrap();
        assert_eq!(result.completed_lines(), 2);
        assert_eq!(result.metrics.get("sum"), Some(&json!(5)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exec_batch_maps_sources() {
        let (coordinator, _) = coordinator(ExecutorConfig::default());
        let mut sources = IndexMap::new();
        sources.insert(
            "data".to_string(),
            vec![
                json!({"value": 2}).as_object().cloned().unwrap(),
                json!({"value": 5}).as_object().cloned().unwrap(),
            ],
        );
        let mut mapping = IndexMap::new();
        mapping.insert("x".to_string(), json!("${data.value}"));

        let result = coordinator.exec_batch(&sources, &mapping, None).await.unwrap();
        assert_eq!(result.lines.len(), 2);
        assert_eq!(result.lines[1].output.get("squared"), Some(&json!(25)));
    }
}
