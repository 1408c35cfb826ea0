//! Run tracking for lines and nodes
//!
//! Every line execution gets a [`FlowRunInfo`]; every node it reaches gets a
//! [`RunInfo`]. Both live in a [`RunTracker`] shared by the executor, so a failed
//! line can still be inspected after its error has propagated.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{FlowError, SerializedError};

/// Lifecycle status of a flow or node run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Status {
    NotStarted,
    Running,
    Completed,
    Failed,
    Bypassed,
    Canceled,
}

impl Status {
    pub fn is_terminated(&self) -> bool {
        matches!(
            self,
            Status::Completed | Status::Failed | Status::Bypassed | Status::Canceled
        )
    }
}

/// Run record of one node within one line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunInfo {
    pub node: String,
    pub run_id: String,
    pub flow_run_id: String,
    pub parent_run_id: String,
    pub status: Status,
    pub inputs: Map<String, Value>,
    pub output: Option<Value>,
    pub error: Option<SerializedError>,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub index: Option<usize>,
}

impl RunInfo {
    pub fn duration(&self) -> Option<chrono::Duration> {
        self.end_time.map(|end| end - self.start_time)
    }
}

/// Run record of one line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowRunInfo {
    pub run_id: String,
    pub flow_id: String,
    pub root_run_id: String,
    pub status: Status,
    pub inputs: Map<String, Value>,
    pub output: Option<Map<String, Value>>,
    pub error: Option<SerializedError>,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub index: Option<usize>,
}

impl FlowRunInfo {
    pub fn duration(&self) -> Option<chrono::Duration> {
        self.end_time.map(|end| end - self.start_time)
    }
}

/// Identifies a node run being started
#[derive(Debug, Clone)]
pub struct NodeRunKey<'a> {
    pub node: &'a str,
    pub flow_run_id: &'a str,
    pub parent_run_id: &'a str,
    pub index: Option<usize>,
}

impl NodeRunKey<'_> {
    pub fn run_id(&self) -> String {
        format!("{}_{}", self.flow_run_id, self.node)
    }
}

/// Records held by a [`RunTracker`]
///
/// Node runs are bucketed by the flow run they belong to; `owners` maps a
/// node run id back to its bucket.
#[derive(Debug, Default)]
struct Runs {
    flows: IndexMap<String, FlowRunInfo>,
    nodes: HashMap<String, IndexMap<String, RunInfo>>,
    owners: HashMap<String, String>,
}

impl Runs {
    fn node_mut(&mut self, run_id: &str) -> Option<&mut RunInfo> {
        let flow_run_id = self.owners.get(run_id)?;
        self.nodes.get_mut(flow_run_id)?.get_mut(run_id)
    }
}

/// Thread-safe store of flow and node run infos
///
/// Records stay until [`RunTracker::evict_flow_run`] drops them; batch runs
/// evict each line once its result is collected.
#[derive(Debug, Default)]
pub struct RunTracker {
    runs: Mutex<Runs>,
}

impl RunTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start_flow_run(
        &self,
        flow_id: &str,
        root_run_id: &str,
        run_id: &str,
        index: Option<usize>,
        inputs: Map<String, Value>,
    ) -> FlowRunInfo {
        let info = FlowRunInfo {
            run_id: run_id.to_string(),
            flow_id: flow_id.to_string(),
            root_run_id: root_run_id.to_string(),
            status: Status::Running,
            inputs,
            output: None,
            error: None,
            start_time: Utc::now(),
            end_time: None,
            index,
        };
        self.runs
            .lock()
            .flows
            .insert(run_id.to_string(), info.clone());
        info
    }

    pub fn complete_flow_run(&self, run_id: &str, output: Map<String, Value>) {
        self.end_flow_run(run_id, Status::Completed, Some(output), None);
    }

    pub fn fail_flow_run(&self, run_id: &str, error: &FlowError) {
        self.end_flow_run(run_id, Status::Failed, None, Some(error.to_serialized()));
    }

    /// Mark a line canceled, along with its unfinished node runs
    pub fn cancel_flow_run(&self, run_id: &str, error: &FlowError) {
        self.end_flow_run(run_id, Status::Canceled, None, Some(error.to_serialized()));
        let now = Utc::now();
        let mut runs = self.runs.lock();
        let Some(nodes) = runs.nodes.get_mut(run_id) else {
            return;
        };
        for info in nodes.values_mut().filter(|info| !info.status.is_terminated()) {
            info.status = Status::Canceled;
            info.end_time = Some(now);
        }
    }

    fn end_flow_run(
        &self,
        run_id: &str,
        status: Status,
        output: Option<Map<String, Value>>,
        error: Option<SerializedError>,
    ) {
        if let Some(info) = self.runs.lock().flows.get_mut(run_id) {
            info.status = status;
            info.output = output;
            info.error = error;
            info.end_time = Some(Utc::now());
        }
    }

    pub fn start_node_run(&self, key: &NodeRunKey<'_>, inputs: Map<String, Value>) -> String {
        self.insert_node_run(key, Status::Running, inputs, None)
    }

    /// Record a node skipped through its skip condition
    pub fn bypass_node_run(&self, key: &NodeRunKey<'_>, output: Value) -> String {
        let run_id = self.insert_node_run(key, Status::Bypassed, Map::new(), Some(output));
        if let Some(info) = self.runs.lock().node_mut(&run_id) {
            info.end_time = Some(info.start_time);
        }
        run_id
    }

    fn insert_node_run(
        &self,
        key: &NodeRunKey<'_>,
        status: Status,
        inputs: Map<String, Value>,
        output: Option<Value>,
    ) -> String {
        let run_id = key.run_id();
        let info = RunInfo {
            node: key.node.to_string(),
            run_id: run_id.clone(),
            flow_run_id: key.flow_run_id.to_string(),
            parent_run_id: key.parent_run_id.to_string(),
            status,
            inputs,
            output,
            error: None,
            start_time: Utc::now(),
            end_time: None,
            index: key.index,
        };
        let mut runs = self.runs.lock();
        runs.owners.insert(run_id.clone(), key.flow_run_id.to_string());
        runs.nodes
            .entry(key.flow_run_id.to_string())
            .or_default()
            .insert(run_id.clone(), info);
        run_id
    }

    pub fn complete_node_run(&self, run_id: &str, output: Value) {
        if let Some(info) = self.runs.lock().node_mut(run_id) {
            info.status = Status::Completed;
            info.output = Some(output);
            info.end_time = Some(Utc::now());
        }
    }

    pub fn fail_node_run(&self, run_id: &str, error: &FlowError) {
        if let Some(info) = self.runs.lock().node_mut(run_id) {
            info.status = Status::Failed;
            info.error = Some(error.to_serialized());
            info.end_time = Some(Utc::now());
        }
    }

    /// Mark a node run canceled, keeping whatever output it produced
    pub fn cancel_node_run(&self, run_id: &str, partial_output: Option<Value>) {
        if let Some(info) = self.runs.lock().node_mut(run_id) {
            if info.status.is_terminated() {
                return;
            }
            info.status = Status::Canceled;
            info.output = partial_output;
            info.end_time = Some(Utc::now());
        }
    }

    pub fn get_flow_run(&self, run_id: &str) -> Option<FlowRunInfo> {
        self.runs.lock().flows.get(run_id).cloned()
    }

    pub fn get_node_run(&self, run_id: &str) -> Option<RunInfo> {
        let mut runs = self.runs.lock();
        runs.node_mut(run_id).cloned()
    }

    /// Node runs of one line, in start order
    pub fn node_runs_for(&self, flow_run_id: &str) -> Vec<RunInfo> {
        self.runs
            .lock()
            .nodes
            .get(flow_run_id)
            .map(|nodes| nodes.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn flow_runs(&self) -> Vec<FlowRunInfo> {
        self.runs.lock().flows.values().cloned().collect()
    }

    /// Drop a flow run and its node runs, returning the flow run record
    pub fn evict_flow_run(&self, run_id: &str) -> Option<FlowRunInfo> {
        let mut runs = self.runs.lock();
        if let Some(nodes) = runs.nodes.remove(run_id) {
            for node_run_id in nodes.keys() {
                runs.owners.remove(node_run_id);
            }
        }
        runs.flows.shift_remove(run_id)
    }

    pub fn flow_run_count(&self) -> usize {
        self.runs.lock().flows.len()
    }

    pub fn node_run_count(&self) -> usize {
        self.runs.lock().owners.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tool::ToolError;
    use serde_json::json;

    fn key<'a>(node: &'a str, flow_run_id: &'a str) -> NodeRunKey<'a> {
        NodeRunKey {
            node,
            flow_run_id,
            parent_run_id: flow_run_id,
            index: Some(0),
        }
    }

    #[test]
    fn test_node_run_lifecycle() {
        let tracker = RunTracker::new();
        tracker.start_flow_run("flow", "batch", "batch_0", Some(0), Map::new());

        let ok = tracker.start_node_run(&key("a", "batch_0"), Map::new());
        tracker.complete_node_run(&ok, json!("done"));
        let bad = tracker.start_node_run(&key("b", "batch_0"), Map::new());
        tracker.fail_node_run(&bad, &FlowError::tool_execution("b", ToolError::execution("boom")));
        let skipped = tracker.bypass_node_run(&key("c", "batch_0"), json!(null));

        let runs = tracker.node_runs_for("batch_0");
        let statuses: Vec<Status> = runs.iter().map(|r| r.status).collect();
        assert_eq!(statuses, vec![Status::Completed, Status::Failed, Status::Bypassed]);
        assert_eq!(runs[0].output, Some(json!("done")));
        assert_eq!(
            runs[1].error.as_ref().map(|e| e.node_name.as_deref()),
            Some(Some("b"))
        );
        assert_eq!(tracker.get_node_run(&skipped).unwrap().run_id, "batch_0_c");
    }

    #[test]
    fn test_cancel_marks_running_nodes() {
        let tracker = RunTracker::new();
        tracker.start_flow_run("flow", "batch", "batch_3", Some(3), Map::new());
        let done = tracker.start_node_run(&key("a", "batch_3"), Map::new());
        tracker.complete_node_run(&done, json!(1));
        let stuck = tracker.start_node_run(&key("b", "batch_3"), Map::new());

        let err = FlowError::LineTimeout {
            line: 3,
            timeout_secs: 1,
        };
        tracker.cancel_flow_run("batch_3", &err);

        assert_eq!(tracker.get_node_run(&done).unwrap().status, Status::Completed);
        assert_eq!(tracker.get_node_run(&stuck).unwrap().status, Status::Canceled);
        let flow_run = tracker.get_flow_run("batch_3").unwrap();
        assert_eq!(flow_run.status, Status::Canceled);
        assert_eq!(flow_run.error.unwrap().code, "LineExecutionTimeoutError");
        assert!(flow_run.end_time.is_some());
    }

    #[test]
    fn test_evict_drops_only_that_line() {
        let tracker = RunTracker::new();
        for line in ["batch_0", "batch_1"] {
            tracker.start_flow_run("flow", "batch", line, None, Map::new());
            let node = tracker.start_node_run(&key("a", line), Map::new());
            tracker.complete_node_run(&node, json!(line));
        }
        assert_eq!(tracker.node_run_count(), 2);

        let evicted = tracker.evict_flow_run("batch_0").unwrap();
        assert_eq!(evicted.run_id, "batch_0");
        assert!(tracker.get_node_run("batch_0_a").is_none());
        assert!(tracker.node_runs_for("batch_0").is_empty());
        assert_eq!(tracker.get_node_run("batch_1_a").unwrap().output, Some(json!("batch_1")));
        assert_eq!((tracker.flow_run_count(), tracker.node_run_count()), (1, 1));
        assert!(tracker.evict_flow_run("batch_0").is_none());
    }

    #[test]
    fn test_cancel_node_run_keeps_terminal_status() {
        let tracker = RunTracker::new();
        let done = tracker.start_node_run(&key("a", "r_0"), Map::new());
        tracker.complete_node_run(&done, json!("full"));
        tracker.cancel_node_run(&done, Some(json!("part")));
        assert_eq!(tracker.get_node_run(&done).unwrap().status, Status::Completed);

        let open = tracker.start_node_run(&key("b", "r_0"), Map::new());
        tracker.cancel_node_run(&open, Some(json!("pa")));
        let info = tracker.get_node_run(&open).unwrap();
        assert_eq!(info.status, Status::Canceled);
        assert_eq!(info.output, Some(json!("pa")));
        assert!(info.end_time.is_some());
    }
}
