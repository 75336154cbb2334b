//! Run tracker — exclusive owner of in-memory run-info records during
//! execution.
//!
//! Records are created `Running`, transitioned to a terminal status exactly
//! once, and handed to the storage backend for persistence. A failed
//! persist never aborts execution; it is logged and swallowed.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use tracing::warn;

use crate::error::EngineError;
use crate::run_info::{FlowRunInfo, NodeRunInfo, Status};
use crate::trace::{collect_token_usage, Trace};

// ---------------------------------------------------------------------------
// Storage trait
// ---------------------------------------------------------------------------

/// Persistence contract for run records. Implemented by the local storage
/// layer; the engine only ever sees this trait.
#[async_trait]
pub trait RunStorage: Send + Sync {
    async fn persist_node_run(&self, run_info: &NodeRunInfo) -> anyhow::Result<()>;
    async fn persist_flow_run(&self, run_info: &FlowRunInfo) -> anyhow::Result<()>;
}

/// Storage that drops every record. Used for tests and `flow test` runs
/// where nothing should be written.
pub struct DummyRunStorage;

#[async_trait]
impl RunStorage for DummyRunStorage {
    async fn persist_node_run(&self, _run_info: &NodeRunInfo) -> anyhow::Result<()> {
        Ok(())
    }

    async fn persist_flow_run(&self, _run_info: &FlowRunInfo) -> anyhow::Result<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// RunTracker
// ---------------------------------------------------------------------------

pub struct RunTracker {
    storage: std::sync::Arc<dyn RunStorage>,
    node_runs: Mutex<HashMap<String, NodeRunInfo>>,
    flow_runs: Mutex<HashMap<String, FlowRunInfo>>,
}

impl RunTracker {
    pub fn new(storage: std::sync::Arc<dyn RunStorage>) -> Self {
        Self {
            storage,
            node_runs: Mutex::new(HashMap::new()),
            flow_runs: Mutex::new(HashMap::new()),
        }
    }

    pub fn dummy() -> Self {
        Self::new(std::sync::Arc::new(DummyRunStorage))
    }

    // ------ flow (line) runs ------

    pub fn start_flow_run(
        &self,
        run_id: impl Into<String>,
        flow_run_id: impl Into<String>,
        root_run_id: impl Into<String>,
        index: Option<usize>,
        inputs: Option<BTreeMap<String, Value>>,
        variant_id: impl Into<String>,
    ) -> FlowRunInfo {
        let info = FlowRunInfo {
            run_id: run_id.into(),
            flow_run_id: flow_run_id.into(),
            root_run_id: root_run_id.into(),
            status: Status::Running,
            inputs,
            output: None,
            error: None,
            start_time: Utc::now(),
            end_time: None,
            index,
            api_calls: None,
            variant_id: variant_id.into(),
            name: String::new(),
            description: String::new(),
            tags: None,
            system_metrics: BTreeMap::new(),
            upload_metrics: false,
        };
        self.flow_runs
            .lock()
            .unwrap()
            .insert(info.run_id.clone(), info.clone());
        info
    }

    /// Complete a line run. System metrics aggregate the line's node runs.
    pub fn end_flow_run(
        &self,
        run_id: &str,
        result: Result<Option<Value>, &EngineError>,
    ) -> Option<FlowRunInfo> {
        let node_metrics = self.aggregate_node_metrics(run_id);
        let mut runs = self.flow_runs.lock().unwrap();
        let info = match runs.get_mut(run_id) {
            Some(info) => info,
            None => {
                warn!(run_id, "end_flow_run for unknown run id, ignoring");
                return None;
            }
        };
        if info.status.is_terminated() {
            warn!(run_id, status = %info.status, "flow run already terminated, ignoring");
            return Some(info.clone());
        }
        info.end_time = Some(Utc::now());
        let duration = (info.end_time.unwrap() - info.start_time)
            .num_microseconds()
            .unwrap_or_default() as f64
            / 1_000_000.0;
        info.system_metrics.insert("duration".into(), json!(duration));
        for (key, value) in node_metrics {
            info.system_metrics.insert(key, value);
        }
        match result {
            Ok(output) => {
                info.status = Status::Completed;
                info.output = output;
            }
            Err(e) => {
                info.status = if matches!(e, EngineError::Canceled) {
                    Status::Canceled
                } else {
                    Status::Failed
                };
                info.error = Some(e.to_error_dict());
            }
        }
        Some(info.clone())
    }

    pub fn flow_run(&self, run_id: &str) -> Option<FlowRunInfo> {
        self.flow_runs.lock().unwrap().get(run_id).cloned()
    }

    /// Store the validated inputs on a running line record.
    pub fn set_flow_run_inputs(&self, run_id: &str, inputs: BTreeMap<String, Value>) {
        if let Some(info) = self.flow_runs.lock().unwrap().get_mut(run_id) {
            info.inputs = Some(inputs);
        } else {
            warn!(run_id, "set_flow_run_inputs for unknown run id, ignoring");
        }
    }

    // ------ node runs ------

    /// Insert a `Running` node record.
    pub fn start_node_run(
        &self,
        node: &str,
        flow_run_id: &str,
        parent_run_id: &str,
        run_id: &str,
        index: Option<usize>,
        variant_id: &str,
    ) -> NodeRunInfo {
        let info = NodeRunInfo {
            node: node.to_string(),
            flow_run_id: flow_run_id.to_string(),
            run_id: run_id.to_string(),
            parent_run_id: parent_run_id.to_string(),
            status: Status::Running,
            inputs: None,
            output: None,
            error: None,
            start_time: Utc::now(),
            end_time: None,
            index,
            api_calls: None,
            variant_id: variant_id.to_string(),
            cached_run_id: None,
            cached_flow_run_id: None,
            system_metrics: BTreeMap::new(),
        };
        self.node_runs
            .lock()
            .unwrap()
            .insert(run_id.to_string(), info.clone());
        info
    }

    /// Store the resolved inputs, dropping the reserved `self` key.
    pub fn set_node_inputs(&self, run_id: &str, mut inputs: BTreeMap<String, Value>) {
        inputs.remove("self");
        if let Some(info) = self.node_runs.lock().unwrap().get_mut(run_id) {
            info.inputs = Some(inputs);
        } else {
            warn!(run_id, "set_node_inputs for unknown run id, ignoring");
        }
    }

    /// Complete a node run with a successful result.
    pub fn end_node_run_success(
        &self,
        run_id: &str,
        output: Value,
        traces: Vec<Trace>,
    ) -> Option<NodeRunInfo> {
        self.end_node_run(run_id, Ok(output), traces)
    }

    /// Complete a node run with an error.
    pub fn end_node_run_error(
        &self,
        run_id: &str,
        error: &EngineError,
        traces: Vec<Trace>,
    ) -> Option<NodeRunInfo> {
        self.end_node_run(run_id, Err(error), traces)
    }

    /// Complete a node run from a cache hit: no traces, zero tool work, the
    /// cached run ids recorded for provenance.
    pub fn end_node_run_cache_hit(
        &self,
        run_id: &str,
        output: Value,
        cached_run_id: Option<String>,
        cached_flow_run_id: Option<String>,
    ) -> Option<NodeRunInfo> {
        {
            let mut runs = self.node_runs.lock().unwrap();
            if let Some(info) = runs.get_mut(run_id) {
                info.cached_run_id = cached_run_id;
                info.cached_flow_run_id = cached_flow_run_id;
            }
        }
        self.end_node_run(run_id, Ok(output), Vec::new())
    }

    fn end_node_run(
        &self,
        run_id: &str,
        result: Result<Value, &EngineError>,
        traces: Vec<Trace>,
    ) -> Option<NodeRunInfo> {
        let mut runs = self.node_runs.lock().unwrap();
        let info = match runs.get_mut(run_id) {
            Some(info) => info,
            None => {
                warn!(run_id, "end_node_run for unknown run id, ignoring");
                return None;
            }
        };
        if info.status.is_terminated() {
            // Double completion is a caller bug, never a reason to abort.
            warn!(run_id, status = %info.status, "node run already terminated, ignoring");
            return Some(info.clone());
        }
        info.end_time = Some(Utc::now());
        let duration = (info.end_time.unwrap() - info.start_time)
            .num_microseconds()
            .unwrap_or_default() as f64
            / 1_000_000.0;
        info.system_metrics.insert("duration".into(), json!(duration));
        for (key, value) in collect_token_usage(&traces) {
            info.system_metrics.insert(key, json!(value));
        }
        if !traces.is_empty() {
            info.api_calls = Some(traces);
        }
        match result {
            Ok(output) => {
                info.status = Status::Completed;
                info.output = Some(output);
            }
            Err(e) => {
                info.status = Status::Failed;
                info.error = Some(e.to_error_dict());
            }
        }
        Some(info.clone())
    }

    /// Insert a terminal `Bypassed` record with null output.
    pub fn bypass_node_run(
        &self,
        node: &str,
        flow_run_id: &str,
        parent_run_id: &str,
        run_id: &str,
        index: Option<usize>,
        variant_id: &str,
    ) -> NodeRunInfo {
        let now = Utc::now();
        let info = NodeRunInfo {
            node: node.to_string(),
            flow_run_id: flow_run_id.to_string(),
            run_id: run_id.to_string(),
            parent_run_id: parent_run_id.to_string(),
            status: Status::Bypassed,
            inputs: None,
            output: None,
            error: None,
            start_time: now,
            end_time: Some(now),
            index,
            api_calls: None,
            variant_id: variant_id.to_string(),
            cached_run_id: None,
            cached_flow_run_id: None,
            system_metrics: BTreeMap::from([("duration".to_string(), json!(0.0))]),
        };
        self.node_runs
            .lock()
            .unwrap()
            .insert(run_id.to_string(), info.clone());
        info
    }

    pub fn node_run(&self, run_id: &str) -> Option<NodeRunInfo> {
        self.node_runs.lock().unwrap().get(run_id).cloned()
    }

    /// All node runs belonging to the given line run.
    pub fn node_runs_for_parent(&self, parent_run_id: &str) -> Vec<NodeRunInfo> {
        self.node_runs
            .lock()
            .unwrap()
            .values()
            .filter(|info| info.parent_run_id == parent_run_id)
            .cloned()
            .collect()
    }

    // ------ persistence ------

    /// Hand a node record to storage. Failures are logged and swallowed.
    pub async fn persist_node_run(&self, run_info: &NodeRunInfo) {
        if let Err(e) = self.storage.persist_node_run(run_info).await {
            warn!(run_id = %run_info.run_id, error = %e, "failed to persist node run");
        }
    }

    /// Hand a line record to storage. Failures are logged and swallowed.
    pub async fn persist_flow_run(&self, run_info: &FlowRunInfo) {
        if let Err(e) = self.storage.persist_flow_run(run_info).await {
            warn!(run_id = %run_info.run_id, error = %e, "failed to persist flow run");
        }
    }

    /// Sum duration/token system metrics over the line's node runs.
    fn aggregate_node_metrics(&self, parent_run_id: &str) -> BTreeMap<String, Value> {
        let runs = self.node_runs.lock().unwrap();
        let mut tokens: BTreeMap<String, u64> = BTreeMap::new();
        for info in runs.values().filter(|i| i.parent_run_id == parent_run_id) {
            for key in ["total_tokens", "prompt_tokens", "completion_tokens"] {
                if let Some(n) = info.system_metrics.get(key).and_then(Value::as_u64) {
                    *tokens.entry(key.to_string()).or_insert(0) += n;
                }
            }
        }
        // Every line reports token counts, even when zero, so batch sums
        // stay well-defined.
        for key in ["total_tokens", "prompt_tokens", "completion_tokens"] {
            tokens.entry(key.to_string()).or_insert(0);
        }
        tokens.into_iter().map(|(k, v)| (k, json!(v))).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run_info::node_run_id;
    use crate::trace::TraceType;

    #[test]
    fn node_run_lifecycle() {
        let tracker = RunTracker::dummy();
        let run_id = node_run_id("run1", "fetch", Some(0), false);
        tracker.start_node_run("fetch", "run1", "run1_0", &run_id, Some(0), "");
        tracker.set_node_inputs(
            &run_id,
            BTreeMap::from([
                ("url".to_string(), json!("u")),
                ("self".to_string(), json!("dropped")),
            ]),
        );
        let info = tracker
            .end_node_run_success(&run_id, json!({"text": "x"}), Vec::new())
            .unwrap();
        assert_eq!(info.status, Status::Completed);
        assert_eq!(info.output, Some(json!({"text": "x"})));
        assert!(info.inputs.as_ref().unwrap().contains_key("url"));
        assert!(!info.inputs.as_ref().unwrap().contains_key("self"));
        assert!(info.system_metrics.contains_key("duration"));
    }

    #[test]
    fn double_completion_keeps_first_terminal_record() {
        let tracker = RunTracker::dummy();
        tracker.start_node_run("n", "run1", "run1_0", "run1_n_0", Some(0), "");
        tracker.end_node_run_success("run1_n_0", json!(1), Vec::new());
        let err = EngineError::Unexpected("late".into());
        let info = tracker
            .end_node_run_error("run1_n_0", &err, Vec::new())
            .unwrap();
        assert_eq!(info.status, Status::Completed);
        assert_eq!(info.output, Some(json!(1)));
        assert!(info.error.is_none());
    }

    #[test]
    fn error_completion_records_error_dict() {
        let tracker = RunTracker::dummy();
        tracker.start_node_run("n", "run1", "run1_0", "run1_n_0", Some(0), "");
        let err = EngineError::ToolExecution {
            node: "n".into(),
            module: None,
            message: "boom".into(),
        };
        let info = tracker
            .end_node_run_error("run1_n_0", &err, Vec::new())
            .unwrap();
        assert_eq!(info.status, Status::Failed);
        assert_eq!(info.error.as_ref().unwrap()["code"], "UserError");
    }

    #[test]
    fn bypassed_record_is_terminal_with_null_output() {
        let tracker = RunTracker::dummy();
        let info = tracker.bypass_node_run("c", "run1", "run1_0", "run1_c_0", Some(0), "");
        assert_eq!(info.status, Status::Bypassed);
        assert!(info.output.is_none());
        assert!(info.end_time.is_some());
    }

    #[test]
    fn flow_run_collects_node_token_metrics() {
        let tracker = RunTracker::dummy();
        tracker.start_flow_run("run1_0", "run1", "run1", Some(0), None, "");
        tracker.start_node_run("chat", "run1", "run1_0", "run1_chat_0", Some(0), "");
        let mut llm = Trace::new("chat", TraceType::Llm, BTreeMap::new());
        llm.output = Some(json!({"usage": {"total_tokens": 7, "prompt_tokens": 3, "completion_tokens": 4}}));
        tracker.end_node_run_success("run1_chat_0", json!("ok"), vec![llm]);

        let info = tracker.end_flow_run("run1_0", Ok(Some(json!({})))).unwrap();
        assert_eq!(info.status, Status::Completed);
        assert_eq!(info.system_metrics.get("total_tokens"), Some(&json!(7)));
        assert!(info.system_metrics.contains_key("duration"));
    }

    #[test]
    fn cache_hit_records_provenance_and_no_api_calls() {
        let tracker = RunTracker::dummy();
        tracker.start_node_run("n", "run1", "run1_0", "run1_n_0", Some(0), "");
        let info = tracker
            .end_node_run_cache_hit(
                "run1_n_0",
                json!("cached"),
                Some("old_run_n_0".into()),
                Some("old_run".into()),
            )
            .unwrap();
        assert_eq!(info.status, Status::Completed);
        assert_eq!(info.cached_run_id.as_deref(), Some("old_run_n_0"));
        assert_eq!(info.cached_flow_run_id.as_deref(), Some("old_run"));
        assert!(info.api_calls.is_none());
        assert_eq!(info.system_metrics.get("total_tokens"), None);
    }
}
