//! Batch engine — the top-level orchestrator of one batch run.
//!
//! Loads the flow once (one `FlowExecutor`), snapshots it into the run
//! folder, resolves the line inputs, runs them through the line execution
//! pool, runs the aggregation pass over the completed lines, and persists
//! the tables, metrics and exception record.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::watch;
use tracing::{info, warn};

use engine::{AggregationResult, FlowExecutor, LineResult, Status};
use storage::LocalStorageOperations;

use crate::error::BatchError;
use crate::inputs::{BatchInputsProcessor, LINE_NUMBER_KEY};
use crate::pool::{LineExecutionPool, DEFAULT_LINE_TIMEOUT_SEC, DEFAULT_WORKER_COUNT};
use crate::result::BatchResult;

/// Environment variable selecting the worker start mode.
pub const BATCH_METHOD_ENV_VAR: &str = "PF_BATCH_METHOD";

/// Resolve the configured batch method. Invalid values fall back to the
/// platform default with a warning.
pub fn batch_method() -> &'static str {
    let platform_default = if cfg!(unix) { "fork" } else { "spawn" };
    match std::env::var(BATCH_METHOD_ENV_VAR).ok().as_deref() {
        Some("fork") => "fork",
        Some("spawn") => "spawn",
        Some(invalid) if !invalid.is_empty() => {
            warn!(
                value = %invalid,
                default = platform_default,
                "invalid {BATCH_METHOD_ENV_VAR}, falling back to the platform default"
            );
            platform_default
        }
        _ => platform_default,
    }
}

#[derive(Debug, Clone)]
pub struct BatchEngineConfig {
    pub worker_count: usize,
    pub line_timeout_sec: Option<u64>,
    /// Truncate the input stream (debugging aid).
    pub max_lines: Option<usize>,
}

impl Default for BatchEngineConfig {
    fn default() -> Self {
        Self {
            worker_count: DEFAULT_WORKER_COUNT,
            line_timeout_sec: Some(DEFAULT_LINE_TIMEOUT_SEC),
            max_lines: None,
        }
    }
}

pub struct BatchEngine {
    executor: Arc<FlowExecutor>,
    storage: Arc<LocalStorageOperations>,
    config: BatchEngineConfig,
    cancel_tx: watch::Sender<bool>,
    cancel_rx: watch::Receiver<bool>,
}

impl BatchEngine {
    pub fn new(
        executor: Arc<FlowExecutor>,
        storage: Arc<LocalStorageOperations>,
        config: BatchEngineConfig,
    ) -> Self {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        Self {
            executor,
            storage,
            config,
            cancel_tx,
            cancel_rx,
        }
    }

    /// Request cooperative cancellation: no further lines start, in-flight
    /// lines drain, the remaining lines are recorded as `Canceled`, and the
    /// batch reports `Canceled`.
    pub fn request_cancel(&self) {
        let _ = self.cancel_tx.send(true);
    }

    /// Run the batch. The batch itself completes even when every line
    /// fails; only input-resolution and storage failures surface as `Err`.
    pub async fn run(
        &self,
        run_name: &str,
        flow_dir: &Path,
        input_dirs: &BTreeMap<String, PathBuf>,
        inputs_mapping: Option<&BTreeMap<String, Value>>,
        parent_sources: BTreeMap<String, Vec<BTreeMap<String, Value>>>,
    ) -> Result<BatchResult, BatchError> {
        let started = Utc::now();
        self.storage
            .append_log(&format!("Starting batch run {run_name}."));

        // 1. Snapshot the flow with the variant-resolved DAG.
        let resolved_dag = self.executor.resolved_dag_yaml()?;
        self.storage
            .dump_snapshot(flow_dir, &resolved_dag, &self.executor.tools_manifest())?;

        // 2. Resolve line inputs. A mapping failure means no line ever ran.
        let processor =
            BatchInputsProcessor::new(self.executor.flow().inputs.clone(), self.config.max_lines);
        let lines =
            match processor.process_batch_inputs(input_dirs, parent_sources, inputs_mapping) {
                Ok(lines) => lines,
                Err(e) => {
                    let _ = self.storage.dump_exception(&e.to_error_dict());
                    self.storage
                        .append_log(&format!("Batch input resolution failed: {e}"));
                    return Err(e);
                }
            };
        self.storage.dump_inputs(&lines)?;

        let method = batch_method();
        info!(method, lines = lines.len(), "starting batch execution");

        // 3. Run all lines.
        let pool_lines: Vec<(usize, BTreeMap<String, Value>)> = lines
            .iter()
            .enumerate()
            .map(|(index, line)| {
                let line_number = line
                    .get(LINE_NUMBER_KEY)
                    .and_then(Value::as_u64)
                    .map(|n| n as usize)
                    .unwrap_or(index);
                (line_number, line.clone())
            })
            .collect();
        let pool = LineExecutionPool::new(
            Arc::clone(&self.executor),
            self.config.worker_count,
            self.config.line_timeout_sec,
            run_name,
            Some(self.cancel_rx.clone()),
        );
        let line_results = pool.run(pool_lines).await;
        let canceled = *self.cancel_rx.borrow();

        // 4. Aggregation over the completed lines.
        let aggregation = if self.executor.has_aggregation_nodes() && !canceled {
            let (flow_lists, aggregation_lists) = gather_aggregation_inputs(
                &line_results,
                self.executor.flow().inputs.keys(),
            );
            self.executor
                .exec_aggregation(&flow_lists, &aggregation_lists, Some(run_name.to_string()))
                .await
        } else {
            AggregationResult::default()
        };

        // 5. Output tables (completed lines only, ascending line number).
        let output_rows: Vec<Value> = line_results
            .iter()
            .filter(|r| r.run_info.status == Status::Completed)
            .map(|r| Value::Object(r.output.iter().map(|(k, v)| (k.clone(), v.clone())).collect()))
            .collect();
        self.storage.dump_flow_outputs(&output_rows)?;
        self.storage.dump_outputs(&output_rows)?;

        // 6. Metrics from the aggregation pass.
        let metrics_value = Value::Object(
            aggregation
                .metrics
                .iter()
                .map(|(k, v)| (k.clone(), json!(v)))
                .collect(),
        );
        self.storage.dump_metrics(&metrics_value)?;

        // 7. Summary.
        let status = if canceled { Status::Canceled } else { Status::Completed };
        let mut result =
            BatchResult::create(started, Utc::now(), &line_results, &aggregation, status);
        result
            .system_metrics
            .insert("batch_method".into(), json!(method));

        // 8. Exception record when any line failed.
        if result.failed_lines > 0 {
            let bulk = BatchError::BulkRun {
                message: result
                    .error_summary
                    .first_error_message()
                    .unwrap_or_else(|| "line execution failed".to_string()),
                failed_lines: result.failed_lines,
                total_lines: result.total_lines,
                errors: result
                    .error_summary
                    .error_list
                    .iter()
                    .map(|e| json!({"line_number": e.line_number, "error": e.error}))
                    .collect(),
            };
            if let Err(e) = self.storage.dump_exception(&bulk.to_error_dict()) {
                warn!(error = %e, "failed to write exception record");
            }
        }

        self.storage.append_log(&format!(
            "Batch run {run_name} finished: {}/{} lines completed, {} failed.",
            result.completed_lines, result.total_lines, result.failed_lines
        ));
        Ok(result)
    }
}

/// Build the list-valued aggregation inputs from the completed lines.
fn gather_aggregation_inputs<'a>(
    line_results: &[LineResult],
    flow_input_names: impl Iterator<Item = &'a String>,
) -> (BTreeMap<String, Value>, BTreeMap<String, Value>) {
    let completed: Vec<&LineResult> = line_results
        .iter()
        .filter(|r| r.run_info.status == Status::Completed)
        .collect();

    let mut flow_lists = BTreeMap::new();
    for name in flow_input_names {
        let values: Vec<Value> = completed
            .iter()
            .map(|r| {
                r.run_info
                    .inputs
                    .as_ref()
                    .and_then(|inputs| inputs.get(name))
                    .cloned()
                    .unwrap_or(Value::Null)
            })
            .collect();
        flow_lists.insert(name.clone(), Value::Array(values));
    }

    let mut keys: Vec<String> = Vec::new();
    for result in &completed {
        for key in result.aggregation_inputs.keys() {
            if !keys.contains(key) {
                keys.push(key.clone());
            }
        }
    }
    let mut aggregation_lists = BTreeMap::new();
    for key in keys {
        let values: Vec<Value> = completed
            .iter()
            .map(|r| r.aggregation_inputs.get(&key).cloned().unwrap_or(Value::Null))
            .collect();
        aggregation_lists.insert(key, Value::Array(values));
    }
    (flow_lists, aggregation_lists)
}

/// Load a parent run's resolved inputs and outputs as the `run.inputs` /
/// `run.outputs` sources for an evaluation run.
pub fn parent_run_sources(
    parent_storage: &LocalStorageOperations,
) -> Result<BTreeMap<String, Vec<BTreeMap<String, Value>>>, BatchError> {
    let table = parent_storage
        .load_inputs_and_outputs()
        .map_err(BatchError::Storage)?;
    let mut inputs_rows = Vec::with_capacity(table.len());
    let mut outputs_rows = Vec::with_capacity(table.len());
    for row in &table {
        let Some(map) = row.as_object() else { continue };
        let line = map.get(LINE_NUMBER_KEY).cloned().unwrap_or(Value::Null);
        let mut inputs_row = BTreeMap::from([(LINE_NUMBER_KEY.to_string(), line.clone())]);
        let mut outputs_row = BTreeMap::from([(LINE_NUMBER_KEY.to_string(), line)]);
        for (key, value) in map {
            if let Some(name) = key.strip_prefix("inputs.") {
                inputs_row.insert(name.to_string(), value.clone());
            } else if let Some(name) = key.strip_prefix("outputs.") {
                outputs_row.insert(name.to_string(), value.clone());
            }
        }
        inputs_rows.push(inputs_row);
        outputs_rows.push(outputs_row);
    }
    Ok(BTreeMap::from([
        ("run.inputs".to_string(), inputs_rows),
        ("run.outputs".to_string(), outputs_rows),
    ]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use db::{Config, Run};
    use engine::models::{
        Flow, FlowInputDefinition, FlowOutputDefinition, InputAssignment, Node, ValueType,
    };
    use engine::ExecutorConfig;
    use nodes::mock::MockTool;
    use nodes::{Tool, ToolContext, ToolError, ToolParam, ToolRegistry, ToolSignature, ToolValue};
    use std::io::Write as _;
    use std::time::Duration;

    fn storage_for(dir: &Path, name: &str) -> Arc<LocalStorageOperations> {
        let config = Config::default().with_run_output_path(dir.display().to_string());
        let run = Run::new("/tmp/flow", Some(name.to_string()), None, None, &config).unwrap();
        Arc::new(LocalStorageOperations::with_batch_size(&run, 1).unwrap())
    }

    fn jsonl_file(dir: &Path, name: &str, lines: &[Value]) -> PathBuf {
        let path = dir.join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        for line in lines {
            writeln!(file, "{}", serde_json::to_string(line).unwrap()).unwrap();
        }
        path
    }

    fn simple_flow() -> Flow {
        Flow::new(
            BTreeMap::from([(
                "question".to_string(),
                FlowInputDefinition::typed(ValueType::String),
            )]),
            BTreeMap::from([(
                "answer".to_string(),
                FlowOutputDefinition {
                    value_type: None,
                    reference: InputAssignment::parse(&json!("${work.output.question}")),
                },
            )]),
            vec![Node::new("work", "test.work").with_input("question", json!("${inputs.question}"))],
        )
    }

    fn engine_with_tool(
        tool: MockTool,
        storage: Arc<LocalStorageOperations>,
        line_timeout_sec: Option<u64>,
    ) -> BatchEngine {
        let mut registry = ToolRegistry::new();
        registry.register("test.work", Arc::new(tool));
        let executor = FlowExecutor::create(
            simple_flow(),
            &registry,
            &Default::default(),
            storage.clone(),
            None,
            ExecutorConfig::default(),
        )
        .unwrap();
        BatchEngine::new(
            Arc::new(executor),
            storage,
            BatchEngineConfig {
                worker_count: 2,
                line_timeout_sec,
                max_lines: None,
            },
        )
    }

    #[tokio::test]
    async fn happy_path_persists_tables_and_completes() {
        let out = tempfile::tempdir().unwrap();
        let data = tempfile::tempdir().unwrap();
        let storage = storage_for(out.path(), "happy");
        let engine = engine_with_tool(MockTool::echoing("test.work"), storage.clone(), None);

        let data_file = jsonl_file(
            data.path(),
            "data.jsonl",
            &[json!({"question": "q0"}), json!({"question": "q1"})],
        );
        let result = engine
            .run(
                "happy",
                Path::new("/nonexistent-flow-dir"),
                &BTreeMap::from([("data".to_string(), data_file)]),
                Some(&BTreeMap::new()),
                BTreeMap::new(),
            )
            .await
            .unwrap();

        assert_eq!(result.status, Status::Completed);
        assert_eq!(result.total_lines, 2);
        assert_eq!(result.completed_lines, 2);
        assert_eq!(result.failed_lines, 0);
        assert_eq!(storage.load_exception(), json!({}));

        let table = storage.load_inputs_and_outputs().unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table[0]["inputs.question"], json!("q0"));
        assert_eq!(table[0]["outputs.answer"], json!("q0"));

        let detail = storage.load_detail().unwrap();
        assert_eq!(detail.flow_runs.len(), 2);
        assert_eq!(detail.node_runs.len(), 2);
    }

    #[tokio::test]
    async fn per_line_timeout_fails_lines_but_completes_the_batch() {
        let out = tempfile::tempdir().unwrap();
        let data = tempfile::tempdir().unwrap();
        let storage = storage_for(out.path(), "timeouts");
        let engine = engine_with_tool(
            MockTool::sleeping("test.work", Duration::from_secs(5), json!({"question": "late"})),
            storage.clone(),
            Some(1),
        );

        let data_file = jsonl_file(
            data.path(),
            "data.jsonl",
            &[
                json!({"question": "q0"}),
                json!({"question": "q1"}),
                json!({"question": "q2"}),
            ],
        );
        let result = engine
            .run(
                "timeouts",
                Path::new("/nonexistent-flow-dir"),
                &BTreeMap::from([("data".to_string(), data_file)]),
                Some(&BTreeMap::new()),
                BTreeMap::new(),
            )
            .await
            .unwrap();

        assert_eq!(result.status, Status::Completed);
        assert_eq!(result.total_lines, 3);
        assert_eq!(result.failed_lines, 3);
        for (i, line_error) in result.error_summary.error_list.iter().enumerate() {
            assert_eq!(line_error.error["code"], "UserError");
            assert_eq!(
                line_error.error["message"],
                json!(format!("Line {i} execution timeout for exceeding 1 seconds"))
            );
        }

        let exception = storage.load_exception();
        assert_eq!(exception["failed_lines"], json!(3));
        assert_eq!(exception["total_lines"], json!(3));
        assert!(exception["message"]
            .as_str()
            .unwrap()
            .contains("execution timeout for exceeding 1 seconds"));
    }

    #[tokio::test]
    async fn empty_alias_fails_before_any_line_runs() {
        let out = tempfile::tempdir().unwrap();
        let data = tempfile::tempdir().unwrap();
        let storage = storage_for(out.path(), "badinput");
        let engine = engine_with_tool(MockTool::echoing("test.work"), storage.clone(), None);

        let data_file = jsonl_file(data.path(), "data.jsonl", &[json!({"question": "q1"})]);
        let baseline_file = jsonl_file(data.path(), "baseline.jsonl", &[]);
        let err = engine
            .run(
                "badinput",
                Path::new("/nonexistent-flow-dir"),
                &BTreeMap::from([
                    ("data".to_string(), data_file),
                    ("baseline".to_string(), baseline_file),
                ]),
                Some(&BTreeMap::new()),
                BTreeMap::new(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, BatchError::InputMapping(_)));
        assert!(err.to_string().contains("empty list"));
        // No line ever ran.
        assert!(storage.load_detail().unwrap().flow_runs.is_empty());
    }

    /// Mean of the gathered scores, logged as a metric.
    struct MeanTool {
        signature: ToolSignature,
    }

    #[async_trait::async_trait]
    impl Tool for MeanTool {
        fn identity(&self) -> &str {
            "test.mean"
        }

        fn signature(&self) -> &ToolSignature {
            &self.signature
        }

        async fn invoke(
            &self,
            args: BTreeMap<String, Value>,
            ctx: &ToolContext,
        ) -> Result<ToolValue, ToolError> {
            let scores = args["scores"].as_array().cloned().unwrap_or_default();
            let sum: f64 = scores.iter().filter_map(Value::as_f64).sum();
            let mean = if scores.is_empty() { 0.0 } else { sum / scores.len() as f64 };
            ctx.log_metric("accuracy", mean);
            Ok(json!({"accuracy": mean}).into())
        }
    }

    #[tokio::test]
    async fn aggregation_runs_after_all_lines_and_records_metrics() {
        let out = tempfile::tempdir().unwrap();
        let data = tempfile::tempdir().unwrap();
        let storage = storage_for(out.path(), "agg");

        let flow = Flow::new(
            BTreeMap::from([(
                "score".to_string(),
                FlowInputDefinition::typed(ValueType::Double),
            )]),
            BTreeMap::new(),
            vec![
                Node::new("score", "test.echo").with_input("val", json!("${inputs.score}")),
                Node::new("acc", "test.mean")
                    .with_input("scores", json!("${score.output.val}"))
                    .aggregating(),
            ],
        );
        let mut registry = ToolRegistry::new();
        registry.register("test.echo", Arc::new(MockTool::echoing("test.echo")));
        registry.register(
            "test.mean",
            Arc::new(MeanTool {
                signature: ToolSignature::new(vec![ToolParam::new("scores", "list")]),
            }),
        );
        let executor = FlowExecutor::create(
            flow,
            &registry,
            &Default::default(),
            storage.clone(),
            None,
            ExecutorConfig::default(),
        )
        .unwrap();
        let engine = BatchEngine::new(
            Arc::new(executor),
            storage.clone(),
            BatchEngineConfig::default(),
        );

        let data_file = jsonl_file(
            data.path(),
            "data.jsonl",
            &[json!({"score": 1.0}), json!({"score": 0.0})],
        );
        let result = engine
            .run(
                "agg",
                Path::new("/nonexistent-flow-dir"),
                &BTreeMap::from([("data".to_string(), data_file)]),
                Some(&BTreeMap::new()),
                BTreeMap::new(),
            )
            .await
            .unwrap();

        assert_eq!(result.completed_lines, 2);
        assert_eq!(result.metrics.get("accuracy"), Some(&0.5));
        assert_eq!(storage.load_metrics().unwrap(), json!({"accuracy": 0.5}));

        // The reduce-node record landed in the aggregation slot.
        let detail = storage.load_detail().unwrap();
        let reduce = detail
            .node_runs
            .iter()
            .find(|r| r["node"] == json!("acc"))
            .unwrap();
        assert_eq!(reduce["run_id"], json!("agg_acc_reduce"));
        assert_eq!(reduce["index"], Value::Null);
        assert_eq!(reduce["inputs"]["scores"], json!([1.0, 0.0]));
    }

    #[tokio::test]
    async fn cancellation_reports_a_canceled_batch_with_every_line_accounted() {
        let out = tempfile::tempdir().unwrap();
        let data = tempfile::tempdir().unwrap();
        let storage = storage_for(out.path(), "cancel");
        let engine = engine_with_tool(
            MockTool::sleeping("test.work", Duration::from_millis(100), json!({"question": "x"})),
            storage.clone(),
            None,
        );
        engine.request_cancel();

        let rows: Vec<Value> = (0..6).map(|i| json!({"question": format!("q{i}")})).collect();
        let data_file = jsonl_file(data.path(), "data.jsonl", &rows);
        let result = engine
            .run(
                "cancel",
                Path::new("/nonexistent-flow-dir"),
                &BTreeMap::from([("data".to_string(), data_file)]),
                Some(&BTreeMap::new()),
                BTreeMap::new(),
            )
            .await
            .unwrap();
        assert_eq!(result.status, Status::Canceled);
        // No line vanishes on cancel: all six report Canceled records.
        assert_eq!(result.total_lines, 6);
        assert_eq!(result.completed_lines, 0);
        assert_eq!(result.failed_lines, 0);
        let detail = storage.load_detail().unwrap();
        assert_eq!(detail.flow_runs.len(), 6);
        assert!(detail
            .flow_runs
            .iter()
            .all(|r| r["status"] == json!("Canceled")));
    }
}
