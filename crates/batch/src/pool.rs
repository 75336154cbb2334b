//! Line execution pool.
//!
//! A fixed set of worker tasks pulls `(line_number, inputs)` pairs from a
//! bounded queue, runs each through `FlowExecutor::exec_line` under a
//! per-line timeout, and pushes `LineResult`s onto an output queue. A line
//! failure never aborts the batch; a timeout kills only that line's future
//! and fabricates a failed result. Every submitted line yields exactly one
//! result, so the batch summary always accounts for the full input set.
//! Results come back sorted by line number.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::Value;
use tokio::sync::watch;
use tracing::{info, warn};

use engine::{EngineError, FlowExecutor, FlowRunInfo, LineResult, Status};

/// Default per-line timeout.
pub const DEFAULT_LINE_TIMEOUT_SEC: u64 = 600;

/// Default number of worker tasks.
pub const DEFAULT_WORKER_COUNT: usize = 4;

pub struct LineExecutionPool {
    executor: Arc<FlowExecutor>,
    worker_count: usize,
    line_timeout_sec: Option<u64>,
    run_id: String,
    cancel: watch::Receiver<bool>,
    // Keeps the receiver valid when no external canceler was supplied.
    _own_cancel: Option<watch::Sender<bool>>,
    log_interval: Duration,
}

impl LineExecutionPool {
    pub fn new(
        executor: Arc<FlowExecutor>,
        worker_count: usize,
        line_timeout_sec: Option<u64>,
        run_id: impl Into<String>,
        cancel: Option<watch::Receiver<bool>>,
    ) -> Self {
        let (cancel, own_cancel) = match cancel {
            Some(cancel) => (cancel, None),
            None => {
                let (tx, rx) = watch::channel(false);
                (rx, Some(tx))
            }
        };
        Self {
            executor,
            worker_count: worker_count.max(1),
            line_timeout_sec,
            run_id: run_id.into(),
            cancel,
            _own_cancel: own_cancel,
            log_interval: Duration::from_secs(60),
        }
    }

    /// Shorten the heartbeat interval (used by tests).
    pub fn with_log_interval(mut self, interval: Duration) -> Self {
        self.log_interval = interval;
        self
    }

    /// Run all lines and return their results ordered by line number.
    /// Cancellation stops starting new lines: lines already executing
    /// drain normally (finish, fail, or time out), and every line not yet
    /// started reports a `Canceled` result instead of being dropped.
    pub async fn run(&self, lines: Vec<(usize, BTreeMap<String, Value>)>) -> Vec<LineResult> {
        let total = lines.len();
        info!(
            total,
            workers = self.worker_count,
            timeout_sec = ?self.line_timeout_sec,
            "starting line execution pool"
        );

        let (task_tx, task_rx) =
            async_channel::bounded::<(usize, BTreeMap<String, Value>)>(self.worker_count);
        let (result_tx, result_rx) = async_channel::unbounded::<LineResult>();
        let completed = Arc::new(AtomicUsize::new(0));
        let elapsed_ms = Arc::new(AtomicU64::new(0));

        // Feeder: the bounded queue caps the number of outstanding lines.
        // Cancellation is handled at the worker side so that every
        // submitted line still produces a result.
        let feeder = {
            let task_tx = task_tx.clone();
            tokio::spawn(async move {
                for item in lines {
                    if task_tx.send(item).await.is_err() {
                        break;
                    }
                }
            })
        };
        drop(task_tx);

        // Workers.
        let mut workers = Vec::with_capacity(self.worker_count);
        for _ in 0..self.worker_count {
            let task_rx = task_rx.clone();
            let result_tx = result_tx.clone();
            let executor = Arc::clone(&self.executor);
            let cancel = self.cancel.clone();
            let run_id = self.run_id.clone();
            let timeout_sec = self.line_timeout_sec;
            let completed = Arc::clone(&completed);
            let elapsed_ms = Arc::clone(&elapsed_ms);
            workers.push(tokio::spawn(async move {
                while let Ok((line_number, inputs)) = task_rx.recv().await {
                    // A dequeued line always produces a result: lines not
                    // yet started when the cancel arrives are recorded as
                    // Canceled rather than executed or dropped.
                    let result = if *cancel.borrow() {
                        info!(line = line_number, "cancel requested, line not started");
                        canceled_line_result(&executor, line_number, &run_id).await
                    } else {
                        let started = Instant::now();
                        let result = exec_line_with_timeout(
                            &executor,
                            line_number,
                            inputs,
                            timeout_sec,
                            &run_id,
                        )
                        .await;
                        completed.fetch_add(1, Ordering::Relaxed);
                        elapsed_ms
                            .fetch_add(started.elapsed().as_millis() as u64, Ordering::Relaxed);
                        result
                    };
                    if result_tx.send(result).await.is_err() {
                        break;
                    }
                }
            }));
        }
        drop(result_tx);

        // Heartbeat: progress, average duration, remaining-time estimate.
        let heartbeat = {
            let completed = Arc::clone(&completed);
            let elapsed_ms = Arc::clone(&elapsed_ms);
            let interval = self.log_interval;
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    let done = completed.load(Ordering::Relaxed);
                    if done == 0 {
                        info!("Finished 0/{total} lines.");
                        continue;
                    }
                    let average = elapsed_ms.load(Ordering::Relaxed) as f64 / done as f64 / 1000.0;
                    let estimate = average * (total - done) as f64;
                    info!(
                        "Finished {done}/{total} lines. Average execution time: {average:.2}s. \
                         Estimated time for incomplete lines: {estimate:.2}s."
                    );
                }
            })
        };

        let mut results = Vec::with_capacity(total);
        while let Ok(result) = result_rx.recv().await {
            results.push(result);
        }
        let _ = feeder.await;
        for worker in workers {
            let _ = worker.await;
        }
        heartbeat.abort();

        results.sort_by_key(|r| r.run_info.index.unwrap_or(usize::MAX));
        info!(returned = results.len(), total, "line execution pool drained");
        results
    }
}

/// Run one line, enforcing the timeout by dropping the line's future and
/// fabricating the failed result.
async fn exec_line_with_timeout(
    executor: &FlowExecutor,
    line_number: usize,
    inputs: BTreeMap<String, Value>,
    timeout_sec: Option<u64>,
    run_id: &str,
) -> LineResult {
    let execution = executor.exec_line(inputs, Some(line_number), Some(run_id.to_string()));
    match timeout_sec {
        None => execution.await,
        Some(seconds) => {
            match tokio::time::timeout(Duration::from_secs(seconds), execution).await {
                Ok(result) => result,
                Err(_) => {
                    warn!(line = line_number, seconds, "line execution timed out");
                    timeout_line_result(executor, line_number, seconds, run_id).await
                }
            }
        }
    }
}

/// Synthetic failed `LineResult` for a timed-out line. Persisted like any
/// other terminal line record.
async fn timeout_line_result(
    executor: &FlowExecutor,
    line_number: usize,
    timeout_sec: u64,
    run_id: &str,
) -> LineResult {
    let error = EngineError::LineTimeout {
        line: line_number,
        timeout: timeout_sec,
    };
    synthetic_line_result(executor, line_number, run_id, Status::Failed, &error).await
}

/// Synthetic `Canceled` `LineResult` for a line the pool never started.
async fn canceled_line_result(
    executor: &FlowExecutor,
    line_number: usize,
    run_id: &str,
) -> LineResult {
    synthetic_line_result(
        executor,
        line_number,
        run_id,
        Status::Canceled,
        &EngineError::Canceled,
    )
    .await
}

/// Fabricate and persist a terminal line record for a line the executor
/// never completed itself.
async fn synthetic_line_result(
    executor: &FlowExecutor,
    line_number: usize,
    run_id: &str,
    status: Status,
    error: &EngineError,
) -> LineResult {
    let now = Utc::now();
    let run_info = FlowRunInfo {
        run_id: format!("{run_id}_{line_number}"),
        flow_run_id: run_id.to_string(),
        root_run_id: run_id.to_string(),
        status,
        inputs: None,
        output: None,
        error: Some(error.to_error_dict()),
        start_time: now,
        end_time: Some(now),
        index: Some(line_number),
        api_calls: None,
        variant_id: String::new(),
        name: String::new(),
        description: String::new(),
        tags: None,
        system_metrics: BTreeMap::new(),
        upload_metrics: false,
    };
    executor.run_tracker().persist_flow_run(&run_info).await;
    LineResult {
        output: BTreeMap::new(),
        aggregation_inputs: BTreeMap::new(),
        run_info,
        node_run_infos: BTreeMap::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use engine::models::{Flow, FlowInputDefinition, FlowOutputDefinition, InputAssignment, Node, ValueType};
    use engine::{DummyRunStorage, ExecutorConfig};
    use nodes::mock::MockTool;
    use nodes::ToolRegistry;
    use serde_json::json;
    use std::collections::HashMap;

    fn one_node_flow() -> Flow {
        Flow::new(
            BTreeMap::from([(
                "text".to_string(),
                FlowInputDefinition::typed(ValueType::String),
            )]),
            BTreeMap::from([(
                "echo".to_string(),
                FlowOutputDefinition {
                    value_type: None,
                    reference: InputAssignment::parse(&json!("${work.output.text}")),
                },
            )]),
            vec![Node::new("work", "test.work").with_input("text", json!("${inputs.text}"))],
        )
    }

    fn pool_with_tool(tool: MockTool, timeout_sec: Option<u64>) -> LineExecutionPool {
        let mut registry = ToolRegistry::new();
        registry.register("test.work", Arc::new(tool));
        let executor = FlowExecutor::create(
            one_node_flow(),
            &registry,
            &HashMap::new(),
            Arc::new(DummyRunStorage),
            None,
            ExecutorConfig::default(),
        )
        .unwrap();
        LineExecutionPool::new(Arc::new(executor), 2, timeout_sec, "bulk_run", None)
    }

    fn bulk_inputs(count: usize) -> Vec<(usize, BTreeMap<String, Value>)> {
        (0..count)
            .map(|i| {
                (
                    i,
                    BTreeMap::from([("text".to_string(), json!(format!("t{i}")))]),
                )
            })
            .collect()
    }

    #[tokio::test]
    async fn results_come_back_ordered_by_line_number() {
        let pool = pool_with_tool(MockTool::echoing("test.work"), None);
        let results = pool.run(bulk_inputs(4)).await;
        assert_eq!(results.len(), 4);
        for (i, result) in results.iter().enumerate() {
            assert_eq!(result.run_info.index, Some(i));
            assert_eq!(result.run_info.status, Status::Completed);
            assert_eq!(result.output["echo"], json!(format!("t{i}")));
            assert_eq!(result.run_info.run_id, format!("bulk_run_{i}"));
        }
    }

    #[tokio::test]
    async fn timed_out_lines_fail_without_aborting_the_batch() {
        let pool = pool_with_tool(
            MockTool::sleeping("test.work", Duration::from_secs(5), json!({"text": "late"})),
            Some(1),
        );
        let results = pool.run(bulk_inputs(3)).await;
        assert_eq!(results.len(), 3);
        for (i, result) in results.iter().enumerate() {
            assert_eq!(result.run_info.status, Status::Failed);
            let error = result.run_info.error.as_ref().unwrap();
            assert_eq!(error["code"], "UserError");
            assert_eq!(
                error["message"],
                json!(format!("Line {i} execution timeout for exceeding 1 seconds"))
            );
        }
    }

    #[tokio::test]
    async fn failing_lines_are_isolated() {
        let pool = pool_with_tool(MockTool::failing("test.work", "boom"), None);
        let results = pool.run(bulk_inputs(2)).await;
        assert_eq!(results.len(), 2);
        for result in &results {
            assert_eq!(result.run_info.status, Status::Failed);
        }
    }

    fn pool_for_cancel(
        sleep: Duration,
        cancel: watch::Receiver<bool>,
    ) -> LineExecutionPool {
        let mut registry = ToolRegistry::new();
        registry.register(
            "test.work",
            Arc::new(MockTool::sleeping("test.work", sleep, json!({"text": "done"}))),
        );
        let executor = FlowExecutor::create(
            one_node_flow(),
            &registry,
            &HashMap::new(),
            Arc::new(DummyRunStorage),
            None,
            ExecutorConfig::default(),
        )
        .unwrap();
        LineExecutionPool::new(Arc::new(executor), 1, None, "bulk_run", Some(cancel))
    }

    #[tokio::test]
    async fn cancellation_before_start_marks_every_line_canceled() {
        let (tx, rx) = watch::channel(false);
        let pool = pool_for_cancel(Duration::from_millis(200), rx);

        tx.send(true).unwrap();
        let results = pool.run(bulk_inputs(8)).await;
        // Nothing executed, but every submitted line is accounted for.
        assert_eq!(results.len(), 8);
        for (i, result) in results.iter().enumerate() {
            assert_eq!(result.run_info.index, Some(i));
            assert_eq!(result.run_info.status, Status::Canceled);
            assert_eq!(
                result.run_info.error.as_ref().unwrap()["message"],
                json!("the flow run is canceled")
            );
        }
    }

    #[tokio::test]
    async fn cancellation_mid_batch_drains_in_flight_and_cancels_the_rest() {
        let (tx, rx) = watch::channel(false);
        let pool = pool_for_cancel(Duration::from_millis(200), rx);

        // Cancel while line 0 is executing on the single worker.
        let canceler = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let _ = tx.send(true);
        });
        let results = pool.run(bulk_inputs(4)).await;
        canceler.await.unwrap();

        // Every line has exactly one result, in order.
        assert_eq!(results.len(), 4);
        for (i, result) in results.iter().enumerate() {
            assert_eq!(result.run_info.index, Some(i));
        }
        // The in-flight line finished normally; the rest were canceled
        // instead of silently dropped.
        assert_eq!(results[0].run_info.status, Status::Completed);
        assert_eq!(results[0].output["echo"], json!("done"));
        for result in &results[1..] {
            assert_eq!(result.run_info.status, Status::Canceled);
        }
    }
}
