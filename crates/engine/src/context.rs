//! Flow execution context — the per-line invocation pipeline.
//!
//! One context is shared by every node of a line. It carries the run
//! tracker, the cache manager, and the identifiers needed to mint run ids;
//! each `invoke_tool` call owns its own tracer, so nothing here is
//! thread-local or global.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use serde_json::{json, Value};
use tracing::{error, info};

use nodes::{ToolContext, ToolValue};

use crate::cache::CacheManager;
use crate::error::EngineError;
use crate::executor::ResolvedTool;
use crate::models::Node;
use crate::run_info::node_run_id;
use crate::run_tracker::RunTracker;
use crate::trace::Trace;
use crate::tracer::Tracer;

#[derive(Clone)]
pub struct FlowExecutionContext {
    pub run_tracker: Arc<RunTracker>,
    pub cache_manager: Arc<CacheManager>,
    /// The flow run id — the batch run name, or a fresh uuid for tests.
    pub run_id: String,
    pub flow_id: String,
    pub line_number: Option<usize>,
    pub variant_id: String,
    metrics: Arc<Mutex<BTreeMap<String, f64>>>,
}

impl FlowExecutionContext {
    pub fn new(
        run_tracker: Arc<RunTracker>,
        cache_manager: Arc<CacheManager>,
        run_id: impl Into<String>,
        flow_id: impl Into<String>,
        line_number: Option<usize>,
        variant_id: impl Into<String>,
    ) -> Self {
        Self {
            run_tracker,
            cache_manager,
            run_id: run_id.into(),
            flow_id: flow_id.into(),
            line_number,
            variant_id: variant_id.into(),
            metrics: Arc::new(Mutex::new(BTreeMap::new())),
        }
    }

    pub fn generate_node_run_id(&self, node: &Node) -> String {
        node_run_id(&self.run_id, &node.name, self.line_number, node.aggregation)
    }

    /// Parent of every node run: the line run when a line number exists,
    /// else the flow run itself.
    pub fn parent_run_id(&self) -> String {
        match self.line_number {
            Some(line) => format!("{}_{line}", self.run_id),
            None => self.run_id.clone(),
        }
    }

    /// Metrics logged by tools through this context so far.
    pub fn metrics(&self) -> BTreeMap<String, f64> {
        self.metrics.lock().unwrap().clone()
    }

    /// Record a bypassed node.
    pub async fn bypass_node(&self, node: &Node) {
        let run_id = self.generate_node_run_id(node);
        info!(node = %node.name, %run_id, "bypassing node");
        let info = self.run_tracker.bypass_node_run(
            &node.name,
            &self.run_id,
            &self.parent_run_id(),
            &run_id,
            self.line_number,
            &self.variant_id,
        );
        self.run_tracker.persist_node_run(&info).await;
    }

    /// Run one node: tracker start, cache probe, traced invocation,
    /// terminal record, cache persist. The record is persisted whatever
    /// the outcome.
    pub async fn invoke_tool(
        &self,
        node: &Node,
        resolved: &ResolvedTool,
        args: BTreeMap<String, Value>,
    ) -> Result<Value, EngineError> {
        let node_run_id = self.generate_node_run_id(node);
        info!(node = %node.name, run_id = %node_run_id, "executing node");
        self.run_tracker.start_node_run(
            &node.name,
            &self.run_id,
            &self.parent_run_id(),
            &node_run_id,
            if node.aggregation { None } else { self.line_number },
            &self.variant_id,
        );

        // Merge connection bindings under the dynamically resolved inputs.
        let mut full_args = resolved.bound_args.clone();
        full_args.extend(args);

        let recorded = scrub_connection_args(&full_args, resolved);
        self.run_tracker
            .set_node_inputs(&node_run_id, recorded.clone());

        // Cache probe. Aggregation nodes never participate.
        let mut cache_info = None;
        if node.enable_cache && !node.aggregation {
            cache_info = self.cache_manager.calculate_cache_info(
                &self.flow_id,
                resolved.tool.identity(),
                resolved.tool.deterministic(),
                &cache_args(&full_args, resolved),
            );
            if let Some(info) = &cache_info {
                let cache_result = self.cache_manager.get_cache_result(info).await;
                if cache_result.hit_cache {
                    let output = cache_result.result.unwrap_or(Value::Null);
                    let record = self.run_tracker.end_node_run_cache_hit(
                        &node_run_id,
                        output.clone(),
                        cache_result.cached_run_id,
                        cache_result.cached_flow_run_id,
                    );
                    if let Some(record) = record {
                        self.run_tracker.persist_node_run(&record).await;
                    }
                    info!(node = %node.name, "node completes from cache");
                    return Ok(output);
                }
            }
        }

        // Traced invocation.
        let mut tracer = Tracer::start_tracing(node_run_id.clone(), Some(node.name.clone()));
        tracer.push(Trace::new(
            resolved.tool.identity(),
            resolved.tool.kind().into(),
            recorded,
        ));
        let tool_ctx = ToolContext::new(&node.name, self.line_number, node.aggregation);
        let invoked = resolved.tool.invoke(full_args, &tool_ctx).await;
        for (name, value) in tool_ctx.metrics() {
            self.metrics.lock().unwrap().insert(name, value);
        }

        match invoked {
            Ok(tool_value) => {
                let output = materialize_with_capture(tool_value);
                tracer.pop(Some(output.clone()), None);
                let traces = tracer.end_tracing();
                let record =
                    self.run_tracker
                        .end_node_run_success(&node_run_id, output.clone(), traces);
                if let (Some(info), Some(record)) = (&cache_info, &record) {
                    self.cache_manager.persist_result(record, info).await;
                }
                if let Some(record) = record {
                    self.run_tracker.persist_node_run(&record).await;
                }
                info!(node = %node.name, "node completes");
                Ok(output)
            }
            Err(tool_error) => {
                let engine_error = EngineError::ToolExecution {
                    node: node.name.clone(),
                    module: Some(resolved.tool.identity().to_string()),
                    message: tool_error.to_string(),
                };
                error!(
                    node = %node.name,
                    line = ?self.line_number,
                    error = %engine_error,
                    "node failed"
                );
                tracer.pop(None, Some(json!({"message": tool_error.to_string()})));
                let traces = tracer.end_tracing();
                let record =
                    self.run_tracker
                        .end_node_run_error(&node_run_id, &engine_error, traces);
                if let Some(record) = record {
                    self.run_tracker.persist_node_run(&record).await;
                }
                Err(engine_error)
            }
        }
    }
}

/// Drain a lazy stream through its capture proxy; plain values pass through.
fn materialize_with_capture(value: ToolValue) -> Value {
    match value {
        ToolValue::Value(v) => v,
        ToolValue::Stream(stream) => {
            let captured = stream.captured();
            // Pull every item through the proxy so the capture buffer holds
            // the full output, then hand the captured list on.
            for _ in stream {}
            let items = captured.lock().unwrap().clone();
            Value::Array(items)
        }
    }
}

/// Replace connection-typed argument values with `{name, type}` before they
/// reach traces or run records. Secret material never leaves the tool call.
fn scrub_connection_args(
    args: &BTreeMap<String, Value>,
    resolved: &ResolvedTool,
) -> BTreeMap<String, Value> {
    let mut scrubbed = args.clone();
    for param in resolved.tool.signature().connection_params() {
        if let Some(value) = scrubbed.get_mut(&param.name) {
            let name = value.get("name").cloned().unwrap_or(Value::Null);
            let conn_type = value.get("type").cloned().unwrap_or(Value::Null);
            *value = json!({"name": name, "type": conn_type});
        }
    }
    scrubbed
}

/// Connection arguments enter the cache fingerprint as their name only.
fn cache_args(
    args: &BTreeMap<String, Value>,
    resolved: &ResolvedTool,
) -> BTreeMap<String, Value> {
    let mut keyed = args.clone();
    for param in resolved.tool.signature().connection_params() {
        if let Some(value) = keyed.get_mut(&param.name) {
            *value = value.get("name").cloned().unwrap_or(Value::Null);
        }
    }
    keyed
}
