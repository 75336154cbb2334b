//! Integration tests for the flow execution engine.
//!
//! These tests use `MockTool` and in-memory storage, so no filesystem or
//! database is required. Storage-backed paths are covered in the storage
//! crate's own tests.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use nodes::mock::MockTool;
use nodes::{Connection, Tool, ToolContext, ToolError, ToolParam, ToolRegistry, ToolSignature, ToolValue};

use crate::cache::InMemoryCacheStorage;
use crate::error::EngineError;
use crate::executor::{ExecutorConfig, FlowExecutor};
use crate::models::{Flow, FlowInputDefinition, FlowOutputDefinition, InputAssignment, Node, ValueType};
use crate::run_info::Status;
use crate::run_tracker::DummyRunStorage;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn output(reference: &str) -> FlowOutputDefinition {
    FlowOutputDefinition {
        value_type: None,
        reference: InputAssignment::parse(&json!(reference)),
    }
}

fn string_input() -> FlowInputDefinition {
    FlowInputDefinition::typed(ValueType::String)
}

/// `fetch → process → summarize`, output = `${summarize.output}`.
fn three_node_flow() -> Flow {
    Flow::new(
        BTreeMap::from([("url".to_string(), string_input())]),
        BTreeMap::from([("result".to_string(), output("${summarize.output}"))]),
        vec![
            Node::new("fetch", "test.fetch").with_input("url", json!("${inputs.url}")),
            Node::new("process", "test.process").with_input("text", json!("${fetch.output}")),
            Node::new("summarize", "test.summarize").with_input("text", json!("${process.output}")),
        ],
    )
}

fn three_node_registry() -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry.register("test.fetch", Arc::new(MockTool::returning("test.fetch", json!("page"))));
    registry.register(
        "test.process",
        Arc::new(MockTool::returning("test.process", json!("processed"))),
    );
    registry.register(
        "test.summarize",
        Arc::new(MockTool::returning("test.summarize", json!("summary"))),
    );
    registry
}

fn executor(flow: Flow, registry: &ToolRegistry) -> FlowExecutor {
    FlowExecutor::create(
        flow,
        registry,
        &HashMap::new(),
        Arc::new(DummyRunStorage),
        None,
        ExecutorConfig::default(),
    )
    .expect("flow resolves")
}

// ---------------------------------------------------------------------------
// Single-line execution
// ---------------------------------------------------------------------------

#[tokio::test]
async fn single_line_dag_produces_composed_outputs() {
    let exec = executor(three_node_flow(), &three_node_registry());
    let result = exec
        .exec_line(
            BTreeMap::from([("url".to_string(), json!("u"))]),
            Some(0),
            Some("run1".to_string()),
        )
        .await;

    assert_eq!(result.run_info.status, Status::Completed);
    assert_eq!(
        result.output,
        BTreeMap::from([
            ("result".to_string(), json!("summary")),
            ("line_number".to_string(), json!(0)),
        ])
    );
    assert_eq!(result.node_run_infos.len(), 3);
    for (name, info) in &result.node_run_infos {
        assert_eq!(info.status, Status::Completed, "{name} should complete");
        assert_eq!(info.run_id, format!("run1_{name}_0"));
        assert_eq!(info.parent_run_id, "run1_0");
        assert_eq!(info.index, Some(0));
    }
    assert_eq!(result.run_info.run_id, "run1_0");
    assert_eq!(result.run_info.flow_run_id, "run1");
}

#[tokio::test]
async fn outputs_are_identical_across_worker_counts() {
    for concurrency in [1, 4, 16] {
        let exec = FlowExecutor::create(
            three_node_flow(),
            &three_node_registry(),
            &HashMap::new(),
            Arc::new(DummyRunStorage),
            None,
            ExecutorConfig {
                node_concurrency: concurrency,
                variant: None,
            },
        )
        .unwrap();
        let result = exec
            .exec_line(BTreeMap::from([("url".to_string(), json!("u"))]), Some(0), None)
            .await;
        assert_eq!(result.run_info.status, Status::Completed);
        assert_eq!(result.output["result"], json!("summary"));
    }
}

#[tokio::test]
async fn failing_node_fails_the_line_with_user_error() {
    let mut registry = three_node_registry();
    registry.register(
        "test.process",
        Arc::new(MockTool::failing("test.process", "boom")),
    );
    let exec = executor(three_node_flow(), &registry);
    let result = exec
        .exec_line(BTreeMap::from([("url".to_string(), json!("u"))]), Some(0), None)
        .await;

    assert_eq!(result.run_info.status, Status::Failed);
    let error = result.run_info.error.as_ref().unwrap();
    assert_eq!(error["code"], "UserError");
    assert!(error["message"].as_str().unwrap().contains("process"));
    assert_eq!(
        result.node_run_infos["process"].status,
        Status::Failed,
    );
    // The downstream node never ran.
    assert!(!result.node_run_infos.contains_key("summarize"));
}

#[tokio::test]
async fn missing_required_input_fails_before_any_node_runs() {
    let exec = executor(three_node_flow(), &three_node_registry());
    let result = exec.exec_line(BTreeMap::new(), Some(0), None).await;
    assert_eq!(result.run_info.status, Status::Failed);
    assert!(result.node_run_infos.is_empty());
    assert!(result.run_info.error.as_ref().unwrap()["message"]
        .as_str()
        .unwrap()
        .contains("url"));
}

// ---------------------------------------------------------------------------
// Bypass propagation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn bypass_propagates_to_dependents_and_outputs() {
    // a → c (activate: ${a.output} is null) → d; output = ${d.output}
    let flow = Flow::new(
        BTreeMap::from([("url".to_string(), string_input())]),
        BTreeMap::from([("result".to_string(), output("${d.output}"))]),
        vec![
            Node::new("a", "test.fetch").with_input("url", json!("${inputs.url}")),
            Node::new("c", "test.process")
                .with_input("text", json!("${a.output}"))
                .with_activate(json!("${a.output}"), Value::Null),
            Node::new("d", "test.summarize").with_input("text", json!("${c.output}")),
        ],
    );
    let exec = executor(flow, &three_node_registry());
    let result = exec
        .exec_line(
            BTreeMap::from([("url".to_string(), json!("u"))]),
            Some(0),
            Some("run1".to_string()),
        )
        .await;

    assert_eq!(result.run_info.status, Status::Completed);
    assert_eq!(result.node_run_infos["a"].status, Status::Completed);
    assert_eq!(result.node_run_infos["c"].status, Status::Bypassed);
    assert_eq!(result.node_run_infos["d"].status, Status::Bypassed);
    assert!(result.node_run_infos["d"].output.is_none());
    assert_eq!(result.output["result"], Value::Null);
}

// ---------------------------------------------------------------------------
// Aggregation
// ---------------------------------------------------------------------------

/// Mean of the `scores` list; logs the result as a metric.
struct AccuracyTool {
    signature: ToolSignature,
}

impl AccuracyTool {
    fn new() -> Self {
        Self {
            signature: ToolSignature::new(vec![ToolParam::new("scores", "list")]),
        }
    }
}

#[async_trait]
impl Tool for AccuracyTool {
    fn identity(&self) -> &str {
        "test.accuracy"
    }

    fn signature(&self) -> &ToolSignature {
        &self.signature
    }

    async fn invoke(
        &self,
        args: BTreeMap<String, Value>,
        ctx: &ToolContext,
    ) -> Result<ToolValue, ToolError> {
        let scores = args
            .get("scores")
            .and_then(Value::as_array)
            .ok_or_else(|| ToolError::InvalidArgument {
                name: "scores".into(),
                message: "expected a list".into(),
            })?;
        let sum: f64 = scores.iter().filter_map(Value::as_f64).sum();
        let accuracy = if scores.is_empty() { 0.0 } else { sum / scores.len() as f64 };
        ctx.log_metric("accuracy", accuracy);
        Ok(json!({ "accuracy": accuracy }).into())
    }
}

fn aggregation_flow() -> (Flow, ToolRegistry) {
    let flow = Flow::new(
        BTreeMap::from([(
            "score_value".to_string(),
            FlowInputDefinition::typed(ValueType::Double),
        )]),
        BTreeMap::from([("score".to_string(), output("${score.output.val}"))]),
        vec![
            Node::new("score", "test.echo").with_input("val", json!("${inputs.score_value}")),
            Node::new("acc", "test.accuracy")
                .with_input("scores", json!("${score.output.val}"))
                .aggregating(),
        ],
    );
    let mut registry = ToolRegistry::new();
    registry.register("test.echo", Arc::new(MockTool::echoing("test.echo")));
    registry.register("test.accuracy", Arc::new(AccuracyTool::new()));
    (flow, registry)
}

#[tokio::test]
async fn aggregation_runs_once_over_all_lines() {
    let (flow, registry) = aggregation_flow();
    let exec = executor(flow, &registry);

    let mut gathered: Vec<Value> = Vec::new();
    for (line, score) in [(0usize, 1.0f64), (1, 0.0)] {
        let result = exec
            .exec_line(
                BTreeMap::from([("score_value".to_string(), json!(score))]),
                Some(line),
                Some("run1".to_string()),
            )
            .await;
        assert_eq!(result.run_info.status, Status::Completed);
        gathered.push(result.aggregation_inputs["${score.output.val}"].clone());
    }

    let aggregation_inputs =
        BTreeMap::from([("${score.output.val}".to_string(), Value::Array(gathered))]);
    let result = exec
        .exec_aggregation(&BTreeMap::new(), &aggregation_inputs, Some("run1".to_string()))
        .await;

    let info = &result.node_run_infos["acc"];
    assert_eq!(info.status, Status::Completed);
    assert_eq!(info.run_id, "run1_acc_reduce");
    assert_eq!(info.index, None);
    assert_eq!(
        info.inputs.as_ref().unwrap()["scores"],
        json!([1.0, 0.0])
    );
    assert_eq!(info.output, Some(json!({"accuracy": 0.5})));
    assert_eq!(result.output["acc"], json!({"accuracy": 0.5}));
    assert_eq!(result.metrics.get("accuracy"), Some(&0.5));
}

#[tokio::test]
async fn aggregation_rejects_non_list_inputs() {
    let (flow, registry) = aggregation_flow();
    let exec = executor(flow, &registry);
    let aggregation_inputs =
        BTreeMap::from([("${score.output.val}".to_string(), json!("not a list"))]);
    let result = exec
        .exec_aggregation(&BTreeMap::new(), &aggregation_inputs, None)
        .await;
    // The node is skipped entirely: no run info, no output.
    assert!(result.node_run_infos.is_empty());
    assert!(result.output.is_empty());
}

// ---------------------------------------------------------------------------
// Caching
// ---------------------------------------------------------------------------

#[tokio::test]
async fn cache_hit_reuses_prior_output_and_skips_the_tool() {
    let flow = Flow::new(
        BTreeMap::from([("prompt".to_string(), string_input())]),
        BTreeMap::from([("answer".to_string(), output("${chat.output.content}"))]),
        vec![Node::new("chat", "test.llm")
            .with_input("prompt", json!("${inputs.prompt}"))
            .cached()],
    );
    let chat = Arc::new(MockTool::with_usage("test.llm", json!("answer"), 12));
    let mut registry = ToolRegistry::new();
    registry.register("test.llm", chat.clone());

    let exec = FlowExecutor::create(
        flow,
        &registry,
        &HashMap::new(),
        Arc::new(DummyRunStorage),
        Some(Arc::new(InMemoryCacheStorage::default())),
        ExecutorConfig::default(),
    )
    .unwrap();

    let inputs = BTreeMap::from([("prompt".to_string(), json!("hello"))]);
    let first = exec
        .exec_line(inputs.clone(), Some(0), Some("run1".to_string()))
        .await;
    assert_eq!(first.run_info.status, Status::Completed);
    assert_eq!(
        first.run_info.system_metrics["total_tokens"],
        json!(12)
    );
    assert!(first.node_run_infos["chat"].cached_run_id.is_none());

    let second = exec
        .exec_line(inputs, Some(1), Some("run2".to_string()))
        .await;
    assert_eq!(second.run_info.status, Status::Completed);
    // Same output, no new tool invocation, zero token spend.
    assert_eq!(second.output["answer"], first.output["answer"]);
    assert_eq!(chat.call_count(), 1);
    assert_eq!(
        second.run_info.system_metrics["total_tokens"],
        json!(0)
    );
    let cached = &second.node_run_infos["chat"];
    assert_eq!(cached.cached_run_id.as_deref(), Some("run1_chat_0"));
    assert_eq!(cached.cached_flow_run_id.as_deref(), Some("run1"));
}

#[tokio::test]
async fn different_inputs_miss_the_cache() {
    let flow = Flow::new(
        BTreeMap::from([("prompt".to_string(), string_input())]),
        BTreeMap::new(),
        vec![Node::new("chat", "test.llm")
            .with_input("prompt", json!("${inputs.prompt}"))
            .cached()],
    );
    let chat = Arc::new(MockTool::with_usage("test.llm", json!("a"), 3));
    let mut registry = ToolRegistry::new();
    registry.register("test.llm", chat.clone());
    let exec = FlowExecutor::create(
        flow,
        &registry,
        &HashMap::new(),
        Arc::new(DummyRunStorage),
        Some(Arc::new(InMemoryCacheStorage::default())),
        ExecutorConfig::default(),
    )
    .unwrap();

    exec.exec_line(BTreeMap::from([("prompt".to_string(), json!("one"))]), Some(0), None)
        .await;
    exec.exec_line(BTreeMap::from([("prompt".to_string(), json!("two"))]), Some(1), None)
        .await;
    assert_eq!(chat.call_count(), 2);
}

// ---------------------------------------------------------------------------
// Connections and variants
// ---------------------------------------------------------------------------

#[tokio::test]
async fn connection_is_bound_and_scrubbed_from_the_record() {
    let flow = Flow::new(
        BTreeMap::from([("prompt".to_string(), string_input())]),
        BTreeMap::new(),
        vec![{
            let mut node =
                Node::new("chat", "test.llm").with_input("prompt", json!("${inputs.prompt}"));
            node.connection = Some("azure_open_ai".to_string());
            node
        }],
    );
    let chat = Arc::new(
        MockTool::echoing("test.llm").with_signature(ToolSignature::open(vec![
            ToolParam::connection("connection", "AzureOpenAIConnection"),
            ToolParam::new("prompt", "string"),
        ])),
    );
    let mut registry = ToolRegistry::new();
    registry.register("test.llm", chat.clone());
    let connections = HashMap::from([(
        "azure_open_ai".to_string(),
        Connection {
            name: "azure_open_ai".into(),
            connection_type: "AzureOpenAIConnection".into(),
            configs: BTreeMap::new(),
            secrets: BTreeMap::from([("api_key".into(), "sk-secret".into())]),
        },
    )]);

    let exec = FlowExecutor::create(
        flow,
        &registry,
        &connections,
        Arc::new(DummyRunStorage),
        None,
        ExecutorConfig::default(),
    )
    .unwrap();
    let result = exec
        .exec_line(BTreeMap::from([("prompt".to_string(), json!("hi"))]), Some(0), None)
        .await;
    assert_eq!(result.run_info.status, Status::Completed);

    // The tool saw the secret.
    let seen = &chat.calls.lock().unwrap()[0];
    assert_eq!(seen["connection"]["secrets"]["api_key"], json!("sk-secret"));

    // The record did not.
    let recorded = result.node_run_infos["chat"].inputs.as_ref().unwrap();
    assert_eq!(recorded["connection"]["name"], json!("azure_open_ai"));
    assert!(recorded["connection"].get("secrets").is_none());
}

#[tokio::test]
async fn missing_connection_fails_at_construction() {
    let flow = Flow::new(
        BTreeMap::new(),
        BTreeMap::new(),
        vec![{
            let mut node = Node::new("chat", "test.llm");
            node.connection = Some("ghost".to_string());
            node
        }],
    );
    let mut registry = ToolRegistry::new();
    registry.register(
        "test.llm",
        Arc::new(MockTool::echoing("test.llm").with_signature(ToolSignature::open(vec![
            ToolParam::connection("connection", "CustomConnection"),
        ]))),
    );
    let err = FlowExecutor::create(
        flow,
        &registry,
        &HashMap::new(),
        Arc::new(DummyRunStorage),
        None,
        ExecutorConfig::default(),
    )
    .err()
    .expect("construction must fail");
    assert!(matches!(
        err,
        EngineError::ConnectionNotFound { name, .. } if name == "ghost"
    ));
}

#[tokio::test]
async fn variant_override_selects_the_requested_tool() {
    let yaml = r#"
inputs:
  q:
    type: string
outputs:
  out:
    reference: ${answer.output}
nodes:
- name: answer
  tool: placeholder
  use_variants: true
node_variants:
  answer:
    default_variant_id: variant_0
    variants:
      variant_0:
        node:
          name: answer
          tool: test.a
          inputs:
            q: ${inputs.q}
      variant_1:
        node:
          name: answer
          tool: test.b
          inputs:
            q: ${inputs.q}
"#;
    let mut registry = ToolRegistry::new();
    registry.register("test.a", Arc::new(MockTool::returning("test.a", json!("from-a"))));
    registry.register("test.b", Arc::new(MockTool::returning("test.b", json!("from-b"))));

    let exec = FlowExecutor::create(
        Flow::from_yaml(yaml).unwrap(),
        &registry,
        &HashMap::new(),
        Arc::new(DummyRunStorage),
        None,
        ExecutorConfig {
            node_concurrency: 16,
            variant: Some(("answer".to_string(), "variant_1".to_string())),
        },
    )
    .unwrap();
    assert_eq!(exec.applied_variants()["answer"], "variant_1");

    let result = exec
        .exec_line(BTreeMap::from([("q".to_string(), json!("x"))]), Some(0), None)
        .await;
    assert_eq!(result.output["out"], json!("from-b"));
    assert_eq!(result.node_run_infos["answer"].variant_id, "variant_1");
}

// ---------------------------------------------------------------------------
// Single-node test path
// ---------------------------------------------------------------------------

#[tokio::test]
async fn load_and_exec_node_runs_without_the_scheduler() {
    let flow = three_node_flow();
    let info = FlowExecutor::load_and_exec_node(
        flow,
        "process",
        &BTreeMap::new(),
        &BTreeMap::from([("fetch".to_string(), json!("prefetched"))]),
        &three_node_registry(),
        &HashMap::new(),
        Arc::new(DummyRunStorage),
    )
    .await
    .unwrap();

    assert_eq!(info.status, Status::Completed);
    assert_eq!(info.node, "process");
    assert_eq!(info.inputs.as_ref().unwrap()["text"], json!("prefetched"));
    assert_eq!(info.output, Some(json!("processed")));
    // Single-node test run ids carry a uuid, not a line number.
    assert!(info.index.is_none());
}

// ---------------------------------------------------------------------------
// Streaming outputs
// ---------------------------------------------------------------------------

#[tokio::test]
async fn stream_outputs_are_captured_and_materialized() {
    let flow = Flow::new(
        BTreeMap::new(),
        BTreeMap::from([("items".to_string(), output("${gen.output}"))]),
        vec![Node::new("gen", "test.stream")],
    );
    let mut registry = ToolRegistry::new();
    registry.register(
        "test.stream",
        Arc::new(MockTool::streaming(
            "test.stream",
            vec![json!("a"), json!("b"), json!("c")],
        )),
    );
    let exec = executor(flow, &registry);
    let result = exec.exec_line(BTreeMap::new(), Some(0), None).await;

    assert_eq!(result.output["items"], json!(["a", "b", "c"]));
    let info = &result.node_run_infos["gen"];
    assert_eq!(info.output, Some(json!(["a", "b", "c"])));
    // The trace saw the same materialized sequence.
    let calls = info.api_calls.as_ref().unwrap();
    assert_eq!(calls[0].output, Some(json!(["a", "b", "c"])));
}
