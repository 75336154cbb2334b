//! Flow executor — tool/connection resolution, input validation, and the
//! line / aggregation / single-node execution entry points.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde_json::{json, Value};
use tracing::{error, info, warn};
use uuid::Uuid;

use nodes::{Connection, Tool, ToolRegistry};

use crate::cache::{CacheManager, CacheStorage};
use crate::context::FlowExecutionContext;
use crate::dag::{validate_flow, DagManager};
use crate::error::EngineError;
use crate::models::{walk_property, Flow, InputAssignment, Node, LINE_NUMBER_KEY};
use crate::run_info::{line_run_id, node_run_id, FlowRunInfo, NodeRunInfo};
use crate::run_tracker::{RunStorage, RunTracker};
use crate::scheduler::NodeScheduler;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Tuning knobs for the executor.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Intra-line node concurrency (capped at 16 by the scheduler).
    pub node_concurrency: usize,
    /// Variant override: `(node_name, variant_id)`.
    pub variant: Option<(String, String)>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            node_concurrency: crate::scheduler::DEFAULT_CONCURRENCY_FLOW,
            variant: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Resolved tools
// ---------------------------------------------------------------------------

/// A node's tool with its connection arguments already bound.
#[derive(Clone)]
pub struct ResolvedTool {
    pub tool: Arc<dyn Tool>,
    /// Connection values (with secrets) merged under the dynamic inputs at
    /// invocation time.
    pub bound_args: BTreeMap<String, Value>,
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// Everything produced by one line execution.
#[derive(Debug, Clone)]
pub struct LineResult {
    /// Composed flow outputs, including the injected `line_number`.
    pub output: BTreeMap<String, Value>,
    /// Per-line values feeding aggregation nodes, keyed by the reference
    /// expression (e.g. `${score.output}`).
    pub aggregation_inputs: BTreeMap<String, Value>,
    pub run_info: FlowRunInfo,
    pub node_run_infos: BTreeMap<String, NodeRunInfo>,
}

impl LineResult {
    pub fn line_number(&self) -> Option<usize> {
        self.run_info.index
    }
}

/// Outcome of the aggregation pass.
#[derive(Debug, Clone, Default)]
pub struct AggregationResult {
    pub output: BTreeMap<String, Value>,
    pub metrics: BTreeMap<String, f64>,
    pub node_run_infos: BTreeMap<String, NodeRunInfo>,
}

// ---------------------------------------------------------------------------
// FlowExecutor
// ---------------------------------------------------------------------------

/// Executes a loaded flow: one instance per batch (or test), shared across
/// worker tasks.
pub struct FlowExecutor {
    flow: Flow,
    tools: HashMap<String, ResolvedTool>,
    run_tracker: Arc<RunTracker>,
    cache_manager: Arc<CacheManager>,
    node_concurrency: usize,
    applied_variants: BTreeMap<String, String>,
    variant_id: String,
}

impl FlowExecutor {
    /// Resolve variants, tools and connections up front and validate the
    /// flow. Everything that can fail before the first line fails here.
    pub fn create(
        mut flow: Flow,
        registry: &ToolRegistry,
        connections: &HashMap<String, Connection>,
        run_storage: Arc<dyn RunStorage>,
        cache_storage: Option<Arc<dyn CacheStorage>>,
        config: ExecutorConfig,
    ) -> Result<Self, EngineError> {
        let selected = config
            .variant
            .as_ref()
            .map(|(node, id)| (node.as_str(), id.as_str()));
        let applied_variants = flow.apply_variant(selected)?;
        validate_flow(&flow)?;

        let mut tools = HashMap::new();
        for node in &mut flow.nodes {
            let tool = registry.get(&node.tool).ok_or_else(|| EngineError::ResolveTool {
                node: node.name.clone(),
                tool: node.tool.clone(),
                message: format!("tool '{}' is not registered", node.tool),
                user_error: true,
            })?;
            let bound_args = Self::bind_connections(node, tool.as_ref(), connections)?;
            tools.insert(
                node.name.clone(),
                ResolvedTool {
                    tool,
                    bound_args,
                },
            );
        }

        let variant_id = config
            .variant
            .as_ref()
            .map(|(_, id)| id.clone())
            .or_else(|| applied_variants.values().next().cloned())
            .unwrap_or_default();

        Ok(Self {
            flow,
            tools,
            run_tracker: Arc::new(RunTracker::new(run_storage)),
            cache_manager: Arc::new(match cache_storage {
                Some(storage) => CacheManager::new(storage),
                None => CacheManager::disabled(),
            }),
            node_concurrency: config.node_concurrency,
            applied_variants,
            variant_id,
        })
    }

    /// Resolve the node's connection parameters against the store and strip
    /// them from the node's dynamic inputs.
    fn bind_connections(
        node: &mut Node,
        tool: &dyn Tool,
        connections: &HashMap<String, Connection>,
    ) -> Result<BTreeMap<String, Value>, EngineError> {
        let mut bound = BTreeMap::new();
        let connection_params: Vec<_> = tool.signature().connection_params().cloned().collect();
        for param in connection_params {
            let from_inputs = match node.inputs.get(&param.name) {
                Some(InputAssignment::Literal(Value::String(s))) => Some(s.clone()),
                _ => None,
            };
            let Some(name) = from_inputs.or_else(|| node.connection.clone()) else {
                return Err(EngineError::ResolveTool {
                    node: node.name.clone(),
                    tool: node.tool.clone(),
                    message: format!("no connection configured for parameter '{}'", param.name),
                    user_error: true,
                });
            };
            let connection =
                connections
                    .get(&name)
                    .ok_or_else(|| EngineError::ConnectionNotFound {
                        node: node.name.clone(),
                        name: name.clone(),
                    })?;
            bound.insert(param.name.clone(), connection.to_value(true));
            node.inputs.remove(&param.name);
        }
        Ok(bound)
    }

    pub fn flow(&self) -> &Flow {
        &self.flow
    }

    pub fn run_tracker(&self) -> Arc<RunTracker> {
        Arc::clone(&self.run_tracker)
    }

    pub fn applied_variants(&self) -> &BTreeMap<String, String> {
        &self.applied_variants
    }

    pub fn has_aggregation_nodes(&self) -> bool {
        self.flow.has_aggregation_node()
    }

    /// The variant-resolved flow document for the run snapshot.
    pub fn resolved_dag_yaml(&self) -> Result<String, EngineError> {
        self.flow.to_yaml()
    }

    /// Node → resolved tool description, written into the snapshot as
    /// `flow.tools.json`.
    pub fn tools_manifest(&self) -> Value {
        let mut code = serde_json::Map::new();
        for node in &self.flow.nodes {
            if let Some(resolved) = self.tools.get(&node.name) {
                code.insert(
                    node.name.clone(),
                    json!({
                        "tool": resolved.tool.identity(),
                        "kind": resolved.tool.kind(),
                        "signature": resolved.tool.signature(),
                    }),
                );
            }
        }
        json!({ "package": {}, "code": Value::Object(code) })
    }

    // -----------------------------------------------------------------------
    // Input validation
    // -----------------------------------------------------------------------

    /// Apply defaults and declared types. Unknown inputs warn and are
    /// dropped; missing required inputs are an error.
    pub fn validate_inputs(
        &self,
        inputs: &BTreeMap<String, Value>,
    ) -> Result<BTreeMap<String, Value>, EngineError> {
        let mut validated = BTreeMap::new();
        for (name, definition) in &self.flow.inputs {
            match inputs.get(name) {
                Some(value) if !value.is_null() => {
                    let coerced = definition.value_type.coerce(value).map_err(|message| {
                        EngineError::InputTypeError {
                            input: name.clone(),
                            expected: definition.value_type.as_str().to_string(),
                            actual: message,
                        }
                    })?;
                    validated.insert(name.clone(), coerced);
                }
                _ => match &definition.default {
                    Some(default) => {
                        validated.insert(name.clone(), default.clone());
                    }
                    None => return Err(EngineError::InputNotFound(name.clone())),
                },
            }
        }
        for name in inputs.keys() {
            if !self.flow.inputs.contains_key(name) && name != LINE_NUMBER_KEY {
                warn!(input = %name, "unknown flow input ignored");
            }
        }
        Ok(validated)
    }

    // -----------------------------------------------------------------------
    // Line execution
    // -----------------------------------------------------------------------

    /// Run one line. Never fails at the call boundary: any error lands on
    /// the returned `run_info` with `status == Failed`.
    pub async fn exec_line(
        &self,
        inputs: BTreeMap<String, Value>,
        index: Option<usize>,
        run_id: Option<String>,
    ) -> LineResult {
        let flow_run_id = run_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let line_id = line_run_id(&flow_run_id, index);
        self.run_tracker.start_flow_run(
            &line_id,
            &flow_run_id,
            &flow_run_id,
            index,
            None,
            &self.variant_id,
        );

        let executed = self
            .exec_line_inner(inputs, index, &flow_run_id, &line_id)
            .await;
        let run_info = match &executed {
            Ok((output, _)) => {
                let output_value =
                    Value::Object(output.iter().map(|(k, v)| (k.clone(), v.clone())).collect());
                self.run_tracker.end_flow_run(&line_id, Ok(Some(output_value)))
            }
            Err(e) => {
                error!(line = ?index, error = %e, "line execution failed");
                self.run_tracker.end_flow_run(&line_id, Err(e))
            }
        }
        .expect("flow run was started above");
        self.run_tracker.persist_flow_run(&run_info).await;

        let node_run_infos = self
            .run_tracker
            .node_runs_for_parent(&line_id)
            .into_iter()
            .map(|info| (info.node.clone(), info))
            .collect();

        let (output, aggregation_inputs) = executed.unwrap_or_default();
        LineResult {
            output,
            aggregation_inputs,
            run_info,
            node_run_infos,
        }
    }

    #[allow(clippy::type_complexity)]
    async fn exec_line_inner(
        &self,
        inputs: BTreeMap<String, Value>,
        index: Option<usize>,
        flow_run_id: &str,
        line_id: &str,
    ) -> Result<(BTreeMap<String, Value>, BTreeMap<String, Value>), EngineError> {
        let mut validated = self.validate_inputs(&inputs)?;
        if let Some(line) = index {
            validated.insert(LINE_NUMBER_KEY.to_string(), json!(line));
        }
        self.run_tracker.set_flow_run_inputs(line_id, validated.clone());

        let context = FlowExecutionContext::new(
            Arc::clone(&self.run_tracker),
            Arc::clone(&self.cache_manager),
            flow_run_id,
            &self.flow.id,
            index,
            &self.variant_id,
        );
        let line_nodes: Vec<Node> = self
            .flow
            .nodes
            .iter()
            .filter(|n| !n.aggregation)
            .cloned()
            .collect();
        let dag = DagManager::new(line_nodes, validated.clone());
        let scheduler = NodeScheduler::new(self.node_concurrency);
        let (outputs, _bypassed) = scheduler.execute(&self.tools, dag, &context).await?;

        let composed = self.compose_outputs(&outputs, &validated, index)?;
        let aggregation_inputs = self.collect_aggregation_inputs(&outputs, flow_run_id, index);
        Ok((composed, aggregation_inputs))
    }

    /// Walk the declared output references. References unresolved because of
    /// a bypass yield `null`; `line_number` is injected automatically.
    fn compose_outputs(
        &self,
        node_outputs: &HashMap<String, Value>,
        flow_inputs: &BTreeMap<String, Value>,
        index: Option<usize>,
    ) -> Result<BTreeMap<String, Value>, EngineError> {
        let mut composed = BTreeMap::new();
        for (name, definition) in &self.flow.outputs {
            let value = match &definition.reference {
                InputAssignment::Literal(v) => v.clone(),
                InputAssignment::FlowInput { name } => {
                    flow_inputs.get(name).cloned().unwrap_or(Value::Null)
                }
                InputAssignment::NodeReference { node, property, .. } => {
                    match node_outputs.get(node) {
                        None | Some(Value::Null) => Value::Null,
                        Some(output) => walk_property(output, property).cloned().ok_or_else(
                            || EngineError::OutputPropertyNotFound {
                                node: node.clone(),
                                property: property.clone(),
                            },
                        )?,
                    }
                }
            };
            composed.insert(name.clone(), value);
        }
        if let Some(line) = index {
            composed.insert(LINE_NUMBER_KEY.to_string(), json!(line));
        }
        Ok(composed)
    }

    /// Per-line values for every reference an aggregation node makes into
    /// line nodes, keyed by the reference expression.
    fn collect_aggregation_inputs(
        &self,
        node_outputs: &HashMap<String, Value>,
        flow_run_id: &str,
        index: Option<usize>,
    ) -> BTreeMap<String, Value> {
        let mut collected = BTreeMap::new();
        for aggregation_node in self.flow.aggregation_nodes() {
            for assignment in aggregation_node.inputs.values() {
                let InputAssignment::NodeReference {
                    node,
                    section,
                    property,
                } = assignment
                else {
                    continue;
                };
                let key = match assignment.serialize_expr() {
                    Value::String(s) => s,
                    _ => continue,
                };
                let value = if section == "output" {
                    node_outputs
                        .get(node)
                        .and_then(|output| walk_property(output, property).cloned())
                        .unwrap_or(Value::Null)
                } else {
                    // ${node.inputs.X}: read the resolved inputs recorded on
                    // the node's run info.
                    let run_id = node_run_id(flow_run_id, node, index, false);
                    self.run_tracker
                        .node_run(&run_id)
                        .and_then(|info| info.inputs)
                        .map(|inputs| {
                            Value::Object(inputs.into_iter().collect())
                        })
                        .and_then(|inputs| walk_property(&inputs, property).cloned())
                        .unwrap_or(Value::Null)
                };
                collected.insert(key, value);
            }
        }
        collected
    }

    // -----------------------------------------------------------------------
    // Aggregation
    // -----------------------------------------------------------------------

    /// Invoke the aggregation nodes once, with list-valued inputs gathered
    /// from all completed lines. A failing aggregation node is recorded and
    /// does not abort the others.
    pub async fn exec_aggregation(
        &self,
        flow_inputs_lists: &BTreeMap<String, Value>,
        aggregation_inputs: &BTreeMap<String, Value>,
        run_id: Option<String>,
    ) -> AggregationResult {
        let flow_run_id = run_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let context = FlowExecutionContext::new(
            Arc::clone(&self.run_tracker),
            Arc::clone(&self.cache_manager),
            &flow_run_id,
            &self.flow.id,
            None,
            &self.variant_id,
        );

        let mut result = AggregationResult::default();
        for node in self.flow.aggregation_nodes() {
            let Some(resolved) = self.tools.get(&node.name) else {
                continue;
            };
            let args = match Self::resolve_aggregation_args(
                node,
                resolved,
                flow_inputs_lists,
                aggregation_inputs,
            ) {
                Ok(args) => args,
                Err(e) => {
                    error!(node = %node.name, error = %e, "invalid aggregation inputs");
                    continue;
                }
            };
            match context.invoke_tool(node, resolved, args).await {
                Ok(output) => {
                    result.output.insert(node.name.clone(), output);
                }
                Err(e) => {
                    error!(node = %node.name, error = %e, "aggregation node failed");
                }
            }
            let node_run = node_run_id(&flow_run_id, &node.name, None, true);
            if let Some(info) = self.run_tracker.node_run(&node_run) {
                result.node_run_infos.insert(node.name.clone(), info);
            }
        }
        result.metrics = context.metrics();
        result
    }

    fn resolve_aggregation_args(
        node: &Node,
        resolved: &ResolvedTool,
        flow_inputs_lists: &BTreeMap<String, Value>,
        aggregation_inputs: &BTreeMap<String, Value>,
    ) -> Result<BTreeMap<String, Value>, EngineError> {
        let mut args = BTreeMap::new();
        for (name, assignment) in &node.inputs {
            if !resolved.tool.signature().accepts(name) {
                continue;
            }
            let value = match assignment {
                InputAssignment::Literal(v) => v.clone(),
                InputAssignment::FlowInput { name: input } => flow_inputs_lists
                    .get(input)
                    .cloned()
                    .unwrap_or_else(|| Value::Array(Vec::new())),
                reference @ InputAssignment::NodeReference { .. } => {
                    let key = match reference.serialize_expr() {
                        Value::String(s) => s,
                        _ => unreachable!("references serialize as strings"),
                    };
                    aggregation_inputs
                        .get(&key)
                        .cloned()
                        .unwrap_or_else(|| Value::Array(Vec::new()))
                }
            };
            if !matches!(assignment, InputAssignment::Literal(_)) && !value.is_array() {
                return Err(EngineError::InvalidAggregationInput {
                    name: name.clone(),
                    message: "aggregation inputs must be lists gathered across lines".into(),
                });
            }
            args.insert(name.clone(), value);
        }
        Ok(args)
    }

    // -----------------------------------------------------------------------
    // Single-node test path
    // -----------------------------------------------------------------------

    /// Execute one node against supplied flow inputs and dependency
    /// outputs, bypassing the scheduler entirely.
    pub async fn load_and_exec_node(
        flow: Flow,
        node_name: &str,
        flow_inputs: &BTreeMap<String, Value>,
        dependency_nodes_outputs: &BTreeMap<String, Value>,
        registry: &ToolRegistry,
        connections: &HashMap<String, Connection>,
        run_storage: Arc<dyn RunStorage>,
    ) -> Result<NodeRunInfo, EngineError> {
        let executor = Self::create(
            flow,
            registry,
            connections,
            run_storage,
            None,
            ExecutorConfig::default(),
        )?;
        let node = executor
            .flow
            .node(node_name)
            .cloned()
            .ok_or_else(|| EngineError::NodeNotFound(node_name.to_string()))?;
        let resolved = executor
            .tools
            .get(node_name)
            .expect("every node resolved at construction");

        // Merge declared defaults under the provided flow inputs.
        let mut merged = flow_inputs.clone();
        for (name, definition) in &executor.flow.inputs {
            if let Some(default) = &definition.default {
                merged.entry(name.clone()).or_insert_with(|| default.clone());
            }
        }

        let mut dag = DagManager::new(vec![node.clone()], merged);
        dag.complete_nodes(
            dependency_nodes_outputs
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        );
        let args = dag.get_node_valid_inputs(&node, resolved.tool.signature())?;

        let flow_run_id = Uuid::new_v4().to_string();
        let context = FlowExecutionContext::new(
            executor.run_tracker(),
            Arc::clone(&executor.cache_manager),
            &flow_run_id,
            &executor.flow.id,
            None,
            "",
        );
        // Ignore the invocation error here: the run info carries it.
        if let Err(e) = context.invoke_tool(&node, resolved, args).await {
            info!(node = %node_name, error = %e, "single-node execution failed");
        }
        executor
            .run_tracker
            .node_runs_for_parent(&context.parent_run_id())
            .into_iter()
            .next()
            .ok_or_else(|| EngineError::Unexpected("node run info missing after execution".into()))
    }
}
