//! Flow graph validation and the pure DAG manager.
//!
//! `validate_flow` runs before execution or persistence; `DagManager`
//! tracks per-node state (pending → ready | bypassed → completed) for one
//! line. The manager does no I/O and holds no concurrency primitives — it
//! is only ever touched from the scheduler's own task.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use serde_json::Value;
use tracing::warn;

use nodes::ToolSignature;

use crate::error::EngineError;
use crate::models::{walk_property, Flow, InputAssignment, Node};

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate the flow's reference graph.
///
/// Rules enforced:
/// 1. Node names must be unique within the flow.
/// 2. Every reference must point at an existing node or declared flow input.
/// 3. `${node.inputs.*}` references are only legal in aggregation nodes.
/// 4. Non-aggregation nodes may not reference aggregation nodes.
/// 5. The reference graph must be acyclic.
/// 6. Output references must resolve.
pub fn validate_flow(flow: &Flow) -> Result<(), EngineError> {
    let mut seen: HashSet<&str> = HashSet::new();
    for node in &flow.nodes {
        if !seen.insert(node.name.as_str()) {
            return Err(EngineError::DuplicateNodeName(node.name.clone()));
        }
    }

    let by_name: HashMap<&str, &Node> = flow.nodes.iter().map(|n| (n.name.as_str(), n)).collect();

    for node in &flow.nodes {
        for assignment in node.all_assignments() {
            match assignment {
                InputAssignment::FlowInput { name } => {
                    if !flow.inputs.contains_key(name) {
                        return Err(EngineError::NodeReferenceNotFound {
                            node: node.name.clone(),
                            reference: format!("inputs.{name}"),
                        });
                    }
                }
                InputAssignment::NodeReference {
                    node: target,
                    section,
                    ..
                } => {
                    let Some(referenced) = by_name.get(target.as_str()) else {
                        return Err(EngineError::NodeReferenceNotFound {
                            node: node.name.clone(),
                            reference: target.clone(),
                        });
                    };
                    if section == "inputs" && !node.aggregation {
                        return Err(EngineError::InvalidNodeReference {
                            node: node.name.clone(),
                            reference: target.clone(),
                            message: "referencing another node's inputs is only allowed in aggregation nodes".into(),
                        });
                    }
                    if referenced.aggregation && !node.aggregation {
                        return Err(EngineError::InvalidNodeReference {
                            node: node.name.clone(),
                            reference: target.clone(),
                            message: "non-aggregation nodes cannot reference aggregation nodes".into(),
                        });
                    }
                }
                InputAssignment::Literal(_) => {}
            }
        }
    }

    for (output, definition) in &flow.outputs {
        match &definition.reference {
            InputAssignment::NodeReference { node, .. } if !by_name.contains_key(node.as_str()) => {
                return Err(EngineError::OutputReferenceNotFound {
                    output: output.clone(),
                    reference: node.clone(),
                });
            }
            InputAssignment::FlowInput { name } if !flow.inputs.contains_key(name) => {
                return Err(EngineError::OutputReferenceNotFound {
                    output: output.clone(),
                    reference: format!("inputs.{name}"),
                });
            }
            _ => {}
        }
    }

    topological_order(&flow.nodes).map(|_| ())
}

/// Topological order over the reference edges (Kahn's algorithm).
/// Fails with `NodeCircularDependency` when the graph has a cycle.
pub fn topological_order(nodes: &[Node]) -> Result<Vec<String>, EngineError> {
    let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();
    let mut in_degree: HashMap<&str, usize> = HashMap::new();
    let names: HashSet<&str> = nodes.iter().map(|n| n.name.as_str()).collect();

    for node in nodes {
        adjacency.entry(node.name.as_str()).or_default();
        in_degree.entry(node.name.as_str()).or_insert(0);
    }
    for node in nodes {
        for assignment in node.all_assignments() {
            if let Some(dep) = assignment.referenced_node() {
                if names.contains(dep) && dep != node.name {
                    adjacency.entry(dep).or_default().push(node.name.as_str());
                    *in_degree.entry(node.name.as_str()).or_insert(0) += 1;
                }
            }
        }
    }

    let mut queue: VecDeque<&str> = in_degree
        .iter()
        .filter(|(_, &d)| d == 0)
        .map(|(&name, _)| name)
        .collect();
    let mut sorted: Vec<String> = Vec::with_capacity(nodes.len());

    while let Some(name) = queue.pop_front() {
        sorted.push(name.to_owned());
        if let Some(neighbours) = adjacency.get(name) {
            for &neighbour in neighbours {
                let deg = in_degree.entry(neighbour).or_insert(0);
                *deg -= 1;
                if *deg == 0 {
                    queue.push_back(neighbour);
                }
            }
        }
    }

    if sorted.len() != nodes.len() {
        return Err(EngineError::NodeCircularDependency);
    }
    Ok(sorted)
}

// ---------------------------------------------------------------------------
// DagManager
// ---------------------------------------------------------------------------

/// Per-line node state tracker.
pub struct DagManager {
    pending: BTreeMap<String, Node>,
    bypassed: HashMap<String, Node>,
    outputs: HashMap<String, Value>,
    flow_inputs: BTreeMap<String, Value>,
    total: usize,
}

impl DagManager {
    /// `nodes` must be the non-aggregation nodes of the flow; aggregation
    /// nodes are invoked separately, once per batch.
    pub fn new(nodes: Vec<Node>, flow_inputs: BTreeMap<String, Value>) -> Self {
        let total = nodes.len();
        Self {
            pending: nodes.into_iter().map(|n| (n.name.clone(), n)).collect(),
            bypassed: HashMap::new(),
            outputs: HashMap::new(),
            flow_inputs,
            total,
        }
    }

    /// Nodes whose activation fails (or whose dependencies are all
    /// bypassed) given the current state. Marks them bypassed and removes
    /// them from pending. Call repeatedly until empty: bypassing one node
    /// can make its dependents bypassable.
    pub fn pop_bypassable_nodes(&mut self) -> Vec<Node> {
        let candidates: Vec<String> = self
            .pending
            .iter()
            .filter(|(_, node)| self.is_node_ready(node) && self.is_node_bypassable(node))
            .map(|(name, _)| name.clone())
            .collect();
        let mut popped = Vec::with_capacity(candidates.len());
        for name in candidates {
            let node = self.pending.remove(&name).expect("candidate is pending");
            self.bypassed.insert(name, node.clone());
            popped.push(node);
        }
        popped
    }

    /// Nodes whose every reference dependency is terminal. Removes them
    /// from pending; the caller owns their execution from here.
    pub fn pop_ready_nodes(&mut self) -> Vec<Node> {
        let ready: Vec<String> = self
            .pending
            .iter()
            .filter(|(_, node)| self.is_node_ready(node))
            .map(|(name, _)| name.clone())
            .collect();
        ready
            .into_iter()
            .map(|name| self.pending.remove(&name).expect("ready node is pending"))
            .collect()
    }

    /// Record completed outputs; dependents become ready on the next pop.
    pub fn complete_nodes(&mut self, outputs: HashMap<String, Value>) {
        self.outputs.extend(outputs);
    }

    /// True when every node is completed or bypassed.
    pub fn completed(&self) -> bool {
        self.outputs.len() + self.bypassed.len() == self.total
    }

    pub fn bypassed_nodes(&self) -> &HashMap<String, Node> {
        &self.bypassed
    }

    pub fn completed_outputs(&self) -> &HashMap<String, Value> {
        &self.outputs
    }

    /// Resolve the node's input expressions and filter them to the
    /// parameters the tool actually accepts; accepted parameters with
    /// declared defaults are filled in when absent.
    pub fn get_node_valid_inputs(
        &self,
        node: &Node,
        signature: &ToolSignature,
    ) -> Result<BTreeMap<String, Value>, EngineError> {
        let mut resolved = BTreeMap::new();
        for (name, assignment) in &node.inputs {
            if !signature.accepts(name) {
                continue;
            }
            resolved.insert(name.clone(), self.resolve_assignment(assignment)?);
        }
        for param in &signature.params {
            if param.is_connection {
                continue;
            }
            if let Some(default) = &param.default {
                resolved
                    .entry(param.name.clone())
                    .or_insert_with(|| default.clone());
            }
        }
        Ok(resolved)
    }

    /// Resolve one assignment against the current state. References to
    /// bypassed nodes resolve to `null`.
    pub fn resolve_assignment(&self, assignment: &InputAssignment) -> Result<Value, EngineError> {
        match assignment {
            InputAssignment::Literal(v) => Ok(v.clone()),
            InputAssignment::FlowInput { name } => self
                .flow_inputs
                .get(name)
                .cloned()
                .ok_or_else(|| EngineError::InputNotFound(name.clone())),
            InputAssignment::NodeReference {
                node,
                section,
                property,
            } => {
                if section != "output" {
                    return Err(EngineError::Unexpected(format!(
                        "reference to '{node}.{section}' cannot be resolved during line execution"
                    )));
                }
                if self.bypassed.contains_key(node) {
                    return Ok(Value::Null);
                }
                let output = self.outputs.get(node).ok_or_else(|| {
                    EngineError::Unexpected(format!(
                        "node '{node}' referenced before completion"
                    ))
                })?;
                walk_property(output, property)
                    .cloned()
                    .ok_or_else(|| EngineError::OutputPropertyNotFound {
                        node: node.clone(),
                        property: property.clone(),
                    })
            }
        }
    }

    // ------ internal state predicates ------

    /// Every referenced node is terminal (completed or bypassed).
    fn is_node_ready(&self, node: &Node) -> bool {
        node.all_assignments()
            .filter_map(InputAssignment::referenced_node)
            .all(|dep| self.outputs.contains_key(dep) || self.bypassed.contains_key(dep))
    }

    /// Bypass when the activate condition fails, when the condition itself
    /// references a bypassed node, or when every input dependency is
    /// bypassed. Mixed (some-bypassed) dependencies still run, with `null`
    /// for the bypassed references.
    fn is_node_bypassable(&self, node: &Node) -> bool {
        if let Some(activate) = &node.activate {
            if let Some(dep) = activate.condition.referenced_node() {
                if self.bypassed.contains_key(dep) {
                    return true;
                }
            }
            match self.resolve_assignment(&activate.condition) {
                Ok(resolved) => {
                    if resolved != activate.condition_value {
                        return true;
                    }
                }
                Err(e) => {
                    warn!(node = %node.name, error = %e, "activate condition unresolvable, bypassing node");
                    return true;
                }
            }
        }
        let mut dependencies = node
            .inputs
            .values()
            .filter_map(InputAssignment::referenced_node)
            .peekable();
        dependencies.peek().is_some()
            && dependencies.all(|dep| self.bypassed.contains_key(dep))
    }
}
