//! Flow definition model.
//!
//! These types are the source of truth for what a flow looks like in
//! memory. They deserialize from the `flow.dag.yaml` document and serialize
//! back to it (used when snapshotting the variant-resolved flow).

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::error::EngineError;

/// Flow input name injected into every line's inputs and outputs.
pub const LINE_NUMBER_KEY: &str = "line_number";

/// Flow id used when the document does not declare one.
pub const DEFAULT_FLOW_ID: &str = "default_flow_id";

// ---------------------------------------------------------------------------
// Value types
// ---------------------------------------------------------------------------

/// Declared type of a flow input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueType {
    Int,
    Double,
    Bool,
    String,
    List,
    Object,
}

impl ValueType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Int => "int",
            Self::Double => "double",
            Self::Bool => "bool",
            Self::String => "string",
            Self::List => "list",
            Self::Object => "object",
        }
    }

    /// Coerce a provided value into this type, parsing from strings where
    /// the source format (JSONL, CLI args) delivers everything as text.
    pub fn coerce(&self, value: &Value) -> Result<Value, String> {
        match self {
            Self::Int => match value {
                Value::Number(n) if n.is_i64() || n.is_u64() => Ok(value.clone()),
                Value::String(s) => s
                    .trim()
                    .parse::<i64>()
                    .map(Value::from)
                    .map_err(|e| e.to_string()),
                other => Err(format!("cannot interpret {other} as int")),
            },
            Self::Double => match value {
                Value::Number(_) => Ok(value.clone()),
                Value::String(s) => s
                    .trim()
                    .parse::<f64>()
                    .map_err(|e| e.to_string())
                    .and_then(|f| {
                        serde_json::Number::from_f64(f)
                            .map(Value::Number)
                            .ok_or_else(|| "not a finite number".to_string())
                    }),
                other => Err(format!("cannot interpret {other} as double")),
            },
            Self::Bool => match value {
                Value::Bool(_) => Ok(value.clone()),
                Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                    "true" => Ok(Value::Bool(true)),
                    "false" => Ok(Value::Bool(false)),
                    other => Err(format!("cannot interpret '{other}' as bool")),
                },
                other => Err(format!("cannot interpret {other} as bool")),
            },
            Self::String => match value {
                Value::String(_) => Ok(value.clone()),
                Value::Null => Ok(Value::Null),
                other => Ok(Value::String(other.to_string())),
            },
            Self::List => match value {
                Value::Array(_) => Ok(value.clone()),
                Value::String(s) => serde_json::from_str::<Value>(s)
                    .ok()
                    .filter(Value::is_array)
                    .ok_or_else(|| format!("cannot interpret '{s}' as list")),
                other => Err(format!("cannot interpret {other} as list")),
            },
            Self::Object => match value {
                Value::Object(_) => Ok(value.clone()),
                Value::String(s) => serde_json::from_str::<Value>(s)
                    .ok()
                    .filter(Value::is_object)
                    .ok_or_else(|| format!("cannot interpret '{s}' as object")),
                other => Err(format!("cannot interpret {other} as object")),
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Input assignments (reference expressions)
// ---------------------------------------------------------------------------

/// A node input value: a literal, a flow input reference, or a reference
/// into another node.
///
/// The textual forms are `${inputs.X}`, `${<node>.output[.path]}` and
/// `${<node>.inputs.Y}` (the last only legal in aggregation nodes). Any
/// other value is a literal and passes through untouched.
#[derive(Debug, Clone, PartialEq)]
pub enum InputAssignment {
    Literal(Value),
    FlowInput {
        name: String,
    },
    NodeReference {
        node: String,
        /// `"output"` or `"inputs"`.
        section: String,
        /// Dotted path below the section; empty for the whole section.
        property: String,
    },
}

impl InputAssignment {
    /// Parse a document value into an assignment.
    pub fn parse(value: &Value) -> Self {
        if let Value::String(s) = value {
            if let Some(reference) = Self::parse_reference(s) {
                return reference;
            }
        }
        Self::Literal(value.clone())
    }

    fn parse_reference(s: &str) -> Option<Self> {
        let body = s.strip_prefix("${")?.strip_suffix('}')?;
        let mut parts = body.splitn(2, '.');
        let head = parts.next()?;
        let rest = parts.next()?;
        if head.is_empty() || rest.is_empty() {
            return None;
        }
        if head == "inputs" {
            return Some(Self::FlowInput { name: rest.to_string() });
        }
        let mut rest_parts = rest.splitn(2, '.');
        let section = rest_parts.next()?;
        if section != "output" && section != "inputs" {
            return None;
        }
        Some(Self::NodeReference {
            node: head.to_string(),
            section: section.to_string(),
            property: rest_parts.next().unwrap_or_default().to_string(),
        })
    }

    /// The `${...}` textual form (literals serialize as themselves).
    pub fn serialize_expr(&self) -> Value {
        match self {
            Self::Literal(v) => v.clone(),
            Self::FlowInput { name } => Value::String(format!("${{inputs.{name}}}")),
            Self::NodeReference {
                node,
                section,
                property,
            } => {
                if property.is_empty() {
                    Value::String(format!("${{{node}.{section}}}"))
                } else {
                    Value::String(format!("${{{node}.{section}.{property}}}"))
                }
            }
        }
    }

    /// Name of the node this assignment depends on, if any.
    pub fn referenced_node(&self) -> Option<&str> {
        match self {
            Self::NodeReference { node, .. } => Some(node.as_str()),
            _ => None,
        }
    }
}

impl Serialize for InputAssignment {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.serialize_expr().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for InputAssignment {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Ok(Self::parse(&value))
    }
}

/// Walk a dotted `property` path into a value. Array elements are addressed
/// by decimal index.
pub fn walk_property<'a>(value: &'a Value, property: &str) -> Option<&'a Value> {
    if property.is_empty() {
        return Some(value);
    }
    let mut current = value;
    for part in property.split('.') {
        current = match current {
            Value::Object(map) => map.get(part)?,
            Value::Array(items) => items.get(part.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

// ---------------------------------------------------------------------------
// Activate conditions
// ---------------------------------------------------------------------------

/// Bypass condition: the node runs only when `when` resolves to `is`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivateCondition {
    #[serde(rename = "when")]
    pub condition: InputAssignment,
    #[serde(rename = "is")]
    pub condition_value: Value,
}

// ---------------------------------------------------------------------------
// Flow inputs / outputs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowInputDefinition {
    #[serde(rename = "type", default = "default_value_type")]
    pub value_type: ValueType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_chat_input: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_chat_history: Option<bool>,
}

fn default_value_type() -> ValueType {
    ValueType::String
}

impl FlowInputDefinition {
    pub fn typed(value_type: ValueType) -> Self {
        Self {
            value_type,
            default: None,
            is_chat_input: false,
            is_chat_history: None,
        }
    }

    pub fn with_default(mut self, default: Value) -> Self {
        self.default = Some(default);
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowOutputDefinition {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub value_type: Option<ValueType>,
    pub reference: InputAssignment,
}

// ---------------------------------------------------------------------------
// Nodes
// ---------------------------------------------------------------------------

/// Where a node's tool comes from (a code file or an installed package).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSource {
    #[serde(rename = "type", default)]
    pub source_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
}

/// A single invocation site in the flow graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub name: String,
    /// Tool id; resolved through the tool registry.
    pub tool: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<ToolSource>,
    #[serde(default)]
    pub inputs: BTreeMap<String, InputAssignment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub aggregation: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activate: Option<ActivateCondition>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub enable_cache: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub use_variants: bool,
}

impl Node {
    /// Convenience constructor, mostly for tests.
    pub fn new(name: impl Into<String>, tool: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tool: tool.into(),
            source: None,
            inputs: BTreeMap::new(),
            connection: None,
            aggregation: false,
            activate: None,
            enable_cache: false,
            use_variants: false,
        }
    }

    pub fn with_input(mut self, name: impl Into<String>, value: Value) -> Self {
        self.inputs.insert(name.into(), InputAssignment::parse(&value));
        self
    }

    pub fn aggregating(mut self) -> Self {
        self.aggregation = true;
        self
    }

    pub fn cached(mut self) -> Self {
        self.enable_cache = true;
        self
    }

    pub fn with_activate(mut self, when: Value, is: Value) -> Self {
        self.activate = Some(ActivateCondition {
            condition: InputAssignment::parse(&when),
            condition_value: is,
        });
        self
    }

    /// All assignments of this node, inputs plus the activate condition.
    pub fn all_assignments(&self) -> impl Iterator<Item = &InputAssignment> {
        self.inputs
            .values()
            .chain(self.activate.iter().map(|a| &a.condition))
    }
}

// ---------------------------------------------------------------------------
// Variants
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeVariant {
    pub node: Node,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeVariants {
    pub default_variant_id: String,
    pub variants: BTreeMap<String, NodeVariant>,
}

// ---------------------------------------------------------------------------
// Flow
// ---------------------------------------------------------------------------

/// A complete flow definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Flow {
    #[serde(default = "default_flow_id")]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub inputs: BTreeMap<String, FlowInputDefinition>,
    #[serde(default)]
    pub outputs: BTreeMap<String, FlowOutputDefinition>,
    pub nodes: Vec<Node>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub node_variants: BTreeMap<String, NodeVariants>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub environment: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub additional_includes: Vec<String>,
}

fn default_flow_id() -> String {
    DEFAULT_FLOW_ID.to_string()
}

impl Flow {
    /// Build a flow in memory, mostly for tests.
    pub fn new(
        inputs: BTreeMap<String, FlowInputDefinition>,
        outputs: BTreeMap<String, FlowOutputDefinition>,
        nodes: Vec<Node>,
    ) -> Self {
        Self {
            id: default_flow_id(),
            name: String::new(),
            inputs,
            outputs,
            nodes,
            node_variants: BTreeMap::new(),
            environment: BTreeMap::new(),
            additional_includes: Vec::new(),
        }
    }

    pub fn from_yaml(content: &str) -> Result<Self, EngineError> {
        serde_yaml::from_str(content).map_err(|e| EngineError::FlowParse(e.to_string()))
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, EngineError> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| EngineError::FlowParse(e.to_string()))?;
        Self::from_yaml(&content)
    }

    pub fn to_yaml(&self) -> Result<String, EngineError> {
        serde_yaml::to_string(self).map_err(|e| EngineError::FlowParse(e.to_string()))
    }

    pub fn node(&self, name: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.name == name)
    }

    pub fn aggregation_nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter().filter(|n| n.aggregation)
    }

    pub fn has_aggregation_node(&self) -> bool {
        self.nodes.iter().any(|n| n.aggregation)
    }

    /// Replace variant-enabled nodes with the selected (or default) variant
    /// and clear `node_variants`. Returns the applied `node → variant id`
    /// map. `selected` overrides the default for exactly one node.
    pub fn apply_variant(
        &mut self,
        selected: Option<(&str, &str)>,
    ) -> Result<BTreeMap<String, String>, EngineError> {
        if let Some((node_name, _)) = selected {
            if !self.node_variants.contains_key(node_name) {
                return Err(EngineError::NodeNotFound(node_name.to_string()));
            }
        }
        let mut applied = BTreeMap::new();
        let variants = std::mem::take(&mut self.node_variants);
        for (node_name, node_variants) in variants {
            let variant_id = match selected {
                Some((name, id)) if name == node_name => id.to_string(),
                _ => node_variants.default_variant_id.clone(),
            };
            let variant = node_variants.variants.get(&variant_id).ok_or_else(|| {
                EngineError::Unexpected(format!(
                    "variant '{variant_id}' not defined for node '{node_name}'"
                ))
            })?;
            let position = self
                .nodes
                .iter()
                .position(|n| n.name == node_name)
                .ok_or_else(|| EngineError::NodeNotFound(node_name.clone()))?;
            let mut node = variant.node.clone();
            node.name = node_name.clone();
            node.use_variants = false;
            self.nodes[position] = node;
            applied.insert(node_name, variant_id);
        }
        Ok(applied)
    }
}
