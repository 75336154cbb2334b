//! The `Tool` trait — the contract every tool must fulfil.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::error::ToolError;
use crate::value::ToolValue;

// ---------------------------------------------------------------------------
// Tool signature
// ---------------------------------------------------------------------------

/// One declared parameter of a tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolParam {
    pub name: String,
    /// Declared type hint, e.g. `"string"`, `"object"`, `"AzureOpenAIConnection"`.
    #[serde(rename = "type")]
    pub param_type: String,
    /// True when the parameter expects a connection bundle. The executor
    /// resolves these from the connection store before invocation.
    #[serde(default)]
    pub is_connection: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

impl ToolParam {
    pub fn new(name: impl Into<String>, param_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            param_type: param_type.into(),
            is_connection: false,
            default: None,
        }
    }

    pub fn connection(name: impl Into<String>, param_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            param_type: param_type.into(),
            is_connection: true,
            default: None,
        }
    }

    pub fn with_default(mut self, default: Value) -> Self {
        self.default = Some(default);
        self
    }
}

/// The callable surface of a tool: which parameters it accepts.
///
/// Inputs resolved for a node are filtered to this signature before
/// invocation; tools with `accepts_kwargs` receive everything.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolSignature {
    pub params: Vec<ToolParam>,
    #[serde(default)]
    pub accepts_kwargs: bool,
}

impl ToolSignature {
    pub fn new(params: Vec<ToolParam>) -> Self {
        Self {
            params,
            accepts_kwargs: false,
        }
    }

    pub fn open(params: Vec<ToolParam>) -> Self {
        Self {
            params,
            accepts_kwargs: true,
        }
    }

    pub fn accepts(&self, name: &str) -> bool {
        self.accepts_kwargs || self.params.iter().any(|p| p.name == name)
    }

    pub fn param(&self, name: &str) -> Option<&ToolParam> {
        self.params.iter().find(|p| p.name == name)
    }

    /// Parameters that expect a connection bundle.
    pub fn connection_params(&self) -> impl Iterator<Item = &ToolParam> {
        self.params.iter().filter(|p| p.is_connection)
    }
}

// ---------------------------------------------------------------------------
// Tool kind
// ---------------------------------------------------------------------------

/// Coarse classification of a tool, used for trace typing and token
/// accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolKind {
    Python,
    Llm,
    Prompt,
}

// ---------------------------------------------------------------------------
// Tool context
// ---------------------------------------------------------------------------

/// Per-invocation context handed to every tool.
///
/// Carries identity (node, line) and the metric sink. Metrics may only be
/// logged from aggregation nodes; other callers get a warning and the value
/// is dropped, matching the batch-level metric contract.
#[derive(Clone)]
pub struct ToolContext {
    pub node_name: String,
    pub line_number: Option<usize>,
    pub aggregation: bool,
    metrics: Arc<Mutex<BTreeMap<String, f64>>>,
}

impl ToolContext {
    pub fn new(node_name: impl Into<String>, line_number: Option<usize>, aggregation: bool) -> Self {
        Self {
            node_name: node_name.into(),
            line_number,
            aggregation,
            metrics: Arc::new(Mutex::new(BTreeMap::new())),
        }
    }

    /// Record a metric value for the current batch.
    pub fn log_metric(&self, name: impl Into<String>, value: f64) {
        if !self.aggregation {
            warn!(
                node = %self.node_name,
                "log_metric is only supported in aggregation nodes, ignoring"
            );
            return;
        }
        self.metrics.lock().unwrap().insert(name.into(), value);
    }

    /// Metrics logged through this context so far.
    pub fn metrics(&self) -> BTreeMap<String, f64> {
        self.metrics.lock().unwrap().clone()
    }
}

// ---------------------------------------------------------------------------
// Tool trait
// ---------------------------------------------------------------------------

/// The core tool trait.
///
/// A tool is a capability object: a stable identity (for cache fingerprints),
/// a signature (for input filtering and connection binding), and an async
/// body. Implementations must be cheap to share behind an `Arc`.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Stable identity, e.g. `promptflow.tools.template.render_template`.
    /// Two tools with the same identity are interchangeable for caching.
    fn identity(&self) -> &str;

    fn signature(&self) -> &ToolSignature;

    fn kind(&self) -> ToolKind {
        ToolKind::Python
    }

    /// Whether invocations are a pure function of their arguments. Tools
    /// returning false never produce cache entries.
    fn deterministic(&self) -> bool {
        true
    }

    /// Execute the tool with the resolved arguments.
    async fn invoke(
        &self,
        args: BTreeMap<String, Value>,
        ctx: &ToolContext,
    ) -> Result<ToolValue, ToolError>;
}
