//! Hierarchical call traces captured within a node execution.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use nodes::ToolKind;

/// Kind of a traced call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TraceType {
    Tool,
    Llm,
    Function,
}

impl From<ToolKind> for TraceType {
    fn from(kind: ToolKind) -> Self {
        match kind {
            ToolKind::Llm => Self::Llm,
            ToolKind::Python | ToolKind::Prompt => Self::Tool,
        }
    }
}

/// One frame of a node's call tree. Timestamps are epoch seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trace {
    pub name: String,
    #[serde(rename = "type")]
    pub trace_type: TraceType,
    #[serde(default)]
    pub inputs: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
    pub start_time: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<f64>,
    /// Set on root traces only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_name: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<Trace>,
}

impl Trace {
    pub fn new(
        name: impl Into<String>,
        trace_type: TraceType,
        inputs: BTreeMap<String, Value>,
    ) -> Self {
        Self {
            name: name.into(),
            trace_type,
            inputs,
            output: None,
            error: None,
            start_time: now_seconds(),
            end_time: None,
            node_name: None,
            children: Vec::new(),
        }
    }
}

pub(crate) fn now_seconds() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

/// Sum the OpenAI-style `usage` objects found on LLM traces in the tree.
/// Cache hits produce no traces and therefore contribute nothing.
pub fn collect_token_usage(traces: &[Trace]) -> BTreeMap<String, u64> {
    let mut totals: BTreeMap<String, u64> = BTreeMap::new();
    let mut stack: Vec<&Trace> = traces.iter().collect();
    while let Some(trace) = stack.pop() {
        if trace.trace_type == TraceType::Llm {
            if let Some(usage) = trace.output.as_ref().and_then(|o| o.get("usage")) {
                for key in ["total_tokens", "prompt_tokens", "completion_tokens"] {
                    if let Some(n) = usage.get(key).and_then(Value::as_u64) {
                        *totals.entry(key.to_string()).or_insert(0) += n;
                    }
                }
            }
        }
        stack.extend(trace.children.iter());
    }
    totals
}
