//! `MockTool` — a test double for `Tool`.
//!
//! Useful in unit and integration tests where a real tool implementation is
//! either unavailable or irrelevant.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::error::ToolError;
use crate::traits::{Tool, ToolContext, ToolKind, ToolSignature};
use crate::value::{ToolValue, ValueStream};

/// Behaviour injected into `MockTool` at construction time.
pub enum MockBehaviour {
    /// Return a specific JSON value.
    ReturnValue(Value),
    /// Echo the resolved arguments back as an object.
    EchoArgs,
    /// Fail with an execution error.
    Fail(String),
    /// Sleep, then return the value. Used for timeout scenarios.
    Sleep { duration: Duration, then: Value },
    /// Return a lazy stream over the given items.
    Stream(Vec<Value>),
    /// Return `{content, usage}` like an LLM call with the given token count.
    Usage { content: Value, total_tokens: u64 },
}

/// A mock tool that records every call it receives and performs a
/// programmer-specified behaviour.
pub struct MockTool {
    identity: String,
    behaviour: MockBehaviour,
    kind: ToolKind,
    deterministic: bool,
    signature: ToolSignature,
    /// All argument maps seen by this tool (in call order).
    pub calls: Arc<Mutex<Vec<BTreeMap<String, Value>>>>,
}

impl MockTool {
    pub fn new(identity: impl Into<String>, behaviour: MockBehaviour) -> Self {
        Self {
            identity: identity.into(),
            behaviour,
            kind: ToolKind::Python,
            deterministic: true,
            signature: ToolSignature::open(vec![]),
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// A mock that always succeeds with the given value.
    pub fn returning(identity: impl Into<String>, value: Value) -> Self {
        Self::new(identity, MockBehaviour::ReturnValue(value))
    }

    /// A mock that echoes its arguments.
    pub fn echoing(identity: impl Into<String>) -> Self {
        Self::new(identity, MockBehaviour::EchoArgs)
    }

    /// A mock that always fails.
    pub fn failing(identity: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::new(identity, MockBehaviour::Fail(msg.into()))
    }

    /// A mock that sleeps before returning, to trip line timeouts.
    pub fn sleeping(identity: impl Into<String>, duration: Duration, then: Value) -> Self {
        Self::new(identity, MockBehaviour::Sleep { duration, then })
    }

    /// A mock that yields a lazy stream.
    pub fn streaming(identity: impl Into<String>, items: Vec<Value>) -> Self {
        Self::new(identity, MockBehaviour::Stream(items))
    }

    /// A mock LLM reporting the given total token usage.
    pub fn with_usage(identity: impl Into<String>, content: Value, total_tokens: u64) -> Self {
        let mut tool = Self::new(identity, MockBehaviour::Usage { content, total_tokens });
        tool.kind = ToolKind::Llm;
        tool
    }

    pub fn with_kind(mut self, kind: ToolKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_signature(mut self, signature: ToolSignature) -> Self {
        self.signature = signature;
        self
    }

    pub fn non_deterministic(mut self) -> Self {
        self.deterministic = false;
        self
    }

    /// Number of times this tool has been invoked.
    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl Tool for MockTool {
    fn identity(&self) -> &str {
        &self.identity
    }

    fn signature(&self) -> &ToolSignature {
        &self.signature
    }

    fn kind(&self) -> ToolKind {
        self.kind
    }

    fn deterministic(&self) -> bool {
        self.deterministic
    }

    async fn invoke(
        &self,
        args: BTreeMap<String, Value>,
        _ctx: &ToolContext,
    ) -> Result<ToolValue, ToolError> {
        self.calls.lock().unwrap().push(args.clone());

        match &self.behaviour {
            MockBehaviour::ReturnValue(v) => Ok(v.clone().into()),
            MockBehaviour::EchoArgs => {
                let map: serde_json::Map<String, Value> = args.into_iter().collect();
                Ok(Value::Object(map).into())
            }
            MockBehaviour::Fail(msg) => Err(ToolError::execution(msg.clone())),
            MockBehaviour::Sleep { duration, then } => {
                tokio::time::sleep(*duration).await;
                Ok(then.clone().into())
            }
            MockBehaviour::Stream(items) => Ok(ToolValue::Stream(ValueStream::from_items(
                items.clone(),
            ))),
            MockBehaviour::Usage {
                content,
                total_tokens,
            } => Ok(json!({
                "content": content,
                "usage": {
                    "prompt_tokens": total_tokens / 2,
                    "completion_tokens": total_tokens - total_tokens / 2,
                    "total_tokens": total_tokens,
                },
            })
            .into()),
        }
    }
}
