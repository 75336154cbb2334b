//! Built-in tools.
//!
//! Real LLM clients and renderers are external packages; these two exist so
//! flows have working entries for templated prompts and for exercising the
//! LLM invocation contract (connection binding, usage accounting) locally.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::error::ToolError;
use crate::traits::{Tool, ToolContext, ToolKind, ToolParam, ToolSignature};
use crate::value::ToolValue;

// ---------------------------------------------------------------------------
// TemplateTool
// ---------------------------------------------------------------------------

/// Renders a `{{var}}` template against the remaining arguments.
pub struct TemplateTool {
    signature: ToolSignature,
}

impl TemplateTool {
    pub fn id() -> &'static str {
        "promptflow.tools.template.render_template"
    }

    pub fn new() -> Self {
        Self {
            signature: ToolSignature::open(vec![ToolParam::new("template", "string")]),
        }
    }

    fn render(template: &str, vars: &BTreeMap<String, Value>) -> String {
        let mut rendered = template.to_string();
        for (name, value) in vars {
            let placeholder = format!("{{{{{name}}}}}");
            let replacement = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            rendered = rendered.replace(&placeholder, &replacement);
        }
        rendered
    }
}

impl Default for TemplateTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Tool for TemplateTool {
    fn identity(&self) -> &str {
        Self::id()
    }

    fn signature(&self) -> &ToolSignature {
        &self.signature
    }

    fn kind(&self) -> ToolKind {
        ToolKind::Prompt
    }

    async fn invoke(
        &self,
        mut args: BTreeMap<String, Value>,
        _ctx: &ToolContext,
    ) -> Result<ToolValue, ToolError> {
        let template = match args.remove("template") {
            Some(Value::String(s)) => s,
            Some(other) => other.to_string(),
            None => {
                return Err(ToolError::InvalidArgument {
                    name: "template".into(),
                    message: "required".into(),
                })
            }
        };
        Ok(Value::String(Self::render(&template, &args)).into())
    }
}

// ---------------------------------------------------------------------------
// EchoLlmTool
// ---------------------------------------------------------------------------

/// Stand-in for a chat-completion tool: echoes the prompt back as content
/// and reports a deterministic usage block so token accounting has data.
pub struct EchoLlmTool {
    signature: ToolSignature,
}

impl EchoLlmTool {
    pub fn id() -> &'static str {
        "promptflow.tools.llm.chat"
    }

    pub fn new() -> Self {
        Self {
            signature: ToolSignature::open(vec![
                ToolParam::connection("connection", "AzureOpenAIConnection"),
                ToolParam::new("prompt", "string"),
                ToolParam::new("deployment_name", "string").with_default(json!("gpt-35-turbo")),
            ]),
        }
    }
}

impl Default for EchoLlmTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Tool for EchoLlmTool {
    fn identity(&self) -> &str {
        Self::id()
    }

    fn signature(&self) -> &ToolSignature {
        &self.signature
    }

    fn kind(&self) -> ToolKind {
        ToolKind::Llm
    }

    async fn invoke(
        &self,
        args: BTreeMap<String, Value>,
        _ctx: &ToolContext,
    ) -> Result<ToolValue, ToolError> {
        let prompt = args
            .get("prompt")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        // Rough whitespace token count keeps usage stable across runs.
        let prompt_tokens = prompt.split_whitespace().count() as u64;
        Ok(json!({
            "content": prompt,
            "usage": {
                "prompt_tokens": prompt_tokens,
                "completion_tokens": prompt_tokens,
                "total_tokens": prompt_tokens * 2,
            },
        })
        .into())
    }
}
