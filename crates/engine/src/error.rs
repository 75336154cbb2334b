//! Engine-level error types (validation + execution).
//!
//! Every error classifies itself as a `UserError` (attributable to the flow
//! author or their tools) or a `SystemError` (an engine invariant violation).
//! The classification and message are what get stored on run infos as the
//! structured error dict.

use serde_json::{json, Value};
use thiserror::Error;

/// Coarse error classification, stored as `error.code` on run records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    UserError,
    SystemError,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UserError => write!(f, "UserError"),
            Self::SystemError => write!(f, "SystemError"),
        }
    }
}

/// Errors produced by the flow engine.
#[derive(Debug, Error)]
pub enum EngineError {
    // ------ Flow validation ------

    /// Two or more nodes share the same name.
    #[error("duplicate node name: '{0}'")]
    DuplicateNodeName(String),

    /// A node input or activate condition references a node that doesn't exist.
    #[error("node '{node}' references unknown node '{reference}'")]
    NodeReferenceNotFound { node: String, reference: String },

    /// An illegal reference between nodes (aggregation rules).
    #[error("node '{node}' has an invalid reference to '{reference}': {message}")]
    InvalidNodeReference {
        node: String,
        reference: String,
        message: String,
    },

    /// The reference graph contains a cycle.
    #[error("flow graph contains a cycle")]
    NodeCircularDependency,

    /// A flow output references a node or flow input that doesn't exist.
    #[error("output '{output}' references unknown source '{reference}'")]
    OutputReferenceNotFound { output: String, reference: String },

    /// The flow definition document could not be parsed.
    #[error("failed to parse flow definition: {0}")]
    FlowParse(String),

    // ------ Input validation ------

    /// A required flow input was not provided and has no default.
    #[error("flow input '{0}' was not provided and has no default value")]
    InputNotFound(String),

    /// A provided input value does not match the declared type.
    #[error("flow input '{input}' of declared type '{expected}' received an incompatible value: {actual}")]
    InputTypeError {
        input: String,
        expected: String,
        actual: String,
    },

    /// A referenced node is missing from the flow (single-node test path).
    #[error("node '{0}' not found in flow")]
    NodeNotFound(String),

    /// A reference property walked off the produced output.
    #[error("node '{node}' output has no property '{property}'")]
    OutputPropertyNotFound { node: String, property: String },

    // ------ Resolution ------

    /// A connection required by a node is missing from the store.
    #[error("connection '{name}' required by node '{node}' was not found")]
    ConnectionNotFound { node: String, name: String },

    /// Tool load/bind failed for a node. Classification follows the inner
    /// error: resolution problems caused by the flow author are user errors.
    #[error("tool load failed in '{node}': {message}")]
    ResolveTool {
        node: String,
        tool: String,
        message: String,
        user_error: bool,
    },

    // ------ Execution ------

    /// The tool body raised; attributed to user code.
    #[error("execution failure in '{node}': {message}")]
    ToolExecution {
        node: String,
        module: Option<String>,
        message: String,
    },

    /// A line exceeded its configured timeout.
    #[error("Line {line} execution timeout for exceeding {timeout} seconds")]
    LineTimeout { line: usize, timeout: u64 },

    /// The run was canceled before this work completed.
    #[error("the flow run is canceled")]
    Canceled,

    /// The scheduler found no runnable node while the flow was incomplete.
    #[error("no nodes are ready for execution, but the flow is not completed")]
    NoNodeExecuted,

    /// An aggregation node received inputs that are not aligned lists.
    #[error("invalid aggregation input '{name}': {message}")]
    InvalidAggregationInput { name: String, message: String },

    /// Catch-all for engine invariant violations.
    #[error("unexpected error: {0}")]
    Unexpected(String),
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NoNodeExecuted
            | Self::InvalidAggregationInput { .. }
            | Self::Unexpected(_) => ErrorKind::SystemError,
            Self::ResolveTool { user_error, .. } => {
                if *user_error {
                    ErrorKind::UserError
                } else {
                    ErrorKind::SystemError
                }
            }
            _ => ErrorKind::UserError,
        }
    }

    /// The structured form stored on run records and `exception.json`.
    pub fn to_error_dict(&self) -> Value {
        json!({
            "code": self.kind().to_string(),
            "message": self.to_string(),
        })
    }
}
