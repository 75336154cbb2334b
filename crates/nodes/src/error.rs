//! Tool-level error type.

use thiserror::Error;

/// Errors returned by a tool's `invoke` method.
///
/// The engine wraps these into its own taxonomy:
/// - `Execution` becomes a `ToolExecutionError` attributed to user code.
/// - `InvalidArgument` is a validation failure surfaced before invocation.
#[derive(Debug, Error, Clone)]
pub enum ToolError {
    /// The tool body failed. The message carries whatever the tool reported.
    #[error("{0}")]
    Execution(String),

    /// An argument did not satisfy the tool's contract.
    #[error("invalid argument '{name}': {message}")]
    InvalidArgument { name: String, message: String },
}

impl ToolError {
    /// Shorthand for an execution failure.
    pub fn execution(message: impl Into<String>) -> Self {
        Self::Execution(message.into())
    }
}
