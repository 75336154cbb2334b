//! Batch-level error types.

use serde_json::{json, Value};
use thiserror::Error;

use engine::{EngineError, ErrorKind};

#[derive(Debug, Error)]
pub enum BatchError {
    /// The input mapping or the input data cannot produce line inputs.
    /// The message is the full user-facing text.
    #[error("{0}")]
    InputMapping(String),

    /// Engine invariant violations at the batch level.
    #[error("{0}")]
    Unexpected(String),

    /// Summary error when one or more lines failed. `message` carries the
    /// first observed line error.
    #[error("{message}")]
    BulkRun {
        message: String,
        failed_lines: usize,
        total_lines: usize,
        errors: Vec<Value>,
    },

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Storage(#[from] storage::StorageError),
}

impl BatchError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InputMapping(_) | Self::BulkRun { .. } => ErrorKind::UserError,
            Self::Unexpected(_) => ErrorKind::SystemError,
            Self::Engine(e) => e.kind(),
            Self::Storage(_) => ErrorKind::SystemError,
        }
    }

    /// The structured form stored in `exception.json`.
    pub fn to_error_dict(&self) -> Value {
        match self {
            Self::BulkRun {
                message,
                failed_lines,
                total_lines,
                errors,
            } => json!({
                "code": self.kind().to_string(),
                "message": message,
                "failed_lines": failed_lines,
                "total_lines": total_lines,
                "additional_info": { "errors": errors },
            }),
            other => json!({
                "code": other.kind().to_string(),
                "message": other.to_string(),
            }),
        }
    }
}
