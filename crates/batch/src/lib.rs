//! `batch` crate — running a flow over many input lines.
//!
//! The batch input processor turns data files and a column mapping into an
//! ordered stream of line inputs; the line execution pool runs them through
//! a bounded worker set with per-line timeouts; the batch engine ties both
//! to the flow executor, the aggregation pass, and local storage.

pub mod engine;
pub mod error;
pub mod inputs;
pub mod pool;
pub mod result;

pub use self::engine::{batch_method, parent_run_sources, BatchEngine, BatchEngineConfig};
pub use self::error::BatchError;
pub use self::inputs::{apply_inputs_mapping, BatchInputsProcessor};
pub use self::pool::LineExecutionPool;
pub use self::result::{BatchResult, ErrorSummary, LineError};
