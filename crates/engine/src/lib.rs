//! `engine` crate — flow definition model, DAG management, and the
//! single-line execution engine.
//!
//! The engine owns everything needed to take one input record through a
//! flow: the DAG manager (pure state tracking), the node scheduler
//! (concurrent dispatch), the flow executor (tool/connection resolution and
//! output composition), plus the run tracker, tracer and cache manager that
//! observe the execution. Persistence is reached only through the
//! [`RunStorage`] and [`CacheStorage`] traits.

pub mod cache;
pub mod context;
pub mod dag;
pub mod error;
pub mod executor;
pub mod models;
pub mod run_info;
pub mod run_tracker;
pub mod scheduler;
pub mod trace;
pub mod tracer;

pub use cache::{CacheInfo, CacheManager, CacheRecord, CacheResult, CacheStorage};
pub use context::FlowExecutionContext;
pub use dag::DagManager;
pub use error::{EngineError, ErrorKind};
pub use executor::{AggregationResult, ExecutorConfig, FlowExecutor, LineResult, ResolvedTool};
pub use models::{ActivateCondition, Flow, InputAssignment, Node};
pub use run_info::{FlowRunInfo, NodeRunInfo, Status};
pub use run_tracker::{DummyRunStorage, RunStorage, RunTracker};
pub use trace::{Trace, TraceType};
pub use tracer::Tracer;

#[cfg(test)]
mod executor_tests;
