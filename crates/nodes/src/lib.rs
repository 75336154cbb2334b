//! `nodes` crate — the `Tool` trait, tool registry, and connection store.
//!
//! Every tool — built-in and user-provided alike — implements [`Tool`].
//! The engine crate dispatches node execution through this trait object and
//! never knows a concrete tool type.

pub mod builtin;
pub mod connections;
pub mod error;
pub mod mock;
pub mod registry;
pub mod traits;
pub mod value;

pub use connections::{Connection, ConnectionError, ConnectionProvider, FileConnectionProvider};
pub use error::ToolError;
pub use registry::ToolRegistry;
pub use traits::{Tool, ToolContext, ToolKind, ToolParam, ToolSignature};
pub use value::{ToolValue, ValueStream};
