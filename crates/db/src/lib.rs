//! `db` crate — the run index and cache record store.
//!
//! A pure persistence layer over an embedded SQLite database: a connection
//! pool, typed row structs, repository functions (one per operation), the
//! `Run` entity, and the process-level `Config`. No engine types, no
//! business logic.

pub mod config;
pub mod entity;
pub mod error;
pub mod models;
pub mod ops;
pub mod pool;
pub mod repository;

pub use config::Config;
pub use entity::{Run, RunStatus};
pub use error::DbError;
pub use ops::RunOperations;
pub use pool::DbPool;
