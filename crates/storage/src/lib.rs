//! `storage` crate — the durable layout of a run.
//!
//! Owns the run's output directory for the run's lifetime: snapshot,
//! per-line and per-node artifacts, inputs/outputs tables, metrics, the
//! exception record and the combined log. Writers on contended files take
//! file locks; readers reconstruct a run entirely from what is on disk.

pub mod cache_store;
pub mod error;
pub mod local;
pub mod multimedia;
pub mod records;

pub use cache_store::DbCacheStorage;
pub use error::StorageError;
pub use local::{Detail, LocalStorageOperations};
pub use records::{LineRunRecord, NodeRunRecord};
