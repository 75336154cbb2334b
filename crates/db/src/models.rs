//! Row structs that map 1-to-1 onto database tables.
//!
//! These are persistence models; the domain `Run` entity lives in
//! `entity.rs` and converts to/from these rows.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

// ---------------------------------------------------------------------------
// runs
// ---------------------------------------------------------------------------

/// A persisted run index row. `tags` and `properties` are JSON text.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct RunRow {
    pub name: String,
    pub display_name: Option<String>,
    pub description: Option<String>,
    pub status: String,
    pub created_on: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub tags: Option<String>,
    pub properties: Option<String>,
    pub archived: bool,
}

// ---------------------------------------------------------------------------
// cache_records
// ---------------------------------------------------------------------------

/// A persisted cache entry. `result` is JSON text.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct CacheRow {
    pub hash_id: String,
    pub cache_string: String,
    pub run_id: String,
    pub flow_run_id: String,
    pub result: Option<String>,
    pub created_on: DateTime<Utc>,
}
