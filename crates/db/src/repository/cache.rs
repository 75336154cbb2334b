//! Cache record repository functions.

use chrono::Utc;
use sqlx::SqlitePool;

use crate::{models::CacheRow, DbError};

/// Fetch the newest record for a fingerprint, if any.
pub async fn get_newest(pool: &SqlitePool, hash_id: &str) -> Result<Option<CacheRow>, DbError> {
    let row = sqlx::query_as::<_, CacheRow>(
        "SELECT * FROM cache_records WHERE hash_id = ? ORDER BY created_on DESC LIMIT 1",
    )
    .bind(hash_id)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

/// Append a cache record. Multiple records per fingerprint are allowed;
/// readers take the newest.
pub async fn insert(
    pool: &SqlitePool,
    hash_id: &str,
    cache_string: &str,
    run_id: &str,
    flow_run_id: &str,
    result: Option<&str>,
) -> Result<(), DbError> {
    sqlx::query(
        r#"
        INSERT INTO cache_records (hash_id, cache_string, run_id, flow_run_id, result, created_on)
        VALUES (?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(hash_id)
    .bind(cache_string)
    .bind(run_id)
    .bind(flow_run_id)
    .bind(result)
    .bind(Utc::now())
    .execute(pool)
    .await?;
    Ok(())
}
