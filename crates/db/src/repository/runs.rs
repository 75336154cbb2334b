//! Run index repository functions.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use crate::{models::RunRow, DbError};

/// Which runs a listing covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListViewType {
    ActiveOnly,
    ArchivedOnly,
    All,
}

/// Insert a new run row. Fails with `RunExists` on a duplicate name.
pub async fn create_run(pool: &SqlitePool, row: &RunRow) -> Result<(), DbError> {
    let existing = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM runs WHERE name = ?")
        .bind(&row.name)
        .fetch_one(pool)
        .await?;
    if existing > 0 {
        return Err(DbError::RunExists(row.name.clone()));
    }
    sqlx::query(
        r#"
        INSERT INTO runs
            (name, display_name, description, status, created_on, start_time, end_time, tags, properties, archived)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&row.name)
    .bind(&row.display_name)
    .bind(&row.description)
    .bind(&row.status)
    .bind(row.created_on)
    .bind(row.start_time)
    .bind(row.end_time)
    .bind(&row.tags)
    .bind(&row.properties)
    .bind(row.archived)
    .execute(pool)
    .await?;
    Ok(())
}

/// Fetch a single run row by name.
pub async fn get_run(pool: &SqlitePool, name: &str) -> Result<RunRow, DbError> {
    sqlx::query_as::<_, RunRow>("SELECT * FROM runs WHERE name = ?")
        .bind(name)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| DbError::RunNotFound(name.to_string()))
}

/// Return runs newest-first, filtered by archive state.
pub async fn list_runs(
    pool: &SqlitePool,
    max_results: usize,
    view: ListViewType,
) -> Result<Vec<RunRow>, DbError> {
    let filter = match view {
        ListViewType::ActiveOnly => "WHERE archived = 0",
        ListViewType::ArchivedOnly => "WHERE archived = 1",
        ListViewType::All => "",
    };
    let query = format!("SELECT * FROM runs {filter} ORDER BY created_on DESC LIMIT ?");
    let rows = sqlx::query_as::<_, RunRow>(&query)
        .bind(max_results as i64)
        .fetch_all(pool)
        .await?;
    Ok(rows)
}

/// Patch mutable fields of a run. `None` fields are left untouched.
#[allow(clippy::too_many_arguments)]
pub async fn update_run(
    pool: &SqlitePool,
    name: &str,
    display_name: Option<&str>,
    description: Option<&str>,
    tags: Option<&str>,
    status: Option<&str>,
    start_time: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,
    properties: Option<&str>,
) -> Result<(), DbError> {
    let result = sqlx::query(
        r#"
        UPDATE runs SET
            display_name = COALESCE(?, display_name),
            description  = COALESCE(?, description),
            tags         = COALESCE(?, tags),
            status       = COALESCE(?, status),
            start_time   = COALESCE(?, start_time),
            end_time     = COALESCE(?, end_time),
            properties   = COALESCE(?, properties)
        WHERE name = ?
        "#,
    )
    .bind(display_name)
    .bind(description)
    .bind(tags)
    .bind(status)
    .bind(start_time)
    .bind(end_time)
    .bind(properties)
    .bind(name)
    .execute(pool)
    .await?;
    if result.rows_affected() == 0 {
        return Err(DbError::RunNotFound(name.to_string()));
    }
    Ok(())
}

/// Set the archive flag. Archival is soft and does not touch `status`.
pub async fn set_archived(pool: &SqlitePool, name: &str, archived: bool) -> Result<(), DbError> {
    let result = sqlx::query("UPDATE runs SET archived = ? WHERE name = ?")
        .bind(archived)
        .bind(name)
        .execute(pool)
        .await?;
    if result.rows_affected() == 0 {
        return Err(DbError::RunNotFound(name.to_string()));
    }
    Ok(())
}
