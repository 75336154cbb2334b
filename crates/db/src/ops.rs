//! Run operations — the entity-level CRUD surface over the repository.

use chrono::{DateTime, Utc};
use tracing::warn;

use crate::entity::{validate_run_name, Run};
use crate::error::DbError;
use crate::pool::DbPool;
use crate::repository::runs;

pub use crate::repository::runs::ListViewType;

#[derive(Clone)]
pub struct RunOperations {
    pool: DbPool,
}

impl RunOperations {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    /// Register a run. Names are unique: a duplicate fails with
    /// `RunExists` before anything is written.
    pub async fn create(&self, run: &Run) -> Result<(), DbError> {
        validate_run_name(&run.name)?;
        runs::create_run(&self.pool, &run.to_row()).await
    }

    pub async fn get(&self, name: &str) -> Result<Run, DbError> {
        Run::from_row(runs::get_run(&self.pool, name).await?)
    }

    /// List runs newest-first. A malformed record never fails the listing;
    /// it is skipped with a warning.
    pub async fn list(&self, max_results: usize, view: ListViewType) -> Result<Vec<Run>, DbError> {
        let rows = runs::list_runs(&self.pool, max_results, view).await?;
        let mut result = Vec::with_capacity(rows.len());
        for row in rows {
            let name = row.name.clone();
            match Run::from_row(row) {
                Ok(run) => result.push(run),
                Err(e) => warn!(run = %name, error = %e, "skipping malformed run record"),
            }
        }
        Ok(result)
    }

    /// Patch display name / description / tags / status on an existing run.
    pub async fn update(
        &self,
        name: &str,
        display_name: Option<&str>,
        description: Option<&str>,
        tags: Option<&std::collections::BTreeMap<String, String>>,
        status: Option<&str>,
    ) -> Result<Run, DbError> {
        let tags_text = match tags {
            Some(tags) => Some(serde_json::to_string(tags).unwrap_or_default()),
            None => None,
        };
        runs::update_run(
            &self.pool,
            name,
            display_name,
            description,
            tags_text.as_deref(),
            status,
            None,
            None,
            None,
        )
        .await?;
        self.get(name).await
    }

    /// Record lifecycle timestamps and final properties for a run.
    pub async fn update_lifecycle(
        &self,
        name: &str,
        status: &str,
        start_time: Option<DateTime<Utc>>,
        end_time: Option<DateTime<Utc>>,
        properties: Option<&std::collections::BTreeMap<String, serde_json::Value>>,
    ) -> Result<(), DbError> {
        let properties_text = match properties {
            Some(properties) => Some(serde_json::to_string(properties).unwrap_or_default()),
            None => None,
        };
        runs::update_run(
            &self.pool,
            name,
            None,
            None,
            None,
            Some(status),
            start_time,
            end_time,
            properties_text.as_deref(),
        )
        .await
    }

    pub async fn archive(&self, name: &str) -> Result<Run, DbError> {
        runs::set_archived(&self.pool, name, true).await?;
        self.get(name).await
    }

    pub async fn restore(&self, name: &str) -> Result<Run, DbError> {
        runs::set_archived(&self.pool, name, false).await?;
        self.get(name).await
    }
}
