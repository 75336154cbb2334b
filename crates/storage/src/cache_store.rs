//! Database-backed cache storage.
//!
//! Adapts the db crate's `cache_records` repository to the engine's
//! `CacheStorage` trait, so the cache survives across processes.

use async_trait::async_trait;

use db::repository::cache as cache_repo;
use db::DbPool;
use engine::{CacheRecord, CacheStorage};

pub struct DbCacheStorage {
    pool: DbPool,
}

impl DbCacheStorage {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CacheStorage for DbCacheStorage {
    async fn get(&self, hash_id: &str) -> anyhow::Result<Option<CacheRecord>> {
        let row = cache_repo::get_newest(&self.pool, hash_id).await?;
        Ok(row.map(|row| CacheRecord {
            hash_id: row.hash_id,
            cache_string: row.cache_string,
            run_id: row.run_id,
            flow_run_id: row.flow_run_id,
            result: row
                .result
                .as_deref()
                .and_then(|text| serde_json::from_str(text).ok()),
        }))
    }

    async fn put(&self, record: CacheRecord) -> anyhow::Result<()> {
        let result_text = match &record.result {
            Some(value) => Some(serde_json::to_string(value)?),
            None => None,
        };
        cache_repo::insert(
            &self.pool,
            &record.hash_id,
            &record.cache_string,
            &record.run_id,
            &record.flow_run_id,
            result_text.as_deref(),
        )
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn records_round_trip_through_the_database() {
        let pool = db::pool::create_memory_pool().await.unwrap();
        db::pool::run_migrations(&pool).await.unwrap();
        let storage = DbCacheStorage::new(pool);

        assert!(storage.get("h1").await.unwrap().is_none());

        storage
            .put(CacheRecord {
                hash_id: "h1".into(),
                cache_string: "{}".into(),
                run_id: "run1_n_0".into(),
                flow_run_id: "run1".into(),
                result: Some(json!({"answer": 42})),
            })
            .await
            .unwrap();

        let fetched = storage.get("h1").await.unwrap().unwrap();
        assert_eq!(fetched.run_id, "run1_n_0");
        assert_eq!(fetched.result, Some(json!({"answer": 42})));
    }
}
