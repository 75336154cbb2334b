//! Cache manager — deterministic fingerprints of node invocations and the
//! lookup/persist protocol around them.
//!
//! The fingerprint covers the flow id, the tool's stable identity, and a
//! canonical (sorted-key) JSON rendering of the inputs. Connection-typed
//! arguments are fingerprinted by connection *name* so secret rotation does
//! not invalidate entries and secrets never reach the cache store.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::run_info::NodeRunInfo;

// ---------------------------------------------------------------------------
// Contracts
// ---------------------------------------------------------------------------

/// Fingerprint of one prospective invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheInfo {
    pub hash_id: String,
    /// Human-readable canonicalization used as a secondary key.
    pub cache_string: String,
}

/// Outcome of a cache lookup.
#[derive(Debug, Clone, Default)]
pub struct CacheResult {
    pub hit_cache: bool,
    pub result: Option<Value>,
    pub cached_run_id: Option<String>,
    pub cached_flow_run_id: Option<String>,
}

impl CacheResult {
    pub fn miss() -> Self {
        Self::default()
    }
}

/// A persisted cache entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheRecord {
    pub hash_id: String,
    pub cache_string: String,
    pub run_id: String,
    pub flow_run_id: String,
    pub result: Option<Value>,
}

/// Key/value store behind the cache manager, indexed by `hash_id`.
#[async_trait]
pub trait CacheStorage: Send + Sync {
    async fn get(&self, hash_id: &str) -> anyhow::Result<Option<CacheRecord>>;
    async fn put(&self, record: CacheRecord) -> anyhow::Result<()>;
}

/// In-memory store for tests and single-process runs.
#[derive(Default)]
pub struct InMemoryCacheStorage {
    records: Mutex<HashMap<String, CacheRecord>>,
}

#[async_trait]
impl CacheStorage for InMemoryCacheStorage {
    async fn get(&self, hash_id: &str) -> anyhow::Result<Option<CacheRecord>> {
        Ok(self.records.lock().unwrap().get(hash_id).cloned())
    }

    async fn put(&self, record: CacheRecord) -> anyhow::Result<()> {
        self.records
            .lock()
            .unwrap()
            .insert(record.hash_id.clone(), record);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Canonical JSON
// ---------------------------------------------------------------------------

/// Render a value with deterministic key order at every nesting level.
pub fn canonical_json(value: &Value) -> String {
    fn write(value: &Value, out: &mut String) {
        match value {
            Value::Object(map) => {
                let sorted: BTreeMap<&String, &Value> = map.iter().collect();
                out.push('{');
                for (i, (k, v)) in sorted.into_iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    out.push_str(&serde_json::to_string(k).expect("string serializes"));
                    out.push(':');
                    write(v, out);
                }
                out.push('}');
            }
            Value::Array(items) => {
                out.push('[');
                for (i, v) in items.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    write(v, out);
                }
                out.push(']');
            }
            other => out.push_str(&other.to_string()),
        }
    }
    let mut out = String::new();
    write(value, &mut out);
    out
}

// ---------------------------------------------------------------------------
// CacheManager
// ---------------------------------------------------------------------------

pub struct CacheManager {
    storage: Option<Arc<dyn CacheStorage>>,
}

impl CacheManager {
    pub fn new(storage: Arc<dyn CacheStorage>) -> Self {
        Self {
            storage: Some(storage),
        }
    }

    /// A manager with no backing store: every lookup misses, nothing
    /// persists. Used when caching is globally off.
    pub fn disabled() -> Self {
        Self { storage: None }
    }

    /// Fingerprint an invocation. Returns `None` for non-deterministic
    /// tools — those can never be served from cache.
    pub fn calculate_cache_info(
        &self,
        flow_id: &str,
        tool_identity: &str,
        deterministic: bool,
        args: &BTreeMap<String, Value>,
    ) -> Option<CacheInfo> {
        if !deterministic {
            return None;
        }
        let args_value = Value::Object(args.iter().map(|(k, v)| (k.clone(), v.clone())).collect());
        let cache_string = format!(
            "{{\"flow_id\":{},\"tool\":{},\"args\":{}}}",
            serde_json::to_string(flow_id).expect("string serializes"),
            serde_json::to_string(tool_identity).expect("string serializes"),
            canonical_json(&args_value),
        );
        let mut hasher = Sha256::new();
        hasher.update(cache_string.as_bytes());
        let hash_id = format!("{:x}", hasher.finalize());
        Some(CacheInfo {
            hash_id,
            cache_string,
        })
    }

    /// Look the fingerprint up. Store failures degrade to a miss.
    pub async fn get_cache_result(&self, cache_info: &CacheInfo) -> CacheResult {
        let Some(storage) = &self.storage else {
            return CacheResult::miss();
        };
        match storage.get(&cache_info.hash_id).await {
            Ok(Some(record)) => CacheResult {
                hit_cache: true,
                result: record.result,
                cached_run_id: Some(record.run_id),
                cached_flow_run_id: Some(record.flow_run_id),
            },
            Ok(None) => CacheResult::miss(),
            Err(e) => {
                warn!(hash_id = %cache_info.hash_id, error = %e, "cache lookup failed");
                CacheResult::miss()
            }
        }
    }

    /// Record a completed node run under the fingerprint. Not a critical
    /// path: failures are logged and swallowed.
    pub async fn persist_result(&self, run_info: &NodeRunInfo, cache_info: &CacheInfo) {
        let Some(storage) = &self.storage else {
            return;
        };
        if cache_info.hash_id.is_empty() {
            return;
        }
        let record = CacheRecord {
            hash_id: cache_info.hash_id.clone(),
            cache_string: cache_info.cache_string.clone(),
            run_id: run_info.run_id.clone(),
            flow_run_id: run_info.flow_run_id.clone(),
            result: run_info.output.clone(),
        };
        if let Err(e) = storage.put(record).await {
            warn!(run_id = %run_info.run_id, error = %e, "failed to persist cache result");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run_info::Status;
    use chrono::Utc;
    use serde_json::json;

    fn args(pairs: &[(&str, Value)]) -> BTreeMap<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn fingerprint_is_independent_of_key_order() {
        let manager = CacheManager::disabled();
        let a = manager
            .calculate_cache_info(
                "flow1",
                "tool.x",
                true,
                &args(&[("a", json!(1)), ("b", json!({"y": 2, "x": 1}))]),
            )
            .unwrap();
        let b = manager
            .calculate_cache_info(
                "flow1",
                "tool.x",
                true,
                &args(&[("b", json!({"x": 1, "y": 2})), ("a", json!(1))]),
            )
            .unwrap();
        assert_eq!(a.hash_id, b.hash_id);
        assert_eq!(a.cache_string, b.cache_string);
    }

    #[test]
    fn fingerprint_varies_with_flow_tool_and_args() {
        let manager = CacheManager::disabled();
        let base = manager
            .calculate_cache_info("flow1", "tool.x", true, &args(&[("a", json!(1))]))
            .unwrap();
        for (flow, tool, a) in [
            ("flow2", "tool.x", json!(1)),
            ("flow1", "tool.y", json!(1)),
            ("flow1", "tool.x", json!(2)),
        ] {
            let other = manager
                .calculate_cache_info(flow, tool, true, &args(&[("a", a)]))
                .unwrap();
            assert_ne!(base.hash_id, other.hash_id);
        }
    }

    #[test]
    fn non_deterministic_tools_have_no_fingerprint() {
        let manager = CacheManager::disabled();
        assert!(manager
            .calculate_cache_info("flow1", "tool.rand", false, &BTreeMap::new())
            .is_none());
    }

    fn completed_run_info(output: Value) -> NodeRunInfo {
        NodeRunInfo {
            node: "n".into(),
            flow_run_id: "run1".into(),
            run_id: "run1_n_0".into(),
            parent_run_id: "run1_0".into(),
            status: Status::Completed,
            inputs: None,
            output: Some(output),
            error: None,
            start_time: Utc::now(),
            end_time: Some(Utc::now()),
            index: Some(0),
            api_calls: None,
            variant_id: String::new(),
            cached_run_id: None,
            cached_flow_run_id: None,
            system_metrics: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn hit_returns_persisted_output_and_provenance() {
        let manager = CacheManager::new(Arc::new(InMemoryCacheStorage::default()));
        let info = manager
            .calculate_cache_info("flow1", "tool.x", true, &args(&[("a", json!(1))]))
            .unwrap();

        assert!(!manager.get_cache_result(&info).await.hit_cache);

        manager
            .persist_result(&completed_run_info(json!("value")), &info)
            .await;

        let result = manager.get_cache_result(&info).await;
        assert!(result.hit_cache);
        assert_eq!(result.result, Some(json!("value")));
        assert_eq!(result.cached_run_id.as_deref(), Some("run1_n_0"));
        assert_eq!(result.cached_flow_run_id.as_deref(), Some("run1"));
    }

    #[tokio::test]
    async fn miss_does_not_alter_the_store() {
        let storage = Arc::new(InMemoryCacheStorage::default());
        let manager = CacheManager::new(storage.clone());
        let info = manager
            .calculate_cache_info("flow1", "tool.x", true, &BTreeMap::new())
            .unwrap();
        let _ = manager.get_cache_result(&info).await;
        assert!(storage.get(&info.hash_id).await.unwrap().is_none());
    }
}
