//! Connection store — named credential/config bundles consumed by tools.
//!
//! Connections are resolved once, at executor construction, and the store is
//! read-only for the duration of a run. The file-backed provider reads the
//! JSON document pointed to by `PROMPTFLOW_CONNECTIONS`.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Environment variable naming the connection store file.
pub const CONNECTIONS_ENV_VAR: &str = "PROMPTFLOW_CONNECTIONS";

/// Placeholder written wherever a secret would otherwise be serialized.
pub const SCRUBBED_SECRET: &str = "******";

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("connection '{0}' not found")]
    NotFound(String),

    #[error("failed to read connection store '{path}': {message}")]
    Store { path: String, message: String },
}

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

/// A named bundle of non-secret configs and secret values.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Connection {
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type")]
    pub connection_type: String,
    #[serde(default)]
    pub configs: BTreeMap<String, String>,
    #[serde(default)]
    pub secrets: BTreeMap<String, String>,
}

impl Connection {
    /// A copy with every secret value replaced by [`SCRUBBED_SECRET`].
    pub fn scrubbed(&self) -> Connection {
        let mut c = self.clone();
        for v in c.secrets.values_mut() {
            *v = SCRUBBED_SECRET.to_string();
        }
        c
    }

    /// Serialize for tool consumption: `{type, configs, secrets}`.
    /// Secrets are included only when `with_secrets` is set.
    pub fn to_value(&self, with_secrets: bool) -> Value {
        let c = if with_secrets { self.clone() } else { self.scrubbed() };
        serde_json::json!({
            "name": c.name,
            "type": c.connection_type,
            "configs": c.configs,
            "secrets": c.secrets,
        })
    }
}

// ---------------------------------------------------------------------------
// Providers
// ---------------------------------------------------------------------------

/// Read contract of the connection store.
pub trait ConnectionProvider: Send + Sync {
    fn get(&self, name: &str, with_secrets: bool) -> Result<Connection, ConnectionError>;

    fn names(&self) -> Vec<String>;

    /// Snapshot the whole store, with secrets, keyed by name.
    fn snapshot(&self) -> HashMap<String, Connection> {
        self.names()
            .into_iter()
            .filter_map(|n| self.get(&n, true).ok())
            .map(|c| (c.name.clone(), c))
            .collect()
    }
}

/// Provider over an in-memory map. Also the snapshot form every executor
/// works against.
#[derive(Debug, Default, Clone)]
pub struct MemoryConnectionProvider {
    connections: HashMap<String, Connection>,
}

impl MemoryConnectionProvider {
    pub fn new(connections: HashMap<String, Connection>) -> Self {
        Self { connections }
    }
}

impl ConnectionProvider for MemoryConnectionProvider {
    fn get(&self, name: &str, with_secrets: bool) -> Result<Connection, ConnectionError> {
        let conn = self
            .connections
            .get(name)
            .ok_or_else(|| ConnectionError::NotFound(name.to_string()))?;
        Ok(if with_secrets { conn.clone() } else { conn.scrubbed() })
    }

    fn names(&self) -> Vec<String> {
        self.connections.keys().cloned().collect()
    }
}

/// Provider backed by a JSON file of the shape
/// `{"<name>": {"type": ..., "configs": {...}, "secrets": {...}}, ...}`.
#[derive(Debug, Default)]
pub struct FileConnectionProvider {
    connections: HashMap<String, Connection>,
}

impl FileConnectionProvider {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConnectionError> {
        let path = path.as_ref();
        let store = |message: String| ConnectionError::Store {
            path: path.display().to_string(),
            message,
        };
        let content = std::fs::read_to_string(path).map_err(|e| store(e.to_string()))?;
        let raw: HashMap<String, Connection> =
            serde_json::from_str(&content).map_err(|e| store(e.to_string()))?;
        let connections = raw
            .into_iter()
            .map(|(name, mut conn)| {
                conn.name = name.clone();
                (name, conn)
            })
            .collect();
        Ok(Self { connections })
    }

    /// Load the store named by `PROMPTFLOW_CONNECTIONS`, if set.
    pub fn from_env() -> Result<Option<Self>, ConnectionError> {
        match std::env::var(CONNECTIONS_ENV_VAR) {
            Ok(path) if !path.is_empty() => Self::from_path(path).map(Some),
            _ => Ok(None),
        }
    }
}

impl ConnectionProvider for FileConnectionProvider {
    fn get(&self, name: &str, with_secrets: bool) -> Result<Connection, ConnectionError> {
        let conn = self
            .connections
            .get(name)
            .ok_or_else(|| ConnectionError::NotFound(name.to_string()))?;
        Ok(if with_secrets { conn.clone() } else { conn.scrubbed() })
    }

    fn names(&self) -> Vec<String> {
        self.connections.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn sample() -> Connection {
        Connection {
            name: "azure_open_ai".into(),
            connection_type: "AzureOpenAIConnection".into(),
            configs: BTreeMap::from([("api_base".into(), "https://example".into())]),
            secrets: BTreeMap::from([("api_key".into(), "sk-secret".into())]),
        }
    }

    #[test]
    fn scrubbed_replaces_secret_values() {
        let scrubbed = sample().scrubbed();
        assert_eq!(scrubbed.secrets.get("api_key").unwrap(), SCRUBBED_SECRET);
        assert_eq!(scrubbed.configs.get("api_base").unwrap(), "https://example");
    }

    #[test]
    fn get_without_secrets_never_leaks() {
        let provider =
            MemoryConnectionProvider::new(HashMap::from([("azure_open_ai".to_string(), sample())]));
        let conn = provider.get("azure_open_ai", false).unwrap();
        assert_eq!(conn.secrets.get("api_key").unwrap(), SCRUBBED_SECRET);

        let with = provider.get("azure_open_ai", true).unwrap();
        assert_eq!(with.secrets.get("api_key").unwrap(), "sk-secret");
    }

    #[test]
    fn missing_connection_is_an_error() {
        let provider = MemoryConnectionProvider::default();
        assert!(matches!(
            provider.get("ghost", true),
            Err(ConnectionError::NotFound(name)) if name == "ghost"
        ));
    }

    #[test]
    fn file_provider_reads_store() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"my_conn": {{"type": "CustomConnection", "configs": {{"host": "h"}}, "secrets": {{"key": "v"}}}}}}"#
        )
        .unwrap();
        let provider = FileConnectionProvider::from_path(file.path()).unwrap();
        let conn = provider.get("my_conn", true).unwrap();
        assert_eq!(conn.name, "my_conn");
        assert_eq!(conn.connection_type, "CustomConnection");
        assert_eq!(conn.secrets.get("key").unwrap(), "v");
    }
}
