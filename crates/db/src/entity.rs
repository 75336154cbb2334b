//! The `Run` entity — metadata record of one batch run.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::config::{home_dir, Config, FLOW_DIRECTORY_MACRO};
use crate::error::DbError;
use crate::models::RunRow;

/// Macros accepted in a run's `display_name`, substituted when the run is
/// persisted.
pub const VARIANT_ID_MACRO: &str = "${variant_id}";
pub const RUN_MACRO: &str = "${run}";
pub const TIMESTAMP_MACRO: &str = "${timestamp}";

/// Variant id used in names and display names when no variant is selected.
pub const DEFAULT_VARIANT: &str = "variant_0";

/// Run status values stored on the entity. Kept as plain strings in the
/// database; these constants are the full vocabulary.
#[allow(non_snake_case)]
pub mod RunStatus {
    pub const NOT_STARTED: &str = "NotStarted";
    pub const PREPARING: &str = "Preparing";
    pub const RUNNING: &str = "Running";
    pub const COMPLETED: &str = "Completed";
    pub const FAILED: &str = "Failed";
    pub const CANCELED: &str = "Canceled";
    pub const CANCEL_REQUESTED: &str = "CancelRequested";

    pub fn is_terminated(status: &str) -> bool {
        matches!(status, COMPLETED | FAILED | CANCELED)
    }
}

/// A batch run. The name is immutable identity; everything else evolves
/// over the run's lifecycle.
#[derive(Debug, Clone)]
pub struct Run {
    pub name: String,
    /// Absolute path of the flow directory.
    pub flow: PathBuf,
    /// Input data path supplied at submission (not stored in the index).
    pub data: Option<PathBuf>,
    /// Selected variant, `node.variant_id` form.
    pub variant: Option<String>,
    /// Parent run name for evaluation runs.
    pub run: Option<String>,
    pub display_name: Option<String>,
    pub description: Option<String>,
    pub tags: BTreeMap<String, String>,
    pub properties: BTreeMap<String, Value>,
    pub status: String,
    pub created_on: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub is_archived: bool,
    /// Directory this run exclusively owns for its artifacts.
    pub output_path: PathBuf,
}

impl Run {
    /// Create a new run for the given flow directory. When `name` is
    /// `None`, one is derived from the flow folder, the variant, and a
    /// timestamp.
    pub fn new(
        flow: impl AsRef<Path>,
        name: Option<String>,
        variant: Option<String>,
        parent_run: Option<String>,
        config: &Config,
    ) -> Result<Self, DbError> {
        let flow = flow
            .as_ref()
            .canonicalize()
            .unwrap_or_else(|_| flow.as_ref().to_path_buf());
        let name = match name {
            Some(name) => {
                validate_run_name(&name)?;
                name
            }
            None => generate_run_name(&flow, variant.as_deref()),
        };
        let output_path = resolve_output_path(config, &flow, &name)?;
        Ok(Self {
            name,
            flow,
            data: None,
            variant,
            run: parent_run,
            display_name: None,
            description: None,
            tags: BTreeMap::new(),
            properties: BTreeMap::new(),
            status: RunStatus::NOT_STARTED.to_string(),
            created_on: Utc::now(),
            start_time: None,
            end_time: None,
            is_archived: false,
            output_path,
        })
    }

    /// Format the display name, substituting the supported macros:
    /// `${variant_id}`, `${run}` (the parent run name) and `${timestamp}`.
    /// A run with no display name falls back to its name.
    ///
    /// `"run-${variant_id}-${timestamp}"` becomes
    /// `"run-variant_1-202401011230"`.
    pub fn format_display_name(&self) -> String {
        let mut display_name = self
            .display_name
            .clone()
            .unwrap_or_else(|| self.name.clone());
        if let Some(parent) = &self.run {
            display_name = display_name.replace(RUN_MACRO, parent);
        }
        let timestamp = self.created_on.format("%Y%m%d%H%M").to_string();
        display_name = display_name.replace(TIMESTAMP_MACRO, &timestamp);
        let variant_id = self
            .variant
            .as_deref()
            .map(|variant| variant.rsplit('.').next().unwrap_or(variant))
            .unwrap_or(DEFAULT_VARIANT);
        display_name.replace(VARIANT_ID_MACRO, variant_id)
    }

    /// Full property map as persisted: stored properties plus the
    /// always-present flow/output paths and optional lineage fields.
    pub fn properties(&self) -> BTreeMap<String, Value> {
        let mut properties = self.properties.clone();
        properties.insert(
            "flow_path".to_string(),
            Value::String(self.flow.display().to_string()),
        );
        properties.insert(
            "output_path".to_string(),
            Value::String(self.output_path.display().to_string()),
        );
        if let Some(parent) = &self.run {
            properties.insert("run".to_string(), Value::String(parent.clone()));
        }
        if let Some(variant) = &self.variant {
            properties.insert("node_variant".to_string(), Value::String(variant.clone()));
        }
        properties
    }

    pub(crate) fn to_row(&self) -> RunRow {
        RunRow {
            name: self.name.clone(),
            display_name: Some(self.format_display_name()),
            description: self.description.clone(),
            status: self.status.clone(),
            created_on: self.created_on,
            start_time: self.start_time,
            end_time: self.end_time,
            tags: serde_json::to_string(&self.tags).ok(),
            properties: serde_json::to_string(&self.properties()).ok(),
            archived: self.is_archived,
        }
    }

    pub(crate) fn from_row(row: RunRow) -> Result<Self, DbError> {
        let properties: BTreeMap<String, Value> = match &row.properties {
            Some(text) => serde_json::from_str(text).map_err(|e| DbError::InvalidRunName {
                name: row.name.clone(),
                message: format!("malformed properties: {e}"),
            })?,
            None => BTreeMap::new(),
        };
        let tags: BTreeMap<String, String> = row
            .tags
            .as_deref()
            .and_then(|text| serde_json::from_str(text).ok())
            .unwrap_or_default();
        let flow = properties
            .get("flow_path")
            .and_then(Value::as_str)
            .map(PathBuf::from)
            .unwrap_or_default();
        let output_path = properties
            .get("output_path")
            .and_then(Value::as_str)
            .map(PathBuf::from)
            .unwrap_or_default();
        let run = properties
            .get("run")
            .and_then(Value::as_str)
            .map(str::to_string);
        let variant = properties
            .get("node_variant")
            .and_then(Value::as_str)
            .map(str::to_string);
        Ok(Self {
            name: row.name,
            flow,
            data: None,
            variant,
            run,
            display_name: row.display_name,
            description: row.description,
            tags,
            properties,
            status: row.status,
            created_on: row.created_on,
            start_time: row.start_time,
            end_time: row.end_time,
            is_archived: row.archived,
            output_path,
        })
    }
}

// ---------------------------------------------------------------------------
// Naming
// ---------------------------------------------------------------------------

/// Default run name: `{flow_dir}[_{variant}]_{timestamp}`, sanitized to a
/// variable-name-like token.
fn generate_run_name(flow: &Path, variant: Option<&str>) -> String {
    let folder = flow
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "flow".to_string());
    let timestamp = Utc::now().format("%Y%m%d_%H%M%S_%6f");
    let base = match variant {
        Some(variant) => format!("{folder}_{variant}_{timestamp}"),
        None => format!("{folder}_{timestamp}"),
    };
    sanitize_run_name(&base)
}

/// Lowercase and replace everything outside `[a-z0-9_]` with underscores.
pub fn sanitize_run_name(name: &str) -> String {
    let mut sanitized: String = name
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect();
    if sanitized.chars().next().is_some_and(|c| c.is_ascii_digit()) {
        sanitized.insert(0, '_');
    }
    sanitized
}

/// A run name must be a variable-name-like token.
pub fn validate_run_name(name: &str) -> Result<(), DbError> {
    let valid = !name.is_empty()
        && !name.chars().next().unwrap().is_ascii_digit()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
    if valid {
        Ok(())
    } else {
        Err(DbError::InvalidRunName {
            name: name.to_string(),
            message: "expected a variable-name-like token".to_string(),
        })
    }
}

// ---------------------------------------------------------------------------
// Output path resolution
// ---------------------------------------------------------------------------

/// Resolve the run's output directory.
///
/// The configured base may contain `${flow_directory}`; a configuration
/// that degenerates to the flow directory itself is rejected. Without a
/// configured base (or without a resolvable home) the run lands under
/// `~/.promptflow/.runs/<name>`.
fn resolve_output_path(config: &Config, flow: &Path, name: &str) -> Result<PathBuf, DbError> {
    if let Some(configured) = &config.run_output_path {
        let substituted =
            configured.replace(FLOW_DIRECTORY_MACRO, flow.display().to_string().as_str());
        let base = PathBuf::from(substituted);
        if base == flow {
            return Err(DbError::InvalidConfigValue {
                key: "run.output_path".to_string(),
                message: format!(
                    "cannot be the flow directory itself ('{}')",
                    flow.display()
                ),
            });
        }
        return Ok(base.join(name));
    }
    Ok(home_dir().join(".runs").join(name))
}
