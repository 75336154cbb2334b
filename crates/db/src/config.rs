//! Process-level configuration.
//!
//! One `Config` is constructed at process start and passed explicitly to
//! whatever needs it; tests build their own. There is no global instance.

use std::path::PathBuf;

/// Macro accepted in `run_output_path`, substituted with the absolute flow
/// directory at run creation.
pub const FLOW_DIRECTORY_MACRO: &str = "${flow_directory}";

/// Home of the local state: `~/.promptflow`.
pub fn home_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".promptflow")
}

#[derive(Debug, Clone, Default)]
pub struct Config {
    /// Configured base directory for run outputs. May contain
    /// [`FLOW_DIRECTORY_MACRO`]. When unset, runs land under
    /// `~/.promptflow/.runs/<name>`.
    pub run_output_path: Option<String>,
    /// Path of the run index database. When unset, `~/.promptflow/pf.sqlite`.
    pub database_path: Option<PathBuf>,
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_run_output_path(mut self, path: impl Into<String>) -> Self {
        self.run_output_path = Some(path.into());
        self
    }
}
