//! Typed error type for the db crate.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("sqlx error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("run '{0}' already exists")]
    RunExists(String),

    #[error("run '{0}' not found")]
    RunNotFound(String),

    #[error("invalid run name '{name}': {message}")]
    InvalidRunName { name: String, message: String },

    #[error("invalid value for configuration '{key}': {message}")]
    InvalidConfigValue { key: String, message: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
