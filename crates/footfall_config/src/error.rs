//! Configuration errors.

use std::path::PathBuf;
use thiserror::Error;

/// Configuration could not be loaded or failed validation.
///
/// Every variant is fatal at process start.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration:\n  - {}", .0.join("\n  - "))]
    Invalid(Vec<String>),

    #[error("Failed to read table config {path}: {source}")]
    TableFileRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse table config {path}: {source}")]
    TableFileParse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("Source database is not configured (set SQLSERVER_SERVER/SQLSERVER_DATABASE/SQLSERVER_UID/SQLSERVER_PWD or SOURCE_DB_URL)")]
    SourceMissing,
}

impl ConfigError {
    pub fn invalid(message: impl Into<String>) -> Self {
        ConfigError::Invalid(vec![message.into()])
    }
}

pub type Result<T> = std::result::Result<T, ConfigError>;
