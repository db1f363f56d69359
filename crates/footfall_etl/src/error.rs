//! Failure kinds of a table pipeline.

use footfall_db::BackendError;
use footfall_sinks::SinkError;
use thiserror::Error;

use crate::contract::ContractViolation;

#[derive(Debug, Error)]
pub enum EtlError {
    /// Connect, network or query failure against the source database.
    #[error("source unavailable: {message}")]
    SourceUnavailable { message: String },

    /// A chunk failed its table's schema contract.
    #[error(transparent)]
    ContractViolation(#[from] ContractViolation),

    /// Disk or codec failure while staging Parquet.
    #[error("staging failed: {0}")]
    StagingIo(#[source] SinkError),

    /// DDL, transaction or connection failure in the analytical store.
    #[error("publish failed: {message}")]
    PublishConflict { message: String },

    #[error("failed to persist ETL state: {message}")]
    StateWrite { message: String },

    #[error("configuration error: {0}")]
    Config(String),

    /// A worker task panicked or was cancelled.
    #[error("pipeline task failed: {0}")]
    TaskFailed(String),
}

pub type Result<T> = std::result::Result<T, EtlError>;

impl EtlError {
    pub fn source_unavailable(message: impl std::fmt::Display) -> Self {
        EtlError::SourceUnavailable {
            message: message.to_string(),
        }
    }

    /// Source, store and I/O faults are retried; contract and config faults are not.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EtlError::SourceUnavailable { .. }
                | EtlError::StagingIo(_)
                | EtlError::PublishConflict { .. }
        )
    }

    /// Short kind label for logs and the run summary.
    pub fn kind(&self) -> &'static str {
        match self {
            EtlError::SourceUnavailable { .. } => "SourceUnavailable",
            EtlError::ContractViolation(_) => "ContractViolation",
            EtlError::StagingIo(_) => "StagingIOError",
            EtlError::PublishConflict { .. } => "PublishConflict",
            EtlError::StateWrite { .. } => "StateWriteFailure",
            EtlError::Config(_) => "ConfigInvalid",
            EtlError::TaskFailed(_) => "TaskFailed",
        }
    }
}

impl From<SinkError> for EtlError {
    fn from(err: SinkError) -> Self {
        match err {
            SinkError::StagingIo { .. } => EtlError::StagingIo(err),
            SinkError::Publish { .. } => EtlError::PublishConflict {
                message: error_chain(&err),
            },
            SinkError::InvalidIdentifier(name) => {
                EtlError::Config(format!("invalid destination table '{}'", name))
            }
        }
    }
}

impl From<BackendError> for EtlError {
    fn from(err: BackendError) -> Self {
        EtlError::PublishConflict {
            message: err.to_string(),
        }
    }
}

impl From<footfall_config::ConfigError> for EtlError {
    fn from(err: footfall_config::ConfigError) -> Self {
        EtlError::Config(err.to_string())
    }
}

impl From<sqlx::Error> for EtlError {
    fn from(err: sqlx::Error) -> Self {
        EtlError::source_unavailable(err)
    }
}

#[cfg(feature = "mssql")]
impl From<tiberius::error::Error> for EtlError {
    fn from(err: tiberius::error::Error) -> Self {
        EtlError::source_unavailable(err)
    }
}

impl From<tokio::task::JoinError> for EtlError {
    fn from(err: tokio::task::JoinError) -> Self {
        EtlError::TaskFailed(err.to_string())
    }
}

fn error_chain(err: &dyn std::error::Error) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(inner) = source {
        message.push_str(": ");
        message.push_str(&inner.to_string());
        source = inner.source();
    }
    message
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn retry_predicate_follows_error_kind() {
        assert!(EtlError::source_unavailable("timeout").is_retryable());
        assert!(EtlError::PublishConflict {
            message: "conflict".into()
        }
        .is_retryable());
        assert!(!EtlError::Config("bad".into()).is_retryable());
        assert!(!EtlError::StateWrite {
            message: "disk".into()
        }
        .is_retryable());
    }

    #[test]
    fn sink_errors_map_to_pipeline_kinds() {
        let staging: EtlError = SinkError::StagingIo {
            path: PathBuf::from("/data/x"),
            message: "disk full".into(),
            source: None,
        }
        .into();
        assert_eq!(staging.kind(), "StagingIOError");
        assert!(staging.is_retryable());

        let ident: EtlError = SinkError::InvalidIdentifier("a b".into()).into();
        assert!(!ident.is_retryable());
    }
}
