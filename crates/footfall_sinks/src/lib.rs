//! Staging and publishing for ETL output.
//!
//! Transformed Arrow batches are written to a per-table staging directory as
//! Parquet ([`StagingLoader`]), then loaded into DuckDB and swapped in for the
//! live table in one transaction ([`Publisher`]).

use std::path::PathBuf;
use thiserror::Error;

use footfall_db::BackendError;

mod publish;
mod staging;

pub use publish::{PublishOutcome, PublishTarget, Publisher, StepGuard, SwapStep};
pub use staging::{StagingLoader, StagingSummary, DATA_FILE_NAME};

/// Errors returned by staging and publishing.
#[derive(Debug, Error)]
pub enum SinkError {
    /// Disk, permission or codec failure while writing staging files.
    #[error("staging I/O failed at {path}: {message}")]
    StagingIo {
        path: PathBuf,
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// DDL or transaction failure in the analytical store.
    #[error("publish of '{table}' failed: {message}")]
    Publish {
        table: String,
        message: String,
        #[source]
        source: Option<BackendError>,
    },

    #[error("invalid table identifier '{0}'")]
    InvalidIdentifier(String),
}

pub type SinkResult<T> = std::result::Result<T, SinkError>;

impl SinkError {
    pub(crate) fn staging_io<E>(path: impl Into<PathBuf>, message: impl Into<String>, err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        SinkError::StagingIo {
            path: path.into(),
            message: message.into(),
            source: Some(Box::new(err)),
        }
    }

    pub(crate) fn publish(table: &str, message: impl Into<String>, err: BackendError) -> Self {
        SinkError::Publish {
            table: table.to_string(),
            message: message.into(),
            source: Some(err),
        }
    }

    /// Whether a later attempt could succeed.
    pub fn is_transient(&self) -> bool {
        !matches!(self, SinkError::InvalidIdentifier(_))
    }
}
