//! Configuration model for the footfall ETL and query service.
//!
//! Settings are read once per process from the environment (and `.env`),
//! validated as a whole, and then passed explicitly to every component.

mod error;
mod settings;
mod tables;
pub mod timestamp;

pub use error::{ConfigError, Result};
pub use settings::{
    PathInfo, Settings, SettingsSummary, SourceSettings, SqlServerSettings, TableSummary,
    DEFAULT_API_HOST, DEFAULT_API_PORT, DEFAULT_CACHE_CAPACITY, DEFAULT_CACHE_TTL_SECS,
    DEFAULT_CHUNK_SIZE, DEFAULT_ETL_TIMESTAMP, DEFAULT_MAX_ATTEMPTS, DEFAULT_MAX_WORKERS,
    DEFAULT_OUTLIER_SCALE_RATIO, DEFAULT_OUTLIER_THRESHOLD, DEFAULT_RETRY_WAIT_SECS,
    DEFAULT_WORKING_HOUR_END, DEFAULT_WORKING_HOUR_START,
};
pub use tables::{
    is_identifier, is_source_identifier, CleaningRule, TableConfig, TableSet,
    SUPPORTED_PARTITIONS,
};
