//! Incremental ETL from the operational source into the DuckDB analytical store.
//!
//! Each configured table runs through its own [`TablePipeline`]: chunks are
//! extracted after the table's high-water mark, transformed and validated
//! against the table's contract, staged as Parquet, and swapped into the
//! live table. The [`Orchestrator`] runs the pipelines on a bounded pool.

pub mod catalog;
pub mod contract;
mod error;
pub mod extract;
pub mod frame;
pub mod notify;
pub mod orchestrator;
pub mod pipeline;
pub mod retry;
pub mod source;
pub mod state;
pub mod transform;

pub use catalog::{create_normalized_view, ensure_base_tables, init_db, NORMALIZED_VIEW};
pub use contract::{contract_for, ContractViolation, FailureCase};
pub use error::{EtlError, Result};
pub use extract::Extractor;
pub use frame::{Column, Frame, Value};
pub use orchestrator::{Orchestrator, RunOptions, RunSummary};
pub use pipeline::{PipelineContext, TableOutcome, TablePipeline};
pub use retry::RetryPolicy;
pub use source::{Dialect, SourceDb, SourceSession};
pub use state::{StateMap, StateStore};
pub use transform::{transform, TransformReport, TransformedChunk};
