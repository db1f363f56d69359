//! Access to the DuckDB analytical store.
//!
//! One process writes (the ETL, holding an exclusive sidecar lock); the
//! query service opens short-lived read-only handles.

pub mod backend;
pub mod lock;

pub use backend::{
    quote_ident, quote_literal, validate_identifier, BackendError, DbConnection, DbRow,
    DbTransaction, DbValue, FromDbValue,
};
pub use lock::{LockError, WriterLock};
