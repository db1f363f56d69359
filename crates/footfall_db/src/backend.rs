//! Handles onto the DuckDB analytical store.
//!
//! A writable handle owns the [`WriterLock`]; clones share it. Read-only
//! handles take no lock and refuse statements that modify the store.

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime};
use duckdb::types::{TimeUnit, Value, ValueRef};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, debug_span, info, warn};

use crate::lock::{LockError, WriterLock};

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("analytical store unavailable: {0}")]
    Database(String),

    #[error("another ETL run holds the analytical store: {0}")]
    Locked(String),

    #[error("analytical store was opened read-only")]
    ReadOnly,

    #[error("query failed: {0}")]
    Query(String),

    #[error("transaction aborted: {0}")]
    Transaction(String),

    #[error("unexpected column value: {0}")]
    TypeConversion(String),

    #[error("rejected input: {0}")]
    InvalidInput(String),

    #[error(transparent)]
    DuckDb(#[from] duckdb::Error),
}

impl From<LockError> for BackendError {
    fn from(err: LockError) -> Self {
        match err {
            LockError::Held(path) => BackendError::Locked(path.display().to_string()),
            other => BackendError::Database(other.to_string()),
        }
    }
}

/// Statement parameter or result cell.
#[derive(Debug, Clone, PartialEq)]
pub enum DbValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Boolean(bool),
    Timestamp(NaiveDateTime),
}

impl From<i64> for DbValue {
    fn from(v: i64) -> Self {
        DbValue::Integer(v)
    }
}

impl From<f64> for DbValue {
    fn from(v: f64) -> Self {
        DbValue::Real(v)
    }
}

impl From<bool> for DbValue {
    fn from(v: bool) -> Self {
        DbValue::Boolean(v)
    }
}

impl From<&str> for DbValue {
    fn from(v: &str) -> Self {
        DbValue::Text(v.to_owned())
    }
}

impl From<String> for DbValue {
    fn from(v: String) -> Self {
        DbValue::Text(v)
    }
}

impl From<NaiveDateTime> for DbValue {
    fn from(v: NaiveDateTime) -> Self {
        DbValue::Timestamp(v)
    }
}

impl<T: Into<DbValue>> From<Option<T>> for DbValue {
    fn from(v: Option<T>) -> Self {
        v.map_or(DbValue::Null, Into::into)
    }
}

impl DbValue {
    fn to_duckdb(&self) -> Value {
        match self {
            DbValue::Null => Value::Null,
            DbValue::Integer(v) => Value::BigInt(*v),
            DbValue::Real(v) => Value::Double(*v),
            DbValue::Text(v) => Value::Text(v.clone()),
            DbValue::Boolean(v) => Value::Boolean(*v),
            DbValue::Timestamp(v) => {
                Value::Timestamp(TimeUnit::Microsecond, v.and_utc().timestamp_micros())
            }
        }
    }

    fn from_duckdb(cell: ValueRef<'_>, column: usize) -> Self {
        match cell {
            ValueRef::Null => DbValue::Null,
            ValueRef::Boolean(v) => DbValue::Boolean(v),
            ValueRef::TinyInt(v) => DbValue::Integer(v.into()),
            ValueRef::SmallInt(v) => DbValue::Integer(v.into()),
            ValueRef::Int(v) => DbValue::Integer(v.into()),
            ValueRef::BigInt(v) => DbValue::Integer(v),
            ValueRef::UTinyInt(v) => DbValue::Integer(v.into()),
            ValueRef::USmallInt(v) => DbValue::Integer(v.into()),
            ValueRef::UInt(v) => DbValue::Integer(v.into()),
            ValueRef::UBigInt(v) => DbValue::Integer(v as i64),
            ValueRef::HugeInt(v) => DbValue::Integer(v as i64),
            ValueRef::Float(v) => DbValue::Real(v.into()),
            ValueRef::Double(v) => DbValue::Real(v),
            ValueRef::Text(bytes) | ValueRef::Blob(bytes) => {
                DbValue::Text(String::from_utf8_lossy(bytes).into_owned())
            }
            ValueRef::Timestamp(unit, v) => DateTime::from_timestamp_micros(micros(unit, v))
                .map_or(DbValue::Null, |dt| DbValue::Timestamp(dt.naive_utc())),
            ValueRef::Date32(days) => NaiveDate::from_num_days_from_ce_opt(UNIX_EPOCH_DAYS + days)
                .map_or(DbValue::Null, |d| DbValue::Text(d.format("%Y-%m-%d").to_string())),
            ValueRef::Time64(unit, v) => {
                let us = micros(unit, v);
                NaiveTime::from_num_seconds_from_midnight_opt(
                    (us / 1_000_000) as u32,
                    ((us % 1_000_000) * 1_000) as u32,
                )
                .map_or(DbValue::Null, |t| DbValue::Text(t.format("%H:%M:%S").to_string()))
            }
            other => {
                warn!(column, "unmapped DuckDB value rendered as text");
                DbValue::Text(format!("{:?}", other))
            }
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            DbValue::Null => "NULL",
            DbValue::Integer(_) => "integer",
            DbValue::Real(_) => "real",
            DbValue::Text(_) => "text",
            DbValue::Boolean(_) => "boolean",
            DbValue::Timestamp(_) => "timestamp",
        }
    }
}

/// Days from 0001-01-01 to 1970-01-01.
const UNIX_EPOCH_DAYS: i32 = 719_163;

fn micros(unit: TimeUnit, v: i64) -> i64 {
    match unit {
        TimeUnit::Second => v * 1_000_000,
        TimeUnit::Millisecond => v * 1_000,
        TimeUnit::Microsecond => v,
        TimeUnit::Nanosecond => v / 1_000,
    }
}

/// Typed read of a [`DbValue`]. NULL only converts into `Option<T>`.
pub trait FromDbValue: Sized {
    fn from_db_value(value: &DbValue) -> Result<Self, BackendError>;
}

fn mismatch<T>(wanted: &str, got: &DbValue) -> Result<T, BackendError> {
    Err(BackendError::TypeConversion(format!(
        "wanted {}, found {}",
        wanted,
        got.kind()
    )))
}

impl FromDbValue for i64 {
    fn from_db_value(value: &DbValue) -> Result<Self, BackendError> {
        match value {
            DbValue::Integer(v) => Ok(*v),
            other => mismatch("integer", other),
        }
    }
}

impl FromDbValue for f64 {
    fn from_db_value(value: &DbValue) -> Result<Self, BackendError> {
        match value {
            DbValue::Real(v) => Ok(*v),
            DbValue::Integer(v) => Ok(*v as f64),
            other => mismatch("real", other),
        }
    }
}

impl FromDbValue for bool {
    fn from_db_value(value: &DbValue) -> Result<Self, BackendError> {
        match value {
            DbValue::Boolean(v) => Ok(*v),
            other => mismatch("boolean", other),
        }
    }
}

impl FromDbValue for String {
    fn from_db_value(value: &DbValue) -> Result<Self, BackendError> {
        match value {
            DbValue::Text(v) => Ok(v.clone()),
            other => mismatch("text", other),
        }
    }
}

impl FromDbValue for NaiveDateTime {
    fn from_db_value(value: &DbValue) -> Result<Self, BackendError> {
        match value {
            DbValue::Timestamp(v) => Ok(*v),
            DbValue::Text(text) => NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f")
                .map_err(|e| BackendError::TypeConversion(format!("'{}': {}", text, e))),
            other => mismatch("timestamp", other),
        }
    }
}

impl<T: FromDbValue> FromDbValue for Option<T> {
    fn from_db_value(value: &DbValue) -> Result<Self, BackendError> {
        if *value == DbValue::Null {
            Ok(None)
        } else {
            T::from_db_value(value).map(Some)
        }
    }
}

/// One result row. Column names are shared across the rows of a result.
#[derive(Debug, Clone)]
pub struct DbRow {
    columns: Arc<[String]>,
    values: Vec<DbValue>,
}

impl DbRow {
    pub fn get<T: FromDbValue>(&self, index: usize) -> Result<T, BackendError> {
        match self.values.get(index) {
            Some(value) => T::from_db_value(value).map_err(|err| match err {
                BackendError::TypeConversion(msg) => BackendError::TypeConversion(format!(
                    "column {} ({}): {}",
                    index,
                    self.columns.get(index).map(String::as_str).unwrap_or("?"),
                    msg
                )),
                other => other,
            }),
            None => Err(BackendError::TypeConversion(format!(
                "row has {} columns, asked for {}",
                self.values.len(),
                index
            ))),
        }
    }

    pub fn column_names(&self) -> &[String] {
        &self.columns
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// A connection to the analytical store.
pub struct DbConnection {
    conn: duckdb::Connection,
    writable: bool,
    lock: Option<Arc<WriterLock>>,
}

impl std::fmt::Debug for DbConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbConnection")
            .field("writable", &self.writable)
            .field("lock", &self.lock.as_ref().map(|l| l.path().to_path_buf()))
            .finish()
    }
}

impl DbConnection {
    /// Open `path` read-write under the writer lock, creating parent
    /// directories as needed. Fails with [`BackendError::Locked`] while
    /// another process writes.
    pub fn open_duckdb(path: &Path) -> Result<Self, BackendError> {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)
                .map_err(|e| BackendError::Database(format!("{}: {}", dir.display(), e)))?;
        }
        let lock = WriterLock::acquire(path)?;
        let conn = duckdb::Connection::open(path)?;
        info!(store = %path.display(), "opened analytical store for writing");
        Ok(Self {
            conn,
            writable: true,
            lock: Some(Arc::new(lock)),
        })
    }

    /// Open `path` read-only. Takes no lock.
    pub fn open_duckdb_readonly(path: &Path) -> Result<Self, BackendError> {
        let config = duckdb::Config::default().access_mode(duckdb::AccessMode::ReadOnly)?;
        let conn = duckdb::Connection::open_with_flags(path, config)?;
        debug!(store = %path.display(), "opened analytical store read-only");
        Ok(Self {
            conn,
            writable: false,
            lock: None,
        })
    }

    /// Writable in-memory database.
    pub fn open_duckdb_memory() -> Result<Self, BackendError> {
        Ok(Self {
            conn: duckdb::Connection::open_in_memory()?,
            writable: true,
            lock: None,
        })
    }

    /// Another connection to the same database instance, sharing the lock.
    pub fn try_clone(&self) -> Result<Self, BackendError> {
        Ok(Self {
            conn: self.conn.try_clone()?,
            writable: self.writable,
            lock: self.lock.clone(),
        })
    }

    fn ensure_writable(&self) -> Result<(), BackendError> {
        if self.writable {
            Ok(())
        } else {
            Err(BackendError::ReadOnly)
        }
    }

    /// Run one statement; returns the affected row count.
    pub fn execute(&self, sql: &str, params: &[DbValue]) -> Result<u64, BackendError> {
        self.ensure_writable()?;
        execute(&self.conn, sql, params)
    }

    /// Run a semicolon-separated script without parameters.
    pub fn execute_batch(&self, sql: &str) -> Result<(), BackendError> {
        self.ensure_writable()?;
        execute_batch(&self.conn, sql)
    }

    pub fn query_all(&self, sql: &str, params: &[DbValue]) -> Result<Vec<DbRow>, BackendError> {
        query(&self.conn, sql, params)
    }

    pub fn query_optional(
        &self,
        sql: &str,
        params: &[DbValue],
    ) -> Result<Option<DbRow>, BackendError> {
        Ok(self.query_all(sql, params)?.into_iter().next())
    }

    pub fn query_one(&self, sql: &str, params: &[DbValue]) -> Result<DbRow, BackendError> {
        first_row(self.query_all(sql, params)?, sql)
    }

    /// First column of the first row.
    pub fn query_scalar<T: FromDbValue>(
        &self,
        sql: &str,
        params: &[DbValue],
    ) -> Result<T, BackendError> {
        self.query_one(sql, params)?.get(0)
    }

    /// Whether `name` is a table or view in the `main` schema.
    pub fn relation_exists(&self, name: &str) -> Result<bool, BackendError> {
        let found: i64 = self.query_scalar(
            "SELECT CAST(COUNT(*) AS BIGINT) FROM information_schema.tables \
             WHERE table_schema = 'main' AND table_name = ?",
            &[DbValue::from(name)],
        )?;
        Ok(found > 0)
    }

    /// Run `op` inside BEGIN/COMMIT. Any error from `op` or from COMMIT
    /// rolls the transaction back.
    pub fn transaction<T, F>(&self, op: F) -> Result<T, BackendError>
    where
        F: FnOnce(&mut DbTransaction<'_>) -> Result<T, BackendError>,
    {
        self.ensure_writable()?;
        self.conn.execute_batch("BEGIN TRANSACTION")?;

        let outcome = op(&mut DbTransaction { conn: &self.conn })
            .and_then(|value| match self.conn.execute_batch("COMMIT") {
                Ok(()) => Ok(value),
                Err(e) => Err(BackendError::Transaction(format!("COMMIT: {}", e))),
            });

        match outcome {
            Ok(value) => Ok(value),
            Err(err) => match self.conn.execute_batch("ROLLBACK") {
                Ok(()) => Err(err),
                Err(rollback) => Err(BackendError::Transaction(format!(
                    "{}; ROLLBACK also failed: {}",
                    err, rollback
                ))),
            },
        }
    }
}

/// Statement access inside [`DbConnection::transaction`].
pub struct DbTransaction<'a> {
    conn: &'a duckdb::Connection,
}

impl DbTransaction<'_> {
    pub fn execute(&mut self, sql: &str, params: &[DbValue]) -> Result<u64, BackendError> {
        execute(self.conn, sql, params)
    }

    pub fn execute_batch(&mut self, sql: &str) -> Result<(), BackendError> {
        execute_batch(self.conn, sql)
    }

    pub fn query_all(&mut self, sql: &str, params: &[DbValue]) -> Result<Vec<DbRow>, BackendError> {
        query(self.conn, sql, params)
    }

    pub fn query_scalar<T: FromDbValue>(
        &mut self,
        sql: &str,
        params: &[DbValue],
    ) -> Result<T, BackendError> {
        first_row(self.query_all(sql, params)?, sql)?.get(0)
    }
}

fn first_row(rows: Vec<DbRow>, sql: &str) -> Result<DbRow, BackendError> {
    rows.into_iter()
        .next()
        .ok_or_else(|| BackendError::Query(format!("no rows from {}", statement_kind(sql))))
}

fn statement_kind(sql: &str) -> &str {
    sql.split_whitespace().next().unwrap_or("statement")
}

fn bind(params: &[DbValue]) -> Vec<Value> {
    params.iter().map(DbValue::to_duckdb).collect()
}

fn as_params(values: &[Value]) -> Vec<&dyn duckdb::ToSql> {
    values.iter().map(|v| v as &dyn duckdb::ToSql).collect()
}

fn execute(conn: &duckdb::Connection, sql: &str, params: &[DbValue]) -> Result<u64, BackendError> {
    let span = debug_span!(
        "store.execute",
        kind = statement_kind(sql),
        elapsed_ms = tracing::field::Empty
    );
    let _entered = span.enter();
    let started = Instant::now();

    let values = bind(params);
    let affected = conn.prepare(sql)?.execute(as_params(&values).as_slice())?;

    span.record("elapsed_ms", started.elapsed().as_millis() as u64);
    Ok(affected as u64)
}

fn execute_batch(conn: &duckdb::Connection, sql: &str) -> Result<(), BackendError> {
    let span = debug_span!("store.script", elapsed_ms = tracing::field::Empty);
    let _entered = span.enter();
    let started = Instant::now();

    conn.execute_batch(sql)?;

    span.record("elapsed_ms", started.elapsed().as_millis() as u64);
    Ok(())
}

fn query(
    conn: &duckdb::Connection,
    sql: &str,
    params: &[DbValue],
) -> Result<Vec<DbRow>, BackendError> {
    let span = debug_span!(
        "store.query",
        kind = statement_kind(sql),
        rows = tracing::field::Empty,
        elapsed_ms = tracing::field::Empty
    );
    let _entered = span.enter();
    let started = Instant::now();

    let values = bind(params);
    let mut stmt = conn.prepare(sql)?;
    let mut cursor = stmt.query(as_params(&values).as_slice())?;

    let columns: Arc<[String]> = match cursor.as_ref() {
        Some(described) => (0..described.column_count())
            .map(|i| {
                described
                    .column_name(i)
                    .map_or_else(|_| format!("column{}", i), |name| name.to_string())
            })
            .collect::<Vec<_>>()
            .into(),
        None => return Ok(Vec::new()),
    };

    let mut rows = Vec::new();
    while let Some(row) = cursor.next()? {
        let values = (0..columns.len())
            .map(|i| Ok(DbValue::from_duckdb(row.get_ref(i)?, i)))
            .collect::<Result<Vec<_>, duckdb::Error>>()?;
        rows.push(DbRow {
            columns: Arc::clone(&columns),
            values,
        });
    }

    span.record("rows", rows.len() as u64);
    span.record("elapsed_ms", started.elapsed().as_millis() as u64);
    Ok(rows)
}

/// Double-quote an identifier, doubling embedded quotes.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Single-quote a string literal, doubling embedded quotes.
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Table and column names from configuration must match `[A-Za-z0-9_]+`.
pub fn validate_identifier(name: &str) -> Result<(), BackendError> {
    let ok = !name.is_empty() && name.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_');
    if ok {
        Ok(())
    } else {
        Err(BackendError::InvalidInput(format!(
            "'{}' is not a plain identifier",
            name
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 1, 10)
            .unwrap()
            .and_hms_opt(h, m, 0)
            .unwrap()
    }

    fn count(conn: &DbConnection, table: &str) -> i64 {
        conn.query_scalar(&format!("SELECT CAST(COUNT(*) AS BIGINT) FROM {}", table), &[])
            .unwrap()
    }

    #[test]
    fn traffic_row_reads_back_typed() {
        let conn = DbConnection::open_duckdb_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE fact_traffic (recorded_at TIMESTAMP, visitors_in BIGINT, device_position TEXT, ratio DOUBLE)",
        )
        .unwrap();
        conn.execute(
            "INSERT INTO fact_traffic VALUES (?, ?, ?, ?)",
            &[
                DbValue::from(at(10, 15)),
                DbValue::from(12_i64),
                DbValue::from(None::<String>),
                DbValue::from(0.5),
            ],
        )
        .unwrap();

        let row = conn.query_one("SELECT * FROM fact_traffic", &[]).unwrap();
        assert_eq!(row.column_names()[1], "visitors_in");
        assert_eq!(row.get::<NaiveDateTime>(0).unwrap(), at(10, 15));
        assert_eq!(row.get::<i64>(1).unwrap(), 12);
        assert_eq!(row.get::<Option<String>>(2).unwrap(), None);
        assert_eq!(row.get::<f64>(3).unwrap(), 0.5);
        assert!(row.get::<String>(2).is_err());
        assert!(row.get::<i64>(9).is_err());
    }

    #[test]
    fn failed_transaction_leaves_no_rows() {
        let conn = DbConnection::open_duckdb_memory().unwrap();
        conn.execute_batch("CREATE TABLE dim_stores (store_id BIGINT)").unwrap();

        let result: Result<(), BackendError> = conn.transaction(|tx| {
            tx.execute("INSERT INTO dim_stores VALUES (1)", &[])?;
            Err(BackendError::Query("swap step failed".into()))
        });
        assert!(matches!(result, Err(BackendError::Query(_))));
        assert_eq!(count(&conn, "dim_stores"), 0);

        conn.transaction(|tx| tx.execute("INSERT INTO dim_stores VALUES (1), (2)", &[]))
            .unwrap();
        assert_eq!(count(&conn, "dim_stores"), 2);
    }

    #[test]
    fn relation_exists_covers_views() {
        let conn = DbConnection::open_duckdb_memory().unwrap();
        assert!(!conn.relation_exists("dim_stores").unwrap());
        conn.execute_batch(
            "CREATE TABLE dim_stores (store_id BIGINT); CREATE VIEW v_stores AS SELECT * FROM dim_stores",
        )
        .unwrap();
        assert!(conn.relation_exists("dim_stores").unwrap());
        assert!(conn.relation_exists("v_stores").unwrap());
    }

    #[test]
    fn readonly_handle_refuses_writes() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("analytics.duckdb");
        {
            let conn = DbConnection::open_duckdb(&path).unwrap();
            conn.execute_batch("CREATE TABLE dim_stores (store_id BIGINT)").unwrap();
        }
        let reader = DbConnection::open_duckdb_readonly(&path).unwrap();
        assert!(matches!(
            reader.execute_batch("DROP TABLE dim_stores"),
            Err(BackendError::ReadOnly)
        ));
        assert_eq!(count(&reader, "dim_stores"), 0);
    }

    #[test]
    fn identifiers_and_literals() {
        assert!(validate_identifier("fact_traffic").is_ok());
        assert!(validate_identifier("fact traffic").is_err());
        assert!(validate_identifier("x;DROP").is_err());
        assert!(validate_identifier("").is_err());
        assert_eq!(quote_ident("a\"b"), "\"a\"\"b\"");
        assert_eq!(quote_literal("it's"), "'it''s'");
    }
}
