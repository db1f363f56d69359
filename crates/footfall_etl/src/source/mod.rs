//! Read-only access to the operational source database.
//!
//! SQL Server is the production source; a SQLite replica with the same
//! tables can stand in for it locally.

#[cfg(feature = "mssql")]
mod mssql;
mod sqlite;

use chrono::NaiveDateTime;
use tokio::sync::mpsc;
use tracing::{debug, info};

use footfall_config::SourceSettings;

use crate::error::{EtlError, Result};
use crate::frame::{Frame, Value};

/// SQL flavour of the connected source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    SqlServer,
    Sqlite,
}

impl Dialect {
    /// Quote a possibly schema-qualified identifier, part by part.
    pub fn quote_ident(&self, name: &str) -> String {
        name.split('.')
            .map(|part| match self {
                Dialect::SqlServer => format!("[{}]", part.replace(']', "]]")),
                Dialect::Sqlite => format!("\"{}\"", part.replace('"', "\"\"")),
            })
            .collect::<Vec<_>>()
            .join(".")
    }

    /// Placeholder for the single bound parameter.
    pub fn placeholder(&self) -> &'static str {
        match self {
            Dialect::SqlServer => "@P1",
            Dialect::Sqlite => "?",
        }
    }
}

/// A connected source. Cheap to clone; each pipeline opens its own session.
#[derive(Clone)]
pub enum SourceDb {
    #[cfg(feature = "mssql")]
    SqlServer(mssql::MssqlSource),
    Sqlite(sqlite::SqliteSource),
}

impl std::fmt::Debug for SourceDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("SourceDb").field(&self.dialect()).finish()
    }
}

impl SourceDb {
    /// Connect and pre-ping with `SELECT 1`.
    pub async fn connect(settings: &SourceSettings) -> Result<Self> {
        let source = match settings {
            #[cfg(feature = "mssql")]
            SourceSettings::SqlServer(sql) => SourceDb::SqlServer(mssql::MssqlSource::new(sql)),
            #[cfg(not(feature = "mssql"))]
            SourceSettings::SqlServer(_) => {
                return Err(EtlError::Config(
                    "SQL Server source requires the 'mssql' feature; set SOURCE_DB_URL to a sqlite: URL"
                        .to_string(),
                ))
            }
            SourceSettings::Sqlite { url } => {
                SourceDb::Sqlite(sqlite::SqliteSource::connect(url).await?)
            }
        };

        let mut session = source.session().await?;
        session.ping().await?;
        info!("Connected to source {}", settings.describe());
        Ok(source)
    }

    pub fn dialect(&self) -> Dialect {
        match self {
            #[cfg(feature = "mssql")]
            SourceDb::SqlServer(_) => Dialect::SqlServer,
            SourceDb::Sqlite(_) => Dialect::Sqlite,
        }
    }

    pub async fn session(&self) -> Result<SourceSession> {
        match self {
            #[cfg(feature = "mssql")]
            SourceDb::SqlServer(source) => Ok(SourceSession::SqlServer(source.session().await?)),
            SourceDb::Sqlite(source) => Ok(SourceSession::Sqlite(source.session())),
        }
    }

    pub async fn close(self) {
        match self {
            #[cfg(feature = "mssql")]
            SourceDb::SqlServer(_) => {}
            SourceDb::Sqlite(source) => source.close().await,
        }
    }
}

/// One open connection to the source.
pub enum SourceSession {
    #[cfg(feature = "mssql")]
    SqlServer(mssql::MssqlSession),
    Sqlite(sqlite::SqliteSession),
}

impl SourceSession {
    pub fn dialect(&self) -> Dialect {
        match self {
            #[cfg(feature = "mssql")]
            SourceSession::SqlServer(_) => Dialect::SqlServer,
            SourceSession::Sqlite(_) => Dialect::Sqlite,
        }
    }

    /// Run a query, binding `since` to the placeholder when given.
    pub async fn fetch(&mut self, sql: &str, since: Option<NaiveDateTime>) -> Result<Frame> {
        match self {
            #[cfg(feature = "mssql")]
            SourceSession::SqlServer(session) => session.fetch(sql, since).await,
            SourceSession::Sqlite(session) => session.fetch(sql, since).await,
        }
    }

    /// Run `sql` once and send its rows to `tx` in frames of `chunk_size`.
    ///
    /// The whole result comes from a single statement, so every row is sent
    /// exactly once even when timestamps tie or the source is written to
    /// meanwhile. Stops early once the receiver is dropped.
    pub async fn stream_chunks(
        mut self,
        sql: String,
        since: Option<NaiveDateTime>,
        chunk_size: usize,
        tx: mpsc::Sender<Result<Frame>>,
    ) {
        let mut sink = ChunkSink::new(tx, chunk_size);
        let streamed = match &mut self {
            #[cfg(feature = "mssql")]
            SourceSession::SqlServer(session) => session.stream(&sql, since, &mut sink).await,
            SourceSession::Sqlite(session) => session.stream(&sql, since, &mut sink).await,
        };
        match streamed {
            Ok(()) => {
                sink.flush().await;
            }
            Err(err) => {
                let _ = sink.tx.send(Err(err)).await;
            }
        }
    }

    async fn ping(&mut self) -> Result<()> {
        let frame = self.fetch("SELECT 1", None).await?;
        if frame.num_rows() == 1 {
            Ok(())
        } else {
            Err(EtlError::source_unavailable("pre-ping returned no row"))
        }
    }
}

/// Collects streamed rows into frames for the extractor.
pub(crate) struct ChunkSink {
    tx: mpsc::Sender<Result<Frame>>,
    chunk_size: usize,
    names: Vec<String>,
    rows: Vec<Vec<Value>>,
}

impl ChunkSink {
    fn new(tx: mpsc::Sender<Result<Frame>>, chunk_size: usize) -> Self {
        Self {
            tx,
            chunk_size: chunk_size.max(1),
            names: Vec::new(),
            rows: Vec::new(),
        }
    }

    pub(crate) fn has_columns(&self) -> bool {
        !self.names.is_empty()
    }

    pub(crate) fn set_columns(&mut self, names: Vec<String>) {
        self.names = names;
    }

    /// Returns `false` once nobody is listening.
    pub(crate) async fn push(&mut self, row: Vec<Value>) -> bool {
        self.rows.push(row);
        if self.rows.len() >= self.chunk_size {
            self.flush().await
        } else {
            true
        }
    }

    async fn flush(&mut self) -> bool {
        if self.rows.is_empty() {
            return true;
        }
        let rows = std::mem::take(&mut self.rows);
        let frame = Frame::from_rows(self.names.clone(), rows);
        if self.tx.send(Ok(frame)).await.is_err() {
            debug!("Extractor dropped; closing source cursor");
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quoting_handles_schema_and_escapes() {
        assert_eq!(Dialect::SqlServer.quote_ident("dbo.num_crowd"), "[dbo].[num_crowd]");
        assert_eq!(Dialect::Sqlite.quote_ident("store"), "\"store\"");
        assert_eq!(Dialect::Sqlite.quote_ident("a\"b"), "\"a\"\"b\"");
    }

    #[tokio::test]
    async fn sqlite_source_pings_and_fetches() {
        let temp = tempfile::TempDir::new().unwrap();
        let url = format!("sqlite:{}?mode=rwc", temp.path().join("src.db").display());
        let source = SourceDb::connect(&SourceSettings::Sqlite { url }).await.unwrap();
        assert_eq!(source.dialect(), Dialect::Sqlite);

        let mut session = source.session().await.unwrap();
        let frame = session
            .fetch("SELECT 1 AS one, 'x' AS txt, 2.5 AS f, NULL AS n", None)
            .await
            .unwrap();
        assert_eq!(frame.column_names(), vec!["one", "txt", "f", "n"]);
        assert_eq!(frame.column("one").unwrap().values[0], crate::frame::Value::Int(1));
        assert_eq!(
            frame.column("txt").unwrap().values[0],
            crate::frame::Value::Text("x".into())
        );
        assert_eq!(frame.column("f").unwrap().values[0], crate::frame::Value::Float(2.5));
        assert!(frame.column("n").unwrap().values[0].is_null());
        drop(session);
        source.close().await;
    }

    #[tokio::test]
    async fn unreachable_sqlite_is_source_unavailable() {
        let url = "sqlite:/nonexistent-dir/never/src.db?mode=ro".to_string();
        let err = SourceDb::connect(&SourceSettings::Sqlite { url }).await.unwrap_err();
        assert!(err.is_retryable());
    }
}
