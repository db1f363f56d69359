//! Lazy chunked reads of one source table.

use chrono::NaiveDateTime;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use footfall_config::TableConfig;

use crate::error::Result;
use crate::frame::Frame;
use crate::source::SourceSession;

/// Yields chunks of one table in source column form.
///
/// The table is read with a single statement: incremental tables in
/// timestamp order starting after `since`, full-load tables whole. A
/// background task drains the cursor and hands over `chunk_size` rows at a
/// time, so ties on the timestamp never split or repeat rows, and rows
/// committed while the read is underway wait for the next run.
/// The sequence is finite and not restartable.
pub struct Extractor {
    sql: String,
    since: Option<NaiveDateTime>,
    chunk_size: usize,
    reader: Reader,
}

enum Reader {
    Pending(SourceSession),
    Streaming {
        rx: mpsc::Receiver<Result<Frame>>,
        handle: JoinHandle<()>,
    },
    Done,
}

impl Extractor {
    pub fn new(
        session: SourceSession,
        config: &TableConfig,
        since: NaiveDateTime,
        chunk_size: usize,
    ) -> Self {
        let dialect = session.dialect();
        let table = dialect.quote_ident(&config.source_table);
        let projection = projection(config)
            .map(|cols| {
                cols.iter()
                    .map(|c| dialect.quote_ident(c))
                    .collect::<Vec<_>>()
                    .join(", ")
            })
            .unwrap_or_else(|| "*".to_string());

        let (sql, since, chunk_size) = match (&config.timestamp_col, config.incremental) {
            (Some(ts_col), true) => {
                let ts = dialect.quote_ident(ts_col);
                let sql = format!(
                    "SELECT {} FROM {} WHERE {} > {} ORDER BY {}",
                    projection,
                    table,
                    ts,
                    dialect.placeholder(),
                    ts
                );
                (sql, Some(since), chunk_size.max(1))
            }
            _ => (
                format!("SELECT {} FROM {}", projection, table),
                None,
                usize::MAX,
            ),
        };

        Self {
            sql,
            since,
            chunk_size,
            reader: Reader::Pending(session),
        }
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// Next non-empty chunk, or `None` when the table is exhausted.
    pub async fn next_chunk(&mut self) -> Result<Option<Frame>> {
        if let Reader::Pending(_) = self.reader {
            if let Reader::Pending(session) = std::mem::replace(&mut self.reader, Reader::Done) {
                debug!("Extracting: {}", self.sql);
                let (tx, rx) = mpsc::channel(1);
                let handle = tokio::spawn(session.stream_chunks(
                    self.sql.clone(),
                    self.since,
                    self.chunk_size,
                    tx,
                ));
                self.reader = Reader::Streaming { rx, handle };
            }
        }

        let Reader::Streaming { rx, handle } = &mut self.reader else {
            return Ok(None);
        };
        match rx.recv().await {
            Some(Ok(frame)) => Ok(Some(frame)),
            Some(Err(err)) => {
                self.reader = Reader::Done;
                Err(err)
            }
            None => {
                // A reader task that died must not pass for a short table.
                let joined = handle.await;
                self.reader = Reader::Done;
                joined?;
                Ok(None)
            }
        }
    }
}

impl Drop for Extractor {
    fn drop(&mut self) {
        if let Reader::Streaming { handle, .. } = &self.reader {
            handle.abort();
        }
    }
}

/// Source columns to read: the renamed ones plus the timestamp column.
/// `None` selects every column.
fn projection(config: &TableConfig) -> Option<Vec<String>> {
    if config.rename_map.is_empty() {
        return None;
    }
    let mut cols: Vec<String> = config.rename_map.keys().cloned().collect();
    if let Some(ts) = &config.timestamp_col {
        if !cols.contains(ts) {
            cols.push(ts.clone());
        }
    }
    Some(cols)
}
