use chrono::NaiveDateTime;
use futures::TryStreamExt;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{Column, Row, TypeInfo, ValueRef};
use tracing::warn;

use footfall_config::timestamp::format_timestamp;

use crate::error::Result;
use crate::frame::{Frame, Value};
use crate::source::ChunkSink;

#[derive(Debug, Clone)]
pub struct SqliteSource {
    pool: SqlitePool,
}

impl SqliteSource {
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect(url)
            .await?;
        Ok(Self { pool })
    }

    pub fn session(&self) -> SqliteSession {
        SqliteSession {
            pool: self.pool.clone(),
        }
    }

    pub async fn close(self) {
        self.pool.close().await;
    }
}

pub struct SqliteSession {
    pool: SqlitePool,
}

impl SqliteSession {
    pub async fn fetch(&mut self, sql: &str, since: Option<NaiveDateTime>) -> Result<Frame> {
        let rows = bind_since(sqlx::query(sql), since)
            .fetch_all(&self.pool)
            .await?;

        let names: Vec<String> = match rows.first() {
            Some(row) => row.columns().iter().map(|c| c.name().to_string()).collect(),
            None => return Ok(Frame::default()),
        };
        let decoded = rows
            .iter()
            .map(|row| decode_row(row, names.len()))
            .collect::<Result<Vec<_>>>()?;
        Ok(Frame::from_rows(names, decoded))
    }

    pub(crate) async fn stream(
        &mut self,
        sql: &str,
        since: Option<NaiveDateTime>,
        sink: &mut ChunkSink,
    ) -> Result<()> {
        let mut rows = bind_since(sqlx::query(sql), since).fetch(&self.pool);
        while let Some(row) = rows.try_next().await? {
            if !sink.has_columns() {
                sink.set_columns(row.columns().iter().map(|c| c.name().to_string()).collect());
            }
            let width = row.columns().len();
            if !sink.push(decode_row(&row, width)?).await {
                break;
            }
        }
        Ok(())
    }
}

type SqliteQuery<'q> = sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>>;

/// Replicas store datetimes as ISO text; compare in the same form.
fn bind_since(query: SqliteQuery<'_>, since: Option<NaiveDateTime>) -> SqliteQuery<'_> {
    match since {
        Some(since) => query.bind(format_timestamp(&since)),
        None => query,
    }
}

fn decode_row(row: &SqliteRow, width: usize) -> Result<Vec<Value>> {
    let mut values = Vec::with_capacity(width);
    for index in 0..width {
        let raw = row.try_get_raw(index)?;
        if raw.is_null() {
            values.push(Value::Null);
            continue;
        }
        let type_name = raw.type_info().name().to_string();
        let value = match type_name.as_str() {
            "INTEGER" | "BOOLEAN" => Value::Int(row.try_get_unchecked::<i64, _>(index)?),
            "REAL" | "NUMERIC" => Value::Float(row.try_get_unchecked::<f64, _>(index)?),
            "TEXT" | "DATE" | "TIME" | "DATETIME" => {
                Value::Text(row.try_get_unchecked::<String, _>(index)?)
            }
            other => {
                warn!("Decoding SQLite {} value in column {} as text", other, index);
                let bytes = row.try_get_unchecked::<Vec<u8>, _>(index)?;
                Value::Text(String::from_utf8_lossy(&bytes).into_owned())
            }
        };
        values.push(value);
    }
    Ok(values)
}
