use chrono::{NaiveDate, NaiveDateTime};
use futures::TryStreamExt;
use tiberius::{AuthMethod, Client, ColumnData, Config, FromSql, Row};
use tokio::net::TcpStream;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};
use tracing::warn;

use footfall_config::SqlServerSettings;

use crate::error::{EtlError, Result};
use crate::frame::{Frame, Value};
use crate::source::ChunkSink;

#[derive(Clone)]
pub struct MssqlSource {
    config: Config,
}

impl MssqlSource {
    pub fn new(settings: &SqlServerSettings) -> Self {
        let mut config = Config::new();
        config.host(&settings.server);
        config.port(settings.port);
        config.database(&settings.database);
        config.authentication(AuthMethod::sql_server(&settings.uid, &settings.pwd));
        if settings.trust_cert {
            config.trust_cert();
        }
        Self { config }
    }

    pub async fn session(&self) -> Result<MssqlSession> {
        let tcp = TcpStream::connect(self.config.get_addr())
            .await
            .map_err(EtlError::source_unavailable)?;
        tcp.set_nodelay(true).map_err(EtlError::source_unavailable)?;
        let client = Client::connect(self.config.clone(), tcp.compat_write()).await?;
        Ok(MssqlSession { client })
    }
}

pub struct MssqlSession {
    client: Client<Compat<TcpStream>>,
}

impl MssqlSession {
    pub async fn fetch(&mut self, sql: &str, since: Option<NaiveDateTime>) -> Result<Frame> {
        let stream = match since {
            Some(since) => self.client.query(sql, &[&since]).await?,
            None => self.client.query(sql, &[]).await?,
        };
        let rows = stream.into_first_result().await?;

        let names: Vec<String> = match rows.first() {
            Some(row) => row.columns().iter().map(|c| c.name().to_string()).collect(),
            None => return Ok(Frame::default()),
        };
        let decoded = rows
            .into_iter()
            .map(decode_row)
            .collect::<Result<Vec<_>>>()?;
        Ok(Frame::from_rows(names, decoded))
    }

    pub(crate) async fn stream(
        &mut self,
        sql: &str,
        since: Option<NaiveDateTime>,
        sink: &mut ChunkSink,
    ) -> Result<()> {
        let stream = match since {
            Some(since) => self.client.query(sql, &[&since]).await?,
            None => self.client.query(sql, &[]).await?,
        };
        let mut rows = stream.into_row_stream();
        while let Some(row) = rows.try_next().await? {
            if !sink.has_columns() {
                sink.set_columns(row.columns().iter().map(|c| c.name().to_string()).collect());
            }
            if !sink.push(decode_row(row)?).await {
                break;
            }
        }
        Ok(())
    }
}

fn decode_row(row: Row) -> Result<Vec<Value>> {
    row.into_iter().map(|data| decode_cell(&data)).collect()
}

fn decode_cell(data: &ColumnData<'static>) -> Result<Value> {
    let value = match data {
        ColumnData::U8(v) => v.map(|v| Value::Int(i64::from(v))),
        ColumnData::I16(v) => v.map(|v| Value::Int(i64::from(v))),
        ColumnData::I32(v) => v.map(|v| Value::Int(i64::from(v))),
        ColumnData::I64(v) => v.map(Value::Int),
        ColumnData::F32(v) => v.map(|v| Value::Float(f64::from(v))),
        ColumnData::F64(v) => v.map(Value::Float),
        ColumnData::Bit(v) => v.map(Value::Bool),
        ColumnData::String(v) => v.as_ref().map(|s| Value::Text(s.to_string())),
        ColumnData::Guid(v) => v.map(|g| Value::Text(g.to_string())),
        ColumnData::Numeric(v) => v.map(|n| {
            if n.scale() == 0 {
                i64::try_from(n.value())
                    .map(Value::Int)
                    .unwrap_or_else(|_| Value::Float(n.value() as f64))
            } else {
                Value::Float(n.value() as f64 / 10f64.powi(i32::from(n.scale())))
            }
        }),
        ColumnData::DateTime(_) | ColumnData::SmallDateTime(_) | ColumnData::DateTime2(_) => {
            NaiveDateTime::from_sql(data)?.map(Value::Timestamp)
        }
        ColumnData::Date(_) => NaiveDate::from_sql(data)?
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .map(Value::Timestamp),
        other => {
            warn!("Unsupported SQL Server column type; decoding as text: {:?}", other);
            Some(Value::Text(format!("{:?}", other)))
        }
    };
    Ok(value.unwrap_or(Value::Null))
}
