//! Query operations behind the HTTP handlers.
//!
//! Each call opens its own read-only DuckDB handle on the blocking pool and
//! drops it before returning, so the ETL can take the write lock between
//! requests. Stats results go through the shared [`QueryCache`].

use std::path::PathBuf;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::task;
use tracing::debug;

use footfall_config::Settings;
use footfall_db::{DbConnection, DbRow};

use crate::cache::{CacheKey, QueryCache};
use crate::error::{ApiError, ApiResult};
use crate::params::{Page, StatsFilter, WorkingHours};
use crate::sql::{self, Statement};

pub const NO_PEAK: &str = "--:--";
pub const NO_STORE: &str = "N/A";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Store {
    pub store_id: i64,
    pub store_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    pub total_in: i64,
    pub average_in: i64,
    pub peak_time: String,
    pub current_occupancy: i64,
    pub busiest_store: String,
    pub growth: f64,
}

impl Metrics {
    fn empty() -> Self {
        Self {
            total_in: 0,
            average_in: 0,
            peak_time: NO_PEAK.to_string(),
            current_occupancy: 0,
            busiest_store: NO_STORE.to_string(),
            growth: 0.0,
        }
    }
}

/// One chart point.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Point {
    pub x: String,
    pub y: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetailRow {
    pub period: String,
    pub total_in: i64,
    pub pct_change: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetailsSummary {
    pub total_sum: i64,
    pub average_in: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Details {
    pub total_records: usize,
    pub page: u32,
    pub page_size: u32,
    pub data: Vec<DetailRow>,
    pub summary: DetailsSummary,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorLog {
    pub id: i64,
    pub store_name: Option<String>,
    pub log_time: Option<String>,
    pub error_code: Option<i64>,
    pub error_message: Option<String>,
}

/// Percentage change against the previous period, to one decimal.
pub fn growth(current: i64, previous: i64) -> f64 {
    if previous > 0 {
        round1((current - previous) as f64 / previous as f64 * 100.0)
    } else if current > 0 {
        100.0
    } else {
        0.0
    }
}

fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

/// Store names may carry a ` (location)` suffix; the card shows the name only.
fn display_store_name(name: &str) -> &str {
    name.split(" (").next().unwrap_or(name)
}

#[derive(Clone)]
pub struct QueryService {
    db_path: Arc<PathBuf>,
    hours: WorkingHours,
    cache: Arc<QueryCache>,
}

impl QueryService {
    pub fn new(db_path: PathBuf, hours: WorkingHours, cache: Arc<QueryCache>) -> Self {
        Self {
            db_path: Arc::new(db_path),
            hours,
            cache,
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(
            settings.duckdb_path(),
            WorkingHours {
                start: settings.working_hour_start,
                end: settings.working_hour_end,
            },
            Arc::new(QueryCache::new(
                settings.query_cache_ttl,
                settings.query_cache_capacity,
            )),
        )
    }

    pub fn cache(&self) -> &QueryCache {
        &self.cache
    }

    pub fn clear_cache(&self) -> usize {
        self.cache.clear()
    }

    /// Run `op` against a fresh read-only handle on the blocking pool.
    async fn with_connection<T, F>(&self, op: F) -> ApiResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&DbConnection) -> ApiResult<T> + Send + 'static,
    {
        let path = Arc::clone(&self.db_path);
        task::spawn_blocking(move || {
            let conn = DbConnection::open_duckdb_readonly(&path)?;
            op(&conn)
        })
        .await?
    }

    async fn query_rows(&self, stmt: Statement) -> ApiResult<Vec<DbRow>> {
        self.with_connection(move |conn| Ok(conn.query_all(&stmt.sql, &stmt.params)?))
            .await
    }

    /// Serve from the cache, or compute and remember.
    async fn cached<T, F, Fut>(&self, key: CacheKey, compute: F) -> ApiResult<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = ApiResult<T>>,
    {
        if let Some(hit) = self.cache.get(&key) {
            match serde_json::from_value(hit) {
                Ok(value) => {
                    debug!(?key, "Query cache hit");
                    return Ok(value);
                }
                Err(e) => debug!(?key, "Discarding undecodable cache entry: {}", e),
            }
        }
        let value = compute().await?;
        if let Ok(json) = serde_json::to_value(&value) {
            self.cache.insert(key, json);
        }
        Ok(value)
    }

    pub async fn stores(&self) -> ApiResult<Vec<Store>> {
        let rows = self.query_rows(sql::stores()).await?;
        rows.iter()
            .map(|row| -> ApiResult<Store> {
                Ok(Store {
                    store_id: row.get(0)?,
                    store_name: row.get::<Option<String>>(1)?.unwrap_or_default(),
                })
            })
            .collect()
    }

    pub async fn metrics(&self, filter: &StatsFilter) -> ApiResult<Metrics> {
        let key = CacheKey::new("metrics", &filter.key_parts());
        self.cached(key, || self.compute_metrics(filter)).await
    }

    async fn compute_metrics(&self, filter: &StatsFilter) -> ApiResult<Metrics> {
        let window = filter.window(self.hours);
        let stmt = sql::metrics(filter, window, self.hours.start);
        let row = self
            .with_connection(move |conn| {
                conn.query_optional(&stmt.sql, &stmt.params)?
                    .ok_or_else(|| ApiError::QueryExecution("metrics query returned no row".into()))
            })
            .await?;

        let Some(total_in) = row.get::<Option<i64>>(0)? else {
            return Ok(Metrics::empty());
        };
        let average_in = row.get::<Option<f64>>(1)?.unwrap_or(0.0).round() as i64;
        let peak_time = row
            .get::<Option<String>>(2)?
            .unwrap_or_else(|| NO_PEAK.to_string());
        let current_occupancy = row.get::<Option<i64>>(3)?.unwrap_or(0);
        let busiest_store = row
            .get::<Option<String>>(4)?
            .map(|name| display_store_name(&name).to_string())
            .unwrap_or_else(|| NO_STORE.to_string());

        let previous = filter.previous()?;
        let stmt = sql::total_in(&previous, previous.window(self.hours));
        let previous_total = self
            .with_connection(move |conn| {
                Ok(conn
                    .query_optional(&stmt.sql, &stmt.params)?
                    .map(|row| row.get::<Option<i64>>(0))
                    .transpose()?
                    .flatten()
                    .unwrap_or(0))
            })
            .await?;

        Ok(Metrics {
            total_in,
            average_in,
            peak_time,
            current_occupancy,
            busiest_store,
            growth: growth(total_in, previous_total),
        })
    }

    pub async fn trend(&self, filter: &StatsFilter) -> ApiResult<Vec<Point>> {
        let key = CacheKey::new("trend", &filter.key_parts());
        self.cached(key, || async {
            let stmt = sql::trend(filter, filter.window(self.hours), self.hours.start);
            points(self.query_rows(stmt).await?)
        })
        .await
    }

    pub async fn store_distribution(&self, filter: &StatsFilter) -> ApiResult<Vec<Point>> {
        let key = CacheKey::new("store_distribution", &filter.key_parts());
        self.cached(key, || async {
            let stmt = sql::store_distribution(filter, filter.window(self.hours));
            points(self.query_rows(stmt).await?)
        })
        .await
    }

    pub async fn details(&self, filter: &StatsFilter, page: Page) -> ApiResult<Details> {
        let [period, start, end, store] = filter.key_parts();
        let key = CacheKey::new(
            "details",
            &[
                period,
                start,
                end,
                store,
                page.page.to_string(),
                page.page_size.to_string(),
            ],
        );
        self.cached(key, || async {
            let stmt = sql::details(filter, filter.window(self.hours), self.hours.start);
            let rows = self
                .query_rows(stmt)
                .await?
                .iter()
                .map(|row| -> ApiResult<DetailRow> {
                    Ok(DetailRow {
                        period: row.get::<Option<String>>(0)?.unwrap_or_default(),
                        total_in: row.get::<Option<i64>>(1)?.unwrap_or(0),
                        pct_change: row.get::<Option<f64>>(2)?.unwrap_or(0.0),
                    })
                })
                .collect::<ApiResult<Vec<_>>>()?;
            Ok(paginate(rows, page))
        })
        .await
    }

    pub async fn error_logs(&self, limit: u32) -> ApiResult<Vec<ErrorLog>> {
        let rows = self.query_rows(sql::error_logs(limit)).await?;
        rows.iter()
            .map(|row| -> ApiResult<ErrorLog> {
                Ok(ErrorLog {
                    id: row.get(0)?,
                    store_name: row.get(1)?,
                    log_time: row.get(2)?,
                    error_code: row.get(3)?,
                    error_message: row.get(4)?,
                })
            })
            .collect()
    }

    pub async fn latest_record_time(&self) -> ApiResult<Option<String>> {
        let stmt = sql::latest_record_time();
        self.with_connection(move |conn| {
            Ok(conn
                .query_optional(&stmt.sql, &stmt.params)?
                .map(|row| row.get::<Option<String>>(0))
                .transpose()?
                .flatten())
        })
        .await
    }
}

fn points(rows: Vec<DbRow>) -> ApiResult<Vec<Point>> {
    rows.iter()
        .map(|row| -> ApiResult<Point> {
            Ok(Point {
                x: row.get::<Option<String>>(0)?.unwrap_or_default(),
                y: row.get::<Option<i64>>(1)?.unwrap_or(0),
            })
        })
        .collect()
}

/// Slice one page out of the newest-first bucket list; the summary covers all buckets.
fn paginate(rows: Vec<DetailRow>, page: Page) -> Details {
    let total_records = rows.len();
    let total_sum: i64 = rows.iter().map(|r| r.total_in).sum();
    let average_in = if total_records == 0 {
        0
    } else {
        (total_sum as f64 / total_records as f64).round() as i64
    };
    let data = rows
        .into_iter()
        .skip(page.offset())
        .take(page.page_size as usize)
        .collect();
    Details {
        total_records,
        page: page.page,
        page_size: page.page_size,
        data,
        summary: DetailsSummary {
            total_sum,
            average_in,
        },
    }
}
