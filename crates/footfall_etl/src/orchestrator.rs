//! Runs every configured table pipeline on a bounded worker pool.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::Semaphore;
use tokio::task::{self, JoinSet};
use tracing::{error, info, warn};

use footfall_config::Settings;
use footfall_db::DbConnection;
use footfall_sinks::Publisher;

use crate::catalog;
use crate::error::{EtlError, Result};
use crate::notify;
use crate::pipeline::{PipelineContext, TableOutcome, TablePipeline};
use crate::source::SourceDb;
use crate::state::StateStore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOptions {
    pub max_workers: usize,
    pub clear_cache: bool,
    pub api_host: String,
    pub api_port: u16,
}

impl RunOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            max_workers: settings.etl_max_workers,
            clear_cache: true,
            api_host: settings.api_host.clone(),
            api_port: settings.api_port,
        }
    }
}

/// Per-run classification of tables, by source table name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub total: usize,
    pub succeeded: Vec<String>,
    pub failed: Vec<String>,
    pub outcomes: Vec<TableOutcome>,
}

impl RunSummary {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str("==================== ETL SUMMARY ====================\n");
        out.push_str(&format!("Total:     {}\n", self.total));
        out.push_str(&format!("Succeeded: {}\n", self.succeeded.len()));
        out.push_str(&format!("Failed:    {}\n", self.failed.len()));
        if !self.failed.is_empty() {
            out.push_str(&format!("Failed tables: {}\n", self.failed.join(", ")));
        }
        out.push_str("=====================================================");
        out
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

pub struct Orchestrator {
    settings: Arc<Settings>,
    publisher: Publisher,
}

impl Orchestrator {
    pub fn new(settings: Arc<Settings>) -> Self {
        let publisher = Publisher::new(settings.etl_cleanup_on_failure);
        Self {
            settings,
            publisher,
        }
    }

    /// Replace the publisher, e.g. to install a swap step guard.
    pub fn with_publisher(mut self, publisher: Publisher) -> Self {
        self.publisher = publisher;
        self
    }

    /// Run all tables once.
    ///
    /// Source or store connection failures abort the run before any table
    /// starts; per-table failures are recorded in the summary.
    pub async fn run(&self, options: &RunOptions) -> Result<RunSummary> {
        let settings = Arc::clone(&self.settings);
        let source = SourceDb::connect(settings.source()?).await?;

        let db_path = settings.duckdb_path();
        let store = task::spawn_blocking(move || DbConnection::open_duckdb(&db_path))
            .await?
            .map_err(|e| EtlError::PublishConflict {
                message: format!("cannot open analytical store: {}", e),
            })?;
        let store = Arc::new(Mutex::new(store));

        let state_store = StateStore::new(settings.state_file(), &settings.etl_default_timestamp);
        let state = state_store.load();

        let ctx = Arc::new(PipelineContext {
            settings: Arc::clone(&settings),
            source: source.clone(),
            store: Arc::clone(&store),
            publisher: self.publisher.clone(),
            state_store,
            state: Arc::new(tokio::sync::Mutex::new(state)),
        });

        let tables = settings.tables.in_processing_order();
        let max_workers = options.max_workers.max(1);
        info!(
            tables = tables.len(),
            max_workers, "Starting ETL run"
        );

        let mut summary = RunSummary {
            total: tables.len(),
            ..RunSummary::default()
        };
        let semaphore = Arc::new(Semaphore::new(max_workers));
        let mut workers = JoinSet::new();

        // Permits are taken in processing order, so lower orders start first.
        for config in tables {
            let permit = Arc::clone(&semaphore)
                .acquire_owned()
                .await
                .map_err(|e| EtlError::TaskFailed(e.to_string()))?;
            let name = config.source_table.clone();
            let pipeline = TablePipeline::new(Arc::clone(&ctx), config);
            workers.spawn(async move {
                let _permit = permit;
                let result = match task::spawn(async move { pipeline.run().await }).await {
                    Ok(result) => result,
                    Err(join_err) => Err(EtlError::from(join_err)),
                };
                (name, result)
            });
        }

        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok((name, Ok(outcome))) => {
                    info!(table = %name, rows = outcome.rows_staged, "Table succeeded");
                    summary.succeeded.push(name);
                    summary.outcomes.push(outcome);
                }
                Ok((name, Err(err))) => {
                    error!(table = %name, kind = err.kind(), "Table failed: {}", err);
                    summary.failed.push(name);
                }
                Err(join_err) => {
                    error!("Worker task failed: {}", join_err);
                }
            }
        }
        summary.succeeded.sort();
        summary.failed.sort();

        if !summary.succeeded.is_empty() {
            refresh_view(Arc::clone(&store), Arc::clone(&settings)).await;
        }

        // Release the write handle before the query service reopens the file.
        drop(ctx);
        drop(store);
        source.close().await;

        for line in summary.render().lines() {
            info!("{}", line);
        }

        if options.clear_cache && !summary.succeeded.is_empty() {
            notify::clear_query_cache(
                &options.api_host,
                options.api_port,
                settings.internal_api_token.as_deref(),
            )
            .await;
        }

        Ok(summary)
    }
}

async fn refresh_view(store: Arc<Mutex<DbConnection>>, settings: Arc<Settings>) {
    let refreshed = task::spawn_blocking(move || -> Result<bool> {
        let conn = store.lock().unwrap_or_else(PoisonError::into_inner);
        if !catalog::view_dependencies_exist(&conn)? {
            return Ok(false);
        }
        catalog::create_normalized_view(&conn, &settings)?;
        Ok(true)
    })
    .await
    .map_err(EtlError::from)
    .and_then(|r| r);

    match refreshed {
        Ok(true) => {}
        Ok(false) => warn!("Base tables missing; {} not refreshed", catalog::NORMALIZED_VIEW),
        Err(e) => warn!("Failed to refresh {}: {}", catalog::NORMALIZED_VIEW, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_lists_failed_tables() {
        let summary = RunSummary {
            total: 3,
            succeeded: vec!["store".into()],
            failed: vec!["ErrLog".into(), "num_crowd".into()],
            outcomes: Vec::new(),
        };
        let text = summary.render();
        assert!(text.contains("Total:     3"));
        assert!(text.contains("Succeeded: 1"));
        assert!(text.contains("Failed tables: ErrLog, num_crowd"));
        assert!(!summary.is_success());
    }
}
