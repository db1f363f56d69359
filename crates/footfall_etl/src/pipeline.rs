//! Extract → transform → stage → publish → advance the high-water mark,
//! for one table, under the retry policy.

use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::task;
use tracing::{debug, error, info, warn};

use chrono::NaiveDateTime;
use footfall_config::{Settings, TableConfig};
use footfall_db::DbConnection;
use footfall_sinks::{PublishOutcome, PublishTarget, Publisher, StagingLoader};

use crate::contract::write_rejected;
use crate::error::{EtlError, Result};
use crate::extract::Extractor;
use crate::frame::Frame;
use crate::retry::RetryPolicy;
use crate::source::SourceDb;
use crate::state::{StateMap, StateStore};
use crate::transform::transform;

/// Resources shared by every pipeline of one run.
pub struct PipelineContext {
    pub settings: Arc<Settings>,
    pub source: SourceDb,
    /// Root read-write handle; pipelines clone their own connection from it.
    pub store: Arc<Mutex<DbConnection>>,
    pub publisher: Publisher,
    pub state_store: StateStore,
    /// Held across update and save so persisted states never interleave.
    pub state: Arc<tokio::sync::Mutex<StateMap>>,
}

impl PipelineContext {
    fn clone_store_connection(&self) -> Result<DbConnection> {
        let root = self.store.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(root.try_clone()?)
    }
}

/// What one successful pipeline did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableOutcome {
    pub source_table: String,
    pub dest_table: String,
    pub rows_staged: u64,
    pub publish: PublishOutcome,
    /// New high-water mark, when one was recorded.
    pub high_water_mark: Option<String>,
    pub attempts: u32,
}

pub struct TablePipeline {
    ctx: Arc<PipelineContext>,
    config: Arc<TableConfig>,
    retry: RetryPolicy,
}

impl TablePipeline {
    pub fn new(ctx: Arc<PipelineContext>, config: TableConfig) -> Self {
        let retry = RetryPolicy::from_settings(&ctx.settings);
        Self {
            ctx,
            config: Arc::new(config),
            retry,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn config(&self) -> &TableConfig {
        &self.config
    }

    pub async fn run(&self) -> Result<TableOutcome> {
        let label = self.config.dest_table.clone();
        self.retry
            .run(&label, |attempt| self.run_once(attempt))
            .await
    }

    async fn run_once(&self, attempt: u32) -> Result<TableOutcome> {
        let config = Arc::clone(&self.config);
        let settings = &self.ctx.settings;
        info!(
            table = %config.dest_table,
            attempt,
            "Starting pipeline for '{}' -> '{}'",
            config.source_table,
            config.dest_table
        );

        let since = {
            let state = self.ctx.state.lock().await;
            self.ctx.state_store.get_last_parsed(&state, &config.dest_table)?
        };
        if config.incremental {
            debug!("Extracting '{}' after {}", config.source_table, since);
        }

        let session = self.ctx.source.session().await?;
        let mut extractor = Extractor::new(session, &config, since, settings.etl_chunk_size);

        let staging_dir = settings.staging_dir(&config.dest_table);
        let rejected_dir = settings.rejected_dir(&config.dest_table);
        let mut loader = {
            let dir = staging_dir.clone();
            let partition_cols = config.partition_cols.clone();
            task::spawn_blocking(move || StagingLoader::open(dir, &partition_cols)).await??
        };

        let mut rows: u64 = 0;
        let mut max_ts: Option<NaiveDateTime> = None;
        while let Some(frame) = extractor.next_chunk().await? {
            let chunk_config = Arc::clone(&config);
            let rejected_dir = rejected_dir.clone();
            let (returned, staged) = task::spawn_blocking(move || {
                let mut loader = loader;
                let staged = stage_chunk(&mut loader, frame, &chunk_config, &rejected_dir);
                (loader, staged)
            })
            .await?;
            loader = returned;

            if let Some((written, chunk_max)) = staged? {
                rows += written;
                max_ts = max_ts.max(chunk_max);
            }
        }

        let summary = task::spawn_blocking(move || loader.finish()).await??;

        if rows == 0 {
            info!(
                "No new rows for '{}'; live table and high-water mark unchanged",
                config.dest_table
            );
            remove_empty_dir(&staging_dir);
            return Ok(TableOutcome {
                source_table: config.source_table.clone(),
                dest_table: config.dest_table.clone(),
                rows_staged: 0,
                publish: PublishOutcome::Skipped,
                high_water_mark: None,
                attempts: attempt,
            });
        }

        let target = PublishTarget {
            dest_table: config.dest_table.clone(),
            staging_dir,
            partitioned: config.is_partitioned(),
            incremental: config.incremental,
        };
        let conn = self.ctx.clone_store_connection()?;
        let publisher = self.ctx.publisher.clone();
        let has_written_data = summary.has_written_data();
        let publish = task::spawn_blocking(move || publisher.refresh(&conn, &target, has_written_data))
            .await??;

        let high_water_mark = match (config.incremental, max_ts) {
            (true, Some(ts)) => self.advance_mark(&config.dest_table, ts).await,
            _ => None,
        };

        info!(
            table = %config.dest_table,
            rows,
            "Pipeline for '{}' finished",
            config.source_table
        );
        Ok(TableOutcome {
            source_table: config.source_table.clone(),
            dest_table: config.dest_table.clone(),
            rows_staged: rows,
            publish,
            high_water_mark,
            attempts: attempt,
        })
    }

    /// Update and persist the mark. A failed save is logged; the table still
    /// counts as succeeded and the next run re-reads the overlap.
    async fn advance_mark(&self, dest_table: &str, ts: NaiveDateTime) -> Option<String> {
        let mut state = self.ctx.state.lock().await;
        if !StateStore::update(&mut state, dest_table, Some(ts)) {
            return None;
        }
        let snapshot = state.clone();
        let store = self.ctx.state_store.clone();
        let saved = task::spawn_blocking(move || store.save(&snapshot))
            .await
            .map_err(EtlError::from)
            .and_then(|r| r);
        if let Err(err) = saved {
            error!(
                table = dest_table,
                kind = err.kind(),
                "High-water mark not persisted: {}",
                err
            );
        }
        state.get(dest_table).cloned()
    }
}

/// Transform one chunk and append it to staging. Returns `None` for a chunk
/// that transforms to nothing.
fn stage_chunk(
    loader: &mut StagingLoader,
    frame: Frame,
    config: &TableConfig,
    rejected_dir: &Path,
) -> Result<Option<(u64, Option<NaiveDateTime>)>> {
    let chunk = match transform(frame, config) {
        Ok(chunk) => chunk,
        Err(violation) => {
            match write_rejected(rejected_dir, &violation) {
                Ok(path) => warn!(
                    "Wrote {} failure cases for '{}' to {}",
                    violation.cases.len(),
                    config.dest_table,
                    path.display()
                ),
                Err(e) => error!(
                    "Failed to write rejected rows for '{}': {}",
                    config.dest_table, e
                ),
            }
            return Err(violation.into());
        }
    };

    if chunk.report.clamped_negatives > 0 || chunk.report.invalid_timestamps > 0 {
        warn!(
            table = %config.dest_table,
            clamped_negatives = chunk.report.clamped_negatives,
            invalid_timestamps = chunk.report.invalid_timestamps,
            "Chunk needed corrections"
        );
    }
    if chunk.is_empty() {
        return Ok(None);
    }

    let written = loader.write_batch(&chunk.batch)?;
    Ok(Some((written, chunk.max_timestamp)))
}

fn remove_empty_dir(dir: &Path) {
    if std::fs::remove_dir(dir).is_ok() {
        debug!("Removed empty staging directory {}", dir.display());
    }
}
