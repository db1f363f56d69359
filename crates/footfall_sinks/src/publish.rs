//! Staging-to-live hand-off in DuckDB.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info, warn};

use footfall_db::{quote_ident, quote_literal, validate_identifier, BackendError, DbConnection};

use crate::staging::DATA_FILE_NAME;
use crate::{SinkError, SinkResult};

/// One statement of the swap transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapStep {
    /// `DROP TABLE IF EXISTS {dest}_old`
    DropPrevious,
    /// `ALTER TABLE IF EXISTS {dest} RENAME TO {dest}_old`
    RetireLive,
    /// `ALTER TABLE {dest}_staging RENAME TO {dest}`
    PromoteStaging,
}

impl SwapStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            SwapStep::DropPrevious => "drop_previous",
            SwapStep::RetireLive => "retire_live",
            SwapStep::PromoteStaging => "promote_staging",
        }
    }
}

impl fmt::Display for SwapStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Called before each swap statement; an error aborts and rolls back the swap.
pub type StepGuard = Arc<dyn Fn(SwapStep) -> Result<(), String> + Send + Sync>;

/// Where a table's staged output lives and how it is merged.
#[derive(Debug, Clone)]
pub struct PublishTarget {
    pub dest_table: String,
    pub staging_dir: PathBuf,
    pub partitioned: bool,
    /// Incremental tables keep their previous rows and add the staged ones.
    pub incremental: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    /// Nothing was staged; the live table was not touched.
    Skipped,
    Published { rows: u64 },
}

/// Loads staged Parquet into `{dest}_staging` and swaps it in for `{dest}`.
///
/// Clones share one swap mutex, so at most one swap transaction runs at a
/// time per process.
#[derive(Clone)]
pub struct Publisher {
    swap_lock: Arc<Mutex<()>>,
    cleanup_on_failure: bool,
    step_guard: Option<StepGuard>,
}

impl fmt::Debug for Publisher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Publisher")
            .field("cleanup_on_failure", &self.cleanup_on_failure)
            .field("step_guard", &self.step_guard.is_some())
            .finish()
    }
}

impl Publisher {
    pub fn new(cleanup_on_failure: bool) -> Self {
        Self {
            swap_lock: Arc::new(Mutex::new(())),
            cleanup_on_failure,
            step_guard: None,
        }
    }

    pub fn with_step_guard(mut self, guard: StepGuard) -> Self {
        self.step_guard = Some(guard);
        self
    }

    /// Publish the staged output of one table.
    ///
    /// Returns [`PublishOutcome::Skipped`] without touching the store when
    /// nothing was staged. On success the staging directory is deleted; on
    /// failure it is deleted only when cleanup-on-failure is enabled.
    pub fn refresh(
        &self,
        conn: &DbConnection,
        target: &PublishTarget,
        has_written_data: bool,
    ) -> SinkResult<PublishOutcome> {
        if !has_written_data {
            info!(
                "No staged data for '{}'; live table left unchanged",
                target.dest_table
            );
            return Ok(PublishOutcome::Skipped);
        }

        validate_identifier(&target.dest_table)
            .map_err(|_| SinkError::InvalidIdentifier(target.dest_table.clone()))?;

        match self.load_and_swap(conn, target) {
            Ok(rows) => {
                remove_staging_dir(&target.staging_dir);
                info!("Published '{}' ({} rows)", target.dest_table, rows);
                Ok(PublishOutcome::Published { rows })
            }
            Err(err) => {
                if self.cleanup_on_failure {
                    remove_staging_dir(&target.staging_dir);
                } else {
                    warn!(
                        "Keeping staging directory {} after failed publish",
                        target.staging_dir.display()
                    );
                }
                Err(err)
            }
        }
    }

    fn load_and_swap(&self, conn: &DbConnection, target: &PublishTarget) -> SinkResult<u64> {
        let dest = target.dest_table.as_str();
        let live = quote_ident(dest);
        let staging = quote_ident(&format!("{}_staging", dest));
        let old = quote_ident(&format!("{}_old", dest));
        let read_expr = read_expression(target);

        let merge_live = target.incremental
            && conn
                .relation_exists(dest)
                .map_err(|e| SinkError::publish(dest, "failed to inspect live table", e))?;
        let select = if merge_live {
            format!(
                "SELECT * FROM {} UNION ALL BY NAME SELECT * FROM {}",
                live, read_expr
            )
        } else {
            format!("SELECT * FROM {}", read_expr)
        };

        debug!("Loading staging table for '{}': {}", dest, select);
        conn.execute_batch(&format!("CREATE OR REPLACE TABLE {} AS {}", staging, select))
            .map_err(|e| SinkError::publish(dest, "failed to load staging table", e))?;

        let rows: i64 = conn
            .query_scalar(
                &format!("SELECT CAST(COUNT(*) AS BIGINT) FROM {}", staging),
                &[],
            )
            .map_err(|e| SinkError::publish(dest, "failed to count staging table", e))?;

        {
            let _swap = self
                .swap_lock
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            conn.transaction(|tx| {
                self.check_step(SwapStep::DropPrevious)?;
                tx.execute_batch(&format!("DROP TABLE IF EXISTS {}", old))?;
                self.check_step(SwapStep::RetireLive)?;
                tx.execute_batch(&format!("ALTER TABLE IF EXISTS {} RENAME TO {}", live, old))?;
                self.check_step(SwapStep::PromoteStaging)?;
                tx.execute_batch(&format!("ALTER TABLE {} RENAME TO {}", staging, live))?;
                Ok(())
            })
            .map_err(|e| SinkError::publish(dest, "swap rolled back", e))?;
        }

        if let Err(e) = conn.execute_batch(&format!("DROP TABLE IF EXISTS {}", old)) {
            warn!("Failed to drop retired table for '{}': {}", dest, e);
        }
        if let Err(e) = conn.execute_batch("CHECKPOINT") {
            debug!("Checkpoint after publishing '{}' failed: {}", dest, e);
        }

        Ok(rows.max(0) as u64)
    }

    fn check_step(&self, step: SwapStep) -> Result<(), BackendError> {
        match &self.step_guard {
            Some(guard) => guard(step).map_err(|msg| {
                BackendError::Transaction(format!("step {} aborted: {}", step, msg))
            }),
            None => Ok(()),
        }
    }
}

fn read_expression(target: &PublishTarget) -> String {
    let dir = target.staging_dir.to_string_lossy().replace('\\', "/");
    if target.partitioned {
        format!(
            "read_parquet({}, hive_partitioning=1)",
            quote_literal(&format!("{}/**/*.parquet", dir))
        )
    } else {
        format!(
            "read_parquet({})",
            quote_literal(&format!("{}/{}", dir, DATA_FILE_NAME))
        )
    }
}

fn remove_staging_dir(dir: &Path) {
    if !dir.exists() {
        return;
    }
    match fs::remove_dir_all(dir) {
        Ok(()) => debug!("Removed staging directory {}", dir.display()),
        Err(e) => warn!(
            "Failed to remove staging directory {}: {}",
            dir.display(),
            e
        ),
    }
}
