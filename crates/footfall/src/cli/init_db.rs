//! `footfall init-db`

use anyhow::Result;
use tracing::info;

use footfall_config::Settings;

use crate::cli::error::HelpfulError;

pub fn run(settings: &Settings) -> Result<()> {
    footfall_etl::init_db(settings)
        .map_err(|err| HelpfulError::store_unavailable(&settings.duckdb_path(), err))?;
    info!(
        "{} ready (WORKING_HOUR_START={}, OUTLIER_THRESHOLD={}, OUTLIER_SCALE_RATIO={})",
        footfall_etl::NORMALIZED_VIEW,
        settings.working_hour_start,
        settings.outlier_threshold,
        settings.outlier_scale_ratio
    );
    Ok(())
}
