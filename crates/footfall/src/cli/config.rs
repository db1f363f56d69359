//! `footfall config`

use anyhow::{Context, Result};
use comfy_table::{presets::UTF8_FULL_CONDENSED, ContentArrangement, Table};
use footfall_config::{PathInfo, Settings, SettingsSummary};

pub fn run(settings: &Settings, json: bool) -> Result<()> {
    let summary = settings.summary();
    if json {
        let text =
            serde_json::to_string_pretty(&summary).context("Failed to serialize configuration")?;
        println!("{}", text);
    } else {
        println!("{}", render(&summary));
    }
    Ok(())
}

fn path_cell(info: &PathInfo) -> String {
    if info.exists {
        info.path.clone()
    } else {
        format!("{} (missing)", info.path)
    }
}

fn render(summary: &SettingsSummary) -> String {
    let mut settings = Table::new();
    settings
        .load_preset(UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec!["Setting", "Value"]);

    let rows: Vec<(&str, String)> = vec![
        ("Project", summary.project_name.clone()),
        (
            "Source",
            summary
                .source
                .clone()
                .unwrap_or_else(|| "(not configured)".to_string()),
        ),
        ("DATA_DIR", path_cell(&summary.data_dir)),
        ("DuckDB", path_cell(&summary.duckdb_path)),
        ("State file", path_cell(&summary.state_file)),
        ("Logs", path_cell(&summary.log_dir)),
        ("Table config", path_cell(&summary.table_config_path)),
        ("ETL_CHUNK_SIZE", summary.etl_chunk_size.to_string()),
        ("ETL_DEFAULT_TIMESTAMP", summary.etl_default_timestamp.clone()),
        (
            "ETL_CLEANUP_ON_FAILURE",
            summary.etl_cleanup_on_failure.to_string(),
        ),
        ("ETL_MAX_ATTEMPTS", summary.etl_max_attempts.to_string()),
        ("ETL_RETRY_WAIT_SECS", summary.etl_retry_wait_secs.to_string()),
        ("ETL_MAX_WORKERS", summary.etl_max_workers.to_string()),
        ("OUTLIER_THRESHOLD", summary.outlier_threshold.to_string()),
        ("OUTLIER_SCALE_RATIO", summary.outlier_scale_ratio.to_string()),
        ("WORKING_HOUR_START", summary.working_hour_start.to_string()),
        ("WORKING_HOUR_END", summary.working_hour_end.to_string()),
        (
            "INTERNAL_API_TOKEN",
            if summary.internal_api_token_set {
                "(set)".to_string()
            } else {
                "(not set)".to_string()
            },
        ),
        ("API", summary.api.clone()),
    ];
    for (key, value) in rows {
        settings.add_row(vec![key.to_string(), value]);
    }

    let mut tables = Table::new();
    tables
        .load_preset(UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec!["Order", "Source", "Destination", "Mode", "Partitions"]);
    for table in &summary.tables {
        tables.add_row(vec![
            table.processing_order.to_string(),
            table.source_table.clone(),
            table.dest_table.clone(),
            if table.incremental {
                "incremental".to_string()
            } else {
                "full".to_string()
            },
            table.partition_cols.join(", "),
        ]);
    }

    format!("{}\n\nTables\n{}", settings, tables)
}
