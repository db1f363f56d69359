//! Analytical-store objects owned by the ETL: base tables and the
//! normalized traffic view read by the query service.

use tracing::info;

use footfall_config::Settings;
use footfall_db::{quote_ident, DbConnection};

use crate::contract::{contract_for, FieldType};
use crate::error::Result;

pub const NORMALIZED_VIEW: &str = "v_traffic_normalized";

/// Tables the view depends on, in creation order.
const BASE_TABLES: &[&str] = &["dim_stores", "fact_traffic", "fact_errors"];

fn duckdb_type(ty: FieldType) -> &'static str {
    match ty {
        FieldType::Int64 => "BIGINT",
        FieldType::Int32 => "INTEGER",
        FieldType::Utf8 => "VARCHAR",
        FieldType::Timestamp => "TIMESTAMP",
    }
}

/// `CREATE TABLE IF NOT EXISTS` for a contracted table.
pub fn base_table_ddl(dest_table: &str) -> Option<String> {
    let contract = contract_for(dest_table)?;
    let columns = contract
        .fields
        .iter()
        .map(|f| format!("{} {}", quote_ident(f.name), duckdb_type(f.ty)))
        .collect::<Vec<_>>()
        .join(", ");
    Some(format!(
        "CREATE TABLE IF NOT EXISTS {} ({})",
        quote_ident(dest_table),
        columns
    ))
}

/// Create empty base tables that do not exist yet. Existing tables are untouched.
pub fn ensure_base_tables(conn: &DbConnection) -> Result<()> {
    for table in BASE_TABLES {
        if let Some(ddl) = base_table_ddl(table) {
            conn.execute_batch(&ddl)?;
        }
    }
    Ok(())
}

/// Counts above the threshold are scaled, or replaced by 1 when the ratio is 0.
fn outlier_expr(column: &str, settings: &Settings) -> String {
    let scaled = if settings.outlier_scale_ratio == 0.0 {
        "1".to_string()
    } else {
        format!(
            "CAST(ROUND({} * {}, 0) AS BIGINT)",
            column, settings.outlier_scale_ratio
        )
    };
    format!(
        "CASE WHEN {col} > {threshold} THEN {scaled} ELSE {col} END",
        col = column,
        threshold = settings.outlier_threshold,
        scaled = scaled
    )
}

pub fn normalized_view_sql(settings: &Settings) -> String {
    format!(
        "CREATE OR REPLACE VIEW {view} AS \
         SELECT CAST(a.recorded_at AS TIMESTAMP) AS record_time, \
         b.store_name, \
         {in_expr} AS in_count, \
         {out_expr} AS out_count, \
         CAST(a.recorded_at AS TIMESTAMP) - INTERVAL '{shift} hours' AS adjusted_time \
         FROM fact_traffic a JOIN dim_stores b ON a.store_id = b.store_id",
        view = NORMALIZED_VIEW,
        in_expr = outlier_expr("a.visitors_in", settings),
        out_expr = outlier_expr("a.visitors_out", settings),
        shift = settings.working_hour_start
    )
}

pub fn create_normalized_view(conn: &DbConnection, settings: &Settings) -> Result<()> {
    conn.execute_batch(&normalized_view_sql(settings))?;
    info!(
        "Created view {} (threshold={}, ratio={}, shift={}h)",
        NORMALIZED_VIEW,
        settings.outlier_threshold,
        settings.outlier_scale_ratio,
        settings.working_hour_start
    );
    Ok(())
}

/// True when every table the view joins exists.
pub fn view_dependencies_exist(conn: &DbConnection) -> Result<bool> {
    Ok(conn.relation_exists("fact_traffic")? && conn.relation_exists("dim_stores")?)
}

/// Open the store read-write, create missing base tables and (re)create the view.
pub fn init_db(settings: &Settings) -> Result<()> {
    let path = settings.duckdb_path();
    let conn = DbConnection::open_duckdb(&path)?;
    ensure_base_tables(&conn)?;
    create_normalized_view(&conn, settings)?;
    info!("Initialized analytical store at {}", path.display());
    Ok(())
}
