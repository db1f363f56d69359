//! End-to-end runs against a seeded SQLite source and a temporary DATA_DIR.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use tempfile::TempDir;

use footfall_config::Settings;
use footfall_db::DbConnection;
use footfall_etl::{EtlError, Orchestrator, RunOptions, RunSummary};
use footfall_sinks::{PublishOutcome, Publisher, SwapStep};

struct Harness {
    temp: TempDir,
    source_url: String,
    pool: SqlitePool,
}

impl Harness {
    async fn new() -> Self {
        let temp = TempDir::new().unwrap();
        let source_url = format!("sqlite:{}?mode=rwc", temp.path().join("source.db").display());
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect(&source_url)
            .await
            .unwrap();
        for ddl in [
            "CREATE TABLE store (tid INTEGER PRIMARY KEY, name TEXT)",
            "CREATE TABLE num_crowd (recordtime TEXT, in_num INTEGER, out_num INTEGER, position TEXT, storeid INTEGER)",
            "CREATE TABLE ErrLog (ID INTEGER, storeid INTEGER, DeviceCode INTEGER, LogTime TEXT, Errorcode INTEGER, ErrorMessage TEXT)",
        ] {
            sqlx::query(ddl).execute(&pool).await.unwrap();
        }
        Self {
            temp,
            source_url,
            pool,
        }
    }

    fn settings(&self, extra: &[(&str, &str)]) -> Arc<Settings> {
        let data_dir = self.temp.path().join("data");
        let mut vars: HashMap<String, String> = HashMap::new();
        vars.insert("SOURCE_DB_URL".into(), self.source_url.clone());
        vars.insert("DATA_DIR".into(), data_dir.display().to_string());
        vars.insert(
            "TABLE_CONFIG_PATH".into(),
            self.temp.path().join("absent.yaml").display().to_string(),
        );
        vars.insert("ETL_RETRY_WAIT_SECS".into(), "0".into());
        for (key, value) in extra {
            vars.insert(key.to_string(), value.to_string());
        }
        Arc::new(Settings::from_lookup(move |key| vars.get(key).cloned()).unwrap())
    }

    async fn add_store(&self, tid: i64, name: &str) {
        sqlx::query("INSERT INTO store (tid, name) VALUES (?, ?)")
            .bind(tid)
            .bind(name)
            .execute(&self.pool)
            .await
            .unwrap();
    }

    async fn add_traffic(&self, recordtime: &str, in_num: i64, storeid: i64) {
        sqlx::query(
            "INSERT INTO num_crowd (recordtime, in_num, out_num, position, storeid) VALUES (?, ?, 1, ' door ', ?)",
        )
        .bind(recordtime)
        .bind(in_num)
        .bind(storeid)
        .execute(&self.pool)
        .await
        .unwrap();
    }

    async fn seed_s1(&self) {
        self.add_store(1, "Central (HN)").await;
        self.add_store(2, "Riverside").await;
        self.add_store(3, "Airport").await;
        self.add_traffic("2024-01-10 10:00:00", 5, 1).await;
        self.add_traffic("2024-01-10 11:00:00", 7, 2).await;
    }
}

fn options(settings: &Settings) -> RunOptions {
    RunOptions {
        clear_cache: false,
        ..RunOptions::from_settings(settings)
    }
}

async fn run(settings: &Arc<Settings>) -> RunSummary {
    Orchestrator::new(Arc::clone(settings))
        .run(&options(settings))
        .await
        .unwrap()
}

fn store(settings: &Settings) -> DbConnection {
    DbConnection::open_duckdb_readonly(&settings.duckdb_path()).unwrap()
}

fn count(settings: &Settings, table: &str) -> i64 {
    store(settings)
        .query_scalar(&format!("SELECT CAST(COUNT(*) AS BIGINT) FROM {}", table), &[])
        .unwrap()
}

fn state(settings: &Settings) -> HashMap<String, String> {
    let raw = std::fs::read_to_string(settings.state_file()).unwrap();
    serde_json::from_str(&raw).unwrap()
}

#[tokio::test]
async fn fresh_incremental_run_loads_all_tables() {
    let h = Harness::new().await;
    h.seed_s1().await;
    let settings = h.settings(&[]);

    let summary = run(&settings).await;
    assert!(summary.is_success(), "{}", summary);
    assert_eq!(summary.total, 3);

    assert_eq!(count(&settings, "dim_stores"), 3);
    assert_eq!(count(&settings, "fact_traffic"), 2);
    assert_eq!(state(&settings)["fact_traffic"], "2024-01-10 11:00:00");
    assert!(!state(&settings).contains_key("dim_stores"));

    let mismatched: i64 = store(&settings)
        .query_scalar(
            "SELECT CAST(COUNT(*) AS BIGINT) FROM fact_traffic \
             WHERE year <> year(recorded_at) OR month <> month(recorded_at)",
            &[],
        )
        .unwrap();
    assert_eq!(mismatched, 0);

    let position: String = store(&settings)
        .query_scalar("SELECT device_position FROM fact_traffic LIMIT 1", &[])
        .unwrap();
    assert_eq!(position, "door");

    assert!(!settings.staging_dir("fact_traffic").exists());
    assert!(!settings.staging_dir("dim_stores").exists());
}

#[tokio::test]
async fn incremental_rerun_appends_only_new_rows() {
    let h = Harness::new().await;
    h.seed_s1().await;
    let settings = h.settings(&[]);
    assert!(run(&settings).await.is_success());

    h.add_traffic("2024-01-10 12:00:00", 9, 1).await;
    let summary = run(&settings).await;
    assert!(summary.is_success(), "{}", summary);

    assert_eq!(count(&settings, "fact_traffic"), 3);
    assert_eq!(count(&settings, "dim_stores"), 3);
    assert_eq!(state(&settings)["fact_traffic"], "2024-01-10 12:00:00");

    let total: i64 = store(&settings)
        .query_scalar("SELECT CAST(SUM(visitors_in) AS BIGINT) FROM fact_traffic", &[])
        .unwrap();
    assert_eq!(total, 21);
}

#[tokio::test]
async fn rerun_without_new_rows_leaves_table_and_state() {
    let h = Harness::new().await;
    h.seed_s1().await;
    let settings = h.settings(&[]);
    assert!(run(&settings).await.is_success());
    let before = state(&settings);

    let summary = run(&settings).await;
    assert!(summary.is_success());
    let traffic = summary
        .outcomes
        .iter()
        .find(|o| o.dest_table == "fact_traffic")
        .unwrap();
    assert_eq!(traffic.publish, PublishOutcome::Skipped);
    assert_eq!(traffic.rows_staged, 0);

    assert_eq!(count(&settings, "fact_traffic"), 2);
    assert_eq!(state(&settings), before);
    assert!(!settings.staging_dir("fact_traffic").exists());
}

#[tokio::test]
async fn outliers_are_scaled_in_normalized_view() {
    let h = Harness::new().await;
    h.add_store(1, "Central").await;
    h.add_traffic("2024-01-10 10:00:00", 10_000, 1).await;
    let settings = h.settings(&[("OUTLIER_THRESHOLD", "100"), ("OUTLIER_SCALE_RATIO", "0.01")]);
    assert!(run(&settings).await.is_success());

    let in_count: i64 = store(&settings)
        .query_scalar("SELECT CAST(in_count AS BIGINT) FROM v_traffic_normalized", &[])
        .unwrap();
    assert_eq!(in_count, 100);

    let raw: i64 = store(&settings)
        .query_scalar("SELECT visitors_in FROM fact_traffic", &[])
        .unwrap();
    assert_eq!(raw, 10_000);
}

#[tokio::test]
async fn negative_counts_are_clamped() {
    let h = Harness::new().await;
    h.add_store(1, "Central").await;
    h.add_traffic("2024-01-10 10:00:00", -3, 1).await;
    let settings = h.settings(&[]);
    assert!(run(&settings).await.is_success());

    let visitors: i64 = store(&settings)
        .query_scalar("SELECT visitors_in FROM fact_traffic", &[])
        .unwrap();
    assert_eq!(visitors, 0);
}

#[tokio::test]
async fn unparseable_timestamp_drops_only_that_row() {
    let h = Harness::new().await;
    h.add_store(1, "Central").await;
    h.add_traffic("2024-01-10 10:00:00", 5, 1).await;
    h.add_traffic("not-a-date", 6, 1).await;
    h.add_traffic("2024-01-10 11:00:00", 7, 1).await;
    let settings = h.settings(&[]);

    let summary = run(&settings).await;
    assert!(summary.is_success(), "{}", summary);
    assert_eq!(count(&settings, "fact_traffic"), 2);
    assert_eq!(state(&settings)["fact_traffic"], "2024-01-10 11:00:00");
}

#[tokio::test]
async fn failed_swap_keeps_previous_table_and_retries_next_run() {
    let h = Harness::new().await;
    h.seed_s1().await;
    let settings = h.settings(&[("ETL_MAX_ATTEMPTS", "1"), ("ETL_CLEANUP_ON_FAILURE", "false")]);
    assert!(run(&settings).await.is_success());
    assert_eq!(count(&settings, "fact_traffic"), 2);

    h.add_traffic("2024-01-10 12:00:00", 9, 1).await;
    let failing = Publisher::new(false).with_step_guard(Arc::new(|step| match step {
        SwapStep::PromoteStaging => Err("injected failure".to_string()),
        _ => Ok(()),
    }));
    let summary = Orchestrator::new(Arc::clone(&settings))
        .with_publisher(failing)
        .run(&options(&settings))
        .await
        .unwrap();
    assert!(!summary.is_success());
    assert!(summary.failed.contains(&"num_crowd".to_string()));

    assert_eq!(count(&settings, "fact_traffic"), 2);
    assert!(!store(&settings).relation_exists("fact_traffic_old").unwrap());
    assert_eq!(state(&settings)["fact_traffic"], "2024-01-10 11:00:00");
    assert!(settings.staging_dir("fact_traffic").exists());

    let summary = run(&settings).await;
    assert!(summary.is_success(), "{}", summary);
    assert_eq!(count(&settings, "fact_traffic"), 3);
    assert_eq!(state(&settings)["fact_traffic"], "2024-01-10 12:00:00");
}

#[tokio::test]
async fn transient_publish_failure_is_retried() {
    let h = Harness::new().await;
    h.seed_s1().await;
    let settings = h.settings(&[("ETL_MAX_ATTEMPTS", "3"), ("ETL_MAX_WORKERS", "1")]);

    let tripped = Arc::new(AtomicBool::new(false));
    let guard_flag = Arc::clone(&tripped);
    let flaky = Publisher::new(true).with_step_guard(Arc::new(move |step| {
        if step == SwapStep::RetireLive && !guard_flag.swap(true, Ordering::SeqCst) {
            Err("transient".to_string())
        } else {
            Ok(())
        }
    }));

    let summary = Orchestrator::new(Arc::clone(&settings))
        .with_publisher(flaky)
        .run(&options(&settings))
        .await
        .unwrap();
    assert!(summary.is_success(), "{}", summary);
    assert!(tripped.load(Ordering::SeqCst));
    assert!(summary.outcomes.iter().any(|o| o.attempts == 2));
    assert_eq!(count(&settings, "dim_stores"), 3);
}

#[tokio::test]
async fn contract_violation_fails_only_its_table() {
    let h = Harness::new().await;
    h.add_store(1, "Central").await;
    sqlx::query("INSERT INTO store (tid, name) VALUES (2, NULL)")
        .execute(&h.pool)
        .await
        .unwrap();
    h.add_traffic("2024-01-10 10:00:00", 5, 1).await;
    let settings = h.settings(&[]);

    let summary = run(&settings).await;
    assert_eq!(summary.failed, vec!["store".to_string()]);
    assert!(summary.succeeded.contains(&"num_crowd".to_string()));

    let rejected: Vec<_> = std::fs::read_dir(settings.rejected_dir("dim_stores"))
        .unwrap()
        .collect();
    assert_eq!(rejected.len(), 1);
    assert_eq!(count(&settings, "fact_traffic"), 1);
}

#[tokio::test]
async fn missing_source_aborts_run() {
    let temp = TempDir::new().unwrap();
    let data_dir = temp.path().display().to_string();
    let yaml = temp.path().join("absent.yaml").display().to_string();
    let settings = Arc::new(
        Settings::from_lookup(move |key| match key {
            "DATA_DIR" => Some(data_dir.clone()),
            "TABLE_CONFIG_PATH" => Some(yaml.clone()),
            _ => None,
        })
        .unwrap(),
    );
    let err = Orchestrator::new(Arc::clone(&settings))
        .run(&options(&settings))
        .await
        .unwrap_err();
    assert!(matches!(err, EtlError::Config(_)));
}
