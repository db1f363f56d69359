//! The query service served on an ephemeral port over a seeded DuckDB file.

use std::collections::HashMap;

use reqwest::StatusCode;
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::sync::oneshot;

use footfall_config::Settings;
use footfall_db::DbConnection;
use footfall_etl::catalog;
use footfall_query::{AppState, TOKEN_HEADER};

const TOKEN: &str = "s3cret-token";

struct Server {
    _temp: TempDir,
    base: String,
    state: AppState,
    client: reqwest::Client,
    _shutdown: oneshot::Sender<()>,
}

impl Server {
    async fn start() -> Self {
        let temp = TempDir::new().unwrap();
        let mut vars: HashMap<String, String> = HashMap::new();
        vars.insert("DATA_DIR".into(), temp.path().join("data").display().to_string());
        vars.insert(
            "TABLE_CONFIG_PATH".into(),
            temp.path().join("absent.yaml").display().to_string(),
        );
        vars.insert("INTERNAL_API_TOKEN".into(), TOKEN.into());
        let settings = Settings::from_lookup(move |key| vars.get(key).cloned()).unwrap();

        seed(&settings);

        let state = AppState::from_settings(&settings);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let (tx, rx) = oneshot::channel::<()>();
        let served = state.clone();
        tokio::spawn(async move {
            footfall_query::serve(listener, served, async {
                let _ = rx.await;
            })
            .await
            .unwrap();
        });

        Self {
            _temp: temp,
            base,
            state,
            client: reqwest::Client::new(),
            _shutdown: tx,
        }
    }

    async fn get(&self, path: &str) -> (StatusCode, Value) {
        let resp = self
            .client
            .get(format!("{}{}", self.base, path))
            .send()
            .await
            .unwrap();
        let status = resp.status();
        (status, resp.json().await.unwrap())
    }

    async fn clear(&self, token: Option<&str>) -> StatusCode {
        let mut req = self.client.post(format!("{}/admin/clear-cache", self.base));
        if let Some(token) = token {
            req = req.header(TOKEN_HEADER, token);
        }
        req.send().await.unwrap().status()
    }
}

fn seed(settings: &Settings) {
    let conn = DbConnection::open_duckdb(&settings.duckdb_path()).unwrap();
    catalog::ensure_base_tables(&conn).unwrap();
    conn.execute_batch(
        "INSERT INTO dim_stores VALUES (1, 'Store A (Floor 1)'), (2, 'Store B');
         INSERT INTO fact_traffic VALUES
             (TIMESTAMP '2024-01-09 12:00:00', 20, 5, 'door', 1, 2024, 1),
             (TIMESTAMP '2024-01-10 10:15:00', 10, 4, 'door', 1, 2024, 1),
             (TIMESTAMP '2024-01-10 10:45:00', 5, 1, 'door', 1, 2024, 1),
             (TIMESTAMP '2024-01-10 14:00:00', 7, 2, 'door', 2, 2024, 1),
             (TIMESTAMP '2024-01-10 16:00:00', 500, 1, 'door', 2, 2024, 1),
             (TIMESTAMP '2024-01-11 01:30:00', 3, 0, 'door', 2, 2024, 1);
         INSERT INTO fact_errors VALUES
             (1, 1, 7, TIMESTAMP '2024-01-10 11:00:00', 500, 'sensor offline', 2024, 1),
             (2, 9, 7, TIMESTAMP '2024-01-10 12:00:00', 501, 'unknown store', 2024, 1);",
    )
    .unwrap();
    catalog::create_normalized_view(&conn, settings).unwrap();
    conn.execute_batch("CHECKPOINT").unwrap();
}

const DAY: &str = "period=day&start_date=2024-01-10&end_date=2024-01-10";

#[tokio::test]
async fn health_and_stores() {
    let server = Server::start().await;
    let (status, body) = server.get("/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"status": "ok"}));

    let (status, body) = server.get("/stores").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        body,
        json!([
            {"store_id": 1, "store_name": "Store A (Floor 1)"},
            {"store_id": 2, "store_name": "Store B"},
        ])
    );
}

#[tokio::test]
async fn metrics_for_one_business_day() {
    let server = Server::start().await;
    let (status, body) = server.get(&format!("/stats/metrics?{}", DAY)).await;
    assert_eq!(status, StatusCode::OK);
    // The 500-visitor outlier scales to 0; the 01:30 row belongs to the 10th.
    assert_eq!(
        body,
        json!({
            "total_in": 25,
            "average_in": 6,
            "peak_time": "10:00",
            "current_occupancy": 17,
            "busiest_store": "Store A",
            "growth": 25.0,
        })
    );
}

#[tokio::test]
async fn metrics_for_one_store_and_empty_window() {
    let server = Server::start().await;
    let (_, body) = server
        .get(&format!("/stats/metrics?{}&store=Store%20B", DAY))
        .await;
    assert_eq!(body["total_in"], json!(10));
    assert_eq!(body["busiest_store"], json!("Store B"));
    // Nothing for Store B on the 9th.
    assert_eq!(body["growth"], json!(100.0));

    let (status, body) = server
        .get("/stats/metrics?period=day&start_date=2023-01-01&end_date=2023-01-01")
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        body,
        json!({
            "total_in": 0,
            "average_in": 0,
            "peak_time": "--:--",
            "current_occupancy": 0,
            "busiest_store": "N/A",
            "growth": 0.0,
        })
    );
}

#[tokio::test]
async fn trend_and_distribution() {
    let server = Server::start().await;
    let (status, body) = server.get(&format!("/stats/trend?{}", DAY)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        body,
        json!([
            {"x": "2024-01-10 10:00", "y": 15},
            {"x": "2024-01-10 14:00", "y": 7},
            {"x": "2024-01-10 16:00", "y": 0},
            {"x": "2024-01-11 01:00", "y": 3},
        ])
    );

    let (_, body) = server
        .get(&format!("/stats/store-distribution?{}", DAY))
        .await;
    assert_eq!(
        body,
        json!([
            {"x": "Store A (Floor 1)", "y": 15},
            {"x": "Store B", "y": 10},
        ])
    );
}

#[tokio::test]
async fn details_are_paginated_newest_first() {
    let server = Server::start().await;
    let (status, body) = server
        .get(&format!("/stats/details?{}&page=1&page_size=2", DAY))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total_records"], json!(4));
    assert_eq!(body["page"], json!(1));
    assert_eq!(body["page_size"], json!(2));
    assert_eq!(
        body["data"],
        json!([
            {"period": "2024-01-11 01:00", "total_in": 3, "pct_change": 0.0},
            {"period": "2024-01-10 16:00", "total_in": 0, "pct_change": -100.0},
        ])
    );
    assert_eq!(body["summary"], json!({"total_sum": 25, "average_in": 6}));

    let (_, body) = server
        .get(&format!("/stats/details?{}&page=2&page_size=2", DAY))
        .await;
    assert_eq!(
        body["data"],
        json!([
            {"period": "2024-01-10 14:00", "total_in": 7, "pct_change": -53.3},
            {"period": "2024-01-10 10:00", "total_in": 15, "pct_change": 0.0},
        ])
    );
}

#[tokio::test]
async fn error_logs_and_latest_record_time() {
    let server = Server::start().await;
    let (status, body) = server.get("/stats/error-logs?limit=10").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        body,
        json!([
            {"id": 2, "store_name": null, "log_time": "2024-01-10 12:00:00", "error_code": 501, "error_message": "unknown store"},
            {"id": 1, "store_name": "Store A (Floor 1)", "log_time": "2024-01-10 11:00:00", "error_code": 500, "error_message": "sensor offline"},
        ])
    );

    let (_, body) = server.get("/stats/latest-record-time").await;
    assert_eq!(body, json!({"latest_record_time": "2024-01-11T01:30:00"}));
}

#[tokio::test]
async fn invalid_parameters_are_400_with_detail() {
    let server = Server::start().await;
    for query in [
        "period=hour&start_date=2024-01-10&end_date=2024-01-10",
        "period=day&start_date=2024-13-01&end_date=2024-01-10",
        "period=day&start_date=2024-01-10&end_date=2024-01-01",
        "period=day&end_date=2024-01-10",
    ] {
        let (status, body) = server.get(&format!("/stats/trend?{}", query)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{}", query);
        assert!(body["detail"].is_string(), "{}", query);
    }

    let (status, _) = server
        .get(&format!("/stats/details?{}&page_size=501", DAY))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn clear_cache_requires_the_token() {
    let server = Server::start().await;
    server.get(&format!("/stats/metrics?{}", DAY)).await;
    server.get(&format!("/stats/trend?{}", DAY)).await;
    assert_eq!(server.state.service.cache().len(), 2);

    // Cached responses are served again without a new entry.
    server.get(&format!("/stats/trend?{}", DAY)).await;
    assert_eq!(server.state.service.cache().len(), 2);

    assert_eq!(server.clear(None).await, StatusCode::UNAUTHORIZED);
    assert_eq!(server.clear(Some("wrong")).await, StatusCode::UNAUTHORIZED);
    assert_eq!(server.state.service.cache().len(), 2);

    assert_eq!(server.clear(Some(TOKEN)).await, StatusCode::NO_CONTENT);
    assert!(server.state.service.cache().is_empty());
}

#[tokio::test]
async fn missing_store_is_a_500_with_generic_detail() {
    let temp = TempDir::new().unwrap();
    let mut vars: HashMap<String, String> = HashMap::new();
    vars.insert("DATA_DIR".into(), temp.path().join("data").display().to_string());
    vars.insert(
        "TABLE_CONFIG_PATH".into(),
        temp.path().join("absent.yaml").display().to_string(),
    );
    let settings = Settings::from_lookup(move |key| vars.get(key).cloned()).unwrap();
    let state = AppState::from_settings(&settings);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = format!("http://{}", listener.local_addr().unwrap());
    tokio::spawn(footfall_query::serve(listener, state, std::future::pending()));

    let resp = reqwest::get(format!("{}/stores", base)).await.unwrap();
    assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body: Value = resp.json().await.unwrap();
    let detail = body["detail"].as_str().unwrap();
    assert!(!detail.contains("duckdb"), "{}", detail);
}
