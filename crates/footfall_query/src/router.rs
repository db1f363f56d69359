//! HTTP routes of the query service.

use std::future::Future;
use std::sync::Arc;

use axum::extract::rejection::QueryRejection;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{info, warn};

use footfall_config::Settings;

use crate::error::{ApiError, ApiResult};
use crate::params::{error_log_limit, ErrorLogParams, Page, StatsFilter, StatsParams};
use crate::service::{Details, ErrorLog, Metrics, Point, QueryService, Store};

pub const CLEAR_CACHE_PATH: &str = "/admin/clear-cache";
pub const TOKEN_HEADER: &str = "x-internal-token";

#[derive(Clone)]
pub struct AppState {
    pub service: QueryService,
    /// Expected admin token; `None` rejects every admin call.
    pub admin_token: Option<Arc<str>>,
}

impl AppState {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            service: QueryService::from_settings(settings),
            admin_token: settings.internal_api_token.as_deref().map(Arc::from),
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/stores", get(stores))
        .route("/stats/metrics", get(metrics))
        .route("/stats/trend", get(trend))
        .route("/stats/store-distribution", get(store_distribution))
        .route("/stats/details", get(details))
        .route("/stats/error-logs", get(error_logs))
        .route("/stats/latest-record-time", get(latest_record_time))
        .route(CLEAR_CACHE_PATH, post(clear_cache))
        .with_state(state)
}

/// Serve until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, state: AppState, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    if let Ok(addr) = listener.local_addr() {
        info!("Query service listening on http://{}", addr);
    }
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
}

fn stats_params(query: Result<Query<StatsParams>, QueryRejection>) -> ApiResult<StatsParams> {
    query
        .map(|Query(params)| params)
        .map_err(|rejection| ApiError::invalid(rejection.body_text()))
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn stores(State(state): State<AppState>) -> ApiResult<Json<Vec<Store>>> {
    Ok(Json(state.service.stores().await?))
}

async fn metrics(
    State(state): State<AppState>,
    query: Result<Query<StatsParams>, QueryRejection>,
) -> ApiResult<Json<Metrics>> {
    let filter = StatsFilter::from_params(&stats_params(query)?)?;
    Ok(Json(state.service.metrics(&filter).await?))
}

async fn trend(
    State(state): State<AppState>,
    query: Result<Query<StatsParams>, QueryRejection>,
) -> ApiResult<Json<Vec<Point>>> {
    let filter = StatsFilter::from_params(&stats_params(query)?)?;
    Ok(Json(state.service.trend(&filter).await?))
}

async fn store_distribution(
    State(state): State<AppState>,
    query: Result<Query<StatsParams>, QueryRejection>,
) -> ApiResult<Json<Vec<Point>>> {
    let filter = StatsFilter::from_params(&stats_params(query)?)?;
    Ok(Json(state.service.store_distribution(&filter).await?))
}

async fn details(
    State(state): State<AppState>,
    query: Result<Query<StatsParams>, QueryRejection>,
) -> ApiResult<Json<Details>> {
    let params = stats_params(query)?;
    let filter = StatsFilter::from_params(&params)?;
    let page = Page::from_params(&params)?;
    Ok(Json(state.service.details(&filter, page).await?))
}

async fn error_logs(
    State(state): State<AppState>,
    query: Result<Query<ErrorLogParams>, QueryRejection>,
) -> ApiResult<Json<Vec<ErrorLog>>> {
    let Query(params) = query.map_err(|rejection| ApiError::invalid(rejection.body_text()))?;
    let limit = error_log_limit(&params)?;
    Ok(Json(state.service.error_logs(limit).await?))
}

async fn latest_record_time(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    let latest = state.service.latest_record_time().await?;
    Ok(Json(json!({ "latest_record_time": latest })))
}

async fn clear_cache(State(state): State<AppState>, headers: HeaderMap) -> ApiResult<StatusCode> {
    let presented = headers
        .get(TOKEN_HEADER)
        .map(|value| value.as_bytes())
        .unwrap_or_default();
    let authorized = match &state.admin_token {
        Some(expected) => constant_time_eq(expected.as_bytes(), presented),
        None => false,
    };
    if !authorized {
        warn!("Rejected cache clear with invalid or missing token");
        return Err(ApiError::AuthFailed);
    }
    let removed = state.service.clear_cache();
    info!(removed, "Query cache cleared");
    Ok(StatusCode::NO_CONTENT)
}

/// Compare without short-circuiting on the first differing byte.
/// Timing depends only on the expected token's length, so that length is
/// all it can leak.
fn constant_time_eq(expected: &[u8], presented: &[u8]) -> bool {
    let mut diff = expected.len() ^ presented.len();
    for (i, byte) in expected.iter().enumerate() {
        let other = presented.get(i).copied().unwrap_or(0);
        diff |= usize::from(byte ^ other);
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_comparison() {
        assert!(constant_time_eq(b"secret", b"secret"));
        assert!(!constant_time_eq(b"secret", b"secreT"));
        assert!(!constant_time_eq(b"secret", b"secret2"));
        assert!(!constant_time_eq(b"secret", b""));
    }
}
