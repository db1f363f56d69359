use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::error;

use footfall_db::BackendError;

const EXECUTION_DETAIL: &str = "Internal error while querying analytics data";

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    QueryParamInvalid(String),

    #[error("query failed: {0}")]
    QueryExecution(String),

    #[error("invalid or missing internal token")]
    AuthFailed,
}

impl ApiError {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::QueryParamInvalid(message.into())
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::QueryParamInvalid(_) => StatusCode::BAD_REQUEST,
            Self::QueryExecution(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::AuthFailed => StatusCode::UNAUTHORIZED,
        }
    }
}

impl From<BackendError> for ApiError {
    fn from(err: BackendError) -> Self {
        Self::QueryExecution(err.to_string())
    }
}

impl From<tokio::task::JoinError> for ApiError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::QueryExecution(format!("query task failed: {}", err))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let detail = match &self {
            Self::QueryExecution(message) => {
                error!("Query execution failed: {}", message);
                EXECUTION_DETAIL.to_string()
            }
            other => other.to_string(),
        };
        (status, Json(json!({ "detail": detail }))).into_response()
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;
