//! Typed HTTP error taxonomy (spec §7): a closed enum with a manual
//! `Display` + `Error` impl instead of stringly-typed status codes, so
//! every handler's failure mode is visible at a glance.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

#[derive(Debug)]
pub enum ApiError {
    Validation(String),
    NotFound(String),
    Conflict(String),
    /// Queue/object-storage unconfigured or a reapply guard rejected the
    /// request; `manual_command` hints at the operator remediation step.
    ServiceUnavailable { message: String, manual_command: Option<String> },
    Internal(anyhow::Error),
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ApiError::Validation(msg) => write!(f, "validation error: {msg}"),
            ApiError::NotFound(msg) => write!(f, "not found: {msg}"),
            ApiError::Conflict(msg) => write!(f, "conflict: {msg}"),
            ApiError::ServiceUnavailable { message, .. } => write!(f, "service unavailable: {message}"),
            ApiError::Internal(e) => write!(f, "internal error: {e}"),
        }
    }
}

impl std::error::Error for ApiError {}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        ApiError::Internal(e)
    }
}

#[derive(Serialize)]
struct ErrorBody {
    code: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    manual_command: Option<String>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message, manual_command) = match self {
            ApiError::Validation(msg) => (StatusCode::BAD_REQUEST, "validation_error", msg, None),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg, None),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, "conflict", msg, None),
            ApiError::ServiceUnavailable { message, manual_command } => {
                (StatusCode::SERVICE_UNAVAILABLE, "service_unavailable", message, manual_command)
            }
            ApiError::Internal(e) => {
                tracing::error!(error = %e, "internal error");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", "an internal error occurred".to_string(), None)
            }
        };

        (status, Json(ErrorBody { code, message, manual_command })).into_response()
    }
}
