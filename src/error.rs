use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::fmt;

/// Error taxonomy for the registry/cache/pool/resilience core.
///
/// Mirrors the network/protocol/resource/internal/cancelled classes from
/// the error handling design: retryability and HTTP status both derive
/// from which variant an error takes, not from a side table.
#[derive(Debug, Clone)]
pub enum AppError {
    /// Connection refused/reset, read/write timeout. Retryable.
    Network(String),
    /// Malformed message, unknown verb, schema mismatch. Not retryable.
    Protocol(String),
    /// Pool timeout, temporary capacity exhaustion. Retryable.
    Resource(String),
    /// Precondition violation, invariant breach, configuration error.
    Internal(String),
    /// Cooperative shutdown or cancellation. Not retryable by the caller.
    Cancelled,
    /// The circuit breaker refused the call without invoking the operation.
    BreakerOpen(String),
    /// An operation did not complete within its allotted timeout.
    Timeout(String),
    NotFound(String),
    BadRequest(String),
    Validation(String),
    ConfigurationError(String),
    ServiceUnavailable(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Network(msg) => write!(f, "network error: {}", msg),
            AppError::Protocol(msg) => write!(f, "protocol error: {}", msg),
            AppError::Resource(msg) => write!(f, "resource error: {}", msg),
            AppError::Internal(msg) => write!(f, "internal error: {}", msg),
            AppError::Cancelled => write!(f, "operation cancelled"),
            AppError::BreakerOpen(msg) => write!(f, "circuit breaker open: {}", msg),
            AppError::Timeout(msg) => write!(f, "timeout: {}", msg),
            AppError::NotFound(msg) => write!(f, "not found: {}", msg),
            AppError::BadRequest(msg) => write!(f, "bad request: {}", msg),
            AppError::Validation(msg) => write!(f, "validation error: {}", msg),
            AppError::ConfigurationError(msg) => write!(f, "configuration error: {}", msg),
            AppError::ServiceUnavailable(msg) => write!(f, "service unavailable: {}", msg),
        }
    }
}

impl std::error::Error for AppError {}

impl AppError {
    /// Default retryability per the error handling design: network/resource
    /// classes are retryable, everything else is not.
    pub fn is_retryable(&self) -> bool {
        matches!(self, AppError::Network(_) | AppError::Resource(_) | AppError::Timeout(_))
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            AppError::Network(msg) => {
                tracing::error!("network error: {}", msg);
                (StatusCode::BAD_GATEWAY, msg.clone())
            }
            AppError::Protocol(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            AppError::Resource(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg.clone()),
            AppError::Internal(msg) => {
                tracing::error!("internal error: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, "internal server error".to_string())
            }
            AppError::Cancelled => (StatusCode::SERVICE_UNAVAILABLE, "cancelled".to_string()),
            AppError::BreakerOpen(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg.clone()),
            AppError::Timeout(msg) => (StatusCode::REQUEST_TIMEOUT, msg.clone()),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            AppError::Validation(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            AppError::ConfigurationError(msg) => {
                tracing::error!("configuration error: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, "internal server error".to_string())
            }
            AppError::ServiceUnavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg.clone()),
        };

        let body = Json(json!({
            "error": message,
            "status": status.as_u16(),
        }));

        (status, body).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;
