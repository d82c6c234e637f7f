//! Error types for the control surface.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use claw_logalert::LogAlertError;
use serde::Serialize;
use thiserror::Error;

/// Result type alias for server operations.
pub type ServerResult<T> = Result<T, ServerError>;

/// Errors that can occur in the control surface.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Failed to bind to the specified address.
    #[error("failed to bind to {0}: {1}")]
    BindFailed(std::net::SocketAddr, std::io::Error),

    /// Resource not found.
    #[error("{0} not found: {1}")]
    NotFound(String, String),

    /// Invalid request parameters.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The engine rejected the operation.
    #[error(transparent)]
    Engine(#[from] LogAlertError),

    /// Internal server error.
    #[error("internal error: {0}")]
    Internal(String),
}

/// JSON error response body.
#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
    message: String,
}

fn engine_status(err: &LogAlertError) -> (StatusCode, &'static str) {
    match err {
        LogAlertError::Configuration { .. } | LogAlertError::InvalidRule { .. } => {
            (StatusCode::BAD_REQUEST, "configuration")
        }
        LogAlertError::Query { .. }
        | LogAlertError::Delivery { .. }
        | LogAlertError::Source(_)
        | LogAlertError::Queue(_) => (StatusCode::BAD_GATEWAY, "upstream"),
        LogAlertError::UnknownStrategy { .. } | LogAlertError::Serialization(_) => {
            (StatusCode::INTERNAL_SERVER_ERROR, "internal_error")
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let (status, error_type) = match &self {
            Self::NotFound(_, _) => (StatusCode::NOT_FOUND, "not_found"),
            Self::InvalidRequest(_) => (StatusCode::BAD_REQUEST, "invalid_request"),
            Self::Engine(err) => engine_status(err),
            Self::BindFailed(_, _) | Self::Internal(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "internal_error")
            }
        };

        let body = ErrorResponse {
            error: error_type.to_string(),
            message: self.to_string(),
        };

        let json = serde_json::to_string(&body).unwrap_or_else(|_| {
            r#"{"error":"internal_error","message":"failed to serialize error"}"#.to_string()
        });

        (status, [("content-type", "application/json")], json).into_response()
    }
}
