use std::time::Duration;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use tracing::error;

/// Crate-wide error kinds. Each variant carries enough context for the HTTP
/// mapping; handlers never construct status codes themselves.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{0}")]
    Validation(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("conflict on {field}: {message}")]
    Conflict {
        field: &'static str,
        message: String,
    },

    #[error("no free port in configured range")]
    PortsExhausted,

    #[error("container daemon error: {0}")]
    Driver(String),

    #[error("container no longer exists")]
    Gone,

    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl Error {
    pub fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Error::NotFound(what.into())
    }

    pub fn conflict(field: &'static str, message: impl Into<String>) -> Self {
        Error::Conflict {
            field,
            message: message.into(),
        }
    }
}

impl From<sqlx::Error> for Error {
    fn from(e: sqlx::Error) -> Self {
        Error::Internal(anyhow::Error::new(e).context("database operation failed"))
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            Error::Validation(m) => (StatusCode::BAD_REQUEST, m.clone()),
            Error::NotFound(_) => (StatusCode::NOT_FOUND, self.to_string()),
            Error::Conflict { .. } => (StatusCode::CONFLICT, self.to_string()),
            Error::PortsExhausted => (StatusCode::SERVICE_UNAVAILABLE, self.to_string()),
            // Daemon messages are part of the contract: surface them verbatim.
            Error::Driver(m) => (StatusCode::INTERNAL_SERVER_ERROR, m.clone()),
            Error::Gone => (StatusCode::GONE, self.to_string()),
            Error::Timeout(_) => (StatusCode::GATEWAY_TIMEOUT, self.to_string()),
            Error::Internal(e) => {
                error!(error = %e, "Internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal server error".to_string(),
                )
            }
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
