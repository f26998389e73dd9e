use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;
use tracing::error;

pub type Result<T> = std::result::Result<T, ServiceError>;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("authentication failed")]
    Auth,

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("unsupported operation: {0}")]
    Unsupported(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("busy: {0}")]
    Busy(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl ServiceError {
    pub fn invalid(message: impl Into<String>) -> Self {
        ServiceError::InvalidRequest(message.into())
    }

    pub fn unsupported(message: impl Into<String>) -> Self {
        ServiceError::Unsupported(message.into())
    }

    /// Prefixes the message of client-facing errors with context from an
    /// enclosing compilation step.
    pub fn context(self, context: &str) -> Self {
        match self {
            ServiceError::InvalidRequest(msg) => {
                ServiceError::InvalidRequest(format!("{context}: {msg}"))
            }
            ServiceError::Unsupported(msg) => ServiceError::Unsupported(format!("{context}: {msg}")),
            other => other,
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            ServiceError::Auth => StatusCode::UNAUTHORIZED,
            ServiceError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ServiceError::Unsupported(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ServiceError::NotFound(_) => StatusCode::NOT_FOUND,
            ServiceError::AlreadyExists(_) | ServiceError::Busy(_) => StatusCode::CONFLICT,
            ServiceError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            ServiceError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status();

        if status.is_server_error() {
            error!(error = %self, "request failed");
        }

        let body = ErrorBody {
            error: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}
