//! Error types for goblog
//!
//! All errors in the application are converted to `AppError`,
//! which implements `IntoResponse` for proper HTTP error responses.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Application-wide error type
///
/// Request handlers return it directly; background loops log it and move on.
#[derive(Debug, Error)]
pub enum AppError {
    /// Resource not found (404)
    #[error("Resource not found")]
    NotFound,

    /// Authentication required (401)
    #[error("Authentication required")]
    Unauthorized,

    /// Signature verification failed (401)
    #[error("Invalid signature: {0}")]
    InvalidSignature(String),

    /// Access denied (403)
    #[error("Access denied")]
    Forbidden,

    /// Malformed input (400)
    #[error("Validation error: {0}")]
    Validation(String),

    /// Caller passed an argument that can never succeed (400)
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Unprocessable entity (422)
    #[error("Unprocessable entity: {0}")]
    Unprocessable(String),

    /// Database error (500)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// HTTP client error (502)
    #[error("HTTP client error: {0}")]
    HttpClient(#[from] reqwest::Error),

    /// Federation error (502)
    #[error("Federation error: {0}")]
    Federation(String),

    /// Remote side failed in a way worth retrying (503)
    #[error("Transient failure: {0}")]
    Transient(String),

    /// Remote side rejected us for good (502)
    #[error("Permanent failure: {0}")]
    Permanent(String),

    /// Configuration error (500)
    #[error("Configuration error: {0}")]
    Config(String),

    /// ACME protocol error (502)
    #[error("ACME error: {0}")]
    Acme(String),

    /// TLS / certificate handling error (500)
    #[error("TLS error: {0}")]
    Tls(String),

    /// Internal server error (500)
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    /// Short machine-readable code used in JSON bodies and metrics.
    pub fn code(&self) -> &'static str {
        match self {
            AppError::NotFound => "not_found",
            AppError::Unauthorized => "unauthorized",
            AppError::InvalidSignature(_) => "invalid_signature",
            AppError::Forbidden => "forbidden",
            AppError::Validation(_) => "validation",
            AppError::InvalidArgument(_) => "invalid_argument",
            AppError::Unprocessable(_) => "unprocessable",
            AppError::Database(_) => "database",
            AppError::HttpClient(_) => "http_client",
            AppError::Federation(_) => "federation",
            AppError::Transient(_) => "transient",
            AppError::Permanent(_) => "permanent",
            AppError::Config(_) => "config",
            AppError::Acme(_) => "acme",
            AppError::Tls(_) => "tls",
            AppError::Internal(_) => "internal",
        }
    }

    /// HTTP status the error maps to
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::NotFound => StatusCode::NOT_FOUND,
            AppError::Unauthorized | AppError::InvalidSignature(_) => StatusCode::UNAUTHORIZED,
            AppError::Forbidden => StatusCode::FORBIDDEN,
            AppError::Validation(_) | AppError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            AppError::Unprocessable(_) => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::HttpClient(_)
            | AppError::Federation(_)
            | AppError::Permanent(_)
            | AppError::Acme(_) => StatusCode::BAD_GATEWAY,
            AppError::Transient(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Database(_)
            | AppError::Config(_)
            | AppError::Tls(_)
            | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::Config(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::Validation(format!("Invalid JSON: {}", err))
    }
}

impl From<instant_acme::Error> for AppError {
    fn from(err: instant_acme::Error) -> Self {
        AppError::Acme(err.to_string())
    }
}

impl From<rustls::Error> for AppError {
    fn from(err: rustls::Error) -> Self {
        AppError::Tls(err.to_string())
    }
}

impl IntoResponse for AppError {
    /// Convert error to HTTP response
    ///
    /// Internal details of database and internal errors are logged, not returned.
    fn into_response(self) -> Response {
        use axum::Json;

        let status = self.status_code();
        let error_message = match &self {
            AppError::Database(_) => "Database error".to_string(),
            AppError::Internal(_) => "Internal server error".to_string(),
            other => other.to_string(),
        };

        if status.is_server_error() {
            tracing::error!(error = %self, code = self.code(), "Request failed");
        } else {
            tracing::debug!(error = %self, code = self.code(), "Request rejected");
        }

        use crate::metrics::ERRORS_TOTAL;
        ERRORS_TOTAL.with_label_values(&[self.code()]).inc();

        let body = Json(serde_json::json!({
            "error": error_message,
        }));

        (status, body).into_response()
    }
}

/// Result type alias using AppError
pub type Result<T> = std::result::Result<T, AppError>;
