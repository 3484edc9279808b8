//! Error types for chatrelay.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

/// Result type alias for chatrelay operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for chatrelay.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Request body too large: {0}")]
    PayloadTooLarge(String),

    /// The upstream provider answered with a failure status.
    #[error("Upstream error ({status}): {message}")]
    Upstream { status: u16, message: String },

    /// The upstream stream carried an error payload after it had started.
    #[error("Upstream stream error: {0}")]
    UpstreamStream(String),

    #[error("Upstream request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{0}")]
    Unavailable(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl Error {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Error::BadRequest(_) => StatusCode::BAD_REQUEST,
            Error::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            Error::Upstream { .. } => StatusCode::BAD_GATEWAY,
            Error::UpstreamStream(_) => StatusCode::BAD_GATEWAY,
            Error::Http(_) => StatusCode::BAD_GATEWAY,
            Error::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Error::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = serde_json::json!({ "error": self.to_string() });
        (status, axum::Json(body)).into_response()
    }
}
