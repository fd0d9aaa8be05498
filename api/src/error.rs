use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, AppError>;

/// Failures surfaced by the core to request handlers.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("music sharing is disabled")]
    SharingDisabled,

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// The provider refused to refresh or exchange a token.
    #[error("upstream auth failed: {0}")]
    AuthFailed(String),

    /// The provider API errored or timed out.
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// Never shown to end users; callers treat it as a cache miss.
    #[error("cache unavailable: {0}")]
    CacheUnavailable(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("storage error: {0}")]
    Storage(#[from] anyhow::Error),
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::SharingDisabled => StatusCode::FORBIDDEN,
            AppError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::AuthFailed(_) | AppError::UpstreamUnavailable(_) => StatusCode::BAD_GATEWAY,
            AppError::CacheUnavailable(_) | AppError::Storage(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match &self {
            AppError::Storage(e) => {
                tracing::error!("storage failure: {:#}", e);
                "internal error".to_string()
            }
            AppError::CacheUnavailable(e) => {
                tracing::error!("cache failure reached a handler: {}", e);
                "internal error".to_string()
            }
            other => {
                if status.is_server_error() {
                    tracing::error!("{}", other);
                }
                other.to_string()
            }
        };

        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

/// Errors from the expiring key/value store.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("value encoding failed: {0}")]
    Encoding(#[from] serde_json::Error),
}

/// Errors from the music provider boundary.
#[derive(Error, Debug)]
pub enum UpstreamError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("provider returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("malformed provider response: {0}")]
    Malformed(String),
}

impl UpstreamError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, UpstreamError::Http(e) if e.is_timeout())
    }
}
