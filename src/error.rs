//! Error types for the rasterization gateway
//!
//! One application-wide taxonomy, mapped onto HTTP statuses at the axum
//! boundary. Error bodies are JSON `{"error": {"title", "detail"}}`; the
//! detail carries the request correlation id and never includes secrets.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

use crate::fetch::DownloadError;
use crate::raster::RenderError;

/// Application-wide result type
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error taxonomy
#[derive(Error, Debug)]
pub enum AppError {
    /// Malformed input from the client
    #[error("{0}")]
    Client(String),

    /// Expired token TTL
    #[error("Expired token: {0}")]
    Unauthorized(String),

    /// Signature did not verify
    #[error("Invalid signature")]
    Forbidden,

    /// The origin reports absence, or the page is out of range
    #[error("Not found: {0}")]
    NotFound(String),

    /// Timeout or saturated renderer; the client may retry
    #[error("Temporarily unavailable: {0}")]
    Transient(String),

    /// Programming fault or unexpected collaborator failure
    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::Client(_) => StatusCode::BAD_REQUEST,
            AppError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            AppError::Forbidden => StatusCode::FORBIDDEN,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Transient(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Title safe to expose to the client.
    pub fn title(&self) -> String {
        match self {
            AppError::Client(msg) => msg.clone(),
            AppError::Unauthorized(_) => "Expired token".to_string(),
            AppError::Forbidden => "Invalid signature".to_string(),
            AppError::NotFound(msg) => msg.clone(),
            AppError::Transient(_) => "Temporarily unavailable".to_string(),
            AppError::Internal(_) => "Internal server error".to_string(),
        }
    }
}

impl From<DownloadError> for AppError {
    fn from(err: DownloadError) -> Self {
        match err {
            DownloadError::NotFound => AppError::NotFound("Document not found".to_string()),
            DownloadError::Client(msg) => AppError::Client(msg),
            DownloadError::Transient(msg) => AppError::Transient(msg),
            DownloadError::Fatal(msg) => AppError::Internal(msg),
        }
    }
}

impl From<RenderError> for AppError {
    fn from(err: RenderError) -> Self {
        match err {
            RenderError::BadPage => AppError::NotFound("page not found".to_string()),
            RenderError::Timeout => AppError::Transient("page rendering timed out".to_string()),
            RenderError::Busy => AppError::Transient("renderer busy".to_string()),
            RenderError::Stopped => {
                AppError::Internal("renderer stopped underneath the request".to_string())
            }
            RenderError::Engine(msg) => AppError::Internal(msg),
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorContent,
}

#[derive(Serialize)]
struct ErrorContent {
    title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<String>,
}

/// Build the error response, tagging the detail with the request id so that
/// clients can quote it back at us.
pub fn error_response(err: &AppError, request_id: &str) -> Response {
    let status = err.status();
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        tracing::error!(request_id, error = %err, "internal error during request");
    }
    let body = ErrorBody {
        error: ErrorContent {
            title: err.title(),
            detail: Some(format!("request id '{request_id}'")),
        },
    };
    (status, Json(body)).into_response()
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorContent {
                title: self.title(),
                detail: None,
            },
        };
        (self.status(), Json(body)).into_response()
    }
}
