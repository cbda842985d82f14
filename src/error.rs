//! # Error Handling
//!
//! Unified error handling for the sync scheduler daemon: the internal
//! [`SyncError`] taxonomy returned through the request façade, and the
//! problem+json [`ApiError`] shape it maps to on the HTTP surface.

use axum::{
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;
use utoipa::ToSchema;

/// Scheduler error taxonomy. `Ok(())` stands in for the `None` kind.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
    #[error("sync job quota exceeded for package")]
    QuotaExceeded,
    #[error("sync job already in progress")]
    AlreadyInProgress,
    #[error("permission denied")]
    PermissionDenied,
    #[error("I/O failure: {0}")]
    Io(String),
    #[error("out of memory")]
    OutOfMemory,
    #[error("invalid operation: {0}")]
    InvalidOperation(String),
    #[error("internal error: {0}")]
    System(String),
    #[error("no sync adapter registered for {0}")]
    SyncAdapterNotFound(String),
    #[error("unknown remote error")]
    Unknown,
}

impl SyncError {
    /// Stable SCREAMING_SNAKE_CASE code for programmatic handling.
    pub fn code(&self) -> &'static str {
        match self {
            SyncError::InvalidParameter(_) => "INVALID_PARAMETER",
            SyncError::QuotaExceeded => "QUOTA_EXCEEDED",
            SyncError::AlreadyInProgress => "ALREADY_IN_PROGRESS",
            SyncError::PermissionDenied => "PERMISSION_DENIED",
            SyncError::Io(_) => "IO_ERROR",
            SyncError::OutOfMemory => "OUT_OF_MEMORY",
            SyncError::InvalidOperation(_) => "INVALID_OPERATION",
            SyncError::System(_) => "INTERNAL_SERVER_ERROR",
            SyncError::SyncAdapterNotFound(_) => "SYNC_ADAPTER_NOT_FOUND",
            SyncError::Unknown => "UNKNOWN",
        }
    }

    /// HTTP status the error surfaces with on the request façade.
    pub fn status(&self) -> StatusCode {
        match self {
            SyncError::InvalidParameter(_) => StatusCode::BAD_REQUEST,
            SyncError::QuotaExceeded => StatusCode::TOO_MANY_REQUESTS,
            SyncError::AlreadyInProgress => StatusCode::CONFLICT,
            SyncError::PermissionDenied => StatusCode::FORBIDDEN,
            SyncError::InvalidOperation(_) => StatusCode::CONFLICT,
            SyncError::SyncAdapterNotFound(_) => StatusCode::NOT_FOUND,
            SyncError::Io(_)
            | SyncError::OutOfMemory
            | SyncError::System(_)
            | SyncError::Unknown => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::Io(err.to_string())
    }
}

/// Unified API error response structure (problem+json).
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ApiError {
    /// HTTP status code for the response
    #[serde(skip_serializing, skip_deserializing)]
    pub status: StatusCode,
    /// Error code for programmatic handling
    pub code: String,
    /// Human-readable error message
    pub message: String,
    /// Correlation trace ID for debugging (optional)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
}

impl ApiError {
    pub fn new<S: Into<String>>(status: StatusCode, code: S, message: S) -> Self {
        Self {
            status,
            code: code.into(),
            message: message.into(),
            trace_id: None,
        }
    }

    /// Attach the caller's `x-request-id` as the correlation trace id.
    pub fn with_trace_from(mut self, headers: &HeaderMap) -> Self {
        self.trace_id = headers
            .get("x-request-id")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());
        self
    }
}

impl From<SyncError> for ApiError {
    fn from(err: SyncError) -> Self {
        ApiError::new(err.status(), err.code().to_string(), err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut headers = HeaderMap::new();
        headers.insert(
            "content-type",
            HeaderValue::from_static("application/problem+json"),
        );
        (self.status, headers, axum::Json(self)).into_response()
    }
}
