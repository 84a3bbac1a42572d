//! Error types for marquee-ingest
//!
//! Three layers:
//! - `SourceError`: a call to an external catalog or ceremony source failed
//! - `IngestError`: a unit of import work failed
//! - `ApiError`: an operator API request failed (rendered as JSON)

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Failure talking to an external source
#[derive(Debug, Error, Clone)]
pub enum SourceError {
    /// Connection, DNS or timeout failure
    #[error("Network error: {0}")]
    Network(String),

    /// Source asked us to slow down (429 / 503)
    #[error("Rate limit exceeded")]
    RateLimited,

    /// Source has no record for the requested id
    #[error("Not found: {0}")]
    NotFound(String),

    /// Any other non-success status
    #[error("API error ({status}): {body}")]
    Api { status: u16, body: String },

    /// Response body did not match the expected shape
    #[error("Parse error: {0}")]
    Parse(String),

    /// No source configured for this deployment
    #[error("Source unavailable: {0}")]
    Unavailable(String),
}

impl SourceError {
    /// True when retrying the same request later may succeed
    pub fn is_transient(&self) -> bool {
        match self {
            SourceError::Network(_) | SourceError::RateLimited | SourceError::Unavailable(_) => {
                true
            }
            SourceError::Api { status, .. } => *status >= 500,
            SourceError::NotFound(_) | SourceError::Parse(_) => false,
        }
    }
}

impl From<reqwest::Error> for SourceError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            SourceError::Parse(err.to_string())
        } else {
            SourceError::Network(err.to_string())
        }
    }
}

/// Failure of one unit of import work
#[derive(Debug, Error)]
pub enum IngestError {
    /// External source call failed; the queue retries with backoff
    #[error("Source error: {0}")]
    Source(#[from] SourceError),

    /// Batch payload could not be parsed into a manifest
    #[error("Malformed payload for {batch_key}: {reason}")]
    MalformedPayload { batch_key: String, reason: String },

    /// Requested a status change the state machine does not allow
    #[error("Invalid transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    /// Storage, configuration or other shared error
    #[error(transparent)]
    Common(#[from] marquee_common::Error),
}

impl IngestError {
    /// True for structural failures that should fail the whole job
    ///
    /// Everything else about a single item or entity is recorded in manifest
    /// state and absorbed.
    pub fn is_batch_level(&self) -> bool {
        matches!(
            self,
            IngestError::MalformedPayload { .. } | IngestError::Common(_)
        ) || matches!(self, IngestError::Source(e) if e.is_transient())
    }
}

impl From<sqlx::Error> for IngestError {
    fn from(err: sqlx::Error) -> Self {
        IngestError::Common(marquee_common::Error::Database(err))
    }
}

/// Result type for import work
pub type IngestResult<T> = Result<T, IngestError>;

/// API error type
#[derive(Debug, Error)]
pub enum ApiError {
    /// Resource not found (404)
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Invalid request (400)
    #[error("Invalid request: {0}")]
    BadRequest(String),

    /// Conflict (409), e.g. abandoning a completed manifest
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Internal server error (500)
    #[error("Internal server error: {0}")]
    Internal(String),

    /// marquee-common error
    #[error("Common error: {0}")]
    Common(#[from] marquee_common::Error),
}

impl From<IngestError> for ApiError {
    fn from(err: IngestError) -> Self {
        match err {
            IngestError::Common(marquee_common::Error::NotFound(msg)) => ApiError::NotFound(msg),
            IngestError::Common(e) => ApiError::Common(e),
            IngestError::InvalidTransition { from, to } => {
                ApiError::Conflict(format!("manifest is {}, cannot move to {}", from, to))
            }
            IngestError::MalformedPayload { .. } => ApiError::BadRequest(err.to_string()),
            IngestError::Source(e) => ApiError::Internal(e.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_code, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, "CONFLICT", msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", msg),
            ApiError::Common(marquee_common::Error::NotFound(msg)) => {
                (StatusCode::NOT_FOUND, "NOT_FOUND", msg)
            }
            ApiError::Common(ref err) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "COMMON_ERROR",
                err.to_string(),
            ),
        };

        let body = Json(json!({
            "error": {
                "code": error_code,
                "message": message,
            }
        }));

        (status, body).into_response()
    }
}

/// Result type for API handlers
pub type ApiResult<T> = Result<T, ApiError>;
