//! # Error Handling
//!
//! The HTTP-facing error type and its mapping onto status codes and the
//! JSON error envelope. Domain layers keep their own error types
//! (`StoreError`, `TranscriptionError`, `TransitionError`); only what
//! reaches a handler is converted into an `AppError`.
//!
//! ## Response Format:
//! ```json
//! {
//!   "error": {
//!     "type": "validation_error",
//!     "message": "sequence must be non-negative",
//!     "timestamp": "2026-01-01T12:00:00Z"
//!   }
//! }
//! ```

use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use std::fmt;

use crate::store::StoreError;

/// Errors a request handler can surface to a client.
#[derive(Debug)]
pub enum AppError {
    /// Server-side failure unrelated to packet admission
    Internal(String),

    /// Malformed request body or parameters
    BadRequest(String),

    /// Unknown call id
    NotFound(String),

    /// Request failed field validation
    ValidationError(String),

    /// The store rejected or lost a packet; nothing was persisted
    Ingestion(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::NotFound(msg) => write!(f, "Not found: {}", msg),
            AppError::ValidationError(msg) => write!(f, "Validation error: {}", msg),
            AppError::Ingestion(msg) => write!(f, "Ingestion failed: {}", msg),
        }
    }
}

impl ResponseError for AppError {
    fn error_response(&self) -> HttpResponse {
        let (status, error_type, message) = match self {
            AppError::Internal(msg) => (
                actix_web::http::StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                msg.clone(),
            ),
            AppError::BadRequest(msg) => (
                actix_web::http::StatusCode::BAD_REQUEST,
                "bad_request",
                msg.clone(),
            ),
            AppError::NotFound(msg) => (
                actix_web::http::StatusCode::NOT_FOUND,
                "not_found",
                msg.clone(),
            ),
            AppError::ValidationError(msg) => (
                actix_web::http::StatusCode::BAD_REQUEST,
                "validation_error",
                msg.clone(),
            ),
            AppError::Ingestion(msg) => (
                actix_web::http::StatusCode::INTERNAL_SERVER_ERROR,
                "ingestion_failed",
                msg.clone(),
            ),
        };

        HttpResponse::build(status).json(json!({
            "error": {
                "type": error_type,
                "message": message,
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::BadRequest(format!("JSON parsing error: {}", err))
    }
}

/// Store failures reaching a read handler are plain internal errors; the
/// ingestion handler maps its store failures to `Ingestion` explicitly.
impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        AppError::Internal(err.to_string())
    }
}

/// Shorthand for handler results.
pub type AppResult<T> = Result<T, AppError>;
