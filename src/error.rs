//! # Error Handling
//!
//! Custom error types and their conversion to HTTP responses.
//!
//! ## Error Categories:
//! - **BadRequest**: Client sent invalid data (unknown export format, missing
//!   filename, non-audio upload) - 400, surfaced immediately, no retry
//! - **ModelLoad**: The fallback chain was exhausted while materializing a
//!   model - 500, the only failure that is fatal to a transcription request
//! - **Export**: Transcript rendering produced no content - 500
//! - **Internal**: Everything else server-side - 500
//!
//! Preference persistence failures never reach this module: the preference
//! store degrades to defaults or skips the write and only logs.

use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use std::fmt;

/// Application error type returned by HTTP handlers.
#[derive(Debug)]
pub enum AppError {
    /// Client sent invalid or malformed data
    BadRequest(String),

    /// Model materialization failed after the fallback chain was exhausted
    ModelLoad(String),

    /// Transcript export rendering failed
    Export(String),

    /// Internal server errors
    Internal(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::ModelLoad(msg) => write!(f, "Model load error: {}", msg),
            AppError::Export(msg) => write!(f, "Export error: {}", msg),
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

/// Converts `AppError` values into JSON HTTP responses.
///
/// All errors share one body shape:
/// ```json
/// {
///   "error": {
///     "type": "model_load_error",
///     "message": "...",
///     "timestamp": "2025-01-01T12:00:00Z"
///   }
/// }
/// ```
impl ResponseError for AppError {
    fn error_response(&self) -> HttpResponse {
        let (status, error_type, message) = match self {
            AppError::BadRequest(msg) => (
                actix_web::http::StatusCode::BAD_REQUEST,
                "bad_request",
                msg.clone(),
            ),
            AppError::ModelLoad(msg) => (
                actix_web::http::StatusCode::INTERNAL_SERVER_ERROR,
                "model_load_error",
                msg.clone(),
            ),
            AppError::Export(msg) => (
                actix_web::http::StatusCode::INTERNAL_SERVER_ERROR,
                "export_error",
                msg.clone(),
            ),
            AppError::Internal(msg) => (
                actix_web::http::StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_codes() {
        let bad = AppError::BadRequest("nope".to_string());
        assert_eq!(bad.error_response().status().as_u16(), 400);

        let load = AppError::ModelLoad("chain exhausted".to_string());
        assert_eq!(load.error_response().status().as_u16(), 500);

        let export = AppError::Export("empty content".to_string());
        assert_eq!(export.error_response().status().as_u16(), 500);

        let internal = AppError::Internal("task panicked".to_string());
        assert_eq!(internal.error_response().status().as_u16(), 500);
    }

    #[test]
    fn test_display_messages() {
        let err = AppError::ModelLoad("cuda out of memory".to_string());
        assert_eq!(err.to_string(), "Model load error: cuda out of memory");

        let err = AppError::BadRequest("beam_size must be at least 1".to_string());
        assert_eq!(err.to_string(), "Bad request: beam_size must be at least 1");
    }
}
