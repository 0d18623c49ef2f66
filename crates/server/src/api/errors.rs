//! API error types mapped to HTTP status codes.
//!
//! Each [`ApiError`] variant maps to a specific HTTP status code and produces
//! a JSON response body `{"error": "message"}`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use chunkdb_core::Error;
use serde_json::json;

/// Application-level error type that implements `IntoResponse`.
///
/// - `NotFound` → 404
/// - `BadRequest` → 400
/// - `ServiceUnavailable` → 503
/// - `Internal` → 500
#[derive(Debug)]
pub enum ApiError {
    /// Unknown chunk or document (404).
    NotFound(String),
    /// Invalid query or parameters (400).
    BadRequest(String),
    /// The embedding service is unreachable or the operation was cancelled (503).
    ServiceUnavailable(String),
    /// Unexpected server error (500).
    Internal(String),
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        match err {
            Error::NotFound { .. } => ApiError::NotFound(err.to_string()),
            Error::InvalidQuery(_) | Error::DimensionMismatch { .. } | Error::InvalidVector(_) => {
                ApiError::BadRequest(err.to_string())
            }
            Error::ExternalServiceFailure { .. } | Error::Cancelled => {
                ApiError::ServiceUnavailable(err.to_string())
            }
            Error::CorruptIndex { .. }
            | Error::ExtractionFailure { .. }
            | Error::InvalidConfig(_)
            | Error::DocumentsFailed { .. }
            | Error::Io(_) => {
                tracing::error!(error = %err, "request failed");
                ApiError::Internal(err.to_string())
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::ServiceUnavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, axum::Json(json!({ "error": message }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status_of(err: Error) -> StatusCode {
        ApiError::from(err).into_response().status()
    }

    #[test]
    fn test_core_errors_map_to_statuses() {
        assert_eq!(status_of(Error::chunk_not_found("x")), StatusCode::NOT_FOUND);
        assert_eq!(
            status_of(Error::InvalidQuery("k".into())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_of(Error::DimensionMismatch {
                expected: 3,
                actual: 4
            }),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_of(Error::ExternalServiceFailure {
                service: "ollama".into(),
                attempts: 3,
                reason: "refused".into()
            }),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            status_of(Error::corrupt("/tmp/index", "bad crc")),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
