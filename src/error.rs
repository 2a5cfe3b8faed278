//! Error types for the HTTP dispatcher.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

/// Request-level errors surfaced to API clients.
///
/// Every variant renders as a JSON envelope `{"error": {"message", "type"}}`
/// with the status code of the failure class. Upstream responses that carry
/// their own error bodies are propagated verbatim by the forwarding layer and
/// never pass through here.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Invalid JSON")]
    InvalidJson,

    #[error("Model not specified")]
    ModelNotSpecified,

    #[error("Model not found: {0}")]
    ModelNotFound(String),

    #[error("Model not ready: {0}")]
    ModelNotReady(String),

    #[error("Model not available: {0}")]
    ModelNotAvailable(String),

    #[error("Error forwarding streaming request: {0}")]
    StreamingForward(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let (status, error_type) = match &self {
            Error::InvalidJson => (StatusCode::BAD_REQUEST, "invalid_request"),
            Error::ModelNotSpecified => (StatusCode::BAD_REQUEST, "invalid_request"),
            Error::ModelNotFound(_) => (StatusCode::NOT_FOUND, "model_not_found"),
            Error::ModelNotReady(_) => (StatusCode::SERVICE_UNAVAILABLE, "model_not_ready"),
            Error::ModelNotAvailable(_) => (StatusCode::INTERNAL_SERVER_ERROR, "model_not_available"),
            Error::StreamingForward(_) => (StatusCode::SERVICE_UNAVAILABLE, "streaming_error"),
            Error::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
        };

        let body = Json(json!({
            "error": {
                "type": error_type,
                "message": self.to_string()
            }
        }));

        (status, body).into_response()
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let resp = Error::ModelNotFound("nope".to_string()).into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let resp = Error::ModelNotReady("still loading".to_string()).into_response();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);

        let resp = Error::InvalidJson.into_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_display_carries_detail() {
        let err = Error::ModelNotFound("nope".to_string());
        assert_eq!(err.to_string(), "Model not found: nope");

        let err = Error::ModelNotReady("Runner not running".to_string());
        assert_eq!(err.to_string(), "Model not ready: Runner not running");
    }
}
