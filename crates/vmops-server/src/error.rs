use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use tracing::error;
use vmops_control_plane::ErrorEnvelope;

use crate::store::StoreError;

/// Every failure surfaced to HTTP callers: status, machine code and message.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{code}: {message}")]
pub struct ApiError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
    pub details: Option<String>,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn bad_request(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, code, message)
    }

    pub fn unauthorized(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, code, message)
    }

    pub fn forbidden(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, code, message)
    }

    pub fn not_found(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, code, message)
    }

    pub fn conflict(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, code, message)
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        let (status, code, message) = match &err {
            StoreError::Unavailable(_) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "STORE_UNAVAILABLE",
                "record store is unavailable",
            ),
            StoreError::Database(_) => (
                StatusCode::BAD_GATEWAY,
                "STORE_ERROR",
                "record store request failed",
            ),
            StoreError::Corrupt(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "CORRUPT_RECORD",
                "stored record could not be decoded",
            ),
        };
        Self::new(status, code, message).with_details(err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            error!(
                code = self.code,
                details = self.details.as_deref().unwrap_or(""),
                "{}",
                self.message
            );
        }
        let envelope = ErrorEnvelope::new(self.code, self.message, self.details);
        (self.status, Json(envelope)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_errors_map_to_gateway_statuses_with_details() {
        let err = ApiError::from(StoreError::Unavailable("pool timed out".to_string()));
        assert_eq!(err.status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(err.code, "STORE_UNAVAILABLE");
        assert_eq!(
            err.details.as_deref(),
            Some("store unavailable: pool timed out")
        );

        let err = ApiError::from(StoreError::Database("syntax error".to_string()));
        assert_eq!(err.status, StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn display_includes_code() {
        let err = ApiError::conflict("AGENT_OFFLINE", "agent is offline");
        assert_eq!(err.to_string(), "AGENT_OFFLINE: agent is offline");
    }
}
