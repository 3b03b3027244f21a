//! API error types with HTTP status mappings.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

/// Errors surfaced by the REST and SSE endpoints.
#[derive(Error, Debug)]
pub enum ApiError {
    /// Missing or unusable caller identity (401)
    #[error("authentication failed: {message}")]
    Unauthenticated { message: String },

    /// No active SSE connection for the caller (404)
    #[error("no active connection for user {user_id}")]
    NoActiveConnection { user_id: String },

    /// Malformed request body or parameters (400)
    #[error("validation error: {message}")]
    Validation { message: String },

    /// A producer built an invalid topic (400; producer bug)
    #[error("invalid topic: {0}")]
    Topic(#[from] cmp_types::TopicError),

    /// Bus unavailable for a call that needs it (503)
    #[error("event bus unavailable: {message}")]
    BusUnavailable { message: String },

    /// Anything else (500)
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl ApiError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            ApiError::Unauthenticated { .. } => StatusCode::UNAUTHORIZED,
            ApiError::NoActiveConnection { .. } => StatusCode::NOT_FOUND,
            ApiError::Validation { .. } | ApiError::Topic(_) => StatusCode::BAD_REQUEST,
            ApiError::BusUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            ApiError::Unauthenticated { .. } => "unauthenticated",
            ApiError::NoActiveConnection { .. } => "no_active_connection",
            ApiError::Validation { .. } => "validation_error",
            ApiError::Topic(_) => "invalid_topic",
            ApiError::BusUnavailable { .. } => "bus_unavailable",
            ApiError::Internal { .. } => "internal_error",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = Json(json!({
            "error": {
                "type": self.kind(),
                "message": self.to_string(),
            }
        }));
        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let unauthenticated = ApiError::Unauthenticated {
            message: "no user".to_string(),
        };
        assert_eq!(unauthenticated.status(), StatusCode::UNAUTHORIZED);

        let missing = ApiError::NoActiveConnection {
            user_id: "u1".to_string(),
        };
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);

        assert_eq!(
            ApiError::validation("bad body").status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::internal("boom").status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
