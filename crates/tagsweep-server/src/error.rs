//! HTTP error responses.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;

/// Errors surfaced synchronously to API callers.
///
/// Sweep-time failures never appear here; by the time a sweep runs the caller
/// already has its acknowledgment.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// Malformed payload or no usable tags (400).
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Missing or malformed credentials (401).
    #[error("Authentication required: {0}")]
    Unauthorized(String),

    /// Credentials present but not accepted (403).
    #[error("Access forbidden: {0}")]
    Forbidden(String),

    /// Generic internal error (500).
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::BadRequest(msg.into())
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            Self::BadRequest(_) => "invalid",
            Self::Unauthorized(_) => "login",
            Self::Forbidden(_) => "forbidden",
            Self::Internal(_) => "exception",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({
            "error": {
                "code": self.code(),
                "message": self.to_string(),
            }
        });

        (self.status(), Json(body)).into_response()
    }
}
