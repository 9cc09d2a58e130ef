//! Error responses.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use tracing::error;

use crate::allocator::AllocatorError;
use crate::validation::ValidationError;

/// Error response body.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// Everything a handler can fail with.
#[derive(Debug)]
pub enum ApiError {
    Validation(ValidationError),
    Allocator(AllocatorError),
    /// Malformed body or query string, with the extractor's own status.
    Rejected(StatusCode, String),
    BadRequest(String),
    Unauthorized(String),
    Internal(String),
}

impl From<ValidationError> for ApiError {
    fn from(err: ValidationError) -> Self {
        ApiError::Validation(err)
    }
}

impl From<AllocatorError> for ApiError {
    fn from(err: AllocatorError) -> Self {
        ApiError::Allocator(err)
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(err: sqlx::Error) -> Self {
        ApiError::Internal(err.to_string())
    }
}

impl ApiError {
    fn status_and_message(self) -> (StatusCode, String) {
        match self {
            ApiError::Validation(e) => (StatusCode::UNPROCESSABLE_ENTITY, e.to_string()),
            ApiError::Allocator(e) => {
                let status = match &e {
                    AllocatorError::HostnameInUse(_) | AllocatorError::AlreadyConfirmed => {
                        StatusCode::CONFLICT
                    }
                    AllocatorError::PoolExhausted(_) => StatusCode::SERVICE_UNAVAILABLE,
                    AllocatorError::NotFound => StatusCode::NOT_FOUND,
                    AllocatorError::TokenMismatch => StatusCode::FORBIDDEN,
                    AllocatorError::Expired => StatusCode::GONE,
                    AllocatorError::InvariantViolation(_) | AllocatorError::Database(_) => {
                        return ApiError::Internal(e.to_string()).status_and_message();
                    }
                };
                (status, e.to_string())
            }
            ApiError::Rejected(status, msg) => (status, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            ApiError::Internal(msg) => {
                error!(error = %msg, "Request failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error) = self.status_and_message();
        (status, Json(ErrorResponse { error })).into_response()
    }
}
