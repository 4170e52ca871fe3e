//! API error type and status-code mapping.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// API error type.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("internal error: {0}")]
    Internal(String),
}

/// JSON error body.
#[derive(Debug, Serialize, Deserialize, utoipa::ToSchema)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_type) = match &self {
            ApiError::Unauthorized(_) => (StatusCode::UNAUTHORIZED, "unauthorized"),
            ApiError::Forbidden(_) => (StatusCode::FORBIDDEN, "forbidden"),
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "bad_request"),
            ApiError::Conflict(_) => (StatusCode::CONFLICT, "conflict"),
            ApiError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
        };

        if matches!(self, ApiError::Internal(_)) {
            tracing::error!(error = %self, "request failed");
        }

        let body = ErrorResponse {
            error: error_type.to_string(),
            message: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

impl From<memoh_core::Error> for ApiError {
    fn from(err: memoh_core::Error) -> Self {
        use memoh_core::Error;
        match err {
            Error::InvalidArgument(msg) => ApiError::BadRequest(msg),
            Error::NotFound { .. } => ApiError::NotFound(err.to_string()),
            Error::Forbidden(msg) => ApiError::Forbidden(msg),
            Error::PatchMismatch(msg) => ApiError::BadRequest(msg),
            Error::TaskStopTimeout { .. } => ApiError::Internal(err.to_string()),
            Error::Conflict(msg) => ApiError::Conflict(msg),
            Error::Internal(msg) => ApiError::Internal(msg),
        }
    }
}

pub type Result<T, E = ApiError> = std::result::Result<T, E>;
