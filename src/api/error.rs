use axum::{Json, http::StatusCode, response::IntoResponse};
use thiserror::Error;

use super::models::ErrorResponse;
use crate::dispatcher::DispatchError;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    NotFound(String),
    #[error("store unavailable")]
    Transport,
    #[error("internal error")]
    Internal,
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Transport => StatusCode::BAD_GATEWAY,
            ApiError::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ApiError::Validation(_) => "VALIDATION",
            ApiError::NotFound(_) => "NOT_FOUND",
            ApiError::Transport => "TRANSPORT",
            ApiError::Internal => "INTERNAL",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status_code();
        let body = ErrorResponse {
            error: self.to_string(),
            code: self.code(),
        };

        (status, Json(body)).into_response()
    }
}

/// Validation and not-found pass through with their messages; transport
/// and internal details stay in the logs.
impl From<DispatchError> for ApiError {
    fn from(err: DispatchError) -> Self {
        match err {
            DispatchError::Validation(msg) => ApiError::Validation(msg),
            DispatchError::NotFound(msg) => ApiError::NotFound(msg),
            DispatchError::Transport(msg) => {
                tracing::error!(error = %msg, "store error serving API request");
                ApiError::Transport
            }
            DispatchError::Internal(msg) => {
                tracing::error!(error = %msg, "internal error serving API request");
                ApiError::Internal
            }
        }
    }
}
