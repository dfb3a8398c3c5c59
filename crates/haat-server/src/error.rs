use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use haat_contracts::{ErrorBody, ErrorResponse};
use thiserror::Error;
use tracing::error;

use crate::store::StoreError;

const NOT_AUTHORIZED: &str = "not authorized";

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("{0}")]
    Unauthorized(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Forbidden(String),
    #[error("{0}")]
    InvalidInput(String),
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    Internal(String),
}

impl ChatError {
    pub fn forbidden() -> Self {
        ChatError::Forbidden(NOT_AUTHORIZED.to_string())
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ChatError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ChatError::NotFound(_) => StatusCode::NOT_FOUND,
            ChatError::Forbidden(_) => StatusCode::FORBIDDEN,
            ChatError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            ChatError::Conflict(_) => StatusCode::CONFLICT,
            ChatError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ChatError::Unauthorized(_) => "unauthorized",
            ChatError::NotFound(_) => "not_found",
            ChatError::Forbidden(_) => "forbidden",
            ChatError::InvalidInput(_) => "validation_error",
            ChatError::Conflict(_) => "conflict",
            ChatError::Internal(_) => "internal",
        }
    }
}

impl From<StoreError> for ChatError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound => ChatError::NotFound("chat not found".to_string()),
            StoreError::Forbidden | StoreError::InvalidPair => ChatError::forbidden(),
            StoreError::InvalidInput(message) => ChatError::InvalidInput(message),
            StoreError::Backend(message) => ChatError::Internal(message),
        }
    }
}

impl IntoResponse for ChatError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match &self {
            ChatError::Internal(detail) => {
                error!(error = %detail, "request failed");
                "internal error".to_string()
            }
            other => other.to_string(),
        };
        let body = ErrorResponse {
            error: ErrorBody {
                code: self.code().to_string(),
                message,
                details: None,
            },
        };
        (status, Json(body)).into_response()
    }
}
