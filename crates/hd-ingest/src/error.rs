//! Ingest error types

use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Duplicate request: {0}")]
    Duplicate(String),

    #[error("Notification not found: {0}")]
    NotFound(String),

    #[error("Store error: {0}")]
    Store(#[from] mongodb::error::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Error response body
#[derive(Debug, serde::Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

impl IntoResponse for IngestError {
    fn into_response(self) -> Response {
        let (status, error_type) = match &self {
            IngestError::Validation(_) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR"),
            IngestError::Unauthorized => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED"),
            IngestError::Duplicate(_) => (StatusCode::CONFLICT, "DUPLICATE"),
            IngestError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            IngestError::Store(_) | IngestError::Serialization(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR")
            }
        };

        let body = ErrorResponse {
            error: error_type.to_string(),
            message: self.to_string(),
        };

        (status, Json(body)).into_response()
    }
}

/// Detect a unique-index violation so it can surface as a 409 conflict.
pub fn is_duplicate_key(err: &mongodb::error::Error) -> bool {
    use mongodb::error::{ErrorKind, WriteFailure};

    if let ErrorKind::Write(WriteFailure::WriteError(write_error)) = &*err.kind {
        if write_error.code == 11000 {
            return true;
        }
    }
    // Bulk/transactional inserts report the violation through other kinds;
    // the server message always carries the E11000 code.
    err.to_string().contains("E11000")
}
