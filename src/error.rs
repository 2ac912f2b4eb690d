//! 统一的 API 错误类型与转换。

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json as JsonResponse, Response};
use serde::Serialize;
use std::io::ErrorKind;

use crate::storage::StorageError;
use crate::thumbnail::DeriveError;

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Internal(String),
    Conflict(String),
    PayloadTooLarge(String),
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            ApiError::BadRequest(msg)
            | ApiError::NotFound(msg)
            | ApiError::Internal(msg)
            | ApiError::Conflict(msg)
            | ApiError::PayloadTooLarge(msg) => msg,
        }
    }

    /// 在消息前加上上下文，保持错误类别不变。
    pub fn with_context(self, context: &str) -> Self {
        let wrap = |msg: String| format!("{context}: {msg}");
        match self {
            ApiError::BadRequest(msg) => ApiError::BadRequest(wrap(msg)),
            ApiError::NotFound(msg) => ApiError::NotFound(wrap(msg)),
            ApiError::Internal(msg) => ApiError::Internal(wrap(msg)),
            ApiError::Conflict(msg) => ApiError::Conflict(wrap(msg)),
            ApiError::PayloadTooLarge(msg) => ApiError::PayloadTooLarge(wrap(msg)),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = ErrorBody {
            error: self.message().to_string(),
        };
        (status, JsonResponse(body)).into_response()
    }
}

impl From<StorageError> for ApiError {
    fn from(error: StorageError) -> Self {
        match error {
            StorageError::InvalidPath => ApiError::BadRequest("invalid path".into()),
            StorageError::IsDirectory(_) | StorageError::ArchiveTooLarge(_) => {
                ApiError::BadRequest(error.to_string())
            }
            StorageError::Io(err) => match err.kind() {
                ErrorKind::NotFound => ApiError::NotFound(err.to_string()),
                _ => ApiError::Internal(err.to_string()),
            },
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<DeriveError> for ApiError {
    fn from(error: DeriveError) -> Self {
        ApiError::Internal(error.to_string())
    }
}
