//! 统一的 API 错误类型、稳定错误码与转换。

use axum::Json;
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use thiserror::Error;
use tracing::error;

use crate::metadata::MetadataError;
use crate::quota::QuotaError;
use crate::storage::StorageError;

/// Machine-readable reason codes returned in every error body.
pub mod code {
    pub const INVALID_FILENAME: &str = "INVALID_FILENAME";
    pub const INVALID_PATH: &str = "INVALID_PATH";
    pub const DANGEROUS_EXTENSION: &str = "DANGEROUS_EXTENSION";
    pub const MIME_NOT_ALLOWED: &str = "MIME_NOT_ALLOWED";
    pub const FILE_TOO_LARGE: &str = "FILE_TOO_LARGE";
    pub const CHUNK_TOO_LARGE: &str = "CHUNK_TOO_LARGE";
    pub const TOO_MANY_CHUNKS: &str = "TOO_MANY_CHUNKS";
    pub const INVALID_CHUNK_INDEX: &str = "INVALID_CHUNK_INDEX";
    pub const INVALID_CHUNK_LAYOUT: &str = "INVALID_CHUNK_LAYOUT";
    pub const EMPTY_BATCH: &str = "EMPTY_BATCH";
    pub const INVALID_REQUEST: &str = "INVALID_REQUEST";
    pub const QUOTA_EXCEEDED: &str = "QUOTA_EXCEEDED";
    pub const NOT_FOUND: &str = "NOT_FOUND";
    pub const TOTAL_CHUNKS_MISMATCH: &str = "TOTAL_CHUNKS_MISMATCH";
    pub const TOTAL_SIZE_MISMATCH: &str = "TOTAL_SIZE_MISMATCH";
    pub const FILENAME_MISMATCH: &str = "FILENAME_MISMATCH";
    pub const UPLOAD_MERGING: &str = "UPLOAD_MERGING";
    pub const SIZE_MISMATCH: &str = "SIZE_MISMATCH";
    pub const CORRUPT_SEQUENCE: &str = "CORRUPT_SEQUENCE";
    pub const STORAGE_UNAVAILABLE: &str = "STORAGE_UNAVAILABLE";
    pub const UNAUTHENTICATED: &str = "UNAUTHENTICATED";
    pub const RANGE_NOT_SATISFIABLE: &str = "RANGE_NOT_SATISFIABLE";
    pub const INTERNAL: &str = "INTERNAL";
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{message}")]
    Validation { code: &'static str, message: String },
    #[error("quota exceeded: requested {requested} bytes, {remaining} bytes remaining")]
    QuotaExceeded { requested: i64, remaining: i64 },
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("{message}")]
    Conflict { code: &'static str, message: String },
    #[error("merged size {actual} does not match declared size {expected}")]
    SizeMismatch { expected: i64, actual: i64 },
    #[error("chunk sequence broken at index {expected} (found {found:?})")]
    CorruptSequence { expected: i64, found: Option<i64> },
    #[error("storage unavailable: {0}")]
    TransientStorage(String),
    #[error("missing or invalid user identity")]
    Unauthenticated,
    #[error("range not satisfiable")]
    RangeNotSatisfiable(u64),
    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn validation(code: &'static str, message: impl Into<String>) -> Self {
        ApiError::Validation {
            code,
            message: message.into(),
        }
    }

    pub fn conflict(code: &'static str, message: impl Into<String>) -> Self {
        ApiError::Conflict {
            code,
            message: message.into(),
        }
    }

    /// 返回稳定的错误码。
    pub fn code(&self) -> &'static str {
        match self {
            ApiError::Validation { code: reason, .. } | ApiError::Conflict { code: reason, .. } => {
                *reason
            }
            ApiError::QuotaExceeded { .. } => code::QUOTA_EXCEEDED,
            ApiError::NotFound(_) => code::NOT_FOUND,
            ApiError::SizeMismatch { .. } => code::SIZE_MISMATCH,
            ApiError::CorruptSequence { .. } => code::CORRUPT_SEQUENCE,
            ApiError::TransientStorage(_) => code::STORAGE_UNAVAILABLE,
            ApiError::Unauthenticated => code::UNAUTHENTICATED,
            ApiError::RangeNotSatisfiable(_) => code::RANGE_NOT_SATISFIABLE,
            ApiError::Internal(_) => code::INTERNAL,
        }
    }

    /// 客户端是否可以原样重试。
    pub fn retryable(&self) -> bool {
        matches!(self, ApiError::TransientStorage(_))
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Validation { code: reason, .. }
                if *reason == code::FILE_TOO_LARGE || *reason == code::CHUNK_TOO_LARGE =>
            {
                StatusCode::PAYLOAD_TOO_LARGE
            }
            ApiError::Validation { code: reason, .. } if *reason == code::MIME_NOT_ALLOWED => {
                StatusCode::UNSUPPORTED_MEDIA_TYPE
            }
            ApiError::Validation { .. } => StatusCode::BAD_REQUEST,
            ApiError::QuotaExceeded { .. } => StatusCode::INSUFFICIENT_STORAGE,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict { .. } => StatusCode::CONFLICT,
            ApiError::SizeMismatch { .. } | ApiError::CorruptSequence { .. } => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            ApiError::TransientStorage(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Unauthenticated => StatusCode::UNAUTHORIZED,
            ApiError::RangeNotSatisfiable(_) => StatusCode::RANGE_NOT_SATISFIABLE,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    code: &'a str,
    message: String,
    retryable: bool,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(code = self.code(), error = %self, "request failed");
        }
        let mut headers = HeaderMap::new();
        if let ApiError::RangeNotSatisfiable(size) = &self
            && let Ok(value) = HeaderValue::from_str(&format!("bytes */{size}"))
        {
            headers.insert(header::CONTENT_RANGE, value);
        }
        let body = ErrorBody {
            code: self.code(),
            message: self.to_string(),
            retryable: self.retryable(),
        };
        (status, headers, Json(body)).into_response()
    }
}

impl From<StorageError> for ApiError {
    fn from(error: StorageError) -> Self {
        match error {
            StorageError::InvalidPath => ApiError::validation(code::INVALID_PATH, "invalid path"),
            StorageError::Io(err) => ApiError::TransientStorage(err.to_string()),
        }
    }
}

impl From<QuotaError> for ApiError {
    fn from(error: QuotaError) -> Self {
        match error {
            QuotaError::FileTooLarge { .. } => {
                ApiError::validation(code::FILE_TOO_LARGE, error.to_string())
            }
            QuotaError::Exceeded {
                requested,
                remaining,
            } => ApiError::QuotaExceeded {
                requested,
                remaining,
            },
        }
    }
}

impl From<MetadataError> for ApiError {
    fn from(error: MetadataError) -> Self {
        match error {
            MetadataError::NotFound(what) => ApiError::NotFound(what),
            MetadataError::Quota(err) => err.into(),
            MetadataError::Database(err) if is_transient(&err) => {
                ApiError::TransientStorage(err.to_string())
            }
            other => ApiError::Internal(other.to_string()),
        }
    }
}

fn is_transient(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quota_errors_keep_their_reason_codes() {
        let too_large: ApiError = QuotaError::FileTooLarge {
            size: 10,
            limit: 5,
        }
        .into();
        assert_eq!(too_large.code(), code::FILE_TOO_LARGE);
        assert_eq!(too_large.status(), StatusCode::PAYLOAD_TOO_LARGE);

        let exceeded: ApiError = QuotaError::Exceeded {
            requested: 1000,
            remaining: 500,
        }
        .into();
        assert_eq!(exceeded.code(), code::QUOTA_EXCEEDED);
        assert!(!exceeded.retryable());
    }

    #[test]
    fn storage_io_errors_are_retryable() {
        let err: ApiError = StorageError::Io(std::io::Error::other("disk gone")).into();
        assert_eq!(err.code(), code::STORAGE_UNAVAILABLE);
        assert!(err.retryable());

        let err: ApiError = StorageError::InvalidPath.into();
        assert_eq!(err.code(), code::INVALID_PATH);
    }

    #[test]
    fn metadata_not_found_does_not_leak_owner() {
        let err: ApiError = MetadataError::NotFound("upload").into();
        assert_eq!(err.code(), code::NOT_FOUND);
        assert_eq!(err.to_string(), "upload not found");
    }
}
