//! 统一的 API 错误类型与转换。

use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use std::io::{self, ErrorKind};
use tracing::{error, warn};

use crate::sandbox::SandboxError;
use crate::storage::StorageError;
use crate::transfer::TransferError;
use crate::upload::UploadError;
use crate::validation::ValidationError;

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Unauthorized(String),
    Forbidden(String),
    NotFound(String),
    Conflict(String),
    PayloadTooLarge(String),
    UnsupportedMediaType(String),
    RangeNotSatisfiable(u64),
    TooManyRequests(String),
    ServiceUnavailable(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg).into_response(),
            ApiError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg).into_response(),
            ApiError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg).into_response(),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg).into_response(),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg).into_response(),
            ApiError::PayloadTooLarge(msg) => (StatusCode::PAYLOAD_TOO_LARGE, msg).into_response(),
            ApiError::UnsupportedMediaType(msg) => {
                (StatusCode::UNSUPPORTED_MEDIA_TYPE, msg).into_response()
            }
            ApiError::RangeNotSatisfiable(size) => {
                let mut headers = HeaderMap::new();
                if let Ok(value) = HeaderValue::from_str(&format!("bytes */{size}")) {
                    headers.insert(header::CONTENT_RANGE, value);
                }
                headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
                (
                    StatusCode::RANGE_NOT_SATISFIABLE,
                    headers,
                    "range not satisfiable",
                )
                    .into_response()
            }
            ApiError::TooManyRequests(msg) => (StatusCode::TOO_MANY_REQUESTS, msg).into_response(),
            ApiError::ServiceUnavailable(msg) => {
                (StatusCode::SERVICE_UNAVAILABLE, msg).into_response()
            }
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg).into_response(),
        }
    }
}

fn from_io(err: io::Error) -> ApiError {
    match err.kind() {
        ErrorKind::NotFound => ApiError::NotFound("not found".into()),
        ErrorKind::PermissionDenied => ApiError::Forbidden("permission denied".into()),
        ErrorKind::AlreadyExists => ApiError::Conflict("target already exists".into()),
        _ => {
            error!(error = %err, "storage io failure");
            ApiError::Internal("internal storage error".into())
        }
    }
}

impl From<SandboxError> for ApiError {
    fn from(err: SandboxError) -> Self {
        match err {
            SandboxError::Traversal => {
                warn!(event = "path_traversal", "rejected path outside storage root");
                ApiError::Forbidden("path escapes storage root".into())
            }
            SandboxError::RootOperation => ApiError::Forbidden(err.to_string()),
            SandboxError::Reserved => {
                warn!(event = "reserved_path", "rejected access to upload staging area");
                ApiError::Forbidden(err.to_string())
            }
            SandboxError::NulByte | SandboxError::ComponentTooLong | SandboxError::PathTooLong => {
                ApiError::BadRequest(err.to_string())
            }
            SandboxError::Io(err) => from_io(err),
        }
    }
}

impl From<StorageError> for ApiError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Sandbox(err) => err.into(),
            StorageError::NotADirectory | StorageError::InvalidTarget => {
                ApiError::BadRequest(err.to_string())
            }
            StorageError::AlreadyExists => ApiError::Conflict(err.to_string()),
            StorageError::Io(err) => from_io(err),
        }
    }
}

impl From<UploadError> for ApiError {
    fn from(err: UploadError) -> Self {
        match err {
            UploadError::NotFound | UploadError::Expired => ApiError::NotFound(err.to_string()),
            UploadError::Forbidden => ApiError::Forbidden(err.to_string()),
            UploadError::InvalidIndex { .. } | UploadError::SizeMismatch { .. } => {
                ApiError::BadRequest(err.to_string())
            }
            UploadError::IncompleteUpload { .. } => ApiError::Conflict(err.to_string()),
            UploadError::TooManySessions => ApiError::TooManyRequests(err.to_string()),
            UploadError::Busy => ApiError::ServiceUnavailable(err.to_string()),
            UploadError::Sandbox(err) => err.into(),
            UploadError::Io(err) => from_io(err),
        }
    }
}

impl From<TransferError> for ApiError {
    fn from(err: TransferError) -> Self {
        match err {
            TransferError::IsDirectory => ApiError::BadRequest(err.to_string()),
            TransferError::RangeNotSatisfiable(size) => ApiError::RangeNotSatisfiable(size),
            TransferError::Header(err) => ApiError::Internal(err.to_string()),
            TransferError::Io(err) => from_io(err),
        }
    }
}

impl From<ValidationError> for ApiError {
    fn from(err: ValidationError) -> Self {
        match err {
            ValidationError::TooLarge { .. } => ApiError::PayloadTooLarge(err.to_string()),
            _ => ApiError::UnsupportedMediaType(err.to_string()),
        }
    }
}
