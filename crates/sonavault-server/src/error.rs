//! API error mapping.
//!
//! One error type crosses the HTTP boundary. Every variant carries a stable
//! wire code; messages never leak key material, server paths, or internal
//! identifiers the caller did not supply.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;
use tracing::error;

use sonavault_core::error::{
    AuthError, ChapterError, SegmentDecryptError, StoreError, StreamError, TokenError, UploadError,
};

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Error, Debug)]
pub enum ApiError {
    // Authentication
    #[error("missing credential")]
    MissingCredential,
    #[error("invalid credential")]
    InvalidCredential,
    #[error("account is locked")]
    Locked,
    #[error("device approval required")]
    DeviceApprovalRequired,
    #[error("second device after acknowledgement; account locked pending admin unlock")]
    PolicyViolation,

    // Authorization
    #[error("forbidden")]
    Forbidden,
    #[error("access grant expired")]
    AccessExpired,

    // Upload
    #[error("chunk conflicts with previously received bytes")]
    ChunkConflict,
    #[error("upload integrity check failed")]
    IntegrityFailed,
    #[error("upload session expired")]
    UploadExpired,
    #[error("upload session not found")]
    UploadNotFound,
    #[error("upload is busy or in a terminal state")]
    UploadBusy,

    // Chapters
    #[error("chapter ranges overlap")]
    ChapterOverlaps,
    #[error("chapter boundary out of range")]
    ChapterOutOfRange,
    #[error("chapter is not ready")]
    ChapterNotReady,
    #[error("chapter finalization failed")]
    FinalizeFailed,

    // DRM
    #[error("invalid stream token")]
    InvalidToken,
    #[error("stream token expired; re-issue and retry")]
    TokenExpired,
    #[error("device does not match session")]
    DeviceMismatch,
    #[error("requested range not satisfiable")]
    RangeNotSatisfiable { total: u64 },

    // Storage / crypto
    #[error("decryption failed")]
    DecryptFailed,
    #[error("storage failure")]
    IoFailed,

    // Generic
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("email already registered")]
    EmailTaken,
    #[error("invalid request: {0}")]
    BadRequest(String),
    #[error("internal error")]
    Internal,
}

impl ApiError {
    /// Stable machine-readable code for API consumers.
    pub fn code(&self) -> &'static str {
        match self {
            Self::MissingCredential => "MISSING_CREDENTIAL",
            Self::InvalidCredential => "INVALID_CREDENTIAL",
            Self::Locked => "LOCKED",
            Self::DeviceApprovalRequired => "DEVICE_APPROVAL_REQUIRED",
            Self::PolicyViolation => "POLICY_VIOLATION",
            Self::Forbidden => "FORBIDDEN",
            Self::AccessExpired => "ACCESS_EXPIRED",
            Self::ChunkConflict => "CHUNK_CONFLICT",
            Self::IntegrityFailed => "INTEGRITY_FAILED",
            Self::UploadExpired => "UPLOAD_EXPIRED",
            Self::UploadNotFound => "UPLOAD_NOT_FOUND",
            Self::UploadBusy => "UPLOAD_BUSY",
            Self::ChapterOverlaps => "CHAPTER_OVERLAPS",
            Self::ChapterOutOfRange => "CHAPTER_OUT_OF_RANGE",
            Self::ChapterNotReady => "CHAPTER_NOT_READY",
            Self::FinalizeFailed => "FINALIZE_FAILED",
            Self::InvalidToken => "INVALID_TOKEN",
            Self::TokenExpired => "TOKEN_EXPIRED",
            Self::DeviceMismatch => "DEVICE_MISMATCH",
            Self::RangeNotSatisfiable { .. } => "RANGE_NOT_SATISFIABLE",
            Self::DecryptFailed => "DECRYPT_FAILED",
            Self::IoFailed => "IO_FAILED",
            Self::NotFound(_) => "NOT_FOUND",
            Self::EmailTaken => "EMAIL_TAKEN",
            Self::BadRequest(_) => "BAD_REQUEST",
            Self::Internal => "INTERNAL",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            Self::MissingCredential | Self::InvalidCredential => StatusCode::UNAUTHORIZED,
            Self::Locked
            | Self::PolicyViolation
            | Self::Forbidden
            | Self::AccessExpired
            | Self::InvalidToken
            | Self::TokenExpired
            | Self::DeviceMismatch => StatusCode::FORBIDDEN,
            Self::DeviceApprovalRequired | Self::BadRequest(_) | Self::ChapterOutOfRange => {
                StatusCode::BAD_REQUEST
            }
            Self::ChunkConflict | Self::ChapterOverlaps | Self::EmailTaken | Self::UploadBusy => {
                StatusCode::CONFLICT
            }
            Self::UploadExpired => StatusCode::GONE,
            Self::RangeNotSatisfiable { .. } => StatusCode::RANGE_NOT_SATISFIABLE,
            Self::NotFound(_) | Self::UploadNotFound => StatusCode::NOT_FOUND,
            Self::ChapterNotReady | Self::IntegrityFailed => StatusCode::UNPROCESSABLE_ENTITY,
            Self::FinalizeFailed | Self::DecryptFailed | Self::IoFailed | Self::Internal => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(code = self.code(), "Request failed with server error");
        }

        let mut response = (
            status,
            Json(json!({
                "success": false,
                "error": { "code": self.code(), "message": self.to_string() },
            })),
        )
            .into_response();

        if let ApiError::RangeNotSatisfiable { total } = self {
            if let Ok(value) = format!("bytes */{total}").parse() {
                response
                    .headers_mut()
                    .insert(axum::http::header::CONTENT_RANGE, value);
            }
        }
        response
    }
}

impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::MissingCredential => Self::MissingCredential,
            AuthError::InvalidCredential => Self::InvalidCredential,
            AuthError::Locked => Self::Locked,
            AuthError::DeviceApprovalRequired => Self::DeviceApprovalRequired,
            AuthError::PolicyViolation => Self::PolicyViolation,
            AuthError::DeviceMismatch => Self::DeviceMismatch,
            AuthError::EmailTaken => Self::EmailTaken,
            AuthError::NotFound => Self::NotFound("resource"),
            AuthError::Password(_) | AuthError::Store(_) => Self::Internal,
        }
    }
}

impl From<UploadError> for ApiError {
    fn from(err: UploadError) -> Self {
        match err {
            UploadError::NotFound(_) => Self::UploadNotFound,
            UploadError::ChunkConflict { .. } => Self::ChunkConflict,
            UploadError::IntegrityFailed { .. } | UploadError::SizeMismatch { .. } => {
                Self::IntegrityFailed
            }
            UploadError::Expired(_) => Self::UploadExpired,
            UploadError::InvalidState { .. } => Self::UploadBusy,
            UploadError::ChunkOutOfRange { .. }
            | UploadError::ChunkTooLarge { .. }
            | UploadError::ChunksMissing { .. }
            | UploadError::DurationUnavailable(_) => Self::BadRequest(err.to_string()),
            UploadError::Store(_) => Self::Internal,
            UploadError::Io(_) => Self::IoFailed,
        }
    }
}

impl From<ChapterError> for ApiError {
    fn from(err: ChapterError) -> Self {
        match err {
            ChapterError::Overlaps { .. } => Self::ChapterOverlaps,
            ChapterError::OutOfRange { .. } => Self::ChapterOutOfRange,
            ChapterError::NotReady(_) => Self::ChapterNotReady,
            ChapterError::DeleteReady(_) => {
                Self::BadRequest("chapter is finalized; reset before deleting".to_string())
            }
            ChapterError::NotFound(_) => Self::NotFound("chapter"),
            ChapterError::NoAudio(_) => Self::BadRequest("file has no stored audio".to_string()),
            ChapterError::Decrypt(_) => Self::DecryptFailed,
            ChapterError::Crypto(_) | ChapterError::Encrypt(_) => Self::FinalizeFailed,
            ChapterError::Store(_) => Self::Internal,
            ChapterError::Io(_) => Self::IoFailed,
        }
    }
}

impl From<TokenError> for ApiError {
    fn from(err: TokenError) -> Self {
        match err {
            TokenError::TokenExpired => Self::TokenExpired,
            TokenError::InvalidToken => Self::InvalidToken,
            TokenError::InvalidWindow { .. } => Self::BadRequest(err.to_string()),
            TokenError::SigningFailed(_) => Self::Internal,
        }
    }
}

impl From<StreamError> for ApiError {
    fn from(err: StreamError) -> Self {
        match err {
            StreamError::ChapterNotReady(_) => Self::ChapterNotReady,
            StreamError::Chapter(e) => e.into(),
            StreamError::Store(e) => e.into(),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { entity } => Self::NotFound(entity),
            StoreError::Conflict(message) => Self::BadRequest(message),
            StoreError::Backend(_) => Self::Internal,
        }
    }
}

impl From<SegmentDecryptError> for ApiError {
    fn from(err: SegmentDecryptError) -> Self {
        match err {
            SegmentDecryptError::Io { .. } => Self::IoFailed,
            _ => Self::DecryptFailed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping_follows_wire_contract() {
        assert_eq!(ApiError::InvalidCredential.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(ApiError::TokenExpired.status(), StatusCode::FORBIDDEN);
        assert_eq!(ApiError::DeviceMismatch.status(), StatusCode::FORBIDDEN);
        assert_eq!(ApiError::ChunkConflict.status(), StatusCode::CONFLICT);
        assert_eq!(ApiError::UploadExpired.status(), StatusCode::GONE);
        assert_eq!(
            ApiError::RangeNotSatisfiable { total: 10 }.status(),
            StatusCode::RANGE_NOT_SATISFIABLE
        );
        assert_eq!(
            ApiError::DecryptFailed.status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn expired_and_invalid_tokens_have_distinct_codes() {
        assert_ne!(ApiError::TokenExpired.code(), ApiError::InvalidToken.code());
    }
}
