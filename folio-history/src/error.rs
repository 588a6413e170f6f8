//! Service error taxonomy and the stable `errno` codes clients see.

use crate::live::LiveError;
use crate::meta::MetaError;
use crate::model::DocumentId;
use crate::revert::RevertError;
use crate::storage::StorageError;

/// Stable numeric codes carried in every response envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ErrorCode {
    Success = 0,
    InvalidParams = 10000,
    StorageException = 10001,
    InvalidVersion = 10002,
    RevertFailed = 10003,
    VersionNotFound = 10004,
    NotFound = 10005,
}

impl ErrorCode {
    pub fn errno(self) -> i32 {
        self as i32
    }

    /// Short message used as `errmsg`.
    pub fn message(self) -> &'static str {
        match self {
            ErrorCode::Success => "success",
            ErrorCode::InvalidParams => "Invalid params",
            ErrorCode::StorageException => "Exception",
            ErrorCode::InvalidVersion => "Invalid version",
            ErrorCode::RevertFailed => "Revert failed",
            ErrorCode::VersionNotFound => "Version not found",
            ErrorCode::NotFound => "Not found",
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ServiceError {
    #[error("Invalid params: {0}")]
    InvalidParams(String),

    #[error("Storage failure: {0}")]
    Storage(String),

    #[error("Version {version} of document {doc_id} is beyond current version {current}")]
    InvalidVersion {
        doc_id: DocumentId,
        version: u64,
        current: u64,
    },

    #[error("Revert of document {doc_id} to version {version} failed: {reason}")]
    RevertFailed {
        doc_id: DocumentId,
        version: u64,
        reason: String,
    },

    #[error("Version {version} of document {doc_id} not found")]
    VersionNotFound { doc_id: DocumentId, version: u64 },

    #[error("Document {0} not found")]
    NotFound(DocumentId),
}

impl ServiceError {
    pub fn code(&self) -> ErrorCode {
        match self {
            ServiceError::InvalidParams(_) => ErrorCode::InvalidParams,
            ServiceError::Storage(_) => ErrorCode::StorageException,
            ServiceError::InvalidVersion { .. } => ErrorCode::InvalidVersion,
            ServiceError::RevertFailed { .. } => ErrorCode::RevertFailed,
            ServiceError::VersionNotFound { .. } => ErrorCode::VersionNotFound,
            ServiceError::NotFound(_) => ErrorCode::NotFound,
        }
    }

    pub fn errno(&self) -> i32 {
        self.code().errno()
    }

    pub fn invalid(reason: impl Into<String>) -> Self {
        ServiceError::InvalidParams(reason.into())
    }
}

impl From<StorageError> for ServiceError {
    fn from(e: StorageError) -> Self {
        ServiceError::Storage(e.to_string())
    }
}

impl From<LiveError> for ServiceError {
    fn from(e: LiveError) -> Self {
        ServiceError::Storage(e.to_string())
    }
}

impl From<MetaError> for ServiceError {
    fn from(e: MetaError) -> Self {
        match e {
            MetaError::NotFound(doc_id) => ServiceError::NotFound(doc_id),
            MetaError::Storage(e) => e.into(),
        }
    }
}

impl From<RevertError> for ServiceError {
    fn from(e: RevertError) -> Self {
        match e {
            RevertError::InvalidVersion {
                doc_id,
                version,
                current,
            } => ServiceError::InvalidVersion {
                doc_id,
                version,
                current,
            },
            RevertError::VersionNotFound { doc_id, version } => {
                ServiceError::VersionNotFound { doc_id, version }
            }
            RevertError::RevertFailed {
                doc_id,
                version,
                reason,
            } => ServiceError::RevertFailed {
                doc_id,
                version,
                reason,
            },
            RevertError::Storage(e) => e.into(),
        }
    }
}
