//! Error taxonomy for the processor.
//!
//! Collaborator errors ([`ObjectStoreError`], [`MetadataError`],
//! [`CodecError`]) know whether they are transient. [`StageError`] is what a
//! stage handler surfaces to the orchestrator; the orchestrator only looks at
//! [`StageError::is_retryable`] and [`StageError::terminal_status`].

use crate::model::ImageStatus;
use thiserror::Error;

/// Errors from the object store
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ObjectStoreError {
    #[error("object not found: {bucket}/{key}")]
    NotFound { bucket: String, key: String },

    /// Ranged read starting past the end of the object
    #[error("requested range not satisfiable: {bucket}/{key}")]
    RangeNotSatisfiable { bucket: String, key: String },

    #[error("object store unavailable: {0}")]
    Unavailable(String),

    #[error("object store throttled the request: {0}")]
    Throttled(String),

    #[error("object store request timed out: {0}")]
    Timeout(String),

    #[error("object store request failed: {0}")]
    Other(String),
}

impl ObjectStoreError {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ObjectStoreError::Unavailable(_)
                | ObjectStoreError::Throttled(_)
                | ObjectStoreError::Timeout(_)
        )
    }
}

/// Errors from the metadata store
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MetadataError {
    #[error("image record not found: {0}")]
    NotFound(String),

    #[error("metadata store unavailable: {0}")]
    Unavailable(String),

    #[error("failed to (de)serialize record: {0}")]
    Serialization(String),

    #[error("metadata store query failed: {0}")]
    Database(String),
}

impl MetadataError {
    pub fn is_transient(&self) -> bool {
        matches!(self, MetadataError::Unavailable(_))
    }
}

impl From<sqlx::Error> for MetadataError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::RowNotFound => MetadataError::NotFound(e.to_string()),
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                MetadataError::Unavailable(e.to_string())
            }
            sqlx::Error::Decode(_) | sqlx::Error::ColumnDecode { .. } => {
                MetadataError::Serialization(e.to_string())
            }
            _ => MetadataError::Database(e.to_string()),
        }
    }
}

impl From<serde_json::Error> for MetadataError {
    fn from(e: serde_json::Error) -> Self {
        MetadataError::Serialization(e.to_string())
    }
}

/// Errors from the image codec
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("unsupported image format: {0}")]
    UnsupportedFormat(String),

    #[error("{0}")]
    Decode(String),

    #[error("failed to encode JPEG: {0}")]
    Encode(String),
}

/// Failure surfaced by a stage handler
#[derive(Error, Debug)]
pub enum StageError {
    /// Byte prefix matched no known signature
    #[error("Invalid image format")]
    InvalidImage,

    /// Body is corrupt despite a valid signature
    #[error("Failed to decode image: {0}")]
    Decode(String),

    #[error(transparent)]
    Storage(#[from] ObjectStoreError),

    #[error(transparent)]
    Metadata(#[from] MetadataError),

    #[error("missing upstream output: {0}")]
    MissingInput(String),

    #[error("{0}")]
    Internal(String),
}

impl StageError {
    /// Only transient infrastructure errors are retried
    pub fn is_retryable(&self) -> bool {
        match self {
            StageError::Storage(e) => e.is_transient(),
            StageError::Metadata(e) => e.is_transient(),
            _ => false,
        }
    }

    /// Terminal image status when this error ends the run
    pub fn terminal_status(&self) -> ImageStatus {
        match self {
            StageError::InvalidImage => ImageStatus::Rejected,
            _ => ImageStatus::Failed,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            StageError::InvalidImage => "invalid_image",
            StageError::Decode(_) => "decode",
            StageError::Storage(e) if e.is_transient() => "transient",
            StageError::Metadata(e) if e.is_transient() => "transient",
            StageError::Storage(_) | StageError::Metadata(_) => "storage",
            StageError::MissingInput(_) => "missing_input",
            StageError::Internal(_) => "internal",
        }
    }
}

impl From<CodecError> for StageError {
    fn from(e: CodecError) -> Self {
        match e {
            CodecError::UnsupportedFormat(msg) | CodecError::Decode(msg) => StageError::Decode(msg),
            CodecError::Encode(msg) => StageError::Internal(format!("failed to encode JPEG: {msg}")),
        }
    }
}

impl From<tokio::task::JoinError> for StageError {
    fn from(e: tokio::task::JoinError) -> Self {
        StageError::Internal(format!("codec task failed: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(ObjectStoreError::Unavailable("503".into()).is_transient());
        assert!(ObjectStoreError::Throttled("SlowDown".into()).is_transient());
        assert!(ObjectStoreError::Timeout("read".into()).is_transient());
        assert!(!ObjectStoreError::NotFound {
            bucket: "b".into(),
            key: "k".into()
        }
        .is_transient());
        assert!(!ObjectStoreError::Other("denied".into()).is_transient());

        assert!(MetadataError::Unavailable("pool".into()).is_transient());
        assert!(!MetadataError::Database("syntax".into()).is_transient());
    }

    #[test]
    fn test_stage_error_retry_and_status() {
        let rejected = StageError::InvalidImage;
        assert!(!rejected.is_retryable());
        assert_eq!(rejected.terminal_status(), ImageStatus::Rejected);
        assert_eq!(rejected.to_string(), "Invalid image format");

        let decode: StageError = CodecError::Decode("truncated".into()).into();
        assert!(!decode.is_retryable());
        assert_eq!(decode.terminal_status(), ImageStatus::Failed);

        let transient: StageError = ObjectStoreError::Unavailable("503".into()).into();
        assert!(transient.is_retryable());
        assert_eq!(transient.terminal_status(), ImageStatus::Failed);
        assert_eq!(transient.kind(), "transient");

        let unknown = StageError::Internal("boom".into());
        assert!(!unknown.is_retryable());
    }

    #[test]
    fn test_sqlx_pool_errors_are_transient() {
        let e: MetadataError = sqlx::Error::PoolTimedOut.into();
        assert!(e.is_transient());

        let e: MetadataError = sqlx::Error::RowNotFound.into();
        assert!(matches!(e, MetadataError::NotFound(_)));
    }
}
