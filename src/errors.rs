//! Error taxonomy shared by every bucket backend.

use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BucketError {
    #[error("blob `{blob}` not found in bucket `{bucket}`")]
    BlobNotFound { bucket: String, blob: String },
    #[error("blob name `{name}` invalid: {reason}")]
    InvalidBlobName { name: String, reason: String },
    #[error("upload session for `{blob}` is already finalized")]
    SessionFinalized { blob: String },
    #[error("upload session for `{blob}` expired or was discarded")]
    SessionExpired { blob: String },
    #[error("upload session for `{blob}` rejected a chunk: {reason}")]
    SessionRejected { blob: String, reason: String },
    #[error("checksum mismatch for `{blob}`: expected {expected}, got {actual}")]
    ChecksumMismatch {
        blob: String,
        expected: String,
        actual: String,
    },
    #[error("blob `{blob}` is not valid UTF-8 text")]
    InvalidText { blob: String },
    #[error("endpoint `{endpoint}` invalid: {reason}")]
    InvalidEndpoint { endpoint: String, reason: String },
    #[error("storage service returned {status}: {message}")]
    Service { status: u16, message: String },
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

pub type BucketResult<T> = Result<T, BucketError>;

impl BucketError {
    pub fn not_found(bucket: impl Into<String>, blob: impl Into<String>) -> Self {
        Self::BlobNotFound {
            bucket: bucket.into(),
            blob: blob.into(),
        }
    }

    /// True for the one error kind callers are expected to branch on.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::BlobNotFound { .. })
    }
}

/// Map an I/O error on a read path to `BlobNotFound` when the path does not
/// resolve. `NotADirectory` means an ancestor segment is itself a blob.
pub(crate) fn map_read_err(err: io::Error, bucket: &str, blob: &str) -> BucketError {
    match err.kind() {
        io::ErrorKind::NotFound | io::ErrorKind::NotADirectory => {
            BucketError::not_found(bucket, blob)
        }
        _ => BucketError::Io(err),
    }
}
