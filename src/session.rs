//! Resumable upload sessions.
//!
//! A session is opened by a bucket for one blob name. Data is sent as zero
//! or more intermediate chunks followed by one final chunk; the blob only
//! becomes visible once the final chunk has been accepted.

use crate::errors::{BucketError, BucketResult};
use async_trait::async_trait;
use bytes::Bytes;
use tracing::{debug, info};

/// Backend side of a session: where chunks actually go.
#[async_trait]
pub trait UploadTarget: Send + Sync {
    /// Handle identifying the session (a service URL, or a local pseudo-URL).
    fn session_url(&self) -> &str;

    /// Accept `data` at `offset`. When `last` is set the blob is committed
    /// with a total length of `offset + data.len()`.
    async fn put_chunk(&mut self, offset: u64, data: Bytes, last: bool) -> BucketResult<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created,
    Uploading,
    Finalized,
}

pub struct ResumableUploadSession {
    blob_name: String,
    bytes_uploaded: u64,
    state: SessionState,
    target: Box<dyn UploadTarget>,
}

impl std::fmt::Debug for ResumableUploadSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResumableUploadSession")
            .field("blob_name", &self.blob_name)
            .field("session_url", &self.target.session_url())
            .field("bytes_uploaded", &self.bytes_uploaded)
            .field("state", &self.state)
            .finish()
    }
}

impl ResumableUploadSession {
    pub fn new(blob_name: impl Into<String>, target: Box<dyn UploadTarget>) -> Self {
        Self {
            blob_name: blob_name.into(),
            bytes_uploaded: 0,
            state: SessionState::Created,
            target,
        }
    }

    pub fn blob_name(&self) -> &str {
        &self.blob_name
    }

    pub fn session_url(&self) -> &str {
        self.target.session_url()
    }

    /// Bytes accepted by the session so far.
    pub fn bytes_uploaded(&self) -> u64 {
        self.bytes_uploaded
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Send an intermediate chunk. Returns the new cursor.
    pub async fn upload_chunk(&mut self, data: impl Into<Bytes>) -> BucketResult<u64> {
        self.send(data.into(), false).await?;
        Ok(self.bytes_uploaded)
    }

    /// Send the final bytes and commit the blob.
    pub async fn upload(&mut self, data: impl Into<Bytes>) -> BucketResult<()> {
        self.send(data.into(), true).await
    }

    async fn send(&mut self, data: Bytes, last: bool) -> BucketResult<()> {
        if self.state == SessionState::Finalized {
            return Err(BucketError::SessionFinalized {
                blob: self.blob_name.clone(),
            });
        }

        let len = data.len() as u64;
        debug!(
            blob = %self.blob_name,
            offset = self.bytes_uploaded,
            bytes = len,
            last,
            "sending upload chunk"
        );
        self.target.put_chunk(self.bytes_uploaded, data, last).await?;

        self.bytes_uploaded += len;
        if last {
            self.state = SessionState::Finalized;
            info!(
                blob = %self.blob_name,
                bytes = self.bytes_uploaded,
                "resumable upload finalized"
            );
        } else {
            self.state = SessionState::Uploading;
        }
        Ok(())
    }
}
