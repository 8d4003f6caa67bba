//! The `Bucket` contract and its two backends.
//!
//! Backends implement the storage primitives (bytes in, bytes out, raw
//! listing, metadata). Text helpers, batch downloads and prefix/time
//! filtered listings are provided on top of those primitives so that both
//! backends answer them identically.

mod cloud;
mod local;

pub use cloud::CloudBucket;
pub use local::LocalBucket;

use crate::{
    errors::{BucketError, BucketResult},
    models::BlobInfo,
    prefix,
    session::ResumableUploadSession,
};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::{
    collections::BTreeSet,
    path::{Path, PathBuf},
};
use tracing::debug;

const MAX_BLOB_NAME_LEN: usize = 1024;

/// Prefix of the local backend's in-flight write files.
pub(crate) const STAGING_PREFIX: &str = ".tmp-";

#[async_trait]
pub trait Bucket: Send + Sync {
    /// Bucket identity; fixed at construction.
    fn name(&self) -> &str;

    /// Store `data` under `blob_name`, replacing any previous content.
    async fn upload_bytes(&self, data: Bytes, blob_name: &str) -> BucketResult<()>;

    /// Store the content of a local file under `blob_name`.
    async fn upload_filepath(&self, filepath: &Path, blob_name: &str) -> BucketResult<()>;

    /// Full content of a blob.
    async fn download_bytes(&self, blob_name: &str) -> BucketResult<Bytes>;

    /// Write a blob to `dest_path`, creating parent directories.
    async fn download_blob_to_filepath(&self, dest_path: &Path, blob_name: &str)
    -> BucketResult<()>;

    async fn exists(&self, blob_name: &str) -> BucketResult<bool>;

    /// Every blob whose full name starts with `prefix`, sorted by name.
    async fn list_blobs(&self, prefix: &str) -> BucketResult<Vec<BlobInfo>>;

    async fn delete_blob(&self, blob_name: &str) -> BucketResult<()>;

    /// Remove every blob. The bucket stays usable.
    async fn delete_all(&self) -> BucketResult<()>;

    async fn last_modified(&self, blob_name: &str) -> BucketResult<DateTime<Utc>>;

    async fn crc32c_checksum(&self, blob_name: &str) -> BucketResult<u32>;

    async fn create_resumable_upload_session(
        &self,
        blob_name: &str,
    ) -> BucketResult<ResumableUploadSession>;

    async fn upload_from_string(&self, content: &str, blob_name: &str) -> BucketResult<()> {
        self.upload_bytes(Bytes::copy_from_slice(content.as_bytes()), blob_name)
            .await
    }

    async fn download_blob_as_text(&self, blob_name: &str) -> BucketResult<String> {
        let bytes = self.download_bytes(blob_name).await?;
        String::from_utf8(bytes.to_vec()).map_err(|_| BucketError::InvalidText {
            blob: blob_name.to_string(),
        })
    }

    /// Download each blob to `directory/<base name>`. Stops at the first failure.
    async fn download_blobs_to_directory(
        &self,
        blob_names: &[String],
        directory: &Path,
    ) -> BucketResult<()> {
        for blob_name in blob_names {
            let dest = directory.join(base_name(blob_name));
            self.download_blob_to_filepath(&dest, blob_name).await?;
        }
        debug!(
            bucket = self.name(),
            count = blob_names.len(),
            directory = %directory.display(),
            "downloaded blobs to directory"
        );
        Ok(())
    }

    /// First-level names below `prefix`, optionally only those modified
    /// strictly after `since_last_modified`.
    async fn iter_blob_names(
        &self,
        prefix: &str,
        since_last_modified: Option<DateTime<Utc>>,
    ) -> BucketResult<Vec<String>> {
        let names: BTreeSet<String> = self
            .list_blobs(prefix)
            .await?
            .iter()
            .filter(|info| info.modified_after(since_last_modified))
            .filter_map(|info| prefix::next_segment(&info.name, prefix))
            .map(str::to_string)
            .collect();
        Ok(names.into_iter().collect())
    }

    /// Paths (platform separators) of blobs matching `prefix`, optionally
    /// only those modified strictly after `since_last_modified`.
    async fn iter_blob_paths(
        &self,
        prefix: &str,
        since_last_modified: Option<DateTime<Utc>>,
    ) -> BucketResult<Vec<PathBuf>> {
        let paths: BTreeSet<PathBuf> = self
            .list_blobs(prefix)
            .await?
            .iter()
            .filter(|info| info.modified_after(since_last_modified))
            .filter_map(|info| prefix::relative_path(&info.name, prefix))
            .collect();
        Ok(paths.into_iter().collect())
    }
}

/// Last `/`-separated segment of a blob name.
pub(crate) fn base_name(blob_name: &str) -> &str {
    blob_name
        .rsplit(prefix::SEPARATOR)
        .next()
        .unwrap_or(blob_name)
}

/// Reject names that cannot be stored safely by every backend.
pub(crate) fn ensure_blob_name_safe(name: &str) -> BucketResult<()> {
    let invalid = |reason: &str| {
        Err(BucketError::InvalidBlobName {
            name: name.to_string(),
            reason: reason.to_string(),
        })
    };

    if name.is_empty() {
        return invalid("must not be empty");
    }
    if name.len() > MAX_BLOB_NAME_LEN {
        return invalid("must be at most 1024 bytes");
    }
    if name.starts_with(prefix::SEPARATOR) || name.ends_with(prefix::SEPARATOR) {
        return invalid("must not begin or end with `/`");
    }
    if name
        .bytes()
        .any(|b| b.is_ascii_control() || b == b'\\')
    {
        return invalid("control characters and `\\` are not allowed");
    }
    for segment in name.split(prefix::SEPARATOR) {
        if segment.is_empty() || segment == "." || segment == ".." {
            return invalid("empty, `.` and `..` segments are not allowed");
        }
        if segment.starts_with(STAGING_PREFIX) {
            return invalid("segments starting with `.tmp-` are reserved");
        }
    }
    Ok(())
}
