//! LocalBucket: a bucket emulated on the local filesystem.
//!
//! Blob `a/b/c` is stored at `directory/a/b/c`. Writes land in a
//! `.tmp-{uuid}` file next to their target and are renamed into place, so a
//! reader sees either the old content or the new one. Resumable sessions
//! are buffered in memory per bucket and only written on finalize.
//!
//! Unlike the service's flat namespace, a directory tree cannot hold both
//! `a` and `a/b`: once one exists, writing the other fails with an I/O
//! error, and reads of the other report `BlobNotFound`.

use super::{Bucket, STAGING_PREFIX, ensure_blob_name_safe};
use crate::{
    checksum::Crc32cHasher,
    config::LocalConfig,
    errors::{BucketError, BucketResult, map_read_err},
    models::BlobInfo,
    prefix::SEPARATOR,
    session::{ResumableUploadSession, UploadTarget},
};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use std::{
    collections::HashMap,
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::{
    fs::{self, File},
    io::{AsyncReadExt, AsyncWriteExt},
    sync::Mutex,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

const READ_BUF_SIZE: usize = 64 * 1024;

/// Staged content of unfinished resumable uploads, keyed by session id.
type StagedUploads = Arc<Mutex<HashMap<Uuid, BytesMut>>>;

/// Filesystem-backed bucket.
///
/// Clones share the same directory and the same staging area, so a session
/// opened from one clone can be finalized while another clone is reading.
#[derive(Clone, Debug)]
pub struct LocalBucket {
    name: String,
    directory: PathBuf,
    staged: StagedUploads,
}

impl LocalBucket {
    /// Open (creating if needed) a bucket rooted at `directory`.
    pub async fn new(name: impl Into<String>, directory: impl Into<PathBuf>) -> BucketResult<Self> {
        let name = name.into();
        let directory = directory.into();
        fs::create_dir_all(&directory).await?;
        info!(bucket = %name, directory = %directory.display(), "opened local bucket");
        Ok(Self {
            name,
            directory,
            staged: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Open a bucket at `cfg.root/{name}`.
    pub async fn from_config(name: &str, cfg: &LocalConfig) -> BucketResult<Self> {
        Self::new(name, cfg.root.join(name)).await
    }

    /// Root directory of the bucket.
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Filesystem path of a blob. Parent directories may not exist yet.
    fn blob_path(&self, blob_name: &str) -> PathBuf {
        let mut path = self.directory.clone();
        path.extend(blob_name.split(SEPARATOR));
        path
    }

    /// Write `data` to `blob_name` through a staging file and an atomic rename.
    async fn write_blob(&self, blob_name: &str, data: &[u8]) -> BucketResult<()> {
        ensure_blob_name_safe(blob_name)?;
        let file_path = self.blob_path(blob_name);
        let parent = parent_of(&file_path)?;
        fs::create_dir_all(&parent).await?;

        let tmp_path = parent.join(format!("{}{}", STAGING_PREFIX, Uuid::new_v4()));
        if let Err(err) = write_and_sync(&tmp_path, data).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(BucketError::Io(err));
        }
        if let Err(err) = fs::rename(&tmp_path, &file_path).await {
            if err.kind() == ErrorKind::AlreadyExists {
                fs::remove_file(&file_path).await?;
                fs::rename(&tmp_path, &file_path).await?;
            } else {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(BucketError::Io(err));
            }
        }

        debug!(bucket = %self.name, blob = blob_name, bytes = data.len(), "stored blob");
        Ok(())
    }

    /// Metadata of an existing blob file; directories count as missing.
    async fn blob_metadata(&self, blob_name: &str) -> BucketResult<std::fs::Metadata> {
        ensure_blob_name_safe(blob_name)?;
        let meta = fs::metadata(self.blob_path(blob_name))
            .await
            .map_err(|err| map_read_err(err, &self.name, blob_name))?;
        if !meta.is_file() {
            return Err(BucketError::not_found(&self.name, blob_name));
        }
        Ok(meta)
    }

    /// Recursively remove empty directories up to (not including) the root.
    async fn prune_empty_dirs(&self, start: &Path) {
        let mut current = start.to_path_buf();
        while current.starts_with(&self.directory) && current != self.directory {
            match fs::remove_dir(&current).await {
                Ok(_) => match current.parent() {
                    Some(parent) => current = parent.to_path_buf(),
                    None => break,
                },
                Err(err) if err.kind() == ErrorKind::NotFound => break,
                Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => break,
                Err(err) => {
                    warn!(bucket = %self.name, dir = %current.display(), error = %err, "failed to prune directory");
                    break;
                }
            }
        }
    }

    fn session_url(&self, blob_name: &str, id: Uuid) -> String {
        format!("local://{}/{}?upload_id={}", self.name, blob_name, id)
    }
}

#[async_trait]
impl Bucket for LocalBucket {
    fn name(&self) -> &str {
        &self.name
    }

    async fn upload_bytes(&self, data: Bytes, blob_name: &str) -> BucketResult<()> {
        self.write_blob(blob_name, &data).await
    }

    async fn upload_filepath(&self, filepath: &Path, blob_name: &str) -> BucketResult<()> {
        let data = fs::read(filepath).await?;
        self.write_blob(blob_name, &data).await
    }

    async fn download_bytes(&self, blob_name: &str) -> BucketResult<Bytes> {
        self.blob_metadata(blob_name).await?;
        let data = fs::read(self.blob_path(blob_name))
            .await
            .map_err(|err| map_read_err(err, &self.name, blob_name))?;
        Ok(Bytes::from(data))
    }

    async fn download_blob_to_filepath(
        &self,
        dest_path: &Path,
        blob_name: &str,
    ) -> BucketResult<()> {
        self.blob_metadata(blob_name).await?;
        if let Some(parent) = dest_path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::copy(self.blob_path(blob_name), dest_path)
            .await
            .map_err(|err| map_read_err(err, &self.name, blob_name))?;
        debug!(
            bucket = %self.name,
            blob = blob_name,
            dest = %dest_path.display(),
            "downloaded blob"
        );
        Ok(())
    }

    async fn exists(&self, blob_name: &str) -> BucketResult<bool> {
        match self.blob_metadata(blob_name).await {
            Ok(_) => Ok(true),
            Err(BucketError::BlobNotFound { .. }) => Ok(false),
            Err(err) => Err(err),
        }
    }

    async fn list_blobs(&self, prefix: &str) -> BucketResult<Vec<BlobInfo>> {
        let mut blobs = Vec::new();
        let mut pending = vec![self.directory.clone()];

        while let Some(dir) = pending.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                // removed concurrently, e.g. by delete_all
                Err(err) if err.kind() == ErrorKind::NotFound => continue,
                Err(err) => return Err(BucketError::Io(err)),
            };

            while let Some(entry) = entries.next_entry().await? {
                let file_type = entry.file_type().await?;
                if file_type.is_dir() {
                    pending.push(entry.path());
                    continue;
                }
                if entry.file_name().to_string_lossy().starts_with(STAGING_PREFIX) {
                    continue;
                }

                let Some(name) = blob_name_of(&self.directory, &entry.path()) else {
                    continue;
                };
                if !name.starts_with(prefix) {
                    continue;
                }
                let modified = entry.metadata().await?.modified()?;
                blobs.push(BlobInfo {
                    name,
                    last_modified: DateTime::<Utc>::from(modified),
                });
            }
        }

        blobs.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(blobs)
    }

    async fn delete_blob(&self, blob_name: &str) -> BucketResult<()> {
        self.blob_metadata(blob_name).await?;
        let file_path = self.blob_path(blob_name);
        fs::remove_file(&file_path)
            .await
            .map_err(|err| map_read_err(err, &self.name, blob_name))?;
        debug!(bucket = %self.name, blob = blob_name, "deleted blob");

        if let Some(parent) = file_path.parent() {
            self.prune_empty_dirs(parent).await;
        }
        Ok(())
    }

    async fn delete_all(&self) -> BucketResult<()> {
        match fs::remove_dir_all(&self.directory).await {
            Ok(_) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => return Err(BucketError::Io(err)),
        }
        fs::create_dir_all(&self.directory).await?;

        let discarded = {
            let mut staged = self.staged.lock().await;
            let count = staged.len();
            staged.clear();
            count
        };
        if discarded > 0 {
            warn!(bucket = %self.name, sessions = discarded, "discarded unfinished upload sessions");
        }
        info!(bucket = %self.name, "deleted all blobs");
        Ok(())
    }

    async fn last_modified(&self, blob_name: &str) -> BucketResult<DateTime<Utc>> {
        let modified = self.blob_metadata(blob_name).await?.modified()?;
        Ok(DateTime::<Utc>::from(modified))
    }

    async fn crc32c_checksum(&self, blob_name: &str) -> BucketResult<u32> {
        self.blob_metadata(blob_name).await?;
        let mut file = File::open(self.blob_path(blob_name))
            .await
            .map_err(|err| map_read_err(err, &self.name, blob_name))?;

        let mut hasher = Crc32cHasher::new();
        let mut buf = vec![0u8; READ_BUF_SIZE];
        loop {
            let read = file.read(&mut buf).await?;
            if read == 0 {
                break;
            }
            hasher.update(&buf[..read]);
        }
        Ok(hasher.finalize())
    }

    async fn create_resumable_upload_session(
        &self,
        blob_name: &str,
    ) -> BucketResult<ResumableUploadSession> {
        ensure_blob_name_safe(blob_name)?;
        let id = Uuid::new_v4();
        self.staged.lock().await.insert(id, BytesMut::new());

        let target = LocalUploadTarget {
            bucket: self.clone(),
            blob_name: blob_name.to_string(),
            id,
            url: self.session_url(blob_name, id),
        };
        debug!(bucket = %self.name, blob = blob_name, session = %id, "created upload session");
        Ok(ResumableUploadSession::new(blob_name, Box::new(target)))
    }
}

/// Session target that buffers chunks in the bucket's staging area.
struct LocalUploadTarget {
    bucket: LocalBucket,
    blob_name: String,
    id: Uuid,
    url: String,
}

impl LocalUploadTarget {
    fn expired(&self) -> BucketError {
        BucketError::SessionExpired {
            blob: self.blob_name.clone(),
        }
    }
}

#[async_trait]
impl UploadTarget for LocalUploadTarget {
    fn session_url(&self) -> &str {
        &self.url
    }

    async fn put_chunk(&mut self, offset: u64, data: Bytes, last: bool) -> BucketResult<()> {
        let content = {
            let mut staged = self.bucket.staged.lock().await;
            let buffer = staged.get_mut(&self.id).ok_or_else(|| self.expired())?;
            if buffer.len() as u64 != offset {
                return Err(BucketError::SessionRejected {
                    blob: self.blob_name.clone(),
                    reason: format!("chunk offset {} does not match staged {}", offset, buffer.len()),
                });
            }
            if !last {
                buffer.extend_from_slice(&data);
                return Ok(());
            }
            let mut content = BytesMut::with_capacity(buffer.len() + data.len());
            content.extend_from_slice(&buffer[..]);
            content.extend_from_slice(&data);
            content
        };

        // staged bytes are dropped only once the blob is written
        self.bucket.write_blob(&self.blob_name, &content).await?;
        self.bucket.staged.lock().await.remove(&self.id);
        Ok(())
    }
}

fn parent_of(path: &Path) -> BucketResult<PathBuf> {
    path.parent().map(Path::to_path_buf).ok_or_else(|| {
        BucketError::Io(io::Error::new(
            ErrorKind::Other,
            "blob path missing parent directory",
        ))
    })
}

async fn write_and_sync(path: &Path, data: &[u8]) -> io::Result<()> {
    let mut file = File::create(path).await?;
    file.write_all(data).await?;
    file.flush().await?;
    file.sync_all().await
}

/// `/`-separated blob name of `path` relative to `root`.
fn blob_name_of(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let segments: Vec<String> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    if segments.is_empty() {
        return None;
    }
    Some(segments.join(SEPARATOR.to_string().as_str()))
}
