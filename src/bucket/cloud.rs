//! CloudBucket: a bucket on the object-storage service (GCS JSON API v1).
//!
//! Every operation is one or more HTTP calls; prefix filtering is done by
//! the service's listing, time filtering locally on each object's
//! `updated` field. A 404 for a named object always surfaces as
//! `BlobNotFound`.

use super::{Bucket, ensure_blob_name_safe};
use crate::{
    checksum::{self, Crc32cHasher},
    config::CloudConfig,
    errors::{BucketError, BucketResult},
    models::{
        BlobInfo,
        gcs::{ObjectList, ObjectResource},
    },
    session::{ResumableUploadSession, UploadTarget},
};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use reqwest::{
    Client, Method, RequestBuilder, Response, StatusCode, Url,
    header::{CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE, LOCATION, RANGE},
};
use std::{
    path::Path,
    sync::{Arc, Mutex, PoisonError},
};
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tokio_util::io::ReaderStream;
use tracing::{debug, info};

/// Intermediate resumable chunks must be multiples of this size.
const CHUNK_ALIGN: usize = 256 * 1024;

const OCTET_STREAM: &str = "application/octet-stream";

/// Bucket stored on the remote object-storage service.
#[derive(Clone, Debug)]
pub struct CloudBucket {
    name: String,
    endpoint: Url,
    access_token: Option<String>,
    client: Client,
}

impl CloudBucket {
    /// Connect to bucket `name`. No request is made until the first operation.
    pub fn new(name: impl Into<String>, cfg: CloudConfig) -> BucketResult<Self> {
        // 308 is the service's "resume incomplete", not a redirect to follow
        let client = Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Self::with_client(name, cfg, client)
    }

    /// Use a preconfigured HTTP client. It must not follow redirects.
    pub fn with_client(
        name: impl Into<String>,
        cfg: CloudConfig,
        client: Client,
    ) -> BucketResult<Self> {
        let endpoint = Url::parse(&cfg.endpoint).map_err(|err| BucketError::InvalidEndpoint {
            endpoint: cfg.endpoint.clone(),
            reason: err.to_string(),
        })?;
        if endpoint.cannot_be_a_base() {
            return Err(BucketError::InvalidEndpoint {
                endpoint: cfg.endpoint,
                reason: "not a base URL".into(),
            });
        }

        let name = name.into();
        info!(bucket = %name, endpoint = %endpoint, "opened cloud bucket");
        Ok(Self {
            name,
            endpoint,
            access_token: cfg.access_token,
            client,
        })
    }

    /// Endpoint URL with `segments` appended, each percent-encoded (a `/`
    /// inside a blob name becomes `%2F`).
    fn url(&self, segments: &[&str]) -> BucketResult<Url> {
        let mut url = self.endpoint.clone();
        url.path_segments_mut()
            .map_err(|_| BucketError::InvalidEndpoint {
                endpoint: self.endpoint.to_string(),
                reason: "not a base URL".into(),
            })?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn object_url(&self, blob_name: &str) -> BucketResult<Url> {
        self.url(&["storage", "v1", "b", self.name.as_str(), "o", blob_name])
    }

    fn list_url(&self) -> BucketResult<Url> {
        self.url(&["storage", "v1", "b", self.name.as_str(), "o"])
    }

    fn upload_url(&self) -> BucketResult<Url> {
        self.url(&["upload", "storage", "v1", "b", self.name.as_str(), "o"])
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        authorize(self.client.request(method, url), self.access_token.as_deref())
    }

    /// Pass successful responses through; map 404 on `blob_name` to
    /// `BlobNotFound` and anything else to `Service`.
    async fn check(&self, response: Response, blob_name: Option<&str>) -> BucketResult<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        if status == StatusCode::NOT_FOUND {
            if let Some(blob_name) = blob_name {
                return Err(BucketError::not_found(&self.name, blob_name));
            }
        }
        Err(service_error(response).await)
    }

    /// Object metadata (`objects.get`).
    pub async fn metadata(&self, blob_name: &str) -> BucketResult<ObjectResource> {
        ensure_blob_name_safe(blob_name)?;
        let response = self
            .request(Method::GET, self.object_url(blob_name)?)
            .send()
            .await?;
        let response = self.check(response, Some(blob_name)).await?;
        Ok(response.json::<ObjectResource>().await?)
    }

    /// `objects.get?alt=media`, checked for existence.
    async fn media(&self, blob_name: &str) -> BucketResult<Response> {
        ensure_blob_name_safe(blob_name)?;
        let response = self
            .request(Method::GET, self.object_url(blob_name)?)
            .query(&[("alt", "media")])
            .send()
            .await?;
        self.check(response, Some(blob_name)).await
    }

    /// Compare the service's `md5Hash` (when reported) with ours.
    fn verify_md5(&self, blob_name: &str, stored: &ObjectResource, expected: String) -> BucketResult<()> {
        match stored.md5_hash.as_deref() {
            Some(actual) if actual != expected => Err(BucketError::ChecksumMismatch {
                blob: blob_name.to_string(),
                expected,
                actual: actual.to_string(),
            }),
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl Bucket for CloudBucket {
    fn name(&self) -> &str {
        &self.name
    }

    async fn upload_bytes(&self, data: Bytes, blob_name: &str) -> BucketResult<()> {
        ensure_blob_name_safe(blob_name)?;
        let expected = checksum::md5_base64(&data);
        let len = data.len();

        let response = self
            .request(Method::POST, self.upload_url()?)
            .query(&[("uploadType", "media"), ("name", blob_name)])
            .header(CONTENT_TYPE, OCTET_STREAM)
            .body(data)
            .send()
            .await?;
        let stored: ObjectResource = self.check(response, None).await?.json().await?;
        self.verify_md5(blob_name, &stored, expected)?;

        debug!(bucket = %self.name, blob = blob_name, bytes = len, "uploaded blob");
        Ok(())
    }

    async fn upload_filepath(&self, filepath: &Path, blob_name: &str) -> BucketResult<()> {
        ensure_blob_name_safe(blob_name)?;
        let file = File::open(filepath).await?;
        let len = file.metadata().await?.len();

        // hash while streaming
        let digest = Arc::new(Mutex::new(md5::Context::new()));
        let hashing = digest.clone();
        let stream = ReaderStream::new(file).map(move |chunk| {
            if let Ok(bytes) = &chunk {
                hashing
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .consume(bytes);
            }
            chunk
        });

        let response = self
            .request(Method::POST, self.upload_url()?)
            .query(&[("uploadType", "media"), ("name", blob_name)])
            .header(CONTENT_TYPE, OCTET_STREAM)
            .header(CONTENT_LENGTH, len)
            .body(reqwest::Body::wrap_stream(stream))
            .send()
            .await?;
        let stored: ObjectResource = self.check(response, None).await?.json().await?;

        let computed = digest
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .compute();
        self.verify_md5(blob_name, &stored, checksum::encode_md5(computed))?;

        debug!(
            bucket = %self.name,
            blob = blob_name,
            bytes = len,
            source = %filepath.display(),
            "uploaded file"
        );
        Ok(())
    }

    async fn download_bytes(&self, blob_name: &str) -> BucketResult<Bytes> {
        Ok(self.media(blob_name).await?.bytes().await?)
    }

    async fn download_blob_to_filepath(
        &self,
        dest_path: &Path,
        blob_name: &str,
    ) -> BucketResult<()> {
        let response = self.media(blob_name).await?;
        if let Some(parent) = dest_path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let mut file = File::create(dest_path).await?;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let written = match chunk {
                Ok(chunk) => file.write_all(&chunk).await.map_err(BucketError::Io),
                Err(err) => Err(BucketError::Http(err)),
            };
            if let Err(err) = written {
                let _ = fs::remove_file(dest_path).await;
                return Err(err);
            }
        }
        file.flush().await?;

        debug!(
            bucket = %self.name,
            blob = blob_name,
            dest = %dest_path.display(),
            "downloaded blob"
        );
        Ok(())
    }

    async fn exists(&self, blob_name: &str) -> BucketResult<bool> {
        match self.metadata(blob_name).await {
            Ok(_) => Ok(true),
            Err(BucketError::BlobNotFound { .. }) => Ok(false),
            Err(err) => Err(err),
        }
    }

    async fn list_blobs(&self, prefix: &str) -> BucketResult<Vec<BlobInfo>> {
        let mut blobs = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut request = self.request(Method::GET, self.list_url()?);
            if !prefix.is_empty() {
                request = request.query(&[("prefix", prefix)]);
            }
            if let Some(token) = &page_token {
                request = request.query(&[("pageToken", token.as_str())]);
            }

            let response = self.check(request.send().await?, None).await?;
            let page: ObjectList = response.json().await?;
            blobs.extend(page.items.into_iter().map(BlobInfo::from));

            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }

        blobs.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(blobs)
    }

    async fn delete_blob(&self, blob_name: &str) -> BucketResult<()> {
        ensure_blob_name_safe(blob_name)?;
        let response = self
            .request(Method::DELETE, self.object_url(blob_name)?)
            .send()
            .await?;
        self.check(response, Some(blob_name)).await?;
        debug!(bucket = %self.name, blob = blob_name, "deleted blob");
        Ok(())
    }

    async fn delete_all(&self) -> BucketResult<()> {
        let blobs = self.list_blobs("").await?;
        for blob in &blobs {
            match self.delete_blob(&blob.name).await {
                // already gone is what we want
                Ok(()) | Err(BucketError::BlobNotFound { .. }) => {}
                Err(err) => return Err(err),
            }
        }
        info!(bucket = %self.name, count = blobs.len(), "deleted all blobs");
        Ok(())
    }

    async fn last_modified(&self, blob_name: &str) -> BucketResult<DateTime<Utc>> {
        Ok(self.metadata(blob_name).await?.updated)
    }

    async fn crc32c_checksum(&self, blob_name: &str) -> BucketResult<u32> {
        let stored = self.metadata(blob_name).await?;
        if let Some(value) = stored.crc32c.as_deref().and_then(checksum::decode_crc32c) {
            return Ok(value);
        }

        debug!(bucket = %self.name, blob = blob_name, "no stored crc32c, computing locally");
        let mut hasher = Crc32cHasher::new();
        let mut stream = self.media(blob_name).await?.bytes_stream();
        while let Some(chunk) = stream.next().await {
            hasher.update(&chunk?);
        }
        Ok(hasher.finalize())
    }

    async fn create_resumable_upload_session(
        &self,
        blob_name: &str,
    ) -> BucketResult<ResumableUploadSession> {
        ensure_blob_name_safe(blob_name)?;
        let response = self
            .request(Method::POST, self.upload_url()?)
            .query(&[("uploadType", "resumable"), ("name", blob_name)])
            .header("X-Upload-Content-Type", OCTET_STREAM)
            .header(CONTENT_LENGTH, 0)
            .send()
            .await?;
        let response = self.check(response, None).await?;

        let session_url = response
            .headers()
            .get(LOCATION)
            .and_then(|value| value.to_str().ok())
            .ok_or_else(|| BucketError::SessionRejected {
                blob: blob_name.to_string(),
                reason: "service did not return a session URL".into(),
            })?
            .to_string();

        debug!(bucket = %self.name, blob = blob_name, url = %session_url, "created upload session");
        let target = CloudUploadTarget {
            client: self.client.clone(),
            access_token: self.access_token.clone(),
            blob_name: blob_name.to_string(),
            session_url,
            committed: 0,
            pending: BytesMut::new(),
            digest: md5::Context::new(),
        };
        Ok(ResumableUploadSession::new(blob_name, Box::new(target)))
    }
}

/// Resumable session on the service.
///
/// Chunks smaller than `CHUNK_ALIGN` are held back until enough data has
/// arrived (or the final chunk is sent), since the service only accepts
/// aligned intermediate chunks.
struct CloudUploadTarget {
    client: Client,
    access_token: Option<String>,
    blob_name: String,
    session_url: String,
    /// Bytes the service has persisted.
    committed: u64,
    /// Accepted from the caller but not yet sent.
    pending: BytesMut,
    digest: md5::Context,
}

impl CloudUploadTarget {
    fn rejected(&self, reason: impl Into<String>) -> BucketError {
        BucketError::SessionRejected {
            blob: self.blob_name.clone(),
            reason: reason.into(),
        }
    }

    async fn put(&self, content_range: String, body: Bytes) -> BucketResult<Response> {
        let request = self
            .client
            .put(&self.session_url)
            .header(CONTENT_RANGE, content_range)
            .header(CONTENT_LENGTH, body.len())
            .body(body);
        let response = authorize(request, self.access_token.as_deref()).send().await?;

        match response.status() {
            StatusCode::NOT_FOUND | StatusCode::GONE => Err(BucketError::SessionExpired {
                blob: self.blob_name.clone(),
            }),
            _ => Ok(response),
        }
    }
}

#[async_trait]
impl UploadTarget for CloudUploadTarget {
    fn session_url(&self) -> &str {
        &self.session_url
    }

    async fn put_chunk(&mut self, offset: u64, data: Bytes, last: bool) -> BucketResult<()> {
        let buffered = self.committed + self.pending.len() as u64;
        if offset != buffered {
            return Err(self.rejected(format!(
                "chunk offset {} does not match accepted {}",
                offset, buffered
            )));
        }

        // work on copies so a failed request leaves the target untouched
        let mut pending = self.pending.clone();
        pending.extend_from_slice(&data);
        let mut digest = self.digest.clone();
        digest.consume(&data);

        if last {
            let total = self.committed + pending.len() as u64;
            let content_range = if pending.is_empty() {
                format!("bytes */{}", total)
            } else {
                format!("bytes {}-{}/{}", self.committed, total - 1, total)
            };
            let response = self.put(content_range, pending.freeze()).await?;
            if !response.status().is_success() {
                let err = service_error(response).await;
                return Err(self.rejected(err.to_string()));
            }

            let stored: ObjectResource = response.json().await?;
            let expected = checksum::encode_md5(digest.compute());
            if let Some(actual) = stored.md5_hash.filter(|actual| *actual != expected) {
                return Err(BucketError::ChecksumMismatch {
                    blob: self.blob_name.clone(),
                    expected,
                    actual,
                });
            }
            self.committed = total;
            self.pending = BytesMut::new();
            return Ok(());
        }

        let aligned = pending.len() / CHUNK_ALIGN * CHUNK_ALIGN;
        if aligned > 0 {
            let start = self.committed;
            let end = start + aligned as u64;
            let chunk = pending.split_to(aligned).freeze();
            let response = self
                .put(format!("bytes {}-{}/*", start, end - 1), chunk)
                .await?;
            if response.status() != StatusCode::PERMANENT_REDIRECT {
                let err = service_error(response).await;
                return Err(self.rejected(err.to_string()));
            }

            let persisted = persisted_bytes(&response);
            if persisted != end {
                return Err(self.rejected(format!(
                    "service persisted {} bytes, expected {}",
                    persisted, end
                )));
            }
            self.committed = end;
            debug!(blob = %self.blob_name, committed = end, "chunk persisted");
        }

        self.pending = pending;
        self.digest = digest;
        Ok(())
    }
}

fn authorize(request: RequestBuilder, token: Option<&str>) -> RequestBuilder {
    match token {
        Some(token) => request.bearer_auth(token),
        None => request,
    }
}

async fn service_error(response: Response) -> BucketError {
    let status = response.status().as_u16();
    let message = response.text().await.unwrap_or_default();
    BucketError::Service { status, message }
}

/// Byte count from a `Range: bytes=0-N` header; none means nothing persisted.
fn persisted_bytes(response: &Response) -> u64 {
    response
        .headers()
        .get(RANGE)
        .and_then(|value| value.to_str().ok())
        .and_then(parse_range_end)
        .map_or(0, |last| last + 1)
}

fn parse_range_end(value: &str) -> Option<u64> {
    let (_, last) = value.strip_prefix("bytes=")?.split_once('-')?;
    last.trim().parse().ok()
}
