use crate::bucket::{Bucket, CloudBucket, LocalBucket};
use anyhow::{Context, Result, bail};
use std::{env, path::PathBuf};

/// Default endpoint of the object-storage service.
pub const DEFAULT_ENDPOINT: &str = "https://storage.googleapis.com";

/// Which backend `open_bucket` builds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Local,
    Gcs,
}

/// Settings for filesystem-backed buckets.
#[derive(Debug, Clone)]
pub struct LocalConfig {
    /// Directory under which each local bucket gets its own subdirectory.
    pub root: PathBuf,
}

/// Settings for buckets on the object-storage service.
#[derive(Debug, Clone)]
pub struct CloudConfig {
    pub endpoint: String,
    pub access_token: Option<String>,
}

/// Centralized configuration, resolved from environment variables.
#[derive(Debug, Clone)]
pub struct BucketConfig {
    pub backend: Backend,
    pub local: LocalConfig,
    pub cloud: CloudConfig,
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            root: env::temp_dir().join("bucket_utils"),
        }
    }
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.into(),
            access_token: None,
        }
    }
}

impl BucketConfig {
    /// Read the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Resolve configuration through `lookup`, falling back to defaults.
    ///
    /// - `BUCKET_UTILS_BACKEND`: `local` (default) or `gcs`
    /// - `BUCKET_UTILS_LOCAL_ROOT`: root directory for local buckets
    /// - `STORAGE_EMULATOR_HOST`: service endpoint override
    /// - `BUCKET_UTILS_ACCESS_TOKEN`: bearer token for the service
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let backend = match lookup("BUCKET_UTILS_BACKEND") {
            Some(value) => parse_backend(&value)
                .with_context(|| format!("parsing BUCKET_UTILS_BACKEND value `{}`", value))?,
            None => Backend::Local,
        };

        let local = match lookup("BUCKET_UTILS_LOCAL_ROOT") {
            Some(root) if !root.trim().is_empty() => LocalConfig { root: root.into() },
            _ => LocalConfig::default(),
        };

        let endpoint = lookup("STORAGE_EMULATOR_HOST")
            .filter(|host| !host.trim().is_empty())
            .map(normalize_endpoint)
            .unwrap_or_else(|| DEFAULT_ENDPOINT.into());
        let access_token = lookup("BUCKET_UTILS_ACCESS_TOKEN").filter(|t| !t.is_empty());

        Ok(Self {
            backend,
            local,
            cloud: CloudConfig {
                endpoint,
                access_token,
            },
        })
    }
}

fn parse_backend(value: &str) -> Result<Backend> {
    match value.trim().to_ascii_lowercase().as_str() {
        "local" => Ok(Backend::Local),
        "gcs" | "google" | "cloud" => Ok(Backend::Gcs),
        other => bail!("unknown backend `{}` (expected `local` or `gcs`)", other),
    }
}

/// Emulators are commonly given as bare `host:port`.
fn normalize_endpoint(host: String) -> String {
    let host = host.trim().trim_end_matches('/');
    if host.starts_with("http://") || host.starts_with("https://") {
        host.to_string()
    } else {
        format!("http://{}", host)
    }
}

/// Build the configured backend for bucket `name`.
pub async fn open_bucket(name: &str, cfg: &BucketConfig) -> Result<Box<dyn Bucket>> {
    let bucket: Box<dyn Bucket> = match cfg.backend {
        Backend::Local => Box::new(
            LocalBucket::from_config(name, &cfg.local)
                .await
                .with_context(|| format!("opening local bucket `{}`", name))?,
        ),
        Backend::Gcs => Box::new(
            CloudBucket::new(name, cfg.cloud.clone())
                .with_context(|| format!("opening cloud bucket `{}`", name))?,
        ),
    };
    tracing::info!(bucket = name, backend = ?cfg.backend, "opened bucket");
    Ok(bucket)
}
