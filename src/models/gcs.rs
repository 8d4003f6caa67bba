//! JSON resources exchanged with the object-storage service.

use super::blob::BlobInfo;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Object metadata as returned by `objects.get`, `objects.insert` and
/// inside `objects.list` pages.
///
/// Only the fields this crate reads are modeled; the service sends more.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct ObjectResource {
    /// Object name (the blob name).
    pub name: String,

    /// Last modification time (RFC 3339).
    pub updated: DateTime<Utc>,

    /// Base64 of the big-endian CRC32C, computed server-side.
    #[serde(default)]
    pub crc32c: Option<String>,

    /// Base64 MD5 digest; absent for composite objects.
    #[serde(default)]
    pub md5_hash: Option<String>,

    /// Content length, encoded by the service as a decimal string.
    #[serde(default)]
    pub size: Option<String>,
}

impl From<ObjectResource> for BlobInfo {
    fn from(resource: ObjectResource) -> Self {
        BlobInfo {
            name: resource.name,
            last_modified: resource.updated,
        }
    }
}

/// One page of an `objects.list` response.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct ObjectList {
    #[serde(default)]
    pub items: Vec<ObjectResource>,

    #[serde(default)]
    pub next_page_token: Option<String>,
}
