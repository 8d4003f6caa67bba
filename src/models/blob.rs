//! Represents a blob (named object) seen through a bucket listing.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single listed blob.
///
/// Listings carry the name and modification time only; content and
/// checksums are fetched on demand through the owning bucket.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct BlobInfo {
    /// Full slash-separated name within the bucket.
    pub name: String,

    /// Last modification instant, always UTC.
    pub last_modified: DateTime<Utc>,
}

impl BlobInfo {
    /// True when the blob changed strictly after `since` (or no bound was given).
    pub fn modified_after(&self, since: Option<DateTime<Utc>>) -> bool {
        since.is_none_or(|since| self.last_modified > since)
    }
}
