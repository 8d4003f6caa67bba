//! Uniform "bucket of named blobs" access over two backends:
//!
//! - [`LocalBucket`]: a directory tree on the local filesystem, for tests
//!   and offline development;
//! - [`CloudBucket`]: a bucket on the object-storage service (GCS JSON API).
//!
//! Both implement [`Bucket`]; resumable uploads go through
//! [`ResumableUploadSession`], opened from either backend.

pub mod bucket;
pub mod checksum;
pub mod config;
pub mod errors;
pub mod models;
pub mod prefix;
pub mod session;

pub use bucket::{Bucket, CloudBucket, LocalBucket};
pub use config::{BucketConfig, open_bucket};
pub use errors::{BucketError, BucketResult};
pub use models::BlobInfo;
pub use session::{ResumableUploadSession, SessionState};
