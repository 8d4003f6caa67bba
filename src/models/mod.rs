//! Data carried between the bucket backends and their callers.
//!
//! `blob` holds the backend-neutral listing record; `gcs` mirrors the
//! storage service's JSON resources and maps them onto it.

pub mod blob;
pub mod gcs;

pub use blob::BlobInfo;
