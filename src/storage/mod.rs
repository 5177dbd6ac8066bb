//! Object-storage boundary.
//!
//! The pipeline only needs three read operations: bucket tags, object user
//! metadata, and downloading an object (optionally a specific version) to a
//! local path.  [`ObjectStore`] captures exactly that so the pipeline can be
//! exercised against an in-memory store in tests.

#[cfg(test)]
pub mod memory;
pub mod s3;

use std::collections::HashMap;
use std::path::Path;

use anyhow::Result;

pub use s3::{build_s3_client, S3ObjectStore};

/// Read access to an S3-style object store.
#[async_trait::async_trait]
pub trait ObjectStore: Send + Sync {
    /// Tags attached to `bucket`.  A bucket with no tag set yields an empty
    /// map, not an error.
    async fn bucket_tags(&self, bucket: &str) -> Result<HashMap<String, String>>;

    /// User-defined metadata of `key` (the `x-amz-meta-*` headers, prefix
    /// stripped).
    async fn object_metadata(&self, bucket: &str, key: &str) -> Result<HashMap<String, String>>;

    /// Download `key` (at `version` when given) to `dest`, creating parent
    /// directories.  Returns the number of bytes written.
    async fn download(
        &self,
        bucket: &str,
        key: &str,
        version: Option<&str>,
        dest: &Path,
    ) -> Result<u64>;
}
