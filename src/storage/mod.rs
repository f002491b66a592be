//! Object store capability.
//!
//! The decision engine only needs three things from the bucket: an existence
//! probe, a write of a fully spooled artifact, and an address clients can
//! download from.  [`ObjectStore`] is that seam; [`s3::S3Store`] is the
//! production implementation.

pub mod s3;

#[cfg(test)]
pub mod memory;

use std::path::Path;

use anyhow::Result;

use crate::cache::CacheKey;

#[async_trait::async_trait]
pub trait ObjectStore: Send + Sync {
    /// Whether a complete object is stored under `key`.
    async fn exists(&self, key: &CacheKey) -> Result<bool>;

    /// Upload the file at `spool` (exactly `length` bytes) under `key`.
    async fn put(&self, key: &CacheKey, spool: &Path, length: u64) -> Result<()>;

    /// Externally reachable download address for `key`.
    async fn download_url(&self, key: &CacheKey) -> Result<String>;

    /// Cheap reachability probe used by the health endpoint.
    async fn probe(&self) -> Result<()>;
}
