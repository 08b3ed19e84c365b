//! Remote blob storage
//!
//! The [`BlobStore`] trait moves single objects to and from object storage
//! and mints signed URLs. [`S3Client`] talks to S3-compatible services;
//! [`MemoryBlobStore`] keeps objects in process for offline use and tests.
//! Nothing in this module retries; retry policy lives with the callers.

pub mod credentials;
pub mod memory;
pub mod s3;
pub mod signing;
pub mod types;

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::Result;

pub use credentials::Credentials;
pub use memory::MemoryBlobStore;
pub use s3::S3Client;
pub use types::*;

/// Object storage operations used by the remote cache tier
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Stream a local file to `key`, returning the number of bytes sent
    ///
    /// The content length is taken from the file's metadata before the
    /// stream is read.
    async fn upload_file(&self, key: &RemoteObjectKey, source: &Path) -> Result<u64>;

    /// Store an in-memory object
    async fn upload_bytes(&self, key: &RemoteObjectKey, data: Bytes) -> Result<()>;

    /// Fetch an object; a missing object is [`crate::CacheError::ObjectMissing`]
    async fn download(&self, key: &RemoteObjectKey) -> Result<Bytes>;

    /// Whether an object exists
    async fn exists(&self, key: &RemoteObjectKey) -> Result<bool>;

    /// Delete an object (deleting a missing object succeeds)
    async fn delete(&self, key: &RemoteObjectKey) -> Result<()>;

    /// Presign a GET or PUT for `key`, valid for `expiry`
    fn signed_url(
        &self,
        key: &RemoteObjectKey,
        method: HttpMethod,
        expiry: Duration,
    ) -> Result<SignedUrl>;

    /// Download through a signed URL without using credentials
    async fn fetch_signed(&self, url: &SignedUrl) -> Result<Bytes>;

    /// Release connections; later calls fail with `RemoteUnavailable`
    async fn shutdown(&self);
}
