//! Tiered Action Cache
//!
//! A build action cache with two tiers: a local key/entry store and an
//! optional shared tier in S3-compatible object storage. Output files are
//! stored remotely under content-addressed keys, and an entry descriptor is
//! published only once every output it names has been uploaded.

pub mod cache;
pub mod config;
pub mod digest;
pub mod entry;
pub mod error;
pub mod local;
pub mod remote;
pub mod retry;
pub mod upload;

pub use cache::RemoteActionCache;
pub use config::{CacheConfig, RemoteConfig, RetryConfig};
pub use digest::FileDigest;
pub use entry::{CacheEntry, OutputFile};
pub use error::{CacheError, ErrorKind, Result};
pub use local::{ActionCache, FileActionCache, LocalStore};
pub use remote::{BlobStore, HttpMethod, MemoryBlobStore, RemoteObjectKey, S3Client, SignedUrl};
