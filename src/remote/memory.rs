//! In-Process Blob Store
//!
//! Keeps objects in a map. Used for offline runs of the remote tier and in
//! tests, where failures and latency can be injected.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{PoisonError, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::Url;
use tracing::debug;

use super::types::{validate_expiry, HttpMethod, RemoteObjectKey, SignedUrl};
use super::BlobStore;
use crate::error::{CacheError, Result};

/// URL scheme of signed URLs minted by this store
const SCHEME: &str = "memory";

/// Object store held in memory
#[derive(Default)]
pub struct MemoryBlobStore {
    objects: RwLock<HashMap<RemoteObjectKey, Bytes>>,
    /// Object keys whose uploads fail with `RemoteUnavailable`
    failing_uploads: RwLock<HashSet<String>>,
    /// Reject every call as if the service were unreachable
    unavailable: AtomicBool,
    /// Artificial delay applied to every call
    latency: RwLock<Option<Duration>>,
    /// Calls slower than this fail with `DeadlineExceeded`
    deadline: RwLock<Option<Duration>>,
    shut_down: AtomicBool,
    uploads: AtomicUsize,
    downloads: RwLock<HashMap<String, usize>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make uploads to `key` fail
    pub fn fail_uploads_to(&self, key: &str) {
        self.failing_uploads
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string());
    }

    /// Simulate the service going away (or coming back)
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Delay every call by `latency`
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.write().unwrap_or_else(PoisonError::into_inner) = latency;
    }

    /// Bound every call, the way the S3 client bounds each request
    pub fn set_deadline(&self, deadline: Option<Duration>) {
        *self.deadline.write().unwrap_or_else(PoisonError::into_inner) = deadline;
    }

    /// Number of objects written (file and byte uploads)
    pub fn upload_count(&self) -> usize {
        self.uploads.load(Ordering::SeqCst)
    }

    /// Number of downloads of `key`
    pub fn download_count(&self, key: &str) -> usize {
        self.downloads
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .copied()
            .unwrap_or(0)
    }

    pub fn contains(&self, key: &RemoteObjectKey) -> bool {
        self.objects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(key)
    }

    pub fn object(&self, key: &RemoteObjectKey) -> Option<Bytes> {
        self.objects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.objects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Apply latency and availability before serving a call
    async fn enter(&self) -> Result<()> {
        let latency = *self.latency.read().unwrap_or_else(PoisonError::into_inner);
        let deadline = *self.deadline.read().unwrap_or_else(PoisonError::into_inner);
        match (latency, deadline) {
            (Some(latency), Some(deadline)) if latency > deadline => {
                tokio::time::sleep(deadline).await;
                return Err(CacheError::DeadlineExceeded {
                    operation: "memory blob store call".to_string(),
                    timeout: deadline,
                });
            }
            (Some(latency), _) => tokio::time::sleep(latency).await,
            _ => {}
        }
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(CacheError::RemoteUnavailable(
                "blob store has been shut down".to_string(),
            ));
        }
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(CacheError::RemoteUnavailable(
                "simulated outage".to_string(),
            ));
        }
        Ok(())
    }

    fn store(&self, key: &RemoteObjectKey, data: Bytes) -> Result<()> {
        let failing = self
            .failing_uploads
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&key.key);
        if failing {
            return Err(CacheError::RemoteUnavailable(format!(
                "simulated upload failure for {}",
                key
            )));
        }

        self.objects
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.clone(), data);
        self.uploads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn load(&self, key: &RemoteObjectKey) -> Result<Bytes> {
        *self
            .downloads
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(key.key.clone())
            .or_insert(0) += 1;

        self.object(key).ok_or_else(|| CacheError::ObjectMissing {
            key: key.to_string(),
        })
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn upload_file(&self, key: &RemoteObjectKey, source: &Path) -> Result<u64> {
        self.enter().await?;
        let data = tokio::fs::read(source)
            .await
            .map_err(|e| CacheError::io(format!("reading {}", source.display()), e))?;
        let len = data.len() as u64;
        self.store(key, Bytes::from(data))?;
        debug!(object = %key, size = len, "Stored blob in memory");
        Ok(len)
    }

    async fn upload_bytes(&self, key: &RemoteObjectKey, data: Bytes) -> Result<()> {
        self.enter().await?;
        self.store(key, data)
    }

    async fn download(&self, key: &RemoteObjectKey) -> Result<Bytes> {
        self.enter().await?;
        self.load(key)
    }

    async fn exists(&self, key: &RemoteObjectKey) -> Result<bool> {
        self.enter().await?;
        Ok(self.contains(key))
    }

    async fn delete(&self, key: &RemoteObjectKey) -> Result<()> {
        self.enter().await?;
        self.objects
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
        Ok(())
    }

    fn signed_url(
        &self,
        key: &RemoteObjectKey,
        method: HttpMethod,
        expiry: Duration,
    ) -> Result<SignedUrl> {
        validate_expiry(expiry)?;
        let expires_at = SystemTime::now() + expiry;
        let expires_secs = expires_at
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();

        let raw = format!(
            "{}://{}/{}?method={}&expires={}",
            SCHEME,
            key.bucket,
            key.key,
            method.as_str(),
            expires_secs
        );
        let url = Url::parse(&raw)
            .map_err(|e| CacheError::Config(format!("invalid object URL {}: {}", raw, e)))?;

        Ok(SignedUrl {
            url,
            method,
            expires_at,
        })
    }

    async fn fetch_signed(&self, url: &SignedUrl) -> Result<Bytes> {
        self.enter().await?;
        if url.url.scheme() != SCHEME || url.method != HttpMethod::Get {
            return Err(CacheError::AuthFailure(format!(
                "URL not valid for download: {}",
                url.url
            )));
        }
        if url.is_expired() {
            return Err(CacheError::AuthFailure("signed URL has expired".to_string()));
        }

        let bucket = url.url.host_str().unwrap_or_default();
        let key = url.url.path().trim_start_matches('/');
        self.load(&RemoteObjectKey::new(bucket, key))
    }

    async fn shutdown(&self) {
        self.shut_down.store(true, Ordering::SeqCst);
    }
}
