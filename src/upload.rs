//! Upload Coordinator
//!
//! Fans a batch of output files out to the blob store, one task per file,
//! and waits for every task before reporting. A batch is committed only if
//! every file landed; otherwise the caller gets the full list of failures.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::config::RetryConfig;
use crate::error::{CacheError, ErrorKind, Result};
use crate::remote::{BlobStore, RemoteObjectKey, UploadResult};
use crate::retry::retry_with_backoff;

/// One file to upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadRequest {
    pub source: PathBuf,
    pub key: RemoteObjectKey,
}

impl UploadRequest {
    pub fn new(source: impl Into<PathBuf>, key: RemoteObjectKey) -> Self {
        Self {
            source: source.into(),
            key,
        }
    }
}

/// Coordinates concurrent uploads for a cache instance
///
/// The semaphore bounding concurrency is shared by every batch, so many
/// concurrent `put` calls together never exceed `max_concurrent_uploads`
/// open files or sockets.
pub struct UploadCoordinator {
    store: Arc<dyn BlobStore>,
    permits: Arc<Semaphore>,
    retry: RetryConfig,
}

impl UploadCoordinator {
    pub fn new(store: Arc<dyn BlobStore>, max_concurrent_uploads: usize, retry: RetryConfig) -> Self {
        Self {
            store,
            permits: Arc::new(Semaphore::new(max_concurrent_uploads.max(1))),
            retry,
        }
    }

    /// Upload every request and return one result per request, in order
    ///
    /// Requests targeting the same object key are uploaded once and share
    /// the outcome. No upload is cancelled because another one failed.
    pub async fn upload_all(&self, requests: Vec<UploadRequest>) -> Vec<UploadResult> {
        let mut slot_by_key: HashMap<RemoteObjectKey, usize> = HashMap::new();
        let mut unique: Vec<UploadRequest> = Vec::new();
        let mut slots: Vec<usize> = Vec::with_capacity(requests.len());

        for request in &requests {
            match slot_by_key.entry(request.key.clone()) {
                Entry::Occupied(existing) => slots.push(*existing.get()),
                Entry::Vacant(vacant) => {
                    vacant.insert(unique.len());
                    slots.push(unique.len());
                    unique.push(request.clone());
                }
            }
        }

        debug!(
            files = requests.len(),
            unique = unique.len(),
            "Starting upload batch"
        );

        let mut tasks = JoinSet::new();
        for (slot, request) in unique.iter().cloned().enumerate() {
            let store = Arc::clone(&self.store);
            let permits = Arc::clone(&self.permits);
            let retry = self.retry.clone();
            tasks.spawn(async move { (slot, upload_one(store, permits, retry, request).await) });
        }

        // Wait for all of the uploads to complete
        let mut outcomes: Vec<Option<UploadResult>> = vec![None; unique.len()];
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((slot, result)) => outcomes[slot] = Some(result),
                Err(e) => warn!(error = %e, "Upload task did not complete"),
            }
        }

        requests
            .into_iter()
            .zip(slots)
            .map(|(request, slot)| match &outcomes[slot] {
                Some(result) => UploadResult {
                    source_file: request.source,
                    ..result.clone()
                },
                None => UploadResult::failed(request.source, request.key, ErrorKind::RemoteUnavailable),
            })
            .collect()
    }

    /// Upload a batch with all-or-nothing semantics
    ///
    /// Returns the per-file results when every upload succeeded, and
    /// [`CacheError::PartialUploadFailure`] listing each failure otherwise.
    /// Objects that did land stay in storage but are not referenced by any
    /// entry.
    pub async fn upload_batch(&self, requests: Vec<UploadRequest>) -> Result<Vec<UploadResult>> {
        let total = requests.len();
        let results = self.upload_all(requests).await;

        let failed: Vec<UploadResult> = results.iter().filter(|r| !r.success).cloned().collect();
        if !failed.is_empty() {
            warn!(
                failed = failed.len(),
                total = total,
                "Upload batch incomplete, not committing"
            );
            return Err(CacheError::PartialUploadFailure { failed, total });
        }

        let reused = results.iter().filter(|r| r.already_present).count();
        info!(
            total = total,
            reused = reused,
            "Upload batch complete"
        );
        Ok(results)
    }

    /// Stop accepting uploads; in-flight uploads finish normally
    pub fn close(&self) {
        self.permits.close();
    }
}

async fn upload_one(
    store: Arc<dyn BlobStore>,
    permits: Arc<Semaphore>,
    retry: RetryConfig,
    request: UploadRequest,
) -> UploadResult {
    let _permit = match permits.acquire_owned().await {
        Ok(permit) => permit,
        Err(_) => {
            return UploadResult::failed(request.source, request.key, ErrorKind::RemoteUnavailable)
        }
    };

    let store_ref: &dyn BlobStore = store.as_ref();
    let request_ref = &request;
    let outcome = retry_with_backoff(&retry, "upload", || async move {
        // Content-addressed keys: an existing object already holds these bytes
        if store_ref.exists(&request_ref.key).await? {
            return Ok(true);
        }
        store_ref
            .upload_file(&request_ref.key, &request_ref.source)
            .await?;
        Ok(false)
    })
    .await;

    match outcome {
        Ok(true) => {
            debug!(object = %request.key, "Blob already present, skipping upload");
            UploadResult::present(request.source, request.key)
        }
        Ok(false) => UploadResult::uploaded(request.source, request.key),
        Err(e) => {
            warn!(
                object = %request.key,
                source = %request.source.display(),
                error = %e,
                "Upload failed"
            );
            UploadResult::failed(request.source, request.key, e.kind())
        }
    }
}
