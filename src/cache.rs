//! Remote Action Cache
//!
//! Layers a shared object-storage tier over a local [`ActionCache`]. Writes
//! always land locally first; with a remote tier configured, the outputs of
//! an entry are uploaded and then the entry descriptor is published. The
//! descriptor is written last, so a reader never sees an entry whose blobs
//! are not all stored.
//!
//! Reads check the local store and fall back to the remote tier on a miss.
//! Concurrent lookups of one key share a single remote fetch, and the
//! outcome is remembered for a short while so a cold key is not fetched
//! over and over.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use bytes::Bytes;
use futures::future::try_join_all;
use moka::future::Cache;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use crate::config::{CacheConfig, RemoteConfig};
use crate::digest::{FileDigest, SHA256_LEN};
use crate::entry::CacheEntry;
use crate::error::{CacheError, Result};
use crate::local::{ActionCache, LocalStore};
use crate::remote::{BlobStore, Credentials, HttpMethod, RemoteObjectKey, S3Client, SignedUrl};
use crate::retry::retry_with_backoff;
use crate::upload::{UploadCoordinator, UploadRequest};

/// Upper bound on memoized remote lookups
const MAX_TRACKED_LOOKUPS: u64 = 10_000;

/// Action cache with an optional shared remote tier
///
/// Safe to share between tasks behind an `Arc`. Operations on distinct keys
/// run concurrently; writers of one key are serialized.
pub struct RemoteActionCache {
    local: LocalStore,
    remote: Option<RemoteTier>,
    key_locks: KeyLocks,
}

/// Everything that exists only when remote caching is enabled
struct RemoteTier {
    store: Arc<dyn BlobStore>,
    uploads: UploadCoordinator,
    config: RemoteConfig,
    /// Remembered remote lookup outcomes by cache key
    lookups: Cache<String, Option<CacheEntry>>,
}

impl RemoteTier {
    fn blob_key(&self, digest: &FileDigest) -> RemoteObjectKey {
        RemoteObjectKey::blob(&self.config.bucket, &self.config.prefix, digest)
    }

    fn entry_key(&self, cache_key: &str) -> RemoteObjectKey {
        RemoteObjectKey::entry(&self.config.bucket, &self.config.prefix, cache_key)
    }
}

impl RemoteActionCache {
    /// Create a cache from configuration
    ///
    /// Credentials are read only when a remote tier is configured; missing
    /// credentials fail here, before any network activity.
    pub fn new(local: Arc<dyn ActionCache>, config: &CacheConfig) -> Result<Self> {
        let Some(remote) = &config.remote else {
            return Ok(Self::local_only(local));
        };

        remote.validate()?;
        let credentials = Credentials::from_env(remote)?;
        let client = S3Client::new(credentials, remote)?;

        info!(
            bucket = %remote.bucket,
            prefix = %remote.prefix,
            shared = remote.shared_cache,
            "Remote action cache enabled"
        );
        Ok(Self::with_blob_store(local, remote.clone(), Arc::new(client)))
    }

    /// Create a cache using an already constructed blob store
    pub fn with_blob_store(
        local: Arc<dyn ActionCache>,
        config: RemoteConfig,
        store: Arc<dyn BlobStore>,
    ) -> Self {
        let lookups = Cache::builder()
            .max_capacity(MAX_TRACKED_LOOKUPS)
            .time_to_live(config.lookup_ttl())
            .name("remote_lookup_cache")
            .build();
        let uploads = UploadCoordinator::new(
            Arc::clone(&store),
            config.max_concurrent_uploads,
            config.retry.clone(),
        );

        Self {
            local: LocalStore::new(local),
            remote: Some(RemoteTier {
                store,
                uploads,
                config,
                lookups,
            }),
            key_locks: KeyLocks::default(),
        }
    }

    /// Create a cache that never talks to a remote tier
    pub fn local_only(local: Arc<dyn ActionCache>) -> Self {
        Self {
            local: LocalStore::new(local),
            remote: None,
            key_locks: KeyLocks::default(),
        }
    }

    pub fn is_remote_enabled(&self) -> bool {
        self.remote.is_some()
    }

    /// Store an entry locally and, when enabled, publish it remotely
    ///
    /// A local failure returns before anything remote happens. A remote
    /// failure is returned after the local write has been kept; use
    /// [`CacheError::is_remote`] to tell the two apart. Entries without
    /// outputs are cached locally only.
    pub async fn put(&self, key: &str, entry: CacheEntry) -> Result<()> {
        let _guard = self.lock_key(key).await;

        self.local.put(key, entry.clone())?;

        let Some(remote) = &self.remote else {
            return Ok(());
        };
        remote.lookups.invalidate(key).await;

        if entry.outputs().is_empty() {
            debug!(key = key, "Entry has no outputs, keeping it local");
            return Ok(());
        }

        self.publish(remote, key, &entry).await
    }

    /// Look an entry up, locally first and then in the remote tier
    ///
    /// A remote hit materializes the outputs under the execution root and
    /// records the entry locally. Remote failures count as misses unless the
    /// cache is configured as strict.
    pub async fn get(&self, key: &str) -> Result<Option<CacheEntry>> {
        if let Some(entry) = self.local.get(key)? {
            return Ok(Some(entry));
        }

        let remote = match &self.remote {
            Some(remote) if remote.config.shared_cache => remote,
            _ => return Ok(None),
        };

        match remote
            .lookups
            .try_get_with(key.to_string(), self.fetch(remote, key))
            .await
        {
            Ok(entry) => Ok(entry),
            Err(err) if remote.config.strict || !err.is_remote() => Err((*err).clone()),
            Err(err) => {
                warn!(key = key, error = %err, "Remote lookup failed, treating as a miss");
                Ok(None)
            }
        }
    }

    /// Remove an entry locally
    ///
    /// With `delete_on_remove` set, the remote descriptor is deleted in the
    /// background. Blobs are shared between entries and are never deleted.
    pub async fn remove(&self, key: &str) -> Result<()> {
        let _guard = self.lock_key(key).await;

        self.local.remove(key)?;

        if let Some(remote) = &self.remote {
            remote.lookups.invalidate(key).await;

            if remote.config.delete_on_remove {
                let store = Arc::clone(&remote.store);
                let object = remote.entry_key(key);
                tokio::spawn(async move {
                    match store.delete(&object).await {
                        Ok(()) => debug!(object = %object, "Deleted remote descriptor"),
                        Err(e) => {
                            warn!(object = %object, error = %e, "Failed to delete remote descriptor")
                        }
                    }
                });
            }
        }
        Ok(())
    }

    pub fn create_entry(&self, key: &str, discovers_inputs: bool) -> CacheEntry {
        self.local.create_entry(key, discovers_inputs)
    }

    /// Persist the local store, returning the snapshot size in bytes
    pub fn save(&self) -> Result<u64> {
        self.local.save()
    }

    pub fn dump(&self, out: &mut dyn Write) -> std::io::Result<()> {
        self.local.dump(out)
    }

    /// Signed URL for the blob with the given digest
    ///
    /// Lets another process fetch or store a blob without holding
    /// credentials. The URL expires after `signed_url_expiry_secs`.
    pub fn signed_url(&self, digest: &FileDigest, method: HttpMethod) -> Result<SignedUrl> {
        let remote = self.remote.as_ref().ok_or_else(|| {
            CacheError::Config("remote caching is not configured".to_string())
        })?;
        remote.store.signed_url(
            &remote.blob_key(digest),
            method,
            remote.config.signed_url_expiry(),
        )
    }

    /// Object key for the blob with the given digest
    pub fn blob_key(&self, digest: &FileDigest) -> Option<RemoteObjectKey> {
        self.remote.as_ref().map(|remote| remote.blob_key(digest))
    }

    /// Object key of the descriptor for a cache key
    pub fn entry_key(&self, cache_key: &str) -> Option<RemoteObjectKey> {
        self.remote.as_ref().map(|remote| remote.entry_key(cache_key))
    }

    /// Tear down the remote tier
    ///
    /// Pending uploads are refused and the blob store releases its
    /// connections. Does nothing for a local-only cache.
    pub async fn shutdown(self) {
        if let Some(remote) = self.remote {
            remote.uploads.close();
            remote.store.shutdown().await;
            remote.lookups.invalidate_all();
            info!(bucket = %remote.config.bucket, "Remote action cache shut down");
        }
    }

    /// Serialize writers of `key`; a local-only cache has nothing to order
    async fn lock_key(&self, key: &str) -> Option<KeyGuard<'_>> {
        match self.remote {
            Some(_) => Some(self.key_locks.lock(key).await),
            None => None,
        }
    }

    /// Upload the outputs of `entry`, then its descriptor
    ///
    /// On failure the previously published descriptor for `key` is retracted,
    /// so peers miss instead of restoring a superseded entry.
    async fn publish(&self, remote: &RemoteTier, key: &str, entry: &CacheEntry) -> Result<()> {
        let object = remote.entry_key(key);
        let requests = entry
            .outputs()
            .iter()
            .map(|output| {
                let relative = relative_output_path(&output.path)?;
                Ok(UploadRequest::new(
                    remote.config.exec_root.join(relative),
                    remote.blob_key(&output.digest),
                ))
            })
            .collect::<Result<Vec<_>>>();

        let uploaded = match requests {
            Ok(requests) => remote.uploads.upload_batch(requests).await.map(|_| ()),
            Err(e) => Err(e),
        };
        if let Err(e) = uploaded {
            retract(remote, &object).await;
            return Err(e);
        }

        // Commit point: the entry becomes visible to other machines here
        let descriptor = Bytes::from(entry.to_wire());
        let store = remote.store.as_ref();
        let object_ref = &object;
        let committed = retry_with_backoff(&remote.config.retry, "upload descriptor", || {
            store.upload_bytes(object_ref, descriptor.clone())
        })
        .await;
        if let Err(e) = committed {
            retract(remote, &object).await;
            return Err(e);
        }

        info!(
            key = key,
            object = %object,
            outputs = entry.outputs().len(),
            "Published entry to remote cache"
        );
        Ok(())
    }

    /// Fetch an entry from the remote tier and materialize its outputs
    ///
    /// Missing and unreadable entries are misses (`Ok(None)`); anything else
    /// is returned as an error for the caller to classify.
    async fn fetch(&self, remote: &RemoteTier, key: &str) -> Result<Option<CacheEntry>> {
        let object = remote.entry_key(key);
        let store = remote.store.as_ref();
        let object_ref = &object;

        let descriptor = match retry_with_backoff(&remote.config.retry, "download descriptor", || {
            store.download(object_ref)
        })
        .await
        {
            Ok(bytes) => bytes,
            Err(CacheError::ObjectMissing { .. }) => {
                debug!(key = key, "Remote miss");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        let entry = match CacheEntry::from_wire(&descriptor) {
            Ok(entry) => entry,
            Err(e) => {
                warn!(object = %object, error = %e, "Ignoring unreadable remote entry");
                return Ok(None);
            }
        };

        match materialize(remote, &entry).await {
            Ok(()) => {}
            Err(e @ (CacheError::CorruptEntry(_) | CacheError::ObjectMissing { .. })) => {
                warn!(object = %object, error = %e, "Ignoring incomplete remote entry");
                return Ok(None);
            }
            Err(e) => return Err(e),
        }

        // A put that raced with this fetch wins
        let _guard = self.key_locks.lock(key).await;
        if let Some(existing) = self.local.get(key)? {
            return Ok(Some(existing));
        }
        self.local.put(key, entry.clone())?;

        info!(
            key = key,
            outputs = entry.outputs().len(),
            "Restored entry from remote cache"
        );
        Ok(Some(entry))
    }
}

/// Best-effort delete of a descriptor that no longer matches the local entry
async fn retract(remote: &RemoteTier, object: &RemoteObjectKey) {
    let store = remote.store.as_ref();
    match retry_with_backoff(&remote.config.retry, "retract descriptor", || {
        store.delete(object)
    })
    .await
    {
        Ok(()) => debug!(object = %object, "Retracted remote descriptor"),
        Err(e) => warn!(
            object = %object,
            error = %e,
            "Failed to retract remote descriptor; peers may restore a stale entry"
        ),
    }
}

/// Download every output of `entry` and write it under the execution root
///
/// Nothing is written until every blob has been fetched and verified.
async fn materialize(remote: &RemoteTier, entry: &CacheEntry) -> Result<()> {
    let targets = entry
        .outputs()
        .iter()
        .map(|output| {
            let path = remote.config.exec_root.join(relative_output_path(&output.path)?);
            Ok((path, &output.digest))
        })
        .collect::<Result<Vec<_>>>()?;

    let store = remote.store.as_ref();
    let downloads = targets.into_iter().map(|(path, digest)| async move {
        let object = remote.blob_key(digest);
        let object_ref = &object;
        let data = retry_with_backoff(&remote.config.retry, "download blob", || {
            store.download(object_ref)
        })
        .await?;
        verify_content(digest, &data, &object)?;
        Ok::<_, CacheError>((path, data))
    });

    let files = try_join_all(downloads).await?;
    write_outputs(files).await
}

/// Output paths must stay inside the execution root
fn relative_output_path(path: &str) -> Result<&Path> {
    let relative = Path::new(path);
    let escapes = relative
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
    if path.is_empty() || escapes {
        return Err(CacheError::CorruptEntry(format!(
            "output path {:?} is not relative to the execution root",
            path
        )));
    }
    Ok(relative)
}

/// Check fetched content against its recorded SHA-256 digest
///
/// Digests of any other length were produced elsewhere with an unknown
/// algorithm; their content is accepted unverified.
fn verify_content(expected: &FileDigest, data: &[u8], object: &RemoteObjectKey) -> Result<()> {
    if expected.as_bytes().len() != SHA256_LEN {
        debug!(
            object = %object,
            digest_len = expected.as_bytes().len(),
            "Not a SHA-256 digest, skipping content check"
        );
        return Ok(());
    }
    let actual = FileDigest::of_bytes(data);
    if &actual != expected {
        return Err(CacheError::CorruptEntry(format!(
            "content of {} hashes to {}, expected {}",
            object, actual, expected
        )));
    }
    Ok(())
}

/// Write outputs through temp files in their target directories
///
/// Every temp file is staged before the first rename, so a failure while
/// staging leaves the execution root untouched.
async fn write_outputs(files: Vec<(PathBuf, Bytes)>) -> Result<()> {
    tokio::task::spawn_blocking(move || -> Result<()> {
        let mut staged = Vec::with_capacity(files.len());
        for (path, data) in files {
            let parent = path.parent().unwrap_or(Path::new("."));
            std::fs::create_dir_all(parent)
                .map_err(|e| CacheError::io(format!("creating {}", parent.display()), e))?;

            let mut tmp = tempfile::NamedTempFile::new_in(parent)
                .map_err(|e| CacheError::io("creating temp file for output", e))?;
            tmp.write_all(&data)
                .map_err(|e| CacheError::io(format!("writing {}", path.display()), e))?;
            staged.push((tmp, path));
        }

        for (tmp, path) in staged {
            tmp.persist(&path)
                .map_err(|e| CacheError::io(format!("persisting {}", path.display()), e.error))?;
        }
        Ok(())
    })
    .await
    .map_err(|e| CacheError::LocalStore(format!("output write task failed: {}", e)))?
}

/// Per-key async locks, dropped from the map once nobody holds or awaits them
#[derive(Default)]
struct KeyLocks {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl KeyLocks {
    async fn lock(&self, key: &str) -> KeyGuard<'_> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(locks.entry(key.to_string()).or_default())
        };
        let guard = lock.lock_owned().await;
        KeyGuard {
            locks: self,
            key: key.to_string(),
            guard: Some(guard),
        }
    }
}

struct KeyGuard<'a> {
    locks: &'a KeyLocks,
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        let mut locks = self.locks.locks.lock().unwrap_or_else(PoisonError::into_inner);
        drop(self.guard.take());
        // Waiters clone the Arc under the map lock, so a count of one is final
        if locks.get(&self.key).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            locks.remove(&self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryConfig;
    use crate::local::FileActionCache;
    use crate::remote::MemoryBlobStore;
    use std::time::Duration;

    fn remote_config(exec_root: &Path) -> RemoteConfig {
        let mut config = RemoteConfig::new("artifacts");
        config.prefix = "ci".to_string();
        config.exec_root = exec_root.to_path_buf();
        config.retry = RetryConfig {
            max_attempts: 2,
            initial_backoff_ms: 1,
            max_backoff_ms: 2,
            backoff_multiplier: 2.0,
        };
        config
    }

    fn cache_with(store: &Arc<MemoryBlobStore>, config: RemoteConfig) -> RemoteActionCache {
        RemoteActionCache::with_blob_store(
            Arc::new(FileActionCache::in_memory()),
            config,
            Arc::clone(store) as Arc<dyn BlobStore>,
        )
    }

    /// Write an output under `root` and return an entry recording it
    fn produce(root: &Path, action: &str, outputs: &[(&str, &str)]) -> CacheEntry {
        let mut entry = CacheEntry::new(action, FileDigest::of_bytes(action.as_bytes()));
        for (path, content) in outputs {
            let full = root.join(path);
            std::fs::create_dir_all(full.parent().unwrap()).unwrap();
            std::fs::write(&full, content).unwrap();
            entry = entry.with_output(*path, FileDigest::of_bytes(content.as_bytes()));
        }
        entry
    }

    #[tokio::test]
    async fn test_local_only_cache() {
        let cache = RemoteActionCache::local_only(Arc::new(FileActionCache::in_memory()));
        assert!(!cache.is_remote_enabled());

        let entry = cache.create_entry("compile foo.c", false);
        cache.put("out/foo.o", entry.clone()).await.unwrap();
        assert_eq!(cache.get("out/foo.o").await.unwrap(), Some(entry));
        assert_eq!(cache.get("out/bar.o").await.unwrap(), None);

        cache.remove("out/foo.o").await.unwrap();
        assert_eq!(cache.get("out/foo.o").await.unwrap(), None);

        assert!(cache.blob_key(&FileDigest::of_bytes(b"x")).is_none());
        assert!(matches!(
            cache.signed_url(&FileDigest::of_bytes(b"x"), HttpMethod::Get),
            Err(CacheError::Config(_))
        ));
        cache.shutdown().await;
    }

    #[tokio::test]
    async fn test_local_tier_survives_remote_outage() {
        let root = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryBlobStore::new());
        store.set_unavailable(true);
        let cache = cache_with(&store, remote_config(root.path()));

        let entry = produce(root.path(), "link app", &[("bin/app", "elf")]);
        let err = cache.put("bin/app", entry.clone()).await.unwrap_err();
        assert!(err.is_remote());

        // the local write stands
        assert_eq!(cache.get("bin/app").await.unwrap(), Some(entry));

        // entries without outputs never touch the remote tier
        let bare = cache.create_entry("touch stamp", false);
        cache.put("stamp", bare.clone()).await.unwrap();
        assert_eq!(cache.get("stamp").await.unwrap(), Some(bare));

        assert_eq!(cache.get("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_failed_upload_publishes_nothing() {
        let root = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryBlobStore::new());
        let writer = cache_with(&store, remote_config(root.path()));

        let entry = produce(
            root.path(),
            "compile",
            &[("out/a.o", "aaa"), ("out/b.o", "bbb"), ("out/c.o", "ccc")],
        );
        let failing = writer.blob_key(&FileDigest::of_bytes(b"bbb")).unwrap();
        store.fail_uploads_to(&failing.key);

        match writer.put("out/a.o", entry).await.unwrap_err() {
            CacheError::PartialUploadFailure { failed, total } => {
                assert_eq!(total, 3);
                assert_eq!(failed.len(), 1);
                assert_eq!(failed[0].object_key, failing);
            }
            other => panic!("unexpected error: {other:?}"),
        }

        let descriptor = writer.entry_key("out/a.o").unwrap();
        assert!(!store.contains(&descriptor));

        let reader_root = tempfile::tempdir().unwrap();
        let reader = cache_with(&store, remote_config(reader_root.path()));
        assert_eq!(reader.get("out/a.o").await.unwrap(), None);
        assert!(!reader_root.path().join("out/a.o").exists());
    }

    #[tokio::test]
    async fn test_identical_content_is_stored_once() {
        let root = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryBlobStore::new());
        let cache = cache_with(&store, remote_config(root.path()));

        let first = produce(root.path(), "gen one", &[("gen/one.h", "#pragma once")]);
        let second = produce(root.path(), "gen two", &[("gen/two.h", "#pragma once")]);
        cache.put("gen/one.h", first).await.unwrap();
        cache.put("gen/two.h", second).await.unwrap();

        // one blob plus two descriptors
        assert_eq!(store.upload_count(), 3);
        assert_eq!(store.len(), 3);

        let digest = FileDigest::of_bytes(b"#pragma once");
        assert_eq!(
            cache.blob_key(&digest).unwrap().key,
            format!("ci/cas/{}", digest.to_hex())
        );
    }

    #[tokio::test]
    async fn test_end_to_end_between_instances() {
        let store = Arc::new(MemoryBlobStore::new());

        let writer_root = tempfile::tempdir().unwrap();
        let writer = cache_with(&store, remote_config(writer_root.path()));
        let entry = produce(
            writer_root.path(),
            "cc -c lib.c",
            &[("out/lib.o", "object code"), ("out/lib.d", "lib.o: lib.c")],
        );
        writer.put("out/lib.o", entry.clone()).await.unwrap();

        let reader_root = tempfile::tempdir().unwrap();
        let reader = cache_with(&store, remote_config(reader_root.path()));
        assert_eq!(reader.get("out/lib.o").await.unwrap(), Some(entry));
        assert_eq!(
            std::fs::read(reader_root.path().join("out/lib.o")).unwrap(),
            b"object code"
        );
        assert_eq!(
            std::fs::read(reader_root.path().join("out/lib.d")).unwrap(),
            b"lib.o: lib.c"
        );

        // the reader now serves the entry locally
        let descriptor = reader.entry_key("out/lib.o").unwrap();
        reader.get("out/lib.o").await.unwrap();
        assert_eq!(store.download_count(&descriptor.key), 1);

        let url = reader
            .signed_url(&FileDigest::of_bytes(b"object code"), HttpMethod::Get)
            .unwrap();
        assert!(!url.is_expired());
        assert_eq!(
            store.fetch_signed(&url).await.unwrap(),
            Bytes::from_static(b"object code")
        );

        reader.shutdown().await;
        writer.shutdown().await;
        assert!(store.exists(&descriptor).await.is_err());
    }

    #[tokio::test]
    async fn test_entry_digest_names_first_output() {
        let store = Arc::new(MemoryBlobStore::new());
        let writer_root = tempfile::tempdir().unwrap();
        std::fs::write(writer_root.path().join("out1"), b"first output").unwrap();
        std::fs::write(writer_root.path().join("out2"), b"second output").unwrap();
        let h1 = FileDigest::of_bytes(b"first output");
        let h2 = FileDigest::of_bytes(b"second output");

        let writer = cache_with(&store, remote_config(writer_root.path()));
        let entry = CacheEntry::new("A", h1.clone())
            .with_output("out1", h1.clone())
            .with_output("out2", h2.clone());
        writer.put("out1", entry).await.unwrap();
        assert!(store.contains(&writer.blob_key(&h1).unwrap()));
        assert!(store.contains(&writer.blob_key(&h2).unwrap()));

        let reader_root = tempfile::tempdir().unwrap();
        let reader = cache_with(&store, remote_config(reader_root.path()));
        let fetched = reader.get("out1").await.unwrap().unwrap();
        assert_eq!(fetched.action_key(), "A");
        assert_eq!(fetched.digest(), &h1);

        let url = reader.signed_url(&h1, HttpMethod::Get).unwrap();
        assert_eq!(
            store.fetch_signed(&url).await.unwrap(),
            Bytes::from_static(b"first output")
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_puts_of_distinct_keys() {
        let root = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryBlobStore::new());
        let writer = Arc::new(cache_with(&store, remote_config(root.path())));

        let mut handles = Vec::new();
        for i in 0..8 {
            let path = format!("out/{}.o", i);
            let content = format!("object {}", i);
            let entry = produce(root.path(), &format!("cc {}", i), &[(path.as_str(), content.as_str())]);
            let writer = Arc::clone(&writer);
            handles.push(tokio::spawn(async move { writer.put(&path, entry).await }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let reader_root = tempfile::tempdir().unwrap();
        let reader = cache_with(&store, remote_config(reader_root.path()));
        for i in 0..8 {
            let key = format!("out/{}.o", i);
            assert!(reader.get(&key).await.unwrap().is_some());
            assert_eq!(
                std::fs::read_to_string(reader_root.path().join(&key)).unwrap(),
                format!("object {}", i)
            );
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_gets_share_one_fetch() {
        let store = Arc::new(MemoryBlobStore::new());
        let writer_root = tempfile::tempdir().unwrap();
        let writer = cache_with(&store, remote_config(writer_root.path()));
        let entry = produce(writer_root.path(), "archive", &[("lib/libx.a", "archive")]);
        writer.put("lib/libx.a", entry.clone()).await.unwrap();

        store.set_latency(Some(Duration::from_millis(20)));
        let reader_root = tempfile::tempdir().unwrap();
        let reader = Arc::new(cache_with(&store, remote_config(reader_root.path())));

        let mut handles = Vec::new();
        for _ in 0..10 {
            let reader = Arc::clone(&reader);
            handles.push(tokio::spawn(async move { reader.get("lib/libx.a").await }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), Some(entry.clone()));
        }

        let descriptor = reader.entry_key("lib/libx.a").unwrap();
        assert_eq!(store.download_count(&descriptor.key), 1);
    }

    #[tokio::test]
    async fn test_missing_credentials_fail_construction() {
        let mut remote = RemoteConfig::new("artifacts");
        remote.access_key_env = "TIERED_CACHE_TEST_UNSET_ACCESS_KEY".to_string();
        remote.secret_key_env = "TIERED_CACHE_TEST_UNSET_SECRET_KEY".to_string();
        let config = CacheConfig {
            local_path: None,
            remote: Some(remote),
        };

        match RemoteActionCache::new(Arc::new(FileActionCache::in_memory()), &config) {
            Err(CacheError::MissingCredentials { var }) => {
                assert_eq!(var, "TIERED_CACHE_TEST_UNSET_ACCESS_KEY");
            }
            Err(other) => panic!("unexpected error: {other:?}"),
            Ok(_) => panic!("construction should fail without credentials"),
        }

        // no remote tier, no credentials needed
        let cache = RemoteActionCache::new(
            Arc::new(FileActionCache::in_memory()),
            &CacheConfig::default(),
        )
        .unwrap();
        assert!(!cache.is_remote_enabled());
    }

    #[tokio::test]
    async fn test_strict_mode_reports_remote_failures() {
        let store = Arc::new(MemoryBlobStore::new());
        store.set_unavailable(true);
        let root = tempfile::tempdir().unwrap();

        let lenient = cache_with(&store, remote_config(root.path()));
        assert_eq!(lenient.get("out/x.o").await.unwrap(), None);

        let mut config = remote_config(root.path());
        config.strict = true;
        let strict = cache_with(&store, config);
        assert!(matches!(
            strict.get("out/x.o").await,
            Err(CacheError::RemoteUnavailable(_))
        ));

        // a plain miss is still a miss
        store.set_unavailable(false);
        assert_eq!(strict.get("out/x.o").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_unreadable_descriptor_is_a_miss() {
        let store = Arc::new(MemoryBlobStore::new());
        let root = tempfile::tempdir().unwrap();
        let mut config = remote_config(root.path());
        config.strict = true;
        let cache = cache_with(&store, config);

        let object = cache.entry_key("out/x.o").unwrap();
        store
            .upload_bytes(&object, Bytes::from_static(b"\xff\xffnot an entry"))
            .await
            .unwrap();
        assert_eq!(cache.get("out/x.o").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_tampered_blob_is_rejected() {
        let store = Arc::new(MemoryBlobStore::new());
        let writer_root = tempfile::tempdir().unwrap();
        let writer = cache_with(&store, remote_config(writer_root.path()));

        // record a digest that does not match what is on disk
        std::fs::create_dir_all(writer_root.path().join("out")).unwrap();
        std::fs::write(writer_root.path().join("out/x.o"), b"actual").unwrap();
        let entry = CacheEntry::new("cc x", FileDigest::of_bytes(b"cc x"))
            .with_output("out/x.o", FileDigest::of_bytes(b"expected"));
        writer.put("out/x.o", entry).await.unwrap();

        let reader_root = tempfile::tempdir().unwrap();
        let reader = cache_with(&store, remote_config(reader_root.path()));
        assert_eq!(reader.get("out/x.o").await.unwrap(), None);
        assert!(!reader_root.path().join("out/x.o").exists());
    }

    #[tokio::test]
    async fn test_escaping_output_paths_are_rejected() {
        let store = Arc::new(MemoryBlobStore::new());
        let root = tempfile::tempdir().unwrap();
        let cache = cache_with(&store, remote_config(root.path()));

        let entry = CacheEntry::new("evil", FileDigest::of_bytes(b"evil"))
            .with_output("../escape", FileDigest::of_bytes(b"payload"));
        assert!(matches!(
            cache.put("k", entry.clone()).await,
            Err(CacheError::CorruptEntry(_))
        ));

        // a descriptor published by someone else is ignored
        let blob = cache.blob_key(&FileDigest::of_bytes(b"payload")).unwrap();
        store
            .upload_bytes(&blob, Bytes::from_static(b"payload"))
            .await
            .unwrap();
        store
            .upload_bytes(&cache.entry_key("other").unwrap(), Bytes::from(entry.to_wire()))
            .await
            .unwrap();
        assert_eq!(cache.get("other").await.unwrap(), None);
        assert!(!root.path().parent().unwrap().join("escape").exists());

        assert!(relative_output_path("/etc/passwd").is_err());
        assert!(relative_output_path("").is_err());
        assert!(relative_output_path("./out/x.o").is_ok());
    }

    #[tokio::test]
    async fn test_lookup_outcomes_are_remembered() {
        let store = Arc::new(MemoryBlobStore::new());
        let reader_root = tempfile::tempdir().unwrap();
        let reader = cache_with(&store, remote_config(reader_root.path()));
        assert_eq!(reader.get("out/y.o").await.unwrap(), None);

        let writer_root = tempfile::tempdir().unwrap();
        let writer = cache_with(&store, remote_config(writer_root.path()));
        let entry = produce(writer_root.path(), "cc y", &[("out/y.o", "y")]);
        writer.put("out/y.o", entry.clone()).await.unwrap();

        // the earlier miss is still remembered
        assert_eq!(reader.get("out/y.o").await.unwrap(), None);
        let descriptor = reader.entry_key("out/y.o").unwrap();
        assert_eq!(store.download_count(&descriptor.key), 1);

        // removing the key forgets it
        reader.remove("out/y.o").await.unwrap();
        assert_eq!(reader.get("out/y.o").await.unwrap(), Some(entry));
    }

    #[tokio::test]
    async fn test_remove_deletes_descriptor_when_configured() {
        let store = Arc::new(MemoryBlobStore::new());
        let root = tempfile::tempdir().unwrap();
        let mut config = remote_config(root.path());
        config.delete_on_remove = true;
        let cache = cache_with(&store, config);

        let entry = produce(root.path(), "cc z", &[("out/z.o", "zzz")]);
        cache.put("out/z.o", entry).await.unwrap();
        let descriptor = cache.entry_key("out/z.o").unwrap();
        let blob = cache.blob_key(&FileDigest::of_bytes(b"zzz")).unwrap();
        assert!(store.contains(&descriptor));

        cache.remove("out/z.o").await.unwrap();
        for _ in 0..100 {
            if !store.contains(&descriptor) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!store.contains(&descriptor));
        assert!(store.contains(&blob));
        assert_eq!(cache.get("out/z.o").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_failed_republish_retracts_previous_entry() {
        let store = Arc::new(MemoryBlobStore::new());
        let writer_root = tempfile::tempdir().unwrap();
        let writer = cache_with(&store, remote_config(writer_root.path()));

        let v1 = produce(writer_root.path(), "v1", &[("out/a.o", "first build")]);
        writer.put("out/a.o", v1).await.unwrap();
        let descriptor = writer.entry_key("out/a.o").unwrap();
        assert!(store.contains(&descriptor));

        let v2 = produce(
            writer_root.path(),
            "v2",
            &[("out/a.o", "second build"), ("out/a.d", "deps")],
        );
        let failing = writer.blob_key(&FileDigest::of_bytes(b"deps")).unwrap();
        store.fail_uploads_to(&failing.key);
        assert!(matches!(
            writer.put("out/a.o", v2.clone()).await,
            Err(CacheError::PartialUploadFailure { .. })
        ));

        // the writer keeps v2 locally, peers no longer see v1
        assert_eq!(writer.get("out/a.o").await.unwrap(), Some(v2));
        assert!(!store.contains(&descriptor));

        let reader_root = tempfile::tempdir().unwrap();
        let reader = cache_with(&store, remote_config(reader_root.path()));
        assert_eq!(reader.get("out/a.o").await.unwrap(), None);
        assert!(!reader_root.path().join("out/a.o").exists());
    }

    #[tokio::test]
    async fn test_incomplete_fetch_writes_no_outputs() {
        let store = Arc::new(MemoryBlobStore::new());
        let writer_root = tempfile::tempdir().unwrap();
        let writer = cache_with(&store, remote_config(writer_root.path()));

        let entry = produce(
            writer_root.path(),
            "cc",
            &[("out/good.o", "good object"), ("out/bad.o", "bad object")],
        );
        writer.put("out/good.o", entry).await.unwrap();

        let bad = writer.blob_key(&FileDigest::of_bytes(b"bad object")).unwrap();
        store
            .upload_bytes(&bad, Bytes::from_static(b"tampered"))
            .await
            .unwrap();

        let reader_root = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(reader_root.path().join("out")).unwrap();
        std::fs::write(reader_root.path().join("out/good.o"), b"stale").unwrap();

        let reader = cache_with(&store, remote_config(reader_root.path()));
        assert_eq!(reader.get("out/good.o").await.unwrap(), None);
        assert_eq!(
            std::fs::read(reader_root.path().join("out/good.o")).unwrap(),
            b"stale"
        );
        assert!(!reader_root.path().join("out/bad.o").exists());
    }

    #[tokio::test]
    async fn test_slow_remote_lookup_is_a_miss() {
        let store = Arc::new(MemoryBlobStore::new());
        let root = tempfile::tempdir().unwrap();
        store.set_latency(Some(Duration::from_millis(30)));
        store.set_deadline(Some(Duration::from_millis(5)));

        let lenient = cache_with(&store, remote_config(root.path()));
        assert_eq!(lenient.get("out/x.o").await.unwrap(), None);

        let mut config = remote_config(root.path());
        config.strict = true;
        let strict = cache_with(&store, config);
        assert!(matches!(
            strict.get("out/x.o").await,
            Err(CacheError::DeadlineExceeded { .. })
        ));
    }

    #[tokio::test]
    async fn test_local_only_cache_skips_key_locks() {
        let cache = RemoteActionCache::local_only(Arc::new(FileActionCache::in_memory()));
        let _held = cache.key_locks.lock("out/foo.o").await;

        let entry = cache.create_entry("compile foo.c", false);
        let put = tokio::time::timeout(
            Duration::from_secs(1),
            cache.put("out/foo.o", entry.clone()),
        );
        put.await.unwrap().unwrap();
        assert_eq!(cache.get("out/foo.o").await.unwrap(), Some(entry));
        tokio::time::timeout(Duration::from_secs(1), cache.remove("out/foo.o"))
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_key_locks_are_pruned() {
        let locks = KeyLocks::default();
        {
            let _a = locks.lock("a").await;
            let _b = locks.lock("b").await;
            assert_eq!(locks.locks.lock().unwrap().len(), 2);
        }
        assert!(locks.locks.lock().unwrap().is_empty());
    }
}
