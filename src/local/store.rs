//! Local store contract and pass-through adapter

use std::io::Write;
use std::sync::Arc;

use tracing::trace;

use crate::entry::CacheEntry;
use crate::error::Result;

/// A local key/entry store
///
/// Each action entry uses one of its output paths as a key. Implementations
/// must be safe to call from many threads; a `put` replaces any previous
/// entry for the key as a whole.
pub trait ActionCache: Send + Sync {
    /// Returns the entry stored under `key`, if any
    fn get(&self, key: &str) -> Result<Option<CacheEntry>>;

    /// Stores `entry` under `key`, replacing any previous entry
    fn put(&self, key: &str, entry: CacheEntry) -> Result<()>;

    /// Removes the entry stored under `key`
    fn remove(&self, key: &str) -> Result<()>;

    /// Returns a new, empty entry for the given action key
    fn create_entry(&self, key: &str, discovers_inputs: bool) -> CacheEntry;

    /// Persists the cache, returning the size in bytes of the serialized form
    fn save(&self) -> Result<u64>;

    /// Writes a human readable listing of the cache content
    fn dump(&self, out: &mut dyn Write) -> std::io::Result<()>;
}

/// Pass-through adapter over any [`ActionCache`]
///
/// Keeps the remote tier's dependency on a local store explicit: nothing here
/// knows about object storage.
#[derive(Clone)]
pub struct LocalStore {
    inner: Arc<dyn ActionCache>,
}

impl LocalStore {
    pub fn new(inner: Arc<dyn ActionCache>) -> Self {
        Self { inner }
    }

    pub fn get(&self, key: &str) -> Result<Option<CacheEntry>> {
        let entry = self.inner.get(key)?;
        trace!(key = key, hit = entry.is_some(), "Local lookup");
        Ok(entry)
    }

    pub fn put(&self, key: &str, entry: CacheEntry) -> Result<()> {
        trace!(key = key, action_key = entry.action_key(), "Local put");
        self.inner.put(key, entry)
    }

    pub fn remove(&self, key: &str) -> Result<()> {
        trace!(key = key, "Local remove");
        self.inner.remove(key)
    }

    pub fn create_entry(&self, key: &str, discovers_inputs: bool) -> CacheEntry {
        self.inner.create_entry(key, discovers_inputs)
    }

    pub fn save(&self) -> Result<u64> {
        self.inner.save()
    }

    pub fn dump(&self, out: &mut dyn Write) -> std::io::Result<()> {
        self.inner.dump(out)
    }
}
