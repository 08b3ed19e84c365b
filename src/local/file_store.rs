//! Local File-Backed Action Cache
//!
//! Keeps entries in memory and persists them as a JSON snapshot on `save`.
//! Snapshots are written atomically so an interrupted save never leaves a
//! truncated cache behind.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::store::ActionCache;
use crate::digest::FileDigest;
use crate::entry::CacheEntry;
use crate::error::{CacheError, Result};

/// Snapshot format version
const SNAPSHOT_VERSION: u32 = 1;

/// Snapshot file name under the platform cache directory
const SNAPSHOT_FILE: &str = "action_cache.json";

#[derive(Debug, Serialize, Deserialize)]
struct Snapshot {
    version: u32,
    entries: BTreeMap<String, CacheEntry>,
}

/// Local action cache persisted as a JSON snapshot
pub struct FileActionCache {
    /// Snapshot location (None for a purely in-memory cache)
    path: Option<PathBuf>,
    /// Entries by cache key
    entries: RwLock<HashMap<String, CacheEntry>>,
}

impl FileActionCache {
    /// Create a cache that is never written to disk
    pub fn in_memory() -> Self {
        Self {
            path: None,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Default snapshot location under the platform cache directory
    pub fn default_path() -> PathBuf {
        dirs::cache_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join("action-cache")
            .join(SNAPSHOT_FILE)
    }

    /// Open a cache backed by the snapshot at `path`
    ///
    /// A missing snapshot yields an empty cache. A snapshot that cannot be
    /// parsed is discarded with a warning; the cache starts empty and the
    /// next `save` overwrites it.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                CacheError::io(format!("creating cache directory {}", parent.display()), e)
            })?;
        }

        let entries = match fs::read(&path) {
            Ok(raw) => match serde_json::from_slice::<Snapshot>(&raw) {
                Ok(snapshot) if snapshot.version == SNAPSHOT_VERSION => {
                    snapshot.entries.into_iter().collect()
                }
                Ok(snapshot) => {
                    warn!(
                        path = %path.display(),
                        version = snapshot.version,
                        "Unsupported action cache snapshot version, starting empty"
                    );
                    HashMap::new()
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Corrupt action cache snapshot, starting empty");
                    HashMap::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => {
                return Err(CacheError::io(
                    format!("reading action cache {}", path.display()),
                    e,
                ))
            }
        };

        info!(
            path = %path.display(),
            entries = entries.len(),
            "Local action cache loaded"
        );

        Ok(Self {
            path: Some(path),
            entries: RwLock::new(entries),
        })
    }

    /// Snapshot location, if persisted
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Number of entries currently held
    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Write the snapshot atomically using a temp file in the same directory
    fn write_snapshot(path: &Path, data: &[u8]) -> Result<()> {
        let parent = path.parent().unwrap_or(Path::new("/tmp"));
        let mut tmp = tempfile::NamedTempFile::new_in(parent)
            .map_err(|e| CacheError::io("creating temp file for action cache", e))?;

        tmp.write_all(data)
            .map_err(|e| CacheError::io("writing action cache snapshot", e))?;

        tmp.persist(path).map_err(|e| {
            CacheError::io(format!("persisting action cache {}", path.display()), e.error)
        })?;
        Ok(())
    }
}

impl ActionCache for FileActionCache {
    fn get(&self, key: &str) -> Result<Option<CacheEntry>> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        Ok(entries.get(key).cloned())
    }

    fn put(&self, key: &str, entry: CacheEntry) -> Result<()> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.insert(key.to_string(), entry);
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.remove(key);
        Ok(())
    }

    fn create_entry(&self, key: &str, discovers_inputs: bool) -> CacheEntry {
        CacheEntry::new(key, FileDigest::of_bytes(&[])).discovering_inputs(discovers_inputs)
    }

    fn save(&self) -> Result<u64> {
        let Some(path) = &self.path else {
            return Ok(0);
        };

        let snapshot = {
            let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
            Snapshot {
                version: SNAPSHOT_VERSION,
                entries: entries
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
            }
        };

        let data = serde_json::to_vec(&snapshot)
            .map_err(|e| CacheError::LocalStore(format!("serializing action cache: {}", e)))?;
        Self::write_snapshot(path, &data)?;

        debug!(
            path = %path.display(),
            entries = snapshot.entries.len(),
            bytes = data.len(),
            "Saved action cache"
        );
        Ok(data.len() as u64)
    }

    fn dump(&self, out: &mut dyn Write) -> std::io::Result<()> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        let sorted: BTreeMap<_, _> = entries.iter().collect();

        writeln!(out, "Action cache ({} records):", sorted.len())?;
        for (key, entry) in sorted {
            writeln!(out, "{}:", key)?;
            writeln!(out, "      actionKey = {}", entry.action_key())?;
            writeln!(out, "      digest = {}", entry.digest())?;
            writeln!(out, "      discoversInputs = {}", entry.discovers_inputs())?;
            if !entry.outputs().is_empty() {
                writeln!(out, "      outputs:")?;
                for output in entry.outputs() {
                    writeln!(out, "        {} {}", output.path, output.digest)?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(action: &str, content: &[u8]) -> CacheEntry {
        CacheEntry::new(action, FileDigest::of_bytes(content))
    }

    #[test]
    fn test_put_get_remove() {
        let cache = FileActionCache::in_memory();
        assert!(cache.get("out/a").unwrap().is_none());

        cache.put("out/a", entry("A", b"1")).unwrap();
        assert_eq!(cache.get("out/a").unwrap().unwrap().action_key(), "A");

        // last writer wins
        cache.put("out/a", entry("B", b"2")).unwrap();
        assert_eq!(cache.get("out/a").unwrap().unwrap().action_key(), "B");
        assert_eq!(cache.len(), 1);

        cache.remove("out/a").unwrap();
        assert!(cache.get("out/a").unwrap().is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_create_entry() {
        let cache = FileActionCache::in_memory();
        let e = cache.create_entry("//pkg:rule", true);
        assert_eq!(e.action_key(), "//pkg:rule");
        assert!(e.discovers_inputs());
        assert!(e.outputs().is_empty());
        assert_eq!(e.digest(), &FileDigest::of_bytes(&[]));
    }

    #[test]
    fn test_in_memory_save_is_noop() {
        let cache = FileActionCache::in_memory();
        cache.put("k", entry("A", b"1")).unwrap();
        assert_eq!(cache.save().unwrap(), 0);
        assert!(cache.path().is_none());
    }

    #[test]
    fn test_save_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("cache.json");

        let cache = FileActionCache::open(&path).unwrap();
        cache
            .put(
                "out/a",
                entry("A", b"1").with_output("out/a", FileDigest::of_bytes(b"a")),
            )
            .unwrap();
        cache.put("out/b", entry("B", b"2").discovering_inputs(true)).unwrap();

        let written = cache.save().unwrap();
        assert_eq!(written, fs::metadata(&path).unwrap().len());

        let reopened = FileActionCache::open(&path).unwrap();
        assert_eq!(reopened.len(), 2);
        assert_eq!(
            reopened.get("out/a").unwrap(),
            cache.get("out/a").unwrap()
        );
        assert!(reopened.get("out/b").unwrap().unwrap().discovers_inputs());
    }

    #[test]
    fn test_corrupt_snapshot_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.json");
        fs::write(&path, b"{ not json").unwrap();

        let cache = FileActionCache::open(&path).unwrap();
        assert!(cache.is_empty());

        cache.put("k", entry("A", b"1")).unwrap();
        cache.save().unwrap();
        assert_eq!(FileActionCache::open(&path).unwrap().len(), 1);
    }

    #[test]
    fn test_dump_is_sorted() {
        let cache = FileActionCache::in_memory();
        cache.put("z", entry("Z", b"z")).unwrap();
        cache
            .put("a", entry("A", b"a").with_output("out/a", FileDigest::of_bytes(b"x")))
            .unwrap();

        let mut out = Vec::new();
        cache.dump(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();

        assert!(text.starts_with("Action cache (2 records):"));
        let a = text.find("a:\n").unwrap();
        let z = text.find("z:\n").unwrap();
        assert!(a < z);
        assert!(text.contains("actionKey = A"));
        assert!(text.contains("out/a"));
    }
}
