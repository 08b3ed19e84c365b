//! File digests and their binary codec
//!
//! A digest is stored in cache entries and in the entry wire format as one
//! length byte followed by the raw digest bytes. The lowercase hex rendering
//! is used as the object key suffix for content-addressed blobs.

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest as Sha2Digest, Sha256};
use tokio::io::AsyncReadExt;

use crate::error::{CacheError, Result};

/// Longest digest the codec accepts (SHA-512 sized)
pub const MAX_DIGEST_LEN: usize = 64;

/// Length of digests computed by this crate (SHA-256)
pub const SHA256_LEN: usize = 32;

/// Read buffer used when hashing files
const HASH_BUFFER_SIZE: usize = 64 * 1024;

/// Content hash of a single file
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FileDigest(Vec<u8>);

impl FileDigest {
    /// Wrap raw digest bytes
    pub fn from_raw(bytes: impl Into<Vec<u8>>) -> Result<Self> {
        let bytes = bytes.into();
        if bytes.is_empty() || bytes.len() > MAX_DIGEST_LEN {
            return Err(CacheError::CorruptEntry(format!(
                "digest length {} outside 1..={}",
                bytes.len(),
                MAX_DIGEST_LEN
            )));
        }
        Ok(Self(bytes))
    }

    /// SHA-256 of the given content
    pub fn of_bytes(content: &[u8]) -> Self {
        Self(Sha256::digest(content).to_vec())
    }

    /// SHA-256 of a file's content, streamed in fixed-size chunks
    pub async fn of_file(path: &Path) -> Result<Self> {
        let mut file = tokio::fs::File::open(path)
            .await
            .map_err(|e| CacheError::io(format!("opening {}", path.display()), e))?;

        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; HASH_BUFFER_SIZE];
        loop {
            let n = file
                .read(&mut buf)
                .await
                .map_err(|e| CacheError::io(format!("reading {}", path.display()), e))?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(Self(hasher.finalize().to_vec()))
    }

    /// Aggregate fingerprint over a set of `(path, digest)` pairs
    ///
    /// Pairs are ordered by path first, so the result does not depend on the
    /// order outputs were produced in.
    pub fn combine<'a, I>(outputs: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a FileDigest)>,
    {
        let mut pairs: Vec<_> = outputs.into_iter().collect();
        pairs.sort_by(|a, b| a.0.cmp(b.0));

        let mut hasher = Sha256::new();
        for (path, digest) in pairs {
            hasher.update(path.as_bytes());
            hasher.update([0u8]);
            hasher.update(encode(digest));
        }
        Self(hasher.finalize().to_vec())
    }

    /// Raw digest bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Lowercase hex rendering, used for object keys
    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }

    /// Parse a hex rendering produced by [`FileDigest::to_hex`]
    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes = hex::decode(s)
            .map_err(|e| CacheError::CorruptEntry(format!("invalid hex digest '{}': {}", s, e)))?;
        Self::from_raw(bytes)
    }
}

impl fmt::Debug for FileDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FileDigest({})", self.to_hex())
    }
}

impl fmt::Display for FileDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl Serialize for FileDigest {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for FileDigest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        FileDigest::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// Serialize a digest to its compact binary form
pub fn encode(digest: &FileDigest) -> Vec<u8> {
    let mut out = Vec::with_capacity(digest.0.len() + 1);
    // from_raw bounds the length to MAX_DIGEST_LEN, which fits in a byte
    out.push(digest.0.len() as u8);
    out.extend_from_slice(&digest.0);
    out
}

/// Deserialize a digest from its compact binary form
pub fn decode(bytes: &[u8]) -> Result<FileDigest> {
    let (&len, payload) = bytes
        .split_first()
        .ok_or_else(|| CacheError::CorruptEntry("empty digest encoding".to_string()))?;

    if len as usize != payload.len() {
        return Err(CacheError::CorruptEntry(format!(
            "digest length prefix {} does not match payload of {} bytes",
            len,
            payload.len()
        )));
    }
    FileDigest::from_raw(payload)
}
