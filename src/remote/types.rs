//! Remote tier types: object keys, upload results and signed URLs

use std::fmt;
use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use reqwest::Url;
use serde::{Deserialize, Serialize};
use sha2::{Digest as Sha2Digest, Sha256};

use crate::digest::FileDigest;
use crate::error::{CacheError, ErrorKind, Result};

/// Longest lifetime S3 accepts for a presigned URL (7 days)
pub const MAX_SIGNED_URL_EXPIRY: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Location of an object in the remote store
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RemoteObjectKey {
    pub bucket: String,
    pub key: String,
}

impl RemoteObjectKey {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
        }
    }

    /// Content-addressed location of a blob
    ///
    /// Byte-identical outputs of unrelated actions resolve to the same key.
    pub fn blob(bucket: &str, prefix: &str, digest: &FileDigest) -> Self {
        Self::new(bucket, join_key(prefix, &format!("cas/{}", digest.to_hex())))
    }

    /// Location of the entry descriptor for a cache key
    ///
    /// Cache keys are output paths; hashing them keeps the object key flat
    /// and free of characters that need escaping.
    pub fn entry(bucket: &str, prefix: &str, cache_key: &str) -> Self {
        let hashed = hex::encode(Sha256::digest(cache_key.as_bytes()));
        Self::new(bucket, join_key(prefix, &format!("ac/{}", hashed)))
    }
}

impl fmt::Display for RemoteObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.bucket, self.key)
    }
}

fn join_key(prefix: &str, rest: &str) -> String {
    let prefix = prefix.trim_matches('/');
    if prefix.is_empty() {
        rest.to_string()
    } else {
        format!("{}/{}", prefix, rest)
    }
}

/// Outcome of uploading one file of a batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadResult {
    /// Local file that was uploaded
    pub source_file: PathBuf,
    /// Destination object
    pub object_key: RemoteObjectKey,
    /// Whether the object is now stored remotely
    pub success: bool,
    /// Failure classification when `success` is false
    pub error: Option<ErrorKind>,
    /// The object already existed, so no bytes were sent
    pub already_present: bool,
}

impl UploadResult {
    pub fn uploaded(source_file: PathBuf, object_key: RemoteObjectKey) -> Self {
        Self {
            source_file,
            object_key,
            success: true,
            error: None,
            already_present: false,
        }
    }

    pub fn present(source_file: PathBuf, object_key: RemoteObjectKey) -> Self {
        Self {
            already_present: true,
            ..Self::uploaded(source_file, object_key)
        }
    }

    pub fn failed(source_file: PathBuf, object_key: RemoteObjectKey, error: ErrorKind) -> Self {
        Self {
            source_file,
            object_key,
            success: false,
            error: Some(error),
            already_present: false,
        }
    }
}

/// HTTP method a signed URL is valid for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Put,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Put => "PUT",
        }
    }
}

impl std::str::FromStr for HttpMethod {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Ok(HttpMethod::Get),
            "PUT" => Ok(HttpMethod::Put),
            other => Err(CacheError::Config(format!(
                "signed URLs support GET or PUT, not '{}'",
                other
            ))),
        }
    }
}

/// A time-limited URL granting access to one object without credentials
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedUrl {
    pub url: Url,
    pub method: HttpMethod,
    pub expires_at: SystemTime,
}

impl SignedUrl {
    pub fn is_expired(&self) -> bool {
        SystemTime::now() >= self.expires_at
    }
}

/// Check a requested signed URL lifetime
pub fn validate_expiry(expiry: Duration) -> Result<()> {
    if expiry.is_zero() {
        return Err(CacheError::Config(
            "signed URL expiry must be positive".to_string(),
        ));
    }
    if expiry > MAX_SIGNED_URL_EXPIRY {
        return Err(CacheError::Config(format!(
            "signed URL expiry {:?} exceeds maximum of {:?}",
            expiry, MAX_SIGNED_URL_EXPIRY
        )));
    }
    Ok(())
}
