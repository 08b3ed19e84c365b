//! Action Cache Error Types
//!
//! Structured error handling for the local and remote cache tiers.
//! Maps object-store HTTP status codes to specific variants for retry and
//! miss/failure decisions.

use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::remote::UploadResult;

/// Result alias used throughout the crate
pub type Result<T, E = CacheError> = std::result::Result<T, E>;

/// Action cache error types
#[derive(Debug, Clone, thiserror::Error)]
pub enum CacheError {
    #[error("Missing credentials: environment variable {var} is not set")]
    MissingCredentials { var: String },

    #[error("Remote cache unavailable: {0}")]
    RemoteUnavailable(String),

    #[error("Deadline exceeded after {timeout:?} during {operation}")]
    DeadlineExceeded { operation: String, timeout: Duration },

    #[error("Remote authentication failed: {0}")]
    AuthFailure(String),

    #[error("Object not found: {key}")]
    ObjectMissing { key: String },

    #[error("{} of {total} uploads failed", .failed.len())]
    PartialUploadFailure {
        failed: Vec<UploadResult>,
        total: usize,
    },

    #[error("Corrupt cache entry: {0}")]
    CorruptEntry(String),

    #[error("Remote rejected request (HTTP {status}): {body}")]
    RemoteRejected { status: u16, body: String },

    #[error("Local store error: {0}")]
    LocalStore(String),

    #[error("I/O error while {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: Arc<io::Error>,
    },

    #[error("Invalid configuration: {0}")]
    Config(String),
}

/// Coarse classification of a [`CacheError`], carried by upload results
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    MissingCredentials,
    RemoteUnavailable,
    DeadlineExceeded,
    AuthFailure,
    ObjectMissing,
    PartialUploadFailure,
    CorruptEntry,
    RemoteRejected,
    LocalStore,
    Io,
    Config,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::MissingCredentials => "missing_credentials",
            ErrorKind::RemoteUnavailable => "remote_unavailable",
            ErrorKind::DeadlineExceeded => "deadline_exceeded",
            ErrorKind::AuthFailure => "auth_failure",
            ErrorKind::ObjectMissing => "object_missing",
            ErrorKind::PartialUploadFailure => "partial_upload_failure",
            ErrorKind::CorruptEntry => "corrupt_entry",
            ErrorKind::RemoteRejected => "remote_rejected",
            ErrorKind::LocalStore => "local_store",
            ErrorKind::Io => "io",
            ErrorKind::Config => "config",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl CacheError {
    /// Classification of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            CacheError::MissingCredentials { .. } => ErrorKind::MissingCredentials,
            CacheError::RemoteUnavailable(_) => ErrorKind::RemoteUnavailable,
            CacheError::DeadlineExceeded { .. } => ErrorKind::DeadlineExceeded,
            CacheError::AuthFailure(_) => ErrorKind::AuthFailure,
            CacheError::ObjectMissing { .. } => ErrorKind::ObjectMissing,
            CacheError::PartialUploadFailure { .. } => ErrorKind::PartialUploadFailure,
            CacheError::CorruptEntry(_) => ErrorKind::CorruptEntry,
            CacheError::RemoteRejected { .. } => ErrorKind::RemoteRejected,
            CacheError::LocalStore(_) => ErrorKind::LocalStore,
            CacheError::Io { .. } => ErrorKind::Io,
            CacheError::Config(_) => ErrorKind::Config,
        }
    }

    /// Whether this error is retryable
    ///
    /// Credentials are read once at startup and never refreshed, so an
    /// authentication failure will not go away by retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CacheError::RemoteUnavailable(_) | CacheError::DeadlineExceeded { .. }
        )
    }

    /// Whether this error originated in the remote tier
    ///
    /// Callers of `put` use this to decide between failing the build step and
    /// degrading to local-only caching.
    pub fn is_remote(&self) -> bool {
        matches!(
            self,
            CacheError::RemoteUnavailable(_)
                | CacheError::DeadlineExceeded { .. }
                | CacheError::AuthFailure(_)
                | CacheError::ObjectMissing { .. }
                | CacheError::PartialUploadFailure { .. }
                | CacheError::RemoteRejected { .. }
        )
    }

    /// Create a CacheError from an HTTP status code and response body
    pub fn from_status(status: u16, key: &str, body: &str) -> Self {
        match status {
            401 | 403 => CacheError::AuthFailure(format!("HTTP {}: {}", status, truncate(body))),
            404 => CacheError::ObjectMissing {
                key: key.to_string(),
            },
            408 => CacheError::DeadlineExceeded {
                operation: format!("request for {}", key),
                timeout: Duration::ZERO,
            },
            429 | 500..=599 => {
                CacheError::RemoteUnavailable(format!("HTTP {}: {}", status, truncate(body)))
            }
            _ => CacheError::RemoteRejected {
                status,
                body: truncate(body).to_string(),
            },
        }
    }

    /// Wrap an I/O error with a description of what was being done
    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        CacheError::Io {
            context: context.into(),
            source: Arc::new(source),
        }
    }
}

impl From<reqwest::Error> for CacheError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            CacheError::DeadlineExceeded {
                operation: err
                    .url()
                    .map(|u| u.path().to_string())
                    .unwrap_or_else(|| "request".to_string()),
                timeout: Duration::ZERO,
            }
        } else {
            CacheError::RemoteUnavailable(err.to_string())
        }
    }
}

/// Keep error bodies short enough for log lines
fn truncate(body: &str) -> &str {
    const MAX: usize = 512;
    if body.len() <= MAX {
        return body;
    }
    let mut end = MAX;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    &body[..end]
}
