//! Configuration types for the action cache

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CacheError, Result};

/// Top-level cache configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct CacheConfig {
    /// Local snapshot location (None = platform cache directory)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_path: Option<PathBuf>,

    /// Remote tier settings (None = local-only caching)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote: Option<RemoteConfig>,
}

/// Configuration for the remote object-storage tier
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RemoteConfig {
    /// Bucket holding blobs and entry descriptors
    pub bucket: String,

    /// Key prefix inside the bucket
    #[serde(default = "default_prefix")]
    pub prefix: String,

    /// Signing region
    #[serde(default = "default_region")]
    pub region: String,

    /// S3-compatible endpoint (e.g., "http://localhost:9000"); None = AWS
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,

    /// Address buckets as a path segment instead of a subdomain
    #[serde(default)]
    pub force_path_style: bool,

    /// Satisfy local misses from the remote tier
    #[serde(default = "default_true")]
    pub shared_cache: bool,

    /// Report remote failures from `get` instead of treating them as misses
    #[serde(default)]
    pub strict: bool,

    /// Directory output paths are relative to
    #[serde(default = "default_exec_root")]
    pub exec_root: PathBuf,

    /// Maximum concurrent blob uploads
    #[serde(default = "default_max_concurrent_uploads")]
    pub max_concurrent_uploads: usize,

    /// Per-operation timeout in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Lifetime of signed URLs in seconds
    #[serde(default = "default_signed_url_expiry_secs")]
    pub signed_url_expiry_secs: u64,

    /// How long a remote lookup outcome is reused before asking again
    #[serde(default = "default_lookup_ttl_secs")]
    pub lookup_ttl_secs: u64,

    /// Delete the remote descriptor (best effort) when an entry is removed
    #[serde(default)]
    pub delete_on_remove: bool,

    /// Environment variable holding the access key id
    #[serde(default = "default_access_key_env")]
    pub access_key_env: String,

    /// Environment variable holding the secret access key
    #[serde(default = "default_secret_key_env")]
    pub secret_key_env: String,

    /// Environment variable holding an optional session token
    #[serde(default = "default_session_token_env")]
    pub session_token_env: String,

    /// Retry configuration
    #[serde(default)]
    pub retry: RetryConfig,
}

impl RemoteConfig {
    /// Configuration with defaults for everything but the bucket
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            prefix: default_prefix(),
            region: default_region(),
            endpoint: None,
            force_path_style: false,
            shared_cache: true,
            strict: false,
            exec_root: default_exec_root(),
            max_concurrent_uploads: default_max_concurrent_uploads(),
            timeout_secs: default_timeout_secs(),
            signed_url_expiry_secs: default_signed_url_expiry_secs(),
            lookup_ttl_secs: default_lookup_ttl_secs(),
            delete_on_remove: false,
            access_key_env: default_access_key_env(),
            secret_key_env: default_secret_key_env(),
            session_token_env: default_session_token_env(),
            retry: RetryConfig::default(),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn signed_url_expiry(&self) -> Duration {
        Duration::from_secs(self.signed_url_expiry_secs)
    }

    pub fn lookup_ttl(&self) -> Duration {
        Duration::from_secs(self.lookup_ttl_secs)
    }

    /// Reject settings that cannot work
    pub fn validate(&self) -> Result<()> {
        if self.bucket.is_empty() {
            return Err(CacheError::Config("bucket must not be empty".to_string()));
        }
        if self.max_concurrent_uploads == 0 {
            return Err(CacheError::Config(
                "max_concurrent_uploads must be at least 1".to_string(),
            ));
        }
        if self.timeout_secs == 0 {
            return Err(CacheError::Config(
                "timeout_secs must be at least 1".to_string(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(CacheError::Config(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Retry configuration with exponential backoff
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first one
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,

    /// Initial backoff duration in milliseconds
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    /// Maximum backoff duration in milliseconds
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    /// Backoff multiplier
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

impl CacheConfig {
    /// Load configuration from a JSON file
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| CacheError::io(format!("reading config {}", path.display()), e))?;
        let config: CacheConfig = serde_json::from_str(&raw).map_err(|e| {
            CacheError::Config(format!("failed to parse {}: {}", path.display(), e))
        })?;
        if let Some(remote) = &config.remote {
            remote.validate()?;
        }
        Ok(config)
    }

    /// Build configuration from `ACTION_CACHE_*` environment variables
    ///
    /// Remote caching is enabled when `ACTION_CACHE_BUCKET` is set.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as [`CacheConfig::from_env`] with an explicit variable source
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.is_empty());

        let remote = match get("ACTION_CACHE_BUCKET") {
            Some(bucket) => {
                let mut remote = RemoteConfig::new(bucket);
                if let Some(region) = get("ACTION_CACHE_REGION") {
                    remote.region = region;
                }
                if let Some(prefix) = get("ACTION_CACHE_PREFIX") {
                    remote.prefix = prefix;
                }
                remote.endpoint = get("ACTION_CACHE_ENDPOINT");
                remote.force_path_style = remote.endpoint.is_some();
                if let Some(shared) = get("ACTION_CACHE_SHARED") {
                    remote.shared_cache = parse_bool("ACTION_CACHE_SHARED", &shared)?;
                }
                if let Some(strict) = get("ACTION_CACHE_STRICT") {
                    remote.strict = parse_bool("ACTION_CACHE_STRICT", &strict)?;
                }
                if let Some(root) = get("ACTION_CACHE_EXEC_ROOT") {
                    remote.exec_root = PathBuf::from(root);
                }
                remote.validate()?;
                Some(remote)
            }
            None => None,
        };

        Ok(Self {
            local_path: get("ACTION_CACHE_LOCAL_PATH").map(PathBuf::from),
            remote,
        })
    }
}

fn parse_bool(name: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(CacheError::Config(format!(
            "{} must be a boolean, got '{}'",
            name, value
        ))),
    }
}

// Default value functions
fn default_prefix() -> String {
    "action-cache".to_string()
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_true() -> bool {
    true
}

fn default_exec_root() -> PathBuf {
    PathBuf::from(".")
}

fn default_max_concurrent_uploads() -> usize {
    16
}

fn default_timeout_secs() -> u64 {
    60
}

fn default_signed_url_expiry_secs() -> u64 {
    3600
}

fn default_lookup_ttl_secs() -> u64 {
    30
}

fn default_access_key_env() -> String {
    "AWS_ACCESS_KEY_ID".to_string()
}

fn default_secret_key_env() -> String {
    "AWS_SECRET_ACCESS_KEY".to_string()
}

fn default_session_token_env() -> String {
    "AWS_SESSION_TOKEN".to_string()
}

fn default_max_attempts() -> usize {
    3
}

fn default_initial_backoff_ms() -> u64 {
    100
}

fn default_max_backoff_ms() -> u64 {
    10000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}
