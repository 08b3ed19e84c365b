//! Object-store credentials read from the process environment

use std::fmt;

use tracing::debug;

use crate::config::RemoteConfig;
use crate::error::{CacheError, Result};

/// Access key pair (plus optional session token)
#[derive(Clone)]
pub struct Credentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: Option<String>,
}

impl Credentials {
    pub fn new(access_key_id: impl Into<String>, secret_access_key: impl Into<String>) -> Self {
        Self {
            access_key_id: access_key_id.into(),
            secret_access_key: secret_access_key.into(),
            session_token: None,
        }
    }

    /// Read credentials from the environment variables named in `config`
    pub fn from_env(config: &RemoteConfig) -> Result<Self> {
        Self::from_lookup(config, |name| std::env::var(name).ok())
    }

    /// Read credentials through an explicit variable source
    ///
    /// Missing or empty key variables fail with
    /// [`CacheError::MissingCredentials`]; the session token is optional.
    pub fn from_lookup<F>(config: &RemoteConfig, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |name: &str| {
            lookup(name)
                .filter(|v| !v.is_empty())
                .ok_or_else(|| CacheError::MissingCredentials {
                    var: name.to_string(),
                })
        };

        let access_key_id = required(&config.access_key_env)?;
        let secret_access_key = required(&config.secret_key_env)?;
        let session_token = lookup(&config.session_token_env).filter(|v| !v.is_empty());

        debug!(
            access_key_env = %config.access_key_env,
            session = session_token.is_some(),
            "Loaded object store credentials"
        );

        Ok(Self {
            access_key_id,
            secret_access_key,
            session_token,
        })
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .field(
                "session_token",
                &self.session_token.as_ref().map(|_| "<redacted>"),
            )
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_access_key() {
        let config = RemoteConfig::new("b");
        let err = Credentials::from_lookup(&config, |_| None).unwrap_err();
        match err {
            CacheError::MissingCredentials { var } => assert_eq!(var, "AWS_ACCESS_KEY_ID"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_empty_secret_is_missing() {
        let config = RemoteConfig::new("b");
        let err = Credentials::from_lookup(&config, |name| match name {
            "AWS_ACCESS_KEY_ID" => Some("AKID".to_string()),
            "AWS_SECRET_ACCESS_KEY" => Some(String::new()),
            _ => None,
        })
        .unwrap_err();
        assert!(matches!(err, CacheError::MissingCredentials { var } if var == "AWS_SECRET_ACCESS_KEY"));
    }

    #[test]
    fn test_loads_and_redacts() {
        let config = RemoteConfig::new("b");
        let creds = Credentials::from_lookup(&config, |name| match name {
            "AWS_ACCESS_KEY_ID" => Some("AKID".to_string()),
            "AWS_SECRET_ACCESS_KEY" => Some("s3cr3t".to_string()),
            "AWS_SESSION_TOKEN" => Some("tok".to_string()),
            _ => None,
        })
        .unwrap();
        assert_eq!(creds.access_key_id, "AKID");
        assert_eq!(creds.session_token.as_deref(), Some("tok"));

        let debug = format!("{:?}", creds);
        assert!(!debug.contains("s3cr3t"));
        assert!(!debug.contains("tok\""));
    }
}
