//! S3-Compatible Object Store Client
//!
//! Provides authenticated access to S3 (or any S3-compatible service) for
//! blob upload, download and presigned URL generation.

use std::future::Future;
use std::path::Path;
use std::sync::{PoisonError, RwLock};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use reqwest::header::CONTENT_LENGTH;
use reqwest::{Body, Client, Method, Response, Url};
use tracing::{debug, info};

use super::credentials::Credentials;
use super::signing::{payload_sha256, Signer, UNSIGNED_PAYLOAD};
use super::types::{validate_expiry, HttpMethod, RemoteObjectKey, SignedUrl};
use super::BlobStore;
use crate::config::RemoteConfig;
use crate::error::{CacheError, Result};

/// Idle pooled connections are closed after this long
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

/// S3 REST client shared by every cache operation of one cache instance
pub struct S3Client {
    /// Connection pool; taken on shutdown
    http_client: RwLock<Option<Client>>,
    /// Signing credentials
    credentials: Credentials,
    /// Signing region
    region: String,
    /// Custom endpoint (None = AWS)
    endpoint: Option<Url>,
    /// Use `{endpoint}/{bucket}/{key}` instead of `{bucket}.{endpoint}/{key}`
    force_path_style: bool,
    /// Upper bound for each operation
    timeout: Duration,
}

impl S3Client {
    /// Create a client; no network traffic happens until the first request
    pub fn new(credentials: Credentials, config: &RemoteConfig) -> Result<Self> {
        let endpoint = config
            .endpoint
            .as_deref()
            .map(Url::parse)
            .transpose()
            .map_err(|e| CacheError::Config(format!("invalid endpoint: {}", e)))?;

        let http_client = Client::builder()
            .timeout(config.timeout())
            .pool_idle_timeout(POOL_IDLE_TIMEOUT)
            .build()
            .map_err(|e| CacheError::Config(format!("failed to create HTTP client: {}", e)))?;

        info!(
            region = %config.region,
            endpoint = ?config.endpoint,
            path_style = config.force_path_style,
            "S3 client ready"
        );

        Ok(Self {
            http_client: RwLock::new(Some(http_client)),
            credentials,
            region: config.region.clone(),
            // custom endpoints rarely have wildcard DNS for bucket subdomains
            force_path_style: config.force_path_style || endpoint.is_some(),
            endpoint,
            timeout: config.timeout(),
        })
    }

    /// Get the pooled client, unless shut down
    fn client(&self) -> Result<Client> {
        self.http_client
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| CacheError::RemoteUnavailable("S3 client has been shut down".to_string()))
    }

    /// Build the request URL for an object
    pub fn object_url(&self, key: &RemoteObjectKey) -> Result<Url> {
        let encoded_key = key
            .key
            .split('/')
            .map(|segment| urlencoding::encode(segment).into_owned())
            .collect::<Vec<_>>()
            .join("/");

        let (scheme, authority, base_path) = match &self.endpoint {
            Some(endpoint) => {
                let host = endpoint.host_str().unwrap_or_default();
                let authority = match endpoint.port() {
                    Some(port) => format!("{}:{}", host, port),
                    None => host.to_string(),
                };
                (
                    endpoint.scheme().to_string(),
                    authority,
                    endpoint.path().trim_end_matches('/').to_string(),
                )
            }
            None => ("https".to_string(), aws_host(&self.region), String::new()),
        };

        let raw = if self.force_path_style {
            format!(
                "{}://{}{}/{}/{}",
                scheme, authority, base_path, key.bucket, encoded_key
            )
        } else {
            format!(
                "{}://{}.{}{}/{}",
                scheme, key.bucket, authority, base_path, encoded_key
            )
        };

        Url::parse(&raw).map_err(|e| CacheError::Config(format!("invalid object URL {}: {}", raw, e)))
    }

    /// Run an operation under the configured deadline
    async fn with_deadline<T, F>(&self, operation: &str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(CacheError::DeadlineExceeded {
                operation: operation.to_string(),
                timeout: self.timeout,
            }),
        }
    }

    /// Send a signed request and map non-success statuses to errors
    async fn send(
        &self,
        method: Method,
        key: &RemoteObjectKey,
        body: Option<(Body, u64, String)>,
    ) -> Result<Response> {
        let client = self.client()?;
        let url = self.object_url(key)?;

        let payload_hash = match &body {
            Some((_, _, hash)) => hash.clone(),
            None => payload_sha256(b""),
        };
        let headers = Signer::new(&self.credentials, &self.region).sign_headers(
            method.as_str(),
            &url,
            &payload_hash,
            Utc::now(),
        );

        let mut request = client.request(method, url);
        for (name, value) in headers {
            request = request.header(name, value);
        }
        if let Some((body, content_length, _)) = body {
            request = request.header(CONTENT_LENGTH, content_length).body(body);
        }

        let response = request.send().await?;
        check_status(response, &key.to_string()).await
    }
}

#[async_trait]
impl BlobStore for S3Client {
    async fn upload_file(&self, key: &RemoteObjectKey, source: &Path) -> Result<u64> {
        self.with_deadline("upload", async {
            let file = tokio::fs::File::open(source)
                .await
                .map_err(|e| CacheError::io(format!("opening {}", source.display()), e))?;

            // Content length must be set for stream uploads
            let content_length = file
                .metadata()
                .await
                .map_err(|e| CacheError::io(format!("reading metadata of {}", source.display()), e))?
                .len();

            info!(
                object = %key,
                source = %source.display(),
                size = content_length,
                "Uploading blob"
            );

            self.send(
                Method::PUT,
                key,
                Some((Body::from(file), content_length, UNSIGNED_PAYLOAD.to_string())),
            )
            .await?;

            debug!(object = %key, "Blob uploaded");
            Ok(content_length)
        })
        .await
    }

    async fn upload_bytes(&self, key: &RemoteObjectKey, data: Bytes) -> Result<()> {
        self.with_deadline("put", async {
            let hash = payload_sha256(&data);
            let len = data.len() as u64;
            self.send(Method::PUT, key, Some((Body::from(data), len, hash)))
                .await?;
            debug!(object = %key, size = len, "Object stored");
            Ok(())
        })
        .await
    }

    async fn download(&self, key: &RemoteObjectKey) -> Result<Bytes> {
        self.with_deadline("download", async {
            let response = self.send(Method::GET, key, None).await?;
            let bytes = response.bytes().await?;
            debug!(object = %key, size = bytes.len(), "Downloaded object");
            Ok(bytes)
        })
        .await
    }

    async fn exists(&self, key: &RemoteObjectKey) -> Result<bool> {
        self.with_deadline("head", async {
            match self.send(Method::HEAD, key, None).await {
                Ok(_) => Ok(true),
                Err(CacheError::ObjectMissing { .. }) => Ok(false),
                Err(e) => Err(e),
            }
        })
        .await
    }

    async fn delete(&self, key: &RemoteObjectKey) -> Result<()> {
        self.with_deadline("delete", async {
            match self.send(Method::DELETE, key, None).await {
                Ok(_) | Err(CacheError::ObjectMissing { .. }) => {
                    info!(object = %key, "Deleted object");
                    Ok(())
                }
                Err(e) => Err(e),
            }
        })
        .await
    }

    fn signed_url(
        &self,
        key: &RemoteObjectKey,
        method: HttpMethod,
        expiry: Duration,
    ) -> Result<SignedUrl> {
        validate_expiry(expiry)?;
        self.client()?;

        let url = self.object_url(key)?;
        let signed = Signer::new(&self.credentials, &self.region).presign(
            method.as_str(),
            &url,
            expiry,
            Utc::now(),
        );

        debug!(object = %key, method = method.as_str(), expiry_secs = expiry.as_secs(), "Signed URL issued");
        Ok(SignedUrl {
            url: signed,
            method,
            expires_at: SystemTime::now() + expiry,
        })
    }

    async fn fetch_signed(&self, url: &SignedUrl) -> Result<Bytes> {
        let client = self.client()?;
        self.with_deadline("signed fetch", async {
            let response = client.get(url.url.clone()).send().await?;
            let response = check_status(response, url.url.path()).await?;
            Ok(response.bytes().await?)
        })
        .await
    }

    async fn shutdown(&self) {
        let client = self
            .http_client
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if client.is_some() {
            info!("S3 client shut down");
        }
    }
}

/// Virtual-host base for AWS S3 in a region
fn aws_host(region: &str) -> String {
    if region == "us-east-1" {
        "s3.amazonaws.com".to_string()
    } else {
        format!("s3.{}.amazonaws.com", region)
    }
}

async fn check_status(response: Response, key: &str) -> Result<Response> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    Err(CacheError::from_status(status, key, &body))
}
