//! S3-compatible blob store over HTTP

use super::sigv4::{sha256_hex, uri_encode, Credentials, RequestParts, Signer};
use super::{validate_location, BlobStore};
use crate::error::{CutoutError, Result};
use crate::types::{ObjectLocation, StorageObject};
use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};

/// Connection settings for an S3-compatible endpoint
#[derive(Debug, Clone)]
pub struct S3Config {
    pub region: String,
    /// Custom endpoint such as `http://localhost:9000`; `None` means AWS
    pub endpoint: Option<String>,
    /// Address buckets as `endpoint/bucket/key` instead of `bucket.endpoint/key`
    pub path_style: bool,
    pub credentials: Credentials,
    /// Timeout for a single request in seconds
    pub timeout_secs: u64,
}

impl S3Config {
    /// Read region, endpoint and credentials from the standard AWS variables
    ///
    /// `AWS_REGION` (or `AWS_DEFAULT_REGION`, default `us-east-1`),
    /// `S3_ENDPOINT` / `AWS_ENDPOINT_URL` and `S3_FORCE_PATH_STYLE`.
    ///
    /// # Errors
    /// - Credentials missing
    pub fn from_env() -> Result<Self> {
        let var = |name: &str| std::env::var(name).ok().filter(|v| !v.is_empty());
        let endpoint = var("S3_ENDPOINT").or_else(|| var("AWS_ENDPOINT_URL"));
        let path_style = var("S3_FORCE_PATH_STYLE")
            .map_or(endpoint.is_some(), |v| matches!(v.as_str(), "1" | "true" | "yes"));
        Ok(Self {
            region: var("AWS_REGION")
                .or_else(|| var("AWS_DEFAULT_REGION"))
                .unwrap_or_else(|| "us-east-1".to_string()),
            endpoint,
            path_style,
            credentials: Credentials::from_env()?,
            timeout_secs: 60,
        })
    }
}

/// Blob store talking to S3 (or MinIO and friends) with SigV4-signed requests
#[derive(Debug, Clone)]
pub struct S3Store {
    client: Client,
    signer: Signer,
    region: String,
    endpoint: Option<Url>,
    path_style: bool,
}

/// Resolved address of one object
struct ObjectUrl {
    base: String,
    host: String,
    path: String,
}

impl S3Store {
    /// # Errors
    /// - Malformed endpoint URL
    /// - HTTP client construction failure
    pub fn new(config: S3Config) -> Result<Self> {
        let endpoint = config
            .endpoint
            .as_deref()
            .map(|e| {
                Url::parse(e).map_err(|err| {
                    CutoutError::invalid_config(format!("Invalid S3 endpoint '{e}': {err}"))
                })
            })
            .transpose()?;
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| CutoutError::storage(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            signer: Signer::new(config.credentials, config.region.clone()),
            region: config.region,
            endpoint,
            path_style: config.path_style,
        })
    }

    fn object_url(&self, location: &ObjectLocation) -> Result<ObjectUrl> {
        validate_location(location)?;
        let key = uri_encode(&location.key, false);

        let (scheme, authority) = match &self.endpoint {
            Some(url) => {
                let host = url.host_str().ok_or_else(|| {
                    CutoutError::invalid_config(format!("S3 endpoint has no host: {url}"))
                })?;
                let authority = match url.port() {
                    Some(port) => format!("{host}:{port}"),
                    None => host.to_string(),
                };
                (url.scheme().to_string(), authority)
            },
            None => (
                "https".to_string(),
                format!("s3.{}.amazonaws.com", self.region),
            ),
        };

        let (host, path) = if self.path_style {
            (authority, format!("/{}/{key}", uri_encode(&location.bucket, true)))
        } else {
            (format!("{}.{authority}", location.bucket), format!("/{key}"))
        };

        Ok(ObjectUrl {
            base: format!("{scheme}://{host}"),
            host,
            path,
        })
    }

    fn signed_headers(
        &self,
        method: &str,
        url: &ObjectUrl,
        mut extra: Vec<(String, String)>,
        payload_hash: &str,
    ) -> Result<Vec<(String, String)>> {
        let now = chrono::Utc::now();
        extra.push(("host".to_string(), url.host.clone()));
        extra.push(("x-amz-content-sha256".to_string(), payload_hash.to_string()));
        extra.push((
            "x-amz-date".to_string(),
            now.format("%Y%m%dT%H%M%SZ").to_string(),
        ));
        if let Some(token) = &self.signer.credentials().session_token {
            extra.push(("x-amz-security-token".to_string(), token.clone()));
        }

        let parts = RequestParts {
            method,
            path: &url.path,
            query: Vec::new(),
            headers: extra.clone(),
            payload_hash,
        };
        let authorization = self.signer.authorization(&parts, now)?;
        extra.push(("authorization".to_string(), authorization));
        // reqwest derives Host from the URL
        extra.retain(|(name, _)| name != "host");
        Ok(extra)
    }

    /// Presigned GET at a fixed instant
    ///
    /// # Errors
    /// - Expiry outside 1-604800 seconds
    pub fn presign_at(
        &self,
        location: &ObjectLocation,
        expires_secs: u64,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Result<String> {
        let url = self.object_url(location)?;
        self.signer
            .presign("GET", &url.base, &url.host, &url.path, expires_secs, now)
    }
}

#[async_trait]
impl BlobStore for S3Store {
    async fn put_object(&self, object: StorageObject) -> Result<()> {
        let location = &object.location;
        let url = self.object_url(location)?;
        let payload_hash = sha256_hex(&object.bytes);

        let mut extra = vec![("content-type".to_string(), object.content_type.clone())];
        if !object.cache_control.is_empty() {
            extra.push(("cache-control".to_string(), object.cache_control.clone()));
        }
        let headers = self.signed_headers("PUT", &url, extra, &payload_hash)?;

        let mut request = self
            .client
            .put(format!("{}{}", url.base, url.path))
            .body(object.bytes.clone());
        for (name, value) in headers {
            request = request.header(name, value);
        }

        let response = request.send().await.map_err(|e| {
            CutoutError::storage_with_object("put", &location.bucket, &location.key, &e.to_string())
        })?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(CutoutError::storage_with_object(
                "put",
                &location.bucket,
                &location.key,
                &format!("HTTP {status}: {}", body.chars().take(200).collect::<String>()),
            ));
        }
        log::debug!("s3 store: put {location} ({} bytes)", object.bytes.len());
        Ok(())
    }

    async fn get_object(&self, location: &ObjectLocation) -> Result<Option<Vec<u8>>> {
        let url = self.object_url(location)?;
        let payload_hash = sha256_hex(b"");
        let headers = self.signed_headers("GET", &url, Vec::new(), &payload_hash)?;

        let mut request = self.client.get(format!("{}{}", url.base, url.path));
        for (name, value) in headers {
            request = request.header(name, value);
        }

        let response = request.send().await.map_err(|e| {
            CutoutError::storage_with_object("get", &location.bucket, &location.key, &e.to_string())
        })?;
        match response.status() {
            status if status.is_success() => {
                let bytes = response.bytes().await.map_err(|e| {
                    CutoutError::storage_with_object(
                        "read",
                        &location.bucket,
                        &location.key,
                        &e.to_string(),
                    )
                })?;
                Ok(Some(bytes.to_vec()))
            },
            StatusCode::NOT_FOUND => Ok(None),
            status => Err(CutoutError::storage_with_object(
                "get",
                &location.bucket,
                &location.key,
                &format!("HTTP {status}"),
            )),
        }
    }

    async fn presign_get(&self, location: &ObjectLocation, expires_secs: u64) -> Result<String> {
        self.presign_at(location, expires_secs, chrono::Utc::now())
    }

    fn name(&self) -> &'static str {
        "s3"
    }
}
