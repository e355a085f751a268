//! AWS Signature Version 4 for S3-compatible requests
//!
//! Covers the two forms the store needs: an `Authorization` header for PUT/GET
//! and query-string authentication for presigned GET URLs.

use crate::error::{CutoutError, Result};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

const ALGORITHM: &str = "AWS4-HMAC-SHA256";

/// Payload hash used for presigned URLs
pub const UNSIGNED_PAYLOAD: &str = "UNSIGNED-PAYLOAD";

/// Access credentials
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: Option<String>,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .field("session_token", &self.session_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl Credentials {
    pub fn new<A: Into<String>, S: Into<String>>(access_key_id: A, secret_access_key: S) -> Self {
        Self {
            access_key_id: access_key_id.into(),
            secret_access_key: secret_access_key.into(),
            session_token: None,
        }
    }

    /// Read `AWS_ACCESS_KEY_ID`, `AWS_SECRET_ACCESS_KEY` and `AWS_SESSION_TOKEN`
    ///
    /// # Errors
    /// - Key id or secret missing
    pub fn from_env() -> Result<Self> {
        let access_key_id = std::env::var("AWS_ACCESS_KEY_ID")
            .map_err(|_| CutoutError::invalid_config("AWS_ACCESS_KEY_ID is not set"))?;
        let secret_access_key = std::env::var("AWS_SECRET_ACCESS_KEY")
            .map_err(|_| CutoutError::invalid_config("AWS_SECRET_ACCESS_KEY is not set"))?;
        Ok(Self {
            access_key_id,
            secret_access_key,
            session_token: std::env::var("AWS_SESSION_TOKEN").ok().filter(|t| !t.is_empty()),
        })
    }
}

/// HMAC-SHA256 (RFC 2104)
///
/// # Errors
/// - Key rejected by the MAC
pub fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<[u8; 32]> {
    let mut mac = Hmac::<Sha256>::new_from_slice(key)
        .map_err(|e| CutoutError::internal(format!("HMAC key rejected: {e}")))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().into())
}

#[must_use]
pub fn sha256_hex(data: &[u8]) -> String {
    format!("{:x}", Sha256::digest(data))
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// RFC 3986 percent-encoding as S3 expects it
#[must_use]
pub fn uri_encode(input: &str, encode_slash: bool) -> String {
    let mut encoded = String::with_capacity(input.len());
    for byte in input.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                encoded.push(char::from(byte));
            },
            b'/' if !encode_slash => encoded.push('/'),
            _ => encoded.push_str(&format!("%{byte:02X}")),
        }
    }
    encoded
}

/// Request signer for one region and service
#[derive(Debug, Clone)]
pub struct Signer {
    credentials: Credentials,
    region: String,
    service: String,
}

/// The parts of a request that enter the signature
#[derive(Debug, Clone)]
pub struct RequestParts<'a> {
    pub method: &'a str,
    /// Already URI-encoded absolute path
    pub path: &'a str,
    /// Unencoded query parameters
    pub query: Vec<(String, String)>,
    /// Header names and values; `host` must be present
    pub headers: Vec<(String, String)>,
    pub payload_hash: &'a str,
}

impl Signer {
    pub fn new<R: Into<String>>(credentials: Credentials, region: R) -> Self {
        Self {
            credentials,
            region: region.into(),
            service: "s3".to_string(),
        }
    }

    #[must_use]
    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    fn scope(&self, date: &str) -> String {
        format!("{date}/{}/{}/aws4_request", self.region, self.service)
    }

    fn signing_key(&self, date: &str) -> Result<[u8; 32]> {
        let secret = format!("AWS4{}", self.credentials.secret_access_key);
        let date_key = hmac_sha256(secret.as_bytes(), date.as_bytes())?;
        let region_key = hmac_sha256(&date_key, self.region.as_bytes())?;
        let service_key = hmac_sha256(&region_key, self.service.as_bytes())?;
        hmac_sha256(&service_key, b"aws4_request")
    }

    fn canonical_query(query: &[(String, String)]) -> String {
        let mut pairs: Vec<(String, String)> = query
            .iter()
            .map(|(k, v)| (uri_encode(k, true), uri_encode(v, true)))
            .collect();
        pairs.sort();
        pairs
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("&")
    }

    /// Canonical headers block and the signed-headers list
    fn canonical_headers(headers: &[(String, String)]) -> (String, String) {
        let mut normalized: Vec<(String, String)> = headers
            .iter()
            .map(|(name, value)| {
                let value = value.split_whitespace().collect::<Vec<_>>().join(" ");
                (name.to_ascii_lowercase(), value)
            })
            .collect();
        normalized.sort();

        let block = normalized
            .iter()
            .map(|(name, value)| format!("{name}:{value}\n"))
            .collect::<String>();
        let signed = normalized
            .iter()
            .map(|(name, _)| name.as_str())
            .collect::<Vec<_>>()
            .join(";");
        (block, signed)
    }

    fn signature(
        &self,
        parts: &RequestParts<'_>,
        amz_date: &str,
        date: &str,
    ) -> Result<(String, String)> {
        let (header_block, signed_headers) = Self::canonical_headers(&parts.headers);
        let canonical_request = format!(
            "{}\n{}\n{}\n{}\n{}\n{}",
            parts.method,
            parts.path,
            Self::canonical_query(&parts.query),
            header_block,
            signed_headers,
            parts.payload_hash
        );
        log::trace!("canonical request:\n{canonical_request}");

        let string_to_sign = format!(
            "{ALGORITHM}\n{amz_date}\n{}\n{}",
            self.scope(date),
            sha256_hex(canonical_request.as_bytes())
        );
        let signature = hex(&hmac_sha256(&self.signing_key(date)?, string_to_sign.as_bytes())?);
        Ok((signature, signed_headers))
    }

    /// `Authorization` header value for a request made at `now`
    ///
    /// The caller must send `x-amz-date` (and `x-amz-content-sha256` for S3)
    /// with exactly the values included in `parts.headers`.
    ///
    /// # Errors
    /// - Signing key rejected by the MAC
    pub fn authorization(&self, parts: &RequestParts<'_>, now: DateTime<Utc>) -> Result<String> {
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let date = now.format("%Y%m%d").to_string();
        let (signature, signed_headers) = self.signature(parts, &amz_date, &date)?;
        Ok(format!(
            "{ALGORITHM} Credential={}/{},SignedHeaders={signed_headers},Signature={signature}",
            self.credentials.access_key_id,
            self.scope(&date)
        ))
    }

    /// Presigned URL for `method` on `base_url` + `path`
    ///
    /// # Errors
    /// - `expires_secs` outside 1-604800
    pub fn presign(
        &self,
        method: &str,
        base_url: &str,
        host: &str,
        path: &str,
        expires_secs: u64,
        now: DateTime<Utc>,
    ) -> Result<String> {
        if expires_secs == 0 || expires_secs > crate::config::MAX_PRESIGN_EXPIRES {
            return Err(CutoutError::storage(format!(
                "Presign expiry {expires_secs}s outside 1-{}",
                crate::config::MAX_PRESIGN_EXPIRES
            )));
        }
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let date = now.format("%Y%m%d").to_string();

        let mut query = vec![
            ("X-Amz-Algorithm".to_string(), ALGORITHM.to_string()),
            (
                "X-Amz-Credential".to_string(),
                format!("{}/{}", self.credentials.access_key_id, self.scope(&date)),
            ),
            ("X-Amz-Date".to_string(), amz_date.clone()),
            ("X-Amz-Expires".to_string(), expires_secs.to_string()),
            ("X-Amz-SignedHeaders".to_string(), "host".to_string()),
        ];
        if let Some(token) = &self.credentials.session_token {
            query.push(("X-Amz-Security-Token".to_string(), token.clone()));
        }

        let parts = RequestParts {
            method,
            path,
            query: query.clone(),
            headers: vec![("host".to_string(), host.to_string())],
            payload_hash: UNSIGNED_PAYLOAD,
        };
        let (signature, _) = self.signature(&parts, &amz_date, &date)?;

        Ok(format!(
            "{base_url}{path}?{}&X-Amz-Signature={signature}",
            Self::canonical_query(&query)
        ))
    }
}
