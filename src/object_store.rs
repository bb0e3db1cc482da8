//! Persistence of extracted documents in an S3-compatible bucket (MinIO in development).
//!
//! Every document becomes its own object holding a single JSON line, keyed by
//! `{YYYY-MM-DD}/{epoch-millis}.jsonl`. Requests are path-style and signed with AWS Signature
//! Version 4.
use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use reqwest::{Method, StatusCode};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::content::ExtractedDocument;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("invalid object store endpoint {0:?}")]
    InvalidEndpoint(String),

    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{operation} {url} returned HTTP {status}: {body}")]
    Status {
        operation: &'static str,
        url: String,
        status: StatusCode,
        body: String,
    },

    #[error("failed to serialize document: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Where extracted documents end up.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Stores `doc` as a new object and returns its key. Nothing is retried.
    async fn save(&self, doc: &ExtractedDocument) -> Result<String, PersistenceError>;
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Scheme, host and optional port, e.g. `http://localhost:9000`.
    pub endpoint: String,
    pub bucket: String,
    pub access_key: String,
    pub secret_key: String,
    pub region: String,
}

/// Issues strictly increasing epoch milliseconds, so two saves never share a key.
#[derive(Debug, Default)]
pub struct KeyClock {
    last: AtomicI64,
}

impl KeyClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// `now_millis`, or one more than the previously issued value if time has not advanced.
    pub fn next_millis(&self, now_millis: i64) -> i64 {
        let mut previous = self.last.load(Ordering::Relaxed);
        loop {
            let next = if now_millis > previous {
                now_millis
            } else {
                previous + 1
            };
            match self
                .last
                .compare_exchange_weak(previous, next, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return next,
                Err(actual) => previous = actual,
            }
        }
    }

    pub fn object_key(&self, now: DateTime<Utc>) -> String {
        let millis = self.next_millis(now.timestamp_millis());
        let day = DateTime::<Utc>::from_timestamp_millis(millis).unwrap_or(now);
        format!("{}/{}.jsonl", day.format("%Y-%m-%d"), millis)
    }
}

/// [DocumentStore] for S3 and S3-compatible services.
pub struct S3Store {
    client: reqwest::Client,
    endpoint: String,
    host: String,
    config: StoreConfig,
    keys: KeyClock,
}

impl S3Store {
    pub fn new(client: reqwest::Client, config: StoreConfig) -> Result<Self, PersistenceError> {
        let endpoint = config.endpoint.trim_end_matches('/').to_string();
        let host = endpoint
            .strip_prefix("https://")
            .or_else(|| endpoint.strip_prefix("http://"))
            .filter(|host| !host.is_empty() && !host.contains('/'))
            .ok_or_else(|| PersistenceError::InvalidEndpoint(config.endpoint.clone()))?
            .to_string();
        Ok(Self {
            client,
            endpoint,
            host,
            config,
            keys: KeyClock::new(),
        })
    }

    /// Creates the store and makes sure its bucket exists.
    pub async fn connect(
        client: reqwest::Client,
        config: StoreConfig,
    ) -> Result<Self, PersistenceError> {
        let store = Self::new(client, config)?;
        store.ensure_bucket().await?;
        Ok(store)
    }

    pub fn bucket(&self) -> &str {
        &self.config.bucket
    }

    #[tracing::instrument(skip(self), fields(bucket = %self.config.bucket))]
    pub async fn ensure_bucket(&self) -> Result<(), PersistenceError> {
        let path = format!("/{}", uri_encode(&self.config.bucket));
        let res = self.send(Method::HEAD, &path, Vec::new(), None).await?;
        if res.status().is_success() {
            return Ok(());
        }
        if res.status() != StatusCode::NOT_FOUND {
            return Err(self.status_error("HEAD", &path, res).await);
        }

        tracing::info!("Creating bucket {}", self.config.bucket);
        let res = self.send(Method::PUT, &path, Vec::new(), None).await?;
        if !res.status().is_success() {
            return Err(self.status_error("PUT", &path, res).await);
        }
        Ok(())
    }

    pub async fn put_object(
        &self,
        key: &str,
        body: Vec<u8>,
        content_type: &str,
    ) -> Result<(), PersistenceError> {
        let path = object_path(&self.config.bucket, key);
        let res = self
            .send(Method::PUT, &path, body, Some(content_type))
            .await?;
        if !res.status().is_success() {
            return Err(self.status_error("PUT", &path, res).await);
        }
        Ok(())
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Vec<u8>,
        content_type: Option<&str>,
    ) -> Result<reqwest::Response, PersistenceError> {
        let url = format!("{}{}", self.endpoint, path);
        let payload_hash = hex_sha256(&body);
        let signed = sign_request(
            &self.config,
            &self.host,
            method.as_str(),
            path,
            &payload_hash,
            Utc::now(),
        );

        let mut req = self
            .client
            .request(method, &url)
            .header("Authorization", &signed.authorization)
            .header("x-amz-content-sha256", &payload_hash)
            .header("x-amz-date", &signed.amz_date);
        if let Some(content_type) = content_type {
            req = req.header(reqwest::header::CONTENT_TYPE, content_type);
        }
        req.body(body)
            .send()
            .await
            .map_err(|source| PersistenceError::Request { url, source })
    }

    async fn status_error(
        &self,
        operation: &'static str,
        path: &str,
        res: reqwest::Response,
    ) -> PersistenceError {
        let status = res.status();
        let body = res.text().await.unwrap_or_default();
        PersistenceError::Status {
            operation,
            url: format!("{}{}", self.endpoint, path),
            status,
            body: body.chars().take(500).collect(),
        }
    }
}

#[async_trait]
impl DocumentStore for S3Store {
    async fn save(&self, doc: &ExtractedDocument) -> Result<String, PersistenceError> {
        let mut line = serde_json::to_vec(doc)?;
        line.push(b'\n');
        let key = self.keys.object_key(Utc::now());
        self.put_object(&key, line, "application/json").await?;
        tracing::debug!("Saved {} to s3://{}/{}", doc.url, self.config.bucket, key);
        Ok(key)
    }
}

/// Path-style location of `key` in `bucket`, with every segment encoded.
pub fn object_path(bucket: &str, key: &str) -> String {
    let key = key.split('/').map(uri_encode).collect::<Vec<_>>().join("/");
    format!("/{}/{}", uri_encode(bucket), key)
}

/// Headers that authenticate a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedRequest {
    pub amz_date: String,
    pub authorization: String,
}

/// Signs a request without query string. Only `host`, `x-amz-content-sha256` and `x-amz-date`
/// are signed headers.
pub fn sign_request(
    config: &StoreConfig,
    host: &str,
    method: &str,
    canonical_uri: &str,
    payload_hash: &str,
    now: DateTime<Utc>,
) -> SignedRequest {
    let date_stamp = now.format("%Y%m%d").to_string();
    let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();

    let signed_headers = "host;x-amz-content-sha256;x-amz-date";
    let canonical_headers =
        format!("host:{host}\nx-amz-content-sha256:{payload_hash}\nx-amz-date:{amz_date}\n");
    let canonical_request = format!(
        "{method}\n{canonical_uri}\n\n{canonical_headers}\n{signed_headers}\n{payload_hash}"
    );

    let credential_scope = format!("{}/{}/s3/aws4_request", date_stamp, config.region);
    let string_to_sign = format!(
        "AWS4-HMAC-SHA256\n{}\n{}\n{}",
        amz_date,
        credential_scope,
        hex_sha256(canonical_request.as_bytes())
    );
    let signing_key = derive_signing_key(&config.secret_key, &date_stamp, &config.region, "s3");
    let signature = hex::encode(hmac_sha256(&signing_key, string_to_sign.as_bytes()));

    SignedRequest {
        authorization: format!(
            "AWS4-HMAC-SHA256 Credential={}/{}, SignedHeaders={}, Signature={}",
            config.access_key, credential_scope, signed_headers, signature
        ),
        amz_date,
    }
}

fn hex_sha256(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts keys of any length");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

fn derive_signing_key(secret_key: &str, date_stamp: &str, region: &str, service: &str) -> Vec<u8> {
    let k_date = hmac_sha256(format!("AWS4{secret_key}").as_bytes(), date_stamp.as_bytes());
    let k_region = hmac_sha256(&k_date, region.as_bytes());
    let k_service = hmac_sha256(&k_region, service.as_bytes());
    hmac_sha256(&k_service, b"aws4_request")
}

/// Percent-encodes everything but the RFC 3986 unreserved characters.
fn uri_encode(s: &str) -> String {
    let mut encoded = String::with_capacity(s.len());
    for byte in s.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                encoded.push(byte as char)
            }
            _ => encoded.push_str(&format!("%{byte:02X}")),
        }
    }
    encoded
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn config() -> StoreConfig {
        StoreConfig {
            endpoint: "http://localhost:9000".to_string(),
            bucket: "worker".to_string(),
            access_key: "minioadmin".to_string(),
            secret_key: "minioadmin".to_string(),
            region: "us-east-1".to_string(),
        }
    }

    #[test]
    fn signing_key_matches_aws_example() {
        let key = derive_signing_key(
            "wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY",
            "20120215",
            "us-east-1",
            "iam",
        );
        assert_eq!(
            hex::encode(key),
            "f4780e2d9f65fa895f9c67b32ce1baf0b0d8a43505a000a1a9e090d414db404d"
        );
    }

    #[test]
    fn keys_within_one_millisecond_are_distinct() {
        let clock = KeyClock::new();
        let now = Utc.with_ymd_and_hms(2024, 7, 22, 12, 7, 56).unwrap();
        let millis = now.timestamp_millis();
        let first = clock.object_key(now);
        let second = clock.object_key(now);
        assert_eq!(first, format!("2024-07-22/{millis}.jsonl"));
        assert_eq!(second, format!("2024-07-22/{}.jsonl", millis + 1));
    }

    #[test]
    fn clock_never_goes_backwards() {
        let clock = KeyClock::new();
        assert_eq!(clock.next_millis(1_000), 1_000);
        assert_eq!(clock.next_millis(900), 1_001);
        assert_eq!(clock.next_millis(2_000), 2_000);
    }

    #[test]
    fn object_paths_are_encoded_per_segment() {
        assert_eq!(
            object_path("worker", "2024-07-22/1721650076000.jsonl"),
            "/worker/2024-07-22/1721650076000.jsonl"
        );
        assert_eq!(uri_encode("a b+c"), "a%20b%2Bc");
    }

    #[test]
    fn authorization_names_scope_and_signed_headers() {
        let now = Utc.with_ymd_and_hms(2024, 7, 22, 12, 7, 56).unwrap();
        let signed = sign_request(&config(), "localhost:9000", "PUT", "/worker", &hex_sha256(b""), now);
        assert_eq!(signed.amz_date, "20240722T120756Z");
        assert!(signed.authorization.starts_with(
            "AWS4-HMAC-SHA256 Credential=minioadmin/20240722/us-east-1/s3/aws4_request, \
             SignedHeaders=host;x-amz-content-sha256;x-amz-date, Signature="
        ));
    }

    #[test]
    fn endpoint_must_have_a_scheme() {
        assert!(S3Store::new(reqwest::Client::new(), config()).is_ok());
        let bad = StoreConfig {
            endpoint: "localhost:9000".to_string(),
            ..config()
        };
        assert!(matches!(
            S3Store::new(reqwest::Client::new(), bad),
            Err(PersistenceError::InvalidEndpoint(_))
        ));
    }
}
