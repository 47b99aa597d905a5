//! Snapshot object store
//!
//! ## Responsibilities
//!
//! - Persist event snapshots under deterministic keys
//! - Return a public URL for each stored object
//!
//! The store speaks the S3 wire protocol directly (SigV4 header signing), so
//! any S3-compatible endpoint works. Drivers receive the store through their
//! constructors; there is no process-wide default.

use crate::error::{Error, Result};
use crate::state::{env_bool, env_string};
use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use std::time::Duration;

type HmacSha256 = Hmac<Sha256>;

/// Object-store contract used by drivers
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Store `data` under `key` and return the public URL
    async fn save_snapshot(&self, key: &str, data: &[u8], content_type: &str) -> Result<String>;
}

/// S3-compatible snapshot store
pub struct S3Store {
    client: reqwest::Client,
    endpoint: String,
    bucket: String,
    prefix: String,
    region: String,
    access_key: String,
    secret_key: String,
    use_ssl: bool,
    public_base_url: Option<url::Url>,
}

impl S3Store {
    /// Build the store from `MINIO_*` environment variables and make sure the
    /// bucket exists (optionally with an anonymous-read policy).
    pub async fn from_env() -> Result<Self> {
        let endpoint = env_string("MINIO_ENDPOINT", "localhost:9000");
        let access_key = std::env::var("MINIO_ACCESS_KEY").unwrap_or_default();
        let secret_key = std::env::var("MINIO_SECRET_KEY").unwrap_or_default();
        if access_key.is_empty() || secret_key.is_empty() {
            return Err(Error::Storage(
                "MINIO_ACCESS_KEY / MINIO_SECRET_KEY not configured".to_string(),
            ));
        }

        let public_base = env_string("MINIO_PUBLIC_BASE_URL", "");
        let public_base_url = if public_base.is_empty() {
            None
        } else {
            Some(
                url::Url::parse(&public_base)
                    .map_err(|e| Error::Storage(format!("invalid MINIO_PUBLIC_BASE_URL: {}", e)))?,
            )
        };

        let store = Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .map_err(Error::Http)?,
            endpoint,
            bucket: env_string("MINIO_BUCKET", "camera-snapshots"),
            prefix: env_string("MINIO_PREFIX", "")
                .trim_matches('/')
                .to_string(),
            region: env_string("MINIO_REGION", "us-east-1"),
            access_key,
            secret_key,
            use_ssl: env_bool("MINIO_USE_SSL", false),
            public_base_url,
        };

        store.ensure_bucket().await?;
        if env_bool("MINIO_PUBLIC_READ", false) {
            store.apply_public_read_policy().await?;
        }

        tracing::info!(
            endpoint = %store.endpoint,
            bucket = %store.bucket,
            "object store ready"
        );
        Ok(store)
    }

    fn base_url(&self) -> String {
        let scheme = if self.use_ssl { "https" } else { "http" };
        format!("{}://{}", scheme, self.endpoint)
    }

    fn object_key(&self, key: &str) -> String {
        let clean_key = key.trim_start_matches('/');
        if self.prefix.is_empty() {
            clean_key.to_string()
        } else if clean_key.is_empty() {
            self.prefix.clone()
        } else {
            format!("{}/{}", self.prefix, clean_key)
        }
    }

    async fn ensure_bucket(&self) -> Result<()> {
        let uri = format!("/{}", self.bucket);
        let response = self.signed_request(reqwest::Method::PUT, &uri, "", &[]).await?;
        let status = response.status();
        // 409 = BucketAlreadyOwnedByYou on MinIO
        if status.is_success() || status == reqwest::StatusCode::CONFLICT {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(Error::Storage(format!(
            "create bucket {} failed: {} {}",
            self.bucket, status, body
        )))
    }

    async fn apply_public_read_policy(&self) -> Result<()> {
        let resource = if self.prefix.is_empty() {
            format!("arn:aws:s3:::{}/*", self.bucket)
        } else {
            format!("arn:aws:s3:::{}/{}/*", self.bucket, self.prefix)
        };
        let policy = serde_json::json!({
            "Version": "2012-10-17",
            "Statement": [{
                "Effect": "Allow",
                "Principal": {"AWS": ["*"]},
                "Action": ["s3:GetObject"],
                "Resource": [resource],
            }],
        })
        .to_string();

        let uri = format!("/{}?policy=", self.bucket);
        let response = self
            .signed_request(reqwest::Method::PUT, &uri, "application/json", policy.as_bytes())
            .await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Storage(format!(
                "set public-read policy on {} failed: {} {}",
                self.bucket, status, body
            )));
        }
        Ok(())
    }

    /// Issue a SigV4-signed request. `uri` is path (+ optional `?name=` query).
    async fn signed_request(
        &self,
        method: reqwest::Method,
        uri: &str,
        content_type: &str,
        body: &[u8],
    ) -> Result<reqwest::Response> {
        let now = Utc::now();
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let date_stamp = now.format("%Y%m%d").to_string();

        let (canonical_uri, canonical_query) = match uri.split_once('?') {
            Some((path, query)) => (path.to_string(), query.to_string()),
            None => (uri.to_string(), String::new()),
        };

        let payload_hash = hex_sha256(body);
        let host = self.endpoint.clone();

        let canonical_headers = format!(
            "host:{}\nx-amz-content-sha256:{}\nx-amz-date:{}\n",
            host, payload_hash, amz_date
        );
        let signed_headers = "host;x-amz-content-sha256;x-amz-date";

        let canonical_request = format!(
            "{}\n{}\n{}\n{}\n{}\n{}",
            method.as_str(),
            canonical_uri,
            canonical_query,
            canonical_headers,
            signed_headers,
            payload_hash
        );

        let scope = format!("{}/{}/s3/aws4_request", date_stamp, self.region);
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{}\n{}\n{}",
            amz_date,
            scope,
            hex_sha256(canonical_request.as_bytes())
        );

        let mut signing_key = hmac_sha256(
            format!("AWS4{}", self.secret_key).as_bytes(),
            date_stamp.as_bytes(),
        );
        for part in [self.region.as_str(), "s3", "aws4_request"] {
            signing_key = hmac_sha256(&signing_key, part.as_bytes());
        }
        let signature = hex_encode(&hmac_sha256(&signing_key, string_to_sign.as_bytes()));

        let authorization = format!(
            "AWS4-HMAC-SHA256 Credential={}/{}, SignedHeaders={}, Signature={}",
            self.access_key, scope, signed_headers, signature
        );

        let url = format!("{}{}", self.base_url(), uri);
        let mut request = self
            .client
            .request(method, &url)
            .header("Host", host)
            .header("x-amz-date", amz_date)
            .header("x-amz-content-sha256", payload_hash)
            .header("Authorization", authorization)
            .body(body.to_vec());
        if !content_type.is_empty() {
            request = request.header("Content-Type", content_type);
        }
        request.send().await.map_err(Error::Http)
    }

    fn public_url(&self, object_key: &str) -> String {
        if let Some(base) = &self.public_base_url {
            let mut u = base.clone();
            let base_path = u.path().trim_end_matches('/');
            let joined = if base_path.is_empty() {
                format!("/{}", object_key)
            } else {
                format!("{}/{}", base_path, object_key)
            };
            u.set_path(&joined);
            return u.to_string();
        }
        format!("{}/{}/{}", self.base_url(), self.bucket, object_key)
    }
}

#[async_trait]
impl SnapshotStore for S3Store {
    async fn save_snapshot(&self, key: &str, data: &[u8], content_type: &str) -> Result<String> {
        let content_type = if content_type.is_empty() {
            "image/jpeg"
        } else {
            content_type
        };
        let object_key = self.object_key(key);
        let uri = format!("/{}/{}", self.bucket, object_key);

        let response = self
            .signed_request(reqwest::Method::PUT, &uri, content_type, data)
            .await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Storage(format!(
                "put object {} failed: {} {}",
                object_key, status, body
            )));
        }

        Ok(self.public_url(&object_key))
    }
}

fn hex_sha256(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex_encode(&hasher.finalize())
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

fn hex_encode(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len() * 2);
    for b in data {
        out.push_str(&format!("{:02x}", b));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> S3Store {
        S3Store {
            client: reqwest::Client::new(),
            endpoint: "minio:9000".to_string(),
            bucket: "camera-snapshots".to_string(),
            prefix: "events".to_string(),
            region: "us-east-1".to_string(),
            access_key: "ak".to_string(),
            secret_key: "sk".to_string(),
            use_ssl: false,
            public_base_url: None,
        }
    }

    #[test]
    fn test_object_key_joins_prefix() {
        let s = store();
        assert_eq!(s.object_key("/a/b.jpg"), "events/a/b.jpg");
        assert_eq!(s.object_key("a/b.jpg"), "events/a/b.jpg");
    }

    #[test]
    fn test_public_url_endpoint_fallback() {
        let s = store();
        assert_eq!(
            s.public_url("events/a/b.jpg"),
            "http://minio:9000/camera-snapshots/events/a/b.jpg"
        );
    }

    #[test]
    fn test_public_url_with_base() {
        let mut s = store();
        s.public_base_url = Some(url::Url::parse("https://cdn.example.com/snaps").unwrap());
        assert_eq!(
            s.public_url("events/a/b.jpg"),
            "https://cdn.example.com/snaps/events/a/b.jpg"
        );
    }

    #[test]
    fn test_hex_sha256_known_vector() {
        assert_eq!(
            hex_sha256(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
