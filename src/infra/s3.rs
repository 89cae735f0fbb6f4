//! S3-compatible object storage over plain HTTPS with AWS Signature Version 4.
//!
//! Objects are addressed path-style (`{endpoint}/{bucket}/{key}`) so the same
//! code works against AWS and self-hosted S3 implementations.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use hmac::{Hmac, Mac, digest::KeyInit};
use sha2::{Digest, Sha256};
use time::{OffsetDateTime, format_description::BorrowedFormatItem, macros::format_description};
use tracing::debug;
use url::Url;

use crate::{
    application::artifacts::{ArtifactError, ObjectStore},
    config::S3Settings,
    domain::entities::PresignedUrl,
    infra::error::InfraError,
};

const ALGORITHM: &str = "AWS4-HMAC-SHA256";
const SERVICE: &str = "s3";
const UNSIGNED_PAYLOAD: &str = "UNSIGNED-PAYLOAD";
const AMZ_DATE: &[BorrowedFormatItem<'static>] =
    format_description!("[year][month][day]T[hour][minute][second]Z");
const SHORT_DATE: &[BorrowedFormatItem<'static>] = format_description!("[year][month][day]");

#[derive(Debug, Clone)]
struct Credentials {
    access_key_id: String,
    secret_access_key: String,
    region: String,
}

pub struct S3ObjectStore {
    client: reqwest::Client,
    base: String,
    host: String,
    credentials: Credentials,
}

impl S3ObjectStore {
    pub fn new(settings: &S3Settings) -> Result<Self, InfraError> {
        let endpoint = Url::parse(&settings.endpoint).map_err(|err| {
            InfraError::configuration(format!("invalid S3 endpoint `{}`: {err}", settings.endpoint))
        })?;
        let host_name = endpoint.host_str().ok_or_else(|| {
            InfraError::configuration(format!("S3 endpoint `{}` has no host", settings.endpoint))
        })?;
        let host = match endpoint.port() {
            Some(port) => format!("{host_name}:{port}"),
            None => host_name.to_string(),
        };
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|err| InfraError::configuration(format!("failed to build HTTP client: {err}")))?;

        Ok(Self {
            client,
            base: format!("{}://{host}", endpoint.scheme()),
            host,
            credentials: Credentials {
                access_key_id: settings.access_key_id.clone(),
                secret_access_key: settings.secret_access_key.clone(),
                region: settings.region.clone(),
            },
        })
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn put(
        &self,
        bucket: &str,
        key: &str,
        bytes: Bytes,
        content_type: &str,
    ) -> Result<(), ArtifactError> {
        let path = object_path(bucket, key);
        let now = OffsetDateTime::now_utc();
        let payload_hash = hex::encode(Sha256::digest(&bytes));
        let signed = sign_put(
            &self.credentials,
            &self.host,
            &path,
            content_type,
            &payload_hash,
            now,
        )
        .map_err(ArtifactError::Upload)?;

        let response = self
            .client
            .put(format!("{}{path}", self.base))
            .header("content-type", content_type)
            .header("x-amz-content-sha256", &payload_hash)
            .header("x-amz-date", &signed.amz_date)
            .header("authorization", &signed.authorization)
            .body(bytes)
            .send()
            .await
            .map_err(|err| ArtifactError::Upload(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ArtifactError::Upload(format!(
                "PUT {path} returned {status}: {}",
                body.chars().take(512).collect::<String>()
            )));
        }

        debug!(
            target = "cardsmith::infra::s3",
            bucket,
            key,
            "Uploaded object"
        );
        Ok(())
    }

    async fn presign(
        &self,
        bucket: &str,
        key: &str,
        ttl: Duration,
    ) -> Result<PresignedUrl, ArtifactError> {
        let path = object_path(bucket, key);
        let now = OffsetDateTime::now_utc();
        let query = presign_query(&self.credentials, &self.host, &path, ttl.as_secs(), now)
            .map_err(ArtifactError::Presign)?;

        Ok(PresignedUrl {
            url: format!("{}{path}?{query}", self.base),
            expires_at: now + ttl,
        })
    }
}

struct SignedRequest {
    amz_date: String,
    authorization: String,
}

fn format_dates(now: OffsetDateTime) -> Result<(String, String), String> {
    let now = now.to_offset(time::UtcOffset::UTC);
    let amz_date = now.format(AMZ_DATE).map_err(|err| err.to_string())?;
    let short_date = now.format(SHORT_DATE).map_err(|err| err.to_string())?;
    Ok((amz_date, short_date))
}

fn sign_put(
    credentials: &Credentials,
    host: &str,
    path: &str,
    content_type: &str,
    payload_hash: &str,
    now: OffsetDateTime,
) -> Result<SignedRequest, String> {
    let (amz_date, short_date) = format_dates(now)?;
    let scope = format!("{short_date}/{}/{SERVICE}/aws4_request", credentials.region);
    let signed_headers = "content-type;host;x-amz-content-sha256;x-amz-date";
    let canonical = format!(
        "PUT\n{path}\n\ncontent-type:{content_type}\nhost:{host}\nx-amz-content-sha256:{payload_hash}\nx-amz-date:{amz_date}\n\n{signed_headers}\n{payload_hash}"
    );
    let signature = signature(credentials, &short_date, &amz_date, &scope, &canonical)?;

    Ok(SignedRequest {
        authorization: format!(
            "{ALGORITHM} Credential={}/{scope}, SignedHeaders={signed_headers}, Signature={signature}",
            credentials.access_key_id
        ),
        amz_date,
    })
}

/// Query string (including `X-Amz-Signature`) granting GET on `path` for `expires_secs`.
fn presign_query(
    credentials: &Credentials,
    host: &str,
    path: &str,
    expires_secs: u64,
    now: OffsetDateTime,
) -> Result<String, String> {
    let (amz_date, short_date) = format_dates(now)?;
    let scope = format!("{short_date}/{}/{SERVICE}/aws4_request", credentials.region);
    let credential = format!("{}/{scope}", credentials.access_key_id);

    let params = [
        ("X-Amz-Algorithm", ALGORITHM.to_string()),
        ("X-Amz-Credential", credential),
        ("X-Amz-Date", amz_date.clone()),
        ("X-Amz-Expires", expires_secs.to_string()),
        ("X-Amz-SignedHeaders", "host".to_string()),
    ];
    let query = params
        .iter()
        .map(|(name, value)| format!("{name}={}", uri_encode(value, true)))
        .collect::<Vec<_>>()
        .join("&");

    let canonical = format!("GET\n{path}\n{query}\nhost:{host}\n\nhost\n{UNSIGNED_PAYLOAD}");
    let signature = signature(credentials, &short_date, &amz_date, &scope, &canonical)?;
    Ok(format!("{query}&X-Amz-Signature={signature}"))
}

fn signature(
    credentials: &Credentials,
    short_date: &str,
    amz_date: &str,
    scope: &str,
    canonical_request: &str,
) -> Result<String, String> {
    let string_to_sign = format!(
        "{ALGORITHM}\n{amz_date}\n{scope}\n{}",
        hex::encode(Sha256::digest(canonical_request.as_bytes()))
    );

    let secret = format!("AWS4{}", credentials.secret_access_key);
    let date_key = hmac_sha256(secret.as_bytes(), short_date.as_bytes())?;
    let region_key = hmac_sha256(&date_key, credentials.region.as_bytes())?;
    let service_key = hmac_sha256(&region_key, SERVICE.as_bytes())?;
    let signing_key = hmac_sha256(&service_key, b"aws4_request")?;
    Ok(hex::encode(hmac_sha256(&signing_key, string_to_sign.as_bytes())?))
}

type HmacSha256 = Hmac<Sha256>;

fn hmac_sha256(key: &[u8], message: &[u8]) -> Result<[u8; 32], String> {
    let mut mac = <HmacSha256 as KeyInit>::new_from_slice(key).map_err(|err| err.to_string())?;
    mac.update(message);
    Ok(mac.finalize().into_bytes().into())
}

fn object_path(bucket: &str, key: &str) -> String {
    format!("/{}/{}", uri_encode(bucket, true), uri_encode(key, false))
}

/// SigV4 URI encoding: unreserved characters pass through, `/` too unless `encode_slash`.
fn uri_encode(value: &str, encode_slash: bool) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(char::from(byte));
            }
            b'/' if !encode_slash => out.push('/'),
            other => out.push_str(&format!("%{other:02X}")),
        }
    }
    out
}
