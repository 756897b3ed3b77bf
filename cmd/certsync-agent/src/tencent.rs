//! Tencent Cloud SSL certificate API client
//!
//! Implements [`CertificateAuthorityClient`] on top of `DescribeCertificates`
//! and `DownloadCertificate`, signing every request with TC3-HMAC-SHA256.

use crate::authority::{AuthorityError, CertificateAuthorityClient};
use crate::candidate::{AltNames, CandidateId, CandidateStatus, CertificateCandidate};
use async_trait::async_trait;
use certsync_config::{AuthorityConfig, Credentials};
use chrono::{DateTime, FixedOffset, NaiveDateTime, TimeZone, Utc};
use hmac::{Hmac, Mac};
use reqwest::Url;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use sha2::{Digest, Sha256};
use std::time::Duration;
use tracing::{debug, warn};

const SERVICE: &str = "ssl";
const API_VERSION: &str = "2019-12-05";
const CONTENT_TYPE: &str = "application/json; charset=utf-8";
const PAGE_SIZE: usize = 100;
const MAX_PAGES: usize = 20;
/// Tencent Cloud reports times in Beijing time
const AUTHORITY_UTC_OFFSET_SECS: i32 = 8 * 3600;

/// Tencent Cloud SSL API client
pub struct TencentSslClient {
    http: reqwest::Client,
    endpoint: Url,
    host: String,
    region: Option<String>,
    credentials: Credentials,
}

impl TencentSslClient {
    /// Fails on an endpoint that is not an absolute URL with a host
    pub fn new(credentials: &Credentials, config: &AuthorityConfig) -> Result<Self, AuthorityError> {
        let endpoint = Url::parse(&config.endpoint)
            .map_err(|e| AuthorityError::Response(format!("invalid endpoint {}: {e}", config.endpoint)))?;
        let host = match (endpoint.host_str(), endpoint.port()) {
            (Some(host), Some(port)) => format!("{host}:{port}"),
            (Some(host), None) => host.to_string(),
            (None, _) => {
                return Err(AuthorityError::Response(format!(
                    "endpoint {} has no host",
                    config.endpoint
                )))
            }
        };

        let http = reqwest::Client::builder()
            .timeout(config.timeout())
            .connect_timeout(config.timeout().min(Duration::from_secs(10)))
            .build()?;

        Ok(Self {
            http,
            endpoint,
            host,
            region: config.region.clone(),
            credentials: credentials.clone(),
        })
    }

    async fn call<T: DeserializeOwned>(
        &self,
        action: &str,
        payload: &serde_json::Value,
    ) -> Result<T, AuthorityError> {
        let body = payload.to_string();
        let timestamp = Utc::now().timestamp();
        let authorization = sign(&self.credentials, &self.host, action, &body, timestamp)?;

        let mut request = self
            .http
            .post(self.endpoint.clone())
            .header("Authorization", authorization)
            .header("Content-Type", CONTENT_TYPE)
            .header("X-TC-Action", action)
            .header("X-TC-Timestamp", timestamp.to_string())
            .header("X-TC-Version", API_VERSION)
            .body(body);
        if let Some(region) = &self.region {
            request = request.header("X-TC-Region", region);
        }

        debug!(action = action, "Calling certificate authority");
        let response = request.send().await?;
        let status = response.status();
        let text = response.text().await?;

        let envelope: Envelope = match serde_json::from_str(&text) {
            Ok(envelope) => envelope,
            Err(e) if status.is_success() => {
                return Err(AuthorityError::Response(format!("invalid JSON from {action}: {e}")))
            }
            Err(_) => {
                let snippet: String = text.chars().take(200).collect();
                return Err(AuthorityError::Response(format!("HTTP {status}: {snippet}")));
            }
        };

        if let Some(error) = envelope.response.get("Error") {
            let error: ApiError = serde_json::from_value(error.clone())
                .map_err(|e| AuthorityError::Response(format!("malformed error body: {e}")))?;
            return Err(AuthorityError::Api {
                code: error.code,
                message: error.message,
            });
        }

        serde_json::from_value(envelope.response)
            .map_err(|e| AuthorityError::Response(format!("unexpected {action} payload: {e}")))
    }
}

#[async_trait]
impl CertificateAuthorityClient for TencentSslClient {
    async fn list_certificates(
        &self,
        domain: &str,
    ) -> Result<Vec<CertificateCandidate>, AuthorityError> {
        let mut candidates = Vec::new();
        let mut offset = 0usize;

        for _ in 0..MAX_PAGES {
            let page: DescribeCertificatesResponse = self
                .call(
                    "DescribeCertificates",
                    &json!({ "SearchKey": domain, "Offset": offset, "Limit": PAGE_SIZE }),
                )
                .await?;

            let records = page.certificates.unwrap_or_default();
            let fetched = records.len();
            offset += fetched;
            candidates.extend(records.into_iter().filter_map(CertificateRecord::into_candidate));

            debug!(
                domain = domain,
                fetched = fetched,
                total = ?page.total_count,
                "Fetched certificate page"
            );

            let exhausted = page.total_count.is_some_and(|total| offset >= total);
            if fetched < PAGE_SIZE || exhausted {
                break;
            }
        }

        Ok(candidates)
    }

    async fn download_bundle(&self, id: &CandidateId) -> Result<String, AuthorityError> {
        let response: DownloadCertificateResponse = self
            .call("DownloadCertificate", &json!({ "CertificateId": id.as_str() }))
            .await?;

        match response.content {
            Some(content) if !content.trim().is_empty() => Ok(content),
            _ => Err(AuthorityError::Response(format!(
                "certificate {id} download returned no content"
            ))),
        }
    }
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(rename = "Response")]
    response: serde_json::Value,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ApiError {
    code: String,
    message: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeCertificatesResponse {
    total_count: Option<usize>,
    certificates: Option<Vec<CertificateRecord>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DownloadCertificateResponse {
    content: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CertificateRecord {
    certificate_id: String,
    #[serde(default)]
    domain: Option<String>,
    #[serde(default)]
    subject_alt_name: AltNames,
    #[serde(default)]
    status: Option<i64>,
    #[serde(default)]
    status_name: Option<String>,
    #[serde(default)]
    cert_begin_time: Option<String>,
    #[serde(default)]
    insert_time: Option<String>,
}

impl CertificateRecord {
    fn into_candidate(self) -> Option<CertificateCandidate> {
        let issued_at = self
            .cert_begin_time
            .as_deref()
            .and_then(parse_authority_time)
            .or_else(|| self.insert_time.as_deref().and_then(parse_authority_time));

        let Some(issued_at) = issued_at else {
            warn!(
                certificate_id = %self.certificate_id,
                "Certificate has no usable issue time, ignoring it"
            );
            return None;
        };

        Some(CertificateCandidate {
            id: CandidateId::new(self.certificate_id),
            domain: self.domain.unwrap_or_default(),
            alt_names: self.subject_alt_name,
            status: map_status(self.status, self.status_name.as_deref()),
            issued_at,
        })
    }
}

fn map_status(code: Option<i64>, name: Option<&str>) -> CandidateStatus {
    let name = name.unwrap_or_default();
    if name.contains("吊销") {
        return CandidateStatus::Revoked;
    }
    if code == Some(1) || matches!(name, "已签发" | "证书已颁发") {
        return CandidateStatus::Issued;
    }
    match code {
        Some(0 | 4 | 5) => CandidateStatus::Pending,
        _ => CandidateStatus::Other,
    }
}

fn parse_authority_time(raw: &str) -> Option<DateTime<Utc>> {
    let naive = NaiveDateTime::parse_from_str(raw.trim(), "%Y-%m-%d %H:%M:%S").ok()?;
    let offset = FixedOffset::east_opt(AUTHORITY_UTC_OFFSET_SECS)?;
    offset
        .from_local_datetime(&naive)
        .single()
        .map(|t| t.with_timezone(&Utc))
}

fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<Vec<u8>, AuthorityError> {
    let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(key)
        .map_err(|e| AuthorityError::Response(format!("HMAC key rejected: {e}")))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

/// `Authorization` header value for a TC3-HMAC-SHA256 signed POST to `/`
fn sign(
    credentials: &Credentials,
    host: &str,
    action: &str,
    payload: &str,
    timestamp: i64,
) -> Result<String, AuthorityError> {
    let action = action.to_ascii_lowercase();
    tc3_authorization(
        credentials,
        SERVICE,
        &[
            ("content-type", CONTENT_TYPE),
            ("host", host),
            ("x-tc-action", &action),
        ],
        payload,
        timestamp,
    )
}

/// TC3-HMAC-SHA256 over `headers`, which must be lowercase and sorted by name
fn tc3_authorization(
    credentials: &Credentials,
    service: &str,
    headers: &[(&str, &str)],
    payload: &str,
    timestamp: i64,
) -> Result<String, AuthorityError> {
    let date = DateTime::from_timestamp(timestamp, 0)
        .ok_or_else(|| AuthorityError::Response(format!("invalid timestamp {timestamp}")))?
        .format("%Y-%m-%d")
        .to_string();

    let canonical_headers: String = headers
        .iter()
        .map(|(name, value)| format!("{name}:{value}\n"))
        .collect();
    let signed_headers = headers
        .iter()
        .map(|(name, _)| *name)
        .collect::<Vec<_>>()
        .join(";");
    let canonical_request = format!(
        "POST\n/\n\n{canonical_headers}\n{signed_headers}\n{}",
        sha256_hex(payload.as_bytes())
    );

    let scope = format!("{date}/{service}/tc3_request");
    let string_to_sign = format!(
        "TC3-HMAC-SHA256\n{timestamp}\n{scope}\n{}",
        sha256_hex(canonical_request.as_bytes())
    );

    let secret_date = hmac_sha256(
        format!("TC3{}", credentials.secret_key).as_bytes(),
        date.as_bytes(),
    )?;
    let secret_service = hmac_sha256(&secret_date, service.as_bytes())?;
    let secret_signing = hmac_sha256(&secret_service, b"tc3_request")?;
    let signature = hex::encode(hmac_sha256(&secret_signing, string_to_sign.as_bytes())?);

    Ok(format!(
        "TC3-HMAC-SHA256 Credential={}/{scope}, SignedHeaders={signed_headers}, Signature={signature}",
        credentials.secret_id
    ))
}
