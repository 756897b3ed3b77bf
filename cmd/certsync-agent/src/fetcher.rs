//! Download and unpack the selected certificate
//!
//! The authority hands out a base64-encoded zip archive. It is unpacked into a
//! fresh temporary directory that the resulting [`StagedMaterial`] owns.

use crate::authority::{with_timeout, AuthorityError, CertificateAuthorityClient};
use crate::candidate::CandidateId;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use certsync_crypto::{inspect_pair, CryptoError, StagedMaterial};
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Why a bundle could not be turned into staged material
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("Authority error: {0}")]
    Authority(#[from] AuthorityError),
    #[error("Malformed certificate bundle: {0}")]
    BundleFormat(String),
    #[error("Bundle has no {0}")]
    MissingArtifact(Artifact),
    #[error("Unusable certificate material: {0}")]
    InvalidMaterial(#[from] CryptoError),
}

/// Bundle member the fetcher needs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Artifact {
    Certificate,
    PrivateKey,
}

impl std::fmt::Display for Artifact {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Artifact::Certificate => write!(f, "certificate"),
            Artifact::PrivateKey => write!(f, "private key"),
        }
    }
}

/// Downloads a candidate and stages its certificate and key
pub struct CertificateFetcher {
    client: Arc<dyn CertificateAuthorityClient>,
    domain: String,
    timeout: Duration,
}

impl CertificateFetcher {
    pub fn new(
        client: Arc<dyn CertificateAuthorityClient>,
        domain: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            client,
            domain: domain.into(),
            timeout,
        }
    }

    /// Download, unpack and verify one candidate
    pub async fn fetch(&self, id: &CandidateId) -> Result<StagedMaterial, FetchError> {
        info!(certificate_id = %id, "Downloading certificate bundle");
        let encoded = with_timeout(self.timeout, self.client.download_bundle(id)).await?;

        let archive = STANDARD
            .decode(encoded.trim())
            .map_err(|e| FetchError::BundleFormat(format!("base64: {e}")))?;

        let workdir = tempfile::Builder::new()
            .prefix("certsync-")
            .tempdir()
            .map_err(|e| FetchError::BundleFormat(format!("staging directory: {e}")))?;

        unpack(&archive, workdir.path())?;
        let (cert_path, key_path) = classify(workdir.path(), &self.domain)?;
        debug!(
            cert = %cert_path.display(),
            key = %key_path.display(),
            "Classified bundle contents"
        );

        let material = StagedMaterial::from_files(workdir, cert_path, key_path)
            .map_err(|e| FetchError::BundleFormat(format!("reading staged files: {e}")))?;

        let summary = inspect_pair(material.cert(), material.key())?;
        if !summary.covers(&self.domain) {
            warn!(
                domain = %self.domain,
                subject = ?summary.subject_cn,
                dns_names = ?summary.dns_names,
                "Fetched certificate does not cover the managed domain"
            );
        }
        info!(
            certificate_id = %id,
            not_after = %summary.not_after,
            chain_len = summary.chain_len,
            "Certificate bundle staged"
        );

        Ok(material)
    }
}

fn unpack(archive: &[u8], dir: &Path) -> Result<(), FetchError> {
    let mut zip = zip::ZipArchive::new(Cursor::new(archive))
        .map_err(|e| FetchError::BundleFormat(format!("zip: {e}")))?;
    zip.extract(dir)
        .map_err(|e| FetchError::BundleFormat(format!("unpacking: {e}")))
}

#[derive(Debug, PartialEq, Eq)]
enum Kind {
    Key,
    Cert { preferred: bool },
    Ignored,
}

/// Classify one bundle entry
///
/// `.key` files are keys and `.crt`/`.cer` files are certificates. A `.pem`
/// is a key only when its name mentions "key" outside the domain itself, so
/// `monkey.com_bundle.pem` stays a certificate.
fn kind_of(name: &str, domain: &str) -> Kind {
    let lower = name.to_ascii_lowercase();
    let path = Path::new(&lower);
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or_default();
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or_default();
    let preferred = stem.contains("bundle") || stem.contains("fullchain");

    match ext {
        "key" => Kind::Key,
        "crt" | "cer" => Kind::Cert { preferred },
        "pem" if without_domain(stem, domain).contains("key") => Kind::Key,
        "pem" => Kind::Cert { preferred },
        _ => Kind::Ignored,
    }
}

/// `stem` with every spelling of the domain removed
fn without_domain(stem: &str, domain: &str) -> String {
    let domain = domain.trim().trim_end_matches('.').to_ascii_lowercase();
    if domain.is_empty() {
        return stem.to_string();
    }
    // wildcard bundles are named after `_.example.com`
    let underscored = domain.replace('*', "_");
    stem.replace(&domain, "").replace(&underscored, "")
}

/// Pick the certificate and key among the top-level files of `dir`
fn classify(dir: &Path, domain: &str) -> Result<(PathBuf, PathBuf), FetchError> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .map_err(|e| FetchError::BundleFormat(format!("listing bundle: {e}")))?
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_ok_and(|t| t.is_file()))
        .filter_map(|entry| entry.file_name().into_string().ok())
        .collect();
    names.sort();

    let mut key = None;
    let mut cert = None;
    let mut preferred_cert = None;

    for name in &names {
        match kind_of(name, domain) {
            Kind::Key => {
                key.get_or_insert(name);
            }
            Kind::Cert { preferred: true } => {
                preferred_cert.get_or_insert(name);
            }
            Kind::Cert { preferred: false } => {
                cert.get_or_insert(name);
            }
            Kind::Ignored => debug!(file = %name, "Ignoring bundle entry"),
        }
    }

    let cert = preferred_cert
        .or(cert)
        .ok_or(FetchError::MissingArtifact(Artifact::Certificate))?;
    let key = key.ok_or(FetchError::MissingArtifact(Artifact::PrivateKey))?;
    Ok((dir.join(cert), dir.join(key)))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::io::Write;
    use std::sync::Mutex;

    pub(crate) fn self_signed(names: &[&str]) -> (String, String) {
        let names: Vec<String> = names.iter().map(|n| n.to_string()).collect();
        let cert = rcgen::generate_simple_self_signed(names).unwrap();
        (cert.serialize_pem().unwrap(), cert.serialize_private_key_pem())
    }

    pub(crate) fn bundle(entries: &[(&str, &str)]) -> String {
        let mut buf = Cursor::new(Vec::new());
        {
            let mut writer = zip::ZipWriter::new(&mut buf);
            let options = zip::write::FileOptions::default()
                .compression_method(zip::CompressionMethod::Stored);
            for (name, content) in entries {
                if name.ends_with('/') {
                    writer.add_directory(*name, options).unwrap();
                } else {
                    writer.start_file(*name, options).unwrap();
                    writer.write_all(content.as_bytes()).unwrap();
                }
            }
            writer.finish().unwrap();
        }
        STANDARD.encode(buf.into_inner())
    }

    /// Authority serving canned candidates and one bundle
    pub(crate) struct FakeAuthority {
        pub candidates: Vec<crate::candidate::CertificateCandidate>,
        pub bundle: Result<String, String>,
        pub downloads: Mutex<Vec<CandidateId>>,
        pub delay: Duration,
    }

    impl FakeAuthority {
        pub(crate) fn serving(bundle: String) -> Self {
            Self {
                candidates: Vec::new(),
                bundle: Ok(bundle),
                downloads: Mutex::new(Vec::new()),
                delay: Duration::ZERO,
            }
        }
    }

    #[async_trait]
    impl CertificateAuthorityClient for FakeAuthority {
        async fn list_certificates(
            &self,
            _domain: &str,
        ) -> Result<Vec<crate::candidate::CertificateCandidate>, AuthorityError> {
            Ok(self.candidates.clone())
        }

        async fn download_bundle(&self, id: &CandidateId) -> Result<String, AuthorityError> {
            self.downloads.lock().unwrap().push(id.clone());
            tokio::time::sleep(self.delay).await;
            self.bundle.clone().map_err(AuthorityError::Response)
        }
    }

    fn fetcher(authority: FakeAuthority) -> CertificateFetcher {
        CertificateFetcher::new(Arc::new(authority), "x.com", Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_fetch_typical_bundle() {
        let (cert, key) = self_signed(&["x.com"]);
        let encoded = bundle(&[
            ("Nginx/", ""),
            ("Nginx/1_x.com_bundle.crt", "ignored"),
            ("x.com.csr", "csr"),
            ("x.com.key", &key),
            ("x.com.pem", &cert),
            ("x.com_bundle.crt", &cert),
        ]);

        let material = fetcher(FakeAuthority::serving(encoded))
            .fetch(&CandidateId::new("1"))
            .await
            .unwrap();

        assert_eq!(material.cert(), cert.as_bytes());
        assert_eq!(material.key(), key.as_bytes());
        assert!(material.cert_path().ends_with("x.com_bundle.crt"));
        assert!(material.key_path().ends_with("x.com.key"));

        let workdir = material.workdir().to_path_buf();
        assert!(workdir.exists());
        drop(material);
        assert!(!workdir.exists());
    }

    #[tokio::test]
    async fn test_missing_key() {
        let (cert, _) = self_signed(&["x.com"]);
        let encoded = bundle(&[("x.com_bundle.crt", &cert), ("x.com.csr", "csr")]);

        let result = fetcher(FakeAuthority::serving(encoded))
            .fetch(&CandidateId::new("1"))
            .await;
        assert!(matches!(
            result,
            Err(FetchError::MissingArtifact(Artifact::PrivateKey))
        ));
    }

    #[tokio::test]
    async fn test_missing_certificate() {
        let (_, key) = self_signed(&["x.com"]);
        let encoded = bundle(&[("private.key", &key)]);

        let result = fetcher(FakeAuthority::serving(encoded))
            .fetch(&CandidateId::new("1"))
            .await;
        assert!(matches!(
            result,
            Err(FetchError::MissingArtifact(Artifact::Certificate))
        ));
    }

    #[tokio::test]
    async fn test_garbage_bundle() {
        let not_base64 = fetcher(FakeAuthority::serving("%%%".to_string()))
            .fetch(&CandidateId::new("1"))
            .await;
        assert!(matches!(not_base64, Err(FetchError::BundleFormat(_))));

        let not_zip = fetcher(FakeAuthority::serving(STANDARD.encode(b"plain text")))
            .fetch(&CandidateId::new("1"))
            .await;
        assert!(matches!(not_zip, Err(FetchError::BundleFormat(_))));
    }

    #[tokio::test]
    async fn test_mismatched_pair_is_invalid() {
        let (cert, _) = self_signed(&["x.com"]);
        let (_, other_key) = self_signed(&["x.com"]);
        let encoded = bundle(&[("x.com_bundle.crt", &cert), ("x.com.key", &other_key)]);

        let result = fetcher(FakeAuthority::serving(encoded))
            .fetch(&CandidateId::new("1"))
            .await;
        assert!(matches!(
            result,
            Err(FetchError::InvalidMaterial(CryptoError::KeyMismatch))
        ));
    }

    #[tokio::test]
    async fn test_download_timeout() {
        let mut authority = FakeAuthority::serving(String::new());
        authority.delay = Duration::from_secs(5);
        let fetcher =
            CertificateFetcher::new(Arc::new(authority), "x.com", Duration::from_millis(20));

        let result = fetcher.fetch(&CandidateId::new("1")).await;
        assert!(matches!(
            result,
            Err(FetchError::Authority(AuthorityError::Timeout(_)))
        ));
    }

    #[tokio::test]
    async fn test_domain_containing_key() {
        let (cert, key) = self_signed(&["monkey.com"]);
        let encoded = bundle(&[
            ("monkey.com.csr", "csr"),
            ("monkey.com.key", &key),
            ("monkey.com_bundle.crt", &cert),
            ("monkey.com_bundle.pem", &cert),
        ]);
        let fetcher = CertificateFetcher::new(
            Arc::new(FakeAuthority::serving(encoded)),
            "monkey.com",
            Duration::from_secs(5),
        );

        let material = fetcher.fetch(&CandidateId::new("1")).await.unwrap();
        assert!(material.cert_path().ends_with("monkey.com_bundle.crt"));
        assert!(material.key_path().ends_with("monkey.com.key"));
        assert_eq!(material.cert(), cert.as_bytes());
    }

    #[test]
    fn test_kind_of() {
        assert_eq!(kind_of("x.com.key", "x.com"), Kind::Key);
        assert_eq!(kind_of("privkey.pem", "x.com"), Kind::Key);
        assert_eq!(kind_of("FULLCHAIN.PEM", "x.com"), Kind::Cert { preferred: true });
        assert_eq!(kind_of("x.com.cer", "x.com"), Kind::Cert { preferred: false });
        assert_eq!(kind_of("x.com.csr", "x.com"), Kind::Ignored);
        assert_eq!(kind_of("key.txt", "x.com"), Kind::Ignored);
        assert_eq!(kind_of("README", "x.com"), Kind::Ignored);
    }

    #[test]
    fn test_kind_of_ignores_key_inside_domain() {
        let domain = "keycdn.net";
        assert_eq!(kind_of("keycdn.net_bundle.crt", domain), Kind::Cert { preferred: true });
        assert_eq!(kind_of("keycdn.net_bundle.pem", domain), Kind::Cert { preferred: true });
        assert_eq!(kind_of("keycdn.net.pem", domain), Kind::Cert { preferred: false });
        assert_eq!(kind_of("keycdn.net.key", domain), Kind::Key);
        assert_eq!(kind_of("keycdn.net_privkey.pem", domain), Kind::Key);

        let wildcard = "*.turkey.example";
        assert_eq!(
            kind_of("_.turkey.example_bundle.pem", wildcard),
            Kind::Cert { preferred: true }
        );
        assert_eq!(kind_of("_.turkey.example.key", wildcard), Kind::Key);
    }
}
