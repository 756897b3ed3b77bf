//! Certificate inspection
//!
//! Used to refuse staged material whose key does not belong to its
//! certificate, and to log what was installed.

use crate::CryptoError;
use chrono::{DateTime, Utc};
use openssl::asn1::{Asn1Time, Asn1TimeRef};
use openssl::nid::Nid;
use openssl::pkey::PKey;
use openssl::x509::X509;
use serde::Serialize;

/// What the leaf certificate of a chain says about itself
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CertificateSummary {
    /// Subject common name, when present
    pub subject_cn: Option<String>,
    /// DNS entries of the subject alternative name extension
    pub dns_names: Vec<String>,
    /// End of the validity period
    pub not_after: DateTime<Utc>,
    /// Number of certificates in the PEM bundle, leaf included
    pub chain_len: usize,
}

impl CertificateSummary {
    /// Whether the leaf covers `domain`, either exactly or via a `*.` wildcard
    pub fn covers(&self, domain: &str) -> bool {
        let domain = domain.trim().to_ascii_lowercase();
        self.dns_names
            .iter()
            .chain(self.subject_cn.iter())
            .any(|name| name_matches(&name.to_ascii_lowercase(), &domain))
    }

    /// Whole days until `not_after`, negative once expired
    pub fn days_remaining(&self, now: DateTime<Utc>) -> i64 {
        (self.not_after - now).num_days()
    }
}

fn name_matches(pattern: &str, domain: &str) -> bool {
    if pattern == domain {
        return true;
    }
    match pattern.strip_prefix("*.") {
        Some(suffix) => domain
            .split_once('.')
            .is_some_and(|(label, rest)| !label.is_empty() && rest == suffix),
        None => false,
    }
}

/// Summarise a certificate chain
pub fn inspect_cert(cert_pem: &[u8]) -> Result<CertificateSummary, CryptoError> {
    let chain = X509::stack_from_pem(cert_pem)?;
    summarize(&chain)
}

/// Summarise a chain and check that `key_pem` is the leaf's private key
pub fn inspect_pair(cert_pem: &[u8], key_pem: &[u8]) -> Result<CertificateSummary, CryptoError> {
    let chain = X509::stack_from_pem(cert_pem)?;
    let summary = summarize(&chain)?;

    let key = PKey::private_key_from_pem(key_pem)?;
    let leaf_key = chain[0].public_key()?;
    if !leaf_key.public_eq(&*key) {
        return Err(CryptoError::KeyMismatch);
    }

    Ok(summary)
}

fn summarize(chain: &[X509]) -> Result<CertificateSummary, CryptoError> {
    let leaf = chain.first().ok_or(CryptoError::NoCertificate)?;

    let subject_cn = leaf
        .subject_name()
        .entries_by_nid(Nid::COMMONNAME)
        .next()
        .and_then(|entry| entry.data().as_utf8().ok())
        .map(|cn| cn.to_string());

    let dns_names = leaf
        .subject_alt_names()
        .map(|names| {
            names
                .iter()
                .filter_map(|name| name.dnsname().map(str::to_string))
                .collect()
        })
        .unwrap_or_default();

    Ok(CertificateSummary {
        subject_cn,
        dns_names,
        not_after: asn1_to_utc(leaf.not_after())?,
        chain_len: chain.len(),
    })
}

fn asn1_to_utc(time: &Asn1TimeRef) -> Result<DateTime<Utc>, CryptoError> {
    let epoch = Asn1Time::from_unix(0)?;
    let diff = epoch.diff(time)?;
    let seconds = i64::from(diff.days) * 86400 + i64::from(diff.secs);
    DateTime::from_timestamp(seconds, 0).ok_or(CryptoError::InvalidTime)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::self_signed;

    #[test]
    fn test_inspect_matching_pair() {
        let (cert, key) = self_signed(&["example.com", "www.example.com"]);
        let summary = inspect_pair(cert.as_bytes(), key.as_bytes()).unwrap();

        assert_eq!(summary.chain_len, 1);
        assert_eq!(summary.dns_names, vec!["example.com", "www.example.com"]);
        assert!(summary.covers("example.com"));
        assert!(summary.covers("WWW.example.com"));
        assert!(!summary.covers("other.com"));
        assert!(summary.days_remaining(Utc::now()) > 365);
    }

    #[test]
    fn test_key_mismatch_is_rejected() {
        let (cert, _) = self_signed(&["example.com"]);
        let (_, other_key) = self_signed(&["example.com"]);
        let result = inspect_pair(cert.as_bytes(), other_key.as_bytes());
        assert!(matches!(result, Err(CryptoError::KeyMismatch)));
    }

    #[test]
    fn test_garbage_is_rejected() {
        let (_, key) = self_signed(&["example.com"]);
        assert!(inspect_pair(b"not a certificate", key.as_bytes()).is_err());
        assert!(inspect_cert(b"").is_err());
    }

    #[test]
    fn test_chain_length_counts_bundle() {
        let (leaf, key) = self_signed(&["example.com"]);
        let (intermediate, _) = self_signed(&["ca.example.com"]);
        let bundle = format!("{leaf}{intermediate}");
        let summary = inspect_pair(bundle.as_bytes(), key.as_bytes()).unwrap();
        assert_eq!(summary.chain_len, 2);
    }

    #[test]
    fn test_wildcard_matching() {
        assert!(name_matches("*.example.com", "api.example.com"));
        assert!(!name_matches("*.example.com", "example.com"));
        assert!(!name_matches("*.example.com", "a.b.example.com"));
        assert!(name_matches("example.com", "example.com"));
    }
}
