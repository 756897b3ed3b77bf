//! Certificate authority capability
//!
//! The pipeline only needs two things from the authority: the certificates it
//! knows for a domain, and the encoded bundle of one of them.

use crate::candidate::{CandidateId, CertificateCandidate};
use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

/// Failures talking to the certificate authority
#[derive(Error, Debug)]
pub enum AuthorityError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Authority returned {code}: {message}")]
    Api { code: String, message: String },
    #[error("Unexpected authority response: {0}")]
    Response(String),
    #[error("Authority call timed out after {0:?}")]
    Timeout(Duration),
}

/// Read access to the certificate authority
#[async_trait]
pub trait CertificateAuthorityClient: Send + Sync {
    /// Every certificate the authority lists for `domain`
    async fn list_certificates(
        &self,
        domain: &str,
    ) -> Result<Vec<CertificateCandidate>, AuthorityError>;

    /// Base64-encoded archive holding the certificate and its private key
    async fn download_bundle(&self, id: &CandidateId) -> Result<String, AuthorityError>;
}

/// Bound an authority call regardless of the client's own timeouts
pub async fn with_timeout<T, F>(limit: Duration, call: F) -> Result<T, AuthorityError>
where
    F: Future<Output = Result<T, AuthorityError>>,
{
    tokio::time::timeout(limit, call)
        .await
        .map_err(|_| AuthorityError::Timeout(limit))?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_with_timeout_elapses() {
        let result: Result<(), _> = with_timeout(Duration::from_millis(20), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        assert!(matches!(result, Err(AuthorityError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_with_timeout_passes_result_through() {
        let result = with_timeout(Duration::from_secs(1), async {
            Err::<(), _>(AuthorityError::Response("boom".to_string()))
        })
        .await;
        assert!(matches!(result, Err(AuthorityError::Response(m)) if m == "boom"));
    }
}
