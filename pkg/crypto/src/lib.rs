//! Certificate material handling for certsync
//!
//! - [`freshness`]: renewal gate driven by the installed file's age
//! - [`staging`]: transient cert/key pairs owned by one renewal cycle
//! - [`install`]: atomic installation into destination directories
//! - [`inspect`]: PEM parsing, key/cert matching and expiry extraction

use thiserror::Error;

pub mod freshness;
pub mod inspect;
pub mod install;
pub mod staging;

pub use freshness::{needs_renewal, needs_renewal_at};
pub use inspect::{inspect_cert, inspect_pair, CertificateSummary};
pub use install::{
    install, DestinationOutcome, DestinationReport, DestinationRole, InstallDestination,
    InstallError, InstallReport,
};
pub use staging::StagedMaterial;

/// Errors from parsing or matching certificate material
#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("OpenSSL error: {0}")]
    OpenSsl(#[from] openssl::error::ErrorStack),
    #[error("No certificate found in PEM data")]
    NoCertificate,
    #[error("Private key does not match the certificate")]
    KeyMismatch,
    #[error("Certificate time out of range")]
    InvalidTime,
}
