//! Transient certificate material
//!
//! A [`StagedMaterial`] owns the temporary directory its files were unpacked
//! into. Dropping it removes the directory, so every exit path of a renewal
//! cycle cleans up without explicit bookkeeping.

use std::fmt;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Certificate and private key staged for installation
pub struct StagedMaterial {
    workdir: TempDir,
    cert_path: PathBuf,
    key_path: PathBuf,
    cert: Vec<u8>,
    key: Vec<u8>,
}

impl StagedMaterial {
    /// Take ownership of `workdir` and read the classified files from it
    pub fn from_files(
        workdir: TempDir,
        cert_path: PathBuf,
        key_path: PathBuf,
    ) -> std::io::Result<Self> {
        let cert = std::fs::read(&cert_path)?;
        let key = std::fs::read(&key_path)?;
        Ok(Self {
            workdir,
            cert_path,
            key_path,
            cert,
            key,
        })
    }

    /// Stage raw bytes in a fresh temporary directory
    pub fn from_bytes(cert: &[u8], key: &[u8]) -> std::io::Result<Self> {
        let workdir = tempfile::Builder::new().prefix("certsync-").tempdir()?;
        let cert_path = workdir.path().join("certificate.pem");
        let key_path = workdir.path().join("private.key");
        std::fs::write(&cert_path, cert)?;
        std::fs::write(&key_path, key)?;
        Self::from_files(workdir, cert_path, key_path)
    }

    /// PEM certificate chain
    pub fn cert(&self) -> &[u8] {
        &self.cert
    }

    /// PEM private key
    pub fn key(&self) -> &[u8] {
        &self.key
    }

    /// Where the certificate was found in the bundle
    pub fn cert_path(&self) -> &Path {
        &self.cert_path
    }

    /// Where the key was found in the bundle
    pub fn key_path(&self) -> &Path {
        &self.key_path
    }

    /// Temporary directory removed on drop
    pub fn workdir(&self) -> &Path {
        self.workdir.path()
    }
}

impl fmt::Debug for StagedMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StagedMaterial")
            .field("workdir", &self.workdir.path())
            .field("cert_path", &self.cert_path)
            .field("key_path", &self.key_path)
            .field("cert_len", &self.cert.len())
            .field("key_len", &self.key.len())
            .finish()
    }
}
