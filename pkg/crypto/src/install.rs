//! Atomic installation of certificate/key pairs
//!
//! Each destination is handled independently: both files are written to
//! temporary siblings in the destination directory, given their final modes,
//! flushed, and only then renamed over the live names. A reader of the live
//! files sees either the previous pair or the new one, never a partial write.

use crate::staging::StagedMaterial;
use serde::Serialize;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Whether a destination is the one the TLS terminator reads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DestinationRole {
    /// Created when absent; its failure fails the cycle
    Primary,
    /// Skipped when absent; its failure is only logged
    Mirror,
}

impl std::fmt::Display for DestinationRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DestinationRole::Primary => write!(f, "primary"),
            DestinationRole::Mirror => write!(f, "mirror"),
        }
    }
}

/// A directory receiving the certificate pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstallDestination {
    /// Whether a failure here fails the cycle
    pub role: DestinationRole,
    /// Target directory
    pub dir: PathBuf,
    /// Certificate filename inside `dir`
    pub cert_file: String,
    /// Private key filename inside `dir`
    pub key_file: String,
    /// Permission bits applied to the certificate
    pub cert_mode: u32,
    /// Permission bits applied to the private key
    pub key_mode: u32,
}

impl InstallDestination {
    /// Destination that is created when missing
    pub fn primary(
        dir: impl Into<PathBuf>,
        cert_file: impl Into<String>,
        key_file: impl Into<String>,
    ) -> Self {
        Self::new(DestinationRole::Primary, dir, cert_file, key_file)
    }

    /// Destination that is skipped when its directory is absent
    pub fn mirror(
        dir: impl Into<PathBuf>,
        cert_file: impl Into<String>,
        key_file: impl Into<String>,
    ) -> Self {
        Self::new(DestinationRole::Mirror, dir, cert_file, key_file)
    }

    fn new(
        role: DestinationRole,
        dir: impl Into<PathBuf>,
        cert_file: impl Into<String>,
        key_file: impl Into<String>,
    ) -> Self {
        Self {
            role,
            dir: dir.into(),
            cert_file: cert_file.into(),
            key_file: key_file.into(),
            cert_mode: 0o644,
            key_mode: 0o600,
        }
    }

    /// Override the default 644/600 modes
    #[must_use]
    pub fn with_modes(mut self, cert_mode: u32, key_mode: u32) -> Self {
        self.cert_mode = cert_mode;
        self.key_mode = key_mode;
        self
    }

    /// Final certificate path
    pub fn cert_path(&self) -> PathBuf {
        self.dir.join(&self.cert_file)
    }

    /// Final private key path
    pub fn key_path(&self) -> PathBuf {
        self.dir.join(&self.key_file)
    }
}

/// Why a destination could not be installed
#[derive(Error, Debug)]
pub enum InstallError {
    #[error("Failed to create directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Failed to stage {file}: {source}")]
    Write {
        file: String,
        #[source]
        source: io::Error,
    },
    #[error("Failed to set mode {mode:o} on {file}: {source}")]
    Permissions {
        file: String,
        mode: u32,
        #[source]
        source: io::Error,
    },
    #[error("Failed to back up current {file}: {source}")]
    Backup {
        file: String,
        #[source]
        source: io::Error,
    },
    #[error("Failed to move {file} into place: {source}")]
    Rename {
        file: String,
        #[source]
        source: io::Error,
    },
}

/// Result for one destination
#[derive(Debug)]
pub enum DestinationOutcome {
    Installed,
    Skipped { reason: String },
    Failed(InstallError),
}

impl DestinationOutcome {
    /// Short name used in logs
    pub fn label(&self) -> &'static str {
        match self {
            DestinationOutcome::Installed => "installed",
            DestinationOutcome::Skipped { .. } => "skipped",
            DestinationOutcome::Failed(_) => "failed",
        }
    }
}

/// One destination and what happened to it
#[derive(Debug)]
pub struct DestinationReport {
    /// Destination role
    pub role: DestinationRole,
    /// Destination directory
    pub dir: PathBuf,
    /// What happened
    pub outcome: DestinationOutcome,
}

/// Per-destination results of one install
#[derive(Debug, Default)]
pub struct InstallReport {
    /// In the order the destinations were given
    pub destinations: Vec<DestinationReport>,
}

impl InstallReport {
    /// True when a primary destination exists and every primary was installed
    pub fn primary_succeeded(&self) -> bool {
        let mut primaries = self
            .destinations
            .iter()
            .filter(|d| d.role == DestinationRole::Primary)
            .peekable();
        primaries.peek().is_some()
            && primaries.all(|d| matches!(d.outcome, DestinationOutcome::Installed))
    }

    /// First failure on a primary destination
    pub fn primary_error(&self) -> Option<&InstallError> {
        self.destinations
            .iter()
            .filter(|d| d.role == DestinationRole::Primary)
            .find_map(|d| match &d.outcome {
                DestinationOutcome::Failed(e) => Some(e),
                _ => None,
            })
    }

    /// Destinations that failed, primary or mirror
    pub fn failures(&self) -> impl Iterator<Item = &DestinationReport> {
        self.destinations
            .iter()
            .filter(|d| matches!(d.outcome, DestinationOutcome::Failed(_)))
    }
}

/// Install `material` into every destination
///
/// Never returns early: a failing mirror does not prevent the primary from
/// being attempted, and vice versa.
pub fn install(material: &StagedMaterial, destinations: &[InstallDestination]) -> InstallReport {
    let mut report = InstallReport::default();

    for dest in destinations {
        let outcome = match install_one(material, dest) {
            Ok(outcome) => outcome,
            Err(e) => DestinationOutcome::Failed(e),
        };

        match (&outcome, dest.role) {
            (DestinationOutcome::Installed, _) => info!(
                role = %dest.role,
                dir = %dest.dir.display(),
                cert = %dest.cert_file,
                key = %dest.key_file,
                "Certificate pair installed"
            ),
            (DestinationOutcome::Skipped { reason }, _) => info!(
                role = %dest.role,
                dir = %dest.dir.display(),
                reason = %reason,
                "Destination skipped"
            ),
            (DestinationOutcome::Failed(e), DestinationRole::Primary) => error!(
                role = %dest.role,
                dir = %dest.dir.display(),
                error = %e,
                "Install to primary destination failed"
            ),
            (DestinationOutcome::Failed(e), DestinationRole::Mirror) => warn!(
                role = %dest.role,
                dir = %dest.dir.display(),
                error = %e,
                "Install to mirror destination failed"
            ),
        }

        report.destinations.push(DestinationReport {
            role: dest.role,
            dir: dest.dir.clone(),
            outcome,
        });
    }

    report
}

fn install_one(
    material: &StagedMaterial,
    dest: &InstallDestination,
) -> Result<DestinationOutcome, InstallError> {
    if !dest.dir.is_dir() {
        match dest.role {
            DestinationRole::Mirror => {
                return Ok(DestinationOutcome::Skipped {
                    reason: "directory does not exist".to_string(),
                })
            }
            DestinationRole::Primary => {
                fs::create_dir_all(&dest.dir).map_err(|source| InstallError::CreateDir {
                    path: dest.dir.clone(),
                    source,
                })?;
            }
        }
    }

    // Temporaries are removed on drop until persisted
    let cert_tmp = stage_file(&dest.dir, &dest.cert_file, material.cert(), dest.cert_mode)?;
    let key_tmp = stage_file(&dest.dir, &dest.key_file, material.key(), dest.key_mode)?;

    let cert_path = dest.cert_path();
    let key_path = dest.key_path();
    let key_backup = backup_existing(&dest.dir, &dest.key_file, &key_path, dest.key_mode)?;

    // Key first: the certificate's mtime is the freshness marker, so it must
    // only move once the whole pair is in place.
    key_tmp
        .persist(&key_path)
        .map_err(|e| InstallError::Rename {
            file: dest.key_file.clone(),
            source: e.error,
        })?;

    if let Err(e) = cert_tmp.persist(&cert_path) {
        restore_key(key_backup, &key_path);
        return Err(InstallError::Rename {
            file: dest.cert_file.clone(),
            source: e.error,
        });
    }

    sync_dir(&dest.dir);
    Ok(DestinationOutcome::Installed)
}

fn stage_file(
    dir: &Path,
    name: &str,
    contents: &[u8],
    mode: u32,
) -> Result<NamedTempFile, InstallError> {
    let write_err = |source| InstallError::Write {
        file: name.to_string(),
        source,
    };

    let mut tmp = tempfile::Builder::new()
        .prefix(&format!(".{name}."))
        .suffix(".tmp")
        .tempfile_in(dir)
        .map_err(write_err)?;
    tmp.write_all(contents).map_err(write_err)?;
    tmp.as_file().sync_all().map_err(write_err)?;

    set_mode(tmp.path(), mode).map_err(|source| InstallError::Permissions {
        file: name.to_string(),
        mode,
        source,
    })?;

    debug!(file = name, tmp = %tmp.path().display(), "Staged temporary file");
    Ok(tmp)
}

/// Copy the live file aside so a half-finished swap can be undone
fn backup_existing(
    dir: &Path,
    name: &str,
    live: &Path,
    mode: u32,
) -> Result<Option<NamedTempFile>, InstallError> {
    match fs::read(live) {
        Ok(contents) => stage_file(dir, name, &contents, mode).map(Some),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(source) => Err(InstallError::Backup {
            file: name.to_string(),
            source,
        }),
    }
}

fn restore_key(backup: Option<NamedTempFile>, key_path: &Path) {
    let result = match backup {
        Some(backup) => backup.persist(key_path).map(|_| ()).map_err(|e| e.error),
        // There was no key before this install
        None => fs::remove_file(key_path),
    };
    match result {
        Ok(()) => warn!(key = %key_path.display(), "Certificate swap failed, previous key restored"),
        Err(e) => error!(
            key = %key_path.display(),
            error = %e,
            "Certificate swap failed and previous key could not be restored"
        ),
    }
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> io::Result<()> {
    Ok(())
}

#[cfg(unix)]
fn sync_dir(dir: &Path) {
    if let Err(e) = File::open(dir).and_then(|d| d.sync_all()) {
        debug!(dir = %dir.display(), error = %e, "Directory fsync failed");
    }
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn entries(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        names.sort();
        names
    }

    #[cfg(unix)]
    fn mode_of(path: &Path) -> u32 {
        use std::os::unix::fs::PermissionsExt;
        fs::metadata(path).unwrap().permissions().mode() & 0o777
    }

    #[test]
    fn test_install_creates_missing_primary_dir() {
        let root = TempDir::new().unwrap();
        let dir = root.path().join("certs");
        let staged = StagedMaterial::from_bytes(b"CERT-C", b"KEY-K").unwrap();
        let dest = InstallDestination::primary(&dir, "fullchain.pem", "privkey.pem");

        let report = install(&staged, &[dest.clone()]);

        assert!(report.primary_succeeded());
        assert_eq!(fs::read(dest.cert_path()).unwrap(), b"CERT-C");
        assert_eq!(fs::read(dest.key_path()).unwrap(), b"KEY-K");
        assert_eq!(entries(&dir), vec!["fullchain.pem", "privkey.pem"]);

        #[cfg(unix)]
        {
            assert_eq!(mode_of(&dest.cert_path()), 0o644);
            assert_eq!(mode_of(&dest.key_path()), 0o600);
        }
    }

    #[test]
    fn test_install_replaces_existing_pair() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("fullchain.pem"), b"old-cert").unwrap();
        fs::write(dir.path().join("privkey.pem"), b"old-key").unwrap();

        let staged = StagedMaterial::from_bytes(b"new-cert", b"new-key").unwrap();
        let dest = InstallDestination::primary(dir.path(), "fullchain.pem", "privkey.pem")
            .with_modes(0o640, 0o600);
        let report = install(&staged, &[dest.clone()]);

        assert!(report.primary_succeeded());
        assert_eq!(fs::read(dest.cert_path()).unwrap(), b"new-cert");
        assert_eq!(fs::read(dest.key_path()).unwrap(), b"new-key");
        // no temporaries or backups left behind
        assert_eq!(entries(dir.path()), vec!["fullchain.pem", "privkey.pem"]);
        #[cfg(unix)]
        assert_eq!(mode_of(&dest.cert_path()), 0o640);
    }

    #[test]
    fn test_absent_mirror_is_skipped() {
        let root = TempDir::new().unwrap();
        let staged = StagedMaterial::from_bytes(b"c", b"k").unwrap();
        let primary = InstallDestination::primary(root.path().join("p"), "fullchain.pem", "privkey.pem");
        let mirror = InstallDestination::mirror(
            root.path().join("host-ssl"),
            "x.com_bundle.crt",
            "x.com.key",
        );

        let report = install(&staged, &[primary, mirror]);

        assert!(report.primary_succeeded());
        assert!(matches!(
            report.destinations[1].outcome,
            DestinationOutcome::Skipped { .. }
        ));
        assert!(!root.path().join("host-ssl").exists());
    }

    #[test]
    fn test_mirror_failure_does_not_affect_primary() {
        let root = TempDir::new().unwrap();
        let primary_dir = root.path().join("p");
        let mirror_dir = root.path().join("m");
        fs::create_dir_all(&mirror_dir).unwrap();
        fs::write(mirror_dir.join("x.com_bundle.crt"), b"old-mirror-cert").unwrap();
        // A non-empty directory where the key should go makes the rename fail
        fs::create_dir_all(mirror_dir.join("x.com.key")).unwrap();
        fs::write(mirror_dir.join("x.com.key").join("keep"), b"x").unwrap();

        let staged = StagedMaterial::from_bytes(b"new-cert", b"new-key").unwrap();
        let primary = InstallDestination::primary(&primary_dir, "fullchain.pem", "privkey.pem");
        let mirror = InstallDestination::mirror(&mirror_dir, "x.com_bundle.crt", "x.com.key");

        let report = install(&staged, &[mirror, primary.clone()]);

        assert!(report.primary_succeeded());
        assert_eq!(report.failures().count(), 1);
        assert_eq!(report.failures().next().unwrap().role, DestinationRole::Mirror);
        assert_eq!(fs::read(primary.cert_path()).unwrap(), b"new-cert");
        assert_eq!(fs::read(primary.key_path()).unwrap(), b"new-key");
        // mirror left as it was, temporaries removed
        assert_eq!(
            fs::read(mirror_dir.join("x.com_bundle.crt")).unwrap(),
            b"old-mirror-cert"
        );
        assert_eq!(entries(&mirror_dir), vec!["x.com.key", "x.com_bundle.crt"]);
    }

    #[test]
    fn test_failed_cert_swap_restores_previous_key() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("privkey.pem"), b"old-key").unwrap();
        fs::create_dir_all(dir.path().join("fullchain.pem").join("blocker")).unwrap();

        let staged = StagedMaterial::from_bytes(b"new-cert", b"new-key").unwrap();
        let dest = InstallDestination::primary(dir.path(), "fullchain.pem", "privkey.pem");
        let report = install(&staged, &[dest.clone()]);

        assert!(!report.primary_succeeded());
        assert!(matches!(
            report.primary_error(),
            Some(InstallError::Rename { file, .. }) if file == "fullchain.pem"
        ));
        assert_eq!(fs::read(dest.key_path()).unwrap(), b"old-key");
        assert_eq!(entries(dir.path()), vec!["fullchain.pem", "privkey.pem"]);
    }

    #[test]
    fn test_no_primary_is_not_success() {
        let report = InstallReport::default();
        assert!(!report.primary_succeeded());
        assert!(report.primary_error().is_none());
    }

    #[test]
    fn test_concurrent_reader_never_sees_partial_file() {
        let dir = TempDir::new().unwrap();
        let dest = InstallDestination::primary(dir.path(), "fullchain.pem", "privkey.pem");

        let old_cert = vec![b'A'; 64 * 1024];
        let new_cert = vec![b'B'; 96 * 1024];
        let old = StagedMaterial::from_bytes(&old_cert, b"old-key").unwrap();
        let new = StagedMaterial::from_bytes(&new_cert, b"new-key").unwrap();
        assert!(install(&old, &[dest.clone()]).primary_succeeded());

        let stop = Arc::new(AtomicBool::new(false));
        let reader = {
            let stop = stop.clone();
            let path = dest.cert_path();
            let (old_cert, new_cert) = (old_cert.clone(), new_cert.clone());
            std::thread::spawn(move || {
                let mut reads = 0u64;
                while !stop.load(Ordering::Relaxed) {
                    let contents = fs::read(&path).unwrap();
                    assert!(!contents.is_empty());
                    assert!(contents == old_cert || contents == new_cert);
                    reads += 1;
                }
                reads
            })
        };

        for i in 0..100 {
            let material = if i % 2 == 0 { &new } else { &old };
            assert!(install(material, &[dest.clone()]).primary_succeeded());
        }
        stop.store(true, Ordering::Relaxed);

        let reads = reader.join().unwrap();
        assert!(reads > 0);
    }
}
