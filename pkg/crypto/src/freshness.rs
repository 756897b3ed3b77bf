//! Renewal gate
//!
//! There is no state file: the installed certificate's modification time is
//! the record of when it was last renewed.

use std::io::ErrorKind;
use std::path::Path;
use std::time::{Duration, SystemTime};
use tracing::{info, warn};

const SECONDS_PER_DAY: f64 = 24.0 * 3600.0;

/// Whether the certificate at `cert_path` is missing or older than `threshold_days`
pub fn needs_renewal(cert_path: impl AsRef<Path>, threshold_days: u32) -> bool {
    needs_renewal_at(cert_path, threshold_days, SystemTime::now())
}

/// [`needs_renewal`] evaluated at an explicit instant
///
/// Never fails: a missing file, unreadable metadata or an unsupported mtime
/// all mean "renew".
pub fn needs_renewal_at(cert_path: impl AsRef<Path>, threshold_days: u32, now: SystemTime) -> bool {
    let cert_path = cert_path.as_ref();

    let modified = match std::fs::metadata(cert_path).and_then(|m| m.modified()) {
        Ok(modified) => modified,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            info!(path = %cert_path.display(), "Certificate file not found, renewal needed");
            return true;
        }
        Err(e) => {
            warn!(
                path = %cert_path.display(),
                error = %e,
                "Failed to read certificate metadata, assuming renewal needed"
            );
            return true;
        }
    };

    // mtime in the future counts as brand new
    let age = now.duration_since(modified).unwrap_or(Duration::ZERO);
    let age_days = age.as_secs_f64() / SECONDS_PER_DAY;
    let stale = age_days > f64::from(threshold_days);

    if stale {
        info!(
            path = %cert_path.display(),
            age_days = format_args!("{age_days:.1}"),
            threshold_days,
            "Certificate exceeds renewal threshold"
        );
    } else {
        info!(
            path = %cert_path.display(),
            age_days = format_args!("{age_days:.1}"),
            threshold_days,
            "Certificate within renewal threshold"
        );
    }

    stale
}
