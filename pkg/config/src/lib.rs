//! Agent configuration
//!
//! The configuration is read once at startup: an optional YAML (or JSON) file
//! named by `CERTSYNC_CONFIG` provides the base, environment variables override
//! individual fields, and the result is validated before any component sees it.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::File;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

mod env;
/// Octal file mode (de)serialization
pub mod mode;

pub use env::CONFIG_PATH_ENV;

/// Certificate filename in the primary destination
pub const PRIMARY_CERT_FILE: &str = "fullchain.pem";
/// Private key filename in the primary destination
pub const PRIMARY_KEY_FILE: &str = "privkey.pem";

const SECONDS_PER_DAY: u64 = 24 * 3600;
/// Longest accepted check interval, ten years
pub const MAX_CHECK_INTERVAL_DAYS: u64 = 3650;

/// Errors raised while loading or validating configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Missing required setting: {0}")]
    MissingField(String),
    #[error("Invalid value {value:?} for {key}: {reason}")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },
}

/// Complete agent configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AgentConfig {
    /// Domain whose certificate is managed
    pub domain: String,
    /// Directory read by the TLS terminator
    pub primary_dir: PathBuf,
    /// Optional host-visible mirror; skipped when the directory is absent
    pub mirror_dir: Option<PathBuf>,
    /// Days slept between renewal cycles, at most [`MAX_CHECK_INTERVAL_DAYS`]
    pub check_interval_days: u64,
    /// Age in days after which the installed certificate is stale
    pub renewal_threshold_days: u32,
    /// Authority statuses eligible for installation
    pub accepted_statuses: Vec<String>,
    /// Mode of installed certificate files
    #[serde(with = "mode")]
    pub cert_file_mode: u32,
    /// Mode of installed private key files
    #[serde(with = "mode")]
    pub key_file_mode: u32,
    /// Authority API credentials
    pub credentials: Credentials,
    /// Authority endpoint settings
    pub authority: AuthorityConfig,
    /// Terminator reload settings
    pub reload: ReloadConfig,
    /// Address of the health/status HTTP server, disabled when unset
    pub health_addr: Option<SocketAddr>,
}

/// API credentials handed through to the authority client
#[derive(Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Credentials {
    /// Tencent Cloud SecretId
    pub secret_id: String,
    /// Tencent Cloud SecretKey; never serialized or logged
    #[serde(skip_serializing)]
    pub secret_key: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("secret_id", &self.secret_id)
            .field("secret_key", &"<redacted>")
            .finish()
    }
}

/// Where the certificate authority API lives
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AuthorityConfig {
    /// Base URL of the API
    pub endpoint: String,
    /// Sent as `X-TC-Region` when set
    pub region: Option<String>,
    /// Bound on each API call
    pub timeout_secs: u64,
}

impl Default for AuthorityConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://ssl.tencentcloudapi.com".to_string(),
            region: None,
            timeout_secs: 30,
        }
    }
}

impl AuthorityConfig {
    /// Per-call timeout
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// How the TLS terminator is located and asked to reload
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ReloadConfig {
    /// Case-insensitive substring matched against container name or image
    pub match_pattern: String,
    /// Command executed inside the matched container
    pub command: String,
    /// Bound on discovery and on the reload command
    pub timeout_secs: u64,
    /// Docker CLI used for discovery and exec
    pub docker_bin: String,
}

impl Default for ReloadConfig {
    fn default() -> Self {
        Self {
            match_pattern: "nginx".to_string(),
            command: "nginx -s reload".to_string(),
            timeout_secs: 30,
            docker_bin: "docker".to_string(),
        }
    }
}

impl ReloadConfig {
    /// Per-command timeout
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            domain: String::new(),
            primary_dir: PathBuf::from("/certs"),
            mirror_dir: Some(PathBuf::from("/host-ssl")),
            check_interval_days: 30,
            renewal_threshold_days: 60,
            accepted_statuses: vec!["issued".to_string()],
            cert_file_mode: 0o644,
            key_file_mode: 0o600,
            credentials: Credentials::default(),
            authority: AuthorityConfig::default(),
            reload: ReloadConfig::default(),
            health_addr: None,
        }
    }
}

impl AgentConfig {
    /// Load from the process environment
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_with(|key| std::env::var(key).ok())
    }

    /// Load using an arbitrary variable lookup
    pub fn load_with<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let base = match lookup(CONFIG_PATH_ENV) {
            Some(path) if !path.trim().is_empty() => Self::load_file(path.trim())?,
            _ => Self::default(),
        };

        let config = base.apply_overrides(lookup)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a configuration file; `.json` files are read as JSON, anything else as YAML
    pub fn load_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let file = File::open(path)?;
        let config = if path.extension().is_some_and(|ext| ext == "json") {
            serde_json::from_reader(file)?
        } else {
            serde_yaml::from_reader(file)?
        };
        Ok(config)
    }

    /// Reject settings the agent cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.domain.trim().is_empty() {
            return Err(ConfigError::MissingField("DOMAIN".to_string()));
        }
        if self.credentials.secret_id.is_empty() {
            return Err(ConfigError::MissingField("TENCENT_SECRET_ID".to_string()));
        }
        if self.credentials.secret_key.is_empty() {
            return Err(ConfigError::MissingField("TENCENT_SECRET_KEY".to_string()));
        }
        if self.check_interval_days == 0 {
            return Err(invalid(
                "CERT_CHECK_INTERVAL_DAYS",
                "0",
                "interval must be at least one day",
            ));
        }
        if self.check_interval_days > MAX_CHECK_INTERVAL_DAYS {
            return Err(invalid(
                "CERT_CHECK_INTERVAL_DAYS",
                &self.check_interval_days.to_string(),
                format!("interval must not exceed {MAX_CHECK_INTERVAL_DAYS} days"),
            ));
        }
        if self.accepted_statuses.is_empty() {
            return Err(ConfigError::MissingField("ACCEPTED_STATUSES".to_string()));
        }
        for (key, value) in [
            ("CERT_FILE_MODE", self.cert_file_mode),
            ("KEY_FILE_MODE", self.key_file_mode),
        ] {
            if value > 0o777 {
                return Err(invalid(key, &format!("{value:o}"), "mode exceeds 777"));
            }
        }
        if self.authority.timeout_secs == 0 || self.reload.timeout_secs == 0 {
            return Err(invalid("TIMEOUT_SECS", "0", "timeouts must be non-zero"));
        }
        if self.reload.command.split_whitespace().next().is_none() {
            return Err(ConfigError::MissingField("RELOAD_COMMAND".to_string()));
        }
        Ok(())
    }

    /// Sleep between renewal cycles
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_days.saturating_mul(SECONDS_PER_DAY))
    }

    /// Path of the certificate whose age drives renewal
    pub fn installed_cert_path(&self) -> PathBuf {
        self.primary_dir.join(PRIMARY_CERT_FILE)
    }

    /// Certificate filename in the mirror, `<domain>_bundle.crt`
    pub fn mirror_cert_file(&self) -> String {
        format!("{}_bundle.crt", self.domain)
    }

    /// Key filename in the mirror, `<domain>.key`
    pub fn mirror_key_file(&self) -> String {
        format!("{}.key", self.domain)
    }
}

pub(crate) fn invalid(key: &str, value: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
        reason: reason.into(),
    }
}
