//! Environment variable overrides

use crate::{invalid, mode, AgentConfig, ConfigError};
use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;

/// Names a YAML/JSON file loaded underneath the environment
pub const CONFIG_PATH_ENV: &str = "CERTSYNC_CONFIG";

fn parse<T>(key: &str, raw: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    raw.trim()
        .parse()
        .map_err(|e: T::Err| invalid(key, raw, e.to_string()))
}

impl AgentConfig {
    /// Apply environment overrides on top of `self`
    ///
    /// Unset or blank variables leave the field untouched, except
    /// `HOST_SSL_DIR` where a blank value disables the mirror.
    pub fn apply_overrides<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = var("DOMAIN") {
            self.domain = v.trim().to_string();
        }
        if let Some(v) = var("SSL_DEST_DIR") {
            self.primary_dir = PathBuf::from(v.trim());
        }
        if let Some(v) = lookup("HOST_SSL_DIR") {
            self.mirror_dir = match v.trim() {
                "" => None,
                dir => Some(PathBuf::from(dir)),
            };
        }
        if let Some(v) = var("CERT_CHECK_INTERVAL_DAYS") {
            self.check_interval_days = parse("CERT_CHECK_INTERVAL_DAYS", &v)?;
        }
        if let Some(v) = var("CERT_UPDATE_THRESHOLD_DAYS") {
            self.renewal_threshold_days = parse("CERT_UPDATE_THRESHOLD_DAYS", &v)?;
        }
        if let Some(v) = var("ACCEPTED_STATUSES") {
            self.accepted_statuses = v
                .split(',')
                .map(|s| s.trim().to_ascii_lowercase())
                .filter(|s| !s.is_empty())
                .collect();
        }
        if let Some(v) = var("CERT_FILE_MODE") {
            self.cert_file_mode = mode::parse_octal(&v)
                .map_err(|reason| invalid("CERT_FILE_MODE", &v, reason))?;
        }
        if let Some(v) = var("KEY_FILE_MODE") {
            self.key_file_mode = mode::parse_octal(&v)
                .map_err(|reason| invalid("KEY_FILE_MODE", &v, reason))?;
        }

        if let Some(v) = var("TENCENT_SECRET_ID") {
            self.credentials.secret_id = v.trim().to_string();
        }
        if let Some(v) = var("TENCENT_SECRET_KEY") {
            self.credentials.secret_key = v.trim().to_string();
        }
        if let Some(v) = var("TENCENT_SSL_ENDPOINT") {
            self.authority.endpoint = v.trim().trim_end_matches('/').to_string();
        }
        if let Some(v) = var("TENCENT_REGION") {
            self.authority.region = Some(v.trim().to_string());
        }
        if let Some(v) = var("AUTHORITY_TIMEOUT_SECS") {
            self.authority.timeout_secs = parse("AUTHORITY_TIMEOUT_SECS", &v)?;
        }

        if let Some(v) = var("RELOAD_MATCH") {
            self.reload.match_pattern = v.trim().to_string();
        }
        if let Some(v) = var("RELOAD_COMMAND") {
            self.reload.command = v.trim().to_string();
        }
        if let Some(v) = var("RELOAD_TIMEOUT_SECS") {
            self.reload.timeout_secs = parse("RELOAD_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = var("DOCKER_BIN") {
            self.reload.docker_bin = v.trim().to_string();
        }

        if let Some(v) = var("HEALTH_ADDR") {
            self.health_addr = Some(parse("HEALTH_ADDR", &v)?);
        }

        Ok(self)
    }
}
