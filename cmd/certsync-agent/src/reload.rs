//! Reloading the TLS terminator
//!
//! After a successful install the terminator is asked to reload gracefully so
//! it picks up the new files. Reload problems are reported, never retried, and
//! never undo the install.

use async_trait::async_trait;
use certsync_config::ReloadConfig;
use serde::Serialize;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tracing::{error, info, warn};

/// A running terminator instance found by discovery
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TerminatorInstance {
    pub id: String,
    pub name: String,
    pub image: String,
}

/// Failures running discovery or the reload command
#[derive(Error, Debug)]
pub enum TriggerError {
    #[error("Failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{0} timed out after {1:?}")]
    Timeout(String, Duration),
    #[error("{program} exited with {code:?}: {stderr}")]
    Command {
        program: String,
        code: Option<i32>,
        stderr: String,
    },
}

/// Result of running the reload command inside an instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecResult {
    pub exit_code: Option<i32>,
    pub output: String,
}

/// Locates terminator instances and runs commands in them
#[async_trait]
pub trait ReloadTrigger: Send + Sync {
    /// Running instances whose name or image matches `pattern`, in discovery order
    async fn discover(&self, pattern: &str) -> Result<Vec<TerminatorInstance>, TriggerError>;

    /// Run `command` inside `instance`
    async fn exec(
        &self,
        instance: &TerminatorInstance,
        command: &[String],
    ) -> Result<ExecResult, TriggerError>;
}

/// What came of asking the terminator to reload
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ReloadOutcome {
    /// Reload command exited zero
    Success,
    /// No running instance matched
    NotFound,
    /// Reload command ran and failed
    Failed {
        exit_code: Option<i32>,
        output: String,
    },
    /// Discovery or exec could not run at all
    Unavailable {
        reason: String,
    },
}

impl ReloadOutcome {
    /// Metric and status label
    pub fn label(&self) -> &'static str {
        match self {
            ReloadOutcome::Success => "success",
            ReloadOutcome::NotFound => "not_found",
            ReloadOutcome::Failed { .. } => "failed",
            ReloadOutcome::Unavailable { .. } => "unavailable",
        }
    }
}

/// Discovery plus one reload attempt against the first match
pub struct ReloadCoordinator {
    trigger: Arc<dyn ReloadTrigger>,
    pattern: String,
    command: Vec<String>,
}

impl ReloadCoordinator {
    pub fn new(trigger: Arc<dyn ReloadTrigger>, config: &ReloadConfig) -> Self {
        Self {
            trigger,
            pattern: config.match_pattern.clone(),
            command: config.command.split_whitespace().map(str::to_string).collect(),
        }
    }

    /// Never fails; every problem becomes an outcome
    pub async fn reload(&self) -> ReloadOutcome {
        let instances = match self.trigger.discover(&self.pattern).await {
            Ok(instances) => instances,
            Err(e) => {
                warn!(error = %e, "Could not discover terminator instances");
                return ReloadOutcome::Unavailable {
                    reason: e.to_string(),
                };
            }
        };

        let Some(target) = instances.first() else {
            warn!(pattern = %self.pattern, "No running terminator found, skipping reload");
            return ReloadOutcome::NotFound;
        };

        if instances.len() > 1 {
            let names: Vec<&str> = instances.iter().map(|i| i.name.as_str()).collect();
            warn!(
                pattern = %self.pattern,
                matches = ?names,
                chosen = %target.name,
                "Several terminators match, reloading the first"
            );
        }

        info!(instance = %target.name, id = %target.id, "Reloading terminator");
        match self.trigger.exec(target, &self.command).await {
            Ok(result) if result.exit_code == Some(0) => {
                info!(instance = %target.name, "Terminator reloaded");
                ReloadOutcome::Success
            }
            Ok(result) => {
                error!(
                    instance = %target.name,
                    exit_code = ?result.exit_code,
                    output = %result.output,
                    "Terminator reload failed"
                );
                ReloadOutcome::Failed {
                    exit_code: result.exit_code,
                    output: result.output,
                }
            }
            Err(e) => {
                error!(instance = %target.name, error = %e, "Terminator reload could not run");
                ReloadOutcome::Unavailable {
                    reason: e.to_string(),
                }
            }
        }
    }
}

/// Finds and reloads containers through the `docker` CLI
pub struct DockerCliTrigger {
    program: String,
    timeout: Duration,
}

impl DockerCliTrigger {
    pub fn new(config: &ReloadConfig) -> Self {
        Self {
            program: config.docker_bin.clone(),
            timeout: config.timeout(),
        }
    }

    async fn run(&self, args: &[&str]) -> Result<std::process::Output, TriggerError> {
        let mut command = Command::new(&self.program);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = command.spawn().map_err(|source| TriggerError::Spawn {
            program: self.program.clone(),
            source,
        })?;

        tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| {
                TriggerError::Timeout(format!("{} {}", self.program, args.join(" ")), self.timeout)
            })?
            .map_err(|source| TriggerError::Spawn {
                program: self.program.clone(),
                source,
            })
    }
}

#[async_trait]
impl ReloadTrigger for DockerCliTrigger {
    async fn discover(&self, pattern: &str) -> Result<Vec<TerminatorInstance>, TriggerError> {
        let output = self
            .run(&["ps", "--format", "{{.ID}}\t{{.Names}}\t{{.Image}}"])
            .await?;
        if !output.status.success() {
            return Err(TriggerError::Command {
                program: self.program.clone(),
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(parse_ps(&String::from_utf8_lossy(&output.stdout), pattern))
    }

    async fn exec(
        &self,
        instance: &TerminatorInstance,
        command: &[String],
    ) -> Result<ExecResult, TriggerError> {
        let mut args = vec!["exec", instance.id.as_str()];
        args.extend(command.iter().map(String::as_str));
        let output = self.run(&args).await?;

        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        Ok(ExecResult {
            exit_code: output.status.code(),
            output: text.trim().to_string(),
        })
    }
}

fn parse_ps(stdout: &str, pattern: &str) -> Vec<TerminatorInstance> {
    let pattern = pattern.to_ascii_lowercase();
    stdout
        .lines()
        .filter_map(|line| {
            let mut fields = line.split('\t');
            let id = fields.next()?.trim();
            let name = fields.next()?.trim();
            let image = fields.next().unwrap_or_default().trim();
            (!id.is_empty()).then(|| TerminatorInstance {
                id: id.to_string(),
                name: name.to_string(),
                image: image.to_string(),
            })
        })
        .filter(|i| {
            i.name.to_ascii_lowercase().contains(&pattern)
                || i.image.to_ascii_lowercase().contains(&pattern)
        })
        .collect()
}
