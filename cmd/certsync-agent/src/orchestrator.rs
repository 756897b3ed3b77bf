//! Renewal cycle driver
//!
//! One cycle walks `Checking → Selecting → Fetching → Installing → Reloading`
//! and stops at the first stage that fails. Installed files are only touched
//! by the installer, so a failure before `Installing` leaves them as they were.

use crate::authority::{with_timeout, AuthorityError, CertificateAuthorityClient};
use crate::candidate::{CandidateId, CertificateCandidate};
use crate::fetcher::{CertificateFetcher, FetchError};
use crate::metrics::RenewalMetrics;
use crate::reload::{ReloadCoordinator, ReloadOutcome, ReloadTrigger};
use crate::selector::{select, SelectionCriteria, SelectionError};
use certsync_config::{AgentConfig, ConfigError, PRIMARY_CERT_FILE, PRIMARY_KEY_FILE};
use certsync_crypto::{inspect_cert, install, needs_renewal, InstallDestination, InstallReport};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Step of a renewal cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Checking,
    Selecting,
    Fetching,
    Installing,
    Reloading,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Stage::Checking => write!(f, "checking"),
            Stage::Selecting => write!(f, "selecting"),
            Stage::Fetching => write!(f, "fetching"),
            Stage::Installing => write!(f, "installing"),
            Stage::Reloading => write!(f, "reloading"),
        }
    }
}

/// Error that ended a cycle
#[derive(Error, Debug)]
pub enum CycleError {
    #[error(transparent)]
    Authority(#[from] AuthorityError),
    #[error(transparent)]
    Selection(#[from] SelectionError),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("Primary install failed: {0}")]
    Install(String),
}

/// Result of one renewal cycle
#[derive(Debug)]
pub enum CycleOutcome {
    /// Installed certificate is still fresh
    Skipped,
    Renewed {
        certificate_id: CandidateId,
        report: InstallReport,
        reload: ReloadOutcome,
    },
    Failed {
        stage: Stage,
        error: CycleError,
    },
}

impl CycleOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            CycleOutcome::Skipped => "skipped",
            CycleOutcome::Renewed { .. } => "renewed",
            CycleOutcome::Failed { .. } => "failed",
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, CycleOutcome::Failed { .. })
    }
}

/// Last installed certificate
#[derive(Debug, Clone, Serialize)]
pub struct RenewalRecord {
    pub certificate_id: CandidateId,
    pub installed_at: DateTime<Utc>,
    pub not_after: Option<DateTime<Utc>>,
    pub reload: ReloadOutcome,
}

/// Agent state exposed on `/status`
#[derive(Debug, Clone, Serialize)]
pub struct AgentStatus {
    pub domain: String,
    pub started_at: DateTime<Utc>,
    pub cycles: u64,
    pub last_cycle_at: Option<DateTime<Utc>>,
    pub last_outcome: Option<&'static str>,
    pub last_failed_stage: Option<Stage>,
    pub last_error: Option<String>,
    pub consecutive_failures: u32,
    pub last_renewal: Option<RenewalRecord>,
}

impl AgentStatus {
    pub fn new(domain: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            started_at: Utc::now(),
            cycles: 0,
            last_cycle_at: None,
            last_outcome: None,
            last_failed_stage: None,
            last_error: None,
            consecutive_failures: 0,
            last_renewal: None,
        }
    }
}

/// Primary destination plus the mirror when one is configured
pub fn destinations(config: &AgentConfig) -> Vec<InstallDestination> {
    let mut destinations = vec![InstallDestination::primary(
        &config.primary_dir,
        PRIMARY_CERT_FILE,
        PRIMARY_KEY_FILE,
    )
    .with_modes(config.cert_file_mode, config.key_file_mode)];

    if let Some(mirror) = &config.mirror_dir {
        destinations.push(
            InstallDestination::mirror(mirror, config.mirror_cert_file(), config.mirror_key_file())
                .with_modes(config.cert_file_mode, config.key_file_mode),
        );
    }
    destinations
}

/// Drives renewal cycles and tracks their outcome
pub struct RenewalOrchestrator {
    installed_cert: PathBuf,
    threshold_days: u32,
    interval: Duration,
    criteria: SelectionCriteria,
    authority: Arc<dyn CertificateAuthorityClient>,
    authority_timeout: Duration,
    fetcher: CertificateFetcher,
    destinations: Vec<InstallDestination>,
    reloader: ReloadCoordinator,
    metrics: Arc<RenewalMetrics>,
    status: Arc<RwLock<AgentStatus>>,
}

impl RenewalOrchestrator {
    pub fn new(
        config: &AgentConfig,
        authority: Arc<dyn CertificateAuthorityClient>,
        trigger: Arc<dyn ReloadTrigger>,
        metrics: Arc<RenewalMetrics>,
    ) -> Result<Self, ConfigError> {
        let criteria = SelectionCriteria::from_config(config)?;
        let fetcher = CertificateFetcher::new(
            authority.clone(),
            criteria.domain.clone(),
            config.authority.timeout(),
        );

        Ok(Self {
            installed_cert: config.installed_cert_path(),
            threshold_days: config.renewal_threshold_days,
            interval: config.check_interval(),
            status: Arc::new(RwLock::new(AgentStatus::new(criteria.domain.clone()))),
            criteria,
            authority,
            authority_timeout: config.authority.timeout(),
            fetcher,
            destinations: destinations(config),
            reloader: ReloadCoordinator::new(trigger, &config.reload),
            metrics,
        })
    }

    /// Shared status, updated after every cycle
    pub fn status(&self) -> Arc<RwLock<AgentStatus>> {
        self.status.clone()
    }

    /// Run cycles until `shutdown` resolves
    ///
    /// The first cycle runs immediately. Shutdown is only observed between
    /// cycles.
    pub async fn run<F>(&self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        info!(
            domain = %self.criteria.domain,
            interval_secs = self.interval.as_secs(),
            threshold_days = self.threshold_days,
            "Starting certificate renewal loop"
        );

        tokio::pin!(shutdown);
        loop {
            self.run_cycle().await;

            tokio::select! {
                () = &mut shutdown => {
                    info!("Shutdown requested, stopping renewal loop");
                    break;
                }
                () = tokio::time::sleep(self.interval) => {}
            }
        }
    }

    /// One complete cycle; never returns an error
    pub async fn run_cycle(&self) -> CycleOutcome {
        let span = info_span!("renewal_cycle", domain = %self.criteria.domain);
        let outcome = self.cycle().instrument(span).await;
        self.record(&outcome).await;
        outcome
    }

    /// Query the authority and apply selection without installing anything
    pub async fn candidates(
        &self,
    ) -> Result<(Vec<CertificateCandidate>, Option<CertificateCandidate>), AuthorityError> {
        let candidates = with_timeout(
            self.authority_timeout,
            self.authority.list_certificates(&self.criteria.domain),
        )
        .await?;
        let chosen = select(&candidates, &self.criteria).ok();
        Ok((candidates, chosen))
    }

    async fn cycle(&self) -> CycleOutcome {
        debug!(stage = %Stage::Checking, path = %self.installed_cert.display(), "Checking installed certificate");
        if !needs_renewal(&self.installed_cert, self.threshold_days) {
            info!(
                threshold_days = self.threshold_days,
                "Installed certificate is recent enough, skipping renewal"
            );
            return CycleOutcome::Skipped;
        }

        debug!(stage = %Stage::Selecting, "Selecting certificate");
        let candidate = match self.select_candidate().await {
            Ok(candidate) => candidate,
            Err(e) => return fail(Stage::Selecting, e),
        };
        info!(
            certificate_id = %candidate.id,
            issued_at = %candidate.issued_at,
            "Selected certificate"
        );

        debug!(stage = %Stage::Fetching, "Fetching certificate");
        let material = match self.fetcher.fetch(&candidate.id).await {
            Ok(material) => material,
            Err(e) => return fail(Stage::Fetching, e.into()),
        };

        debug!(stage = %Stage::Installing, "Installing certificate");
        let report = install(&material, &self.destinations);
        if !report.primary_succeeded() {
            let reason = report
                .primary_error()
                .map_or_else(|| "no primary destination".to_string(), ToString::to_string);
            return fail(Stage::Installing, CycleError::Install(reason));
        }
        let not_after = inspect_cert(material.cert()).ok().map(|s| s.not_after);
        drop(material);

        debug!(stage = %Stage::Reloading, "Reloading terminator");
        let reload = self.reloader.reload().await;

        info!(
            certificate_id = %candidate.id,
            not_after = ?not_after,
            reload = reload.label(),
            mirror_failures = report.failures().count(),
            "Certificate renewed"
        );

        CycleOutcome::Renewed {
            certificate_id: candidate.id,
            report,
            reload,
        }
    }

    async fn select_candidate(&self) -> Result<CertificateCandidate, CycleError> {
        let candidates = with_timeout(
            self.authority_timeout,
            self.authority.list_certificates(&self.criteria.domain),
        )
        .await?;
        debug!(count = candidates.len(), "Authority listed candidates");
        Ok(select(&candidates, &self.criteria)?)
    }

    async fn record(&self, outcome: &CycleOutcome) {
        self.metrics.record_cycle(outcome);
        let not_after = self.observe_installed();

        let mut status = self.status.write().await;
        status.cycles += 1;
        status.last_cycle_at = Some(Utc::now());
        status.last_outcome = Some(outcome.label());

        match outcome {
            CycleOutcome::Failed { stage, error } => {
                status.consecutive_failures += 1;
                status.last_failed_stage = Some(*stage);
                status.last_error = Some(error.to_string());
            }
            CycleOutcome::Renewed {
                certificate_id,
                reload,
                ..
            } => {
                status.consecutive_failures = 0;
                status.last_renewal = Some(RenewalRecord {
                    certificate_id: certificate_id.clone(),
                    installed_at: Utc::now(),
                    not_after,
                    reload: reload.clone(),
                });
            }
            CycleOutcome::Skipped => status.consecutive_failures = 0,
        }
    }

    /// Expiry of the certificate currently installed in the primary directory
    fn observe_installed(&self) -> Option<DateTime<Utc>> {
        let pem = match std::fs::read(&self.installed_cert) {
            Ok(pem) => pem,
            Err(e) => {
                debug!(error = %e, "No installed certificate to observe");
                return None;
            }
        };
        match inspect_cert(&pem) {
            Ok(summary) => {
                self.metrics.observe_certificate(&summary);
                Some(summary.not_after)
            }
            Err(e) => {
                warn!(path = %self.installed_cert.display(), error = %e, "Installed certificate is unreadable");
                None
            }
        }
    }
}

fn fail(stage: Stage, error: CycleError) -> CycleOutcome {
    error!(stage = %stage, error = %error, "Renewal cycle failed");
    CycleOutcome::Failed { stage, error }
}
