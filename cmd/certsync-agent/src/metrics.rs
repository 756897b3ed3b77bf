//! Renewal metrics for OpenTelemetry
//!
//! - cycles by outcome
//! - failures by stage
//! - reloads by outcome
//! - days until the installed certificate expires

use crate::orchestrator::{CycleOutcome, Stage};
use crate::reload::ReloadOutcome;
use certsync_crypto::CertificateSummary;
use opentelemetry::{global, metrics::Counter, KeyValue};
use std::sync::{Arc, Mutex};
use tracing::debug;

/// OpenTelemetry instruments for the renewal loop
pub struct RenewalMetrics {
    cycles: Counter<u64>,
    stage_failures: Counter<u64>,
    reloads: Counter<u64>,
    days_remaining: Arc<Mutex<Option<i64>>>,
}

impl RenewalMetrics {
    pub fn new() -> Self {
        let meter = global::meter("certsync_agent");

        let days_remaining: Arc<Mutex<Option<i64>>> = Arc::new(Mutex::new(None));
        let observed = days_remaining.clone();
        let _days_gauge = meter
            .i64_observable_gauge("certsync.certificate.days_remaining")
            .with_description("Days until the installed certificate expires")
            .with_callback(move |observer| {
                if let Ok(days) = observed.lock() {
                    if let Some(days) = *days {
                        observer.observe(days, &[]);
                    }
                }
            })
            .init();

        Self {
            cycles: meter
                .u64_counter("certsync.cycles")
                .with_description("Renewal cycles by outcome")
                .init(),
            stage_failures: meter
                .u64_counter("certsync.stage_failures")
                .with_description("Failed renewal cycles by stage")
                .init(),
            reloads: meter
                .u64_counter("certsync.reloads")
                .with_description("Terminator reload attempts by outcome")
                .init(),
            days_remaining,
        }
    }

    /// Count a finished cycle, its failed stage and its reload
    pub fn record_cycle(&self, outcome: &CycleOutcome) {
        self.cycles
            .add(1, &[KeyValue::new("outcome", outcome.label())]);
        match outcome {
            CycleOutcome::Failed { stage, .. } => self.record_stage_failure(*stage),
            CycleOutcome::Renewed { reload, .. } => self.record_reload(reload),
            CycleOutcome::Skipped => {}
        }
    }

    fn record_stage_failure(&self, stage: Stage) {
        self.stage_failures
            .add(1, &[KeyValue::new("stage", stage.to_string())]);
    }

    fn record_reload(&self, outcome: &ReloadOutcome) {
        self.reloads
            .add(1, &[KeyValue::new("outcome", outcome.label())]);
    }

    pub fn observe_certificate(&self, summary: &CertificateSummary) {
        let days = summary.days_remaining(chrono::Utc::now());
        if let Ok(mut state) = self.days_remaining.lock() {
            *state = Some(days);
        }
        debug!(days_remaining = days, "Certificate expiry metric updated");
    }

    #[cfg(test)]
    pub(crate) fn days_remaining(&self) -> Option<i64> {
        self.days_remaining.lock().ok().and_then(|d| *d)
    }
}

impl Default for RenewalMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    #[test]
    fn test_observe_certificate() {
        let metrics = RenewalMetrics::new();
        assert_eq!(metrics.days_remaining(), None);

        let summary = CertificateSummary {
            subject_cn: Some("x.com".to_string()),
            dns_names: vec!["x.com".to_string()],
            not_after: Utc::now() + Duration::days(90) + Duration::hours(1),
            chain_len: 2,
        };
        metrics.observe_certificate(&summary);
        assert_eq!(metrics.days_remaining(), Some(90));
    }

    #[test]
    fn test_recording_without_provider() {
        let metrics = RenewalMetrics::default();
        metrics.record_cycle(&CycleOutcome::Skipped);
        metrics.record_stage_failure(Stage::Fetching);
        metrics.record_reload(&ReloadOutcome::NotFound);
    }
}
