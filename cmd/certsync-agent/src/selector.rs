//! Choosing the certificate to install
//!
//! The authority lists every certificate it knows for a search key: renewals,
//! re-issues, pending orders and expired leftovers. Selection keeps those for
//! the target domain in an accepted status and takes the most recently issued,
//! breaking ties on the highest id.

use crate::candidate::{CandidateStatus, CertificateCandidate};
use certsync_config::{AgentConfig, ConfigError};
use std::collections::BTreeSet;
use thiserror::Error;

/// Which candidates are eligible
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectionCriteria {
    /// Target domain, matched against subject and alternate names
    pub domain: String,
    pub accepted_statuses: BTreeSet<CandidateStatus>,
}

impl SelectionCriteria {
    /// Criteria for `domain` accepting any of `accepted_statuses`
    pub fn new(
        domain: impl Into<String>,
        accepted_statuses: impl IntoIterator<Item = CandidateStatus>,
    ) -> Self {
        Self {
            domain: domain.into(),
            accepted_statuses: accepted_statuses.into_iter().collect(),
        }
    }

    /// Criteria for issued certificates of `domain`
    pub fn issued(domain: impl Into<String>) -> Self {
        Self::new(domain, [CandidateStatus::Issued])
    }

    /// Criteria for the configured domain and statuses
    pub fn from_config(config: &AgentConfig) -> Result<Self, ConfigError> {
        let statuses = config
            .accepted_statuses
            .iter()
            .map(|s| {
                s.parse::<CandidateStatus>()
                    .map_err(|reason| ConfigError::InvalidValue {
                        key: "ACCEPTED_STATUSES".to_string(),
                        value: s.clone(),
                        reason,
                    })
            })
            .collect::<Result<BTreeSet<_>, _>>()?;
        Ok(Self {
            domain: config.domain.trim().to_string(),
            accepted_statuses: statuses,
        })
    }

    /// Status is accepted and the candidate covers the domain
    pub fn accepts(&self, candidate: &CertificateCandidate) -> bool {
        self.accepted_statuses.contains(&candidate.status) && candidate.matches_domain(&self.domain)
    }
}

/// Nothing to install
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SelectionError {
    #[error("No eligible certificate for {domain} among {considered} candidates")]
    NoEligibleCertificate { domain: String, considered: usize },
}

/// Pick the freshest eligible candidate
pub fn select(
    candidates: &[CertificateCandidate],
    criteria: &SelectionCriteria,
) -> Result<CertificateCandidate, SelectionError> {
    candidates
        .iter()
        .filter(|c| criteria.accepts(c))
        .max_by(|a, b| {
            a.issued_at
                .cmp(&b.issued_at)
                .then_with(|| a.id.cmp(&b.id))
        })
        .cloned()
        .ok_or_else(|| SelectionError::NoEligibleCertificate {
            domain: criteria.domain.clone(),
            considered: candidates.len(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candidate::{AltNames, CandidateId};
    use chrono::{DateTime, Duration, TimeZone, Utc};

    fn t(offset_days: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + Duration::days(offset_days)
    }

    fn candidate(
        id: &str,
        domain: &str,
        alt: &str,
        status: CandidateStatus,
        issued_at: DateTime<Utc>,
    ) -> CertificateCandidate {
        CertificateCandidate {
            id: CandidateId::new(id),
            domain: domain.to_string(),
            alt_names: AltNames::from_joined(alt),
            status,
            issued_at,
        }
    }

    #[test]
    fn test_most_recent_wins() {
        let candidates = vec![
            candidate("1", "x.com", "", CandidateStatus::Issued, t(0)),
            candidate("2", "x.com", "", CandidateStatus::Issued, t(30)),
        ];
        let chosen = select(&candidates, &SelectionCriteria::issued("x.com")).unwrap();
        assert_eq!(chosen.id, CandidateId::new("2"));
    }

    #[test]
    fn test_order_of_input_does_not_matter() {
        let mut candidates = vec![
            candidate("5", "x.com", "", CandidateStatus::Issued, t(10)),
            candidate("3", "x.com", "", CandidateStatus::Issued, t(40)),
            candidate("4", "x.com", "", CandidateStatus::Issued, t(20)),
        ];
        let criteria = SelectionCriteria::issued("x.com");
        let first = select(&candidates, &criteria).unwrap();
        candidates.reverse();
        let second = select(&candidates, &criteria).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.id, CandidateId::new("3"));
    }

    #[test]
    fn test_tie_goes_to_highest_id() {
        let candidates = vec![
            candidate("9", "x.com", "", CandidateStatus::Issued, t(5)),
            candidate("12", "x.com", "", CandidateStatus::Issued, t(5)),
            candidate("11", "x.com", "", CandidateStatus::Issued, t(5)),
        ];
        let chosen = select(&candidates, &SelectionCriteria::issued("x.com")).unwrap();
        assert_eq!(chosen.id, CandidateId::new("12"));
    }

    #[test]
    fn test_tie_with_mixed_ids_is_order_independent() {
        let base = vec![
            candidate("10", "x.com", "", CandidateStatus::Issued, t(5)),
            candidate("9", "x.com", "", CandidateStatus::Issued, t(5)),
            candidate("1a", "x.com", "", CandidateStatus::Issued, t(5)),
        ];
        let criteria = SelectionCriteria::issued("x.com");

        for order in [[0, 1, 2], [0, 2, 1], [1, 0, 2], [1, 2, 0], [2, 0, 1], [2, 1, 0]] {
            let candidates: Vec<_> = order.iter().map(|&i| base[i].clone()).collect();
            let chosen = select(&candidates, &criteria).unwrap();
            assert_eq!(chosen.id, CandidateId::new("1a"), "order {order:?}");
        }
    }

    #[test]
    fn test_status_filter_excludes_newer_pending_and_revoked() {
        let candidates = vec![
            candidate("1", "x.com", "", CandidateStatus::Issued, t(0)),
            candidate("2", "x.com", "", CandidateStatus::Pending, t(50)),
            candidate("3", "x.com", "", CandidateStatus::Revoked, t(60)),
        ];
        let chosen = select(&candidates, &SelectionCriteria::issued("x.com")).unwrap();
        assert_eq!(chosen.id, CandidateId::new("1"));

        let lenient =
            SelectionCriteria::new("x.com", [CandidateStatus::Issued, CandidateStatus::Pending]);
        assert_eq!(select(&candidates, &lenient).unwrap().id, CandidateId::new("2"));
    }

    #[test]
    fn test_alt_name_match() {
        let candidates = vec![
            candidate("1", "x.com", "", CandidateStatus::Issued, t(0)),
            candidate("2", "other.com", "other.com,x.com", CandidateStatus::Issued, t(10)),
        ];
        let chosen = select(&candidates, &SelectionCriteria::issued("x.com")).unwrap();
        assert_eq!(chosen.id, CandidateId::new("2"));
    }

    #[test]
    fn test_alt_name_forms_select_identically() {
        let mut joined = candidate("7", "a.com", "a.com,x.com", CandidateStatus::Issued, t(3));
        let mut listed = joined.clone();
        listed.alt_names = AltNames::from_list(["a.com", "x.com"]);
        joined.alt_names = serde_json::from_str(r#""a.com,x.com""#).unwrap();

        let criteria = SelectionCriteria::issued("x.com");
        assert_eq!(
            select(&[joined], &criteria).unwrap().id,
            select(&[listed], &criteria).unwrap().id
        );
    }

    #[test]
    fn test_empty_eligible_set_fails() {
        let criteria = SelectionCriteria::issued("x.com");
        assert_eq!(
            select(&[], &criteria),
            Err(SelectionError::NoEligibleCertificate {
                domain: "x.com".to_string(),
                considered: 0
            })
        );

        let candidates = vec![
            candidate("1", "y.com", "www.y.com", CandidateStatus::Issued, t(0)),
            candidate("2", "x.com", "", CandidateStatus::Pending, t(1)),
        ];
        assert!(matches!(
            select(&candidates, &criteria),
            Err(SelectionError::NoEligibleCertificate { considered: 2, .. })
        ));
    }

    #[test]
    fn test_criteria_from_config() {
        let config = AgentConfig {
            domain: " x.com ".to_string(),
            accepted_statuses: vec!["issued".to_string(), "Pending".to_string()],
            ..AgentConfig::default()
        };
        let criteria = SelectionCriteria::from_config(&config).unwrap();
        assert_eq!(criteria.domain, "x.com");
        assert_eq!(
            criteria.accepted_statuses,
            BTreeSet::from([CandidateStatus::Issued, CandidateStatus::Pending])
        );

        let config = AgentConfig {
            accepted_statuses: vec!["expired".to_string()],
            ..config
        };
        assert!(matches!(
            SelectionCriteria::from_config(&config),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_subdomain_is_not_a_match() {
        let candidates = vec![candidate("1", "www.x.com", "", CandidateStatus::Issued, t(0))];
        assert!(select(&candidates, &SelectionCriteria::issued("x.com")).is_err());
    }
}
