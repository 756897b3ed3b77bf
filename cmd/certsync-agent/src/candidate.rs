//! Certificates as reported by the authority
//!
//! Authority payloads are normalized here, once: alternate names become a
//! lowercase set whatever shape they arrived in, and statuses collapse into
//! [`CandidateStatus`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// Authority-assigned certificate identifier
///
/// Unsigned integer ids order numerically among themselves and before every
/// other id; the rest order lexicographically. Equal numbers with different
/// spellings (`"7"`, `"007"`) fall back to the string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CandidateId(String);

impl CandidateId {
    /// Wrap an authority id as-is
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The id exactly as the authority reported it
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn sort_key(&self) -> (bool, u64, &str) {
        match self.0.parse::<u64>() {
            Ok(n) => (false, n, &self.0),
            Err(_) => (true, 0, &self.0),
        }
    }
}

impl Ord for CandidateId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.sort_key().cmp(&other.sort_key())
    }
}

impl PartialOrd for CandidateId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for CandidateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CandidateId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Authority lifecycle state, collapsed to what selection cares about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CandidateStatus {
    Pending,
    Issued,
    Revoked,
    Other,
}

impl fmt::Display for CandidateStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CandidateStatus::Pending => write!(f, "pending"),
            CandidateStatus::Issued => write!(f, "issued"),
            CandidateStatus::Revoked => write!(f, "revoked"),
            CandidateStatus::Other => write!(f, "other"),
        }
    }
}

impl FromStr for CandidateStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(CandidateStatus::Pending),
            "issued" => Ok(CandidateStatus::Issued),
            "revoked" => Ok(CandidateStatus::Revoked),
            "other" => Ok(CandidateStatus::Other),
            other => Err(format!("unknown certificate status: {other}")),
        }
    }
}

/// Subject alternative names, normalized to lowercase without trailing dots
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AltNames(BTreeSet<String>);

impl AltNames {
    /// Parse the comma-joined form, e.g. `"a.com, www.a.com"`
    pub fn from_joined(joined: &str) -> Self {
        Self::from_list(joined.split(','))
    }

    /// Normalize each name, dropping empty entries
    pub fn from_list<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self(
            names
                .into_iter()
                .filter_map(|name| normalize_name(name.as_ref()))
                .collect(),
        )
    }

    /// Exact match after normalization; no wildcard or suffix matching
    pub fn contains(&self, domain: &str) -> bool {
        normalize_name(domain).is_some_and(|d| self.0.contains(&d))
    }

    /// Names in sorted order
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    /// Number of distinct names
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// No usable names
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<'de> Deserialize<'de> for AltNames {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Joined(String),
            List(Vec<String>),
        }

        Ok(match Option::<Repr>::deserialize(deserializer)? {
            Some(Repr::Joined(joined)) => AltNames::from_joined(&joined),
            Some(Repr::List(list)) => AltNames::from_list(list.iter().flat_map(|n| n.split(','))),
            None => AltNames::default(),
        })
    }
}

pub(crate) fn normalize_name(name: &str) -> Option<String> {
    let name = name.trim().trim_end_matches('.');
    if name.is_empty() {
        None
    } else {
        Some(name.to_ascii_lowercase())
    }
}

/// Snapshot of one certificate known to the authority
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CertificateCandidate {
    pub id: CandidateId,
    pub domain: String,
    pub alt_names: AltNames,
    pub status: CandidateStatus,
    pub issued_at: DateTime<Utc>,
}

impl CertificateCandidate {
    /// Primary subject equals `domain`, or `domain` is one of the alternate names
    pub fn matches_domain(&self, domain: &str) -> bool {
        match (normalize_name(&self.domain), normalize_name(domain)) {
            (Some(subject), Some(target)) if subject == target => true,
            _ => self.alt_names.contains(domain),
        }
    }
}
