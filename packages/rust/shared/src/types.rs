//! Core domain types for the staging and archive stores.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::NewsDigestError;

/// Reserved prefix of the summary stored when summarization fails.
pub const FAILURE_SENTINEL_PREFIX: &str = "Falha na sumarização";

/// Prefix the summarization model expects in front of every input text.
pub const SUMMARIZE_PREFIX: &str = "summarize: ";

/// Build the failure-sentinel summary for a summarization error.
pub fn failure_sentinel(reason: impl fmt::Display) -> String {
    format!("{FAILURE_SENTINEL_PREFIX}: {reason}")
}

/// Whether a summary is (or begins with) the failure sentinel.
pub fn is_failure_sentinel(summary: &str) -> bool {
    summary.starts_with(FAILURE_SENTINEL_PREFIX)
}

// ---------------------------------------------------------------------------
// Stage / Status
// ---------------------------------------------------------------------------

/// Position of a staging item in the per-run lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Collected,
    Processed,
    Clustered,
}

impl Stage {
    /// Column value stored in the staging table.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Collected => "collected",
            Self::Processed => "processed",
            Self::Clustered => "clustered",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = NewsDigestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "collected" => Ok(Self::Collected),
            "processed" => Ok(Self::Processed),
            "clustered" => Ok(Self::Clustered),
            other => Err(NewsDigestError::validation(format!(
                "unknown stage '{other}'"
            ))),
        }
    }
}

/// Publication status of an archived item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    /// Part of the live, externally served top-N.
    Posted,
    /// Previously posted, not re-selected by the latest run.
    Archived,
}

impl Status {
    /// Column value stored in the archive table.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Posted => "posted",
            Self::Archived => "archived",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = NewsDigestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "posted" => Ok(Self::Posted),
            "archived" => Ok(Self::Archived),
            other => Err(NewsDigestError::validation(format!(
                "status must be 'posted' or 'archived', got '{other}'"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// A candidate article produced by a collector, before it enters staging.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    pub title: String,
    pub link: String,
    pub image: Option<String>,
    pub source: String,
}

/// One row of the staging store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StagingItem {
    pub id: i64,
    pub title: String,
    pub link: String,
    pub image: Option<String>,
    pub source: String,
    pub summary: Option<String>,
    pub cluster: Option<i64>,
    pub collected_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub stage: Stage,
}

/// A record about to be written to the archive store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchiveRecord {
    pub title: String,
    pub link: String,
    pub image: Option<String>,
    pub source: String,
    pub summary: String,
    pub cluster: i64,
    pub score: Option<f64>,
    pub status: Status,
}

/// One row of the archive store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchivedItem {
    pub id: i64,
    pub title: String,
    pub link: String,
    pub image: Option<String>,
    pub summary: String,
    pub cluster: i64,
    pub source: String,
    pub score: Option<f64>,
    pub status: Status,
    pub selected_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Statistics
// ---------------------------------------------------------------------------

/// Row counts of the staging store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagingCounts {
    pub total: u64,
    pub with_summary: u64,
    pub with_cluster: u64,
    pub ready_for_selection: u64,
}

/// Aggregate statistics of the archive store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveStats {
    pub total: u64,
    pub posted: u64,
    pub archived: u64,
    pub selected_last_7_days: u64,
    pub selected_last_30_days: u64,
    pub by_cluster: BTreeMap<i64, u64>,
}

/// Outcome counters of one promotion pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromotionReport {
    /// Links inserted for the first time.
    pub new: usize,
    /// Links already archived and re-selected.
    pub reselected: usize,
    /// Records rejected by validation or constraints.
    pub failed: usize,
    /// Previously posted rows flipped to archived.
    pub demoted: usize,
}

/// Problems found by a store integrity check.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrityReport {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl IntegrityReport {
    /// Whether the store is safe to run against.
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    /// Append another report's findings to this one.
    pub fn merge(&mut self, other: IntegrityReport) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_roundtrip() {
        for stage in [Stage::Collected, Stage::Processed, Stage::Clustered] {
            assert_eq!(stage.as_str().parse::<Stage>().unwrap(), stage);
        }
        assert!("summarized".parse::<Stage>().is_err());
    }

    #[test]
    fn status_rejects_unknown_values() {
        assert_eq!("posted".parse::<Status>().unwrap(), Status::Posted);
        assert_eq!("archived".parse::<Status>().unwrap(), Status::Archived);
        let err = "postada".parse::<Status>().unwrap_err();
        assert!(err.to_string().contains("postada"));
    }

    #[test]
    fn failure_sentinel_detection() {
        let sentinel = failure_sentinel("model timed out");
        assert_eq!(sentinel, "Falha na sumarização: model timed out");
        assert!(is_failure_sentinel(&sentinel));
        assert!(is_failure_sentinel(FAILURE_SENTINEL_PREFIX));
        assert!(!is_failure_sentinel("Google lança nova campanha"));
    }

    #[test]
    fn integrity_report_merge() {
        let mut report = IntegrityReport {
            errors: vec![],
            warnings: vec!["staging table is empty".into()],
        };
        assert!(report.is_ok());
        report.merge(IntegrityReport {
            errors: vec!["duplicate links".into()],
            warnings: vec![],
        });
        assert!(!report.is_ok());
        assert_eq!(report.warnings.len(), 1);
    }
}
