use crate::Error;
use crate::models::FreshnessSource;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Pipeline stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStage {
    Idle,
    ScanStale,
    FetchBulk,
    FetchEnrichment,
    MergeAndStamp,
    RecomputeCandidacy,
    Done,
}

impl RunStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStage::Idle => "idle",
            RunStage::ScanStale => "scan_stale",
            RunStage::FetchBulk => "fetch_bulk",
            RunStage::FetchEnrichment => "fetch_enrichment",
            RunStage::MergeAndStamp => "merge_and_stamp",
            RunStage::RecomputeCandidacy => "recompute_candidacy",
            RunStage::Done => "done",
        }
    }
}

impl fmt::Display for RunStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Succeeded,
    Failed,
    /// Stopped cooperatively at a stage boundary or aborted mid-fetch.
    Cancelled,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceCounts {
    pub stale: u64,
    pub fetched: u64,
    pub merged: u64,
    pub failed_transient: u64,
    pub failed_malformed: u64,
    /// Deltas for ids absent from the catalogue.
    pub unknown: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidacyCounts {
    pub evaluated: u64,
    pub newly_eligible: u64,
    pub newly_ineligible: u64,
    pub candidates_total: u64,
}

/// What a run did, for logs and the one-shot CLI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub stage_reached: RunStage,
    pub status: RunStatus,
    pub sources: BTreeMap<FreshnessSource, SourceCounts>,
    pub candidacy: CandidacyCounts,
    pub error: Option<String>,
}

impl RunSummary {
    pub fn new(started_at: DateTime<Utc>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at,
            finished_at: None,
            stage_reached: RunStage::Idle,
            status: RunStatus::Running,
            sources: BTreeMap::new(),
            candidacy: CandidacyCounts::default(),
            error: None,
        }
    }

    pub fn source_mut(&mut self, source: FreshnessSource) -> &mut SourceCounts {
        self.sources.entry(source).or_default()
    }

    pub fn source(&self, source: FreshnessSource) -> SourceCounts {
        self.sources.get(&source).copied().unwrap_or_default()
    }
}

/// Cooperative cancellation for one run.
///
/// `stop` is honoured at the next stage boundary; `abort` also cancels in-flight fetches.
#[derive(Debug, Clone, Default)]
pub struct RunControl {
    pub stop: CancellationToken,
    pub abort: CancellationToken,
}

impl RunControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_stopping(&self) -> bool {
        self.stop.is_cancelled() || self.abort.is_cancelled()
    }
}

/// A run that ended in `Failed`; carries the partial summary.
#[derive(thiserror::Error, Debug)]
#[error("refresh run failed during {stage}: {source}")]
pub struct RunError {
    pub stage: RunStage,
    pub summary: Box<RunSummary>,
    #[source]
    pub source: Error,
}
