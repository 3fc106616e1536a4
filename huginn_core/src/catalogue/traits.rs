use crate::Result;
use crate::candidacy::models::{Anchor, AnchorFilter, CandidacyVerdict};
use crate::models::{Coords, FreshnessSource, System, SystemId};
use crate::sources::models::SystemDelta;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Bounds on a staleness query.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StaleScope {
    pub limit: Option<usize>,
    /// Only consider systems with a ring (enrichment is pointless for the rest).
    pub ringed_only: bool,
}

impl StaleScope {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn ringed(limit: Option<usize>) -> Self {
        Self {
            limit,
            ringed_only: true,
        }
    }
}

/// Boolean-flag listing filter. `None` means "don't care".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemFilter {
    pub candidate: Option<bool>,
    pub interested: Option<bool>,
    pub power: Option<String>,
}

impl SystemFilter {
    pub fn candidates() -> Self {
        Self {
            candidate: Some(true),
            ..Default::default()
        }
    }

    pub fn matches(&self, system: &System) -> bool {
        self.candidate.is_none_or(|c| system.is_candidate == c)
            && self
                .interested
                .is_none_or(|i| system.is_interested.unwrap_or(false) == i)
            && self
                .power
                .as_deref()
                .is_none_or(|p| system.power.as_deref() == Some(p))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListQuery {
    pub limit: usize,
    pub offset: usize,
}

impl Default for ListQuery {
    fn default() -> Self {
        Self {
            limit: 100,
            offset: 0,
        }
    }
}

/// Result of a single-row write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeOutcome {
    Merged,
    /// No system with that id exists; nothing was written.
    Unknown,
}

/// Store surface the refresh pipeline needs.
///
/// Every write is scoped to the columns the caller owns; no method creates or deletes
/// a system.
#[async_trait]
pub trait CatalogueStore: Send + Sync {
    async fn ping(&self) -> Result<()>;

    /// Ids whose `source` timestamp is missing or `<= cutoff`.
    ///
    /// Ordered missing first, then oldest, then by id.
    async fn stale_system_ids(
        &self,
        source: FreshnessSource,
        cutoff: DateTime<Utc>,
        scope: &StaleScope,
    ) -> Result<Vec<SystemId>>;

    /// Systems with a dependency timestamp newer than their last candidacy check.
    async fn candidacy_self_heal_ids(&self, limit: Option<usize>) -> Result<Vec<SystemId>>;

    /// Load records by id, ordered by id. Unknown ids are silently absent.
    async fn load_systems(&self, ids: &[SystemId]) -> Result<Vec<System>>;

    /// Column-scoped upsert of one source delta; stamps that source's timestamp to `at`.
    async fn apply_delta(&self, delta: &SystemDelta, at: DateTime<Utc>) -> Result<MergeOutcome>;

    /// Persist a candidacy verdict and stamp `candidacy_checked_at` to `at`.
    async fn record_candidacy(
        &self,
        id: SystemId,
        verdict: &CandidacyVerdict,
        at: DateTime<Utc>,
    ) -> Result<MergeOutcome>;

    /// Nearest system matching `filter` within `radius_ly` of `origin`, excluding `exclude`.
    async fn nearest_anchor(
        &self,
        origin: Coords,
        radius_ly: f64,
        filter: &AnchorFilter,
        exclude: SystemId,
    ) -> Result<Option<Anchor>>;

    async fn list_systems(&self, filter: &SystemFilter, query: ListQuery) -> Result<Vec<System>>;

    async fn count_systems(&self, filter: &SystemFilter) -> Result<u64>;
}
