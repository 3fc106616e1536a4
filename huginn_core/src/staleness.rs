//! Per-system, per-source staleness queries.

use crate::{Error, Result};
use crate::catalogue::{CatalogueStore, StaleScope};
use crate::clock::Clock;
use crate::models::{FreshnessSource, SystemId};
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;

/// Answers "which systems need `source` refreshed?" over the catalogue's timestamp columns.
///
/// Holds no state of its own; every call reads the catalogue.
#[derive(Clone)]
pub struct StalenessTracker {
    store: Arc<dyn CatalogueStore>,
    clock: Arc<dyn Clock>,
}

impl StalenessTracker {
    pub fn new(store: Arc<dyn CatalogueStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Systems whose `source` timestamp is missing or at least `max_age` old.
    ///
    /// The boundary is inclusive: a timestamp of exactly `now - max_age` is stale.
    /// A `max_age` that reaches past the representable time range is rejected.
    #[tracing::instrument(level = "debug", skip(self, scope), fields(source = %source))]
    pub async fn stale(
        &self,
        source: FreshnessSource,
        max_age: Duration,
        scope: &StaleScope,
    ) -> Result<Vec<SystemId>> {
        let cutoff = age_cutoff(self.clock.now(), source, max_age)?;
        self.store.stale_system_ids(source, cutoff, scope).await
    }

    /// Like [`stale`](Self::stale), but anything stamped at or before `floor` is stale too.
    ///
    /// A `floor` later than now is clamped to now.
    #[tracing::instrument(level = "debug", skip(self, scope), fields(source = %source))]
    pub async fn stale_since(
        &self,
        source: FreshnessSource,
        max_age: Duration,
        floor: DateTime<Utc>,
        scope: &StaleScope,
    ) -> Result<Vec<SystemId>> {
        let now = self.clock.now();
        let cutoff = age_cutoff(now, source, max_age)?.max(floor.min(now));
        self.store.stale_system_ids(source, cutoff, scope).await
    }

    /// Systems whose candidacy predates one of its inputs.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn self_heal_candidates(&self, limit: Option<usize>) -> Result<Vec<SystemId>> {
        self.store.candidacy_self_heal_ids(limit).await
    }
}

fn age_cutoff(
    now: DateTime<Utc>,
    source: FreshnessSource,
    max_age: Duration,
) -> Result<DateTime<Utc>> {
    now.checked_sub_signed(max_age).ok_or_else(|| {
        Error::InvalidInput(format!("max age {max_age} for {source} is out of range"))
    })
}
