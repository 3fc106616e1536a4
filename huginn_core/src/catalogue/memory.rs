use crate::candidacy::models::{Anchor, AnchorFilter, CandidacyVerdict};
use crate::catalogue::traits::{CatalogueStore, ListQuery, MergeOutcome, StaleScope, SystemFilter};
use crate::models::{Coords, FreshnessSource, System, SystemId, SystemSeed, merge_top_level};
use crate::sources::models::SystemDelta;
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::RwLock;

/// In-memory catalogue for local development and unit tests.
///
/// Supports injected write and connectivity failures so error paths can be exercised.
#[derive(Clone, Default)]
pub struct MemoryCatalogue {
    systems: Arc<RwLock<BTreeMap<SystemId, System>>>,
    writes_left: Arc<AtomicUsize>,
    limit_writes: Arc<AtomicBool>,
    unreachable: Arc<AtomicBool>,
}

impl MemoryCatalogue {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_seed(&self, seed: SystemSeed) -> Result<()> {
        let mut systems = self.systems.write().await;
        systems
            .entry(seed.id)
            .or_insert_with(|| seed.into_system());
        Ok(())
    }

    /// Insert or replace a full record (test setup only; the pipeline never calls this).
    pub async fn put(&self, system: System) {
        self.systems.write().await.insert(system.id, system);
    }

    pub async fn get(&self, id: SystemId) -> Option<System> {
        self.systems.read().await.get(&id).cloned()
    }

    pub async fn snapshot(&self) -> Vec<System> {
        self.systems.read().await.values().cloned().collect()
    }

    /// Allow `n` more successful writes, then fail every write. `None` lifts the limit.
    pub fn fail_writes_after(&self, n: Option<usize>) {
        match n {
            Some(n) => {
                self.writes_left.store(n, Ordering::SeqCst);
                self.limit_writes.store(true, Ordering::SeqCst);
            }
            None => self.limit_writes.store(false, Ordering::SeqCst),
        }
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    fn check_reachable(&self) -> Result<()> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(Error::store(
                "memory catalogue",
                std::io::Error::new(std::io::ErrorKind::NotConnected, "store unreachable"),
            ));
        }
        Ok(())
    }

    fn take_write(&self) -> Result<()> {
        self.check_reachable()?;
        if !self.limit_writes.load(Ordering::SeqCst) {
            return Ok(());
        }
        let granted = self
            .writes_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if granted {
            Ok(())
        } else {
            Err(Error::store(
                "memory catalogue write",
                std::io::Error::new(std::io::ErrorKind::BrokenPipe, "injected write failure"),
            ))
        }
    }
}

#[async_trait]
impl CatalogueStore for MemoryCatalogue {
    async fn ping(&self) -> Result<()> {
        self.check_reachable()
    }

    async fn stale_system_ids(
        &self,
        source: FreshnessSource,
        cutoff: DateTime<Utc>,
        scope: &StaleScope,
    ) -> Result<Vec<SystemId>> {
        self.check_reachable()?;
        let systems = self.systems.read().await;
        let mut stale: Vec<(Option<DateTime<Utc>>, SystemId)> = systems
            .values()
            .filter(|s| !scope.ringed_only || s.has_ring)
            .filter_map(|s| {
                let ts = s.freshness.get(source);
                match ts {
                    Some(t) if t > cutoff => None,
                    _ => Some((ts, s.id)),
                }
            })
            .collect();
        stale.sort();
        let limit = scope.limit.unwrap_or(usize::MAX);
        Ok(stale.into_iter().take(limit).map(|(_, id)| id).collect())
    }

    async fn candidacy_self_heal_ids(&self, limit: Option<usize>) -> Result<Vec<SystemId>> {
        self.check_reachable()?;
        let systems = self.systems.read().await;
        Ok(systems
            .values()
            .filter(|s| s.freshness.candidacy_outdated())
            .map(|s| s.id)
            .take(limit.unwrap_or(usize::MAX))
            .collect())
    }

    async fn load_systems(&self, ids: &[SystemId]) -> Result<Vec<System>> {
        self.check_reachable()?;
        let systems = self.systems.read().await;
        let mut out: Vec<System> = ids.iter().filter_map(|id| systems.get(id).cloned()).collect();
        out.sort_by_key(|s| s.id);
        out.dedup_by_key(|s| s.id);
        Ok(out)
    }

    async fn apply_delta(&self, delta: &SystemDelta, at: DateTime<Utc>) -> Result<MergeOutcome> {
        self.take_write()?;
        let mut systems = self.systems.write().await;
        let Some(system) = systems.get_mut(&delta.system_id) else {
            return Ok(MergeOutcome::Unknown);
        };
        let mut updated = system.clone();
        delta.patch.apply_to(&mut updated, at)?;
        *system = updated;
        Ok(MergeOutcome::Merged)
    }

    async fn record_candidacy(
        &self,
        id: SystemId,
        verdict: &CandidacyVerdict,
        at: DateTime<Utc>,
    ) -> Result<MergeOutcome> {
        self.take_write()?;
        let mut systems = self.systems.write().await;
        let Some(system) = systems.get_mut(&id) else {
            return Ok(MergeOutcome::Unknown);
        };
        let metadata = merge_top_level(&system.metadata, &verdict.metadata_patch()?)?;
        system.metadata = metadata;
        system.is_candidate = verdict.is_candidate;
        system.freshness.set(FreshnessSource::Candidacy, at);
        Ok(MergeOutcome::Merged)
    }

    async fn nearest_anchor(
        &self,
        origin: Coords,
        radius_ly: f64,
        filter: &AnchorFilter,
        exclude: SystemId,
    ) -> Result<Option<Anchor>> {
        self.check_reachable()?;
        let systems = self.systems.read().await;
        let best = systems
            .values()
            .filter(|s| s.id != exclude && filter.matches(s))
            .map(|s| (origin.distance_to(&s.coords), s.id))
            .filter(|(d, _)| *d <= radius_ly)
            .min_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
        Ok(best.map(|(distance_ly, system_id)| Anchor {
            system_id,
            distance_ly,
        }))
    }

    async fn list_systems(&self, filter: &SystemFilter, query: ListQuery) -> Result<Vec<System>> {
        self.check_reachable()?;
        let systems = self.systems.read().await;
        Ok(systems
            .values()
            .filter(|s| filter.matches(s))
            .skip(query.offset)
            .take(query.limit)
            .cloned()
            .collect())
    }

    async fn count_systems(&self, filter: &SystemFilter) -> Result<u64> {
        self.check_reachable()?;
        let systems = self.systems.read().await;
        Ok(systems.values().filter(|s| filter.matches(s)).count() as u64)
    }
}
