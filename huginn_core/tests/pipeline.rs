use async_trait::async_trait;
use chrono::{Duration, TimeZone, Utc};
use huginn_core::catalogue::{CatalogueStore, ListQuery, SqliteCatalogue, SystemFilter};
use huginn_core::clock::FixedClock;
use huginn_core::config::OperatorConfig;
use huginn_core::models::{
    ControlState, Coords, FreshnessSource, ResourceSites, ResourceTier, SystemId, SystemRef,
    SystemSeed,
};
use huginn_core::refresh::{Orchestrator, RunControl, RunStatus};
use huginn_core::sources::{
    ControlPatch, DeltaPatch, EnrichmentAdapter, LookupError, RatePolicy, ResourceSitesPatch,
    SystemLookup,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

const POWER: &str = "Nakato Kaine";

struct ControlService {
    lose_power: AtomicBool,
}

#[async_trait]
impl SystemLookup for ControlService {
    fn kind(&self) -> FreshnessSource {
        FreshnessSource::Control
    }

    async fn lookup(&self, system: &SystemRef) -> Result<DeltaPatch, LookupError> {
        match system.id.0 {
            // Only system 1 is owned; system 4's response never parses.
            1 if !self.lose_power.load(Ordering::SeqCst) => {
                Ok(DeltaPatch::Control(ControlPatch {
                    power: Some(POWER.to_string()),
                    control_state: Some(ControlState::Stronghold),
                    ..Default::default()
                }))
            }
            4 => Err(LookupError::Malformed("unexpected body".to_string())),
            _ => Ok(DeltaPatch::Control(ControlPatch::default())),
        }
    }
}

struct SiteService;

#[async_trait]
impl SystemLookup for SiteService {
    fn kind(&self) -> FreshnessSource {
        FreshnessSource::ResourceSites
    }

    async fn lookup(&self, system: &SystemRef) -> Result<DeltaPatch, LookupError> {
        let sites = match system.id.0 {
            1 => ResourceSites {
                hazardous: true,
                low: true,
                ..Default::default()
            },
            2 | 3 => ResourceSites {
                medium: true,
                ..Default::default()
            },
            _ => ResourceSites::default(),
        };
        Ok(DeltaPatch::ResourceSites(ResourceSitesPatch {
            sites,
            ..Default::default()
        }))
    }
}

fn fast_policy() -> RatePolicy {
    RatePolicy {
        min_interval: std::time::Duration::ZERO,
        backoff_base: std::time::Duration::from_millis(1),
        ..Default::default()
    }
}

async fn seeded() -> SqliteCatalogue {
    let store = SqliteCatalogue::in_memory().await.unwrap();
    for (id, x) in [(1u64, 0.0), (2, 20.0), (3, 120.0), (4, 5.0)] {
        let seed = SystemSeed::new(id, format!("Sys {id}"), Coords::new(x, 0.0, 0.0)).unwrap();
        store.insert_seed(&seed).await.unwrap();
    }
    store
}

#[tokio::test]
async fn enrichment_and_proximity_produce_candidates_on_sqlite() {
    let store = Arc::new(seeded().await);
    let cfg = OperatorConfig {
        pledged_power: Some(POWER.to_string()),
        require_ring: false,
        ..Default::default()
    }
    .to_run_config()
    .unwrap();
    let now = Utc.with_ymd_and_hms(2026, 10, 1, 8, 0, 0).unwrap();
    let clock = Arc::new(FixedClock::new(now));
    let control = Arc::new(ControlService {
        lose_power: AtomicBool::new(false),
    });

    let orch = Orchestrator::new(store.clone(), clock.clone())
        .with_enrichment(Arc::new(
            EnrichmentAdapter::new(ControlLookup(control.clone()), fast_policy()).unwrap(),
        ))
        .unwrap()
        .with_enrichment(Arc::new(
            EnrichmentAdapter::new(SiteService, fast_policy()).unwrap(),
        ))
        .unwrap();

    let summary = orch.run(&cfg, &RunControl::new()).await.unwrap();
    assert_eq!(summary.status, RunStatus::Succeeded);
    let control_counts = summary.source(FreshnessSource::Control);
    assert_eq!(control_counts.stale, 4);
    assert_eq!(control_counts.merged, 3);
    assert_eq!(control_counts.failed_malformed, 1);
    assert_eq!(summary.candidacy.newly_eligible, 2);

    let candidates = store
        .list_systems(&SystemFilter::candidates(), ListQuery::default())
        .await
        .unwrap();
    let ids: Vec<SystemId> = candidates.iter().map(|s| s.id).collect();
    // 3 is outside the 50 ly radius; 4 has no resource sites.
    assert_eq!(ids, vec![SystemId(1), SystemId(2)]);
    assert_eq!(candidates[0].metadata.dominant_tier, Some(ResourceTier::Hazardous));
    assert_eq!(candidates[1].metadata.dominant_tier, Some(ResourceTier::Medium));

    let malformed = store.load_systems(&[SystemId(4)]).await.unwrap();
    assert_eq!(malformed[0].freshness.control_updated_at, None);

    // The anchor loses its power; its neighbour loses proximity with it.
    control.lose_power.store(true, Ordering::SeqCst);
    clock.advance(Duration::hours(7));
    let summary = orch.run(&cfg, &RunControl::new()).await.unwrap();
    assert_eq!(summary.candidacy.newly_ineligible, 2);
    assert_eq!(summary.candidacy.candidates_total, 0);
}

#[tokio::test]
async fn rerunning_with_nothing_stale_changes_nothing() {
    let store = Arc::new(seeded().await);
    let cfg = OperatorConfig {
        pledged_power: Some(POWER.to_string()),
        require_ring: false,
        ..Default::default()
    }
    .to_run_config()
    .unwrap();
    let clock = Arc::new(FixedClock::new(
        Utc.with_ymd_and_hms(2026, 10, 1, 8, 0, 0).unwrap(),
    ));
    let orch = Orchestrator::new(store.clone(), clock.clone())
        .with_enrichment(Arc::new(
            EnrichmentAdapter::new(SiteService, fast_policy()).unwrap(),
        ))
        .unwrap();

    orch.run(&cfg, &RunControl::new()).await.unwrap();
    let before = store
        .list_systems(&SystemFilter::default(), ListQuery::default())
        .await
        .unwrap();

    clock.advance(Duration::minutes(30));
    let summary = orch.run(&cfg, &RunControl::new()).await.unwrap();
    let after = store
        .list_systems(&SystemFilter::default(), ListQuery::default())
        .await
        .unwrap();

    assert_eq!(summary.source(FreshnessSource::ResourceSites).stale, 0);
    assert_eq!(summary.candidacy.evaluated, 0);
    assert_eq!(before, after);
}

/// Shares one `ControlService` between the adapter and the test body.
struct ControlLookup(Arc<ControlService>);

#[async_trait]
impl SystemLookup for ControlLookup {
    fn kind(&self) -> FreshnessSource {
        self.0.kind()
    }

    async fn lookup(&self, system: &SystemRef) -> Result<DeltaPatch, LookupError> {
        self.0.lookup(system).await
    }
}
