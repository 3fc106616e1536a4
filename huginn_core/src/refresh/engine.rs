use crate::candidacy::models::CandidacyInput;
use crate::candidacy::{evaluate, needs_anchor};
use crate::catalogue::{CatalogueStore, MergeOutcome, StaleScope, SystemFilter};
use crate::clock::Clock;
use crate::config::RunConfig;
use crate::models::{FreshnessSource, SystemId, SystemRef};
use crate::refresh::models::{RunControl, RunError, RunStage, RunStatus, RunSummary};
use crate::sources::{
    FetchFailure, FetchInput, FetchOutcome, FetchReport, SourceAdapter, TickSource,
};
use crate::staleness::StalenessTracker;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use futures_util::future::try_join_all;
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

/// Batch sizes and caps for one orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefreshSettings {
    /// Systems per enrichment call and per candidacy load.
    pub batch_size: usize,
    /// Cap on systems enriched per source per run. `None` is unbounded.
    pub enrich_limit: Option<usize>,
    pub self_heal_limit: Option<usize>,
}

impl Default for RefreshSettings {
    fn default() -> Self {
        Self {
            batch_size: 50,
            enrich_limit: Some(500),
            self_heal_limit: None,
        }
    }
}

impl RefreshSettings {
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::InvalidInput("batch_size must be > 0".to_string()));
        }
        Ok(())
    }
}

/// Runs the stage sequence `ScanStale -> FetchBulk -> FetchEnrichment -> MergeAndStamp ->
/// RecomputeCandidacy` against one catalogue.
///
/// Adapters only return deltas; every catalogue write happens here.
pub struct Orchestrator {
    store: Arc<dyn CatalogueStore>,
    clock: Arc<dyn Clock>,
    staleness: StalenessTracker,
    bulk: Option<Arc<dyn SourceAdapter>>,
    enrichment: Vec<Arc<dyn SourceAdapter>>,
    ticks: Option<Arc<dyn TickSource>>,
    settings: RefreshSettings,
}

struct StaleSets {
    bulk: Vec<SystemId>,
    enrichment: Vec<(Arc<dyn SourceAdapter>, Vec<SystemId>)>,
}

impl Orchestrator {
    #[tracing::instrument(level = "debug", skip(store, clock))]
    pub fn new(store: Arc<dyn CatalogueStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            staleness: StalenessTracker::new(store.clone(), clock.clone()),
            store,
            clock,
            bulk: None,
            enrichment: Vec::new(),
            ticks: None,
            settings: RefreshSettings::default(),
        }
    }

    pub fn with_bulk(mut self, adapter: Arc<dyn SourceAdapter>) -> Result<Self> {
        if adapter.kind() != FreshnessSource::Bulk {
            return Err(Error::InvalidInput(format!(
                "bulk adapter reports source '{}'",
                adapter.kind()
            )));
        }
        self.bulk = Some(adapter);
        Ok(self)
    }

    /// Register a per-system adapter. At most one per source.
    pub fn with_enrichment(mut self, adapter: Arc<dyn SourceAdapter>) -> Result<Self> {
        let kind = adapter.kind();
        if !matches!(
            kind,
            FreshnessSource::Control | FreshnessSource::ResourceSites
        ) {
            return Err(Error::InvalidInput(format!(
                "'{kind}' is not an enrichment source"
            )));
        }
        if self.enrichment.iter().any(|a| a.kind() == kind) {
            return Err(Error::InvalidInput(format!(
                "an adapter for '{kind}' is already registered"
            )));
        }
        self.enrichment.push(adapter);
        Ok(self)
    }

    /// Control data stamped at or before the latest tick is refetched regardless of age.
    pub fn with_tick_source(mut self, ticks: Arc<dyn TickSource>) -> Self {
        self.ticks = Some(ticks);
        self
    }

    pub fn with_settings(mut self, settings: RefreshSettings) -> Result<Self> {
        settings.validate()?;
        self.settings = settings;
        Ok(self)
    }

    pub fn store(&self) -> &Arc<dyn CatalogueStore> {
        &self.store
    }

    /// Execute one run with an immutable configuration.
    ///
    /// Cancellation yields `Ok` with status `Cancelled`; only store failures return `Err`.
    #[tracing::instrument(level = "info", skip_all)]
    pub async fn run(
        &self,
        cfg: &RunConfig,
        control: &RunControl,
    ) -> std::result::Result<RunSummary, RunError> {
        let now = self.clock.now();
        let mut summary = RunSummary::new(now);
        tracing::info!(run_id = %summary.run_id, started_at = %now, "refresh run started");

        let result = self.drive(cfg, control, now, &mut summary).await;
        summary.finished_at = Some(self.clock.now());
        match result {
            Ok(()) => {
                summary.stage_reached = RunStage::Done;
                summary.status = RunStatus::Succeeded;
                tracing::info!(
                    run_id = %summary.run_id,
                    evaluated = summary.candidacy.evaluated,
                    newly_eligible = summary.candidacy.newly_eligible,
                    newly_ineligible = summary.candidacy.newly_ineligible,
                    candidates_total = summary.candidacy.candidates_total,
                    "refresh run finished"
                );
                Ok(summary)
            }
            Err(e) if e.is_cancelled() => {
                summary.status = RunStatus::Cancelled;
                tracing::info!(
                    run_id = %summary.run_id,
                    stage = %summary.stage_reached,
                    "refresh run cancelled"
                );
                Ok(summary)
            }
            Err(e) => {
                summary.status = RunStatus::Failed;
                summary.error = Some(e.to_string());
                tracing::error!(
                    run_id = %summary.run_id,
                    stage = %summary.stage_reached,
                    error = %e,
                    "refresh run failed"
                );
                Err(RunError {
                    stage: summary.stage_reached,
                    summary: Box::new(summary),
                    source: e,
                })
            }
        }
    }

    async fn drive(
        &self,
        cfg: &RunConfig,
        control: &RunControl,
        now: DateTime<Utc>,
        summary: &mut RunSummary,
    ) -> Result<()> {
        enter(RunStage::ScanStale, control, summary)?;
        let stale = self.scan_stale(cfg, summary).await?;

        enter(RunStage::FetchBulk, control, summary)?;
        let bulk = self.fetch_bulk(&stale.bulk, control, summary).await?;

        enter(RunStage::FetchEnrichment, control, summary)?;
        let enriched = self.fetch_enrichment(&stale.enrichment, control, summary).await?;

        enter(RunStage::MergeAndStamp, control, summary)?;
        let mut touched = BTreeSet::new();
        for report in bulk.iter().chain(enriched.iter()) {
            self.merge(report, now, control, summary, &mut touched).await?;
        }

        enter(RunStage::RecomputeCandidacy, control, summary)?;
        self.recompute(cfg, now, control, summary, touched).await
    }

    async fn scan_stale(&self, cfg: &RunConfig, summary: &mut RunSummary) -> Result<StaleSets> {
        let bulk = match &self.bulk {
            Some(_) => {
                self.staleness
                    .stale(
                        FreshnessSource::Bulk,
                        cfg.max_age.get(FreshnessSource::Bulk),
                        &StaleScope::all(),
                    )
                    .await?
            }
            None => Vec::new(),
        };
        summary.source_mut(FreshnessSource::Bulk).stale = bulk.len() as u64;

        // Enrichment only pays off where the ring criterion can still pass.
        let scope = StaleScope {
            limit: self.settings.enrich_limit,
            ringed_only: cfg.candidacy.require_ring,
        };
        let tick = if self
            .enrichment
            .iter()
            .any(|a| a.kind() == FreshnessSource::Control)
        {
            self.latest_tick().await
        } else {
            None
        };
        let mut enrichment = Vec::with_capacity(self.enrichment.len());
        for adapter in &self.enrichment {
            let kind = adapter.kind();
            let max_age = cfg.max_age.get(kind);
            let ids = match (kind, tick) {
                (FreshnessSource::Control, Some(tick)) => {
                    self.staleness
                        .stale_since(kind, max_age, tick, &scope)
                        .await?
                }
                _ => self.staleness.stale(kind, max_age, &scope).await?,
            };
            summary.source_mut(kind).stale = ids.len() as u64;
            enrichment.push((adapter.clone(), ids));
        }

        let union: HashSet<SystemId> = bulk
            .iter()
            .chain(enrichment.iter().flat_map(|(_, ids)| ids.iter()))
            .copied()
            .collect();
        tracing::info!(
            run_id = %summary.run_id,
            bulk = bulk.len(),
            union = union.len(),
            "stale systems selected"
        );
        Ok(StaleSets { bulk, enrichment })
    }

    /// Tick lookups are best effort; a failure falls back to max-age staleness.
    async fn latest_tick(&self) -> Option<DateTime<Utc>> {
        let ticks = self.ticks.as_ref()?;
        match ticks.latest_tick().await {
            Ok(Some(tick)) => {
                tracing::info!(%tick, "latest tick");
                Some(tick)
            }
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(error = %e, "tick lookup failed; using max-age staleness for control");
                None
            }
        }
    }

    async fn fetch_bulk(
        &self,
        stale: &[SystemId],
        control: &RunControl,
        summary: &mut RunSummary,
    ) -> Result<Option<FetchReport>> {
        let Some(adapter) = &self.bulk else {
            return Ok(None);
        };
        if stale.is_empty() {
            return Ok(None);
        }
        let only: HashSet<SystemId> = stale.iter().copied().collect();
        let report = match adapter
            .fetch(FetchInput::Snapshot { only: Some(&only) }, &control.abort)
            .await
        {
            Ok(report) => report,
            Err(e) if e.is_cancelled() => return Err(e),
            Err(Error::NotFound(message)) => {
                tracing::info!(%message, "no bulk snapshot published; skipping bulk refresh");
                return Ok(None);
            }
            Err(e) => {
                tracing::warn!(error = %e, "bulk snapshot unreadable; skipping this run");
                failed_batch(FreshnessSource::Bulk, stale, &e)
            }
        };
        let counts = summary.source_mut(FreshnessSource::Bulk);
        counts.fetched = report.fetched();
        counts.failed_transient = report.failed_transient();
        counts.failed_malformed = report.failed_malformed();
        Ok(Some(report))
    }

    /// Sources run concurrently; each walks its own stale set in bounded batches.
    async fn fetch_enrichment(
        &self,
        stale: &[(Arc<dyn SourceAdapter>, Vec<SystemId>)],
        control: &RunControl,
        summary: &mut RunSummary,
    ) -> Result<Vec<FetchReport>> {
        let mut work = Vec::with_capacity(stale.len());
        for (adapter, ids) in stale {
            if ids.is_empty() {
                continue;
            }
            let refs: Vec<SystemRef> = self
                .store
                .load_systems(ids)
                .await?
                .iter()
                .map(|s| s.to_ref())
                .collect();
            work.push((adapter.clone(), refs));
        }

        let batch_size = self.settings.batch_size;
        let reports = try_join_all(work.iter().map(|(adapter, refs)| async move {
            let kind = adapter.kind();
            let mut report = FetchReport::new(kind);
            for batch in refs.chunks(batch_size) {
                match adapter.fetch(FetchInput::Systems(batch), &control.abort).await {
                    Ok(r) => report.extend(r),
                    Err(e) if e.is_cancelled() => return Err(e),
                    Err(e) => {
                        tracing::warn!(source = %kind, error = %e, "enrichment batch failed");
                        let ids: Vec<SystemId> = batch.iter().map(|r| r.id).collect();
                        report.extend(failed_batch(kind, &ids, &e));
                    }
                }
            }
            tracing::debug!(
                source = %kind,
                fetched = report.fetched(),
                failed_transient = report.failed_transient(),
                failed_malformed = report.failed_malformed(),
                "enrichment source finished"
            );
            Ok::<_, Error>(report)
        }))
        .await?;

        for report in &reports {
            let counts = summary.source_mut(report.source);
            counts.fetched = report.fetched();
            counts.failed_transient = report.failed_transient();
            counts.failed_malformed = report.failed_malformed();
        }
        Ok(reports)
    }

    /// Apply deltas in the order the adapter returned them. Each upsert commits on its own.
    async fn merge(
        &self,
        report: &FetchReport,
        now: DateTime<Utc>,
        control: &RunControl,
        summary: &mut RunSummary,
        touched: &mut BTreeSet<SystemId>,
    ) -> Result<()> {
        for delta in report.deltas() {
            if control.abort.is_cancelled() {
                return Err(Error::Cancelled);
            }
            match self.store.apply_delta(&delta, now).await? {
                MergeOutcome::Merged => {
                    summary.source_mut(report.source).merged += 1;
                    touched.insert(delta.system_id);
                }
                MergeOutcome::Unknown => {
                    tracing::debug!(system_id = %delta.system_id, source = %report.source, "delta for unknown system");
                    summary.source_mut(report.source).unknown += 1;
                }
            }
        }
        Ok(())
    }

    async fn recompute(
        &self,
        cfg: &RunConfig,
        now: DateTime<Utc>,
        control: &RunControl,
        summary: &mut RunSummary,
        mut ids: BTreeSet<SystemId>,
    ) -> Result<()> {
        let touched = ids.len();
        ids.extend(
            self.staleness
                .self_heal_candidates(self.settings.self_heal_limit)
                .await?,
        );
        ids.extend(
            self.staleness
                .stale(
                    FreshnessSource::Candidacy,
                    cfg.max_age.get(FreshnessSource::Candidacy),
                    &StaleScope::all(),
                )
                .await?,
        );
        tracing::debug!(touched, total = ids.len(), "candidacy recompute set");

        let ids: Vec<SystemId> = ids.into_iter().collect();
        let anchors = cfg.candidacy.anchor_filter();
        for chunk in ids.chunks(self.settings.batch_size) {
            for system in self.store.load_systems(chunk).await? {
                if control.abort.is_cancelled() {
                    return Err(Error::Cancelled);
                }
                let nearest_anchor = if needs_anchor(&system, &cfg.candidacy) {
                    self.store
                        .nearest_anchor(
                            system.coords,
                            cfg.candidacy.proximity_radius_ly,
                            &anchors,
                            system.id,
                        )
                        .await?
                } else {
                    None
                };
                let verdict = evaluate(
                    &CandidacyInput {
                        system: &system,
                        nearest_anchor,
                    },
                    &cfg.candidacy,
                );
                if self.store.record_candidacy(system.id, &verdict, now).await?
                    == MergeOutcome::Unknown
                {
                    continue;
                }
                summary.candidacy.evaluated += 1;
                match (system.is_candidate, verdict.is_candidate) {
                    (false, true) => {
                        summary.candidacy.newly_eligible += 1;
                        tracing::info!(system_id = %system.id, name = %system.name, "system became a candidate");
                    }
                    (true, false) => {
                        summary.candidacy.newly_ineligible += 1;
                        tracing::info!(
                            system_id = %system.id,
                            name = %system.name,
                            failures = ?verdict.reason.failures,
                            "system is no longer a candidate"
                        );
                    }
                    _ => {}
                }
            }
        }
        summary.candidacy.candidates_total =
            self.store.count_systems(&SystemFilter::candidates()).await?;
        Ok(())
    }
}

fn enter(stage: RunStage, control: &RunControl, summary: &mut RunSummary) -> Result<()> {
    if control.is_stopping() {
        return Err(Error::Cancelled);
    }
    summary.stage_reached = stage;
    tracing::debug!(run_id = %summary.run_id, stage = %stage, "entering stage");
    Ok(())
}

/// A report marking every id as a transient failure, for adapter calls that failed whole.
fn failed_batch(source: FreshnessSource, ids: &[SystemId], error: &Error) -> FetchReport {
    let mut report = FetchReport::new(source);
    report.outcomes = ids
        .iter()
        .map(|id| {
            FetchOutcome::failed(
                *id,
                FetchFailure::Transient {
                    attempts: 1,
                    message: error.to_string(),
                },
            )
        })
        .collect();
    report
}
