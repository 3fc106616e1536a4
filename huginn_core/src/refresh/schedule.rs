use crate::config::{OperatorConfigSource, RunConfig};
use crate::refresh::engine::Orchestrator;
use crate::refresh::models::{RunControl, RunError, RunSummary};
use crate::{Error, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// What the scheduler drives. `Orchestrator` is the production implementation.
#[async_trait]
pub trait RefreshRunner: Send + Sync {
    async fn ping(&self) -> Result<()>;

    async fn run_once(
        &self,
        cfg: RunConfig,
        control: RunControl,
    ) -> std::result::Result<RunSummary, RunError>;
}

#[async_trait]
impl RefreshRunner for Orchestrator {
    async fn ping(&self) -> Result<()> {
        self.store().ping().await
    }

    async fn run_once(
        &self,
        cfg: RunConfig,
        control: RunControl,
    ) -> std::result::Result<RunSummary, RunError> {
        self.run(&cfg, &control).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleSettings {
    pub interval: Duration,
    /// Fire as soon as the loop starts instead of after the first interval.
    pub run_immediately: bool,
    /// How long a stopping run may take to reach its next stage boundary before it is aborted.
    pub shutdown_grace: Duration,
    pub ping_attempts: u32,
    pub ping_backoff: Duration,
}

impl Default for ScheduleSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60 * 60),
            run_immediately: true,
            shutdown_grace: Duration::from_secs(120),
            ping_attempts: 5,
            ping_backoff: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FireOutcome {
    Started,
    /// A previous run is still in progress; this firing is dropped, not queued.
    SkippedOverlap,
    SkippedDisabled,
    /// The operator configuration failed to load or validate.
    Rejected(String),
}

struct InFlight {
    control: RunControl,
    handle: JoinHandle<()>,
}

/// Fires the refresh runner on a fixed interval, one run at a time.
pub struct SchedulerLoop {
    runner: Arc<dyn RefreshRunner>,
    config: Arc<dyn OperatorConfigSource>,
    settings: ScheduleSettings,
    in_flight: Mutex<Option<InFlight>>,
}

impl SchedulerLoop {
    #[tracing::instrument(level = "debug", skip(runner, config))]
    pub fn new(
        runner: Arc<dyn RefreshRunner>,
        config: Arc<dyn OperatorConfigSource>,
        settings: ScheduleSettings,
    ) -> Result<Self> {
        if settings.interval.is_zero() {
            return Err(Error::InvalidInput("interval must be > 0".to_string()));
        }
        if settings.ping_attempts == 0 {
            return Err(Error::InvalidInput("ping_attempts must be > 0".to_string()));
        }
        Ok(Self {
            runner,
            config,
            settings,
            in_flight: Mutex::new(None),
        })
    }

    /// Run until `shutdown` fires, then let the in-flight run stop at its next stage boundary.
    ///
    /// `force` (or the grace period elapsing) aborts in-flight fetches. Returns `Err` only on a
    /// loop-level failure: the store staying unreachable through every ping retry.
    #[tracing::instrument(level = "info", skip_all, fields(interval_secs = self.settings.interval.as_secs()))]
    pub async fn run_loop(
        &self,
        shutdown: CancellationToken,
        force: CancellationToken,
    ) -> Result<()> {
        let mut ticker = tokio::time::interval(self.settings.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        if !self.settings.run_immediately {
            ticker.tick().await;
        }

        let result = loop {
            tokio::select! {
                _ = shutdown.cancelled() => break Ok(()),
                _ = ticker.tick() => {
                    match self.fire().await {
                        Ok(outcome) => tracing::debug!(?outcome, "scheduler fired"),
                        Err(e) => {
                            tracing::error!(error = %e, "scheduler cannot reach the catalogue; stopping");
                            break Err(e);
                        }
                    }
                }
            }
        };

        self.drain(&force).await;
        result
    }

    /// One firing: skip on overlap, load configuration, check the store, spawn the run.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn fire(&self) -> Result<FireOutcome> {
        let mut slot = self.in_flight.lock().await;
        if slot.as_ref().is_some_and(|f| !f.handle.is_finished()) {
            tracing::warn!("skipped-overlap: previous refresh run still in progress");
            return Ok(FireOutcome::SkippedOverlap);
        }
        if let Some(previous) = slot.take() {
            log_abnormal_end(previous.handle.await);
        }

        let operator = match self.config.load().await {
            Ok(c) => c,
            Err(e) => {
                tracing::error!(error = %e, "operator configuration unreadable; skipping firing");
                return Ok(FireOutcome::Rejected(e.to_string()));
            }
        };
        if !operator.enable_periodical_update {
            tracing::info!("periodical update disabled; skipping firing");
            return Ok(FireOutcome::SkippedDisabled);
        }
        let cfg = match operator.to_run_config() {
            Ok(c) => c,
            Err(e) => {
                tracing::error!(error = %e, "operator configuration invalid; skipping firing");
                return Ok(FireOutcome::Rejected(e.to_string()));
            }
        };

        self.ping_with_retry().await?;

        let control = RunControl::new();
        let runner = self.runner.clone();
        let run_control = control.clone();
        let handle = tokio::spawn(async move {
            match runner.run_once(cfg, run_control).await {
                Ok(summary) => tracing::info!(
                    run_id = %summary.run_id,
                    status = ?summary.status,
                    newly_eligible = summary.candidacy.newly_eligible,
                    newly_ineligible = summary.candidacy.newly_ineligible,
                    "scheduled refresh run ended"
                ),
                Err(e) => tracing::error!(
                    run_id = %e.summary.run_id,
                    stage = %e.stage,
                    error = %e.source,
                    "scheduled refresh run failed"
                ),
            }
        });
        *slot = Some(InFlight { control, handle });
        Ok(FireOutcome::Started)
    }

    pub async fn is_running(&self) -> bool {
        self.in_flight
            .lock()
            .await
            .as_ref()
            .is_some_and(|f| !f.handle.is_finished())
    }

    async fn ping_with_retry(&self) -> Result<()> {
        let mut attempt = 1u32;
        loop {
            match self.runner.ping().await {
                Ok(()) => return Ok(()),
                Err(e) if attempt >= self.settings.ping_attempts => return Err(e),
                Err(e) => {
                    tracing::warn!(attempt, error = %e, "catalogue ping failed; retrying");
                    let delay = self
                        .settings
                        .ping_backoff
                        .checked_mul(1u32.checked_shl(attempt - 1).unwrap_or(u32::MAX))
                        .unwrap_or(Duration::from_secs(60));
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    async fn drain(&self, force: &CancellationToken) {
        let Some(mut in_flight) = self.in_flight.lock().await.take() else {
            return;
        };
        if in_flight.handle.is_finished() {
            log_abnormal_end(in_flight.handle.await);
            return;
        }
        tracing::info!("waiting for in-flight refresh run to reach a stage boundary");
        in_flight.control.stop.cancel();
        tokio::select! {
            _ = &mut in_flight.handle => return,
            _ = force.cancelled() => {
                tracing::warn!("forced shutdown; aborting in-flight fetches");
            }
            _ = tokio::time::sleep(self.settings.shutdown_grace) => {
                tracing::warn!("shutdown grace elapsed; aborting in-flight fetches");
            }
        }
        in_flight.control.abort.cancel();
        log_abnormal_end(in_flight.handle.await);
    }
}

fn log_abnormal_end(joined: std::result::Result<(), tokio::task::JoinError>) {
    if let Err(e) = joined {
        tracing::error!(panicked = e.is_panic(), error = %e, "refresh run task ended abnormally");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{OperatorConfig, StaticConfigSource};
    use crate::catalogue::MemoryCatalogue;
    use crate::clock::FixedClock;
    use crate::models::{ControlState, Coords, FreshnessSource, SystemId, SystemSeed};
    use crate::refresh::models::{RunStage, RunStatus};
    use crate::sources::{
        ControlPatch, DeltaPatch, FetchInput, FetchOutcome, FetchReport, SourceAdapter,
    };
    use chrono::Utc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::sync::Notify;

    /// Runs until stopped, honouring `stop` like a stage boundary would.
    #[derive(Default)]
    struct SlowRunner {
        runs: AtomicU32,
        pings_failing: AtomicU32,
        fail_runs: bool,
    }

    #[async_trait]
    impl RefreshRunner for SlowRunner {
        async fn ping(&self) -> Result<()> {
            if self.pings_failing.load(Ordering::SeqCst) > 0 {
                self.pings_failing.fetch_sub(1, Ordering::SeqCst);
                return Err(Error::BackendMessage("unreachable".to_string()));
            }
            Ok(())
        }

        async fn run_once(
            &self,
            _cfg: RunConfig,
            control: RunControl,
        ) -> std::result::Result<RunSummary, RunError> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            let mut summary = RunSummary::new(Utc::now());
            if self.fail_runs {
                return Err(RunError {
                    stage: summary.stage_reached,
                    summary: Box::new(summary),
                    source: Error::BackendMessage("store lost".to_string()),
                });
            }
            tokio::select! {
                _ = control.stop.cancelled() => summary.status = RunStatus::Cancelled,
                _ = tokio::time::sleep(Duration::from_secs(3 * 60 * 60)) => summary.status = RunStatus::Succeeded,
            }
            Ok(summary)
        }
    }

    struct PanickingRunner {
        runs: AtomicU32,
    }

    #[async_trait]
    impl RefreshRunner for PanickingRunner {
        async fn ping(&self) -> Result<()> {
            Ok(())
        }

        async fn run_once(
            &self,
            _cfg: RunConfig,
            _control: RunControl,
        ) -> std::result::Result<RunSummary, RunError> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            panic!("adapter bug");
        }
    }

    /// Control adapter that parks inside the fetch until released.
    struct ParkedControl {
        entered: Notify,
        release: Notify,
        calls: AtomicU32,
    }

    #[async_trait]
    impl SourceAdapter for ParkedControl {
        fn kind(&self) -> FreshnessSource {
            FreshnessSource::Control
        }

        async fn fetch(
            &self,
            input: FetchInput<'_>,
            _cancel: &CancellationToken,
        ) -> Result<FetchReport> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.entered.notify_one();
            self.release.notified().await;
            let mut report = FetchReport::new(FreshnessSource::Control);
            if let FetchInput::Systems(refs) = input {
                for r in refs {
                    report.outcomes.push(FetchOutcome::ok(
                        r.id,
                        DeltaPatch::Control(ControlPatch {
                            power: Some("Yuri Grom".to_string()),
                            control_state: Some(ControlState::Exploited),
                            ..Default::default()
                        }),
                    ));
                }
            }
            Ok(report)
        }
    }

    /// Delegates to a real orchestrator and keeps the last summary.
    struct Recording {
        inner: Orchestrator,
        last: std::sync::Mutex<Option<RunSummary>>,
    }

    #[async_trait]
    impl RefreshRunner for Recording {
        async fn ping(&self) -> Result<()> {
            self.inner.ping().await
        }

        async fn run_once(
            &self,
            cfg: RunConfig,
            control: RunControl,
        ) -> std::result::Result<RunSummary, RunError> {
            let result = self.inner.run_once(cfg, control).await;
            if let Ok(summary) = &result {
                *self.last.lock().unwrap() = Some(summary.clone());
            }
            result
        }
    }

    fn enabled() -> Arc<StaticConfigSource> {
        Arc::new(StaticConfigSource::new(OperatorConfig {
            pledged_power: Some("Yuri Grom".to_string()),
            enable_periodical_update: true,
            ..Default::default()
        }))
    }

    fn settings() -> ScheduleSettings {
        ScheduleSettings {
            ping_backoff: Duration::from_millis(10),
            ..Default::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn second_firing_while_running_is_skipped() {
        let runner = Arc::new(SlowRunner::default());
        let sched = SchedulerLoop::new(runner.clone(), enabled(), settings()).unwrap();

        assert_eq!(sched.fire().await.unwrap(), FireOutcome::Started);
        tokio::task::yield_now().await;
        assert_eq!(sched.fire().await.unwrap(), FireOutcome::SkippedOverlap);
        assert_eq!(runner.runs.load(Ordering::SeqCst), 1);
        assert!(sched.is_running().await);
    }

    #[tokio::test(start_paused = true)]
    async fn firing_during_enrichment_fetch_is_skipped_and_run_completes() {
        let store = MemoryCatalogue::new();
        let mut s = SystemSeed::new(7, "Sol", Coords::default())
            .unwrap()
            .into_system();
        s.has_ring = true;
        store.put(s).await;
        let adapter = Arc::new(ParkedControl {
            entered: Notify::new(),
            release: Notify::new(),
            calls: AtomicU32::new(0),
        });
        let orch = Orchestrator::new(
            Arc::new(store.clone()),
            Arc::new(FixedClock::new(Utc::now())),
        )
        .with_enrichment(adapter.clone())
        .unwrap();
        let runner = Arc::new(Recording {
            inner: orch,
            last: std::sync::Mutex::new(None),
        });
        let sched = SchedulerLoop::new(runner.clone(), enabled(), settings()).unwrap();

        assert_eq!(sched.fire().await.unwrap(), FireOutcome::Started);
        adapter.entered.notified().await;
        assert_eq!(sched.fire().await.unwrap(), FireOutcome::SkippedOverlap);

        adapter.release.notify_one();
        while sched.is_running().await {
            tokio::task::yield_now().await;
        }
        assert_eq!(adapter.calls.load(Ordering::SeqCst), 1);
        let summary = runner.last.lock().unwrap().clone().unwrap();
        assert_eq!(summary.status, RunStatus::Succeeded);
        assert_eq!(summary.stage_reached, RunStage::Done);
        let x = store.get(SystemId(7)).await.unwrap();
        assert_eq!(x.power.as_deref(), Some("Yuri Grom"));
    }

    #[tokio::test(start_paused = true)]
    async fn panicked_run_is_reaped_and_next_firing_starts() {
        let runner = Arc::new(PanickingRunner {
            runs: AtomicU32::new(0),
        });
        let sched = SchedulerLoop::new(runner.clone(), enabled(), settings()).unwrap();

        assert_eq!(sched.fire().await.unwrap(), FireOutcome::Started);
        while sched.is_running().await {
            tokio::task::yield_now().await;
        }
        assert_eq!(sched.fire().await.unwrap(), FireOutcome::Started);
        while sched.is_running().await {
            tokio::task::yield_now().await;
        }
        assert_eq!(runner.runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn disabled_updates_never_start_a_run() {
        let runner = Arc::new(SlowRunner::default());
        let config = Arc::new(StaticConfigSource::new(OperatorConfig {
            pledged_power: Some("Yuri Grom".to_string()),
            ..Default::default()
        }));
        let sched = SchedulerLoop::new(runner.clone(), config, settings()).unwrap();

        assert_eq!(sched.fire().await.unwrap(), FireOutcome::SkippedDisabled);
        assert_eq!(runner.runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_configuration_rejects_the_firing_only() {
        let runner = Arc::new(SlowRunner::default());
        let config = Arc::new(StaticConfigSource::new(OperatorConfig {
            enable_periodical_update: true,
            ..Default::default()
        }));
        let sched = SchedulerLoop::new(runner.clone(), config.clone(), settings()).unwrap();

        assert!(matches!(
            sched.fire().await.unwrap(),
            FireOutcome::Rejected(_)
        ));
        config
            .set(OperatorConfig {
                pledged_power: Some("Yuri Grom".to_string()),
                enable_periodical_update: true,
                ..Default::default()
            })
            .await;
        assert_eq!(sched.fire().await.unwrap(), FireOutcome::Started);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_run_does_not_stop_the_next_firing() {
        let runner = Arc::new(SlowRunner {
            fail_runs: true,
            ..Default::default()
        });
        let sched = SchedulerLoop::new(runner.clone(), enabled(), settings()).unwrap();

        assert_eq!(sched.fire().await.unwrap(), FireOutcome::Started);
        while sched.is_running().await {
            tokio::task::yield_now().await;
        }
        assert_eq!(sched.fire().await.unwrap(), FireOutcome::Started);
        while sched.is_running().await {
            tokio::task::yield_now().await;
        }
        assert_eq!(runner.runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn ping_retries_then_surfaces_a_loop_error() {
        let runner = Arc::new(SlowRunner::default());
        runner.pings_failing.store(2, Ordering::SeqCst);
        let sched = SchedulerLoop::new(runner.clone(), enabled(), settings()).unwrap();
        assert_eq!(sched.fire().await.unwrap(), FireOutcome::Started);

        let runner = Arc::new(SlowRunner::default());
        runner.pings_failing.store(10, Ordering::SeqCst);
        let sched = SchedulerLoop::new(runner.clone(), enabled(), settings()).unwrap();
        let result = sched
            .run_loop(CancellationToken::new(), CancellationToken::new())
            .await;
        assert!(result.is_err());
        assert_eq!(runner.runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_stops_the_in_flight_run_at_a_boundary() {
        let runner = Arc::new(SlowRunner::default());
        let sched = Arc::new(SchedulerLoop::new(runner.clone(), enabled(), settings()).unwrap());
        let shutdown = CancellationToken::new();

        let task = {
            let sched = sched.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { sched.run_loop(shutdown, CancellationToken::new()).await })
        };
        while !sched.is_running().await {
            tokio::task::yield_now().await;
        }
        shutdown.cancel();
        task.await.unwrap().unwrap();

        assert_eq!(runner.runs.load(Ordering::SeqCst), 1);
        assert!(!sched.is_running().await);
    }
}
