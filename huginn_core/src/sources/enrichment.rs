//! Rate-limited runner for per-system enrichment lookups.

use crate::models::{FreshnessSource, SystemRef};
use crate::sources::models::{FetchFailure, FetchInput, FetchOutcome, FetchReport};
use crate::sources::traits::{LookupError, SourceAdapter, SystemLookup};
use crate::{Error, Result};
use async_trait::async_trait;
use futures_util::StreamExt;
use futures_util::stream::FuturesUnordered;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Per-source request policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RatePolicy {
    /// Maximum requests in flight at once.
    pub max_concurrent: usize,
    /// Minimum spacing between request starts.
    pub min_interval: Duration,
    pub request_timeout: Duration,
    /// Attempts per system for transient failures, including the first one.
    pub max_attempts: u32,
    pub backoff_base: Duration,
    /// Rate-limit pauses tolerated per system before giving up for this run.
    pub max_rate_limit_pauses: u32,
}

impl Default for RatePolicy {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            min_interval: Duration::from_millis(250),
            request_timeout: Duration::from_secs(20),
            max_attempts: 3,
            backoff_base: Duration::from_millis(500),
            max_rate_limit_pauses: 5,
        }
    }
}

impl RatePolicy {
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent == 0 {
            return Err(Error::Config("max_concurrent must be > 0".to_string()));
        }
        if self.max_attempts == 0 {
            return Err(Error::Config("max_attempts must be > 0".to_string()));
        }
        if self.request_timeout.is_zero() {
            return Err(Error::Config("request_timeout must be > 0".to_string()));
        }
        Ok(())
    }

    /// Delay before retry number `attempt` (1-based): `backoff_base * 2^(attempt-1)`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let pow = attempt.saturating_sub(1).min(16);
        let factor = 1u32.checked_shl(pow).unwrap_or(u32::MAX);
        self.backoff_base.saturating_mul(factor)
    }
}

/// Hands out request start slots no closer than `interval` apart.
#[derive(Debug)]
struct Pacer {
    interval: Duration,
    next: Mutex<Option<Instant>>,
}

impl Pacer {
    fn new(interval: Duration) -> Self {
        Self {
            interval,
            next: Mutex::new(None),
        }
    }

    async fn wait_turn(&self) {
        let slot = {
            let mut next = self.next.lock().await;
            let now = Instant::now();
            let slot = next.map_or(now, |n| n.max(now));
            *next = Some(slot + self.interval);
            slot
        };
        tokio::time::sleep_until(slot).await;
    }

    /// Hold every future slot until at least `until`.
    async fn pause_until(&self, until: Instant) {
        let mut next = self.next.lock().await;
        *next = Some(next.map_or(until, |n| n.max(until)));
    }
}

/// Turns a `SystemLookup` into a `SourceAdapter` that honours a `RatePolicy`.
pub struct EnrichmentAdapter<L: SystemLookup> {
    lookup: L,
    policy: RatePolicy,
    pacer: Pacer,
}

impl<L: SystemLookup> EnrichmentAdapter<L> {
    #[tracing::instrument(level = "debug", skip(lookup))]
    pub fn new(lookup: L, policy: RatePolicy) -> Result<Self> {
        policy.validate()?;
        let pacer = Pacer::new(policy.min_interval);
        Ok(Self {
            lookup,
            policy,
            pacer,
        })
    }

    pub fn policy(&self) -> &RatePolicy {
        &self.policy
    }

    pub fn lookup(&self) -> &L {
        &self.lookup
    }

    async fn fetch_one(&self, system: &SystemRef) -> FetchOutcome {
        let kind = self.lookup.kind();
        let mut attempts = 0u32;
        let mut pauses = 0u32;
        loop {
            self.pacer.wait_turn().await;
            let res = match tokio::time::timeout(
                self.policy.request_timeout,
                self.lookup.lookup(system),
            )
            .await
            {
                Ok(r) => r,
                Err(_) => Err(LookupError::Transient(format!(
                    "request timed out after {}ms",
                    self.policy.request_timeout.as_millis()
                ))),
            };

            match res {
                Ok(patch) if patch.source() == kind => {
                    return FetchOutcome::ok(system.id, patch);
                }
                Ok(patch) => {
                    return FetchOutcome::failed(
                        system.id,
                        FetchFailure::Malformed {
                            message: format!(
                                "lookup for {kind} returned a {} patch",
                                patch.source()
                            ),
                        },
                    );
                }
                Err(LookupError::Malformed(message)) => {
                    tracing::debug!(system_id = %system.id, source = %kind, %message, "malformed response");
                    return FetchOutcome::failed(system.id, FetchFailure::Malformed { message });
                }
                Err(LookupError::RateLimited { retry_after }) => {
                    pauses += 1;
                    if pauses > self.policy.max_rate_limit_pauses {
                        return FetchOutcome::failed(
                            system.id,
                            FetchFailure::Transient {
                                attempts: attempts + pauses - 1,
                                message: "rate limit persisted".to_string(),
                            },
                        );
                    }
                    let wait = retry_after.unwrap_or_else(|| self.policy.backoff(pauses));
                    tracing::warn!(
                        system_id = %system.id,
                        source = %kind,
                        wait_ms = wait.as_millis() as u64,
                        "rate limited; pausing requests"
                    );
                    self.pacer.pause_until(Instant::now() + wait).await;
                }
                Err(LookupError::Transient(message)) => {
                    attempts += 1;
                    if attempts >= self.policy.max_attempts {
                        tracing::warn!(
                            system_id = %system.id,
                            source = %kind,
                            attempts,
                            %message,
                            "lookup failed; skipping until next run"
                        );
                        return FetchOutcome::failed(
                            system.id,
                            FetchFailure::Transient { attempts, message },
                        );
                    }
                    tokio::time::sleep(self.policy.backoff(attempts)).await;
                }
            }
        }
    }
}

#[async_trait]
impl<L: SystemLookup> SourceAdapter for EnrichmentAdapter<L> {
    fn kind(&self) -> FreshnessSource {
        self.lookup.kind()
    }

    #[tracing::instrument(level = "debug", skip(self, input, cancel), fields(source = %self.lookup.kind()))]
    async fn fetch(
        &self,
        input: FetchInput<'_>,
        cancel: &CancellationToken,
    ) -> Result<FetchReport> {
        let FetchInput::Systems(systems) = input else {
            return Err(Error::InvalidInput(
                "enrichment adapters only accept a system list".to_string(),
            ));
        };

        let semaphore = Semaphore::new(self.policy.max_concurrent);
        let mut tasks = FuturesUnordered::new();
        for (idx, system) in systems.iter().enumerate() {
            let semaphore = &semaphore;
            tasks.push(async move {
                let _permit = semaphore
                    .acquire()
                    .await
                    .map_err(|_| Error::BackendMessage("enrichment semaphore closed".into()))?;
                Ok::<_, Error>((idx, self.fetch_one(system).await))
            });
        }

        let mut collected = Vec::with_capacity(systems.len());
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    // Dropping `tasks` aborts every in-flight request.
                    return Err(Error::Cancelled);
                }
                next = tasks.next() => match next {
                    Some(res) => collected.push(res?),
                    None => break,
                },
            }
        }

        collected.sort_by_key(|(idx, _)| *idx);
        let mut report = FetchReport::new(self.lookup.kind());
        report.outcomes = collected.into_iter().map(|(_, o)| o).collect();
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Coords, ResourceSites, SystemId};
    use crate::sources::models::{ControlPatch, DeltaPatch, ResourceSitesPatch};
    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Replays a scripted response sequence per system id.
    struct ScriptedLookup {
        script: StdMutex<HashMap<u64, VecDeque<std::result::Result<DeltaPatch, LookupError>>>>,
        calls: AtomicUsize,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
        delay: Duration,
    }

    impl ScriptedLookup {
        fn new(delay: Duration) -> Self {
            Self {
                script: StdMutex::new(HashMap::new()),
                calls: AtomicUsize::new(0),
                in_flight: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                delay,
            }
        }

        fn push(&self, id: u64, r: std::result::Result<DeltaPatch, LookupError>) {
            self.script
                .lock()
                .unwrap()
                .entry(id)
                .or_default()
                .push_back(r);
        }
    }

    fn ok_patch() -> DeltaPatch {
        DeltaPatch::ResourceSites(ResourceSitesPatch {
            sites: ResourceSites {
                high: true,
                ..Default::default()
            },
            passthrough: Default::default(),
        })
    }

    #[async_trait]
    impl SystemLookup for ScriptedLookup {
        fn kind(&self) -> FreshnessSource {
            FreshnessSource::ResourceSites
        }

        async fn lookup(&self, system: &SystemRef) -> std::result::Result<DeltaPatch, LookupError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            let next = self
                .script
                .lock()
                .unwrap()
                .get_mut(&system.id.0)
                .and_then(|q| q.pop_front());
            next.unwrap_or_else(|| Ok(ok_patch()))
        }
    }

    fn refs(n: u64) -> Vec<SystemRef> {
        (1..=n)
            .map(|i| SystemRef {
                id: SystemId(i),
                name: format!("Sys {i}"),
                coords: Coords::default(),
            })
            .collect()
    }

    fn policy() -> RatePolicy {
        RatePolicy {
            max_concurrent: 2,
            min_interval: Duration::from_millis(10),
            request_timeout: Duration::from_secs(1),
            max_attempts: 3,
            backoff_base: Duration::from_millis(100),
            max_rate_limit_pauses: 2,
        }
    }

    #[test]
    fn backoff_doubles_per_attempt() {
        let p = policy();
        assert_eq!(p.backoff(1), Duration::from_millis(100));
        assert_eq!(p.backoff(2), Duration::from_millis(200));
        assert_eq!(p.backoff(4), Duration::from_millis(800));
    }

    #[tokio::test(start_paused = true)]
    async fn one_failure_does_not_sink_the_batch() {
        let lookup = ScriptedLookup::new(Duration::from_millis(5));
        lookup.push(3, Err(LookupError::Malformed("no such system".into())));
        let adapter = EnrichmentAdapter::new(lookup, policy()).unwrap();

        let systems = refs(5);
        let report = adapter
            .fetch(FetchInput::Systems(&systems), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.outcomes.len(), 5);
        assert_eq!(report.fetched(), 4);
        assert_eq!(report.failed_malformed(), 1);
        assert!(report.outcomes[2].result.is_err());
        assert_eq!(adapter.lookup().calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrency_never_exceeds_policy() {
        let lookup = ScriptedLookup::new(Duration::from_millis(50));
        let adapter = EnrichmentAdapter::new(lookup, policy()).unwrap();
        let systems = refs(8);
        adapter
            .fetch(FetchInput::Systems(&systems), &CancellationToken::new())
            .await
            .unwrap();
        assert!(adapter.lookup().peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_retry_then_give_up() {
        let lookup = ScriptedLookup::new(Duration::ZERO);
        lookup.push(1, Err(LookupError::Transient("connect refused".into())));
        lookup.push(1, Ok(ok_patch()));
        for _ in 0..3 {
            lookup.push(2, Err(LookupError::Transient("502".into())));
        }
        let adapter = EnrichmentAdapter::new(lookup, policy()).unwrap();
        let systems = refs(2);
        let report = adapter
            .fetch(FetchInput::Systems(&systems), &CancellationToken::new())
            .await
            .unwrap();

        assert!(report.outcomes[0].result.is_ok());
        assert_eq!(
            report.outcomes[1].result,
            Err(FetchFailure::Transient {
                attempts: 3,
                message: "502".into()
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limits_do_not_consume_attempts() {
        let lookup = ScriptedLookup::new(Duration::ZERO);
        lookup.push(
            1,
            Err(LookupError::RateLimited {
                retry_after: Some(Duration::from_secs(2)),
            }),
        );
        lookup.push(1, Err(LookupError::Transient("reset".into())));
        lookup.push(1, Err(LookupError::Transient("reset".into())));
        let mut p = policy();
        p.max_concurrent = 1;
        let adapter = EnrichmentAdapter::new(lookup, p).unwrap();

        let started = Instant::now();
        let systems = refs(1);
        let report = adapter
            .fetch(FetchInput::Systems(&systems), &CancellationToken::new())
            .await
            .unwrap();

        assert!(report.outcomes[0].result.is_ok());
        assert_eq!(adapter.lookup().calls.load(Ordering::SeqCst), 4);
        assert!(started.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_requests_time_out_as_transient() {
        let lookup = ScriptedLookup::new(Duration::from_secs(5));
        let mut p = policy();
        p.max_attempts = 1;
        let adapter = EnrichmentAdapter::new(lookup, p).unwrap();
        let systems = refs(1);
        let report = adapter
            .fetch(FetchInput::Systems(&systems), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.failed_transient(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_aborts_in_flight_requests() {
        let lookup = ScriptedLookup::new(Duration::from_secs(60));
        let adapter = EnrichmentAdapter::new(lookup, policy()).unwrap();
        let systems = refs(4);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });

        let err = adapter
            .fetch(FetchInput::Systems(&systems), &cancel)
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn mismatched_patch_kind_is_malformed() {
        struct WrongKind;

        #[async_trait]
        impl SystemLookup for WrongKind {
            fn kind(&self) -> FreshnessSource {
                FreshnessSource::ResourceSites
            }

            async fn lookup(&self, _: &SystemRef) -> std::result::Result<DeltaPatch, LookupError> {
                Ok(DeltaPatch::Control(ControlPatch::default()))
            }
        }

        let adapter = EnrichmentAdapter::new(WrongKind, policy()).unwrap();
        let systems = refs(1);
        let report = adapter
            .fetch(FetchInput::Systems(&systems), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.failed_malformed(), 1);
    }
}
