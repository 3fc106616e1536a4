use crate::Result;
use crate::models::{FreshnessSource, SystemRef};
use crate::sources::models::{DeltaPatch, FetchInput, FetchReport};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// A producer of per-system deltas for one data source.
///
/// Adapters never write to the catalogue; the orchestrator merges what they return.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn kind(&self) -> FreshnessSource;

    /// Fetch deltas for `input`.
    ///
    /// Per-system failures are reported in the returned `FetchReport`. An `Err` means
    /// the whole call failed (unreadable snapshot, cancellation).
    async fn fetch(&self, input: FetchInput<'_>, cancel: &CancellationToken)
    -> Result<FetchReport>;
}

/// Failure classes for one upstream request.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum LookupError {
    #[error("transient: {0}")]
    Transient(String),

    #[error("malformed: {0}")]
    Malformed(String),

    #[error("rate limited")]
    RateLimited { retry_after: Option<Duration> },
}

/// A single-system request against an enrichment service.
///
/// Implementations issue exactly one logical request per call and classify the
/// outcome; retries, pacing and timeouts are the caller's job.
#[async_trait]
pub trait SystemLookup: Send + Sync {
    fn kind(&self) -> FreshnessSource;

    async fn lookup(&self, system: &SystemRef) -> std::result::Result<DeltaPatch, LookupError>;
}

/// Reports the most recent background-simulation tick.
///
/// Control data stamped at or before the latest tick is treated as stale.
#[async_trait]
pub trait TickSource: Send + Sync {
    /// `Ok(None)` when the service has no tick to report.
    async fn latest_tick(&self) -> Result<Option<DateTime<Utc>>>;
}
