//! Huginn core: catalogue, staleness, candidacy and the incremental refresh pipeline.

pub mod candidacy;
pub mod catalogue;
pub mod clock;
pub mod config;
pub mod error;
pub mod models;
pub mod o11y;
pub mod refresh;
pub mod sources;
pub mod staleness;

pub use candidacy::models::{CandidacyConfig, CandidacyReason, CandidacyVerdict};
pub use catalogue::{CatalogueStore, MemoryCatalogue, SqliteCatalogue, SystemFilter};
pub use clock::{Clock, FixedClock, SystemClock};
pub use config::{AppConfig, OperatorConfig, RunConfig};
pub use error::{Error, Result};
pub use models::{Coords, FreshnessSource, ResourceTier, System, SystemId, SystemSeed};
pub use refresh::{Orchestrator, RunControl, RunSummary, SchedulerLoop};
pub use staleness::StalenessTracker;
