//! Source adapters: bulk snapshot and per-system enrichment.
//!
//! Adapters turn upstream data into `SystemDelta`s and report per-system failures.
//! Concrete adapters live in `huginn_integrations`.

pub mod enrichment;
pub mod models;
pub mod traits;

pub use enrichment::{EnrichmentAdapter, RatePolicy};
pub use models::{
    BulkPatch, ControlPatch, DeltaPatch, FetchFailure, FetchInput, FetchOutcome, FetchReport,
    ResourceSitesPatch, SystemDelta,
};
pub use traits::{LookupError, SourceAdapter, SystemLookup, TickSource};
