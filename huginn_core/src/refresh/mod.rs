//! Incremental refresh: one orchestrated run, and the loop that fires it hourly.

pub mod engine;
pub mod models;
pub mod schedule;

pub use engine::{Orchestrator, RefreshSettings};
pub use models::{
    CandidacyCounts, RunControl, RunError, RunStage, RunStatus, RunSummary, SourceCounts,
};
pub use schedule::{FireOutcome, RefreshRunner, ScheduleSettings, SchedulerLoop};
