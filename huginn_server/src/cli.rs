use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(
    name = "huginn",
    version,
    about = "Powerplay AFK bounty-hunting spot finder for Elite Dangerous"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run one incremental refresh and print its summary as JSON.
    ///
    /// Exits non-zero when the run fails or is interrupted.
    Run,

    /// List current candidate systems.
    Candidates {
        /// Only systems marked as interesting.
        #[arg(long)]
        interested: bool,

        #[arg(long, default_value = "100")]
        limit: usize,

        /// Print JSON instead of a table.
        #[arg(long)]
        json: bool,
    },

    /// Run the refresh on a fixed interval until interrupted.
    ///
    /// Ctrl-C once lets the current run finish its stage; twice aborts it.
    Schedule {
        /// Override HUGINN_SCHEDULE_INTERVAL_MINUTES.
        #[arg(long)]
        interval_minutes: Option<u64>,

        /// Wait one interval before the first run.
        #[arg(long)]
        no_immediate: bool,
    },

    /// Set the pledged power in the operator config.
    Power {
        /// Power name, e.g. "Archon Delaine" (case-insensitive).
        name: String,
    },

    /// Print the effective configuration (database URL redacted).
    Config,

    /// Check that the catalogue and the bulk snapshot are reachable.
    Check,
}
