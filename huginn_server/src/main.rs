use clap::Parser;
use huginn_core::catalogue::{CatalogueStore, ListQuery, SystemFilter};
use huginn_core::clock::SystemClock;
use huginn_core::config::{
    AppConfig, FileConfigSource, KNOWN_POWERS, OperatorConfigSource, canonical_power,
};
use huginn_core::o11y::{self, LogFormat};
use huginn_core::refresh::{RunControl, RunStatus, RunSummary, SchedulerLoop};
use huginn_integrations::spansh::SpanshSnapshot;
use huginn_server::cli::{Cli, Commands};
use huginn_server::wiring;
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    o11y::init_global(LogFormat::from_env()?)?;
    let cli = Cli::parse();
    let app = AppConfig::from_env()?;
    let operator = FileConfigSource::new(&app.operator_config_path);

    match cli.command {
        Commands::Run => {
            let run_cfg = match operator.load().await.and_then(|c| c.to_run_config()) {
                Ok(cfg) => cfg,
                Err(e) => {
                    tracing::error!(error = %e, "operator configuration rejected; run not started");
                    print_summary(&wiring::rejected_run_summary(&e, &SystemClock))?;
                    return Ok(ExitCode::FAILURE);
                }
            };
            let store = wiring::connect_store(&app).await?;
            let orch = wiring::build_orchestrator(&app, store)?;
            let control = RunControl::new();
            let (stop, abort) = (control.stop.clone(), control.abort.clone());
            tokio::spawn(two_phase_interrupt(stop, abort));

            match orch.run(&run_cfg, &control).await {
                Ok(summary) => {
                    print_summary(&summary)?;
                    Ok(exit_for(summary.status))
                }
                Err(err) => {
                    tracing::error!(stage = %err.stage, error = %err.source, "refresh run failed");
                    print_summary(&err.summary)?;
                    Ok(ExitCode::FAILURE)
                }
            }
        }
        Commands::Candidates {
            interested,
            limit,
            json,
        } => {
            let store = wiring::connect_store(&app).await?;
            let filter = SystemFilter {
                interested: interested.then_some(true),
                ..SystemFilter::candidates()
            };
            let systems = store
                .list_systems(&filter, ListQuery { limit, offset: 0 })
                .await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&systems)?);
                return Ok(ExitCode::SUCCESS);
            }
            println!(
                "{:<24} {:>18} {:<22} {:<12} {:<10}",
                "name", "id64", "power", "state", "tier"
            );
            for s in &systems {
                let tier = s
                    .metadata
                    .dominant_tier
                    .map(|t| t.to_string())
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "{:<24} {:>18} {:<22} {:<12} {:<10}",
                    s.name,
                    s.id,
                    s.power.as_deref().unwrap_or("-"),
                    s.control_state
                        .as_ref()
                        .map(|c| c.to_string())
                        .unwrap_or_else(|| "-".to_string()),
                    tier
                );
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Schedule {
            interval_minutes,
            no_immediate,
        } => {
            if !operator.load().await?.enable_periodical_update {
                tracing::warn!(
                    path = %operator.path().display(),
                    "enable_periodical_update is false; firings will be skipped until it is set"
                );
            }
            let store = wiring::connect_store(&app).await?;
            let orch = wiring::build_orchestrator(&app, store)?;
            let settings = wiring::schedule_settings(&app, interval_minutes, !no_immediate);
            let scheduler = SchedulerLoop::new(Arc::new(orch), Arc::new(operator), settings)?;

            let shutdown = CancellationToken::new();
            let force = CancellationToken::new();
            tokio::spawn(two_phase_interrupt(shutdown.clone(), force.clone()));
            scheduler.run_loop(shutdown, force).await?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Power { name } => {
            let Some(power) = canonical_power(&name) else {
                eprintln!("unknown power '{name}'. Known powers:");
                for p in KNOWN_POWERS {
                    eprintln!("  {p}");
                }
                return Ok(ExitCode::FAILURE);
            };
            let mut cfg = operator.load().await?;
            cfg.pledged_power = Some(power.to_string());
            operator.save(&cfg).await?;
            tracing::info!(power, path = %operator.path().display(), "pledged power updated");
            Ok(ExitCode::SUCCESS)
        }
        Commands::Config => {
            let cfg = operator.load().await?;
            println!("database_url = {}", wiring::redact_url(&app.database_url));
            println!("data_dir = {}", app.data_dir.display());
            println!("operator_config = {}", operator.path().display());
            println!("snapshot_path = {}", app.snapshot_path.display());
            println!(
                "control_api_url = {}",
                app.control_api_url.as_deref().unwrap_or("(disabled)")
            );
            println!(
                "resource_api_url = {}",
                app.resource_api_url.as_deref().unwrap_or("(disabled)")
            );
            println!(
                "tick_api_url = {}",
                app.tick_api_url.as_deref().unwrap_or("(disabled)")
            );
            println!("batch_size = {}", app.batch_size);
            println!(
                "enrich_limit = {}",
                app.enrich_limit
                    .map(|n| n.to_string())
                    .unwrap_or_else(|| "unlimited".to_string())
            );
            println!(
                "schedule_interval_minutes = {}",
                app.schedule_interval.as_secs() / 60
            );
            println!("{}", serde_json::to_string_pretty(&cfg)?);
            if let Err(e) = cfg.to_run_config() {
                eprintln!("operator config is not runnable: {e}");
                return Ok(ExitCode::FAILURE);
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Check => {
            let mut healthy = true;
            match wiring::connect_store(&app).await {
                Ok(store) => match store.ping().await {
                    Ok(()) => {
                        let total = store.count_systems(&SystemFilter::default()).await?;
                        println!("catalogue: ok ({total} systems)");
                    }
                    Err(e) => {
                        healthy = false;
                        println!("catalogue: unreachable ({e})");
                    }
                },
                Err(e) => {
                    healthy = false;
                    println!("catalogue: cannot connect ({e})");
                }
            }
            match SpanshSnapshot::new(&app.snapshot_path).resolve() {
                Ok(path) => println!("snapshot: {}", path.display()),
                Err(e) => {
                    healthy = false;
                    println!("snapshot: {e}");
                }
            }
            Ok(if healthy {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
    }
}

/// First Ctrl-C cancels `first`, the second cancels `second`.
async fn two_phase_interrupt(first: CancellationToken, second: CancellationToken) {
    if tokio::signal::ctrl_c().await.is_err() {
        return;
    }
    tracing::warn!("interrupt received; finishing the current stage (Ctrl-C again to abort)");
    first.cancel();
    if tokio::signal::ctrl_c().await.is_err() {
        return;
    }
    tracing::warn!("second interrupt; aborting in-flight work");
    second.cancel();
}

fn print_summary(summary: &RunSummary) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(summary)?);
    Ok(())
}

fn exit_for(status: RunStatus) -> ExitCode {
    match status {
        RunStatus::Succeeded => ExitCode::SUCCESS,
        RunStatus::Running | RunStatus::Failed | RunStatus::Cancelled => ExitCode::FAILURE,
    }
}
