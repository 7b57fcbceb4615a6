//! `run` and `trigger`: both go through the same [`Orchestrator`].

use anyhow::Result;
use clap::Args;
use forecast_verify_collectors::CollectorRegistry;
use forecast_verify_core::AppConfig;
use forecast_verify_orchestrator::{
    CycleRunner, CycleScheduler, JobKind, JobRegistry, JobStatus, Orchestrator,
};
use tracing::info;

use super::open_stores;

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// Use an in-memory store instead of PostgreSQL
    #[arg(long)]
    pub dry_run: bool,
}

#[derive(Args, Debug, Clone)]
pub struct TriggerArgs {
    /// Job to run: forecast, observation, metrics or purge
    pub job: JobKind,

    /// Use an in-memory store instead of PostgreSQL
    #[arg(long)]
    pub dry_run: bool,
}

async fn build_orchestrator(config: &AppConfig, dry_run: bool) -> Result<Orchestrator> {
    let collectors = CollectorRegistry::from_config(config)?;
    let stores = open_stores(config, dry_run).await?;
    let runner = CycleRunner::new(config, collectors, stores)?;
    Ok(Orchestrator::new(runner, JobRegistry::from_schedule(&config.schedule)))
}

/// Starts the cron scheduler and blocks until Ctrl-C.
///
/// # Errors
/// Returns an error if configuration, storage or the scheduler fail.
pub async fn run_scheduler(config: AppConfig, args: RunArgs) -> Result<()> {
    info!(
        locations = config.locations.len(),
        models = config.models.len(),
        observation_sources = config.observation_sources.len(),
        dry_run = args.dry_run,
        "Starting forecast verification daemon"
    );
    let orchestrator = build_orchestrator(&config, args.dry_run).await?;
    CycleScheduler::new(orchestrator).start().await?;
    info!("Daemon stopped");
    Ok(())
}

/// Runs one job and prints its summary.
///
/// # Errors
/// Returns an error if the job fails as a whole.
pub async fn run_trigger(config: AppConfig, args: TriggerArgs) -> Result<()> {
    let orchestrator = build_orchestrator(&config, args.dry_run).await?;

    let Some(report) = orchestrator.trigger(args.job).await? else {
        println!("{}: previous run still in progress, skipped", args.job);
        return Ok(());
    };

    println!("{}", report.summary());
    for source in report.sources() {
        println!(
            "  {:<16} {:<10} readings={:<5} skipped={:<3} failed={:<3} {:>6}ms{}",
            source.source,
            source.status.as_str(),
            source.readings,
            source.skipped_locations,
            source.failed_locations.len(),
            source.duration.as_millis(),
            source.error.as_deref().map(|e| format!("  {e}")).unwrap_or_default()
        );
    }

    if report.status() == JobStatus::Failed {
        anyhow::bail!("{} job failed for every source", args.job);
    }
    Ok(())
}
