pub mod check_config;
pub mod export;
pub mod report;
pub mod run;

pub use check_config::{run_check_config, CheckConfigArgs};
pub use export::{run_export, ExportArgs};
pub use report::{run_report, ReportArgs};
pub use run::{run_scheduler, run_trigger, RunArgs, TriggerArgs};

use anyhow::{Context, Result};
use forecast_verify_core::{AppConfig, ConfigLoader};
use forecast_verify_data::{DatabaseClient, MemoryStore};
use forecast_verify_orchestrator::Stores;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Loads `Config.toml` (plus profile) from `dir`, then `FCV_` variables.
///
/// # Errors
/// Returns an error if the files cannot be read or do not deserialize.
pub fn load_config(dir: &Path, profile: Option<&str>) -> Result<AppConfig> {
    ConfigLoader::load_from(dir, profile)
}

/// Connects to PostgreSQL and ensures the schema exists.
///
/// # Errors
/// Returns an error if the connection or schema setup fails.
pub async fn connect_database(config: &AppConfig) -> Result<DatabaseClient> {
    let client = DatabaseClient::connect(&config.database)
        .await
        .context("Database unavailable")?;
    client.ensure_schema().await?;
    Ok(client)
}

/// Stores for a cycle: PostgreSQL, or memory when `dry_run` is set.
///
/// # Errors
/// Returns an error if the database cannot be reached.
pub async fn open_stores(config: &AppConfig, dry_run: bool) -> Result<Stores> {
    if dry_run {
        info!("Dry run: using in-memory store, nothing is persisted");
        return Ok(Stores::shared(Arc::new(MemoryStore::new())));
    }

    let repos = connect_database(config).await?.repositories();
    Ok(Stores {
        staging: Arc::new(repos.staging),
        deviations: Arc::new(repos.deviations),
        metrics: Arc::new(repos.metrics),
    })
}
