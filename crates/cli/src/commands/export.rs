use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use clap::{Args, ValueEnum};
use forecast_verify_core::{
    AppConfig, DeviationFilter, DeviationStore, MetricFilter, MetricStore, Parameter,
};
use forecast_verify_data::CsvStorage;
use std::path::PathBuf;
use tracing::info;

use super::connect_database;

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportTable {
    Deviations,
    Metrics,
}

#[derive(Args, Debug, Clone)]
pub struct ExportArgs {
    /// Output CSV file
    #[arg(short, long)]
    pub output: PathBuf,

    #[arg(long, value_enum, default_value = "deviations")]
    pub table: ExportTable,

    #[arg(long)]
    pub location: Option<String>,

    #[arg(long)]
    pub model: Option<String>,

    #[arg(long)]
    pub parameter: Option<Parameter>,

    #[arg(long)]
    pub horizon: Option<i32>,

    /// First day included (YYYY-MM-DD, UTC)
    #[arg(long)]
    pub from: Option<NaiveDate>,

    /// First day excluded (YYYY-MM-DD, UTC)
    #[arg(long)]
    pub to: Option<NaiveDate>,
}

fn midnight(date: NaiveDate) -> DateTime<Utc> {
    date.and_time(chrono::NaiveTime::MIN).and_utc()
}

impl ExportArgs {
    fn deviation_filter(&self) -> DeviationFilter {
        DeviationFilter {
            location_id: self.location.clone(),
            model_id: self.model.clone(),
            parameter: self.parameter,
            horizon: self.horizon,
            from: self.from.map(midnight),
            to: self.to.map(midnight),
        }
    }

    fn metric_filter(&self) -> MetricFilter {
        MetricFilter {
            location_id: self.location.clone(),
            model_id: self.model.clone(),
            parameter: self.parameter,
            horizon: self.horizon,
            ..MetricFilter::default()
        }
    }
}

/// Writes the selected table to CSV.
///
/// # Errors
/// Returns an error if the database is unavailable or the file cannot be written.
pub async fn run_export(config: AppConfig, args: ExportArgs) -> Result<()> {
    let repos = connect_database(&config).await?.repositories();

    let written = match args.table {
        ExportTable::Deviations => {
            let deviations = repos.deviations.deviations(&args.deviation_filter()).await?;
            CsvStorage::write_deviations(&args.output, &deviations)
        }
        ExportTable::Metrics => {
            let metrics = repos.metrics.metrics(&args.metric_filter()).await?;
            CsvStorage::write_metrics(&args.output, &metrics)
        }
    }
    .with_context(|| format!("Export to {} failed", args.output.display()))?;

    info!(rows = written, path = %args.output.display(), "Export complete");
    println!("Wrote {written} rows to {}", args.output.display());
    Ok(())
}
