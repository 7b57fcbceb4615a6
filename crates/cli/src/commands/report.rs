use anyhow::Result;
use clap::Args;
use forecast_verify_analysis::compute_metrics;
use forecast_verify_core::{
    AppConfig, Confidence, DeviationFilter, DeviationStore, MetricFilter, MetricStore,
    MetricsFormatter, Parameter, TimeBucket,
};

use super::connect_database;

#[derive(Args, Debug, Clone)]
pub struct ReportArgs {
    #[arg(long)]
    pub location: Option<String>,

    #[arg(long)]
    pub model: Option<String>,

    /// wind_speed, wind_gust, wind_direction or temperature
    #[arg(long)]
    pub parameter: Option<Parameter>,

    /// Nominal horizon in hours
    #[arg(long)]
    pub horizon: Option<i32>,

    /// all, month or week
    #[arg(long)]
    pub bucket: Option<TimeBucket>,

    /// Hide metrics below this confidence (insufficient, preliminary, validated)
    #[arg(long)]
    pub min_confidence: Option<Confidence>,

    /// Compute from deviations now instead of reading stored metrics
    #[arg(long)]
    pub live: bool,
}

impl ReportArgs {
    #[must_use]
    pub fn filter(&self) -> MetricFilter {
        MetricFilter {
            location_id: self.location.clone(),
            model_id: self.model.clone(),
            parameter: self.parameter,
            horizon: self.horizon,
            time_bucket: self.bucket,
            min_confidence: self.min_confidence,
        }
    }

    fn deviation_filter(&self) -> DeviationFilter {
        DeviationFilter {
            location_id: self.location.clone(),
            model_id: self.model.clone(),
            parameter: self.parameter,
            horizon: self.horizon,
            from: None,
            to: None,
        }
    }
}

/// Prints the accuracy report.
///
/// # Errors
/// Returns an error if the database is unavailable.
pub async fn run_report(config: AppConfig, args: ReportArgs) -> Result<()> {
    let repos = connect_database(&config).await?.repositories();
    let filter = args.filter();

    let metrics = if args.live {
        let deviations = repos.deviations.deviations(&args.deviation_filter()).await?;
        compute_metrics(&deviations, args.bucket.unwrap_or_default())
            .into_iter()
            .filter(|m| filter.matches(m))
            .collect()
    } else {
        repos.metrics.metrics(&filter).await?
    };

    print!("{}", MetricsFormatter::format(&metrics));
    Ok(())
}
