//! `check-config`: validates configuration and collector registration
//! without touching the network or the database.

#![allow(clippy::format_push_string)]

use anyhow::Result;
use clap::Args;
use forecast_verify_collectors::CollectorRegistry;
use forecast_verify_core::{AppConfig, ForecastBinding};

#[derive(Args, Debug, Clone)]
pub struct CheckConfigArgs {
    /// Also print every location with its station ids
    #[arg(long)]
    pub verbose: bool,
}

/// Validates `config`, builds every collector and returns a summary.
///
/// # Errors
/// Returns the first configuration error.
pub fn summarize(config: &AppConfig, verbose: bool) -> Result<String> {
    let registry = CollectorRegistry::from_config(config)?;
    let horizons = config.horizon_set()?;

    let mut out = String::new();
    out.push_str("Configuration OK\n");
    out.push_str(&format!(
        "  horizons: {}\n",
        horizons
            .buckets()
            .iter()
            .map(|b| format!("{}h±{}", b.hours, b.band_hours))
            .collect::<Vec<_>>()
            .join(", ")
    ));
    out.push_str(&format!(
        "  matching: tolerance {} min, retention {} h, lookback {} h\n",
        config.matching.tolerance_minutes,
        config.matching.retention_hours,
        config.matching.observation_lookback_hours
    ));
    out.push_str(&format!("  locations: {}\n", config.locations.len()));
    if verbose {
        for location in &config.locations {
            let mut stations: Vec<String> = location
                .stations
                .iter()
                .map(|(source, station)| format!("{source}={station}"))
                .collect();
            stations.sort();
            out.push_str(&format!(
                "    {:<16} {:>8.4} {:>9.4}  {}\n",
                location.id,
                location.latitude,
                location.longitude,
                stations.join(" ")
            ));
        }
    }

    out.push_str(&format!("  models: {}\n", registry.models().len()));
    for model in registry.models() {
        let binding = match &model.config.collector {
            ForecastBinding::Grid { segments, .. } => format!("grid ({} segments)", segments.len()),
            other => other.source_id().to_string(),
        };
        let fallback = model
            .config
            .fallback
            .as_ref()
            .map(|f| format!(", fallback {}", f.source_id()))
            .unwrap_or_default();
        out.push_str(&format!("    {:<16} {binding}{fallback}\n", model.config.id));
    }

    out.push_str(&format!("  observation sources: {}\n", registry.sources().len()));
    for source in registry.sources() {
        out.push_str(&format!("    {:<16} {}\n", source.config.id, source.config.name));
    }

    let schedule = &config.schedule;
    for (job, cadence) in [
        ("forecast", &schedule.forecast),
        ("observation", &schedule.observation),
        ("metrics", &schedule.metrics),
        ("purge", &schedule.purge),
    ] {
        out.push_str(&format!(
            "  {job:<12} cron '{}' (expected every {} min)\n",
            cadence.cron, cadence.expected_period_minutes
        ));
    }
    Ok(out)
}

/// # Errors
/// Returns the first configuration error.
pub fn run_check_config(config: &AppConfig, args: &CheckConfigArgs) -> Result<()> {
    print!("{}", summarize(config, args.verbose)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use forecast_verify_core::{Location, ModelConfig, Parameter, RunSchedule};

    fn config() -> AppConfig {
        let mut config = AppConfig::default();
        config.locations = vec![Location::new("planfait", "Planfait", 45.85, 6.22)];
        config.models = vec![ModelConfig {
            id: "icon_d2".into(),
            name: "ICON-D2".into(),
            collector: ForecastBinding::OpenMeteo {
                base_url: "https://api.open-meteo.com".into(),
                model: "icon_d2".into(),
                domain: None,
            },
            runs: RunSchedule::default(),
            parameters: vec![Parameter::WindSpeed],
            rate_limit: Default::default(),
            retry: Default::default(),
            fallback: None,
        }];
        config
    }

    #[test]
    fn test_summary_lists_models_and_jobs() {
        let summary = summarize(&config(), true).unwrap();
        assert!(summary.starts_with("Configuration OK"));
        assert!(summary.contains("icon_d2"));
        assert!(summary.contains("open_meteo"));
        assert!(summary.contains("planfait"));
        assert!(summary.contains("observation  cron"));
    }

    #[test]
    fn test_invalid_config_is_reported() {
        let mut config = config();
        config.locations.push(Location::new("planfait", "Duplicate", 45.0, 6.0));
        assert!(summarize(&config, false).is_err());
    }
}
