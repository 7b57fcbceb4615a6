use crate::error::ConfigurationError;
use crate::horizon::{HorizonBucket, HorizonSet};
use crate::parameter::Parameter;
use crate::reading::Location;
use crate::runs::RunSchedule;
use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub matching: MatchingConfig,
    #[serde(default = "default_horizons")]
    pub horizons: Vec<HorizonBucket>,
    #[serde(default)]
    pub locations: Vec<Location>,
    #[serde(default)]
    pub models: Vec<ModelConfig>,
    #[serde(default)]
    pub observation_sources: Vec<ObservationSourceConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

/// Cron cadence of one job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSchedule {
    /// Six-field cron expression (seconds first)
    pub cron: String,
    /// Expected period between runs; a cycle taking longer is an anomaly
    pub expected_period_minutes: u64,
}

impl JobSchedule {
    fn new(cron: &str, expected_period_minutes: u64) -> Self {
        Self {
            cron: cron.to_string(),
            expected_period_minutes,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    pub forecast: JobSchedule,
    pub observation: JobSchedule,
    pub metrics: JobSchedule,
    pub purge: JobSchedule,
    /// Upper bound on one source call within a cycle
    pub source_timeout_secs: u64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            // Four times a day, after the 00/06/12/18z publications
            forecast: JobSchedule::new("0 30 3,9,15,21 * * *", 360),
            // Six times a day over daylight hours
            observation: JobSchedule::new("0 15 7,9,11,13,15,17 * * *", 120),
            metrics: JobSchedule::new("0 0 2 * * *", 1440),
            purge: JobSchedule::new("0 45 * * * *", 60),
            source_timeout_secs: 120,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchingConfig {
    /// Maximum distance between target time and observed time
    pub tolerance_minutes: i64,
    /// Staged forecasts older than this (by target time) are discarded
    pub retention_hours: i64,
    /// How far back an observation cycle looks
    pub observation_lookback_hours: i64,
}

impl MatchingConfig {
    #[must_use]
    pub fn tolerance(&self) -> Duration {
        Duration::minutes(self.tolerance_minutes)
    }

    #[must_use]
    pub fn retention(&self) -> Duration {
        Duration::hours(self.retention_hours)
    }
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            tolerance_minutes: 30,
            retention_hours: 72,
            observation_lookback_hours: 6,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub requests_per_minute: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Attempts after the first call
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 500,
            max_delay_ms: 30_000,
        }
    }
}

/// Latitude/longitude box covered by a gridded product.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GridBounds {
    pub lat_min: f64,
    pub lat_max: f64,
    pub lon_min: f64,
    pub lon_max: f64,
}

impl GridBounds {
    #[must_use]
    pub fn contains(&self, latitude: f64, longitude: f64) -> bool {
        latitude >= self.lat_min
            && latitude <= self.lat_max
            && longitude >= self.lon_min
            && longitude <= self.lon_max
    }
}

/// One downloadable slice of a gridded run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GridSegment {
    pub name: String,
    /// Path appended to the base URL; `{date}` and `{hour}` expand from the run time
    pub path: String,
    /// Lead times (hours) the segment carries
    pub steps: Vec<i64>,
}

/// How a model's forecasts are fetched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ForecastBinding {
    OpenMeteo {
        #[serde(default = "default_open_meteo_url")]
        base_url: String,
        /// Upstream model name (e.g. "meteofrance_arome_france")
        model: String,
        /// Data domain whose `static/meta.json` names the run being served
        /// (e.g. "meteofrance_arome_france0025"). Unset skips the check.
        #[serde(default)]
        domain: Option<String>,
    },
    MetNorway {
        #[serde(default = "default_met_norway_url")]
        base_url: String,
        user_agent: String,
    },
    Grid {
        base_url: String,
        segments: Vec<GridSegment>,
        bounds: GridBounds,
    },
}

impl ForecastBinding {
    /// Source id the binding's collector reports.
    #[must_use]
    pub fn source_id(&self) -> &'static str {
        match self {
            ForecastBinding::OpenMeteo { .. } => "open_meteo",
            ForecastBinding::MetNorway { .. } => "met_norway",
            ForecastBinding::Grid { .. } => "grid",
        }
    }

    /// True when both bindings serve the same upstream model, so one can
    /// stand in for the other without mixing models under one id.
    #[must_use]
    pub fn same_upstream(&self, other: &ForecastBinding) -> bool {
        match (self, other) {
            (ForecastBinding::OpenMeteo { model: a, .. }, ForecastBinding::OpenMeteo { model: b, .. }) => a == b,
            (ForecastBinding::MetNorway { .. }, ForecastBinding::MetNorway { .. })
            | (ForecastBinding::Grid { .. }, ForecastBinding::Grid { .. }) => true,
            _ => false,
        }
    }
}

/// How a source's observations are fetched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ObservationBinding {
    Pioupiou {
        #[serde(default = "default_pioupiou_url")]
        base_url: String,
    },
    StationPage {
        /// Page URL; `{station}` expands to the location's station id
        url_template: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub id: String,
    pub name: String,
    pub collector: ForecastBinding,
    #[serde(default)]
    pub runs: RunSchedule,
    pub parameters: Vec<Parameter>,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub fallback: Option<ForecastBinding>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservationSourceConfig {
    pub id: String,
    pub name: String,
    pub collector: ObservationBinding,
    pub parameters: Vec<Parameter>,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub fallback: Option<ObservationBinding>,
}

impl AppConfig {
    /// Validated horizon set.
    ///
    /// # Errors
    /// Returns [`ConfigurationError`] if the buckets are empty or overlap.
    pub fn horizon_set(&self) -> Result<HorizonSet, ConfigurationError> {
        HorizonSet::new(self.horizons.clone())
    }

    /// Checks reference data before any collector is registered.
    ///
    /// # Errors
    /// Returns the first [`ConfigurationError`] found: empty or duplicate ids,
    /// coordinates out of range, overlapping horizon bands, invalid run
    /// schedules, locations outside a grid's coverage, or locations without a
    /// station id for an observation source.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        self.horizon_set()?;

        if self.matching.tolerance_minutes <= 0 {
            return Err(ConfigurationError::new("matching tolerance must be positive"));
        }
        if self.matching.retention_hours <= 0 || self.matching.observation_lookback_hours <= 0 {
            return Err(ConfigurationError::new(
                "retention and observation lookback must be positive",
            ));
        }

        check_ids("location", self.locations.iter().map(|l| l.id.as_str()))?;
        check_ids("model", self.models.iter().map(|m| m.id.as_str()))?;
        check_ids(
            "observation source",
            self.observation_sources.iter().map(|s| s.id.as_str()),
        )?;

        for location in &self.locations {
            if !(-90.0..=90.0).contains(&location.latitude)
                || !(-180.0..=180.0).contains(&location.longitude)
            {
                return Err(ConfigurationError::new(format!(
                    "location {} has coordinates out of range ({}, {})",
                    location.id, location.latitude, location.longitude
                )));
            }
        }

        for model in &self.models {
            if model.parameters.is_empty() {
                return Err(ConfigurationError::new(format!(
                    "model {} enables no parameters",
                    model.id
                )));
            }
            model.runs.validate(&model.id)?;
            for binding in std::iter::once(&model.collector).chain(model.fallback.iter()) {
                self.check_forecast_binding(&model.id, binding)?;
            }
            if let Some(fallback) = &model.fallback {
                if !fallback.same_upstream(&model.collector) {
                    return Err(ConfigurationError::new(format!(
                        "model {}: fallback {} does not serve the same upstream model as {}",
                        model.id,
                        fallback.source_id(),
                        model.collector.source_id()
                    )));
                }
            }
        }

        for source in &self.observation_sources {
            if source.parameters.is_empty() {
                return Err(ConfigurationError::new(format!(
                    "observation source {} enables no parameters",
                    source.id
                )));
            }
            for location in &self.locations {
                if location.station_for(&source.id).is_none() {
                    return Err(ConfigurationError::new(format!(
                        "location {} has no station id for observation source {}",
                        location.id, source.id
                    )));
                }
            }
        }

        Ok(())
    }

    fn check_forecast_binding(
        &self,
        model_id: &str,
        binding: &ForecastBinding,
    ) -> Result<(), ConfigurationError> {
        match binding {
            ForecastBinding::Grid {
                segments, bounds, ..
            } => {
                if segments.is_empty() {
                    return Err(ConfigurationError::new(format!(
                        "grid model {model_id} declares no segments"
                    )));
                }
                for location in &self.locations {
                    if !bounds.contains(location.latitude, location.longitude) {
                        return Err(ConfigurationError::new(format!(
                            "location {} is outside the grid coverage of model {model_id}",
                            location.id
                        )));
                    }
                }
            }
            ForecastBinding::MetNorway { user_agent, .. } if user_agent.trim().is_empty() => {
                return Err(ConfigurationError::new(format!(
                    "model {model_id}: MET Norway requires an identifying user agent"
                )));
            }
            _ => {}
        }
        Ok(())
    }
}

fn check_ids<'a>(kind: &str, ids: impl Iterator<Item = &'a str>) -> Result<(), ConfigurationError> {
    let mut seen = HashSet::new();
    for id in ids {
        if id.trim().is_empty() {
            return Err(ConfigurationError::new(format!("{kind} id must not be empty")));
        }
        if !seen.insert(id) {
            return Err(ConfigurationError::new(format!("duplicate {kind} id '{id}'")));
        }
    }
    Ok(())
}

fn default_max_connections() -> u32 {
    10
}

fn default_horizons() -> Vec<HorizonBucket> {
    HorizonSet::default().buckets().to_vec()
}

fn default_open_meteo_url() -> String {
    "https://api.open-meteo.com".to_string()
}

fn default_met_norway_url() -> String {
    "https://api.met.no/weatherapi/locationforecast/2.0".to_string()
}

fn default_pioupiou_url() -> String {
    "https://api.pioupiou.fr/v1".to_string()
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: "postgresql://localhost/forecast_verify".to_string(),
                max_connections: default_max_connections(),
            },
            schedule: ScheduleConfig::default(),
            matching: MatchingConfig::default(),
            horizons: default_horizons(),
            locations: Vec::new(),
            models: Vec::new(),
            observation_sources: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> AppConfig {
        let mut config = AppConfig::default();
        config.locations = vec![
            Location::new("planfait", "Col de la Forclaz", 45.81, 6.25).with_station("pioupiou", "110"),
            Location::new("semnoz", "Semnoz", 45.80, 6.10).with_station("pioupiou", "385"),
        ];
        config.models = vec![ModelConfig {
            id: "arome".into(),
            name: "AROME".into(),
            collector: ForecastBinding::Grid {
                base_url: "https://grid.example".into(),
                segments: vec![GridSegment {
                    name: "sp1_00H06H".into(),
                    path: "{date}/{hour}/SP1_00H06H.grib2".into(),
                    steps: vec![0, 1, 2, 3, 4, 5, 6],
                }],
                bounds: GridBounds {
                    lat_min: 37.5,
                    lat_max: 55.4,
                    lon_min: -12.0,
                    lon_max: 16.0,
                },
            },
            runs: RunSchedule::default(),
            parameters: vec![Parameter::WindSpeed],
            rate_limit: RateLimitConfig::default(),
            retry: RetryConfig::default(),
            fallback: None,
        }];
        config.observation_sources = vec![ObservationSourceConfig {
            id: "pioupiou".into(),
            name: "Pioupiou".into(),
            collector: ObservationBinding::Pioupiou {
                base_url: default_pioupiou_url(),
            },
            parameters: vec![Parameter::WindSpeed],
            rate_limit: RateLimitConfig::default(),
            retry: RetryConfig::default(),
            fallback: None,
        }];
        config
    }

    #[test]
    fn test_sample_config_is_valid() {
        assert!(sample().validate().is_ok());
    }

    #[test]
    fn test_duplicate_location_rejected() {
        let mut config = sample();
        config.locations[1].id = "planfait".into();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate location id"));
    }

    #[test]
    fn test_location_outside_grid_rejected() {
        let mut config = sample();
        config.locations.push(Location::new("tenerife", "Teide", 28.27, -16.64).with_station("pioupiou", "1"));
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("outside the grid coverage"));
    }

    #[test]
    fn test_missing_station_rejected() {
        let mut config = sample();
        config.locations[0].stations.clear();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("no station id"));
    }

    #[test]
    fn test_bad_coordinates_rejected() {
        let mut config = sample();
        config.locations[0].latitude = 123.0;
        assert!(config.validate().is_err());
    }

    fn open_meteo(base_url: &str, model: &str) -> ForecastBinding {
        ForecastBinding::OpenMeteo {
            base_url: base_url.into(),
            model: model.into(),
            domain: None,
        }
    }

    #[test]
    fn test_fallback_from_another_model_rejected() {
        let mut config = sample();
        config.models[0].collector = open_meteo("https://api.open-meteo.com", "meteofrance_arome_france");
        config.models[0].fallback = Some(ForecastBinding::MetNorway {
            base_url: default_met_norway_url(),
            user_agent: "forecast-verify/0.1 ops@example.org".into(),
        });
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("same upstream model"));

        config.models[0].fallback = Some(open_meteo("https://mirror.example", "icon_d2"));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_fallback_mirror_of_same_model_accepted() {
        let mut config = sample();
        config.models[0].collector = open_meteo("https://api.open-meteo.com", "meteofrance_arome_france");
        config.models[0].fallback = Some(open_meteo("https://mirror.example", "meteofrance_arome_france"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_binding_deserializes_from_tagged_toml_shape() {
        let json = r#"{"kind":"open_meteo","model":"icon_d2"}"#;
        let binding: ForecastBinding = serde_json::from_str(json).unwrap();
        assert_eq!(binding.source_id(), "open_meteo");
        match binding {
            ForecastBinding::OpenMeteo { base_url, model, domain } => {
                assert_eq!(base_url, "https://api.open-meteo.com");
                assert_eq!(model, "icon_d2");
                assert!(domain.is_none());
            }
            other => panic!("unexpected binding {other:?}"),
        }
    }
}
