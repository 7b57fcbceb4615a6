//! Collector registry: builds every configured collector once at startup.
//!
//! Registration is where unresolvable configuration surfaces (locations
//! outside a grid, missing station ids, zero rate limits) so the scheduler
//! never starts with a collector that cannot work.

use crate::grid::GridForecastCollector;
use crate::met_norway::MetNorwayCollector;
use crate::open_meteo::OpenMeteoCollector;
use crate::pioupiou::PioupiouCollector;
use crate::resilience::{
    FallbackForecastCollector, FallbackObservationCollector, ResilientClient, RetryPolicy,
};
use crate::station_page::StationPageCollector;
use forecast_verify_core::{
    AppConfig, ConfigurationError, ForecastBinding, ForecastCollector, HorizonSet, ModelConfig,
    ObservationBinding, ObservationCollector, ObservationSourceConfig,
};
use std::sync::Arc;
use tracing::{info, warn};

/// A model and the collector serving it.
#[derive(Clone)]
pub struct RegisteredModel {
    pub config: ModelConfig,
    pub collector: Arc<dyn ForecastCollector>,
}

/// An observation source and the collector serving it.
#[derive(Clone)]
pub struct RegisteredSource {
    pub config: ObservationSourceConfig,
    pub collector: Arc<dyn ObservationCollector>,
}

#[derive(Clone, Default)]
pub struct CollectorRegistry {
    models: Vec<RegisteredModel>,
    sources: Vec<RegisteredSource>,
}

impl std::fmt::Debug for CollectorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CollectorRegistry")
            .field("models", &self.models.iter().map(|m| m.config.id.as_str()).collect::<Vec<_>>())
            .field("sources", &self.sources.iter().map(|s| s.config.id.as_str()).collect::<Vec<_>>())
            .finish()
    }
}

impl CollectorRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Validates `config` and builds a collector (with optional fallback) for
    /// every model and observation source.
    ///
    /// # Errors
    /// Returns [`ConfigurationError`] if validation fails or a collector
    /// cannot be constructed.
    pub fn from_config(config: &AppConfig) -> Result<Self, ConfigurationError> {
        config.validate()?;
        let horizons = config.horizon_set()?;
        let mut registry = Self::new();

        for model in &config.models {
            let primary = build_forecast(model, &model.collector, &horizons)?;
            let collector = match &model.fallback {
                Some(binding) => Arc::new(FallbackForecastCollector::new(
                    primary,
                    build_forecast(model, binding, &horizons)?,
                )) as Arc<dyn ForecastCollector>,
                None => primary,
            };
            registry.register_model(model.clone(), collector);
        }

        for source in &config.observation_sources {
            let primary = build_observation(source, &source.collector)?;
            let collector = match &source.fallback {
                Some(binding) => Arc::new(FallbackObservationCollector::new(
                    primary,
                    build_observation(source, binding)?,
                )) as Arc<dyn ObservationCollector>,
                None => primary,
            };
            registry.register_source(source.clone(), collector);
        }

        info!(
            models = registry.models.len(),
            sources = registry.sources.len(),
            "Collectors registered"
        );
        Ok(registry)
    }

    /// Registers a model; an existing entry with the same id is replaced.
    pub fn register_model(&mut self, config: ModelConfig, collector: Arc<dyn ForecastCollector>) {
        self.models.retain(|m| m.config.id != config.id);
        self.models.push(RegisteredModel { config, collector });
    }

    /// Registers an observation source; an existing entry with the same id is replaced.
    pub fn register_source(&mut self, config: ObservationSourceConfig, collector: Arc<dyn ObservationCollector>) {
        self.sources.retain(|s| s.config.id != config.id);
        self.sources.push(RegisteredSource { config, collector });
    }

    #[must_use]
    pub fn models(&self) -> &[RegisteredModel] {
        &self.models
    }

    #[must_use]
    pub fn sources(&self) -> &[RegisteredSource] {
        &self.sources
    }

    #[must_use]
    pub fn model(&self, id: &str) -> Option<&RegisteredModel> {
        self.models.iter().find(|m| m.config.id == id)
    }

    #[must_use]
    pub fn source(&self, id: &str) -> Option<&RegisteredSource> {
        self.sources.iter().find(|s| s.config.id == id)
    }
}

fn build_forecast(
    model: &ModelConfig,
    binding: &ForecastBinding,
    horizons: &HorizonSet,
) -> Result<Arc<dyn ForecastCollector>, ConfigurationError> {
    let client = ResilientClient::new(binding.source_id(), &model.rate_limit, RetryPolicy::from(&model.retry))?;
    let parameters = model.parameters.clone();

    let collector: Arc<dyn ForecastCollector> = match binding {
        ForecastBinding::OpenMeteo { base_url, model: upstream, domain } => {
            if domain.is_none() {
                warn!(model = %model.id, "No Open-Meteo data domain configured; served run is not verified");
            }
            Arc::new(
                OpenMeteoCollector::new(client, base_url.clone(), model.id.clone(), upstream.clone(), parameters)
                    .with_run_metadata(domain.clone()),
            )
        }
        ForecastBinding::MetNorway { base_url, user_agent } => Arc::new(MetNorwayCollector::new(
            client.with_user_agent(user_agent.clone()),
            base_url.clone(),
            model.id.clone(),
            parameters,
        )),
        ForecastBinding::Grid { base_url, segments, .. } => Arc::new(GridForecastCollector::new(
            client,
            base_url.clone(),
            model.id.clone(),
            segments.clone(),
            parameters,
            horizons.clone(),
        )),
    };
    Ok(collector)
}

fn build_observation(
    source: &ObservationSourceConfig,
    binding: &ObservationBinding,
) -> Result<Arc<dyn ObservationCollector>, ConfigurationError> {
    // Fallback renderings share the source id so station ids resolve the same way
    let client = ResilientClient::new(source.id.clone(), &source.rate_limit, RetryPolicy::from(&source.retry))?;
    let parameters = source.parameters.clone();

    let collector: Arc<dyn ObservationCollector> = match binding {
        ObservationBinding::Pioupiou { base_url } => {
            Arc::new(PioupiouCollector::new(client, base_url.clone(), parameters))
        }
        ObservationBinding::StationPage { url_template } => {
            Arc::new(StationPageCollector::new(client, url_template.clone(), parameters))
        }
    };
    Ok(collector)
}

#[cfg(test)]
mod tests {
    use super::*;
    use forecast_verify_core::{
        GridBounds, GridSegment, Location, Parameter, RateLimitConfig, RetryConfig, RunSchedule,
    };

    fn config() -> AppConfig {
        let mut config = AppConfig::default();
        config.locations = vec![
            Location::new("planfait", "Planfait", 45.81, 6.25).with_station("beacons", "110"),
            Location::new("semnoz", "Semnoz", 45.80, 6.10).with_station("beacons", "385"),
        ];
        config.models = vec![
            ModelConfig {
                id: "arome".into(),
                name: "AROME".into(),
                collector: ForecastBinding::Grid {
                    base_url: "https://grid.example".into(),
                    segments: vec![GridSegment {
                        name: "SP1".into(),
                        path: "{date}/{hour}/SP1.grib2".into(),
                        steps: vec![0, 6],
                    }],
                    bounds: GridBounds { lat_min: 37.5, lat_max: 55.4, lon_min: -12.0, lon_max: 16.0 },
                },
                runs: RunSchedule::default(),
                parameters: vec![Parameter::WindSpeed],
                rate_limit: RateLimitConfig::default(),
                retry: RetryConfig::default(),
                fallback: Some(ForecastBinding::Grid {
                    base_url: "https://grid-mirror.example".into(),
                    segments: vec![GridSegment {
                        name: "SP1".into(),
                        path: "{date}/{hour}/SP1.grib2".into(),
                        steps: vec![0, 6],
                    }],
                    bounds: GridBounds { lat_min: 37.5, lat_max: 55.4, lon_min: -12.0, lon_max: 16.0 },
                }),
            },
            ModelConfig {
                id: "met_nordic".into(),
                name: "MET Nordic".into(),
                collector: ForecastBinding::MetNorway {
                    base_url: "https://api.met.no/weatherapi/locationforecast/2.0".into(),
                    user_agent: "forecast-verify/0.1 ops@example.org".into(),
                },
                runs: RunSchedule::default(),
                parameters: vec![Parameter::WindSpeed, Parameter::Temperature],
                rate_limit: RateLimitConfig::default(),
                retry: RetryConfig::default(),
                fallback: None,
            },
        ];
        config.observation_sources = vec![ObservationSourceConfig {
            id: "beacons".into(),
            name: "Beacons".into(),
            collector: ObservationBinding::Pioupiou { base_url: "https://api.pioupiou.fr/v1".into() },
            parameters: vec![Parameter::WindSpeed],
            rate_limit: RateLimitConfig::default(),
            retry: RetryConfig::default(),
            fallback: Some(ObservationBinding::StationPage {
                url_template: "https://beacons.example/station/{station}".into(),
            }),
        }];
        config
    }

    #[test]
    fn test_from_config_registers_everything() {
        let registry = CollectorRegistry::from_config(&config()).unwrap();
        assert_eq!(registry.models().len(), 2);
        assert_eq!(registry.sources().len(), 1);

        // fallback wrappers report the primary's source id
        assert_eq!(registry.model("arome").unwrap().collector.source_id(), "grid");
        assert_eq!(registry.model("met_nordic").unwrap().collector.source_id(), "met_norway");
        assert_eq!(registry.source("beacons").unwrap().collector.source_id(), "beacons");
        assert!(registry.model("gfs").is_none());
    }

    #[test]
    fn test_missing_station_fails_registration() {
        let mut config = config();
        config.locations[1].stations.clear();
        let err = CollectorRegistry::from_config(&config).unwrap_err();
        assert!(err.to_string().contains("semnoz"));
    }

    #[test]
    fn test_fallback_serving_another_model_fails_registration() {
        let mut config = config();
        config.models[1].fallback = Some(ForecastBinding::OpenMeteo {
            base_url: "https://api.open-meteo.com".into(),
            model: "icon_d2".into(),
            domain: Some("dwd_icon_d2".into()),
        });
        let err = CollectorRegistry::from_config(&config).unwrap_err();
        assert!(err.to_string().contains("met_nordic"));
    }

    #[test]
    fn test_zero_rate_limit_fails_registration() {
        let mut config = config();
        config.models[1].rate_limit.requests_per_minute = 0;
        assert!(CollectorRegistry::from_config(&config).is_err());
    }

    #[test]
    fn test_register_replaces_same_id() {
        let full = CollectorRegistry::from_config(&config()).unwrap();
        let mut registry = CollectorRegistry::new();
        let arome = full.model("arome").unwrap().clone();
        registry.register_model(arome.config.clone(), arome.collector.clone());
        registry.register_model(arome.config, arome.collector);
        assert_eq!(registry.models().len(), 1);
    }
}
