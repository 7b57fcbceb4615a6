//! Open-Meteo point forecast collector.
//!
//! Queries `/v1/forecast` for one model's hourly series at a location. Units
//! are read from `hourly_units` on every response rather than assumed.
//!
//! The forecast payload does not say which run it comes from; the endpoint
//! always serves the latest one. When a data domain is configured, the
//! domain's `static/meta.json` is read first and the fetch fails closed if
//! the run being served is not the requested run.

use crate::resilience::ResilientClient;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use forecast_verify_core::{
    CollectError, ForecastCollector, Location, Parameter, ParsingError, RawReading, Unit,
};
use serde::Deserialize;
use std::collections::HashMap;
use tracing::debug;

pub const SOURCE_ID: &str = "open_meteo";

#[derive(Debug, Deserialize)]
struct DomainMetadata {
    /// Unix seconds
    last_run_initialisation_time: i64,
}

#[derive(Debug, Deserialize)]
struct ForecastResponse {
    hourly_units: HashMap<String, String>,
    hourly: HashMap<String, serde_json::Value>,
}

/// Hourly variable name for each parameter.
fn variable(parameter: Parameter) -> &'static str {
    match parameter {
        Parameter::WindSpeed => "wind_speed_10m",
        Parameter::WindGust => "wind_gusts_10m",
        Parameter::WindDirection => "wind_direction_10m",
        Parameter::Temperature => "temperature_2m",
    }
}

pub struct OpenMeteoCollector {
    client: ResilientClient,
    base_url: String,
    model_id: String,
    upstream_model: String,
    domain: Option<String>,
    parameters: Vec<Parameter>,
}

impl OpenMeteoCollector {
    /// Creates a collector for one upstream model.
    ///
    /// # Arguments
    /// * `model_id` - Model id readings are attributed to
    /// * `upstream_model` - Open-Meteo model name (e.g. "meteofrance_arome_france")
    #[must_use]
    pub fn new(
        client: ResilientClient,
        base_url: impl Into<String>,
        model_id: impl Into<String>,
        upstream_model: impl Into<String>,
        parameters: Vec<Parameter>,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model_id: model_id.into(),
            upstream_model: upstream_model.into(),
            domain: None,
            parameters,
        }
    }

    /// Checks every fetch against the run `domain` reports as served.
    #[must_use]
    pub fn with_run_metadata(mut self, domain: Option<String>) -> Self {
        self.domain = domain;
        self
    }

    async fn ensure_serving(&self, domain: &str, run_time: DateTime<Utc>) -> Result<(), CollectError> {
        let meta: DomainMetadata = self
            .client
            .get_json(&format!("{}/data/{domain}/static/meta.json", self.base_url), &[])
            .await?;
        let served = DateTime::from_timestamp(meta.last_run_initialisation_time, 0).ok_or_else(|| {
            ParsingError::new(
                SOURCE_ID,
                format!("invalid last_run_initialisation_time {}", meta.last_run_initialisation_time),
            )
        })?;
        if served != run_time {
            return Err(ParsingError::new(
                SOURCE_ID,
                format!("{domain} serves run {served}, not requested run {run_time}"),
            )
            .into());
        }
        Ok(())
    }

    fn parse(
        &self,
        body: ForecastResponse,
        location: &Location,
        run_time: DateTime<Utc>,
    ) -> Result<Vec<RawReading>, ParsingError> {
        let times = body
            .hourly
            .get("time")
            .and_then(serde_json::Value::as_array)
            .ok_or_else(|| ParsingError::new(SOURCE_ID, "hourly.time missing"))?
            .iter()
            .map(|t| {
                t.as_str()
                    .ok_or_else(|| ParsingError::new(SOURCE_ID, "hourly.time entry is not a string"))
                    .and_then(parse_time)
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut readings = Vec::new();
        for &parameter in &self.parameters {
            let name = variable(parameter);
            let label = body
                .hourly_units
                .get(name)
                .ok_or_else(|| ParsingError::new(SOURCE_ID, format!("hourly_units.{name} missing")))?;
            let unit = Unit::from_label(SOURCE_ID, label)?;
            let values = body
                .hourly
                .get(name)
                .and_then(serde_json::Value::as_array)
                .ok_or_else(|| ParsingError::new(SOURCE_ID, format!("hourly.{name} missing")))?;

            if values.len() != times.len() {
                return Err(ParsingError::new(
                    SOURCE_ID,
                    format!(
                        "hourly.{name} has {} values for {} timestamps",
                        values.len(),
                        times.len()
                    ),
                ));
            }

            for (target_time, value) in times.iter().zip(values) {
                if *target_time < run_time {
                    continue;
                }
                // null is a gap
                let Some(raw) = value.as_f64() else {
                    if !value.is_null() {
                        return Err(ParsingError::new(
                            SOURCE_ID,
                            format!("hourly.{name} contains a non-numeric value"),
                        ));
                    }
                    continue;
                };
                let normalized = parameter.normalize(SOURCE_ID, raw, unit)?;
                readings.push(RawReading::forecast(
                    location.id.clone(),
                    parameter,
                    normalized,
                    SOURCE_ID,
                    self.model_id.clone(),
                    run_time,
                    *target_time,
                ));
            }
        }

        Ok(readings)
    }
}

fn parse_time(s: &str) -> Result<DateTime<Utc>, ParsingError> {
    NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M")
        .map(|t| t.and_utc())
        .map_err(|e| ParsingError::new(SOURCE_ID, format!("invalid time '{s}': {e}")))
}

#[async_trait]
impl ForecastCollector for OpenMeteoCollector {
    fn source_id(&self) -> &str {
        SOURCE_ID
    }

    async fn fetch_forecast(
        &self,
        location: &Location,
        run_time: DateTime<Utc>,
    ) -> Result<Vec<RawReading>, CollectError> {
        if let Some(domain) = &self.domain {
            self.ensure_serving(domain, run_time).await?;
        }

        let hourly = self
            .parameters
            .iter()
            .map(|p| variable(*p))
            .collect::<Vec<_>>()
            .join(",");
        let query = [
            ("latitude", format!("{:.4}", location.latitude)),
            ("longitude", format!("{:.4}", location.longitude)),
            ("hourly", hourly),
            ("models", self.upstream_model.clone()),
            ("timezone", "GMT".to_string()),
            ("start_hour", run_time.format("%Y-%m-%dT%H:%M").to_string()),
            ("forecast_days", "3".to_string()),
        ];

        let body: ForecastResponse = self
            .client
            .get_json(&format!("{}/v1/forecast", self.base_url), &query)
            .await?;
        let readings = self.parse(body, location, run_time)?;

        debug!(
            source = SOURCE_ID,
            model = %self.model_id,
            location = %location.id,
            readings = readings.len(),
            "Parsed Open-Meteo forecast"
        );
        Ok(readings)
    }
}
