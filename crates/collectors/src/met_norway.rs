//! MET Norway Locationforecast 2.0 collector (compact product).

use crate::resilience::ResilientClient;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use forecast_verify_core::{
    CollectError, ForecastCollector, Location, Parameter, ParsingError, RawReading, Unit,
};
use serde::Deserialize;
use std::collections::HashMap;
use tracing::debug;

pub const SOURCE_ID: &str = "met_norway";

#[derive(Debug, Deserialize)]
struct CompactResponse {
    properties: Properties,
}

#[derive(Debug, Deserialize)]
struct Properties {
    meta: Meta,
    timeseries: Vec<TimeStep>,
}

#[derive(Debug, Deserialize)]
struct Meta {
    /// When the product was generated
    updated_at: Option<DateTime<Utc>>,
    units: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct TimeStep {
    time: DateTime<Utc>,
    data: StepData,
}

#[derive(Debug, Deserialize)]
struct StepData {
    instant: Instant,
}

#[derive(Debug, Deserialize)]
struct Instant {
    details: HashMap<String, Option<f64>>,
}

fn detail_name(parameter: Parameter) -> &'static str {
    match parameter {
        Parameter::WindSpeed => "wind_speed",
        Parameter::WindGust => "wind_speed_of_gust",
        Parameter::WindDirection => "wind_from_direction",
        Parameter::Temperature => "air_temperature",
    }
}

pub struct MetNorwayCollector {
    client: ResilientClient,
    base_url: String,
    model_id: String,
    parameters: Vec<Parameter>,
}

impl MetNorwayCollector {
    /// `client` must carry an identifying User-Agent; the API rejects
    /// anonymous requests.
    #[must_use]
    pub fn new(
        client: ResilientClient,
        base_url: impl Into<String>,
        model_id: impl Into<String>,
        parameters: Vec<Parameter>,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model_id: model_id.into(),
            parameters,
        }
    }

    fn parse(
        &self,
        body: CompactResponse,
        location: &Location,
        run_time: DateTime<Utc>,
    ) -> Result<Vec<RawReading>, ParsingError> {
        // A product generated before the run cannot contain it
        let updated_at = body
            .properties
            .meta
            .updated_at
            .ok_or_else(|| ParsingError::new(SOURCE_ID, "meta.updated_at missing"))?;
        if updated_at < run_time {
            return Err(ParsingError::new(
                SOURCE_ID,
                format!("stale product: updated at {updated_at}, before run {run_time}"),
            ));
        }

        let mut units = HashMap::new();
        for &parameter in &self.parameters {
            let name = detail_name(parameter);
            // Gusts are only published in the complete product; absence is a gap
            if let Some(label) = body.properties.meta.units.get(name) {
                units.insert(parameter, Unit::from_label(SOURCE_ID, label)?);
            } else if parameter != Parameter::WindGust {
                return Err(ParsingError::new(SOURCE_ID, format!("meta.units.{name} missing")));
            }
        }

        let mut readings = Vec::new();
        for step in &body.properties.timeseries {
            if step.time < run_time {
                continue;
            }
            for (&parameter, &unit) in &units {
                let Some(Some(raw)) = step.data.instant.details.get(detail_name(parameter)) else {
                    continue;
                };
                readings.push(RawReading::forecast(
                    location.id.clone(),
                    parameter,
                    parameter.normalize(SOURCE_ID, *raw, unit)?,
                    SOURCE_ID,
                    self.model_id.clone(),
                    run_time,
                    step.time,
                ));
            }
        }
        Ok(readings)
    }
}

#[async_trait]
impl ForecastCollector for MetNorwayCollector {
    fn source_id(&self) -> &str {
        SOURCE_ID
    }

    async fn fetch_forecast(
        &self,
        location: &Location,
        run_time: DateTime<Utc>,
    ) -> Result<Vec<RawReading>, CollectError> {
        // The API truncates coordinates beyond four decimals and caches by them
        let query = [
            ("lat", format!("{:.4}", location.latitude)),
            ("lon", format!("{:.4}", location.longitude)),
        ];

        let body: CompactResponse = self
            .client
            .get_json(&format!("{}/compact", self.base_url), &query)
            .await?;
        let readings = self.parse(body, location, run_time)?;

        debug!(
            source = SOURCE_ID,
            model = %self.model_id,
            location = %location.id,
            readings = readings.len(),
            "Parsed MET Norway forecast"
        );
        Ok(readings)
    }
}
