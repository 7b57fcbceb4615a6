//! Pioupiou beacon observation collector (archive API).
//!
//! The archive returns rows positioned by a `legend` array with a parallel
//! `units` array. Both are validated before any row is read, so a column
//! reorder or unit change upstream fails closed instead of mislabelling data.

use crate::resilience::ResilientClient;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use forecast_verify_core::{
    CollectError, ConfigurationError, Location, ObservationCollector, Parameter, ParsingError,
    RawReading, TimeWindow, Unit,
};
use serde::Deserialize;
use tracing::debug;

pub const SOURCE_ID: &str = "pioupiou";

#[derive(Debug, Deserialize)]
struct ArchiveResponse {
    legend: Vec<String>,
    units: Vec<String>,
    data: Vec<Vec<serde_json::Value>>,
}

fn column_name(parameter: Parameter) -> Option<&'static str> {
    match parameter {
        Parameter::WindSpeed => Some("wind_speed_avg"),
        Parameter::WindGust => Some("wind_speed_max"),
        Parameter::WindDirection => Some("wind_heading"),
        Parameter::Temperature => None,
    }
}

pub struct PioupiouCollector {
    client: ResilientClient,
    base_url: String,
    parameters: Vec<Parameter>,
    source_id: String,
}

impl PioupiouCollector {
    #[must_use]
    pub fn new(client: ResilientClient, base_url: impl Into<String>, parameters: Vec<Parameter>) -> Self {
        Self {
            source_id: client.source_id().to_string(),
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            parameters,
        }
    }

    fn parse(
        &self,
        body: &ArchiveResponse,
        location: &Location,
        window: TimeWindow,
    ) -> Result<Vec<RawReading>, ParsingError> {
        if body.legend.len() != body.units.len() {
            return Err(ParsingError::new(
                &self.source_id,
                "legend and units have different lengths",
            ));
        }
        let index_of = |name: &str| {
            body.legend
                .iter()
                .position(|c| c == name)
                .ok_or_else(|| ParsingError::new(&self.source_id, format!("legend lacks '{name}'")))
        };

        let time_idx = index_of("time")?;
        let mut columns = Vec::new();
        for &parameter in &self.parameters {
            let Some(name) = column_name(parameter) else {
                continue;
            };
            let idx = index_of(name)?;
            let unit = Unit::from_label(&self.source_id, &body.units[idx])?;
            columns.push((parameter, idx, unit));
        }

        let mut readings = Vec::new();
        for row in &body.data {
            if row.len() != body.legend.len() {
                return Err(ParsingError::new(
                    &self.source_id,
                    format!("row has {} cells, legend has {}", row.len(), body.legend.len()),
                ));
            }
            let observed_time = row[time_idx]
                .as_str()
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .map(|t| t.with_timezone(&Utc))
                .ok_or_else(|| ParsingError::new(&self.source_id, format!("invalid time cell {}", row[time_idx])))?;
            if !window.contains(observed_time) {
                continue;
            }

            for &(parameter, idx, unit) in &columns {
                let cell = &row[idx];
                if cell.is_null() {
                    continue;
                }
                let raw = cell.as_f64().ok_or_else(|| {
                    ParsingError::new(&self.source_id, format!("non-numeric {} cell {cell}", parameter.id()))
                })?;
                readings.push(RawReading::observation(
                    location.id.clone(),
                    parameter,
                    parameter.normalize(&self.source_id, raw, unit)?,
                    self.source_id.clone(),
                    observed_time,
                ));
            }
        }
        Ok(readings)
    }
}

#[async_trait]
impl ObservationCollector for PioupiouCollector {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    async fn fetch_observation(
        &self,
        location: &Location,
        window: TimeWindow,
    ) -> Result<Vec<RawReading>, CollectError> {
        let station = location.station_for(&self.source_id).ok_or_else(|| {
            ConfigurationError::new(format!(
                "location {} has no {} station",
                location.id, self.source_id
            ))
        })?;

        let query = [
            ("start", window.start.to_rfc3339_opts(SecondsFormat::Secs, true)),
            ("stop", window.end.to_rfc3339_opts(SecondsFormat::Secs, true)),
        ];
        let body: ArchiveResponse = self
            .client
            .get_json(&format!("{}/archive/{station}", self.base_url), &query)
            .await?;
        let readings = self.parse(&body, location, window)?;

        debug!(
            source = %self.source_id,
            station,
            location = %location.id,
            readings = readings.len(),
            "Parsed Pioupiou archive"
        );
        Ok(readings)
    }
}
