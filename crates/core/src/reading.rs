//! Locations, time windows and the normalized readings collectors produce.

use crate::parameter::Parameter;
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A place forecasts are verified at.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    /// Stable identifier (e.g. "annecy_planfait")
    pub id: String,
    /// Human readable name
    pub name: String,
    pub latitude: f64,
    pub longitude: f64,
    /// Station identifier per observation source id
    #[serde(default)]
    pub stations: HashMap<String, String>,
}

impl Location {
    #[must_use]
    pub fn new(id: impl Into<String>, name: impl Into<String>, latitude: f64, longitude: f64) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            latitude,
            longitude,
            stations: HashMap::new(),
        }
    }

    /// Builder method to bind a station identifier for an observation source.
    #[must_use]
    pub fn with_station(mut self, source_id: impl Into<String>, station_id: impl Into<String>) -> Self {
        self.stations.insert(source_id.into(), station_id.into());
        self
    }

    /// Station identifier used by `source_id`, if bound.
    #[must_use]
    pub fn station_for(&self, source_id: &str) -> Option<&str> {
        self.stations.get(source_id).map(String::as_str)
    }
}

/// Half-open time interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeWindow {
    #[must_use]
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    /// Window of `hours` ending at `end`.
    #[must_use]
    pub fn ending_at(end: DateTime<Utc>, hours: i64) -> Self {
        Self {
            start: end - Duration::hours(hours),
            end,
        }
    }

    #[must_use]
    pub fn contains(&self, t: DateTime<Utc>) -> bool {
        t >= self.start && t < self.end
    }

    /// Returns the window grown by `margin` on both sides.
    #[must_use]
    pub fn widen(&self, margin: Duration) -> Self {
        Self {
            start: self.start - margin,
            end: self.end + margin,
        }
    }
}

/// Whether a reading predicts or records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReadingKind {
    Forecast {
        model_id: String,
        run_time: DateTime<Utc>,
        target_time: DateTime<Utc>,
    },
    Observation {
        observed_time: DateTime<Utc>,
    },
}

/// A single normalized value produced by a collector.
///
/// Values are in the canonical unit of their parameter, rounded to its
/// precision. Readings are transient and never stored as history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawReading {
    pub location_id: String,
    pub parameter: Parameter,
    pub value: Decimal,
    pub source_id: String,
    pub kind: ReadingKind,
}

impl RawReading {
    /// Creates a forecast reading.
    #[must_use]
    pub fn forecast(
        location_id: impl Into<String>,
        parameter: Parameter,
        value: Decimal,
        source_id: impl Into<String>,
        model_id: impl Into<String>,
        run_time: DateTime<Utc>,
        target_time: DateTime<Utc>,
    ) -> Self {
        Self {
            location_id: location_id.into(),
            parameter,
            value,
            source_id: source_id.into(),
            kind: ReadingKind::Forecast {
                model_id: model_id.into(),
                run_time,
                target_time,
            },
        }
    }

    /// Creates an observation reading.
    #[must_use]
    pub fn observation(
        location_id: impl Into<String>,
        parameter: Parameter,
        value: Decimal,
        source_id: impl Into<String>,
        observed_time: DateTime<Utc>,
    ) -> Self {
        Self {
            location_id: location_id.into(),
            parameter,
            value,
            source_id: source_id.into(),
            kind: ReadingKind::Observation { observed_time },
        }
    }

    /// The instant the reading refers to (target time or observed time).
    #[must_use]
    pub fn valid_time(&self) -> DateTime<Utc> {
        match &self.kind {
            ReadingKind::Forecast { target_time, .. } => *target_time,
            ReadingKind::Observation { observed_time } => *observed_time,
        }
    }

    #[must_use]
    pub fn is_forecast(&self) -> bool {
        matches!(self.kind, ReadingKind::Forecast { .. })
    }

    /// Lead time in whole hours, for forecasts.
    #[must_use]
    pub fn lead_hours(&self) -> Option<i64> {
        match &self.kind {
            ReadingKind::Forecast {
                run_time,
                target_time,
                ..
            } => Some((*target_time - *run_time).num_hours()),
            ReadingKind::Observation { .. } => None,
        }
    }
}
