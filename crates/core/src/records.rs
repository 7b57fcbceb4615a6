//! Staged forecasts, matched pairs, deviations and accuracy metrics.

use crate::horizon::HorizonBucket;
use crate::parameter::Parameter;
use crate::reading::{RawReading, ReadingKind};
use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A forecast reading waiting in staging for its observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StagedForecast {
    /// Store-assigned identifier, used to release the row once matched
    pub id: i64,
    pub location_id: String,
    pub parameter: Parameter,
    pub model_id: String,
    pub source_id: String,
    pub run_time: DateTime<Utc>,
    pub target_time: DateTime<Utc>,
    pub value: Decimal,
}

impl StagedForecast {
    /// Builds a staged row from a forecast reading. Returns `None` for
    /// observations.
    #[must_use]
    pub fn from_reading(id: i64, reading: &RawReading) -> Option<Self> {
        match &reading.kind {
            ReadingKind::Forecast {
                model_id,
                run_time,
                target_time,
            } => Some(Self {
                id,
                location_id: reading.location_id.clone(),
                parameter: reading.parameter,
                model_id: model_id.clone(),
                source_id: reading.source_id.clone(),
                run_time: *run_time,
                target_time: *target_time,
                value: reading.value,
            }),
            ReadingKind::Observation { .. } => None,
        }
    }

    /// Lead time in whole hours.
    #[must_use]
    pub fn lead_hours(&self) -> i64 {
        (self.target_time - self.run_time).num_hours()
    }
}

/// Why a forecast/observation pair cannot be formed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairRejection {
    LocationMismatch,
    ParameterMismatch,
    OutsideTolerance,
    OutsideHorizon,
}

/// A forecast joined to the observation it predicted.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchedPair {
    pub forecast_id: i64,
    pub location_id: String,
    pub parameter: Parameter,
    pub model_id: String,
    pub run_time: DateTime<Utc>,
    pub target_time: DateTime<Utc>,
    pub observed_time: DateTime<Utc>,
    pub forecast_value: Decimal,
    pub observed_value: Decimal,
    pub horizon: HorizonBucket,
}

impl MatchedPair {
    /// Pairs a staged forecast with an observation.
    ///
    /// # Errors
    /// Returns the [`PairRejection`] when location or parameter differ, the
    /// valid times are further apart than `tolerance`, or the lead time is not
    /// accepted by `bucket`.
    pub fn new(
        forecast: &StagedForecast,
        observation_location: &str,
        observation_parameter: Parameter,
        observed_time: DateTime<Utc>,
        observed_value: Decimal,
        tolerance: Duration,
        bucket: HorizonBucket,
    ) -> Result<Self, PairRejection> {
        if forecast.location_id != observation_location {
            return Err(PairRejection::LocationMismatch);
        }
        if forecast.parameter != observation_parameter {
            return Err(PairRejection::ParameterMismatch);
        }
        if (forecast.target_time - observed_time).abs() > tolerance {
            return Err(PairRejection::OutsideTolerance);
        }
        if !bucket.accepts(forecast.lead_hours()) {
            return Err(PairRejection::OutsideHorizon);
        }

        Ok(Self {
            forecast_id: forecast.id,
            location_id: forecast.location_id.clone(),
            parameter: forecast.parameter,
            model_id: forecast.model_id.clone(),
            run_time: forecast.run_time,
            target_time: forecast.target_time,
            observed_time,
            forecast_value: forecast.value,
            observed_value,
            horizon: bucket,
        })
    }
}

/// Durable record of how wrong one forecast was.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deviation {
    /// Forecast target time
    pub timestamp: DateTime<Utc>,
    pub location_id: String,
    pub model_id: String,
    pub parameter: Parameter,
    /// Nominal horizon bucket in hours
    pub horizon: i32,
    pub forecast_value: Decimal,
    pub observed_value: Decimal,
    /// observed - forecast (wrapped to [-180, 180) for direction)
    pub deviation: Decimal,
    pub run_time: DateTime<Utc>,
    pub observed_at: DateTime<Utc>,
}

impl Deviation {
    /// Natural key rendered as a string, for logs and duplicate errors.
    #[must_use]
    pub fn natural_key(&self) -> String {
        format!(
            "{}/{}/{}/{}/{}h",
            self.timestamp.to_rfc3339(),
            self.location_id,
            self.model_id,
            self.parameter,
            self.horizon
        )
    }

    /// True when this deviation has the same natural key as `other`.
    #[must_use]
    pub fn same_key(&self, other: &Deviation) -> bool {
        self.timestamp == other.timestamp
            && self.location_id == other.location_id
            && self.model_id == other.model_id
            && self.parameter == other.parameter
            && self.horizon == other.horizon
    }
}

/// Filter applied when reading deviations back.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviationFilter {
    pub location_id: Option<String>,
    pub model_id: Option<String>,
    pub parameter: Option<Parameter>,
    pub horizon: Option<i32>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

impl DeviationFilter {
    #[must_use]
    pub fn with_location(mut self, location_id: impl Into<String>) -> Self {
        self.location_id = Some(location_id.into());
        self
    }

    #[must_use]
    pub fn with_model(mut self, model_id: impl Into<String>) -> Self {
        self.model_id = Some(model_id.into());
        self
    }

    #[must_use]
    pub fn with_parameter(mut self, parameter: Parameter) -> Self {
        self.parameter = Some(parameter);
        self
    }

    #[must_use]
    pub fn with_horizon(mut self, horizon: i32) -> Self {
        self.horizon = Some(horizon);
        self
    }

    /// Restricts to timestamps in `[from, to)`.
    #[must_use]
    pub fn with_range(mut self, from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        self.from = Some(from);
        self.to = Some(to);
        self
    }

    #[must_use]
    pub fn matches(&self, d: &Deviation) -> bool {
        self.location_id.as_ref().map_or(true, |l| *l == d.location_id)
            && self.model_id.as_ref().map_or(true, |m| *m == d.model_id)
            && self.parameter.map_or(true, |p| p == d.parameter)
            && self.horizon.map_or(true, |h| h == d.horizon)
            && self.from.map_or(true, |f| d.timestamp >= f)
            && self.to.map_or(true, |t| d.timestamp < t)
    }
}

/// Confidence in an accuracy metric, by span of history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    Insufficient,
    Preliminary,
    Validated,
}

impl Confidence {
    /// Classifies a day span: `< 30` insufficient, `30..=89` preliminary,
    /// `>= 90` validated.
    #[must_use]
    pub fn from_day_span(days: i64) -> Self {
        match days {
            d if d >= 90 => Confidence::Validated,
            d if d >= 30 => Confidence::Preliminary,
            _ => Confidence::Insufficient,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Confidence::Insufficient => "insufficient",
            Confidence::Preliminary => "preliminary",
            Confidence::Validated => "validated",
        }
    }
}

impl fmt::Display for Confidence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Confidence {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "insufficient" => Ok(Confidence::Insufficient),
            "preliminary" => Ok(Confidence::Preliminary),
            "validated" => Ok(Confidence::Validated),
            other => Err(anyhow::anyhow!("Invalid confidence: '{other}'")),
        }
    }
}

/// Calendar grouping applied before aggregation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeBucket {
    #[default]
    All,
    Month,
    /// ISO week, starting Monday
    Week,
}

impl TimeBucket {
    /// First day of the bucket containing `t`, or `None` for [`TimeBucket::All`].
    #[must_use]
    pub fn start_of(&self, t: DateTime<Utc>) -> Option<NaiveDate> {
        let date = t.date_naive();
        match self {
            TimeBucket::All => None,
            TimeBucket::Month => NaiveDate::from_ymd_opt(date.year(), date.month(), 1),
            TimeBucket::Week => {
                Some(date - Duration::days(i64::from(date.weekday().num_days_from_monday())))
            }
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            TimeBucket::All => "all",
            TimeBucket::Month => "month",
            TimeBucket::Week => "week",
        }
    }
}

impl FromStr for TimeBucket {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "all" => Ok(TimeBucket::All),
            "month" => Ok(TimeBucket::Month),
            "week" => Ok(TimeBucket::Week),
            other => Err(anyhow::anyhow!(
                "Invalid time bucket: '{other}'. Valid values: all, month, week"
            )),
        }
    }
}

/// 95% interval around a mean.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Interval {
    pub lower: f64,
    pub upper: f64,
}

impl Interval {
    #[must_use]
    pub fn width(&self) -> f64 {
        self.upper - self.lower
    }

    #[must_use]
    pub fn contains(&self, value: f64) -> bool {
        value >= self.lower && value <= self.upper
    }
}

/// Derived accuracy of one model for one group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccuracyMetric {
    pub location_id: String,
    pub model_id: String,
    pub parameter: Parameter,
    pub horizon: i32,
    pub time_bucket: TimeBucket,
    /// Start of the calendar bucket; `None` for [`TimeBucket::All`]
    pub bucket_start: Option<NaiveDate>,
    pub mae: f64,
    pub bias: f64,
    pub rmse: f64,
    pub sample_count: usize,
    pub distinct_days: usize,
    pub day_span: i64,
    pub confidence: Confidence,
    pub bias_interval: Option<Interval>,
    pub mae_interval: Option<Interval>,
    pub first_timestamp: DateTime<Utc>,
    pub last_timestamp: DateTime<Utc>,
}

/// Filter for reading accuracy metrics.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricFilter {
    pub location_id: Option<String>,
    pub model_id: Option<String>,
    pub parameter: Option<Parameter>,
    pub horizon: Option<i32>,
    pub time_bucket: Option<TimeBucket>,
    pub min_confidence: Option<Confidence>,
}

impl MetricFilter {
    #[must_use]
    pub fn matches(&self, m: &AccuracyMetric) -> bool {
        self.location_id.as_ref().map_or(true, |l| *l == m.location_id)
            && self.model_id.as_ref().map_or(true, |id| *id == m.model_id)
            && self.parameter.map_or(true, |p| p == m.parameter)
            && self.horizon.map_or(true, |h| h == m.horizon)
            && self.time_bucket.map_or(true, |b| b == m.time_bucket)
            && self.min_confidence.map_or(true, |c| m.confidence >= c)
    }
}
