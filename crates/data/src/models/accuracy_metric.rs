//! Accuracy metric row model.
//!
//! Counts are stored as `BIGINT` and intervals as two nullable bounds.

use anyhow::Context;
use chrono::{DateTime, NaiveDate, Utc};
use forecast_verify_core::{AccuracyMetric, Interval};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct AccuracyMetricRecord {
    pub location_id: String,
    pub model_id: String,
    pub parameter: String,
    pub horizon: i32,
    pub time_bucket: String,
    pub bucket_start: Option<NaiveDate>,
    pub mae: f64,
    pub bias: f64,
    pub rmse: f64,
    pub sample_count: i64,
    pub distinct_days: i64,
    pub day_span: i64,
    pub confidence: String,
    pub bias_lower: Option<f64>,
    pub bias_upper: Option<f64>,
    pub mae_lower: Option<f64>,
    pub mae_upper: Option<f64>,
    pub first_timestamp: DateTime<Utc>,
    pub last_timestamp: DateTime<Utc>,
}

fn split(interval: Option<Interval>) -> (Option<f64>, Option<f64>) {
    match interval {
        Some(i) => (Some(i.lower), Some(i.upper)),
        None => (None, None),
    }
}

fn join(lower: Option<f64>, upper: Option<f64>) -> Option<Interval> {
    Some(Interval {
        lower: lower?,
        upper: upper?,
    })
}

impl From<&AccuracyMetric> for AccuracyMetricRecord {
    fn from(m: &AccuracyMetric) -> Self {
        let (bias_lower, bias_upper) = split(m.bias_interval);
        let (mae_lower, mae_upper) = split(m.mae_interval);
        Self {
            location_id: m.location_id.clone(),
            model_id: m.model_id.clone(),
            parameter: m.parameter.id().to_string(),
            horizon: m.horizon,
            time_bucket: m.time_bucket.as_str().to_string(),
            bucket_start: m.bucket_start,
            mae: m.mae,
            bias: m.bias,
            rmse: m.rmse,
            sample_count: i64::try_from(m.sample_count).unwrap_or(i64::MAX),
            distinct_days: i64::try_from(m.distinct_days).unwrap_or(i64::MAX),
            day_span: m.day_span,
            confidence: m.confidence.as_str().to_string(),
            bias_lower,
            bias_upper,
            mae_lower,
            mae_upper,
            first_timestamp: m.first_timestamp,
            last_timestamp: m.last_timestamp,
        }
    }
}

impl TryFrom<AccuracyMetricRecord> for AccuracyMetric {
    type Error = anyhow::Error;

    fn try_from(r: AccuracyMetricRecord) -> anyhow::Result<Self> {
        Ok(Self {
            parameter: r.parameter.parse()?,
            time_bucket: r.time_bucket.parse()?,
            confidence: r.confidence.parse()?,
            sample_count: usize::try_from(r.sample_count).context("negative sample_count")?,
            distinct_days: usize::try_from(r.distinct_days).context("negative distinct_days")?,
            bias_interval: join(r.bias_lower, r.bias_upper),
            mae_interval: join(r.mae_lower, r.mae_upper),
            location_id: r.location_id,
            model_id: r.model_id,
            horizon: r.horizon,
            bucket_start: r.bucket_start,
            mae: r.mae,
            bias: r.bias,
            rmse: r.rmse,
            day_span: r.day_span,
            first_timestamp: r.first_timestamp,
            last_timestamp: r.last_timestamp,
        })
    }
}
