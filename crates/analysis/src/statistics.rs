//! Statistics engine: accuracy metrics over stored deviations.
//!
//! Deviations are grouped by `(location, model, parameter, horizon)` and,
//! optionally, by calendar month or ISO week. Every group yields a metric,
//! including groups too small to trust; those carry
//! [`Confidence::Insufficient`] and `None` intervals where a spread cannot be
//! estimated.

use chrono::NaiveDate;
use forecast_verify_core::statistics::{mean, mean_interval_95, root_mean_square};
use forecast_verify_core::{AccuracyMetric, Confidence, Deviation, Parameter, TimeBucket};
use rust_decimal::prelude::ToPrimitive;
use std::collections::{BTreeMap, BTreeSet};

type GroupKey = (String, String, Parameter, i32, Option<NaiveDate>);

/// Computes the metric for one homogeneous group of deviations.
///
/// Returns `None` for an empty slice. The caller is responsible for passing
/// deviations that share location, model, parameter and horizon; the first
/// deviation provides the key.
#[must_use]
pub fn compute_group(
    deviations: &[Deviation],
    time_bucket: TimeBucket,
    bucket_start: Option<NaiveDate>,
) -> Option<AccuracyMetric> {
    let first = deviations.first()?;

    let signed: Vec<f64> = deviations.iter().filter_map(|d| d.deviation.to_f64()).collect();
    let absolute: Vec<f64> = signed.iter().map(|v| v.abs()).collect();

    let first_timestamp = deviations.iter().map(|d| d.timestamp).min()?;
    let last_timestamp = deviations.iter().map(|d| d.timestamp).max()?;
    let day_span = (last_timestamp.date_naive() - first_timestamp.date_naive()).num_days() + 1;
    let distinct_days = deviations
        .iter()
        .map(|d| d.timestamp.date_naive())
        .collect::<BTreeSet<_>>()
        .len();

    Some(AccuracyMetric {
        location_id: first.location_id.clone(),
        model_id: first.model_id.clone(),
        parameter: first.parameter,
        horizon: first.horizon,
        time_bucket,
        bucket_start,
        mae: mean(&absolute)?,
        bias: mean(&signed)?,
        rmse: root_mean_square(&signed)?,
        sample_count: deviations.len(),
        distinct_days,
        day_span,
        confidence: Confidence::from_day_span(day_span),
        bias_interval: mean_interval_95(&signed),
        mae_interval: mean_interval_95(&absolute),
        first_timestamp,
        last_timestamp,
    })
}

/// Groups `deviations` and computes one metric per group, ordered by key.
#[must_use]
pub fn compute_metrics(deviations: &[Deviation], time_bucket: TimeBucket) -> Vec<AccuracyMetric> {
    let mut groups: BTreeMap<GroupKey, Vec<Deviation>> = BTreeMap::new();
    for d in deviations {
        let key = (
            d.location_id.clone(),
            d.model_id.clone(),
            d.parameter,
            d.horizon,
            time_bucket.start_of(d.timestamp),
        );
        groups.entry(key).or_default().push(d.clone());
    }

    groups
        .into_iter()
        .filter_map(|((.., bucket_start), group)| compute_group(&group, time_bucket, bucket_start))
        .collect()
}

/// Metrics for every requested time bucket granularity.
#[must_use]
pub fn compute_all(deviations: &[Deviation], time_buckets: &[TimeBucket]) -> Vec<AccuracyMetric> {
    time_buckets
        .iter()
        .flat_map(|bucket| compute_metrics(deviations, *bucket))
        .collect()
}
