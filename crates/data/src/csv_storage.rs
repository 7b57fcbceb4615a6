use anyhow::{Context, Result};
use csv::Writer;
use forecast_verify_core::{AccuracyMetric, Deviation, Interval};
use std::fs::File;
use std::path::Path;

pub struct CsvStorage;

fn bound(interval: Option<Interval>, pick: fn(&Interval) -> f64) -> String {
    interval.map(|i| format!("{:.4}", pick(&i))).unwrap_or_default()
}

impl CsvStorage {
    /// Writes deviations to a CSV file, oldest first.
    ///
    /// Format: timestamp,location_id,model_id,parameter,horizon,forecast_value,
    /// observed_value,deviation,run_time,observed_at
    ///
    /// # Errors
    /// Returns error if file cannot be created or writing fails
    pub fn write_deviations(path: &Path, deviations: &[Deviation]) -> Result<usize> {
        let file = File::create(path)
            .with_context(|| format!("Failed to create CSV file: {}", path.display()))?;
        let mut writer = Writer::from_writer(file);

        writer.write_record([
            "timestamp",
            "location_id",
            "model_id",
            "parameter",
            "horizon",
            "forecast_value",
            "observed_value",
            "deviation",
            "run_time",
            "observed_at",
        ])?;

        let mut sorted = deviations.to_vec();
        sorted.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.model_id.cmp(&b.model_id)));

        for d in &sorted {
            writer.write_record(&[
                d.timestamp.to_rfc3339(),
                d.location_id.clone(),
                d.model_id.clone(),
                d.parameter.id().to_string(),
                d.horizon.to_string(),
                d.forecast_value.to_string(),
                d.observed_value.to_string(),
                d.deviation.to_string(),
                d.run_time.to_rfc3339(),
                d.observed_at.to_rfc3339(),
            ])?;
        }

        writer.flush()?;
        Ok(sorted.len())
    }

    /// Writes accuracy metrics to a CSV file in the given order.
    ///
    /// Interval bounds are empty when fewer than two samples exist.
    ///
    /// # Errors
    /// Returns error if file cannot be created or writing fails
    pub fn write_metrics(path: &Path, metrics: &[AccuracyMetric]) -> Result<usize> {
        let file = File::create(path)
            .with_context(|| format!("Failed to create CSV file: {}", path.display()))?;
        let mut writer = Writer::from_writer(file);

        writer.write_record([
            "location_id",
            "model_id",
            "parameter",
            "horizon",
            "time_bucket",
            "bucket_start",
            "mae",
            "bias",
            "rmse",
            "sample_count",
            "distinct_days",
            "day_span",
            "confidence",
            "bias_lower",
            "bias_upper",
            "mae_lower",
            "mae_upper",
        ])?;

        for m in metrics {
            writer.write_record(&[
                m.location_id.clone(),
                m.model_id.clone(),
                m.parameter.id().to_string(),
                m.horizon.to_string(),
                m.time_bucket.as_str().to_string(),
                m.bucket_start.map(|d| d.to_string()).unwrap_or_default(),
                format!("{:.4}", m.mae),
                format!("{:.4}", m.bias),
                format!("{:.4}", m.rmse),
                m.sample_count.to_string(),
                m.distinct_days.to_string(),
                m.day_span.to_string(),
                m.confidence.as_str().to_string(),
                bound(m.bias_interval, |i| i.lower),
                bound(m.bias_interval, |i| i.upper),
                bound(m.mae_interval, |i| i.lower),
                bound(m.mae_interval, |i| i.upper),
            ])?;
        }

        writer.flush()?;
        Ok(metrics.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};
    use forecast_verify_core::{Confidence, Parameter, TimeBucket};
    use rust_decimal_macros::dec;
    use tempfile::tempdir;

    fn deviation(hour: u32, model: &str) -> Deviation {
        let at = Utc.with_ymd_and_hms(2024, 6, 1, hour, 0, 0).unwrap();
        Deviation {
            timestamp: at,
            location_id: "planfait".into(),
            model_id: model.into(),
            parameter: Parameter::WindSpeed,
            horizon: 6,
            forecast_value: dec!(25.0),
            observed_value: dec!(18.0),
            deviation: dec!(-7.0),
            run_time: at - Duration::hours(6),
            observed_at: at + Duration::hours(1),
        }
    }

    #[test]
    fn test_write_deviations_sorted_with_header() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("deviations.csv");

        let written =
            CsvStorage::write_deviations(&path, &[deviation(12, "arome"), deviation(6, "icon_d2"), deviation(6, "arome")])
                .unwrap();
        assert_eq!(written, 3);

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 4);
        assert!(lines[0].starts_with("timestamp,location_id,model_id"));
        assert!(lines[1].contains(",arome,") && lines[1].starts_with("2024-06-01T06:00:00"));
        assert!(lines[2].contains(",icon_d2,"));
        assert!(lines[3].starts_with("2024-06-01T12:00:00"));
        assert!(lines[1].contains(",wind_speed,6,25.0,18.0,-7.0,"));
    }

    #[test]
    fn test_write_metrics_leaves_missing_interval_empty() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("metrics.csv");
        let at = Utc.with_ymd_and_hms(2024, 6, 1, 6, 0, 0).unwrap();
        let metric = AccuracyMetric {
            location_id: "planfait".into(),
            model_id: "arome".into(),
            parameter: Parameter::Temperature,
            horizon: 24,
            time_bucket: TimeBucket::All,
            bucket_start: None,
            mae: 1.5,
            bias: -0.25,
            rmse: 2.0,
            sample_count: 1,
            distinct_days: 1,
            day_span: 1,
            confidence: Confidence::Insufficient,
            bias_interval: None,
            mae_interval: None,
            first_timestamp: at,
            last_timestamp: at,
        };

        CsvStorage::write_metrics(&path, &[metric]).unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        let row = content.lines().nth(1).unwrap();
        assert_eq!(
            row,
            "planfait,arome,temperature,24,all,,1.5000,-0.2500,2.0000,1,1,1,insufficient,,,,"
        );
    }

    #[test]
    fn test_unwritable_path_is_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("missing").join("out.csv");
        assert!(CsvStorage::write_deviations(&path, &[]).is_err());
    }
}
