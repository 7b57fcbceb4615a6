#![allow(clippy::format_push_string)]

use crate::records::{AccuracyMetric, Confidence, Interval};

pub struct MetricsFormatter;

impl MetricsFormatter {
    /// Renders accuracy metrics as a grouped text report, one section per
    /// (location, model).
    #[must_use]
    pub fn format(metrics: &[AccuracyMetric]) -> String {
        let mut output = String::new();

        output.push('\n');
        output.push_str("═══════════════════════════════════════════════════════════════════════════════\n");
        output.push_str("                         FORECAST ACCURACY REPORT                              \n");
        output.push_str("═══════════════════════════════════════════════════════════════════════════════\n");
        output.push('\n');

        if metrics.is_empty() {
            output.push_str("⚠️  No accuracy metrics available.\n");
            output.push_str("    Metrics appear once deviations have been recorded and recomputed.\n\n");
            return output;
        }

        let mut sorted: Vec<&AccuracyMetric> = metrics.iter().collect();
        sorted.sort_by(|a, b| {
            (&a.location_id, &a.model_id, a.parameter, a.horizon, a.bucket_start)
                .cmp(&(&b.location_id, &b.model_id, b.parameter, b.horizon, b.bucket_start))
        });

        let mut current: Option<(&str, &str)> = None;
        for metric in sorted {
            let group = (metric.location_id.as_str(), metric.model_id.as_str());
            if current != Some(group) {
                if current.is_some() {
                    output.push('\n');
                }
                output.push_str(&format!("{} / {}\n", group.0, group.1));
                output.push_str("───────────────────────────────────────────────────────────────────────────────\n");
                output.push_str(&format!(
                    "{:<16} {:>4} {:>10} {:>7} {:>7} {:>7} {:>6} {:>5}  {:<13} {}\n",
                    "parameter", "h", "bucket", "MAE", "bias", "RMSE", "n", "days", "confidence", "bias 95% CI"
                ));
                current = Some(group);
            }

            let bucket = metric
                .bucket_start
                .map_or_else(|| "all".to_string(), |d| d.format("%Y-%m-%d").to_string());

            output.push_str(&format!(
                "{:<16} {:>4} {:>10} {:>7.2} {:>+7.2} {:>7.2} {:>6} {:>5}  {:<13} {}\n",
                metric.parameter.id(),
                metric.horizon,
                bucket,
                metric.mae,
                metric.bias,
                metric.rmse,
                metric.sample_count,
                metric.day_span,
                confidence_label(metric.confidence),
                format_interval(metric.bias_interval),
            ));
        }

        output.push('\n');
        output.push_str("═══════════════════════════════════════════════════════════════════════════════\n");

        let insufficient = metrics
            .iter()
            .filter(|m| m.confidence == Confidence::Insufficient)
            .count();
        if insufficient > 0 {
            output.push_str(&format!(
                "\n⚠️  {insufficient} of {} groups span fewer than 30 days of history.\n\n",
                metrics.len()
            ));
        }

        output
    }
}

fn confidence_label(confidence: Confidence) -> &'static str {
    match confidence {
        Confidence::Insufficient => "insufficient",
        Confidence::Preliminary => "preliminary",
        Confidence::Validated => "validated ✓",
    }
}

fn format_interval(interval: Option<Interval>) -> String {
    match interval {
        Some(ci) => format!("[{:+.2}, {:+.2}]", ci.lower, ci.upper),
        None => "n/a".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parameter::Parameter;
    use crate::records::TimeBucket;
    use chrono::{TimeZone, Utc};

    fn metric(location: &str, confidence: Confidence, interval: Option<Interval>) -> AccuracyMetric {
        AccuracyMetric {
            location_id: location.to_string(),
            model_id: "arome".to_string(),
            parameter: Parameter::WindSpeed,
            horizon: 6,
            time_bucket: TimeBucket::All,
            bucket_start: None,
            mae: 7.0,
            bias: -7.0,
            rmse: 7.0,
            sample_count: 1,
            distinct_days: 1,
            day_span: 1,
            confidence,
            bias_interval: interval,
            mae_interval: None,
            first_timestamp: Utc.with_ymd_and_hms(2024, 6, 1, 6, 0, 0).unwrap(),
            last_timestamp: Utc.with_ymd_and_hms(2024, 6, 1, 6, 0, 0).unwrap(),
        }
    }

    #[test]
    fn test_empty_report() {
        let report = MetricsFormatter::format(&[]);
        assert!(report.contains("No accuracy metrics available"));
    }

    #[test]
    fn test_report_lists_groups_and_labels() {
        let metrics = vec![
            metric("semnoz", Confidence::Validated, Some(Interval { lower: -8.0, upper: -6.0 })),
            metric("planfait", Confidence::Insufficient, None),
        ];
        let report = MetricsFormatter::format(&metrics);

        assert!(report.contains("planfait / arome"));
        assert!(report.contains("semnoz / arome"));
        assert!(report.find("planfait").unwrap() < report.find("semnoz").unwrap());
        assert!(report.contains("insufficient"));
        assert!(report.contains("[-8.00, -6.00]"));
        assert!(report.contains("n/a"));
        assert!(report.contains("1 of 2 groups"));
    }
}
