//! Row models for the verification tables.
//!
//! Models derive `sqlx::FromRow` and convert to and from the core records.
//! Enumerations are stored as their string identifiers.

pub mod accuracy_metric;
pub mod deviation;
pub mod staged_forecast;

pub use accuracy_metric::AccuracyMetricRecord;
pub use deviation::DeviationRecord;
pub use staged_forecast::StagedForecastRecord;
