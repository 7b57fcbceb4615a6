//! Deviation row model.

use chrono::{DateTime, Utc};
use forecast_verify_core::Deviation;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// One row of the `deviations` table.
///
/// The parameter is stored as its identifier (`wind_speed`, ...) so the table
/// stays readable from plain SQL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct DeviationRecord {
    /// Forecast target time
    pub timestamp: DateTime<Utc>,
    pub location_id: String,
    pub model_id: String,
    pub parameter: String,
    pub horizon: i32,
    pub forecast_value: Decimal,
    pub observed_value: Decimal,
    pub deviation: Decimal,
    pub run_time: DateTime<Utc>,
    pub observed_at: DateTime<Utc>,
}

impl From<&Deviation> for DeviationRecord {
    fn from(d: &Deviation) -> Self {
        Self {
            timestamp: d.timestamp,
            location_id: d.location_id.clone(),
            model_id: d.model_id.clone(),
            parameter: d.parameter.id().to_string(),
            horizon: d.horizon,
            forecast_value: d.forecast_value,
            observed_value: d.observed_value,
            deviation: d.deviation,
            run_time: d.run_time,
            observed_at: d.observed_at,
        }
    }
}

impl TryFrom<DeviationRecord> for Deviation {
    type Error = anyhow::Error;

    fn try_from(r: DeviationRecord) -> anyhow::Result<Self> {
        Ok(Self {
            timestamp: r.timestamp,
            location_id: r.location_id,
            model_id: r.model_id,
            parameter: r.parameter.parse()?,
            horizon: r.horizon,
            forecast_value: r.forecast_value,
            observed_value: r.observed_value,
            deviation: r.deviation,
            run_time: r.run_time,
            observed_at: r.observed_at,
        })
    }
}
