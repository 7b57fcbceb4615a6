use chrono::{DateTime, Utc};
use forecast_verify_core::StagedForecast;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// One row of the `staged_forecasts` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct StagedForecastRecord {
    pub id: i64,
    pub location_id: String,
    pub parameter: String,
    pub model_id: String,
    pub source_id: String,
    pub run_time: DateTime<Utc>,
    pub target_time: DateTime<Utc>,
    pub value: Decimal,
}

impl TryFrom<StagedForecastRecord> for StagedForecast {
    type Error = anyhow::Error;

    fn try_from(r: StagedForecastRecord) -> anyhow::Result<Self> {
        Ok(Self {
            id: r.id,
            location_id: r.location_id,
            parameter: r.parameter.parse()?,
            model_id: r.model_id,
            source_id: r.source_id,
            run_time: r.run_time,
            target_time: r.target_time,
            value: r.value,
        })
    }
}
