//! Deviation repository.
//!
//! The table is append-only: rows are inserted once and never updated.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use forecast_verify_core::{Deviation, DeviationFilter, DeviationStore, StoreError};
use sqlx::PgPool;

use crate::models::DeviationRecord;

#[derive(Debug, Clone)]
pub struct DeviationRepository {
    pool: PgPool,
}

impl DeviationRepository {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Inserts a deviation row. Returns `false` when the natural key already
    /// exists; the stored row is not modified.
    ///
    /// # Errors
    /// Returns an error if the database operation fails.
    pub async fn insert(&self, record: &DeviationRecord) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO deviations
                (timestamp, location_id, model_id, parameter, horizon,
                 forecast_value, observed_value, deviation, run_time, observed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (timestamp, location_id, model_id, parameter, horizon) DO NOTHING
            "#,
        )
        .bind(record.timestamp)
        .bind(&record.location_id)
        .bind(&record.model_id)
        .bind(&record.parameter)
        .bind(record.horizon)
        .bind(record.forecast_value)
        .bind(record.observed_value)
        .bind(record.deviation)
        .bind(record.run_time)
        .bind(record.observed_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Queries deviations matching `filter`, oldest first.
    ///
    /// # Errors
    /// Returns an error if the database query fails.
    pub async fn query(&self, filter: &DeviationFilter) -> Result<Vec<DeviationRecord>> {
        let records = sqlx::query_as::<_, DeviationRecord>(
            r#"
            SELECT timestamp, location_id, model_id, parameter, horizon,
                   forecast_value, observed_value, deviation, run_time, observed_at
            FROM deviations
            WHERE ($1::TEXT IS NULL OR location_id = $1)
              AND ($2::TEXT IS NULL OR model_id = $2)
              AND ($3::TEXT IS NULL OR parameter = $3)
              AND ($4::INTEGER IS NULL OR horizon = $4)
              AND ($5::TIMESTAMPTZ IS NULL OR timestamp >= $5)
              AND ($6::TIMESTAMPTZ IS NULL OR timestamp < $6)
            ORDER BY timestamp ASC, location_id, model_id, parameter, horizon
            "#,
        )
        .bind(filter.location_id.as_deref())
        .bind(filter.model_id.as_deref())
        .bind(filter.parameter.map(|p| p.id()))
        .bind(filter.horizon)
        .bind(filter.from)
        .bind(filter.to)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    /// True when at least one deviation came from this run.
    ///
    /// # Errors
    /// Returns an error if the database query fails.
    pub async fn run_exists(
        &self,
        model_id: &str,
        location_id: &str,
        run_time: DateTime<Utc>,
    ) -> Result<bool> {
        let exists: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM deviations
                WHERE model_id = $1 AND location_id = $2 AND run_time = $3
            )
            "#,
        )
        .bind(model_id)
        .bind(location_id)
        .bind(run_time)
        .fetch_one(&self.pool)
        .await?;

        Ok(exists)
    }

    /// Number of stored deviations.
    ///
    /// # Errors
    /// Returns an error if the database query fails.
    pub async fn count(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM deviations")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

#[async_trait]
impl DeviationStore for DeviationRepository {
    async fn insert_deviation(&self, deviation: &Deviation) -> Result<(), StoreError> {
        if self.insert(&DeviationRecord::from(deviation)).await? {
            Ok(())
        } else {
            Err(StoreError::DuplicateKey(deviation.natural_key()))
        }
    }

    async fn has_forecast_run(
        &self,
        model_id: &str,
        location_id: &str,
        run_time: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        Ok(self.run_exists(model_id, location_id, run_time).await?)
    }

    async fn deviations(&self, filter: &DeviationFilter) -> Result<Vec<Deviation>, StoreError> {
        let records = self.query(filter).await?;
        let deviations = records
            .into_iter()
            .map(Deviation::try_from)
            .collect::<Result<Vec<_>>>()?;
        Ok(deviations)
    }
}
