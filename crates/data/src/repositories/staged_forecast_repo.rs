//! Staging table for forecasts awaiting their observation.
//!
//! Rows are deleted when matched (`release`) or when their target time falls
//! out of the retention window (`purge_expired`).

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use forecast_verify_core::{
    ForecastStaging, RawReading, StagedForecast, StoreError, TimeWindow,
};
use sqlx::PgPool;
use tracing::debug;

use crate::models::StagedForecastRecord;

#[derive(Debug, Clone)]
pub struct StagedForecastRepository {
    pool: PgPool,
}

impl StagedForecastRepository {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Inserts forecasts in one transaction, skipping rows already staged.
    /// Returns the number of new rows.
    ///
    /// # Errors
    /// Returns an error if the database transaction fails.
    pub async fn insert_batch(&self, forecasts: &[StagedForecast]) -> Result<usize> {
        if forecasts.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await?;
        let mut inserted = 0u64;

        for chunk in forecasts.chunks(100) {
            for f in chunk {
                let result = sqlx::query(
                    r#"
                    INSERT INTO staged_forecasts
                        (location_id, parameter, model_id, source_id, run_time, target_time, value)
                    VALUES ($1, $2, $3, $4, $5, $6, $7)
                    ON CONFLICT (model_id, location_id, parameter, run_time, target_time) DO NOTHING
                    "#,
                )
                .bind(&f.location_id)
                .bind(f.parameter.id())
                .bind(&f.model_id)
                .bind(&f.source_id)
                .bind(f.run_time)
                .bind(f.target_time)
                .bind(f.value)
                .execute(&mut *tx)
                .await?;
                inserted += result.rows_affected();
            }
        }

        tx.commit().await?;
        Ok(usize::try_from(inserted)?)
    }

    /// Rows for `location_id` whose target time lies in `[start, end)`.
    ///
    /// # Errors
    /// Returns an error if the database query fails.
    pub async fn query_pending(
        &self,
        location_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<StagedForecastRecord>> {
        let records = sqlx::query_as::<_, StagedForecastRecord>(
            r#"
            SELECT id, location_id, parameter, model_id, source_id, run_time, target_time, value
            FROM staged_forecasts
            WHERE location_id = $1
              AND target_time >= $2 AND target_time < $3
            ORDER BY target_time ASC, id ASC
            "#,
        )
        .bind(location_id)
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

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
                SELECT 1 FROM staged_forecasts
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

    /// # Errors
    /// Returns an error if the database operation fails.
    pub async fn delete_ids(&self, ids: &[i64]) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let result = sqlx::query("DELETE FROM staged_forecasts WHERE id = ANY($1)")
            .bind(ids)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// # Errors
    /// Returns an error if the database operation fails.
    pub async fn delete_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM staged_forecasts WHERE target_time < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl ForecastStaging for StagedForecastRepository {
    async fn stage(&self, readings: &[RawReading]) -> Result<usize, StoreError> {
        let forecasts: Vec<StagedForecast> = readings
            .iter()
            .filter_map(|r| StagedForecast::from_reading(0, r))
            .collect();
        let inserted = self.insert_batch(&forecasts).await?;
        debug!(offered = forecasts.len(), inserted, "Staged forecasts");
        Ok(inserted)
    }

    async fn has_staged_run(
        &self,
        model_id: &str,
        location_id: &str,
        run_time: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        Ok(self.run_exists(model_id, location_id, run_time).await?)
    }

    async fn pending_for(
        &self,
        location_id: &str,
        window: TimeWindow,
    ) -> Result<Vec<StagedForecast>, StoreError> {
        let records = self.query_pending(location_id, window.start, window.end).await?;
        let staged = records
            .into_iter()
            .map(StagedForecast::try_from)
            .collect::<Result<Vec<_>>>()?;
        Ok(staged)
    }

    async fn release(&self, ids: &[i64]) -> Result<usize, StoreError> {
        let deleted = self.delete_ids(ids).await?;
        Ok(usize::try_from(deleted).map_err(anyhow::Error::from)?)
    }

    async fn purge_expired(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        let deleted = self.delete_before(cutoff).await?;
        Ok(usize::try_from(deleted).map_err(anyhow::Error::from)?)
    }
}
