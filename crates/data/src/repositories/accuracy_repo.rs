use anyhow::Result;
use async_trait::async_trait;
use forecast_verify_core::{AccuracyMetric, MetricFilter, MetricStore, StoreError};
use sqlx::PgPool;
use tracing::info;

use crate::models::AccuracyMetricRecord;

/// Repository for derived accuracy metrics.
///
/// Metrics are recomputed from the deviation history, so every write replaces
/// the whole table in one transaction; readers never see a partial set.
#[derive(Debug, Clone)]
pub struct AccuracyMetricRepository {
    pool: PgPool,
}

impl AccuracyMetricRepository {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Deletes all metrics and inserts `records`.
    ///
    /// # Errors
    /// Returns an error if the transaction fails; the previous metrics remain.
    pub async fn replace_all(&self, records: &[AccuracyMetricRecord]) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM accuracy_metrics")
            .execute(&mut *tx)
            .await?;

        for r in records {
            sqlx::query(
                r#"
                INSERT INTO accuracy_metrics
                    (location_id, model_id, parameter, horizon, time_bucket, bucket_start,
                     mae, bias, rmse, sample_count, distinct_days, day_span, confidence,
                     bias_lower, bias_upper, mae_lower, mae_upper,
                     first_timestamp, last_timestamp)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10,
                        $11, $12, $13, $14, $15, $16, $17, $18, $19)
                "#,
            )
            .bind(&r.location_id)
            .bind(&r.model_id)
            .bind(&r.parameter)
            .bind(r.horizon)
            .bind(&r.time_bucket)
            .bind(r.bucket_start)
            .bind(r.mae)
            .bind(r.bias)
            .bind(r.rmse)
            .bind(r.sample_count)
            .bind(r.distinct_days)
            .bind(r.day_span)
            .bind(&r.confidence)
            .bind(r.bias_lower)
            .bind(r.bias_upper)
            .bind(r.mae_lower)
            .bind(r.mae_upper)
            .bind(r.first_timestamp)
            .bind(r.last_timestamp)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        info!(metrics = records.len(), "Accuracy metrics replaced");
        Ok(())
    }

    /// Queries metrics matching the column filters of `filter`.
    ///
    /// `min_confidence` is applied by the caller since confidence is stored
    /// as text.
    ///
    /// # Errors
    /// Returns an error if the database query fails.
    pub async fn query(&self, filter: &MetricFilter) -> Result<Vec<AccuracyMetricRecord>> {
        let records = sqlx::query_as::<_, AccuracyMetricRecord>(
            r#"
            SELECT location_id, model_id, parameter, horizon, time_bucket, bucket_start,
                   mae, bias, rmse, sample_count, distinct_days, day_span, confidence,
                   bias_lower, bias_upper, mae_lower, mae_upper,
                   first_timestamp, last_timestamp
            FROM accuracy_metrics
            WHERE ($1::TEXT IS NULL OR location_id = $1)
              AND ($2::TEXT IS NULL OR model_id = $2)
              AND ($3::TEXT IS NULL OR parameter = $3)
              AND ($4::INTEGER IS NULL OR horizon = $4)
              AND ($5::TEXT IS NULL OR time_bucket = $5)
            ORDER BY location_id, parameter, horizon, mae ASC, model_id, bucket_start
            "#,
        )
        .bind(filter.location_id.as_deref())
        .bind(filter.model_id.as_deref())
        .bind(filter.parameter.map(|p| p.id()))
        .bind(filter.horizon)
        .bind(filter.time_bucket.map(|b| b.as_str()))
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }
}

#[async_trait]
impl MetricStore for AccuracyMetricRepository {
    async fn replace_metrics(&self, metrics: &[AccuracyMetric]) -> Result<(), StoreError> {
        let records: Vec<AccuracyMetricRecord> = metrics.iter().map(AccuracyMetricRecord::from).collect();
        Ok(self.replace_all(&records).await?)
    }

    async fn metrics(&self, filter: &MetricFilter) -> Result<Vec<AccuracyMetric>, StoreError> {
        let mut metrics = Vec::new();
        for record in self.query(filter).await? {
            let metric = AccuracyMetric::try_from(record)?;
            if filter.matches(&metric) {
                metrics.push(metric);
            }
        }
        Ok(metrics)
    }
}
