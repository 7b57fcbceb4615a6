//! In-memory store implementing every store trait.
//!
//! Used for `--dry-run` and tests. Semantics follow the PostgreSQL
//! repositories: deviations are append-only with a unique natural key,
//! staging skips duplicate `(model, location, parameter, run, target)` rows,
//! and metrics are replaced wholesale.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use forecast_verify_core::{
    AccuracyMetric, Deviation, DeviationFilter, DeviationStore, ForecastStaging, MetricFilter,
    MetricStore, RawReading, StagedForecast, StoreError, TimeWindow,
};
use std::collections::BTreeMap;
use tokio::sync::RwLock;

#[derive(Debug, Default)]
struct Staging {
    next_id: i64,
    rows: BTreeMap<i64, StagedForecast>,
}

impl Staging {
    fn contains(&self, f: &StagedForecast) -> bool {
        self.rows.values().any(|s| {
            s.model_id == f.model_id
                && s.location_id == f.location_id
                && s.parameter == f.parameter
                && s.run_time == f.run_time
                && s.target_time == f.target_time
        })
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    deviations: RwLock<Vec<Deviation>>,
    staging: RwLock<Staging>,
    metrics: RwLock<Vec<AccuracyMetric>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of rows currently staged.
    pub async fn staged_count(&self) -> usize {
        self.staging.read().await.rows.len()
    }

    pub async fn deviation_count(&self) -> usize {
        self.deviations.read().await.len()
    }
}

#[async_trait]
impl DeviationStore for MemoryStore {
    async fn insert_deviation(&self, deviation: &Deviation) -> Result<(), StoreError> {
        let mut deviations = self.deviations.write().await;
        if deviations.iter().any(|d| d.same_key(deviation)) {
            return Err(StoreError::DuplicateKey(deviation.natural_key()));
        }
        deviations.push(deviation.clone());
        Ok(())
    }

    async fn has_forecast_run(
        &self,
        model_id: &str,
        location_id: &str,
        run_time: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        Ok(self.deviations.read().await.iter().any(|d| {
            d.model_id == model_id && d.location_id == location_id && d.run_time == run_time
        }))
    }

    async fn deviations(&self, filter: &DeviationFilter) -> Result<Vec<Deviation>, StoreError> {
        let mut found: Vec<Deviation> = self
            .deviations
            .read()
            .await
            .iter()
            .filter(|d| filter.matches(d))
            .cloned()
            .collect();
        found.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        Ok(found)
    }
}

#[async_trait]
impl ForecastStaging for MemoryStore {
    async fn stage(&self, readings: &[RawReading]) -> Result<usize, StoreError> {
        let mut staging = self.staging.write().await;
        let mut inserted = 0;
        for reading in readings {
            let id = staging.next_id + 1;
            let Some(forecast) = StagedForecast::from_reading(id, reading) else {
                continue;
            };
            if staging.contains(&forecast) {
                continue;
            }
            staging.next_id = id;
            staging.rows.insert(id, forecast);
            inserted += 1;
        }
        Ok(inserted)
    }

    async fn has_staged_run(
        &self,
        model_id: &str,
        location_id: &str,
        run_time: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        Ok(self.staging.read().await.rows.values().any(|s| {
            s.model_id == model_id && s.location_id == location_id && s.run_time == run_time
        }))
    }

    async fn pending_for(
        &self,
        location_id: &str,
        window: TimeWindow,
    ) -> Result<Vec<StagedForecast>, StoreError> {
        Ok(self
            .staging
            .read()
            .await
            .rows
            .values()
            .filter(|s| s.location_id == location_id && window.contains(s.target_time))
            .cloned()
            .collect())
    }

    async fn release(&self, ids: &[i64]) -> Result<usize, StoreError> {
        let mut staging = self.staging.write().await;
        Ok(ids.iter().filter(|id| staging.rows.remove(id).is_some()).count())
    }

    async fn purge_expired(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut staging = self.staging.write().await;
        let before = staging.rows.len();
        staging.rows.retain(|_, s| s.target_time >= cutoff);
        Ok(before - staging.rows.len())
    }
}

#[async_trait]
impl MetricStore for MemoryStore {
    async fn replace_metrics(&self, metrics: &[AccuracyMetric]) -> Result<(), StoreError> {
        *self.metrics.write().await = metrics.to_vec();
        Ok(())
    }

    async fn metrics(&self, filter: &MetricFilter) -> Result<Vec<AccuracyMetric>, StoreError> {
        Ok(self
            .metrics
            .read()
            .await
            .iter()
            .filter(|m| filter.matches(m))
            .cloned()
            .collect())
    }
}
