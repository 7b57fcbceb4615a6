use crate::error::{CollectError, StoreError};
use crate::reading::{Location, RawReading, TimeWindow};
use crate::records::{AccuracyMetric, Deviation, DeviationFilter, MetricFilter, StagedForecast};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::warn;

/// A downloaded segment that produced no readings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GridGap {
    /// Segment name as configured
    pub segment: String,
    /// Lead-time steps (hours) the segment would have covered
    pub steps: Vec<i64>,
    pub error: String,
}

/// Result of fetching one run for many locations.
#[derive(Debug, Default)]
pub struct ForecastBatch {
    pub readings: Vec<RawReading>,
    /// Per-location failures; other locations are unaffected
    pub failures: Vec<(String, CollectError)>,
    pub gaps: Vec<GridGap>,
}

impl ForecastBatch {
    #[must_use]
    pub fn is_total_failure(&self) -> bool {
        self.readings.is_empty() && (!self.failures.is_empty() || !self.gaps.is_empty())
    }
}

#[async_trait]
pub trait ForecastCollector: Send + Sync {
    /// Identifier of the upstream source.
    fn source_id(&self) -> &str;

    /// Fetches one run's forecast for one location.
    async fn fetch_forecast(
        &self,
        location: &Location,
        run_time: DateTime<Utc>,
    ) -> Result<Vec<RawReading>, CollectError>;

    /// Fetches one run for several locations, isolating per-location failures.
    async fn fetch_forecasts(&self, locations: &[Location], run_time: DateTime<Utc>) -> ForecastBatch {
        let mut batch = ForecastBatch::default();
        for location in locations {
            match self.fetch_forecast(location, run_time).await {
                Ok(readings) => batch.readings.extend(readings),
                Err(e) => {
                    warn!(
                        source = self.source_id(),
                        location = %location.id,
                        error = %e,
                        "Forecast fetch failed for location"
                    );
                    batch.failures.push((location.id.clone(), e));
                }
            }
        }
        batch
    }
}

#[async_trait]
pub trait ObservationCollector: Send + Sync {
    fn source_id(&self) -> &str;

    /// Fetches observations recorded within `window` at `location`.
    async fn fetch_observation(
        &self,
        location: &Location,
        window: TimeWindow,
    ) -> Result<Vec<RawReading>, CollectError>;
}

/// Append-only store of deviations.
#[async_trait]
pub trait DeviationStore: Send + Sync {
    /// Inserts one deviation; an existing natural key yields
    /// [`StoreError::DuplicateKey`] and leaves the stored row untouched.
    async fn insert_deviation(&self, deviation: &Deviation) -> Result<(), StoreError>;

    /// True if any deviation was derived from this model run at this location.
    async fn has_forecast_run(
        &self,
        model_id: &str,
        location_id: &str,
        run_time: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    async fn deviations(&self, filter: &DeviationFilter) -> Result<Vec<Deviation>, StoreError>;
}

/// Transient staging of forecasts awaiting observations.
#[async_trait]
pub trait ForecastStaging: Send + Sync {
    /// Stages forecast readings; returns how many rows were added.
    /// Observation readings are ignored.
    async fn stage(&self, readings: &[RawReading]) -> Result<usize, StoreError>;

    async fn has_staged_run(
        &self,
        model_id: &str,
        location_id: &str,
        run_time: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Staged forecasts for `location_id` with target time in `window`.
    async fn pending_for(
        &self,
        location_id: &str,
        window: TimeWindow,
    ) -> Result<Vec<StagedForecast>, StoreError>;

    /// Releases matched rows.
    async fn release(&self, ids: &[i64]) -> Result<usize, StoreError>;

    /// Deletes rows whose target time is before `cutoff`.
    async fn purge_expired(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError>;
}

/// Derived metrics, replaced wholesale on recompute.
#[async_trait]
pub trait MetricStore: Send + Sync {
    async fn replace_metrics(&self, metrics: &[AccuracyMetric]) -> Result<(), StoreError>;

    async fn metrics(&self, filter: &MetricFilter) -> Result<Vec<AccuracyMetric>, StoreError>;
}
