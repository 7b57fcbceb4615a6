//! One pass of each job: forecast collection, observation matching, metric
//! recompute and staging purge.
//!
//! Sources run concurrently within a cycle and every source call is bounded
//! by the configured timeout. A failing source only changes its own
//! [`SourceOutcome`]; the rest of the cycle carries on.

use anyhow::Result;
use chrono::{DateTime, Utc};
use forecast_verify_analysis::{compute_all, compute_deviation, MatchOutcome, MatchingEngine};
use forecast_verify_collectors::{CollectorRegistry, RegisteredModel, RegisteredSource};
use forecast_verify_core::{
    AppConfig, CollectError, ConfigurationError, DeviationFilter, DeviationStore, ForecastStaging,
    HorizonSet, Location, MatchingConfig, MetricStore, RawReading, StoreError, TimeBucket,
    TimeWindow,
};
use futures_util::future::join_all;
use futures_util::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::jobs::JobStatus;

/// The three stores a cycle writes to.
#[derive(Clone)]
pub struct Stores {
    pub staging: Arc<dyn ForecastStaging>,
    pub deviations: Arc<dyn DeviationStore>,
    pub metrics: Arc<dyn MetricStore>,
}

impl Stores {
    /// Uses one backend for all three stores.
    pub fn shared<S>(store: Arc<S>) -> Self
    where
        S: ForecastStaging + DeviationStore + MetricStore + 'static,
    {
        Self {
            staging: store.clone(),
            deviations: store.clone(),
            metrics: store,
        }
    }
}

/// What happened to one source during one cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceOutcome {
    pub source: String,
    pub status: JobStatus,
    pub readings: usize,
    /// Locations skipped because there was nothing to do
    pub skipped_locations: usize,
    pub failed_locations: Vec<String>,
    pub duration: Duration,
    pub error: Option<String>,
}

impl SourceOutcome {
    fn started(source: &str) -> Self {
        Self {
            source: source.to_string(),
            status: JobStatus::Running,
            readings: 0,
            skipped_locations: 0,
            failed_locations: Vec::new(),
            duration: Duration::ZERO,
            error: None,
        }
    }

    fn fail(mut self, error: impl Into<String>, started: Instant) -> Self {
        self.status = JobStatus::Failed;
        self.error = Some(error.into());
        self.duration = started.elapsed();
        self
    }

    fn succeed(mut self, started: Instant) -> Self {
        self.status = JobStatus::Succeeded;
        self.duration = started.elapsed();
        self
    }

    fn log(&self, job: &str) {
        let duration_ms = u64::try_from(self.duration.as_millis()).unwrap_or(u64::MAX);
        match self.status {
            JobStatus::Failed => warn!(
                job,
                source = %self.source,
                outcome = %self.status,
                readings = self.readings,
                failed_locations = self.failed_locations.len(),
                duration_ms,
                error = self.error.as_deref().unwrap_or(""),
                "Source finished"
            ),
            _ => info!(
                job,
                source = %self.source,
                outcome = %self.status,
                readings = self.readings,
                skipped_locations = self.skipped_locations,
                failed_locations = self.failed_locations.len(),
                duration_ms,
                "Source finished"
            ),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ForecastCycleReport {
    pub sources: Vec<SourceOutcome>,
    /// Rows added to staging
    pub staged: usize,
}

/// Counters of the observation pipeline, summed over sources and locations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ObservationTally {
    pub pairs: usize,
    pub deviations_written: usize,
    pub duplicates: usize,
    pub sanity_violations: usize,
    pub unmatched_observations: usize,
    pub out_of_horizon: usize,
    pub released: usize,
}

impl ObservationTally {
    fn merge(&mut self, other: ObservationTally) {
        self.pairs += other.pairs;
        self.deviations_written += other.deviations_written;
        self.duplicates += other.duplicates;
        self.sanity_violations += other.sanity_violations;
        self.unmatched_observations += other.unmatched_observations;
        self.out_of_horizon += other.out_of_horizon;
        self.released += other.released;
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ObservationCycleReport {
    pub sources: Vec<SourceOutcome>,
    /// Staged forecasts discarded on retention expiry before matching
    pub purged: usize,
    pub tally: ObservationTally,
}

pub struct CycleRunner {
    collectors: CollectorRegistry,
    locations: Vec<Location>,
    horizons: HorizonSet,
    engine: MatchingEngine,
    matching: MatchingConfig,
    stores: Stores,
    source_timeout: Duration,
    time_buckets: Vec<TimeBucket>,
}

impl CycleRunner {
    /// # Errors
    /// Returns [`ConfigurationError`] if the horizon buckets are invalid.
    pub fn new(
        config: &AppConfig,
        collectors: CollectorRegistry,
        stores: Stores,
    ) -> Result<Self, ConfigurationError> {
        let horizons = config.horizon_set()?;
        Ok(Self {
            collectors,
            locations: config.locations.clone(),
            engine: MatchingEngine::from_config(&config.matching, horizons.clone()),
            horizons,
            matching: config.matching.clone(),
            stores,
            source_timeout: Duration::from_secs(config.schedule.source_timeout_secs),
            time_buckets: vec![TimeBucket::All, TimeBucket::Month, TimeBucket::Week],
        })
    }

    #[must_use]
    pub fn with_source_timeout(mut self, timeout: Duration) -> Self {
        self.source_timeout = timeout;
        self
    }

    #[must_use]
    pub fn collectors(&self) -> &CollectorRegistry {
        &self.collectors
    }

    #[must_use]
    pub fn stores(&self) -> &Stores {
        &self.stores
    }

    // ========================================================================
    // Forecast cycle
    // ========================================================================

    /// Fetches the current run of every model and stages its readings.
    pub async fn run_forecast_cycle(&self, now: DateTime<Utc>) -> ForecastCycleReport {
        let results = join_all(
            self.collectors
                .models()
                .iter()
                .map(|model| self.collect_model(model, now)),
        )
        .await;

        let mut report = ForecastCycleReport::default();
        for (outcome, staged) in results {
            outcome.log("forecast");
            report.staged += staged;
            report.sources.push(outcome);
        }
        report
    }

    async fn collect_model(&self, model: &RegisteredModel, now: DateTime<Utc>) -> (SourceOutcome, usize) {
        let started = Instant::now();
        let model_id = model.config.id.as_str();
        let mut outcome = SourceOutcome::started(model_id);

        let Some(run_time) = model.config.runs.select_run(now, self.horizons.max_lead()) else {
            debug!(model = model_id, "No published run yet");
            outcome.skipped_locations = self.locations.len();
            return (outcome.succeed(started), 0);
        };

        let mut pending = Vec::new();
        for location in &self.locations {
            match self.run_collected(model_id, &location.id, run_time).await {
                Ok(true) => outcome.skipped_locations += 1,
                Ok(false) => pending.push(location.clone()),
                Err(e) => return (outcome.fail(format!("store: {e}"), started), 0),
            }
        }
        if pending.is_empty() {
            debug!(model = model_id, run_time = %run_time, "Run already collected for every location");
            return (outcome.succeed(started), 0);
        }

        info!(
            job = "forecast",
            source = model_id,
            run_time = %run_time,
            locations = pending.len(),
            "Source started"
        );

        let fetch = AssertUnwindSafe(model.collector.fetch_forecasts(&pending, run_time)).catch_unwind();
        let batch = match tokio::time::timeout(self.source_timeout, fetch).await {
            Ok(Ok(batch)) => batch,
            Ok(Err(panic)) => {
                outcome.failed_locations = pending.iter().map(|l| l.id.clone()).collect();
                return (
                    outcome.fail(format!("collector panicked: {}", panic_message(panic.as_ref())), started),
                    0,
                );
            }
            Err(_) => {
                outcome.failed_locations = pending.iter().map(|l| l.id.clone()).collect();
                return (
                    outcome.fail(format!("timed out after {:?}", self.source_timeout), started),
                    0,
                );
            }
        };

        for (location, error) in &batch.failures {
            log_collect_error(model_id, location, error);
        }
        for gap in &batch.gaps {
            warn!(source = model_id, segment = %gap.segment, steps = ?gap.steps, error = %gap.error, "Grid segment gap");
        }
        outcome.failed_locations = batch.failures.iter().map(|(l, _)| l.clone()).collect();

        let max_lead = self.horizons.max_lead();
        let keep: Vec<RawReading> = batch
            .readings
            .iter()
            .filter(|r| model.config.parameters.contains(&r.parameter))
            .filter(|r| r.lead_hours().is_some_and(|lead| (0..=max_lead).contains(&lead)))
            .cloned()
            .collect();
        outcome.readings = keep.len();

        let staged = match self.stores.staging.stage(&keep).await {
            Ok(n) => n,
            Err(e) => return (outcome.fail(format!("store: {e}"), started), 0),
        };

        if batch.is_total_failure() {
            let error = batch
                .failures
                .first()
                .map(|(_, e)| e.to_string())
                .or_else(|| batch.gaps.first().map(|g| g.error.clone()))
                .unwrap_or_default();
            (outcome.fail(error, started), staged)
        } else {
            (outcome.succeed(started), staged)
        }
    }

    /// True when this run was already staged or already produced deviations.
    async fn run_collected(
        &self,
        model_id: &str,
        location_id: &str,
        run_time: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        if self.stores.staging.has_staged_run(model_id, location_id, run_time).await? {
            return Ok(true);
        }
        self.stores.deviations.has_forecast_run(model_id, location_id, run_time).await
    }

    // ========================================================================
    // Observation cycle
    // ========================================================================

    /// Purges expired staging, then fetches observations, matches them and
    /// writes deviations.
    ///
    /// # Errors
    /// Returns an error only if the purge fails; per-source failures are
    /// reported in the outcome.
    pub async fn run_observation_cycle(&self, now: DateTime<Utc>) -> Result<ObservationCycleReport> {
        let purged = self.purge_expired(now).await?;
        let window = TimeWindow::ending_at(now, self.matching.observation_lookback_hours);

        let results = join_all(
            self.collectors
                .sources()
                .iter()
                .map(|source| self.observe_source(source, window)),
        )
        .await;

        let mut report = ObservationCycleReport {
            purged,
            ..ObservationCycleReport::default()
        };
        for (outcome, tally) in results {
            outcome.log("observation");
            report.tally.merge(tally);
            report.sources.push(outcome);
        }

        info!(
            job = "observation",
            purged,
            pairs = report.tally.pairs,
            deviations = report.tally.deviations_written,
            duplicates = report.tally.duplicates,
            sanity_violations = report.tally.sanity_violations,
            "Observation cycle complete"
        );
        Ok(report)
    }

    async fn observe_source(
        &self,
        source: &RegisteredSource,
        window: TimeWindow,
    ) -> (SourceOutcome, ObservationTally) {
        let started = Instant::now();
        let source_id = source.config.id.as_str();
        let mut outcome = SourceOutcome::started(source_id);
        let mut tally = ObservationTally::default();
        let mut attempted = 0usize;
        let candidates = window.widen(self.engine.tolerance());

        for location in &self.locations {
            let pending = match self.stores.staging.pending_for(&location.id, candidates).await {
                Ok(pending) => pending,
                Err(e) => {
                    warn!(source = source_id, location = %location.id, error = %e, "Failed to load staged forecasts");
                    outcome.failed_locations.push(location.id.clone());
                    continue;
                }
            };
            if pending.is_empty() {
                outcome.skipped_locations += 1;
                continue;
            }

            attempted += 1;
            let fetch = AssertUnwindSafe(source.collector.fetch_observation(location, window)).catch_unwind();
            let observations = match tokio::time::timeout(self.source_timeout, fetch).await {
                Ok(Ok(Ok(readings))) => readings,
                Ok(Ok(Err(e))) => {
                    log_collect_error(source_id, &location.id, &e);
                    outcome.error = Some(e.to_string());
                    outcome.failed_locations.push(location.id.clone());
                    continue;
                }
                Ok(Err(panic)) => {
                    let message = panic_message(panic.as_ref());
                    warn!(source = source_id, location = %location.id, error = %message, "Observation collector panicked");
                    outcome.error = Some(format!("collector panicked: {message}"));
                    outcome.failed_locations.push(location.id.clone());
                    continue;
                }
                Err(_) => {
                    warn!(source = source_id, location = %location.id, timeout = ?self.source_timeout, "Observation fetch timed out");
                    outcome.error = Some(format!("timed out after {:?}", self.source_timeout));
                    outcome.failed_locations.push(location.id.clone());
                    continue;
                }
            };

            let observations: Vec<RawReading> = observations
                .into_iter()
                .filter(|r| !r.is_forecast() && source.config.parameters.contains(&r.parameter))
                .collect();
            outcome.readings += observations.len();

            let matched = self.engine.match_readings(&pending, &observations);
            match self.persist(&matched).await {
                Ok(location_tally) => tally.merge(location_tally),
                Err(e) => {
                    warn!(source = source_id, location = %location.id, error = %e, "Failed to persist deviations");
                    outcome.error = Some(e.to_string());
                    outcome.failed_locations.push(location.id.clone());
                }
            }
        }

        let outcome = if attempted > 0 && outcome.failed_locations.len() >= attempted {
            let error = outcome.error.clone().unwrap_or_default();
            outcome.fail(error, started)
        } else {
            outcome.succeed(started)
        };
        (outcome, tally)
    }

    /// Writes the deviations of one matching pass and releases the consumed
    /// staged forecasts.
    async fn persist(&self, matched: &MatchOutcome) -> Result<ObservationTally, StoreError> {
        let mut tally = ObservationTally {
            pairs: matched.pairs.len(),
            unmatched_observations: matched.unmatched_observations,
            out_of_horizon: matched.out_of_horizon.len(),
            ..ObservationTally::default()
        };

        for pair in &matched.pairs {
            let deviation = match compute_deviation(pair) {
                Ok(d) => d,
                Err(violation) => {
                    warn!(
                        alert = "sanity_violation",
                        location = %pair.location_id,
                        model = %pair.model_id,
                        parameter = %violation.parameter,
                        value = violation.value,
                        "Implausible value; no deviation recorded"
                    );
                    tally.sanity_violations += 1;
                    continue;
                }
            };

            match self.stores.deviations.insert_deviation(&deviation).await {
                Ok(()) => tally.deviations_written += 1,
                Err(StoreError::DuplicateKey(key)) => {
                    debug!(key = %key, "Deviation already recorded");
                    tally.duplicates += 1;
                }
                Err(e) => return Err(e),
            }
        }

        let mut consumed = matched.matched_forecast_ids();
        consumed.extend(&matched.out_of_horizon);
        tally.released = self.stores.staging.release(&consumed).await?;
        Ok(tally)
    }

    // ========================================================================
    // Metrics and purge
    // ========================================================================

    /// Recomputes every accuracy metric from the full deviation history.
    ///
    /// # Errors
    /// Returns an error if reading deviations or replacing metrics fails.
    pub async fn recompute_metrics(&self) -> Result<usize> {
        let deviations = self.stores.deviations.deviations(&DeviationFilter::default()).await?;
        let metrics = compute_all(&deviations, &self.time_buckets);
        self.stores.metrics.replace_metrics(&metrics).await?;
        info!(job = "metrics", deviations = deviations.len(), metrics = metrics.len(), "Metrics recomputed");
        Ok(metrics.len())
    }

    /// Discards staged forecasts whose target time is older than the
    /// retention window.
    ///
    /// # Errors
    /// Returns an error if the staging store fails.
    pub async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let cutoff = now - self.matching.retention();
        let purged = self.stores.staging.purge_expired(cutoff).await?;
        if purged > 0 {
            info!(job = "purge", purged, cutoff = %cutoff, "Expired staged forecasts discarded");
        }
        Ok(purged)
    }
}

/// Text of a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn log_collect_error(source_id: &str, location_id: &str, error: &CollectError) {
    match error {
        CollectError::Parsing(_) => warn!(
            alert = "parsing_error",
            source = source_id,
            location = location_id,
            error = %error,
            "Upstream payload could not be parsed"
        ),
        _ => warn!(
            source = source_id,
            location = location_id,
            kind = error.kind(),
            error = %error,
            "Collection failed"
        ),
    }
}
