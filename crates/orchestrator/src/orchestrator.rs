//! Single entry point for running a job, shared by the cron scheduler and
//! the `trigger` command.

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

use crate::cycle::{panic_message, CycleRunner, ForecastCycleReport, ObservationCycleReport, SourceOutcome};
use crate::jobs::{JobKind, JobRegistry, JobStatus};

#[derive(Debug, Clone, PartialEq)]
pub enum CycleReport {
    Forecast(ForecastCycleReport),
    Observation(ObservationCycleReport),
    Metrics { metrics: usize },
    Purge { purged: usize },
}

impl CycleReport {
    #[must_use]
    pub fn sources(&self) -> &[SourceOutcome] {
        match self {
            CycleReport::Forecast(r) => &r.sources,
            CycleReport::Observation(r) => &r.sources,
            _ => &[],
        }
    }

    /// Job status: failed only when sources ran and every one failed.
    #[must_use]
    pub fn status(&self) -> JobStatus {
        let sources = self.sources();
        if !sources.is_empty() && sources.iter().all(|s| s.status == JobStatus::Failed) {
            JobStatus::Failed
        } else {
            JobStatus::Succeeded
        }
    }

    /// One-line human summary.
    #[must_use]
    pub fn summary(&self) -> String {
        match self {
            CycleReport::Forecast(r) => {
                let failed = r.sources.iter().filter(|s| s.status == JobStatus::Failed).count();
                format!(
                    "forecast: {} sources ({} failed), {} readings staged",
                    r.sources.len(),
                    failed,
                    r.staged
                )
            }
            CycleReport::Observation(r) => format!(
                "observation: {} sources, {} pairs, {} deviations written, {} duplicates, {} sanity violations, {} purged",
                r.sources.len(),
                r.tally.pairs,
                r.tally.deviations_written,
                r.tally.duplicates,
                r.tally.sanity_violations,
                r.purged
            ),
            CycleReport::Metrics { metrics } => format!("metrics: {metrics} recomputed"),
            CycleReport::Purge { purged } => format!("purge: {purged} staged forecasts discarded"),
        }
    }
}

#[derive(Clone)]
pub struct Orchestrator {
    runner: Arc<CycleRunner>,
    jobs: JobRegistry,
}

impl Orchestrator {
    #[must_use]
    pub fn new(runner: CycleRunner, jobs: JobRegistry) -> Self {
        Self {
            runner: Arc::new(runner),
            jobs,
        }
    }

    #[must_use]
    pub fn jobs(&self) -> &JobRegistry {
        &self.jobs
    }

    #[must_use]
    pub fn runner(&self) -> &CycleRunner {
        &self.runner
    }

    /// Runs `kind` now. Returns `Ok(None)` if the previous invocation is
    /// still running. The job is marked finished on every path, including a
    /// panicking cycle, so the next invocation is not suppressed.
    ///
    /// # Errors
    /// Returns an error if the cycle itself fails (store unavailable).
    pub async fn trigger(&self, kind: JobKind) -> Result<Option<CycleReport>> {
        self.trigger_at(kind, Utc::now()).await
    }

    /// Runs `kind` as if the clock read `now`.
    ///
    /// # Errors
    /// Returns an error if the cycle itself fails (store unavailable).
    pub async fn trigger_at(&self, kind: JobKind, now: DateTime<Utc>) -> Result<Option<CycleReport>> {
        if !self.jobs.try_begin(kind, now).await {
            return Ok(None);
        }

        info!(job = %kind, "Job started");
        let started = Instant::now();
        let result = match AssertUnwindSafe(self.run(kind, now)).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => Err(anyhow!("{kind} cycle panicked: {}", panic_message(panic.as_ref()))),
        };
        let elapsed = started.elapsed();
        let duration_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);

        let status = match &result {
            Ok(report) => report.status(),
            Err(_) => JobStatus::Failed,
        };
        let finished = now + chrono::Duration::from_std(elapsed).unwrap_or_else(|_| chrono::Duration::zero());
        self.jobs.finish(kind, status, finished).await;

        if let Some(state) = self.jobs.state(kind).await {
            let expected = Duration::from_secs(state.schedule.expected_period_minutes * 60);
            if elapsed > expected {
                warn!(
                    job = %kind,
                    anomaly = "cycle_overrun",
                    duration_ms,
                    expected_ms = u64::try_from(expected.as_millis()).unwrap_or(u64::MAX),
                    "Cycle exceeded its expected period"
                );
            }
        }

        match &result {
            Ok(report) => info!(job = %kind, outcome = %status, duration_ms, summary = %report.summary(), "Job finished"),
            Err(e) => error!(job = %kind, outcome = %status, duration_ms, error = %e, "Job failed"),
        }
        result.map(Some)
    }

    async fn run(&self, kind: JobKind, now: DateTime<Utc>) -> Result<CycleReport> {
        Ok(match kind {
            JobKind::Forecast => CycleReport::Forecast(self.runner.run_forecast_cycle(now).await),
            JobKind::Observation => CycleReport::Observation(self.runner.run_observation_cycle(now).await?),
            JobKind::Metrics => CycleReport::Metrics {
                metrics: self.runner.recompute_metrics().await?,
            },
            JobKind::Purge => CycleReport::Purge {
                purged: self.runner.purge_expired(now).await?,
            },
        })
    }
}
