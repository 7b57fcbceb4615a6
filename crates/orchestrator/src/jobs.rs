//! Job registry: name, cadence, last run, last status and the running flag
//! of every scheduled job.
//!
//! The scheduler and manual triggers share one registry, so a trigger issued
//! while the same job is running is suppressed exactly like an overlapping
//! cron tick.

use chrono::{DateTime, Utc};
use forecast_verify_core::{JobSchedule, ScheduleConfig};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Forecast,
    Observation,
    Metrics,
    Purge,
}

impl JobKind {
    #[must_use]
    pub fn all() -> [JobKind; 4] {
        [
            JobKind::Forecast,
            JobKind::Observation,
            JobKind::Metrics,
            JobKind::Purge,
        ]
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Forecast => "forecast",
            JobKind::Observation => "observation",
            JobKind::Metrics => "metrics",
            JobKind::Purge => "purge",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "forecast" => Ok(JobKind::Forecast),
            "observation" => Ok(JobKind::Observation),
            "metrics" => Ok(JobKind::Metrics),
            "purge" => Ok(JobKind::Purge),
            other => Err(anyhow::anyhow!(
                "Invalid job: '{other}'. Valid values: forecast, observation, metrics, purge"
            )),
        }
    }
}

/// Lifecycle of a job, or of one source within a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl JobStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobState {
    pub schedule: JobSchedule,
    pub status: JobStatus,
    pub last_started: Option<DateTime<Utc>>,
    pub last_finished: Option<DateTime<Utc>>,
    /// Overlapping invocations suppressed since startup
    pub suppressed: u64,
}

impl JobState {
    fn new(schedule: JobSchedule) -> Self {
        Self {
            schedule,
            status: JobStatus::Pending,
            last_started: None,
            last_finished: None,
            suppressed: 0,
        }
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.status == JobStatus::Running
    }
}

#[derive(Debug, Clone)]
pub struct JobRegistry {
    jobs: Arc<RwLock<HashMap<JobKind, JobState>>>,
}

impl JobRegistry {
    #[must_use]
    pub fn from_schedule(schedule: &ScheduleConfig) -> Self {
        let jobs = JobKind::all()
            .into_iter()
            .map(|kind| {
                let cadence = match kind {
                    JobKind::Forecast => schedule.forecast.clone(),
                    JobKind::Observation => schedule.observation.clone(),
                    JobKind::Metrics => schedule.metrics.clone(),
                    JobKind::Purge => schedule.purge.clone(),
                };
                (kind, JobState::new(cadence))
            })
            .collect();
        Self {
            jobs: Arc::new(RwLock::new(jobs)),
        }
    }

    /// Marks `kind` running. Returns `false`, and records the suppression,
    /// when the previous invocation has not finished.
    pub async fn try_begin(&self, kind: JobKind, now: DateTime<Utc>) -> bool {
        let mut jobs = self.jobs.write().await;
        let Some(state) = jobs.get_mut(&kind) else {
            return false;
        };
        if state.is_running() {
            state.suppressed += 1;
            warn!(
                job = %kind,
                started = ?state.last_started,
                suppressed = state.suppressed,
                "Previous invocation still running; suppressing"
            );
            return false;
        }
        state.status = JobStatus::Running;
        state.last_started = Some(now);
        true
    }

    pub async fn finish(&self, kind: JobKind, status: JobStatus, now: DateTime<Utc>) {
        if let Some(state) = self.jobs.write().await.get_mut(&kind) {
            state.status = status;
            state.last_finished = Some(now);
        }
    }

    pub async fn state(&self, kind: JobKind) -> Option<JobState> {
        self.jobs.read().await.get(&kind).cloned()
    }

    /// All jobs, in [`JobKind`] order.
    pub async fn snapshot(&self) -> Vec<(JobKind, JobState)> {
        let jobs = self.jobs.read().await;
        let mut all: Vec<(JobKind, JobState)> =
            jobs.iter().map(|(k, s)| (*k, s.clone())).collect();
        all.sort_by_key(|(k, _)| *k);
        all
    }
}
