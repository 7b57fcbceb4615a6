//! Model run schedules and run selection.

use crate::error::ConfigurationError;
use chrono::{DateTime, Duration, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

/// One daily run of a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSlot {
    /// Hour of day (UTC) the run is initialised at
    pub hour: u32,
    /// Longest lead time the run publishes
    pub max_lead_hours: i64,
}

/// When a model runs and how long until each run is available.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSchedule {
    pub slots: Vec<RunSlot>,
    /// Delay between run time and publication
    pub publication_delay_minutes: i64,
}

impl RunSchedule {
    /// Checks slot hours and leads.
    ///
    /// # Errors
    /// Returns [`ConfigurationError`] if there are no slots, an hour is not a
    /// valid hour of day, or a lead is not positive.
    pub fn validate(&self, model_id: &str) -> Result<(), ConfigurationError> {
        if self.slots.is_empty() {
            return Err(ConfigurationError::new(format!("model {model_id} has no run slots")));
        }
        for slot in &self.slots {
            if slot.hour > 23 {
                return Err(ConfigurationError::new(format!(
                    "model {model_id} run hour {} is not an hour of day",
                    slot.hour
                )));
            }
            if slot.max_lead_hours <= 0 {
                return Err(ConfigurationError::new(format!(
                    "model {model_id} run {}z has no forecast lead",
                    slot.hour
                )));
            }
        }
        if self.publication_delay_minutes < 0 {
            return Err(ConfigurationError::new(format!(
                "model {model_id} has a negative publication delay"
            )));
        }
        Ok(())
    }

    /// Published runs, newest first, going back two days from `now`.
    fn published_runs(&self, now: DateTime<Utc>) -> Vec<(DateTime<Utc>, i64)> {
        let delay = Duration::minutes(self.publication_delay_minutes);
        let mut runs: Vec<(DateTime<Utc>, i64)> = (0..=2)
            .flat_map(|days_back| {
                let date = (now - Duration::days(days_back)).date_naive();
                self.slots.iter().filter_map(move |slot| {
                    NaiveTime::from_hms_opt(slot.hour, 0, 0)
                        .map(|t| (date.and_time(t).and_utc(), slot.max_lead_hours))
                })
            })
            .filter(|(run, _)| *run + delay <= now)
            .collect();
        runs.sort_by(|a, b| b.0.cmp(&a.0));
        runs.dedup_by_key(|(run, _)| *run);
        runs
    }

    /// Selects the run to fetch at `now`.
    ///
    /// Prefers the newest published run whose maximum lead covers
    /// `required_lead_hours`; otherwise the newest published run.
    #[must_use]
    pub fn select_run(&self, now: DateTime<Utc>, required_lead_hours: i64) -> Option<DateTime<Utc>> {
        let runs = self.published_runs(now);
        runs.iter()
            .find(|(_, max_lead)| *max_lead >= required_lead_hours)
            .or_else(|| runs.first())
            .map(|(run, _)| *run)
    }

    /// Newest run published at `now`.
    #[must_use]
    pub fn latest_published(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.published_runs(now).first().map(|(run, _)| *run)
    }
}

impl Default for RunSchedule {
    /// Four runs per day, 48 h leads, published three hours after run time.
    fn default() -> Self {
        Self {
            slots: [0, 6, 12, 18]
                .into_iter()
                .map(|hour| RunSlot {
                    hour,
                    max_lead_hours: 48,
                })
                .collect(),
            publication_delay_minutes: 180,
        }
    }
}
