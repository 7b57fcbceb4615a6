//! Pairs staged forecasts with observations.
//!
//! Matching key is `(location, parameter)` and a pair requires
//! `|target_time - observed_time| <= tolerance`. Forecasts are grouped by
//! `(model, horizon bucket)`: each observation can pair once per group and
//! each forecast once overall.
//!
//! Candidates are assigned closest first, the earlier observation and then
//! the freshest run breaking ties. An observation that loses its closest
//! forecast to a nearer observation falls through to its next candidate in
//! the same group instead of being dropped.

use chrono::{DateTime, Duration, Utc};
use forecast_verify_core::{
    HorizonBucket, HorizonSet, MatchedPair, MatchingConfig, Parameter, RawReading, ReadingKind,
    StagedForecast,
};
use rust_decimal::Decimal;
use std::cmp::Reverse;
use std::collections::HashSet;
use tracing::debug;

/// Result of one matching pass.
#[derive(Debug, Default)]
pub struct MatchOutcome {
    pub pairs: Vec<MatchedPair>,
    /// Observations that paired with nothing; they are dropped
    pub unmatched_observations: usize,
    /// Forecasts whose lead falls outside every horizon band
    pub out_of_horizon: Vec<i64>,
    /// Claims lost to a closer observation of the same forecast
    pub superseded_claims: usize,
    /// Pairs formed with an observation's second or later candidate
    pub rematched: usize,
}

impl MatchOutcome {
    /// Staged forecast ids consumed by this pass.
    #[must_use]
    pub fn matched_forecast_ids(&self) -> Vec<i64> {
        self.pairs.iter().map(|p| p.forecast_id).collect()
    }
}

/// An observation reduced to what matching needs.
#[derive(Debug, Clone)]
struct Observation<'a> {
    index: usize,
    location_id: &'a str,
    parameter: Parameter,
    observed_time: DateTime<Utc>,
    value: Decimal,
}

#[derive(Debug, Clone, Copy)]
struct Claim<'a> {
    forecast_idx: usize,
    observation_idx: usize,
    distance: Duration,
    model_id: &'a str,
    bucket: HorizonBucket,
}

pub struct MatchingEngine {
    tolerance: Duration,
    horizons: HorizonSet,
}

impl MatchingEngine {
    #[must_use]
    pub fn new(tolerance: Duration, horizons: HorizonSet) -> Self {
        Self { tolerance, horizons }
    }

    #[must_use]
    pub fn from_config(matching: &MatchingConfig, horizons: HorizonSet) -> Self {
        Self::new(matching.tolerance(), horizons)
    }

    #[must_use]
    pub fn tolerance(&self) -> Duration {
        self.tolerance
    }

    /// Matches `observations` against `forecasts`.
    ///
    /// Forecast readings passed in `observations` are ignored.
    #[must_use]
    pub fn match_readings(&self, forecasts: &[StagedForecast], observations: &[RawReading]) -> MatchOutcome {
        let mut outcome = MatchOutcome::default();

        // Forecasts outside every band can never pair
        let mut eligible: Vec<(usize, HorizonBucket)> = Vec::with_capacity(forecasts.len());
        for (idx, forecast) in forecasts.iter().enumerate() {
            match self.horizons.bucket_for(forecast.lead_hours()) {
                Some(bucket) => eligible.push((idx, bucket)),
                None => outcome.out_of_horizon.push(forecast.id),
            }
        }

        let mut observations: Vec<Observation<'_>> = observations
            .iter()
            .filter_map(|r| match r.kind {
                ReadingKind::Observation { observed_time } => Some((r, observed_time)),
                ReadingKind::Forecast { .. } => None,
            })
            .enumerate()
            .map(|(index, (r, observed_time))| Observation {
                index,
                location_id: &r.location_id,
                parameter: r.parameter,
                observed_time,
                value: r.value,
            })
            .collect();
        observations.sort_by_key(|o| (o.observed_time, o.index));

        let mut claims: Vec<Claim<'_>> = Vec::new();
        for (obs_idx, obs) in observations.iter().enumerate() {
            for &(f_idx, bucket) in &eligible {
                let f = &forecasts[f_idx];
                if f.location_id != obs.location_id || f.parameter != obs.parameter {
                    continue;
                }
                let distance = (f.target_time - obs.observed_time).abs();
                if distance > self.tolerance {
                    continue;
                }
                claims.push(Claim {
                    forecast_idx: f_idx,
                    observation_idx: obs_idx,
                    distance,
                    model_id: f.model_id.as_str(),
                    bucket,
                });
            }
        }
        claims.sort_by_key(|c| {
            let f = &forecasts[c.forecast_idx];
            (c.distance, c.observation_idx, Reverse(f.run_time), f.id)
        });

        // Greedy in preference order: a claim is granted when both the
        // forecast and the observation's slot in that group are still free
        let mut taken: HashSet<usize> = HashSet::new();
        let mut filled: HashSet<(usize, &str, HorizonBucket)> = HashSet::new();
        let mut considered: HashSet<(usize, &str, HorizonBucket)> = HashSet::new();
        let mut winners: Vec<Claim<'_>> = Vec::new();
        for claim in claims {
            let slot = (claim.observation_idx, claim.model_id, claim.bucket);
            if filled.contains(&slot) {
                continue;
            }
            let first_choice = considered.insert(slot);
            if !taken.insert(claim.forecast_idx) {
                outcome.superseded_claims += 1;
                continue;
            }
            filled.insert(slot);
            if !first_choice {
                outcome.rematched += 1;
            }
            winners.push(claim);
        }

        let mut paired_observations = vec![false; observations.len()];
        winners.sort_by_key(|c| (c.observation_idx, forecasts[c.forecast_idx].id));
        for claim in winners {
            let forecast = &forecasts[claim.forecast_idx];
            let obs = &observations[claim.observation_idx];
            match MatchedPair::new(
                forecast,
                obs.location_id,
                obs.parameter,
                obs.observed_time,
                obs.value,
                self.tolerance,
                claim.bucket,
            ) {
                Ok(pair) => {
                    paired_observations[claim.observation_idx] = true;
                    outcome.pairs.push(pair);
                }
                Err(rejection) => {
                    debug!(forecast_id = forecast.id, ?rejection, "Candidate pair rejected");
                }
            }
        }

        outcome.unmatched_observations = paired_observations.iter().filter(|p| !**p).count();
        debug!(
            forecasts = forecasts.len(),
            observations = observations.len(),
            pairs = outcome.pairs.len(),
            unmatched = outcome.unmatched_observations,
            out_of_horizon = outcome.out_of_horizon.len(),
            rematched = outcome.rematched,
            "Matching pass complete"
        );
        outcome
    }
}
