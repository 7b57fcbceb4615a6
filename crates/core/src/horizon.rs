//! Horizon buckets: nominal lead times with acceptance bands.

use crate::error::ConfigurationError;
use serde::{Deserialize, Serialize};

/// A nominal lead time (hours) and the band of actual leads it accepts.
///
/// A lead `h` belongs to the bucket when `hours - band_hours <= h <= hours + band_hours`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HorizonBucket {
    pub hours: i32,
    #[serde(default)]
    pub band_hours: i32,
}

impl HorizonBucket {
    #[must_use]
    pub const fn new(hours: i32, band_hours: i32) -> Self {
        Self { hours, band_hours }
    }

    #[must_use]
    pub fn min_lead(&self) -> i64 {
        i64::from(self.hours - self.band_hours)
    }

    #[must_use]
    pub fn max_lead(&self) -> i64 {
        i64::from(self.hours + self.band_hours)
    }

    #[must_use]
    pub fn accepts(&self, lead_hours: i64) -> bool {
        lead_hours >= self.min_lead() && lead_hours <= self.max_lead()
    }
}

/// Validated, ordered set of horizon buckets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HorizonSet {
    buckets: Vec<HorizonBucket>,
}

impl HorizonSet {
    /// Builds the set, sorted by nominal lead.
    ///
    /// # Errors
    /// Returns [`ConfigurationError`] if the set is empty, a bucket has a
    /// negative lead or band, or two acceptance bands overlap.
    pub fn new(mut buckets: Vec<HorizonBucket>) -> Result<Self, ConfigurationError> {
        if buckets.is_empty() {
            return Err(ConfigurationError::new("at least one horizon bucket is required"));
        }
        buckets.sort_by_key(|b| b.hours);

        for bucket in &buckets {
            if bucket.hours < 0 || bucket.band_hours < 0 {
                return Err(ConfigurationError::new(format!(
                    "horizon bucket {}h has a negative lead or band",
                    bucket.hours
                )));
            }
        }
        for pair in buckets.windows(2) {
            if pair[0].max_lead() >= pair[1].min_lead() {
                return Err(ConfigurationError::new(format!(
                    "horizon buckets {}h±{} and {}h±{} overlap",
                    pair[0].hours, pair[0].band_hours, pair[1].hours, pair[1].band_hours
                )));
            }
        }

        Ok(Self { buckets })
    }

    /// Bucket whose band contains `lead_hours`, if any.
    #[must_use]
    pub fn bucket_for(&self, lead_hours: i64) -> Option<HorizonBucket> {
        self.buckets.iter().copied().find(|b| b.accepts(lead_hours))
    }

    /// Largest lead any bucket accepts.
    #[must_use]
    pub fn max_lead(&self) -> i64 {
        self.buckets.iter().map(HorizonBucket::max_lead).max().unwrap_or(0)
    }

    #[must_use]
    pub fn buckets(&self) -> &[HorizonBucket] {
        &self.buckets
    }
}

impl Default for HorizonSet {
    /// 6h, 12h, 24h and 48h with a one-hour band.
    fn default() -> Self {
        Self {
            buckets: vec![
                HorizonBucket::new(6, 1),
                HorizonBucket::new(12, 1),
                HorizonBucket::new(24, 1),
                HorizonBucket::new(48, 1),
            ],
        }
    }
}
