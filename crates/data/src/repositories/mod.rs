//! PostgreSQL repositories, one per table.
//!
//! Each repository exposes typed inherent methods and implements the matching
//! store trait from `forecast-verify-core`.

pub mod accuracy_repo;
pub mod deviation_repo;
pub mod staged_forecast_repo;

pub use accuracy_repo::AccuracyMetricRepository;
pub use deviation_repo::DeviationRepository;
pub use staged_forecast_repo::StagedForecastRepository;

use sqlx::PgPool;

/// All repositories over a single pool.
#[derive(Debug, Clone)]
pub struct Repositories {
    pub deviations: DeviationRepository,
    pub staging: StagedForecastRepository,
    pub metrics: AccuracyMetricRepository,
}

impl Repositories {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self {
            deviations: DeviationRepository::new(pool.clone()),
            staging: StagedForecastRepository::new(pool.clone()),
            metrics: AccuracyMetricRepository::new(pool),
        }
    }
}
