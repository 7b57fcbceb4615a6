pub mod config;
pub mod config_loader;
pub mod error;
pub mod horizon;
pub mod metrics_formatter;
pub mod parameter;
pub mod reading;
pub mod records;
pub mod runs;
pub mod statistics;
pub mod traits;

pub use config::{
    AppConfig, DatabaseConfig, ForecastBinding, GridBounds, GridSegment, JobSchedule,
    MatchingConfig, ModelConfig, ObservationBinding, ObservationSourceConfig, RateLimitConfig,
    RetryConfig, ScheduleConfig,
};
pub use config_loader::ConfigLoader;
pub use error::{CollectError, ConfigurationError, ParsingError, SanityViolation, StoreError};
pub use horizon::{HorizonBucket, HorizonSet};
pub use metrics_formatter::MetricsFormatter;
pub use parameter::{Envelope, Parameter, Unit};
pub use reading::{Location, RawReading, ReadingKind, TimeWindow};
pub use records::{
    AccuracyMetric, Confidence, Deviation, DeviationFilter, Interval, MatchedPair, MetricFilter,
    PairRejection, StagedForecast, TimeBucket,
};
pub use runs::{RunSchedule, RunSlot};
pub use traits::{
    DeviationStore, ForecastBatch, ForecastCollector, ForecastStaging, GridGap, MetricStore,
    ObservationCollector,
};
