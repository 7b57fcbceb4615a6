pub mod grid;
pub mod met_norway;
pub mod open_meteo;
pub mod pioupiou;
pub mod registry;
pub mod resilience;
pub mod station_page;

// Re-export collectors for convenience
pub use grid::GridForecastCollector;
pub use met_norway::MetNorwayCollector;
pub use open_meteo::OpenMeteoCollector;
pub use pioupiou::PioupiouCollector;
pub use station_page::{parse_station_page, StationPageCollector};

// Re-export resilience layer
pub use resilience::{
    classify_status, retry_with_backoff, FallbackForecastCollector, FallbackObservationCollector,
    ResilientClient, RetryPolicy,
};

// Re-export registry
pub use registry::{CollectorRegistry, RegisteredModel, RegisteredSource};
