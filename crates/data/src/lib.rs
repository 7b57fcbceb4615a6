//! Storage for forecast verification.
//!
//! This crate provides:
//! - Database client for `PostgreSQL` with idempotent schema setup
//! - Row models for deviations, staged forecasts and accuracy metrics
//! - Repositories implementing the core store traits
//! - An in-memory store with the same semantics
//! - CSV export

pub mod csv_storage;
pub mod database;
pub mod memory;
pub mod models;
pub mod repositories;

pub use csv_storage::CsvStorage;
pub use database::DatabaseClient;
pub use memory::MemoryStore;
pub use models::{AccuracyMetricRecord, DeviationRecord, StagedForecastRecord};
pub use repositories::{
    AccuracyMetricRepository, DeviationRepository, Repositories, StagedForecastRepository,
};
