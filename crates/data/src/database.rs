use anyhow::{Context, Result};
use forecast_verify_core::DatabaseConfig;
use sqlx::{postgres::PgPoolOptions, PgPool};
use tracing::info;

use crate::repositories::Repositories;

/// Idempotent DDL, applied in order by [`DatabaseClient::ensure_schema`].
const SCHEMA: &[&str] = &[
    r"
    CREATE TABLE IF NOT EXISTS deviations (
        timestamp       TIMESTAMPTZ NOT NULL,
        location_id     TEXT        NOT NULL,
        model_id        TEXT        NOT NULL,
        parameter       TEXT        NOT NULL,
        horizon         INTEGER     NOT NULL,
        forecast_value  NUMERIC     NOT NULL,
        observed_value  NUMERIC     NOT NULL,
        deviation       NUMERIC     NOT NULL,
        run_time        TIMESTAMPTZ NOT NULL,
        observed_at     TIMESTAMPTZ NOT NULL,
        PRIMARY KEY (timestamp, location_id, model_id, parameter, horizon)
    )
    ",
    r"
    CREATE INDEX IF NOT EXISTS idx_deviations_run
        ON deviations (model_id, location_id, run_time)
    ",
    r"
    CREATE TABLE IF NOT EXISTS staged_forecasts (
        id           BIGSERIAL   PRIMARY KEY,
        location_id  TEXT        NOT NULL,
        parameter    TEXT        NOT NULL,
        model_id     TEXT        NOT NULL,
        source_id    TEXT        NOT NULL,
        run_time     TIMESTAMPTZ NOT NULL,
        target_time  TIMESTAMPTZ NOT NULL,
        value        NUMERIC     NOT NULL,
        staged_at    TIMESTAMPTZ NOT NULL DEFAULT now(),
        UNIQUE (model_id, location_id, parameter, run_time, target_time)
    )
    ",
    r"
    CREATE INDEX IF NOT EXISTS idx_staged_forecasts_location_target
        ON staged_forecasts (location_id, target_time)
    ",
    r"
    CREATE TABLE IF NOT EXISTS accuracy_metrics (
        location_id      TEXT             NOT NULL,
        model_id         TEXT             NOT NULL,
        parameter        TEXT             NOT NULL,
        horizon          INTEGER          NOT NULL,
        time_bucket      TEXT             NOT NULL,
        bucket_start     DATE,
        mae              DOUBLE PRECISION NOT NULL,
        bias             DOUBLE PRECISION NOT NULL,
        rmse             DOUBLE PRECISION NOT NULL,
        sample_count     BIGINT           NOT NULL,
        distinct_days    BIGINT           NOT NULL,
        day_span         BIGINT           NOT NULL,
        confidence       TEXT             NOT NULL,
        bias_lower       DOUBLE PRECISION,
        bias_upper       DOUBLE PRECISION,
        mae_lower        DOUBLE PRECISION,
        mae_upper        DOUBLE PRECISION,
        first_timestamp  TIMESTAMPTZ      NOT NULL,
        last_timestamp   TIMESTAMPTZ      NOT NULL,
        computed_at      TIMESTAMPTZ      NOT NULL DEFAULT now()
    )
    ",
    r"
    CREATE UNIQUE INDEX IF NOT EXISTS idx_accuracy_metrics_key
        ON accuracy_metrics (location_id, model_id, parameter, horizon, time_bucket,
                             COALESCE(bucket_start, DATE '1970-01-01'))
    ",
];

/// PostgreSQL connection pool plus schema management.
#[derive(Debug, Clone)]
pub struct DatabaseClient {
    pool: PgPool,
}

impl DatabaseClient {
    /// Connects to the database described by `config`.
    ///
    /// # Errors
    /// Returns an error if the database connection cannot be established.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(&config.url)
            .await
            .context("Failed to connect to PostgreSQL")?;
        Ok(Self { pool })
    }

    /// Wraps an existing pool.
    #[must_use]
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Creates tables and indexes if they do not exist. Safe to call on every
    /// startup.
    ///
    /// # Errors
    /// Returns an error if any statement fails; nothing is committed then.
    pub async fn ensure_schema(&self) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&mut *tx)
                .await
                .with_context(|| format!("Schema statement failed: {}", statement.trim()))?;
        }
        tx.commit().await?;

        info!(statements = SCHEMA.len(), "Database schema ensured");
        Ok(())
    }

    /// Repositories sharing this client's pool.
    #[must_use]
    pub fn repositories(&self) -> Repositories {
        Repositories::new(self.pool.clone())
    }
}
