//! Rate limiting, retry with exponential backoff and fallback substitution.
//!
//! Every collector reaches the network through [`ResilientClient`]: a
//! per-source governor limiter gates each attempt, and failures are classified
//! into the shared [`CollectError`] taxonomy so only transient ones are retried.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use forecast_verify_core::{
    CollectError, ConfigurationError, ForecastBatch, ForecastCollector, Location,
    ObservationCollector, ParsingError, RateLimitConfig, RawReading, RetryConfig, TimeWindow,
};
use governor::{
    clock::DefaultClock,
    middleware::NoOpMiddleware,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use reqwest::header::{HeaderMap, RETRY_AFTER, USER_AGENT};
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use std::future::Future;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

type GovernorLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock, NoOpMiddleware>;

/// Default per-request timeout.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Bounded exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts after the first call
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    #[must_use]
    pub fn new(max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay,
        }
    }

    /// Single attempt, no retries.
    #[must_use]
    pub fn none() -> Self {
        Self::new(0, Duration::ZERO, Duration::ZERO)
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self::new(
            config.max_retries,
            Duration::from_millis(config.base_delay_ms),
            Duration::from_millis(config.max_delay_ms),
        )
    }
}

/// Runs `op` until it succeeds, fails with a non-retryable error, or the
/// policy's retries are exhausted.
///
/// The delay doubles after each failure, capped at `max_delay`. A
/// `RateLimited` error carrying a `Retry-After` hint waits for the hint
/// instead (also capped).
///
/// # Errors
/// Returns the last error seen.
pub async fn retry_with_backoff<T, F, Fut>(
    policy: &RetryPolicy,
    source_id: &str,
    mut op: F,
) -> Result<T, CollectError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, CollectError>>,
{
    let mut delay = policy.base_delay;
    let mut attempt = 0;

    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < policy.max_retries => {
                let wait = e.retry_after().map_or(delay, |hint| hint.min(policy.max_delay));
                attempt += 1;
                warn!(
                    source = source_id,
                    attempt,
                    max_retries = policy.max_retries,
                    error = %e,
                    delay_ms = wait.as_millis() as u64,
                    "Request failed, retrying"
                );
                tokio::time::sleep(wait).await;
                delay = (delay * 2).min(policy.max_delay);
            }
            Err(e) => return Err(e),
        }
    }
}

/// Maps an HTTP status to the error taxonomy; `None` for success.
#[must_use]
pub fn classify_status(source_id: &str, status: StatusCode, headers: &HeaderMap) -> Option<CollectError> {
    if status.is_success() {
        return None;
    }
    if status == StatusCode::TOO_MANY_REQUESTS {
        let retry_after = headers
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.trim().parse::<u64>().ok())
            .map(Duration::from_secs);
        return Some(CollectError::RateLimited {
            source_id: source_id.to_string(),
            retry_after,
        });
    }
    if status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT {
        return Some(CollectError::TransientNetwork {
            source_id: source_id.to_string(),
            message: format!("status {}", status.as_u16()),
        });
    }
    Some(CollectError::Upstream {
        source_id: source_id.to_string(),
        status: status.as_u16(),
    })
}

fn classify_transport(source_id: &str, e: &reqwest::Error) -> CollectError {
    let message = if e.is_timeout() {
        format!("timeout: {e}")
    } else if e.is_connect() {
        format!("connect: {e}")
    } else {
        e.to_string()
    };
    CollectError::TransientNetwork {
        source_id: source_id.to_string(),
        message,
    }
}

/// HTTP client for one source: rate limited, retried, classified.
#[derive(Clone)]
pub struct ResilientClient {
    source_id: String,
    http: Client,
    limiter: Arc<GovernorLimiter>,
    policy: RetryPolicy,
    user_agent: Option<String>,
}

impl std::fmt::Debug for ResilientClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResilientClient")
            .field("source_id", &self.source_id)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl ResilientClient {
    /// Creates a client for `source_id`.
    ///
    /// # Errors
    /// Returns [`ConfigurationError`] if the request rate is zero or the HTTP
    /// client cannot be built.
    pub fn new(
        source_id: impl Into<String>,
        rate_limit: &RateLimitConfig,
        policy: RetryPolicy,
    ) -> Result<Self, ConfigurationError> {
        let source_id = source_id.into();
        let per_minute = NonZeroU32::new(rate_limit.requests_per_minute).ok_or_else(|| {
            ConfigurationError::new(format!("{source_id}: requests_per_minute must be positive"))
        })?;

        let http = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| ConfigurationError::new(format!("{source_id}: failed to build HTTP client: {e}")))?;

        Ok(Self {
            source_id,
            http,
            limiter: Arc::new(RateLimiter::direct(Quota::per_minute(per_minute))),
            policy,
            user_agent: None,
        })
    }

    /// Sets the User-Agent sent with every request.
    #[must_use]
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    #[must_use]
    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    #[must_use]
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    async fn attempt(&self, url: &str, query: &[(&str, String)]) -> Result<reqwest::Response, CollectError> {
        self.limiter.until_ready().await;

        debug!(source = %self.source_id, url, "GET");
        let mut request = self.http.get(url).query(query);
        if let Some(ua) = &self.user_agent {
            request = request.header(USER_AGENT, ua);
        }

        let response = request
            .send()
            .await
            .map_err(|e| classify_transport(&self.source_id, &e))?;

        if let Some(err) = classify_status(&self.source_id, response.status(), response.headers()) {
            return Err(err);
        }
        Ok(response)
    }

    /// GETs `url` and returns the body as text.
    ///
    /// # Errors
    /// Returns the classified [`CollectError`] once retries are exhausted.
    pub async fn get_text(&self, url: &str, query: &[(&str, String)]) -> Result<String, CollectError> {
        retry_with_backoff(&self.policy, &self.source_id, || async {
            let response = self.attempt(url, query).await?;
            response
                .text()
                .await
                .map_err(|e| classify_transport(&self.source_id, &e))
        })
        .await
    }

    /// GETs `url` and returns the raw body.
    ///
    /// # Errors
    /// Returns the classified [`CollectError`] once retries are exhausted.
    pub async fn get_bytes(&self, url: &str) -> Result<Vec<u8>, CollectError> {
        retry_with_backoff(&self.policy, &self.source_id, || async {
            let response = self.attempt(url, &[]).await?;
            response
                .bytes()
                .await
                .map(|b| b.to_vec())
                .map_err(|e| classify_transport(&self.source_id, &e))
        })
        .await
    }

    /// GETs `url` and decodes the body as JSON. A body that does not decode
    /// is a [`ParsingError`] and is not retried.
    ///
    /// # Errors
    /// Returns the classified [`CollectError`] once retries are exhausted, or
    /// a parsing error.
    pub async fn get_json<T: DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<T, CollectError> {
        let body = self.get_text(url, query).await?;
        serde_json::from_str(&body).map_err(|e| {
            ParsingError::new(self.source_id.clone(), format!("invalid JSON payload: {e}")).into()
        })
    }
}

/// Forecast collector that substitutes a fallback when the primary exhausts
/// its retries on a transient failure.
pub struct FallbackForecastCollector {
    primary: Arc<dyn ForecastCollector>,
    fallback: Arc<dyn ForecastCollector>,
}

impl FallbackForecastCollector {
    #[must_use]
    pub fn new(primary: Arc<dyn ForecastCollector>, fallback: Arc<dyn ForecastCollector>) -> Self {
        Self { primary, fallback }
    }
}

#[async_trait]
impl ForecastCollector for FallbackForecastCollector {
    fn source_id(&self) -> &str {
        self.primary.source_id()
    }

    async fn fetch_forecast(
        &self,
        location: &Location,
        run_time: DateTime<Utc>,
    ) -> Result<Vec<RawReading>, CollectError> {
        match self.primary.fetch_forecast(location, run_time).await {
            Err(e) if e.is_retryable() => {
                warn!(
                    source = self.primary.source_id(),
                    fallback = self.fallback.source_id(),
                    location = %location.id,
                    error = %e,
                    "Primary source exhausted, using fallback"
                );
                self.fallback.fetch_forecast(location, run_time).await
            }
            other => other,
        }
    }

    async fn fetch_forecasts(&self, locations: &[Location], run_time: DateTime<Utc>) -> ForecastBatch {
        let mut batch = self.primary.fetch_forecasts(locations, run_time).await;

        let (retry, keep): (Vec<_>, Vec<_>) = batch
            .failures
            .drain(..)
            .partition(|(_, e)| e.is_retryable());
        batch.failures = keep;
        if retry.is_empty() {
            return batch;
        }

        let retry_locations: Vec<Location> = locations
            .iter()
            .filter(|l| retry.iter().any(|(id, _)| *id == l.id))
            .cloned()
            .collect();
        warn!(
            source = self.primary.source_id(),
            fallback = self.fallback.source_id(),
            locations = retry_locations.len(),
            "Primary source exhausted for some locations, using fallback"
        );

        let substitute = self.fallback.fetch_forecasts(&retry_locations, run_time).await;
        batch.readings.extend(substitute.readings);
        batch.failures.extend(substitute.failures);
        batch.gaps.extend(substitute.gaps);
        batch
    }
}

/// Observation collector that substitutes a fallback rendering of the same
/// beacon data when the primary exhausts its retries.
pub struct FallbackObservationCollector {
    primary: Arc<dyn ObservationCollector>,
    fallback: Arc<dyn ObservationCollector>,
}

impl FallbackObservationCollector {
    #[must_use]
    pub fn new(primary: Arc<dyn ObservationCollector>, fallback: Arc<dyn ObservationCollector>) -> Self {
        Self { primary, fallback }
    }
}

#[async_trait]
impl ObservationCollector for FallbackObservationCollector {
    fn source_id(&self) -> &str {
        self.primary.source_id()
    }

    async fn fetch_observation(
        &self,
        location: &Location,
        window: TimeWindow,
    ) -> Result<Vec<RawReading>, CollectError> {
        match self.primary.fetch_observation(location, window).await {
            Err(e) if e.is_retryable() => {
                warn!(
                    source = self.primary.source_id(),
                    fallback = self.fallback.source_id(),
                    location = %location.id,
                    error = %e,
                    "Primary source exhausted, using fallback"
                );
                self.fallback.fetch_observation(location, window).await
            }
            other => other,
        }
    }
}
