//! Error taxonomy shared by collectors, engines and stores.

use crate::parameter::Parameter;
use std::time::Duration;
use thiserror::Error;

/// A payload could not be turned into normalized readings.
///
/// Never retried: the same bytes would fail the same way.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("parsing error from {source_id}: {message}")]
pub struct ParsingError {
    pub source_id: String,
    pub message: String,
}

impl ParsingError {
    pub fn new(source_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            message: message.into(),
        }
    }
}

/// A value fell outside the plausible envelope for its parameter.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("{parameter} value {value} outside plausible range [{min}, {max}]")]
pub struct SanityViolation {
    pub parameter: Parameter,
    pub value: f64,
    pub min: f64,
    pub max: f64,
}

/// Reference data that cannot be wired up.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("configuration error: {0}")]
pub struct ConfigurationError(pub String);

impl ConfigurationError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Failures raised by collectors.
#[derive(Debug, Clone, Error)]
pub enum CollectError {
    /// Connection reset, timeout, 5xx or 408
    #[error("transient network failure from {source_id}: {message}")]
    TransientNetwork { source_id: String, message: String },

    /// Upstream returned 429
    #[error("rate limited by {source_id} (retry after {retry_after:?})")]
    RateLimited {
        source_id: String,
        retry_after: Option<Duration>,
    },

    /// Non-retryable HTTP status
    #[error("{source_id} responded with status {status}")]
    Upstream { source_id: String, status: u16 },

    #[error(transparent)]
    Parsing(#[from] ParsingError),

    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
}

impl CollectError {
    /// Returns true if the failure may succeed on a later attempt.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CollectError::TransientNetwork { .. } | CollectError::RateLimited { .. }
        )
    }

    /// Delay hint supplied by the upstream, if any.
    #[must_use]
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            CollectError::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// Short label used in structured logs.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            CollectError::TransientNetwork { .. } => "transient_network",
            CollectError::RateLimited { .. } => "rate_limited",
            CollectError::Upstream { .. } => "upstream",
            CollectError::Parsing(_) => "parsing_error",
            CollectError::Configuration(_) => "configuration_error",
        }
    }
}

/// Failures raised by persistence backends.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The natural key already exists; the stored row is left untouched.
    #[error("duplicate key: {0}")]
    DuplicateKey(String),

    #[error("store backend error: {0}")]
    Backend(#[from] anyhow::Error),
}

impl StoreError {
    #[must_use]
    pub fn is_duplicate(&self) -> bool {
        matches!(self, StoreError::DuplicateKey(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        let transient = CollectError::TransientNetwork {
            source_id: "open_meteo".into(),
            message: "connection reset".into(),
        };
        let limited = CollectError::RateLimited {
            source_id: "open_meteo".into(),
            retry_after: Some(Duration::from_secs(3)),
        };
        let upstream = CollectError::Upstream {
            source_id: "open_meteo".into(),
            status: 404,
        };
        let parsing: CollectError = ParsingError::new("open_meteo", "missing hourly").into();

        assert!(transient.is_retryable());
        assert!(limited.is_retryable());
        assert_eq!(limited.retry_after(), Some(Duration::from_secs(3)));
        assert!(!upstream.is_retryable());
        assert!(!parsing.is_retryable());
        assert_eq!(parsing.kind(), "parsing_error");
    }

    #[test]
    fn test_error_messages_name_the_source() {
        let err = ParsingError::new("pioupiou", "legend mismatch");
        assert_eq!(err.to_string(), "parsing error from pioupiou: legend mismatch");

        let dup = StoreError::DuplicateKey("2024-01-01T06:00Z/loc/model/wind_speed/6".into());
        assert!(dup.is_duplicate());
    }
}
