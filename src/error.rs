//! Error types for the metrics agent

use crate::types::MetricKind;
use thiserror::Error;

/// Errors a single collector can produce for a single coin
///
/// These are recovered per coin: logged, tallied in the run record,
/// and never propagated past the scheduler.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum CollectorError {
    /// The collector does not serve this coin
    #[error("{collector} does not support coin {coin}")]
    UnsupportedCoin { collector: String, coin: String },

    /// The collector serves this coin but cannot produce the metric
    #[error("{collector} cannot produce {metric} for {coin}")]
    UnsupportedMetric {
        collector: String,
        coin: String,
        metric: MetricKind,
    },

    /// Network failure, timeout, rate limit or non-2xx response
    #[error("Source unavailable: {0}")]
    SourceUnavailable(String),

    /// Source responded but the payload could not be used
    #[error("Malformed response: {0}")]
    MalformedResponse(String),
}

impl CollectorError {
    /// Creates an UnsupportedCoin error
    pub fn unsupported_coin(collector: &str, coin: &str) -> Self {
        Self::UnsupportedCoin {
            collector: collector.to_string(),
            coin: coin.to_string(),
        }
    }

    /// Creates an UnsupportedMetric error
    pub fn unsupported_metric(collector: &str, coin: &str, metric: MetricKind) -> Self {
        Self::UnsupportedMetric {
            collector: collector.to_string(),
            coin: coin.to_string(),
            metric,
        }
    }

    /// Creates a SourceUnavailable error
    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::SourceUnavailable(msg.into())
    }

    /// Creates a MalformedResponse error
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::MalformedResponse(msg.into())
    }
}

impl From<reqwest::Error> for CollectorError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            Self::MalformedResponse(err.to_string())
        } else if err.is_timeout() {
            Self::SourceUnavailable(format!("request timeout: {}", err))
        } else {
            Self::SourceUnavailable(err.to_string())
        }
    }
}

/// One failed attempt in a fallback chain
#[derive(Debug, Clone, PartialEq)]
pub struct CollectorAttempt {
    pub collector: String,
    pub error: CollectorError,
}

/// Errors from the storage collaborator
#[derive(Debug, Error, Clone, PartialEq)]
pub enum StorageError {
    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    #[error("Unknown coin: {0}")]
    UnknownCoin(String),
}

/// Errors from the concurrency executor
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConcurrencyError {
    /// Concurrency limit must be at least 1
    #[error("Invalid concurrency limit: {0}")]
    InvalidLimit(usize),

    /// A source's limiter was shut down
    #[error("Concurrency limiter closed for {0}")]
    Closed(String),
}

/// Run-level and configuration errors surfaced to the operator
#[derive(Debug, Error, Clone, PartialEq)]
pub enum AgentError {
    /// Every candidate collector failed for a coin
    #[error("All collectors failed for {coin}: {}", format_attempts(.attempts))]
    AllCandidatesExhausted {
        coin: String,
        attempts: Vec<CollectorAttempt>,
    },

    /// A cycle was requested while another one is in progress
    #[error("A collection run is already in progress")]
    ConcurrentRunRejected,

    /// A cycle was requested after the scheduler was stopped
    #[error("Scheduler is stopped")]
    SchedulerStopped,

    /// Invalid configuration or a coin with no eligible collector
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl AgentError {
    /// Creates a Configuration error
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }
}

impl From<ConcurrencyError> for AgentError {
    fn from(err: ConcurrencyError) -> Self {
        Self::Configuration(err.to_string())
    }
}

fn format_attempts(attempts: &[CollectorAttempt]) -> String {
    if attempts.is_empty() {
        return "no collectors attempted".to_string();
    }

    attempts
        .iter()
        .map(|a| format!("{} ({})", a.collector, a.error))
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exhausted_message_lists_every_attempt() {
        let err = AgentError::AllCandidatesExhausted {
            coin: "BTC".to_string(),
            attempts: vec![
                CollectorAttempt {
                    collector: "blockchair".to_string(),
                    error: CollectorError::unavailable("HTTP 503"),
                },
                CollectorAttempt {
                    collector: "coingecko".to_string(),
                    error: CollectorError::malformed("missing total_volume"),
                },
            ],
        };

        let msg = err.to_string();
        assert!(msg.contains("blockchair (Source unavailable: HTTP 503)"));
        assert!(msg.contains("coingecko (Malformed response: missing total_volume)"));
    }
}
