//! Runtime configuration for the metrics agent
//!
//! Defaults come from `constants`. A JSON file or environment variables can
//! override any of them; `validate` must pass before the agent starts.

use crate::{
    constants::{
        DEFAULT_COLLECTION_INTERVAL_MINUTES, DEFAULT_CONCURRENCY_CAP, DEFAULT_CONCURRENCY_CAPS,
        DEFAULT_DEGRADED_THRESHOLD, DEFAULT_HEALTH_WINDOW_SIZE, DEFAULT_REQUEST_SPACING_MS,
        DEFAULT_REQUEST_TIMEOUT_SECS, DEFAULT_UNHEALTHY_THRESHOLD,
    },
    error::AgentError,
};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Health tracking settings
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Outcomes kept per collector
    pub window_size: usize,
    /// Error rate at or above which a collector is degraded
    pub degraded_threshold: f64,
    /// Error rate at or above which a collector is unhealthy
    pub unhealthy_threshold: f64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            window_size: DEFAULT_HEALTH_WINDOW_SIZE,
            degraded_threshold: DEFAULT_DEGRADED_THRESHOLD,
            unhealthy_threshold: DEFAULT_UNHEALTHY_THRESHOLD,
        }
    }
}

/// Agent configuration
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub collection_interval_minutes: u64,
    pub concurrency_caps: HashMap<String, usize>,
    pub request_spacing_ms: HashMap<String, u64>,
    pub request_timeout_secs: u64,
    pub health: HealthConfig,
    pub coingecko_api_key: Option<String>,
    pub blockchair_api_key: Option<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            collection_interval_minutes: DEFAULT_COLLECTION_INTERVAL_MINUTES,
            concurrency_caps: DEFAULT_CONCURRENCY_CAPS
                .iter()
                .map(|(name, cap)| (name.to_string(), *cap))
                .collect(),
            request_spacing_ms: DEFAULT_REQUEST_SPACING_MS
                .iter()
                .map(|(name, ms)| (name.to_string(), *ms))
                .collect(),
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            health: HealthConfig::default(),
            coingecko_api_key: None,
            blockchair_api_key: None,
        }
    }
}

impl AgentConfig {
    /// Loads configuration from a JSON file; missing fields keep their defaults
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, AgentError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            AgentError::configuration(format!("cannot read {}: {}", path.display(), e))
        })?;

        let config: Self = serde_json::from_str(&text).map_err(|e| {
            AgentError::configuration(format!("cannot parse {}: {}", path.display(), e))
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Builds configuration from defaults overridden by process environment variables
    pub fn from_env() -> Result<Self, AgentError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds configuration from defaults overridden by a key lookup
    ///
    /// Split out from `from_env` so tests don't touch the process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, AgentError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(v) = lookup("CFV_COLLECTION_INTERVAL_MINUTES") {
            config.collection_interval_minutes = parse_number(&v, "CFV_COLLECTION_INTERVAL_MINUTES")?;
        }
        if let Some(v) = lookup("CFV_CONCURRENCY_CAPS") {
            config
                .concurrency_caps
                .extend(parse_pairs(&v, "CFV_CONCURRENCY_CAPS")?);
        }
        if let Some(v) = lookup("CFV_REQUEST_SPACING_MS") {
            config
                .request_spacing_ms
                .extend(parse_pairs(&v, "CFV_REQUEST_SPACING_MS")?);
        }
        if let Some(v) = lookup("CFV_REQUEST_TIMEOUT_SECS") {
            config.request_timeout_secs = parse_number(&v, "CFV_REQUEST_TIMEOUT_SECS")?;
        }
        if let Some(v) = lookup("CFV_HEALTH_WINDOW_SIZE") {
            config.health.window_size = parse_number(&v, "CFV_HEALTH_WINDOW_SIZE")?;
        }
        if let Some(v) = lookup("CFV_HEALTH_DEGRADED_THRESHOLD") {
            config.health.degraded_threshold = parse_number(&v, "CFV_HEALTH_DEGRADED_THRESHOLD")?;
        }
        if let Some(v) = lookup("CFV_HEALTH_UNHEALTHY_THRESHOLD") {
            config.health.unhealthy_threshold =
                parse_number(&v, "CFV_HEALTH_UNHEALTHY_THRESHOLD")?;
        }

        config.coingecko_api_key = lookup("COINGECKO_API_KEY").filter(|k| !k.is_empty());
        config.blockchair_api_key = lookup("BLOCKCHAIR_API_KEY").filter(|k| !k.is_empty());

        config.validate()?;
        Ok(config)
    }

    /// Checks every option against its allowed range
    pub fn validate(&self) -> Result<(), AgentError> {
        if self.collection_interval_minutes == 0 {
            return Err(AgentError::configuration(
                "collection interval must be greater than 0 minutes",
            ));
        }
        if self.request_timeout_secs == 0 {
            return Err(AgentError::configuration(
                "request timeout must be greater than 0 seconds",
            ));
        }
        if let Some((source, _)) = self.concurrency_caps.iter().find(|(_, cap)| **cap == 0) {
            return Err(AgentError::configuration(format!(
                "concurrency cap for {} must be a positive integer",
                source
            )));
        }

        let health = &self.health;
        if health.window_size == 0 {
            return Err(AgentError::configuration(
                "health window size must be greater than 0",
            ));
        }
        let in_range = |t: f64| (0.0..=1.0).contains(&t);
        if !in_range(health.degraded_threshold)
            || !in_range(health.unhealthy_threshold)
            || health.degraded_threshold > health.unhealthy_threshold
        {
            return Err(AgentError::configuration(format!(
                "health thresholds must satisfy 0 <= degraded ({}) <= unhealthy ({}) <= 1",
                health.degraded_threshold, health.unhealthy_threshold
            )));
        }

        Ok(())
    }

    /// Collection interval as a duration
    pub fn collection_interval(&self) -> Duration {
        Duration::from_secs(self.collection_interval_minutes * 60)
    }

    /// HTTP timeout as a duration
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Concurrency cap for a source, 1 if unspecified
    pub fn concurrency_cap(&self, source: &str) -> usize {
        self.concurrency_caps
            .get(source)
            .copied()
            .unwrap_or(DEFAULT_CONCURRENCY_CAP)
    }

    /// Spacing between consecutive tasks of a source, if any
    pub fn request_spacing(&self, source: &str) -> Option<Duration> {
        self.request_spacing_ms
            .get(source)
            .filter(|ms| **ms > 0)
            .map(|ms| Duration::from_millis(*ms))
    }
}

fn parse_number<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, AgentError> {
    value
        .trim()
        .parse()
        .map_err(|_| AgentError::configuration(format!("{} has invalid value '{}'", key, value)))
}

/// Parses `name=value,name=value`
fn parse_pairs<T: std::str::FromStr>(value: &str, key: &str) -> Result<Vec<(String, T)>, AgentError> {
    value
        .split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let (name, raw) = entry.split_once('=').ok_or_else(|| {
                AgentError::configuration(format!("{} entry '{}' is not name=value", key, entry))
            })?;
            Ok((name.trim().to_string(), parse_number(raw, key)?))
        })
        .collect()
}
