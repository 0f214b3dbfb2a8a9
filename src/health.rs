//! Collector health tracking
//!
//! Keeps a bounded window of recent outcomes per collector and derives a
//! health status from the window's error rate.

use crate::{
    config::HealthConfig,
    types::{CollectorHealth, HealthStatus},
};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::RwLock;

/// Internal sample for one collection attempt
#[derive(Debug, Clone, Copy)]
struct Outcome {
    success: bool,
    duration_ms: f64,
}

/// Rolling state for one collector
#[derive(Debug, Default)]
struct Window {
    outcomes: VecDeque<Outcome>,
    total_attempts: u64,
    failed_attempts: u64,
    last_success: Option<DateTime<Utc>>,
    last_failure: Option<DateTime<Utc>>,
}

impl Window {
    fn push(&mut self, outcome: Outcome, capacity: usize, at: DateTime<Utc>) {
        if self.outcomes.len() >= capacity {
            self.outcomes.pop_front();
        }
        self.outcomes.push_back(outcome);

        self.total_attempts += 1;
        if outcome.success {
            self.last_success = max_time(self.last_success, at);
        } else {
            self.failed_attempts += 1;
            self.last_failure = max_time(self.last_failure, at);
        }
    }

    fn error_rate(&self) -> Option<f64> {
        if self.outcomes.is_empty() {
            return None;
        }
        let failures = self.outcomes.iter().filter(|o| !o.success).count();
        Some(failures as f64 / self.outcomes.len() as f64)
    }
}

/// Keeps timestamps monotonic when outcomes are recorded out of order
fn max_time(current: Option<DateTime<Utc>>, at: DateTime<Utc>) -> Option<DateTime<Utc>> {
    Some(current.map_or(at, |c| c.max(at)))
}

/// Tracks rolling health for every collector
///
/// Recording appends to a collector's window; reading never mutates state.
pub struct HealthTracker {
    config: HealthConfig,
    windows: RwLock<HashMap<String, Window>>,
}

impl HealthTracker {
    /// Creates a new tracker
    pub fn new(config: HealthConfig) -> Self {
        Self {
            config,
            windows: RwLock::new(HashMap::new()),
        }
    }

    /// Records the outcome of one collection attempt
    pub async fn record(&self, collector: &str, success: bool, duration: Duration) {
        let outcome = Outcome {
            success,
            duration_ms: duration.as_secs_f64() * 1000.0,
        };
        let now = Utc::now();

        let mut windows = self.windows.write().await;
        let window = windows.entry(collector.to_string()).or_default();
        let before = self.classify(window.error_rate());
        window.push(outcome, self.config.window_size, now);
        let after = self.classify(window.error_rate());

        if before != after {
            tracing::info!(
                collector = collector,
                from = ?before,
                to = ?after,
                error_rate = window.error_rate().unwrap_or_default(),
                "Collector health changed"
            );
        }
    }

    /// Records a successful attempt
    pub async fn record_success(&self, collector: &str, duration: Duration) {
        self.record(collector, true, duration).await;
    }

    /// Records a failed attempt
    pub async fn record_failure(&self, collector: &str, duration: Duration) {
        self.record(collector, false, duration).await;
    }

    /// Current health for a collector
    pub async fn health(&self, collector: &str) -> CollectorHealth {
        let windows = self.windows.read().await;
        match windows.get(collector) {
            Some(window) => self.snapshot(collector, window),
            None => CollectorHealth::unattempted(collector),
        }
    }

    /// Current health status for a collector
    pub async fn status(&self, collector: &str) -> HealthStatus {
        self.health(collector).await.status
    }

    /// Health for every collector that has been attempted at least once
    pub async fn snapshot_all(&self) -> HashMap<String, CollectorHealth> {
        let windows = self.windows.read().await;
        windows
            .iter()
            .map(|(name, window)| (name.clone(), self.snapshot(name, window)))
            .collect()
    }

    fn snapshot(&self, collector: &str, window: &Window) -> CollectorHealth {
        let error_rate = window.error_rate();

        let mut latencies: Vec<f64> = window
            .outcomes
            .iter()
            .filter(|o| o.success)
            .map(|o| o.duration_ms)
            .collect();
        latencies.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

        CollectorHealth {
            collector: collector.to_string(),
            status: self.classify(error_rate),
            error_rate,
            window_len: window.outcomes.len(),
            total_attempts: window.total_attempts,
            failed_attempts: window.failed_attempts,
            latency_p50_ms: percentile(&latencies, 50.0),
            last_success: window.last_success,
            last_failure: window.last_failure,
        }
    }

    fn classify(&self, error_rate: Option<f64>) -> HealthStatus {
        match error_rate {
            None => HealthStatus::Healthy,
            Some(rate) if rate >= self.config.unhealthy_threshold => HealthStatus::Unhealthy,
            Some(rate) if rate >= self.config.degraded_threshold => HealthStatus::Degraded,
            Some(_) => HealthStatus::Healthy,
        }
    }
}

/// Calculate percentile from sorted values
fn percentile(sorted_values: &[f64], p: f64) -> Option<f64> {
    if sorted_values.is_empty() {
        return None;
    }

    let idx = (p / 100.0 * (sorted_values.len() - 1) as f64).round() as usize;
    Some(sorted_values[idx.min(sorted_values.len() - 1)])
}
