//! Process-wide agent context
//!
//! Created once at startup and passed explicitly to the scheduler and the
//! collectors. `drain` is called on shutdown.

use crate::{
    concurrency::SourceLimits,
    config::AgentConfig,
    constants::{DEFAULT_CONCURRENCY_CAP, USER_AGENT},
    error::AgentError,
    health::HealthTracker,
    types::HealthStatus,
};
use reqwest::Client;
use std::sync::Arc;

/// Shared state for one agent process
pub struct AgentContext {
    config: AgentConfig,
    health: Arc<HealthTracker>,
    limits: Arc<SourceLimits>,
    http: Client,
}

impl AgentContext {
    /// Validates the configuration and builds the shared components
    pub fn init(config: AgentConfig) -> Result<Arc<Self>, AgentError> {
        config.validate()?;

        let http = Client::builder()
            .timeout(config.request_timeout())
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| AgentError::configuration(format!("cannot build HTTP client: {}", e)))?;

        let health = Arc::new(HealthTracker::new(config.health.clone()));

        let mut limits = SourceLimits::new(DEFAULT_CONCURRENCY_CAP);
        for source in config.concurrency_caps.keys() {
            limits = limits.with_cap(source.as_str(), config.concurrency_cap(source));
        }
        for source in config.request_spacing_ms.keys() {
            if let Some(spacing) = config.request_spacing(source) {
                limits = limits.with_spacing(source.as_str(), spacing);
            }
        }

        tracing::info!(
            interval_minutes = config.collection_interval_minutes,
            request_timeout_secs = config.request_timeout_secs,
            health_window = config.health.window_size,
            "Agent context initialized"
        );

        Ok(Arc::new(Self {
            config,
            health,
            limits: Arc::new(limits),
            http,
        }))
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Health tracker shared by the router and every collector
    pub fn health(&self) -> Arc<HealthTracker> {
        self.health.clone()
    }

    /// Per-source concurrency limits shared by every caller of a source
    pub fn limits(&self) -> Arc<SourceLimits> {
        self.limits.clone()
    }

    /// HTTP client with the configured timeout and user agent
    pub fn http(&self) -> Client {
        self.http.clone()
    }

    /// Logs the final health of every attempted collector
    pub async fn drain(&self) {
        let snapshot = self.health.snapshot_all().await;
        let mut names: Vec<&String> = snapshot.keys().collect();
        names.sort();

        for name in names {
            let health = &snapshot[name];
            let error_rate = health.error_rate.unwrap_or_default();
            if health.status == HealthStatus::Healthy {
                tracing::info!(
                    collector = %name,
                    attempts = health.total_attempts,
                    error_rate,
                    "Final collector health"
                );
            } else {
                tracing::warn!(
                    collector = %name,
                    status = ?health.status,
                    attempts = health.total_attempts,
                    error_rate,
                    "Final collector health"
                );
            }
        }

        tracing::info!("Agent context drained");
    }
}
