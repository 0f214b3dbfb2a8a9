//! Collector routing with priority ordering and fallback
//!
//! For each coin the router builds a candidate chain of collectors that
//! support it, drops unhealthy ones, orders the rest by priority and then by
//! recent error rate, and tries them in turn until one succeeds. Every call
//! holds a slot on its source's concurrency limit, fallback calls included.

use crate::{
    collector::Collector,
    concurrency::SourceLimits,
    context::AgentContext,
    error::{AgentError, CollectorAttempt, CollectorError},
    health::HealthTracker,
    types::{Coin, CollectorHealth, HealthStatus, MetricKind, MetricResult, TransactionMetrics},
};
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

/// Result of a routed call
#[derive(Debug, Clone)]
pub struct Routed<T> {
    pub value: T,
    /// Collector that produced `value`
    pub collector: String,
    /// Failed attempts that preceded the successful one
    pub attempts: Vec<CollectorAttempt>,
}

/// Registry of collectors and fallback engine
pub struct CollectorRouter {
    collectors: Vec<Arc<dyn Collector>>,
    health: Arc<HealthTracker>,
    limits: Option<Arc<SourceLimits>>,
}

impl CollectorRouter {
    /// Creates a new router over the given collectors
    ///
    /// Collectors are kept in priority order; registration order breaks ties.
    pub fn new(mut collectors: Vec<Arc<dyn Collector>>, health: Arc<HealthTracker>) -> Self {
        collectors.sort_by_key(|c| c.priority());
        Self {
            collectors,
            health,
            limits: None,
        }
    }

    /// Creates a router sharing the context's health tracker and source limits
    pub fn from_context(collectors: Vec<Arc<dyn Collector>>, context: &AgentContext) -> Self {
        Self::new(collectors, context.health()).with_limits(context.limits())
    }

    /// Bounds every collector call by its source's concurrency limit
    pub fn with_limits(mut self, limits: Arc<SourceLimits>) -> Self {
        self.limits = Some(limits);
        self
    }

    /// Names of all registered collectors, in priority order
    pub fn collector_names(&self) -> Vec<String> {
        self.collectors.iter().map(|c| c.name().to_string()).collect()
    }

    /// Collectors that claim to support the coin, in priority order
    fn supporters(&self, coin: &Coin, kind: Option<MetricKind>) -> Vec<Arc<dyn Collector>> {
        self.collectors
            .iter()
            .filter(|c| c.supports(coin))
            .filter(|c| kind.map_or(true, |k| c.supports_metric(k)))
            .cloned()
            .collect()
    }

    /// Checks that every coin has at least one supporting collector
    pub fn validate_coverage(&self, coins: &[Coin]) -> Result<(), AgentError> {
        let uncovered: Vec<&str> = coins
            .iter()
            .filter(|coin| self.supporters(coin, None).is_empty())
            .map(|coin| coin.symbol.as_str())
            .collect();

        if uncovered.is_empty() {
            Ok(())
        } else {
            Err(AgentError::configuration(format!(
                "no collector supports: {}",
                uncovered.join(", ")
            )))
        }
    }

    /// Ordered candidate chain for a coin
    ///
    /// `kind` restricts candidates to collectors that can produce that metric;
    /// `None` means the full transaction metrics summary.
    pub async fn candidates(
        &self,
        coin: &Coin,
        kind: Option<MetricKind>,
    ) -> Result<Vec<Arc<dyn Collector>>, AgentError> {
        let supporters = self.supporters(coin, kind);
        if supporters.is_empty() {
            return Err(AgentError::configuration(match kind {
                Some(kind) => format!("no collector supports {} for {}", kind, coin.symbol),
                None => format!("no collector supports {}", coin.symbol),
            }));
        }

        let mut ranked: Vec<(Arc<dyn Collector>, CollectorHealth)> =
            Vec::with_capacity(supporters.len());
        for collector in supporters {
            let health = self.health.health(collector.name()).await;
            ranked.push((collector, health));
        }

        // Unhealthy collectors stay eligible only when nothing else is, so
        // they still get probed and can recover.
        if ranked.iter().any(|(_, h)| h.status != HealthStatus::Unhealthy) {
            ranked.retain(|(_, h)| h.status != HealthStatus::Unhealthy);
        } else {
            tracing::warn!(
                coin = %coin.symbol,
                "All supporting collectors are unhealthy, trying them anyway"
            );
        }

        ranked.sort_by(|(a, ha), (b, hb)| {
            a.priority().cmp(&b.priority()).then_with(|| {
                let ra = ha.error_rate.unwrap_or(0.0);
                let rb = hb.error_rate.unwrap_or(0.0);
                ra.partial_cmp(&rb).unwrap_or(std::cmp::Ordering::Equal)
            })
        });

        Ok(ranked.into_iter().map(|(c, _)| c).collect())
    }

    /// Name of the collector a coin's summary would currently be routed to first
    pub async fn resolve(&self, coin: &Coin) -> Result<String, AgentError> {
        let candidates = self.candidates(coin, None).await?;
        candidates
            .first()
            .map(|c| c.name().to_string())
            .ok_or_else(|| AgentError::configuration(format!("no collector supports {}", coin.symbol)))
    }

    /// Collects a single metric, falling back across candidates
    pub async fn collect_metric(
        &self,
        coin: &Coin,
        kind: MetricKind,
    ) -> Result<Routed<MetricResult>, AgentError> {
        let coin_ref = coin.clone();
        self.route(coin, Some(kind), move |collector| {
            let coin = coin_ref.clone();
            Box::pin(async move { collector.collect(&coin, kind).await })
        })
        .await
    }

    /// Collects the transaction metrics summary, falling back across candidates
    pub async fn collect_transaction_metrics(
        &self,
        coin: &Coin,
    ) -> Result<Routed<TransactionMetrics>, AgentError> {
        let coin_ref = coin.clone();
        self.route(coin, None, move |collector| {
            let coin = coin_ref.clone();
            Box::pin(async move { collector.collect_transaction_metrics(&coin).await })
        })
        .await
    }

    async fn route<T, F>(
        &self,
        coin: &Coin,
        kind: Option<MetricKind>,
        mut invoke: F,
    ) -> Result<Routed<T>, AgentError>
    where
        F: FnMut(Arc<dyn Collector>) -> BoxFuture<'static, Result<T, CollectorError>>,
    {
        let candidates = self.candidates(coin, kind).await?;
        let mut attempts = Vec::with_capacity(candidates.len());

        for collector in candidates {
            let name = collector.name().to_string();

            let permit = match &self.limits {
                Some(limits) => match limits.acquire(&name).await {
                    Ok(permit) => Some(permit),
                    Err(e) => {
                        attempts.push(CollectorAttempt {
                            collector: name,
                            error: CollectorError::unavailable(e.to_string()),
                        });
                        continue;
                    }
                },
                None => None,
            };

            let started = Instant::now();
            let result = invoke(collector).await;
            drop(permit);

            match result {
                Ok(value) => {
                    self.health.record_success(&name, started.elapsed()).await;
                    if !attempts.is_empty() {
                        tracing::info!(
                            coin = %coin.symbol,
                            collector = %name,
                            failed_attempts = attempts.len(),
                            "Fallback collector succeeded"
                        );
                    }
                    return Ok(Routed {
                        value,
                        collector: name,
                        attempts,
                    });
                }
                Err(error) => {
                    self.health.record_failure(&name, started.elapsed()).await;
                    tracing::warn!(
                        coin = %coin.symbol,
                        collector = %name,
                        error = %error,
                        "Collector failed, trying next candidate"
                    );
                    attempts.push(CollectorAttempt {
                        collector: name,
                        error,
                    });
                }
            }
        }

        Err(AgentError::AllCandidatesExhausted {
            coin: coin.symbol.clone(),
            attempts,
        })
    }

    /// Health of every registered collector, keyed by name
    pub async fn health_snapshot(&self) -> HashMap<String, CollectorHealth> {
        let mut snapshot = HashMap::with_capacity(self.collectors.len());
        for collector in &self.collectors {
            snapshot.insert(collector.name().to_string(), collector.health().await);
        }
        snapshot
    }
}
