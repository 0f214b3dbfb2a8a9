//! Collector abstraction for deriving transaction metrics from external sources

use crate::{
    error::CollectorError,
    types::{Coin, CollectorHealth, MetricKind, MetricResult, TransactionMetrics},
};
use async_trait::async_trait;

/// Trait for metric collectors
///
/// Each implementation talks to one external data source. Implementations
/// must bound the time of every call (e.g. with an HTTP client timeout) so a
/// hung source cannot pin a concurrency slot, and must never report more
/// confidence than their methodology supports.
#[async_trait]
pub trait Collector: Send + Sync {
    /// Stable name, also used as the source key for concurrency caps
    fn name(&self) -> &str;

    /// Priority rank; lower is preferred
    fn priority(&self) -> u32;

    /// Returns true if this collector can serve the coin
    fn supports(&self, coin: &Coin) -> bool;

    /// Returns true if this collector can produce the metric kind
    fn supports_metric(&self, _kind: MetricKind) -> bool {
        true
    }

    /// Collects the full transaction metrics summary for a coin
    async fn collect_transaction_metrics(
        &self,
        coin: &Coin,
    ) -> Result<TransactionMetrics, CollectorError>;

    /// Collects a single metric for a coin
    ///
    /// The default implementation derives it from `collect_transaction_metrics`.
    async fn collect(&self, coin: &Coin, kind: MetricKind) -> Result<MetricResult, CollectorError> {
        if !self.supports(coin) {
            return Err(CollectorError::unsupported_coin(self.name(), &coin.symbol));
        }
        if !self.supports_metric(kind) {
            return Err(CollectorError::unsupported_metric(self.name(), &coin.symbol, kind));
        }

        self.collect_transaction_metrics(coin)
            .await?
            .metric(kind)
            .ok_or_else(|| CollectorError::unsupported_metric(self.name(), &coin.symbol, kind))
    }

    /// Health of this collector as tracked by the shared health tracker
    async fn health(&self) -> CollectorHealth;
}
