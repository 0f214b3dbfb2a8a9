//! Storage collaborator for coins, metric results and run records

use crate::{
    error::StorageError,
    types::{Coin, CollectionRun, TransactionMetrics},
};
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Minimal persistence contract the scheduler depends on
#[async_trait]
pub trait MetricsStorage: Send + Sync {
    /// Coins that collection runs should refresh
    async fn list_active_coins(&self) -> Result<Vec<Coin>, StorageError>;

    /// Persists a metrics result for a coin
    async fn save_metric_result(
        &self,
        coin_symbol: &str,
        metrics: &TransactionMetrics,
    ) -> Result<(), StorageError>;

    /// Persists a finalized collection run
    async fn record_collection_run(&self, run: &CollectionRun) -> Result<(), StorageError>;
}

/// In-memory storage
///
/// Keeps full metric history per coin and every run record.
pub struct InMemoryStorage {
    coins: RwLock<Vec<Coin>>,
    metrics: RwLock<HashMap<String, Vec<TransactionMetrics>>>,
    runs: RwLock<Vec<CollectionRun>>,
}

impl InMemoryStorage {
    /// Creates a new store seeded with coins
    pub fn new(coins: Vec<Coin>) -> Self {
        Self {
            coins: RwLock::new(coins),
            metrics: RwLock::new(HashMap::new()),
            runs: RwLock::new(Vec::new()),
        }
    }

    /// Creates a store seeded with the default coin set
    pub fn with_default_coins() -> Self {
        Self::new(Coin::defaults())
    }

    /// Sets a coin's active flag
    pub async fn set_active(&self, symbol: &str, active: bool) -> Result<(), StorageError> {
        let mut coins = self.coins.write().await;
        let coin = coins
            .iter_mut()
            .find(|c| c.symbol == symbol)
            .ok_or_else(|| StorageError::UnknownCoin(symbol.to_string()))?;
        coin.active = active;
        Ok(())
    }

    /// Most recent metrics saved for a coin
    pub async fn latest_metrics(&self, symbol: &str) -> Option<TransactionMetrics> {
        let metrics = self.metrics.read().await;
        metrics.get(symbol).and_then(|history| history.last().cloned())
    }

    /// Every metrics result saved for a coin, oldest first
    pub async fn metrics_history(&self, symbol: &str) -> Vec<TransactionMetrics> {
        let metrics = self.metrics.read().await;
        metrics.get(symbol).cloned().unwrap_or_default()
    }

    /// Every recorded run, oldest first
    pub async fn runs(&self) -> Vec<CollectionRun> {
        self.runs.read().await.clone()
    }
}

impl Default for InMemoryStorage {
    fn default() -> Self {
        Self::with_default_coins()
    }
}

#[async_trait]
impl MetricsStorage for InMemoryStorage {
    async fn list_active_coins(&self) -> Result<Vec<Coin>, StorageError> {
        let coins = self.coins.read().await;
        Ok(coins.iter().filter(|c| c.active).cloned().collect())
    }

    async fn save_metric_result(
        &self,
        coin_symbol: &str,
        metrics: &TransactionMetrics,
    ) -> Result<(), StorageError> {
        if !self.coins.read().await.iter().any(|c| c.symbol == coin_symbol) {
            return Err(StorageError::UnknownCoin(coin_symbol.to_string()));
        }

        let mut all = self.metrics.write().await;
        all.entry(coin_symbol.to_string())
            .or_default()
            .push(metrics.clone());
        tracing::debug!(coin = coin_symbol, "Saved transaction metrics");
        Ok(())
    }

    async fn record_collection_run(&self, run: &CollectionRun) -> Result<(), StorageError> {
        self.runs.write().await.push(run.clone());
        Ok(())
    }
}
