//! Blockchair collector implementation
//!
//! Uses chain-wide 24h statistics for UTXO and account chains that Blockchair
//! indexes, annualized to yearly figures.

use crate::{
    collector::Collector,
    collectors::get_json,
    constants::{BLOCKCHAIR, BLOCKCHAIR_API_URL, BLOCKCHAIR_PRIORITY, DAYS_PER_YEAR},
    context::AgentContext,
    error::CollectorError,
    health::HealthTracker,
    types::{Coin, CollectorHealth, ConfidenceLevel, TransactionMetrics},
};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::sync::Arc;

/// Blockchair API response for chain stats
#[derive(Debug, Deserialize)]
struct StatsResponse {
    data: ChainStats,
}

#[derive(Debug, Deserialize)]
struct ChainStats {
    transactions_24h: Option<f64>,
    /// Volume in the chain's smallest unit
    volume_24h: Option<f64>,
    market_price_usd: Option<f64>,
}

/// Decimal places of the smallest unit for each supported chain
fn chain_decimals(chain: &str) -> Option<i32> {
    match chain {
        "bitcoin" | "bitcoin-cash" | "litecoin" | "dogecoin" | "dash" => Some(8),
        "ecash" => Some(2),
        "ethereum" => Some(18),
        _ => None,
    }
}

/// Blockchair collector
pub struct BlockchairCollector {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    health: Arc<HealthTracker>,
}

impl BlockchairCollector {
    /// Creates a new Blockchair collector from the shared context
    pub fn new(context: &AgentContext) -> Self {
        Self {
            client: context.http(),
            base_url: BLOCKCHAIR_API_URL.to_string(),
            api_key: context.config().blockchair_api_key.clone(),
            health: context.health(),
        }
    }

    /// Overrides the API base URL
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn chain<'a>(&self, coin: &'a Coin) -> Option<&'a str> {
        coin.external_id(BLOCKCHAIR)
            .filter(|chain| chain_decimals(chain).is_some())
    }

    /// Builds the Blockchair stats URL for a chain
    fn build_url(&self, chain: &str) -> String {
        match &self.api_key {
            Some(key) => format!("{}/{}/stats?key={}", self.base_url, chain, key),
            None => format!("{}/{}/stats", self.base_url, chain),
        }
    }

    /// Annualizes 24h chain statistics into transaction metrics
    fn parse_response(
        &self,
        coin: &Coin,
        chain: &str,
        response: StatsResponse,
    ) -> Result<TransactionMetrics, CollectorError> {
        let stats = response.data;
        let positive = |v: Option<f64>| v.filter(|v| v.is_finite() && *v >= 0.0);

        let tx_24h = positive(stats.transactions_24h).ok_or_else(|| {
            CollectorError::malformed(format!("no transactions_24h for {} from Blockchair", chain))
        })?;

        let decimals = chain_decimals(chain)
            .ok_or_else(|| CollectorError::unsupported_coin(BLOCKCHAIR, &coin.symbol))?;
        let value_24h = match (positive(stats.volume_24h), positive(stats.market_price_usd)) {
            (Some(volume), Some(price)) => Some(volume / 10f64.powi(decimals) * price),
            _ => None,
        };

        let mut metrics = TransactionMetrics::new(
            &coin.symbol,
            Some(tx_24h * DAYS_PER_YEAR),
            value_24h.map(|v| v * DAYS_PER_YEAR),
            ConfidenceLevel::High,
            BLOCKCHAIR,
        )
        .with_methodology("on-chain 24h transaction count and volume x 365");

        if value_24h.is_none() {
            metrics = metrics.with_issue("volume or USD price missing from chain stats");
        }
        metrics.mark_estimated("annualized from a single 24h window");

        Ok(metrics)
    }
}

#[async_trait]
impl Collector for BlockchairCollector {
    fn name(&self) -> &str {
        BLOCKCHAIR
    }

    fn priority(&self) -> u32 {
        BLOCKCHAIR_PRIORITY
    }

    fn supports(&self, coin: &Coin) -> bool {
        self.chain(coin).is_some()
    }

    async fn collect_transaction_metrics(
        &self,
        coin: &Coin,
    ) -> Result<TransactionMetrics, CollectorError> {
        let chain = self
            .chain(coin)
            .ok_or_else(|| CollectorError::unsupported_coin(BLOCKCHAIR, &coin.symbol))?;

        tracing::debug!(coin = %coin.symbol, chain = chain, "Fetching chain stats from Blockchair");
        let response: StatsResponse =
            get_json(self.client.get(self.build_url(chain)), BLOCKCHAIR).await?;

        self.parse_response(coin, chain, response)
    }

    async fn health(&self) -> CollectorHealth {
        self.health.health(BLOCKCHAIR).await
    }
}
