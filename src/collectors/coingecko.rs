//! CoinGecko collector implementation
//!
//! Last-resort source: exchange trading volume annualized as a proxy for
//! on-chain transfer value. Never better than LOW confidence.

use crate::{
    collector::Collector,
    collectors::get_json,
    constants::{COINGECKO, COINGECKO_API_KEY_HEADER, COINGECKO_API_URL, COINGECKO_PRIORITY, DAYS_PER_YEAR},
    context::AgentContext,
    error::CollectorError,
    health::HealthTracker,
    types::{Coin, CollectorHealth, ConfidenceLevel, MetricKind, TransactionMetrics},
};
use async_trait::async_trait;
use reqwest::{header::HeaderMap, Client, StatusCode};
use serde::Deserialize;
use std::sync::Arc;

/// CoinGecko API response for a single coin
#[derive(Debug, Deserialize)]
struct CoinResponse {
    market_data: MarketData,
}

#[derive(Debug, Deserialize)]
struct MarketData {
    total_volume: UsdValue,
}

#[derive(Debug, Deserialize)]
struct UsdValue {
    usd: Option<f64>,
}

/// Result of checking the configured API key against `/ping`
#[derive(Debug, Clone, PartialEq)]
pub enum ApiKeyStatus {
    NotConfigured,
    Valid {
        rate_limit: Option<u64>,
        rate_remaining: Option<u64>,
    },
    /// Rejected as invalid or expired
    Invalid,
    RateLimited,
    Error(String),
}

fn header_number(headers: &HeaderMap, name: &str) -> Option<u64> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

fn key_status(status: StatusCode, headers: &HeaderMap) -> ApiKeyStatus {
    match status.as_u16() {
        200..=299 => ApiKeyStatus::Valid {
            rate_limit: header_number(headers, "x-ratelimit-limit"),
            rate_remaining: header_number(headers, "x-ratelimit-remaining"),
        },
        401 | 403 => ApiKeyStatus::Invalid,
        429 => ApiKeyStatus::RateLimited,
        _ => ApiKeyStatus::Error(format!("HTTP {}", status)),
    }
}

/// CoinGecko collector
pub struct CoinGeckoCollector {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    health: Arc<HealthTracker>,
}

impl CoinGeckoCollector {
    /// Creates a new CoinGecko collector from the shared context
    pub fn new(context: &AgentContext) -> Self {
        Self {
            client: context.http(),
            base_url: COINGECKO_API_URL.to_string(),
            api_key: context.config().coingecko_api_key.clone(),
            health: context.health(),
        }
    }

    /// Overrides the API base URL
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Checks the configured API key without collecting anything
    pub async fn check_api_key(&self) -> ApiKeyStatus {
        let Some(key) = &self.api_key else {
            return ApiKeyStatus::NotConfigured;
        };

        let request = self
            .client
            .get(format!("{}/ping", self.base_url))
            .header(COINGECKO_API_KEY_HEADER, key);

        match request.send().await {
            Ok(response) => key_status(response.status(), response.headers()),
            Err(e) => ApiKeyStatus::Error(CollectorError::from(e).to_string()),
        }
    }

    /// Builds the CoinGecko API URL for a coin
    fn build_url(&self, id: &str) -> String {
        format!(
            "{}/coins/{}?localization=false&tickers=false&market_data=true&community_data=false&developer_data=false",
            self.base_url, id
        )
    }

    /// Annualizes 24h exchange volume into transaction metrics
    fn parse_response(
        &self,
        coin: &Coin,
        response: CoinResponse,
    ) -> Result<TransactionMetrics, CollectorError> {
        let volume_24h = response
            .market_data
            .total_volume
            .usd
            .filter(|v| v.is_finite() && *v > 0.0)
            .ok_or_else(|| {
                CollectorError::malformed(format!("no USD volume for {} from CoinGecko", coin.symbol))
            })?;

        let mut metrics = TransactionMetrics::new(
            &coin.symbol,
            None,
            Some(volume_24h * DAYS_PER_YEAR),
            ConfidenceLevel::Low,
            COINGECKO,
        )
        .with_methodology("24h exchange volume (USD) x 365")
        .with_issue("exchange trading volume is a proxy, not on-chain transfer value")
        .with_issue("transaction count not available from this source");
        metrics.mark_estimated("annualized from a single 24h window");

        Ok(metrics)
    }
}

#[async_trait]
impl Collector for CoinGeckoCollector {
    fn name(&self) -> &str {
        COINGECKO
    }

    fn priority(&self) -> u32 {
        COINGECKO_PRIORITY
    }

    fn supports(&self, coin: &Coin) -> bool {
        coin.external_id(COINGECKO).is_some()
    }

    fn supports_metric(&self, kind: MetricKind) -> bool {
        kind == MetricKind::AnnualTransactionValue
    }

    async fn collect_transaction_metrics(
        &self,
        coin: &Coin,
    ) -> Result<TransactionMetrics, CollectorError> {
        let id = coin
            .external_id(COINGECKO)
            .ok_or_else(|| CollectorError::unsupported_coin(COINGECKO, &coin.symbol))?;

        let url = self.build_url(id);
        tracing::debug!(coin = %coin.symbol, url = %url, "Fetching volume from CoinGecko");

        let mut request = self.client.get(&url);
        if let Some(key) = &self.api_key {
            request = request.header(COINGECKO_API_KEY_HEADER, key);
        }

        let response: CoinResponse = get_json(request, COINGECKO).await?;
        self.parse_response(coin, response)
    }

    async fn health(&self) -> CollectorHealth {
        self.health.health(COINGECKO).await
    }
}
