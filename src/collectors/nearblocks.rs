//! NearBlocks collector implementation
//!
//! NEAR-only source. Prefers summing a full year of the daily transaction
//! chart; falls back to extrapolating the lifetime total over days live.

use crate::{
    collector::Collector,
    collectors::get_json,
    constants::{DAYS_PER_YEAR, NEARBLOCKS, NEARBLOCKS_API_URL, NEARBLOCKS_PRIORITY, NEAR_GENESIS_DATE},
    context::AgentContext,
    error::CollectorError,
    health::HealthTracker,
    types::{Coin, CollectorHealth, ConfidenceLevel, MetricKind, TransactionMetrics},
};
use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use reqwest::Client;
use serde::{Deserialize, Deserializer};
use std::sync::Arc;
use thiserror::Error;

/// NearBlocks reports counts either as JSON numbers or numeric strings
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Count {
    Number(f64),
    Text(String),
}

fn deserialize_count<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    let count = Option::<Count>::deserialize(deserializer)?;
    Ok(match count {
        Some(Count::Number(n)) => Some(n),
        Some(Count::Text(s)) => s.trim().parse::<f64>().ok(),
        None => None,
    })
}

/// Daily transaction chart response
#[derive(Debug, Deserialize)]
struct ChartResponse {
    #[serde(default)]
    txns: Vec<DailyTxns>,
}

#[derive(Debug, Deserialize)]
struct DailyTxns {
    date: String,
    #[serde(default, deserialize_with = "deserialize_count")]
    txns: Option<f64>,
}

/// Network stats response
#[derive(Debug, Deserialize)]
struct StatsResponse {
    #[serde(default)]
    stats: Vec<NetworkStats>,
}

#[derive(Debug, Deserialize)]
struct NetworkStats {
    #[serde(default, deserialize_with = "deserialize_count")]
    total_txns: Option<f64>,
}

/// Why the daily chart could not give a trailing-year total
#[derive(Debug, Error, PartialEq)]
enum ChartGap {
    #[error("daily chart covers only {0} days")]
    TooShort(usize),

    #[error("daily chart has no usable count for {0}")]
    MissingDay(String),

    #[error("daily chart unavailable: {0}")]
    Unavailable(CollectorError),
}

/// Whole days since NEAR mainnet genesis, at least one
fn days_live(today: NaiveDate) -> Result<f64, CollectorError> {
    let genesis = NaiveDate::parse_from_str(NEAR_GENESIS_DATE, "%Y-%m-%d")
        .map_err(|e| CollectorError::malformed(format!("invalid genesis date: {}", e)))?;
    Ok((today - genesis).num_days().max(1) as f64)
}

/// NearBlocks collector
pub struct NearBlocksCollector {
    client: Client,
    base_url: String,
    health: Arc<HealthTracker>,
}

impl NearBlocksCollector {
    /// Creates a new NearBlocks collector from the shared context
    pub fn new(context: &AgentContext) -> Self {
        Self {
            client: context.http(),
            base_url: NEARBLOCKS_API_URL.to_string(),
            health: context.health(),
        }
    }

    /// Overrides the API base URL
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Sums the most recent 365 days of the chart
    fn trailing_year(chart: ChartResponse) -> Result<f64, ChartGap> {
        let mut days = chart.txns;
        if days.len() < DAYS_PER_YEAR as usize {
            return Err(ChartGap::TooShort(days.len()));
        }

        // ISO dates sort chronologically
        days.sort_by(|a, b| a.date.cmp(&b.date));
        let year = &days[days.len() - DAYS_PER_YEAR as usize..];
        year.iter()
            .map(|d| {
                d.txns
                    .filter(|n| n.is_finite() && *n >= 0.0)
                    .ok_or_else(|| ChartGap::MissingDay(d.date.clone()))
            })
            .sum()
    }

    fn from_chart(coin: &Coin, total: f64) -> TransactionMetrics {
        TransactionMetrics::new(&coin.symbol, Some(total), None, ConfidenceLevel::High, NEARBLOCKS)
            .with_methodology("sum of trailing 365 days of daily transaction counts")
            .with_issue("transaction value not available from this source")
    }

    fn from_lifetime_total(
        coin: &Coin,
        response: StatsResponse,
        today: NaiveDate,
        gap: &ChartGap,
    ) -> Result<TransactionMetrics, CollectorError> {
        let total = response
            .stats
            .first()
            .and_then(|s| s.total_txns)
            .filter(|t| t.is_finite() && *t >= 0.0)
            .ok_or_else(|| CollectorError::malformed("no total_txns in NearBlocks stats"))?;

        let days = days_live(today)?;
        let mut metrics = TransactionMetrics::new(
            &coin.symbol,
            Some(total / days * DAYS_PER_YEAR),
            None,
            ConfidenceLevel::High,
            NEARBLOCKS,
        )
        .with_methodology(format!(
            "lifetime transaction total / {} days live x 365",
            days
        ))
        .with_issue("transaction value not available from this source");
        metrics.mark_estimated(format!("extrapolated from lifetime average, {}", gap));

        Ok(metrics)
    }

    async fn fetch_chart(&self) -> Result<ChartResponse, CollectorError> {
        let url = format!("{}/charts/txns", self.base_url);
        get_json(self.client.get(url), NEARBLOCKS).await
    }

    async fn fetch_stats(&self) -> Result<StatsResponse, CollectorError> {
        let url = format!("{}/stats", self.base_url);
        get_json(self.client.get(url), NEARBLOCKS).await
    }
}

#[async_trait]
impl Collector for NearBlocksCollector {
    fn name(&self) -> &str {
        NEARBLOCKS
    }

    fn priority(&self) -> u32 {
        NEARBLOCKS_PRIORITY
    }

    fn supports(&self, coin: &Coin) -> bool {
        coin.external_id(NEARBLOCKS).is_some()
    }

    fn supports_metric(&self, kind: MetricKind) -> bool {
        kind == MetricKind::AnnualTransactionCount
    }

    async fn collect_transaction_metrics(
        &self,
        coin: &Coin,
    ) -> Result<TransactionMetrics, CollectorError> {
        if !self.supports(coin) {
            return Err(CollectorError::unsupported_coin(NEARBLOCKS, &coin.symbol));
        }

        let gap = match self.fetch_chart().await {
            Ok(chart) => match Self::trailing_year(chart) {
                Ok(total) => return Ok(Self::from_chart(coin, total)),
                Err(gap) => gap,
            },
            Err(e) => ChartGap::Unavailable(e),
        };
        tracing::warn!(coin = %coin.symbol, reason = %gap, "Using lifetime total for NEAR");

        let stats = self.fetch_stats().await?;
        Self::from_lifetime_total(coin, stats, Utc::now().date_naive(), &gap)
    }

    async fn health(&self) -> CollectorHealth {
        self.health.health(NEARBLOCKS).await
    }
}
