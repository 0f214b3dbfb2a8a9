//! Types for the metrics agent

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

/// A tracked cryptocurrency
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Coin {
    /// Ticker symbol, unique across the coin set
    pub symbol: String,

    /// Display name
    pub name: String,

    /// Source name -> identifier used by that source (e.g. "coingecko" -> "bitcoin")
    pub external_ids: HashMap<String, String>,

    /// Inactive coins are skipped by collection runs
    pub active: bool,
}

impl Coin {
    /// Create a new active coin with no external ids
    pub fn new(symbol: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            name: name.into(),
            external_ids: HashMap::new(),
            active: true,
        }
    }

    /// Adds the identifier a given source uses for this coin
    pub fn with_external_id(mut self, source: &str, id: impl Into<String>) -> Self {
        self.external_ids.insert(source.to_string(), id.into());
        self
    }

    /// Get the identifier a given source uses for this coin
    pub fn external_id(&self, source: &str) -> Option<&str> {
        self.external_ids.get(source).map(String::as_str)
    }

    /// The default coin set tracked by the agent
    pub fn defaults() -> Vec<Coin> {
        vec![
            Coin::new("BTC", "Bitcoin")
                .with_external_id("coingecko", "bitcoin")
                .with_external_id("blockchair", "bitcoin"),
            Coin::new("ETH", "Ethereum")
                .with_external_id("coingecko", "ethereum")
                .with_external_id("blockchair", "ethereum"),
            Coin::new("DASH", "Dash")
                .with_external_id("coingecko", "dash")
                .with_external_id("blockchair", "dash"),
            Coin::new("DGB", "DigiByte").with_external_id("coingecko", "digibyte"),
            Coin::new("XMR", "Monero").with_external_id("coingecko", "monero"),
            Coin::new("RVN", "Ravencoin").with_external_id("coingecko", "ravencoin"),
            Coin::new("XCH", "Chia").with_external_id("coingecko", "chia"),
            Coin::new("XEC", "eCash")
                .with_external_id("coingecko", "ecash")
                .with_external_id("blockchair", "ecash"),
            Coin::new("XNO", "Nano").with_external_id("coingecko", "nano"),
            Coin::new("NEAR", "NEAR Protocol")
                .with_external_id("coingecko", "near")
                .with_external_id("nearblocks", "near"),
            Coin::new("ICP", "Internet Computer")
                .with_external_id("coingecko", "internet-computer"),
        ]
    }
}

/// Metric kinds a collector may be asked to produce
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    /// Number of on-chain transactions per year
    AnnualTransactionCount,
    /// USD value transferred per year
    AnnualTransactionValue,
    /// Average USD value per transaction
    AverageTransactionValue,
}

impl MetricKind {
    /// Get the metric kind as a stable string
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::AnnualTransactionCount => "annual_transaction_count",
            MetricKind::AnnualTransactionValue => "annual_transaction_value",
            MetricKind::AverageTransactionValue => "average_transaction_value",
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Qualitative trust rating attached to a derived metric
///
/// Ordered from least to most trusted so `min` picks the weaker rating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ConfidenceLevel {
    Low,
    Medium,
    High,
}

impl ConfidenceLevel {
    /// Ceiling for any value produced by extrapolation or a fallback path
    pub const ESTIMATION_CEILING: ConfidenceLevel = ConfidenceLevel::Medium;

    /// Returns this level, lowered to `ceiling` if it exceeds it
    pub fn capped_at(self, ceiling: ConfidenceLevel) -> ConfidenceLevel {
        self.min(ceiling)
    }
}

/// Methodology notes and known issues attached to a result
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricMetadata {
    /// How the value was derived
    pub methodology: Option<String>,

    /// Known weaknesses of this value
    pub issues: Vec<String>,
}

/// A single metric value produced by a collector
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricResult {
    pub coin: String,
    pub kind: MetricKind,
    pub value: f64,
    pub confidence: ConfidenceLevel,
    pub sources: Vec<String>,
    pub metadata: MetricMetadata,
    pub produced_at: DateTime<Utc>,
}

/// Aggregate transaction metrics for a coin
///
/// A source that cannot produce one of the figures leaves it as `None`
/// and notes the gap in `issues`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionMetrics {
    pub coin: String,
    pub annual_tx_count: Option<f64>,
    pub annual_tx_value: Option<f64>,
    pub avg_tx_value: Option<f64>,
    pub confidence: ConfidenceLevel,
    pub sources: Vec<String>,
    pub metadata: MetricMetadata,
    pub produced_at: DateTime<Utc>,
}

impl TransactionMetrics {
    /// Create new transaction metrics, deriving the average when possible
    pub fn new(
        coin: &str,
        annual_tx_count: Option<f64>,
        annual_tx_value: Option<f64>,
        confidence: ConfidenceLevel,
        source: &str,
    ) -> Self {
        let avg_tx_value = match (annual_tx_count, annual_tx_value) {
            (Some(count), Some(value)) if count > 0.0 => Some(value / count),
            _ => None,
        };

        Self {
            coin: coin.to_string(),
            annual_tx_count,
            annual_tx_value,
            avg_tx_value,
            confidence,
            sources: vec![source.to_string()],
            metadata: MetricMetadata::default(),
            produced_at: Utc::now(),
        }
    }

    /// Sets the methodology note
    pub fn with_methodology(mut self, methodology: impl Into<String>) -> Self {
        self.metadata.methodology = Some(methodology.into());
        self
    }

    /// Records a known issue without touching confidence
    pub fn with_issue(mut self, issue: impl Into<String>) -> Self {
        self.metadata.issues.push(issue.into());
        self
    }

    /// Downgrades confidence to at most MEDIUM and records why
    pub fn mark_estimated(&mut self, reason: impl Into<String>) {
        self.confidence = self.confidence.capped_at(ConfidenceLevel::ESTIMATION_CEILING);
        self.metadata.issues.push(reason.into());
    }

    /// Picks out a single metric as a standalone result
    pub fn metric(&self, kind: MetricKind) -> Option<MetricResult> {
        let value = match kind {
            MetricKind::AnnualTransactionCount => self.annual_tx_count,
            MetricKind::AnnualTransactionValue => self.annual_tx_value,
            MetricKind::AverageTransactionValue => self.avg_tx_value,
        }?;

        Some(MetricResult {
            coin: self.coin.clone(),
            kind,
            value,
            confidence: self.confidence,
            sources: self.sources.clone(),
            metadata: self.metadata.clone(),
            produced_at: self.produced_at,
        })
    }
}

/// Collector health status derived from its recent error rate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Rolling health state for one collector
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectorHealth {
    pub collector: String,
    pub status: HealthStatus,

    /// Failure ratio over the trailing window; `None` if never attempted
    pub error_rate: Option<f64>,

    /// Number of outcomes currently in the window
    pub window_len: usize,

    /// Lifetime counters
    pub total_attempts: u64,
    pub failed_attempts: u64,

    /// Median latency of successful attempts in the window
    pub latency_p50_ms: Option<f64>,

    pub last_success: Option<DateTime<Utc>>,
    pub last_failure: Option<DateTime<Utc>>,
}

impl CollectorHealth {
    /// Health for a collector that has never been attempted
    pub fn unattempted(collector: &str) -> Self {
        Self {
            collector: collector.to_string(),
            status: HealthStatus::Healthy,
            error_rate: None,
            window_len: 0,
            total_attempts: 0,
            failed_attempts: 0,
            latency_p50_ms: None,
            last_success: None,
            last_failure: None,
        }
    }
}

/// Status of a collection run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

/// One coin that failed during a run, kept for diagnostics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoinFailure {
    pub coin: String,
    pub error: String,
}

/// Record of one scheduling cycle
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionRun {
    pub id: Uuid,
    pub status: RunStatus,
    pub total_coins: usize,
    pub successful_coins: usize,
    pub failed_coins: usize,

    /// Coins never dispatched because shutdown was requested mid-run
    pub skipped_coins: usize,

    pub failures: Vec<CoinFailure>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,

    /// Run-level error summary, set only when the run itself failed
    pub error: Option<String>,
}

impl CollectionRun {
    /// Create a new run record in the running state
    pub fn start() -> Self {
        Self {
            id: Uuid::new_v4(),
            status: RunStatus::Running,
            total_coins: 0,
            successful_coins: 0,
            failed_coins: 0,
            skipped_coins: 0,
            failures: Vec::new(),
            started_at: Utc::now(),
            finished_at: None,
            duration_ms: None,
            error: None,
        }
    }

    /// Records a per-coin failure
    pub fn record_failure(&mut self, coin: &str, error: impl fmt::Display) {
        self.failed_coins += 1;
        self.failures.push(CoinFailure {
            coin: coin.to_string(),
            error: error.to_string(),
        });
    }

    /// Marks the run completed and stamps its end time
    pub fn complete(mut self) -> Self {
        self.status = RunStatus::Completed;
        self.stamp_end();
        self
    }

    /// Marks the run failed with a run-level error and stamps its end time
    pub fn fail(mut self, error: impl fmt::Display) -> Self {
        self.status = RunStatus::Failed;
        self.error = Some(error.to_string());
        self.stamp_end();
        self
    }

    fn stamp_end(&mut self) {
        let now = Utc::now();
        let elapsed = now.signed_duration_since(self.started_at);
        self.finished_at = Some(now);
        self.duration_ms = Some(elapsed.num_milliseconds().max(0) as u64);
    }
}

/// Externally visible scheduler state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerState {
    Idle,
    Running,
    Stopped,
}
