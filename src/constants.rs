//! Constants for the metrics agent
//!
//! Defaults for every configurable option live here. `AgentConfig::default()`
//! is built from these values and environment overrides are layered on top.

/// How often a collection cycle runs (in minutes)
pub const DEFAULT_COLLECTION_INTERVAL_MINUTES: u64 = 60;

/// HTTP request timeout for collector calls (in seconds)
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 10;

/// Concurrency cap for sources without an explicit setting
pub const DEFAULT_CONCURRENCY_CAP: usize = 1;

/// Default per-source concurrency caps
pub const DEFAULT_CONCURRENCY_CAPS: &[(&str, usize)] =
    &[(COINGECKO, 1), (BLOCKCHAIR, 3), (NEARBLOCKS, 2)];

/// Default spacing between tasks of the same source (in milliseconds)
pub const DEFAULT_REQUEST_SPACING_MS: &[(&str, u64)] = &[(COINGECKO, 1500)];

/// Number of outcomes kept per collector for error-rate calculation
pub const DEFAULT_HEALTH_WINDOW_SIZE: usize = 20;

/// Error rate at or above which a collector is degraded
pub const DEFAULT_DEGRADED_THRESHOLD: f64 = 0.2;

/// Error rate at or above which a collector is unhealthy
pub const DEFAULT_UNHEALTHY_THRESHOLD: f64 = 0.5;

/// Days per year used when annualizing daily figures
pub const DAYS_PER_YEAR: f64 = 365.0;

/// Collector names, also used as source keys in configuration
pub const NEARBLOCKS: &str = "nearblocks";
pub const BLOCKCHAIR: &str = "blockchair";
pub const COINGECKO: &str = "coingecko";

/// Collector priority ranks (lower is preferred)
pub const NEARBLOCKS_PRIORITY: u32 = 1;
pub const BLOCKCHAIR_PRIORITY: u32 = 2;
pub const COINGECKO_PRIORITY: u32 = 10;

/// NearBlocks API base URL
pub const NEARBLOCKS_API_URL: &str = "https://api.nearblocks.io/v1";

/// NEAR mainnet genesis date, used to compute days live
pub const NEAR_GENESIS_DATE: &str = "2020-04-22";

/// Blockchair API base URL
pub const BLOCKCHAIR_API_URL: &str = "https://api.blockchair.com";

/// CoinGecko API base URL
pub const COINGECKO_API_URL: &str = "https://api.coingecko.com/api/v3";

/// Header carrying a CoinGecko demo API key
pub const COINGECKO_API_KEY_HEADER: &str = "x-cg-demo-api-key";

/// User agent for HTTP requests
pub const USER_AGENT: &str = "cfv-metrics-agent/0.1.0";
