//! # CFV Metrics Agent
//!
//! Periodically collects annual transaction metrics (count, value, average
//! value) for a fixed set of cryptocurrencies from third-party data sources.
//!
//! ## Architecture
//!
//! - **Collectors** wrap one data source each and report per-coin metrics
//!   with a confidence level
//! - **Router** picks the best healthy collector for a coin and falls back
//!   through the rest in priority order
//! - **Scheduler** runs one collection cycle at a time, on a timer or on
//!   demand, with a separate concurrency cap per source
//! - **Storage** receives the metric results and a record of every run
//!
//! ## Usage
//!
//! ```no_run
//! use cfv_metrics_agent::{
//!     AgentConfig, AgentContext, BlockchairCollector, CoinGeckoCollector, CollectionScheduler,
//!     Collector, CollectorRouter, InMemoryStorage, NearBlocksCollector,
//! };
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let context = AgentContext::init(AgentConfig::from_env()?)?;
//!
//! let collectors: Vec<Arc<dyn Collector>> = vec![
//!     Arc::new(NearBlocksCollector::new(&context)),
//!     Arc::new(BlockchairCollector::new(&context)),
//!     Arc::new(CoinGeckoCollector::new(&context)),
//! ];
//! let router = Arc::new(CollectorRouter::from_context(collectors, &context));
//! let storage = Arc::new(InMemoryStorage::with_default_coins());
//!
//! let scheduler = CollectionScheduler::new(context.clone(), router, storage);
//!
//! // Run a single cycle and inspect the outcome
//! let run = scheduler.run_cycle().await?;
//! println!("{} of {} coins collected", run.successful_coins, run.total_coins);
//!
//! // Or keep collecting on the configured interval
//! scheduler.start();
//! # scheduler.stop().await;
//! # Ok(())
//! # }
//! ```

pub mod collector;
pub mod collectors;
pub mod concurrency;
pub mod config;
pub mod constants;
pub mod context;
pub mod error;
pub mod health;
pub mod router;
pub mod scheduler;
pub mod storage;
pub mod types;

// Re-export commonly used types
pub use collector::Collector;
pub use collectors::{ApiKeyStatus, BlockchairCollector, CoinGeckoCollector, NearBlocksCollector};
pub use config::{AgentConfig, HealthConfig};
pub use context::AgentContext;
pub use error::{AgentError, CollectorError, StorageError};
pub use health::HealthTracker;
pub use router::{CollectorRouter, Routed};
pub use scheduler::CollectionScheduler;
pub use storage::{InMemoryStorage, MetricsStorage};
pub use types::{
    Coin, CollectionRun, CollectorHealth, ConfidenceLevel, HealthStatus, MetricKind,
    MetricResult, RunStatus, SchedulerState, TransactionMetrics,
};
