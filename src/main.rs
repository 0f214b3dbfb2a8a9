use cfv_metrics_agent::{
    AgentConfig, AgentContext, ApiKeyStatus, BlockchairCollector, CoinGeckoCollector,
    CollectionScheduler, Collector, CollectorRouter, InMemoryStorage, MetricsStorage,
    NearBlocksCollector,
};
use std::error::Error;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Respects RUST_LOG; defaults to `info` for this crate.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("cfv_metrics_agent=info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

fn log_api_key_status(status: ApiKeyStatus) {
    match status {
        ApiKeyStatus::Valid {
            rate_limit,
            rate_remaining,
        } => tracing::info!(?rate_limit, ?rate_remaining, "CoinGecko API key is valid"),
        ApiKeyStatus::NotConfigured => {
            tracing::info!("CoinGecko API key not configured, using public rate limits")
        }
        ApiKeyStatus::Invalid => tracing::warn!("CoinGecko API key is invalid or expired"),
        ApiKeyStatus::RateLimited => tracing::warn!("CoinGecko API key is rate limited"),
        ApiKeyStatus::Error(e) => tracing::warn!(error = %e, "CoinGecko API key check failed"),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    dotenvy::dotenv().ok();
    init_tracing();

    let config = match std::env::var("CFV_CONFIG_FILE") {
        Ok(path) => AgentConfig::from_json_file(path)?,
        Err(_) => AgentConfig::from_env()?,
    };
    let context = AgentContext::init(config)?;

    let coingecko = Arc::new(CoinGeckoCollector::new(&context));
    log_api_key_status(coingecko.check_api_key().await);

    let collectors: Vec<Arc<dyn Collector>> = vec![
        Arc::new(NearBlocksCollector::new(&context)),
        Arc::new(BlockchairCollector::new(&context)),
        coingecko,
    ];
    let router = Arc::new(CollectorRouter::from_context(collectors, &context));
    let storage = Arc::new(InMemoryStorage::with_default_coins());

    router.validate_coverage(&storage.list_active_coins().await?)?;
    tracing::info!(collectors = ?router.collector_names(), "Collectors registered");

    let scheduler = CollectionScheduler::new(context.clone(), router, storage);
    scheduler.start();

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received");

    scheduler.stop().await;
    context.drain().await;

    Ok(())
}
