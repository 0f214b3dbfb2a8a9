//! Data source collector implementations

pub mod blockchair;
pub mod coingecko;
pub mod nearblocks;

pub use blockchair::BlockchairCollector;
pub use coingecko::{ApiKeyStatus, CoinGeckoCollector};
pub use nearblocks::NearBlocksCollector;

use crate::error::CollectorError;
use serde::de::DeserializeOwned;

/// Sends a request and decodes its JSON body
pub(crate) async fn get_json<T: DeserializeOwned>(
    request: reqwest::RequestBuilder,
    source: &str,
) -> Result<T, CollectorError> {
    let response = request.send().await?;

    let status = response.status();
    if status.as_u16() == 429 {
        return Err(CollectorError::unavailable(format!("{} rate limited", source)));
    }

    if !status.is_success() {
        return Err(CollectorError::unavailable(format!(
            "{} returned HTTP {}",
            source, status
        )));
    }

    let body = response.text().await?;
    serde_json::from_str(&body).map_err(|e| {
        CollectorError::malformed(format!("failed to parse {} response: {}", source, e))
    })
}
