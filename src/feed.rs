//! Hypixel SkyBlock ended-auctions feed
//!
//! ## API Reference
//!
//! Endpoint: https://api.hypixel.net/v2/skyblock/auctions_ended
//! Returns: auctions that ended in the last ~60 seconds
//!
//! ```json
//! {"success": true, "lastUpdated": 1700000000000,
//!  "auctions": [{"auction_id": "...", "buyer": "uuid", "price": 125000, ...}]}
//! ```
//!
//! The endpoint is refreshed upstream about once a minute, so polling faster
//! than that only returns the same page again.

use crate::state::Sale;
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("feed request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("feed returned HTTP {0}")]
    Status(reqwest::StatusCode),
    #[error("malformed feed payload: {0}")]
    Malformed(String),
    #[error("feed rejected request: {0}")]
    Rejected(String),
}

/// Source of marketplace snapshots
#[async_trait]
pub trait FeedClient: Send + Sync {
    /// Fetch the current page of completed sales
    async fn fetch_snapshot(&self) -> Result<Vec<Sale>, FeedError>;
}

#[derive(Debug, Deserialize)]
struct AuctionsEndedResponse {
    success: bool,
    #[serde(default)]
    cause: Option<String>,
    #[serde(rename = "lastUpdated", default)]
    last_updated: Option<i64>,
    #[serde(default)]
    auctions: Vec<EndedAuction>,
}

#[derive(Debug, Deserialize)]
struct EndedAuction {
    #[serde(default)]
    buyer: Option<String>,
    #[serde(default)]
    price: u64,
}

/// reqwest-backed client for the `auctions_ended` endpoint
pub struct HypixelFeedClient {
    client: reqwest::Client,
    url: String,
}

impl HypixelFeedClient {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, FeedError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl FeedClient for HypixelFeedClient {
    async fn fetch_snapshot(&self) -> Result<Vec<Sale>, FeedError> {
        let response = self.client.get(&self.url).send().await?;

        if !response.status().is_success() {
            return Err(FeedError::Status(response.status()));
        }

        let body = response.text().await?;
        parse_auctions_ended(&body)
    }
}

/// Parse an `auctions_ended` body into sales.
///
/// Auctions without a buyer id are skipped; a missing price counts as 0.
pub fn parse_auctions_ended(body: &str) -> Result<Vec<Sale>, FeedError> {
    let parsed: AuctionsEndedResponse =
        serde_json::from_str(body).map_err(|e| FeedError::Malformed(e.to_string()))?;

    if !parsed.success {
        return Err(FeedError::Rejected(
            parsed.cause.unwrap_or_else(|| "unknown cause".to_string()),
        ));
    }

    let mut sales = Vec::with_capacity(parsed.auctions.len());
    for auction in parsed.auctions {
        match auction.buyer {
            Some(buyer) if !buyer.is_empty() => sales.push(Sale::new(buyer, auction.price)),
            _ => log::debug!("Skipping ended auction without buyer (price {})", auction.price),
        }
    }

    log::debug!(
        "📥 Parsed {} sales (lastUpdated: {:?})",
        sales.len(),
        parsed.last_updated
    );
    Ok(sales)
}
