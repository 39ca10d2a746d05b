// =============================================================================
// Derivatives Sentiment Feed — funding, open interest, long/short ratio
// =============================================================================
//
// Periodic pull from the OKX public API per asset. Failures are silent from
// the consumer's point of view: the stale value stays in place and getters
// keep returning it. Nothing here is load-bearing for safety — the risk gate
// treats a missing ratio as "no data" and lets the entry through.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::types::Asset;

/// Seconds between refresh passes.
const UPDATE_INTERVAL_SECS: u64 = 60;

fn inst_id(asset: Asset) -> &'static str {
    match asset {
        Asset::Btc => "BTC-USDT-SWAP",
        Asset::Eth => "ETH-USDT-SWAP",
    }
}

/// Fetches and caches derivatives data from the OKX public API.
pub struct DerivativesFeed {
    client: reqwest::Client,
    funding_rates: RwLock<HashMap<Asset, f64>>,
    open_interest: RwLock<HashMap<Asset, f64>>,
    long_short_ratios: RwLock<HashMap<Asset, f64>>,
}

impl DerivativesFeed {
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            funding_rates: RwLock::new(HashMap::new()),
            open_interest: RwLock::new(HashMap::new()),
            long_short_ratios: RwLock::new(HashMap::new()),
        }
    }

    /// Latest funding rate as a decimal (0.0001 = 0.01%).
    pub fn funding_rate(&self, asset: Asset) -> Option<f64> {
        self.funding_rates.read().get(&asset).copied()
    }

    /// Latest open interest in contracts.
    pub fn open_interest(&self, asset: Asset) -> Option<f64> {
        self.open_interest.read().get(&asset).copied()
    }

    /// Latest account-weighted long/short ratio.
    pub fn long_short_ratio(&self, asset: Asset) -> Option<f64> {
        self.long_short_ratios.read().get(&asset).copied()
    }

    async fn fetch_json(&self, url: &str) -> Result<serde_json::Value> {
        self.client
            .get(url)
            .header("User-Agent", "vega-bot")
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .with_context(|| format!("GET {url}"))?
            .json()
            .await
            .context("failed to parse derivatives response")
    }

    /// One refresh pass over all endpoints for both assets. Each endpoint
    /// fails independently; stale values survive.
    pub async fn refresh(&self) {
        for asset in [Asset::Btc, Asset::Eth] {
            let inst = inst_id(asset);

            let url = format!("https://www.okx.com/api/v5/public/funding-rate?instId={inst}");
            match self.fetch_json(&url).await {
                Ok(body) => {
                    if let Some(rate) = body["data"][0]["fundingRate"]
                        .as_str()
                        .and_then(|s| s.parse::<f64>().ok())
                    {
                        self.funding_rates.write().insert(asset, rate);
                        debug!(asset = %asset, rate, "funding rate updated");
                    }
                }
                Err(e) => warn!(asset = %asset, error = %e, "funding rate fetch failed"),
            }

            let url = format!(
                "https://www.okx.com/api/v5/public/open-interest?instType=SWAP&instId={inst}"
            );
            match self.fetch_json(&url).await {
                Ok(body) => {
                    if let Some(oi) = body["data"][0]["oi"]
                        .as_str()
                        .and_then(|s| s.parse::<f64>().ok())
                    {
                        self.open_interest.write().insert(asset, oi);
                    }
                }
                Err(e) => warn!(asset = %asset, error = %e, "open interest fetch failed"),
            }

            let url = format!(
                "https://www.okx.com/api/v5/rubik/stat/contracts/long-short-account-ratio?ccy={asset}&period=5m"
            );
            match self.fetch_json(&url).await {
                Ok(body) => {
                    if let Some(ratio) = parse_long_short_entry(&body["data"][0]) {
                        self.long_short_ratios.write().insert(asset, ratio);
                    }
                }
                Err(e) => warn!(asset = %asset, error = %e, "long/short ratio fetch failed"),
            }
        }
    }
}

/// The ratio endpoint returns `[timestamp, ratio]` pairs; some API versions
/// return objects instead.
fn parse_long_short_entry(entry: &serde_json::Value) -> Option<f64> {
    if let Some(arr) = entry.as_array() {
        if arr.len() >= 2 {
            return arr[1].as_str().and_then(|s| s.parse().ok()).or_else(|| arr[1].as_f64());
        }
        return None;
    }
    if entry.is_object() {
        return entry["longShortAccountRatio"]
            .as_str()
            .and_then(|s| s.parse().ok())
            .or_else(|| entry["longShortAccountRatio"].as_f64());
    }
    None
}

/// Periodic update task. Runs until cancelled.
pub async fn run(feed: Arc<DerivativesFeed>) {
    let mut interval = tokio::time::interval(Duration::from_secs(UPDATE_INTERVAL_SECS));
    loop {
        interval.tick().await;
        feed.refresh().await;
    }
}
