// =============================================================================
// Order Book Cache — rate-limited on-demand depth for one contract
// =============================================================================
//
// Full depth is only needed by the fill simulator and the imbalance strategy,
// so it is fetched on demand rather than streamed. Two timers govern the
// cache: a snapshot younger than 30 s is served as-is, and no ticker is
// refetched more often than once per 15 s — when that guard bites, whatever
// is cached is returned even if stale.
//
// Depth shape: YES levels are bids for YES ordered price-descending; NO
// levels are the asks for YES ordered price-ascending.
// =============================================================================

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Snapshots younger than this are served without a fetch.
const CACHE_FRESH_SECS: f64 = 30.0;
/// Minimum seconds between fetches per ticker.
const REFETCH_GUARD_SECS: f64 = 15.0;

const REST_BASE: &str = "https://api.elections.kalshi.com/trade-api/v2";

/// One price level: price as a dollar fraction, size in contracts.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DepthLevel {
    pub price: f64,
    pub size: f64,
}

/// Full depth snapshot for one contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DepthSnapshot {
    /// Bids for YES, price descending.
    pub yes_levels: Vec<DepthLevel>,
    /// Asks for YES (the complemented NO book), price ascending.
    pub no_levels: Vec<DepthLevel>,
    pub fetched_at: f64,
}

/// Rate-limited depth cache keyed by ticker.
pub struct OrderBookCache {
    client: reqwest::Client,
    books: RwLock<HashMap<String, DepthSnapshot>>,
    last_fetch: RwLock<HashMap<String, f64>>,
}

impl OrderBookCache {
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            books: RwLock::new(HashMap::new()),
            last_fetch: RwLock::new(HashMap::new()),
        }
    }

    /// Depth for `ticker`, fetching only when the cache is stale and the
    /// refetch guard allows it.
    pub async fn get(&self, ticker: &str, now: f64) -> Option<DepthSnapshot> {
        if let Some(snapshot) = self.books.read().get(ticker) {
            if now - snapshot.fetched_at < CACHE_FRESH_SECS {
                return Some(snapshot.clone());
            }
        }

        let guard_bites = self
            .last_fetch
            .read()
            .get(ticker)
            .map_or(false, |t| now - t < REFETCH_GUARD_SECS);
        if guard_bites {
            // Stale data beats hammering the venue.
            return self.books.read().get(ticker).cloned();
        }

        self.last_fetch.write().insert(ticker.to_string(), now);
        match self.fetch_depth(ticker, now).await {
            Ok(snapshot) => {
                self.books.write().insert(ticker.to_string(), snapshot.clone());
                Some(snapshot)
            }
            Err(e) => {
                debug!(ticker, error = %e, "depth fetch failed");
                self.books.read().get(ticker).cloned()
            }
        }
    }

    /// Imbalance over all YES-side levels:
    /// `(bid_vol − ask_vol) / (bid_vol + ask_vol)`.
    ///
    /// Returns `(score, bid_volume, ask_volume)`, or `None` when no depth is
    /// available or the book is empty.
    pub async fn imbalance(&self, ticker: &str, now: f64) -> Option<(f64, f64, f64)> {
        let snapshot = self.get(ticker, now).await?;
        imbalance_of(&snapshot)
    }

    async fn fetch_depth(&self, ticker: &str, now: f64) -> Result<DepthSnapshot> {
        let url = format!("{REST_BASE}/markets/{ticker}/orderbook");
        let body: serde_json::Value = self
            .client
            .get(&url)
            .header("User-Agent", "vega-bot")
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .with_context(|| format!("GET orderbook for {ticker}"))?
            .json()
            .await
            .context("failed to parse orderbook response")?;

        parse_depth(&body, now).context("orderbook payload missing depth")
    }

    /// Test/replay hook: place a snapshot directly into the cache.
    pub fn insert_snapshot(&self, ticker: &str, snapshot: DepthSnapshot) {
        self.books.write().insert(ticker.to_string(), snapshot);
    }
}

/// Imbalance score over a parsed snapshot.
pub fn imbalance_of(snapshot: &DepthSnapshot) -> Option<(f64, f64, f64)> {
    let bid_vol: f64 = snapshot.yes_levels.iter().map(|l| l.size).sum();
    let ask_vol: f64 = snapshot.no_levels.iter().map(|l| l.size).sum();
    let total = bid_vol + ask_vol;
    if total == 0.0 {
        return None;
    }
    Some(((bid_vol - ask_vol) / total, bid_vol, ask_vol))
}

/// Parse `{orderbook: {yes: [[cents, qty]…], no: [[cents, qty]…]}}`,
/// converting cents to fractions and normalising level order.
///
/// The venue's `no` array holds resting NO bids; a NO bid at price `p` is an
/// offer of YES at `1 − p`, so those levels are complemented into the YES-ask
/// frame here — consumers walk them directly as asks.
pub fn parse_depth(body: &serde_json::Value, now: f64) -> Option<DepthSnapshot> {
    let orderbook = body.get("orderbook")?;

    let parse_side = |side: &serde_json::Value, complement: bool| -> Vec<DepthLevel> {
        side.as_array()
            .map(|levels| {
                levels
                    .iter()
                    .filter_map(|level| {
                        let pair = level.as_array()?;
                        if pair.len() < 2 {
                            return None;
                        }
                        let raw = pair[0].as_f64()? / 100.0;
                        let price = if complement { 1.0 - raw } else { raw };
                        let size = pair[1].as_f64()?;
                        (size > 0.0).then_some(DepthLevel { price, size })
                    })
                    .collect()
            })
            .unwrap_or_default()
    };

    let mut yes_levels = parse_side(&orderbook["yes"], false);
    let mut no_levels = parse_side(&orderbook["no"], true);

    // YES bids best-first (descending), YES asks best-first (ascending).
    yes_levels.sort_by(|a, b| b.price.partial_cmp(&a.price).unwrap_or(std::cmp::Ordering::Equal));
    no_levels.sort_by(|a, b| a.price.partial_cmp(&b.price).unwrap_or(std::cmp::Ordering::Equal));

    if yes_levels.is_empty() && no_levels.is_empty() {
        return None;
    }

    Some(DepthSnapshot {
        yes_levels,
        no_levels,
        fetched_at: now,
    })
}
