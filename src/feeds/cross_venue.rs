// =============================================================================
// Cross-Venue Price Feed — competing prediction-market prices as a lead signal
// =============================================================================
//
// The secondary venue carries far more BTC/ETH daily volume than our contract
// venue, so its prices move first. We discover the day's highest-volume
// "asset above ___" event per asset once at startup, then poll that event's
// strike sub-markets every 30 seconds and keep a short snapshot history.
//
// The divergence detector fires when the venue price moved recently AND our
// book has not caught up — both thresholds must agree in sign.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{info, warn};

use crate::feeds::epoch_secs;
use crate::types::{Asset, Side};

/// Seconds between price polls.
const UPDATE_INTERVAL_SECS: u64 = 30;
/// Snapshot history retained per asset.
const MAX_HISTORY: usize = 200;
/// Minimum venue price movement between snapshots (2¢).
const MIN_VENUE_MOMENTUM: f64 = 0.02;
/// Minimum venue-vs-book price gap (3¢).
const MIN_DIVERGENCE: f64 = 0.03;
/// Gap at which confidence saturates (10¢).
const FULL_CONFIDENCE_GAP: f64 = 0.10;
/// Reject matches whose strikes differ by more than 5%.
const MAX_STRIKE_MISMATCH: f64 = 0.05;

/// Quote for one strike sub-market on the secondary venue.
#[derive(Debug, Clone, Serialize)]
pub struct StrikeQuote {
    pub strike: f64,
    pub yes_price: f64,
    pub volume_24h: f64,
    pub liquidity: f64,
    pub captured_at: f64,
}

/// One poll's worth of strike prices.
#[derive(Debug, Clone)]
struct Snapshot {
    time: f64,
    prices: Vec<(f64, f64)>, // (strike, yes_price)
}

/// A cross-venue divergence worth trading.
#[derive(Debug, Clone, Serialize)]
pub struct DivergenceSignal {
    pub side: Side,
    pub venue_price: f64,
    pub venue_strike: f64,
    pub our_price: f64,
    pub our_strike: f64,
    /// venue_price − our_price.
    pub divergence: f64,
    /// Venue price change since the previous snapshot.
    pub venue_momentum: f64,
    pub confidence: f64,
}

#[derive(Default)]
struct AssetVenueState {
    event_slug: Option<String>,
    quotes: Vec<StrikeQuote>,
    history: std::collections::VecDeque<Snapshot>,
}

/// Polls the secondary venue and answers divergence queries from cached state.
pub struct CrossVenueFeed {
    client: reqwest::Client,
    states: RwLock<HashMap<Asset, AssetVenueState>>,
    discovery_done: RwLock<bool>,
}

impl CrossVenueFeed {
    pub fn new(client: reqwest::Client) -> Self {
        let mut states = HashMap::new();
        states.insert(Asset::Btc, AssetVenueState::default());
        states.insert(Asset::Eth, AssetVenueState::default());
        Self {
            client,
            states: RwLock::new(states),
            discovery_done: RwLock::new(false),
        }
    }

    async fn fetch_json(&self, url: &str) -> Result<serde_json::Value> {
        self.client
            .get(url)
            .header("User-Agent", "vega-bot")
            .timeout(Duration::from_secs(8))
            .send()
            .await
            .with_context(|| format!("GET {url}"))?
            .json()
            .await
            .context("failed to parse venue response")
    }

    /// Scan the open-events list and pick the highest-volume daily event per
    /// asset. Runs once; a later successful pass is a no-op.
    pub async fn discover_events(&self) {
        if *self.discovery_done.read() {
            return;
        }

        let body = match self
            .fetch_json(
                "https://gamma-api.polymarket.com/events?closed=false&limit=200&order=volume24hr&ascending=false",
            )
            .await
        {
            Ok(b) => b,
            Err(e) => {
                warn!(error = %e, "venue event discovery failed");
                return;
            }
        };

        let Some(events) = body.as_array() else {
            warn!("venue event list is not an array");
            return;
        };

        // (title pattern, 24h volume floor) per asset.
        let rules = [
            (Asset::Btc, "bitcoin above", 50_000.0),
            (Asset::Eth, "ethereum above", 10_000.0),
        ];

        for (asset, pattern, floor) in rules {
            let mut best: Option<(f64, String, String)> = None;
            for event in events {
                let title = event["title"].as_str().unwrap_or_default().to_lowercase();
                let slug = event["slug"].as_str().unwrap_or_default();
                let vol = event["volume24hr"].as_f64().unwrap_or(0.0);
                if title.contains(pattern) && vol > floor && !slug.is_empty() {
                    if best.as_ref().map_or(true, |(v, _, _)| vol > *v) {
                        best = Some((vol, slug.to_string(), title));
                    }
                }
            }
            match best {
                Some((vol, slug, title)) => {
                    info!(asset = %asset, slug = %slug, volume_24h = vol, title = %title, "venue event selected");
                    if let Some(state) = self.states.write().get_mut(&asset) {
                        state.event_slug = Some(slug);
                    }
                }
                None => warn!(asset = %asset, "no matching venue event found"),
            }
        }

        *self.discovery_done.write() = true;
    }

    /// Fetch the selected event's strike sub-markets for both assets.
    pub async fn poll_prices(&self) {
        let slugs: Vec<(Asset, String)> = {
            let states = self.states.read();
            states
                .iter()
                .filter_map(|(a, s)| s.event_slug.clone().map(|slug| (*a, slug)))
                .collect()
        };

        for (asset, slug) in slugs {
            let url =
                format!("https://gamma-api.polymarket.com/events?slug={slug}&_include=markets");
            let body = match self.fetch_json(&url).await {
                Ok(b) => b,
                Err(e) => {
                    warn!(asset = %asset, error = %e, "venue price poll failed");
                    continue;
                }
            };

            let markets = match body[0]["markets"].as_array() {
                Some(m) => m,
                None => continue,
            };

            let now = epoch_secs();
            let mut quotes = Vec::new();
            for m in markets {
                let Some(strike) = parse_strike_title(&m["groupItemTitle"]) else {
                    continue;
                };
                let Some(yes_price) = parse_outcome_yes_price(&m["outcomePrices"]) else {
                    continue;
                };
                quotes.push(StrikeQuote {
                    strike,
                    yes_price,
                    volume_24h: m["volume24hr"].as_f64().unwrap_or(0.0),
                    liquidity: m["liquidityNum"].as_f64().unwrap_or(0.0),
                    captured_at: now,
                });
            }

            if !quotes.is_empty() {
                self.ingest_quotes(asset, quotes, now);
            }
        }
    }

    /// Store one poll's quotes and append a history snapshot.
    fn ingest_quotes(&self, asset: Asset, quotes: Vec<StrikeQuote>, now: f64) {
        let mut states = self.states.write();
        let Some(state) = states.get_mut(&asset) else {
            return;
        };
        let snapshot = Snapshot {
            time: now,
            prices: quotes.iter().map(|q| (q.strike, q.yes_price)).collect(),
        };
        state.quotes = quotes;
        state.history.push_back(snapshot);
        while state.history.len() > MAX_HISTORY {
            state.history.pop_front();
        }
    }

    /// Venue YES price for the strike nearest `target_strike`.
    pub fn nearest_strike(&self, asset: Asset, target_strike: f64) -> Option<(f64, f64)> {
        let states = self.states.read();
        let state = states.get(&asset)?;
        let quote = state.quotes.iter().min_by(|a, b| {
            let da = (a.strike - target_strike).abs();
            let db = (b.strike - target_strike).abs();
            da.partial_cmp(&db).unwrap_or(std::cmp::Ordering::Equal)
        })?;
        Some((quote.yes_price, quote.strike))
    }

    /// Detect a venue-leads-book divergence for one contract.
    ///
    /// Fires `Yes` when the venue moved up ≥ 2¢ since the previous snapshot
    /// and sits ≥ 3¢ above our bid; `No` symmetrically. Rejects strikes more
    /// than 5% away from the contract's strike.
    pub fn detect_divergence(
        &self,
        asset: Asset,
        kalshi_yes_bid: f64,
        kalshi_strike: f64,
    ) -> Option<DivergenceSignal> {
        if kalshi_strike <= 0.0 {
            return None;
        }
        let (venue_price, venue_strike) = self.nearest_strike(asset, kalshi_strike)?;
        if (venue_strike - kalshi_strike).abs() / kalshi_strike > MAX_STRIKE_MISMATCH {
            return None;
        }

        let divergence = venue_price - kalshi_yes_bid;

        let venue_momentum = {
            let states = self.states.read();
            let state = states.get(&asset)?;
            let n = state.history.len();
            if n < 2 {
                0.0
            } else {
                let prev = &state.history[n - 2];
                let curr = &state.history[n - 1];
                let prev_price = lookup_strike(&prev.prices, venue_strike);
                let curr_price = lookup_strike(&curr.prices, venue_strike);
                match (prev_price, curr_price) {
                    (Some(p), Some(c)) => c - p,
                    _ => 0.0,
                }
            }
        };

        if venue_momentum.abs() < MIN_VENUE_MOMENTUM || divergence.abs() < MIN_DIVERGENCE {
            return None;
        }

        let side = if venue_momentum > 0.0 && divergence > 0.0 {
            Side::Yes
        } else if venue_momentum < 0.0 && divergence < 0.0 {
            Side::No
        } else {
            return None;
        };

        Some(DivergenceSignal {
            side,
            venue_price,
            venue_strike,
            our_price: kalshi_yes_bid,
            our_strike: kalshi_strike,
            divergence,
            venue_momentum,
            confidence: (divergence.abs() / FULL_CONFIDENCE_GAP).min(1.0),
        })
    }

    /// Volume-weighted sentiment across strikes: > 0 bullish, < 0 bearish.
    ///
    /// Strikes priced outside (0.05, 0.95) are ignored — they carry no
    /// information beyond "already decided".
    pub fn sentiment(&self, asset: Asset) -> Option<f64> {
        let states = self.states.read();
        let state = states.get(&asset)?;

        let mut weighted_sum = 0.0;
        let mut total_weight = 0.0;
        for q in &state.quotes {
            if q.volume_24h > 0.0 && q.yes_price > 0.05 && q.yes_price < 0.95 {
                weighted_sum += q.yes_price * q.volume_24h;
                total_weight += q.volume_24h;
            }
        }
        if total_weight == 0.0 {
            return None;
        }
        Some(weighted_sum / total_weight - 0.5)
    }

    /// One-line status for the periodic log.
    pub fn status_string(&self) -> String {
        let strike_counts: Vec<(Asset, usize)> = {
            let states = self.states.read();
            [Asset::Btc, Asset::Eth]
                .iter()
                .map(|a| (*a, states.get(a).map_or(0, |s| s.quotes.len())))
                .collect()
        };

        let mut parts = Vec::new();
        for (asset, strikes) in strike_counts {
            parts.push(format!("{asset}={strikes}strikes"));
            if let Some(sent) = self.sentiment(asset) {
                parts.push(format!("sent={sent:+.2}"));
            }
        }
        format!("venue: {}", parts.join(" "))
    }
}

fn lookup_strike(prices: &[(f64, f64)], strike: f64) -> Option<f64> {
    prices
        .iter()
        .find(|(s, _)| (s - strike).abs() < 1e-9)
        .map(|(_, p)| *p)
}

/// Strike titles are plain numbers with thousands separators ("95,000").
fn parse_strike_title(title: &serde_json::Value) -> Option<f64> {
    let s = title.as_str()?.replace(',', "");
    s.parse::<f64>().ok().filter(|v| *v > 0.0)
}

/// `outcomePrices` is a JSON string of a two-element array: `"[\"0.57\",\"0.43\"]"`.
fn parse_outcome_yes_price(prices: &serde_json::Value) -> Option<f64> {
    let parsed: serde_json::Value = match prices {
        serde_json::Value::String(s) => serde_json::from_str(s).ok()?,
        other => other.clone(),
    };
    let first = parsed.as_array()?.first()?;
    first
        .as_str()
        .and_then(|s| s.parse().ok())
        .or_else(|| first.as_f64())
}

/// Periodic update task: discover once, then poll every 30 s.
pub async fn run(feed: Arc<CrossVenueFeed>) {
    feed.discover_events().await;
    let mut interval = tokio::time::interval(Duration::from_secs(UPDATE_INTERVAL_SECS));
    loop {
        interval.tick().await;
        if !*feed.discovery_done.read() {
            feed.discover_events().await;
        }
        feed.poll_prices().await;
    }
}
