// =============================================================================
// Price Aggregator — weighted consensus across exchange WebSocket streams
// =============================================================================
//
// One task per exchange holds a ticker subscription and pushes BTC/ETH trades
// into the shared aggregator. Every tick recomputes the weighted consensus
// over the exchanges that are currently live (a missing exchange is simply
// absent from the sum) and appends one sample to a bounded ring.
//
// Consensus ticks drive the per-asset indicator engines once those have been
// bootstrapped from historical candles.
//
// A stream failure must not degrade the others: each task reconnects on its
// own capped exponential backoff.
// =============================================================================

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use serde_json::json;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::feeds::{epoch_secs, Backoff};
use crate::indicators::{IndicatorEngine, IndicatorSnapshot};
use crate::types::Asset;

/// Consensus samples retained per asset.
const MAX_SAMPLES: usize = 500;
/// Weight applied to exchanges not in the static table.
const DEFAULT_WEIGHT: f64 = 0.1;
/// Per-exchange move that counts toward a cluster, as a fraction (0.05%).
const CLUSTER_MOVE_THRESHOLD: f64 = 0.0005;

/// One consensus sample: the weighted price plus the per-exchange prices that
/// produced it.
#[derive(Debug, Clone)]
pub struct PriceSample {
    pub time: f64,
    pub price: f64,
    pub exchange_prices: HashMap<String, f64>,
}

/// Direction of a cross-exchange momentum cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterDirection {
    Up,
    Down,
}

#[derive(Debug, Default)]
struct AssetState {
    prices: HashMap<String, f64>,
    weighted: Option<f64>,
    history: VecDeque<PriceSample>,
}

/// Thread-safe consensus price feed for both assets.
pub struct PriceAggregator {
    btc: RwLock<AssetState>,
    eth: RwLock<AssetState>,
    btc_indicators: RwLock<IndicatorEngine>,
    eth_indicators: RwLock<IndicatorEngine>,
}

fn exchange_weight(exchange: &str) -> f64 {
    match exchange {
        "coinbase" => 0.35,
        "kraken" => 0.25,
        "bitstamp" => 0.20,
        "binance_us" => 0.20,
        _ => DEFAULT_WEIGHT,
    }
}

impl PriceAggregator {
    pub fn new() -> Self {
        Self {
            btc: RwLock::new(AssetState::default()),
            eth: RwLock::new(AssetState::default()),
            btc_indicators: RwLock::new(IndicatorEngine::new()),
            eth_indicators: RwLock::new(IndicatorEngine::new()),
        }
    }

    fn state(&self, asset: Asset) -> &RwLock<AssetState> {
        match asset {
            Asset::Btc => &self.btc,
            Asset::Eth => &self.eth,
        }
    }

    fn indicators(&self, asset: Asset) -> &RwLock<IndicatorEngine> {
        match asset {
            Asset::Btc => &self.btc_indicators,
            Asset::Eth => &self.eth_indicators,
        }
    }

    /// Record a tick from one exchange and recompute the consensus.
    pub fn update(&self, asset: Asset, exchange: &str, price: f64, now: f64) {
        if !(price.is_finite() && price > 0.0) {
            return;
        }

        let weighted = {
            let mut state = self.state(asset).write();
            state.prices.insert(exchange.to_string(), price);

            let mut weight_sum = 0.0;
            let mut weighted_sum = 0.0;
            for (ex, p) in &state.prices {
                let w = exchange_weight(ex);
                weighted_sum += p * w;
                weight_sum += w;
            }
            let weighted = if weight_sum > 0.0 {
                Some(weighted_sum / weight_sum)
            } else {
                None
            };
            state.weighted = weighted;

            if let Some(w) = weighted {
                let sample = PriceSample {
                    time: now,
                    price: w,
                    exchange_prices: state.prices.clone(),
                };
                state.history.push_back(sample);
                while state.history.len() > MAX_SAMPLES {
                    state.history.pop_front();
                }
            }
            weighted
        };

        if let Some(w) = weighted {
            let mut ind = self.indicators(asset).write();
            if ind.is_bootstrapped() {
                ind.add_price(w, 0.0, now);
            }
        }
    }

    /// Latest weighted consensus price.
    pub fn latest(&self, asset: Asset) -> Option<f64> {
        self.state(asset).read().weighted
    }

    /// Number of exchanges currently contributing to the consensus.
    pub fn live_exchange_count(&self, asset: Asset) -> usize {
        self.state(asset).read().prices.len()
    }

    /// Percent change of the consensus over `lookback_secs`
    /// (+0.25 means +0.25%).
    pub fn momentum(&self, asset: Asset, lookback_secs: f64, now: f64) -> Option<f64> {
        let state = self.state(asset).read();
        if state.history.len() < 2 {
            return None;
        }
        let cutoff = now - lookback_secs;
        let old = state
            .history
            .iter()
            .find(|s| s.time >= cutoff)
            .map(|s| s.price)?;
        let latest = state.weighted?;
        if old <= 0.0 {
            return None;
        }
        Some((latest - old) / old * 100.0)
    }

    /// Standard deviation over mean of consensus samples in the window.
    /// Defaults to 0.01 when fewer than 10 samples exist.
    pub fn volatility(&self, asset: Asset, lookback_secs: f64, now: f64) -> f64 {
        let state = self.state(asset).read();
        if state.history.len() < 10 {
            return 0.01;
        }
        let cutoff = now - lookback_secs;
        let prices: Vec<f64> = state
            .history
            .iter()
            .filter(|s| s.time >= cutoff)
            .map(|s| s.price)
            .collect();
        if prices.len() < 10 {
            return 0.01;
        }
        let mean = prices.iter().sum::<f64>() / prices.len() as f64;
        if mean <= 0.0 {
            return 0.01;
        }
        let variance = prices.iter().map(|p| (p - mean).powi(2)).sum::<f64>() / prices.len() as f64;
        variance.sqrt() / mean
    }

    /// Cross-exchange momentum clustering over the window.
    ///
    /// Returns `(direction, avg_move_fraction, agreeing_count)` when at least
    /// three exchanges moved more than 0.05% the same way, else `None`.
    pub fn cluster_signal(
        &self,
        asset: Asset,
        lookback_secs: f64,
        now: f64,
    ) -> Option<(ClusterDirection, f64, usize)> {
        let state = self.state(asset).read();
        if state.history.len() < 2 {
            return None;
        }
        let cutoff = now - lookback_secs;

        // Last known per-exchange price before the window opened.
        let mut old_prices: HashMap<String, f64> = HashMap::new();
        for sample in &state.history {
            if sample.time >= cutoff {
                break;
            }
            for (ex, p) in &sample.exchange_prices {
                old_prices.insert(ex.clone(), *p);
            }
        }

        let mut changes: HashMap<&str, f64> = HashMap::new();
        for (ex, current) in &state.prices {
            if let Some(old) = old_prices.get(ex) {
                if *old > 0.0 {
                    changes.insert(ex.as_str(), (current - old) / old);
                }
            }
        }

        if changes.len() < 3 {
            return None;
        }

        let up: Vec<f64> = changes
            .values()
            .copied()
            .filter(|c| *c > CLUSTER_MOVE_THRESHOLD)
            .collect();
        let down: Vec<f64> = changes
            .values()
            .copied()
            .filter(|c| *c < -CLUSTER_MOVE_THRESHOLD)
            .collect();

        if up.len() >= 3 {
            let avg = up.iter().sum::<f64>() / up.len() as f64;
            Some((ClusterDirection::Up, avg, up.len()))
        } else if down.len() >= 3 {
            let avg = down.iter().map(|c| c.abs()).sum::<f64>() / down.len() as f64;
            Some((ClusterDirection::Down, avg, down.len()))
        } else {
            None
        }
    }

    /// Current indicator snapshot for the asset.
    pub fn indicator_snapshot(&self, asset: Asset) -> IndicatorSnapshot {
        self.indicators(asset).read().snapshot()
    }

    /// Fetch ~300 historical 1-minute candles per asset and seed the
    /// indicator engines. A failed fetch leaves that asset un-bootstrapped;
    /// its indicators stay absent until enough live candles accumulate.
    pub async fn bootstrap_indicators(&self, client: &reqwest::Client) {
        for (asset, product) in [(Asset::Btc, "BTC-USD"), (Asset::Eth, "ETH-USD")] {
            match fetch_historical_candles(client, product).await {
                Ok(rows) => {
                    self.indicators(asset).write().bootstrap(&rows);
                    info!(asset = %asset, candles = rows.len(), "historical candles loaded");
                }
                Err(e) => {
                    warn!(asset = %asset, error = %e, "historical candle bootstrap failed");
                }
            }
        }
    }
}

impl Default for PriceAggregator {
    fn default() -> Self {
        Self::new()
    }
}

/// Fetch 1-minute candles, newest first, in the exchange's
/// `[ts, low, high, open, close, volume]` array format.
async fn fetch_historical_candles(
    client: &reqwest::Client,
    product_id: &str,
) -> Result<Vec<[f64; 6]>> {
    let url = format!(
        "https://api.exchange.coinbase.com/products/{product_id}/candles?granularity=60"
    );
    let body: serde_json::Value = client
        .get(&url)
        .header("User-Agent", "vega-bot")
        .timeout(std::time::Duration::from_secs(5))
        .send()
        .await
        .with_context(|| format!("GET historical candles for {product_id}"))?
        .json()
        .await
        .context("failed to parse historical candle response")?;

    let rows = body
        .as_array()
        .context("historical candle response is not an array")?;

    let mut out = Vec::with_capacity(rows.len().min(300));
    for row in rows.iter().take(300) {
        let vals = match row.as_array() {
            Some(v) if v.len() >= 6 => v,
            _ => continue,
        };
        let mut candle = [0.0f64; 6];
        let mut ok = true;
        for (i, slot) in candle.iter_mut().enumerate() {
            match vals[i].as_f64() {
                Some(f) => *slot = f,
                None => {
                    ok = false;
                    break;
                }
            }
        }
        if ok {
            out.push(candle);
        }
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// Exchange stream tasks
// ---------------------------------------------------------------------------

/// Coinbase ticker stream for BTC-USD and ETH-USD. Runs forever, reconnecting
/// with backoff.
pub async fn run_coinbase(agg: Arc<PriceAggregator>) {
    let mut backoff = Backoff::new();
    loop {
        if let Err(e) = coinbase_session(&agg, &mut backoff).await {
            warn!(error = %e, "Coinbase stream error — reconnecting");
        }
        backoff.wait().await;
    }
}

async fn coinbase_session(agg: &PriceAggregator, backoff: &mut Backoff) -> Result<()> {
    let (ws, _) = connect_async("wss://ws-feed.exchange.coinbase.com")
        .await
        .context("failed to connect to Coinbase WebSocket")?;
    let (mut write, mut read) = ws.split();

    let subscribe = json!({
        "type": "subscribe",
        "channels": [{"name": "ticker", "product_ids": ["BTC-USD", "ETH-USD"]}]
    });
    write
        .send(Message::Text(subscribe.to_string()))
        .await
        .context("failed to send Coinbase subscription")?;
    info!("Coinbase ticker stream connected");

    while let Some(msg) = read.next().await {
        let msg = msg.context("Coinbase WebSocket read error")?;
        if let Message::Text(text) = msg {
            let d: serde_json::Value = match serde_json::from_str(&text) {
                Ok(v) => v,
                Err(_) => continue, // drop unparseable message
            };
            if d["type"].as_str() != Some("ticker") {
                continue;
            }
            let price: Option<f64> = d["price"].as_str().and_then(|s| s.parse().ok());
            if let Some(price) = price {
                match d["product_id"].as_str() {
                    Some("BTC-USD") => {
                        agg.update(Asset::Btc, "coinbase", price, epoch_secs());
                        backoff.reset();
                    }
                    Some("ETH-USD") => {
                        agg.update(Asset::Eth, "coinbase", price, epoch_secs());
                        backoff.reset();
                    }
                    _ => {}
                }
            }
        }
    }
    warn!("Coinbase stream ended");
    Ok(())
}

/// Kraken ticker stream for XBT/USD and ETH/USD.
pub async fn run_kraken(agg: Arc<PriceAggregator>) {
    let mut backoff = Backoff::new();
    loop {
        if let Err(e) = kraken_session(&agg, &mut backoff).await {
            warn!(error = %e, "Kraken stream error — reconnecting");
        }
        backoff.wait().await;
    }
}

async fn kraken_session(agg: &PriceAggregator, backoff: &mut Backoff) -> Result<()> {
    let (ws, _) = connect_async("wss://ws.kraken.com")
        .await
        .context("failed to connect to Kraken WebSocket")?;
    let (mut write, mut read) = ws.split();

    let subscribe = json!({
        "event": "subscribe",
        "pair": ["XBT/USD", "ETH/USD"],
        "subscription": {"name": "ticker"}
    });
    write
        .send(Message::Text(subscribe.to_string()))
        .await
        .context("failed to send Kraken subscription")?;
    info!("Kraken ticker stream connected");

    while let Some(msg) = read.next().await {
        let msg = msg.context("Kraken WebSocket read error")?;
        if let Message::Text(text) = msg {
            let d: serde_json::Value = match serde_json::from_str(&text) {
                Ok(v) => v,
                Err(_) => continue,
            };
            // Ticker frames are arrays: [channel_id, {"c": [last, ...]}, "ticker", pair]
            let arr = match d.as_array() {
                Some(a) if a.len() >= 4 => a,
                _ => continue,
            };
            let price: Option<f64> = arr[1]["c"][0].as_str().and_then(|s| s.parse().ok());
            let Some(price) = price else { continue };
            match arr[3].as_str() {
                Some("XBT/USD") => {
                    agg.update(Asset::Btc, "kraken", price, epoch_secs());
                    backoff.reset();
                }
                Some("ETH/USD") => {
                    agg.update(Asset::Eth, "kraken", price, epoch_secs());
                    backoff.reset();
                }
                _ => {}
            }
        }
    }
    warn!("Kraken stream ended");
    Ok(())
}

/// Bitstamp live-trades stream for BTC/USD.
pub async fn run_bitstamp(agg: Arc<PriceAggregator>) {
    let mut backoff = Backoff::new();
    loop {
        if let Err(e) = bitstamp_session(&agg, &mut backoff).await {
            warn!(error = %e, "Bitstamp stream error — reconnecting");
        }
        backoff.wait().await;
    }
}

async fn bitstamp_session(agg: &PriceAggregator, backoff: &mut Backoff) -> Result<()> {
    let (ws, _) = connect_async("wss://ws.bitstamp.net")
        .await
        .context("failed to connect to Bitstamp WebSocket")?;
    let (mut write, mut read) = ws.split();

    let subscribe = json!({
        "event": "bts:subscribe",
        "data": {"channel": "live_trades_btcusd"}
    });
    write
        .send(Message::Text(subscribe.to_string()))
        .await
        .context("failed to send Bitstamp subscription")?;
    info!("Bitstamp trade stream connected");

    while let Some(msg) = read.next().await {
        let msg = msg.context("Bitstamp WebSocket read error")?;
        if let Message::Text(text) = msg {
            let d: serde_json::Value = match serde_json::from_str(&text) {
                Ok(v) => v,
                Err(_) => continue,
            };
            if d["event"].as_str() != Some("trade") {
                continue;
            }
            if let Some(price) = d["data"]["price"].as_f64() {
                agg.update(Asset::Btc, "bitstamp", price, epoch_secs());
                backoff.reset();
            }
        }
    }
    warn!("Bitstamp stream ended");
    Ok(())
}

/// Binance.US 24h ticker stream for BTCUSDT.
pub async fn run_binance_us(agg: Arc<PriceAggregator>) {
    let mut backoff = Backoff::new();
    loop {
        if let Err(e) = binance_us_session(&agg, &mut backoff).await {
            warn!(error = %e, "Binance.US stream error — reconnecting");
        }
        backoff.wait().await;
    }
}

async fn binance_us_session(agg: &PriceAggregator, backoff: &mut Backoff) -> Result<()> {
    let (ws, _) = connect_async("wss://stream.binance.us:9443/ws/btcusdt@ticker")
        .await
        .context("failed to connect to Binance.US WebSocket")?;
    let (_write, mut read) = ws.split();
    info!("Binance.US ticker stream connected");

    while let Some(msg) = read.next().await {
        let msg = msg.context("Binance.US WebSocket read error")?;
        if let Message::Text(text) = msg {
            let d: serde_json::Value = match serde_json::from_str(&text) {
                Ok(v) => v,
                Err(_) => continue,
            };
            let price: Option<f64> = d["c"].as_str().and_then(|s| s.parse().ok());
            if let Some(price) = price {
                debug!(price, "binance_us tick");
                agg.update(Asset::Btc, "binance_us", price, epoch_secs());
                backoff.reset();
            }
        }
    }
    warn!("Binance.US stream ended");
    Ok(())
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn weighted_consensus_uses_live_exchanges_only() {
        let agg = PriceAggregator::new();
        agg.update(Asset::Btc, "coinbase", 100_000.0, 1.0);
        // Only one exchange live: consensus equals its price.
        assert!((agg.latest(Asset::Btc).unwrap() - 100_000.0).abs() < 1e-9);

        agg.update(Asset::Btc, "kraken", 100_200.0, 2.0);
        // (0.35*100000 + 0.25*100200) / 0.60
        let expected = (0.35 * 100_000.0 + 0.25 * 100_200.0) / 0.60;
        assert!((agg.latest(Asset::Btc).unwrap() - expected).abs() < 1e-9);
        assert_eq!(agg.live_exchange_count(Asset::Btc), 2);
    }

    #[test]
    fn unknown_exchange_gets_default_weight() {
        let agg = PriceAggregator::new();
        agg.update(Asset::Btc, "coinbase", 100.0, 1.0);
        agg.update(Asset::Btc, "gemini", 200.0, 2.0);
        let expected = (0.35 * 100.0 + 0.1 * 200.0) / 0.45;
        assert!((agg.latest(Asset::Btc).unwrap() - expected).abs() < 1e-9);
    }

    #[test]
    fn non_finite_or_zero_prices_are_dropped() {
        let agg = PriceAggregator::new();
        agg.update(Asset::Btc, "coinbase", f64::NAN, 1.0);
        agg.update(Asset::Btc, "coinbase", 0.0, 2.0);
        agg.update(Asset::Btc, "coinbase", -5.0, 3.0);
        assert!(agg.latest(Asset::Btc).is_none());
    }

    #[test]
    fn momentum_over_lookback_window() {
        let agg = PriceAggregator::new();
        agg.update(Asset::Btc, "coinbase", 100_000.0, 100.0);
        agg.update(Asset::Btc, "coinbase", 100_250.0, 160.0);
        // Look back 60 s from t=160: oldest sample at/after t=100 is 100000.
        let m = agg.momentum(Asset::Btc, 60.0, 160.0).unwrap();
        assert!((m - 0.25).abs() < 1e-9, "expected +0.25%, got {m}");
    }

    #[test]
    fn momentum_none_with_single_sample() {
        let agg = PriceAggregator::new();
        agg.update(Asset::Btc, "coinbase", 100_000.0, 100.0);
        assert!(agg.momentum(Asset::Btc, 60.0, 100.0).is_none());
    }

    #[test]
    fn volatility_defaults_below_ten_samples() {
        let agg = PriceAggregator::new();
        for i in 0..5 {
            agg.update(Asset::Btc, "coinbase", 100.0 + i as f64, i as f64);
        }
        assert!((agg.volatility(Asset::Btc, 300.0, 5.0) - 0.01).abs() < 1e-12);
    }

    #[test]
    fn volatility_zero_for_constant_prices() {
        let agg = PriceAggregator::new();
        for i in 0..20 {
            agg.update(Asset::Btc, "coinbase", 100.0, i as f64);
        }
        let vol = agg.volatility(Asset::Btc, 300.0, 20.0);
        assert!(vol.abs() < 1e-12);
    }

    #[test]
    fn cluster_requires_three_agreeing_exchanges() {
        let agg = PriceAggregator::new();
        // Establish old prices at t=0 for four exchanges.
        for ex in ["coinbase", "kraken", "bitstamp", "binance_us"] {
            agg.update(Asset::Btc, ex, 100_000.0, 0.0);
        }
        // Move three of them up 0.1% well after the cutoff.
        for ex in ["coinbase", "kraken", "bitstamp"] {
            agg.update(Asset::Btc, ex, 100_100.0, 20.0);
        }

        let (dir, avg, n) = agg.cluster_signal(Asset::Btc, 10.0, 25.0).unwrap();
        assert_eq!(dir, ClusterDirection::Up);
        assert_eq!(n, 3);
        assert!(avg > 0.0005);
    }

    #[test]
    fn cluster_none_when_mixed_directions() {
        let agg = PriceAggregator::new();
        for ex in ["coinbase", "kraken", "bitstamp", "binance_us"] {
            agg.update(Asset::Btc, ex, 100_000.0, 0.0);
        }
        agg.update(Asset::Btc, "coinbase", 100_100.0, 20.0);
        agg.update(Asset::Btc, "kraken", 99_900.0, 20.0);
        agg.update(Asset::Btc, "bitstamp", 100_100.0, 20.0);
        agg.update(Asset::Btc, "binance_us", 99_900.0, 20.0);

        assert!(agg.cluster_signal(Asset::Btc, 10.0, 25.0).is_none());
    }

    #[test]
    fn assets_are_independent() {
        let agg = PriceAggregator::new();
        agg.update(Asset::Btc, "coinbase", 100_000.0, 1.0);
        assert!(agg.latest(Asset::Eth).is_none());
        agg.update(Asset::Eth, "coinbase", 3_200.0, 1.0);
        assert!((agg.latest(Asset::Eth).unwrap() - 3_200.0).abs() < 1e-9);
    }
}
