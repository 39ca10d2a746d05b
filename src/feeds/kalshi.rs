// =============================================================================
// Contract Market Poller — focus contract per market class, WS + REST fallback
// =============================================================================
//
// Tracks one "focus" contract per market class (short-window BTC, daily BTC,
// short-window ETH, daily ETH). Two transports feed the same view:
//
//   * A real-time ticker subscription filtered by series prefix. Integer-cent
//     prices are converted to fractions at the parse edge.
//   * A 5-second REST poll used whenever the stream has been silent for more
//     than 30 seconds. Daily classes pick, among the soonest-settling open
//     contracts, the one whose mid is nearest 0.50 with spread ≤ 10¢;
//     short-window classes take the first open contract.
//
// Consumers never branch on transport — both paths call `ingest_top`.
// =============================================================================

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::DateTime;
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use serde_json::json;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::feeds::{epoch_secs, Backoff};
use crate::types::{BookTop, MarketClass};

/// REST fallback poll interval.
const REST_POLL_SECS: u64 = 5;
/// Stream silence after which the REST fallback's data is used.
const WS_STALE_SECS: f64 = 30.0;
/// Book-top history retained per class.
const MAX_HISTORY: usize = 200;
/// Daily-class focus selection rejects spreads above 10¢.
const MAX_FOCUS_SPREAD: f64 = 0.10;
/// `time_until_close` when no close time is known.
const UNKNOWN_TIME_TO_CLOSE: f64 = 999.0;

const REST_BASE: &str = "https://api.elections.kalshi.com/trade-api/v2";
const WS_URL: &str = "wss://api.elections.kalshi.com/trade-api/ws/v2";

#[derive(Default)]
struct ClassState {
    focus: Option<BookTop>,
    /// Focus ticker as of the last accepted transition.
    accepted_ticker: Option<String>,
    history: VecDeque<BookTop>,
}

/// Shared market view for all tracked classes.
pub struct MarketPoller {
    client: reqwest::Client,
    states: RwLock<HashMap<MarketClass, ClassState>>,
    last_ws_update: RwLock<Option<f64>>,
}

impl MarketPoller {
    pub fn new(client: reqwest::Client) -> Self {
        let mut states = HashMap::new();
        for class in MarketClass::ALL {
            states.insert(class, ClassState::default());
        }
        Self {
            client,
            states: RwLock::new(states),
            last_ws_update: RwLock::new(None),
        }
    }

    /// Both transports land here, so consumers always see one view.
    pub fn ingest_top(&self, top: BookTop) {
        let Some(class) = MarketClass::from_ticker(&top.ticker) else {
            return;
        };
        if top.yes_bid > 0.0 && top.yes_ask > 0.0 && top.yes_bid > top.yes_ask {
            debug!(ticker = %top.ticker, "dropping crossed book top");
            return;
        }

        let mut states = self.states.write();
        let state = states.entry(class).or_default();
        if state.accepted_ticker.is_none() {
            // First contract seen for the class is accepted outright.
            state.accepted_ticker = Some(top.ticker.clone());
        }
        state.focus = Some(top.clone());
        state.history.push_back(top);
        while state.history.len() > MAX_HISTORY {
            state.history.pop_front();
        }
    }

    pub fn focus(&self, class: MarketClass) -> Option<BookTop> {
        self.states.read().get(&class).and_then(|s| s.focus.clone())
    }

    /// True while the focus ticker differs from the last accepted one — the
    /// poller has rolled to a new settlement event.
    pub fn is_market_transition(&self, class: MarketClass) -> bool {
        let states = self.states.read();
        let Some(state) = states.get(&class) else {
            return false;
        };
        match (&state.focus, &state.accepted_ticker) {
            (Some(focus), Some(accepted)) => focus.ticker != *accepted,
            _ => false,
        }
    }

    /// Accept the current focus ticker after a transition.
    pub fn accept_transition(&self, class: MarketClass) -> Option<String> {
        let mut states = self.states.write();
        let state = states.get_mut(&class)?;
        let ticker = state.focus.as_ref().map(|f| f.ticker.clone())?;
        state.accepted_ticker = Some(ticker.clone());
        Some(ticker)
    }

    /// Seconds until the focus contract settles; a large sentinel when the
    /// close time is unknown.
    pub fn time_until_close(&self, class: MarketClass, now: f64) -> f64 {
        let states = self.states.read();
        let close_str = states
            .get(&class)
            .and_then(|s| s.focus.as_ref())
            .and_then(|f| f.close_time.clone());
        let Some(close_str) = close_str else {
            return UNKNOWN_TIME_TO_CLOSE;
        };
        match DateTime::parse_from_rfc3339(&close_str.replace('Z', "+00:00")) {
            Ok(close) => close.timestamp() as f64 - now,
            Err(_) => UNKNOWN_TIME_TO_CLOSE,
        }
    }

    /// Standard deviation of the last `lookback` focus bids for the class.
    /// Defaults to 0.05 with fewer than 5 samples.
    pub fn book_volatility(&self, class: MarketClass, lookback: usize) -> f64 {
        let states = self.states.read();
        let Some(state) = states.get(&class) else {
            return 0.05;
        };
        let bids: Vec<f64> = state
            .history
            .iter()
            .rev()
            .take(lookback)
            .map(|t| t.yes_bid)
            .collect();
        if bids.len() < 5 {
            return 0.05;
        }
        let mean = bids.iter().sum::<f64>() / bids.len() as f64;
        let variance = bids.iter().map(|b| (b - mean).powi(2)).sum::<f64>() / bids.len() as f64;
        variance.sqrt()
    }

    fn note_ws_update(&self) {
        *self.last_ws_update.write() = Some(epoch_secs());
    }

    /// The stream is healthy when it delivered a message within the stale
    /// window.
    pub fn ws_healthy(&self, now: f64) -> bool {
        self.last_ws_update
            .read()
            .map_or(false, |t| now - t < WS_STALE_SECS)
    }

    /// Current transport label for diagnostics.
    pub fn transport_mode(&self) -> &'static str {
        if self.ws_healthy(epoch_secs()) {
            "WebSocket"
        } else {
            "REST"
        }
    }

    /// One REST pass over every class. Skipped while the stream is healthy so
    /// the fallback never fights the faster transport.
    pub async fn poll_rest_once(&self) {
        if self.ws_healthy(epoch_secs()) {
            return;
        }
        for class in MarketClass::ALL {
            match self.fetch_series(class).await {
                Ok(Some(top)) => self.ingest_top(top),
                Ok(None) => {}
                Err(e) => warn!(class = %class, error = %e, "market poll failed"),
            }
        }
    }

    async fn fetch_series(&self, class: MarketClass) -> Result<Option<BookTop>> {
        let url = format!(
            "{REST_BASE}/markets?limit=10&series_ticker={}&status=open",
            class.series_ticker()
        );
        let body: serde_json::Value = self
            .client
            .get(&url)
            .header("User-Agent", "vega-bot")
            .timeout(Duration::from_secs(3))
            .send()
            .await
            .with_context(|| format!("GET markets for {class}"))?
            .json()
            .await
            .context("failed to parse markets response")?;

        Ok(select_focus(&body, class, epoch_secs()))
    }
}

// ---------------------------------------------------------------------------
// REST parsing / focus selection
// ---------------------------------------------------------------------------

fn market_to_top(m: &serde_json::Value, series: &str, now: f64) -> Option<BookTop> {
    let ticker = m["ticker"].as_str()?.to_string();
    // Venue prices are integer cents in [0, 100].
    let yes_bid = m["yes_bid"].as_f64().unwrap_or(0.0) / 100.0;
    let yes_ask = m["yes_ask"].as_f64().unwrap_or(0.0) / 100.0;
    Some(BookTop {
        ticker,
        yes_bid,
        yes_ask,
        volume: m["volume"].as_f64().unwrap_or(0.0),
        close_time: m["close_time"].as_str().map(str::to_string),
        series: series.to_string(),
        captured_at: now,
    })
}

/// Choose the focus contract from an open-markets listing.
///
/// Daily classes group by settlement time, walk the soonest group first, and
/// pick the contract whose mid is nearest 0.50 with a tolerable spread.
/// Short-window classes take the first open contract.
fn select_focus(body: &serde_json::Value, class: MarketClass, now: f64) -> Option<BookTop> {
    let markets = body["markets"].as_array()?;
    if markets.is_empty() {
        return None;
    }
    let series = class.series_ticker();

    if class.is_short_window() {
        return market_to_top(&markets[0], series, now);
    }

    // Group by close time; ISO strings sort chronologically.
    let mut by_close: HashMap<&str, Vec<&serde_json::Value>> = HashMap::new();
    for m in markets {
        let ct = m["close_time"].as_str().unwrap_or("");
        by_close.entry(ct).or_default().push(m);
    }
    let mut close_times: Vec<&str> = by_close.keys().copied().collect();
    close_times.sort_unstable();

    for ct in close_times {
        let mut best: Option<(f64, BookTop)> = None;
        for m in &by_close[ct] {
            let Some(top) = market_to_top(m, series, now) else {
                continue;
            };
            if top.spread() > MAX_FOCUS_SPREAD {
                continue;
            }
            let distance = (top.mid() - 0.50).abs();
            if best.as_ref().map_or(true, |(d, _)| distance < *d) {
                best = Some((distance, top));
            }
        }
        if let Some((_, top)) = best {
            return Some(top);
        }
    }
    None
}

// ---------------------------------------------------------------------------
// WebSocket transport
// ---------------------------------------------------------------------------

/// Parse one ticker frame from the real-time stream into a book top.
fn parse_ws_ticker(text: &str, now: f64) -> Option<BookTop> {
    let root: serde_json::Value = serde_json::from_str(text).ok()?;
    if root["type"].as_str() != Some("ticker") {
        return None;
    }
    let msg = &root["msg"];
    let ticker = msg["market_ticker"].as_str()?.to_string();
    let class = MarketClass::from_ticker(&ticker)?;
    Some(BookTop {
        yes_bid: msg["yes_bid"].as_f64().unwrap_or(0.0) / 100.0,
        yes_ask: msg["yes_ask"].as_f64().unwrap_or(0.0) / 100.0,
        volume: msg["volume"].as_f64().unwrap_or(0.0),
        close_time: msg["close_time"].as_str().map(str::to_string),
        series: class.series_ticker().to_string(),
        ticker,
        captured_at: now,
    })
}

/// Real-time subscription task. Runs forever; every failure falls back to the
/// REST poll via the staleness rule while this task reconnects.
pub async fn run_ws(poller: Arc<MarketPoller>) {
    let mut backoff = Backoff::new();
    loop {
        if let Err(e) = ws_session(&poller, &mut backoff).await {
            warn!(error = %e, "market stream error — reconnecting");
        }
        backoff.wait().await;
    }
}

async fn ws_session(poller: &MarketPoller, backoff: &mut Backoff) -> Result<()> {
    let (ws, _) = connect_async(WS_URL)
        .await
        .context("failed to connect to market WebSocket")?;
    let (mut write, mut read) = ws.split();

    let tickers: Vec<&str> = MarketClass::ALL.iter().map(|c| c.series_ticker()).collect();
    let subscribe = json!({
        "id": 1,
        "cmd": "subscribe",
        "params": {"channels": ["ticker"], "series_tickers": tickers}
    });
    write
        .send(Message::Text(subscribe.to_string()))
        .await
        .context("failed to send market subscription")?;
    info!("market ticker stream connected");

    while let Some(msg) = read.next().await {
        let msg = msg.context("market WebSocket read error")?;
        if let Message::Text(text) = msg {
            if let Some(top) = parse_ws_ticker(&text, epoch_secs()) {
                poller.note_ws_update();
                poller.ingest_top(top);
                backoff.reset();
            }
        }
    }
    warn!("market stream ended");
    Ok(())
}

/// REST fallback task.
pub async fn run_rest(poller: Arc<MarketPoller>) {
    let mut interval = tokio::time::interval(Duration::from_secs(REST_POLL_SECS));
    loop {
        interval.tick().await;
        poller.poll_rest_once().await;
    }
}
