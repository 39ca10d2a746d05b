// =============================================================================
// Central Application State — Vega Trading Engine
// =============================================================================
//
// The single source of truth for the engine. Feed subsystems manage their own
// interior mutability and are shared via Arc; the paper trader sits behind a
// parking_lot::RwLock and is only written by the main tick loop.
//
// Thread safety:
//   - Arc-wrapped feeds own their own last-value cells.
//   - RwLock for the trader and the signal ring.
//   - AtomicBool for the shutdown flag set from the signal handler.
// =============================================================================

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::config::EngineConfig;
use crate::feeds::cross_venue::CrossVenueFeed;
use crate::feeds::derivatives::DerivativesFeed;
use crate::feeds::exchange::PriceAggregator;
use crate::feeds::kalshi::MarketPoller;
use crate::feeds::orderbook::OrderBookCache;
use crate::paper::{PaperTrader, Position, SessionStats, StrategyStats};
use crate::types::{MarketClass, StrategyTag};

/// Signals retained for the checkpoint's tail.
const MAX_SIGNALS: usize = 100;
/// Closed trades included in a checkpoint.
const CHECKPOINT_TRADE_TAIL: usize = 50;

/// One emitted strategy signal, kept for diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalRecord {
    pub strategy: StrategyTag,
    pub market_class: MarketClass,
    pub elapsed_secs: u64,
    pub detail: String,
}

/// Central engine state shared across all async tasks via `Arc<AppState>`.
pub struct AppState {
    pub config: EngineConfig,

    // ── Feeds (own their interior mutability) ───────────────────────────
    pub prices: Arc<PriceAggregator>,
    pub derivatives: Arc<DerivativesFeed>,
    pub cross_venue: Arc<CrossVenueFeed>,
    pub poller: Arc<MarketPoller>,
    pub depth: Arc<OrderBookCache>,

    // ── Trading state (main loop is the only writer) ────────────────────
    pub trader: RwLock<PaperTrader>,
    pub signals: RwLock<Vec<SignalRecord>>,

    // ── Session lifecycle ───────────────────────────────────────────────
    pub shutdown_requested: AtomicBool,
    /// Epoch seconds when the session started.
    pub started_at: f64,
}

impl AppState {
    pub fn new(config: EngineConfig, started_at: f64) -> Self {
        let client = reqwest::Client::new();
        let trader = PaperTrader::new(config.initial_balance, config.base_trade_size);
        Self {
            config,
            prices: Arc::new(PriceAggregator::new()),
            derivatives: Arc::new(DerivativesFeed::new(client.clone())),
            cross_venue: Arc::new(CrossVenueFeed::new(client.clone())),
            poller: Arc::new(MarketPoller::new(client.clone())),
            depth: Arc::new(OrderBookCache::new(client)),
            trader: RwLock::new(trader),
            signals: RwLock::new(Vec::new()),
            shutdown_requested: AtomicBool::new(false),
            started_at,
        }
    }

    pub fn request_shutdown(&self) {
        self.shutdown_requested.store(true, Ordering::SeqCst);
    }

    pub fn shutdown_requested(&self) -> bool {
        self.shutdown_requested.load(Ordering::SeqCst)
    }

    /// Record an emitted signal; the ring is capped at [`MAX_SIGNALS`].
    pub fn push_signal(&self, record: SignalRecord) {
        let mut signals = self.signals.write();
        signals.push(record);
        while signals.len() > MAX_SIGNALS {
            signals.remove(0);
        }
    }

    /// Build the full serialisable checkpoint of engine state.
    pub fn build_checkpoint(&self, now: f64) -> Checkpoint {
        let trader = self.trader.read();

        let open_positions: Vec<Position> = trader.open_positions().cloned().collect();
        let closed: Vec<Position> = trader.closed_trades().cloned().collect();
        let recent_trades: Vec<Position> = closed
            .iter()
            .rev()
            .take(CHECKPOINT_TRADE_TAIL)
            .rev()
            .cloned()
            .collect();

        Checkpoint {
            saved_at: now,
            started_at: self.started_at,
            elapsed_secs: (now - self.started_at).max(0.0) as u64,
            config: self.config.clone(),
            balance: trader.balance,
            initial_balance: trader.initial_balance,
            realized_pnl: trader.realized_pnl,
            session: trader.session.clone(),
            open_positions,
            recent_trades,
            strategy_stats: StrategyTag::ALL
                .iter()
                .filter_map(|tag| {
                    trader
                        .strategy_stats()
                        .get(tag)
                        .map(|s| (*tag, s.clone()))
                })
                .collect(),
            signals: self.signals.read().clone(),
            transport_mode: self.poller.transport_mode().to_string(),
            venue_status: self.cross_venue.status_string(),
        }
    }
}

/// Full engine state written atomically on the checkpoint interval and at
/// shutdown.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub saved_at: f64,
    pub started_at: f64,
    pub elapsed_secs: u64,
    pub config: EngineConfig,
    pub balance: f64,
    pub initial_balance: f64,
    pub realized_pnl: f64,
    pub session: SessionStats,
    pub open_positions: Vec<Position>,
    pub recent_trades: Vec<Position>,
    pub strategy_stats: std::collections::HashMap<StrategyTag, StrategyStats>,
    pub signals: Vec<SignalRecord>,
    pub transport_mode: String,
    pub venue_status: String,
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EntryIntent, ExitReason, MarketClass, Side, StrategyTag};

    fn state() -> AppState {
        AppState::new(EngineConfig::default(), 1_000.0)
    }

    fn intent() -> EntryIntent {
        EntryIntent {
            ticker: "KXBTC15M-26FEB0217-T95000".to_string(),
            market_class: MarketClass::BtcShort,
            side: Side::Yes,
            limit_price: 0.42,
            strategy: StrategyTag::DelayArb,
            confidence: 1.0,
            mtf_ratio: 1.0,
            flash: None,
        }
    }

    #[test]
    fn signal_ring_is_bounded() {
        let s = state();
        for i in 0..(MAX_SIGNALS + 10) {
            s.push_signal(SignalRecord {
                strategy: StrategyTag::DelayArb,
                market_class: MarketClass::BtcShort,
                elapsed_secs: i as u64,
                detail: String::new(),
            });
        }
        assert_eq!(s.signals.read().len(), MAX_SIGNALS);
        // Oldest entries evicted first.
        assert_eq!(s.signals.read()[0].elapsed_secs, 10);
    }

    #[test]
    fn shutdown_flag() {
        let s = state();
        assert!(!s.shutdown_requested());
        s.request_shutdown();
        assert!(s.shutdown_requested());
    }

    #[test]
    fn checkpoint_roundtrips_and_carries_state() {
        let s = state();
        {
            let mut trader = s.trader.write();
            let id = trader.open(&intent(), None, 1_010.0).unwrap();
            trader.close(&id, 0.47, None, ExitReason::TrailingStop, None, 1_050.0);
            trader.open(&intent(), None, 1_100.0).unwrap();
        }
        s.push_signal(SignalRecord {
            strategy: StrategyTag::DelayArb,
            market_class: MarketClass::BtcShort,
            elapsed_secs: 10,
            detail: "entry".to_string(),
        });

        let cp = s.build_checkpoint(1_200.0);
        assert_eq!(cp.elapsed_secs, 200);
        assert_eq!(cp.open_positions.len(), 1);
        assert_eq!(cp.recent_trades.len(), 1);
        assert_eq!(cp.signals.len(), 1);
        assert_eq!(cp.strategy_stats[&StrategyTag::DelayArb].closed_trades, 1);

        let json = serde_json::to_string(&cp).unwrap();
        let back: Checkpoint = serde_json::from_str(&json).unwrap();
        assert_eq!(back.open_positions.len(), 1);
        assert!((back.balance - cp.balance).abs() < 1e-12);
        assert_eq!(back.session.total, 1);
    }
}
