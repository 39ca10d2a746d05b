// =============================================================================
// Vega Event Engine — Main Entry Point
// =============================================================================
//
// Paper-trades Kalshi BTC/ETH event contracts against live market data. Every
// execution is simulated against a real order-book snapshot; no orders are
// ever placed.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod app_state;
mod config;
mod detectors;
mod feeds;
mod fill;
mod indicators;
mod paper;
mod persistence;
mod risk;
mod strategy;
mod types;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info, warn};

use crate::app_state::{AppState, SignalRecord};
use crate::config::{Cli, EngineConfig};
use crate::detectors::{BurstStatus, FlashCrashDetector, SteamDetector, TickBurstDetector};
use crate::feeds::epoch_secs;
use crate::paper::Position;
use crate::persistence::{build_summary, init_logging, JournalEntry, Persistence};
use crate::strategy::{StrategyContext, StrategyEngine, TransitionAction, TransitionTracker};
use crate::types::{parse_strike, Asset, BookTop, MarketClass, StrategyTag};

/// Status line cadence, seconds.
const STATUS_INTERVAL_SECS: f64 = 60.0;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();
    let cli = Cli::parse();
    let config = EngineConfig::from_cli(&cli);

    let session_ts = chrono::Local::now().format("%Y%m%d_%H%M%S").to_string();
    let _log_guards = init_logging(&config.log_dir, &session_ts)?;

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        Vega Event Engine — Starting Up                  ║");
    info!("╚══════════════════════════════════════════════════════════╝");
    info!(
        duration_min = config.duration_min,
        balance = config.initial_balance,
        "paper session configured"
    );

    let persistence = Persistence::new(config.data_dir.clone())?;
    let started_at = epoch_secs();
    let state = Arc::new(AppState::new(config, started_at));

    // ── 2. Signal handlers ───────────────────────────────────────────────
    spawn_signal_handler(state.clone());

    // ── 3. Bootstrap historical candles ──────────────────────────────────
    let bootstrap_client = reqwest::Client::new();
    state.prices.bootstrap_indicators(&bootstrap_client).await;

    // ── 4. Spawn data feed tasks ─────────────────────────────────────────
    let mut feed_tasks = Vec::new();
    feed_tasks.push(tokio::spawn(feeds::exchange::run_coinbase(state.prices.clone())));
    feed_tasks.push(tokio::spawn(feeds::exchange::run_kraken(state.prices.clone())));
    feed_tasks.push(tokio::spawn(feeds::exchange::run_bitstamp(state.prices.clone())));
    feed_tasks.push(tokio::spawn(feeds::exchange::run_binance_us(state.prices.clone())));
    feed_tasks.push(tokio::spawn(feeds::derivatives::run(state.derivatives.clone())));
    feed_tasks.push(tokio::spawn(feeds::cross_venue::run(state.cross_venue.clone())));
    feed_tasks.push(tokio::spawn(feeds::kalshi::run_ws(state.poller.clone())));
    feed_tasks.push(tokio::spawn(feeds::kalshi::run_rest(state.poller.clone())));
    info!(count = feed_tasks.len(), "data feed tasks launched");

    // ── 5. Checkpoint task ───────────────────────────────────────────────
    let checkpoint_state = state.clone();
    let checkpoint_persistence = Persistence::new(checkpoint_state.config.data_dir.clone())?;
    let checkpoint_task = tokio::spawn(async move {
        let interval_secs = checkpoint_state.config.checkpoint_interval_secs;
        let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));
        interval.tick().await; // the immediate first tick
        loop {
            interval.tick().await;
            let checkpoint = checkpoint_state.build_checkpoint(epoch_secs());
            if let Err(e) = checkpoint_persistence.write_checkpoint(&checkpoint) {
                error!(error = %e, "periodic checkpoint failed");
            }
        }
    });

    // ── 6. Main 1 Hz tick loop ───────────────────────────────────────────
    let result = run_tick_loop(&state, &persistence).await;

    // ── 7. Graceful teardown: cancel tasks, final checkpoint, summary ────
    checkpoint_task.abort();
    for task in &feed_tasks {
        task.abort();
    }
    for task in feed_tasks {
        let _ = task.await;
    }

    let now = epoch_secs();
    let final_checkpoint = state.build_checkpoint(now);
    if let Err(e) = persistence.write_checkpoint(&final_checkpoint) {
        error!(error = %e, "final checkpoint failed");
    }

    let flash_signals = final_checkpoint
        .signals
        .iter()
        .filter(|s| s.strategy == StrategyTag::FlashSniper)
        .count();
    let summary = {
        let trader = state.trader.read();
        build_summary(
            &trader,
            (now - started_at) as u64,
            flash_signals,
            state.poller.transport_mode(),
        )
    };
    info!(
        trades = summary.trades,
        pnl = summary.realized_pnl,
        win_rate = summary.win_rate,
        "session complete"
    );
    for (tag, breakdown) in &summary.by_strategy {
        info!(
            strategy = %tag,
            trades = breakdown.trades,
            wins = breakdown.wins,
            pnl = breakdown.pnl,
            "strategy breakdown"
        );
    }
    if let Err(e) = persistence.write_results(&summary, &session_ts) {
        error!(error = %e, "failed to write session results");
    }

    info!("Vega Event Engine shut down complete.");
    result
}

fn spawn_signal_handler(state: Arc<AppState>) {
    tokio::spawn(async move {
        let mut sigterm =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(s) => s,
                Err(e) => {
                    error!(error = %e, "failed to install SIGTERM handler");
                    return;
                }
            };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                warn!("SIGINT received — requesting graceful shutdown");
            }
            _ = sigterm.recv() => {
                warn!("SIGTERM received — requesting graceful shutdown");
            }
        }
        state.request_shutdown();
    });
}

// ---------------------------------------------------------------------------
// Tick loop
// ---------------------------------------------------------------------------

/// Detector and cycle state owned exclusively by the tick loop. Nothing here
/// is shared with the feed tasks.
struct TickLoop {
    strategy_engine: StrategyEngine,
    transitions: TransitionTracker,
    tick_bursts: HashMap<Asset, TickBurstDetector>,
    steam: SteamDetector,
    flash: FlashCrashDetector,
    /// Focus bid per class as of the previous tick (delay-arb input).
    last_bids: HashMap<MarketClass, f64>,
}

impl TickLoop {
    fn new() -> Self {
        let mut tick_bursts = HashMap::new();
        tick_bursts.insert(Asset::Btc, TickBurstDetector::new());
        tick_bursts.insert(Asset::Eth, TickBurstDetector::new());
        Self {
            strategy_engine: StrategyEngine::new(),
            transitions: TransitionTracker::new(),
            tick_bursts,
            steam: SteamDetector::new(),
            flash: FlashCrashDetector::new(),
            last_bids: HashMap::new(),
        }
    }
}

async fn run_tick_loop(state: &Arc<AppState>, persistence: &Persistence) -> anyhow::Result<()> {
    let mut tick_loop = TickLoop::new();
    let mut interval = tokio::time::interval(Duration::from_secs(1));
    let end_time = state.started_at + state.config.duration_min as f64 * 60.0;
    let mut last_status = state.started_at;

    info!("tick loop starting");

    loop {
        interval.tick().await;
        let now = epoch_secs();
        if now >= end_time {
            info!("session duration reached");
            break;
        }
        if state.shutdown_requested() {
            info!("shutdown requested — finishing current tick");
            break;
        }

        // Per-asset burst detectors run once per tick.
        let mut bursts: HashMap<Asset, BurstStatus> = HashMap::new();
        for asset in [Asset::Btc, Asset::Eth] {
            if let Some(price) = state.prices.latest(asset) {
                if let Some(detector) = tick_loop.tick_bursts.get_mut(&asset) {
                    bursts.insert(asset, detector.update(price));
                }
            }
        }

        for class in MarketClass::ALL {
            if let Err(e) =
                process_class(state, persistence, &mut tick_loop, class, &bursts, now).await
            {
                // One class failing must not take the session down: log,
                // checkpoint, keep ticking.
                error!(class = %class, error = %e, "class processing error");
                let checkpoint = state.build_checkpoint(now);
                if let Err(e) = persistence.write_checkpoint(&checkpoint) {
                    error!(error = %e, "error checkpoint failed");
                }
            }
        }

        manage_positions(state, persistence, now).await;

        if now - last_status >= STATUS_INTERVAL_SECS {
            log_status(state, now);
            last_status = now;
        }
    }

    Ok(())
}

/// Run the transition state machine, detectors, and strategy catalog for one
/// market class.
async fn process_class(
    state: &Arc<AppState>,
    persistence: &Persistence,
    tick_loop: &mut TickLoop,
    class: MarketClass,
    bursts: &HashMap<Asset, BurstStatus>,
    now: f64,
) -> anyhow::Result<()> {
    let Some(book) = state.poller.focus(class) else {
        return Ok(());
    };
    let asset = class.asset();
    let underlying = state.prices.latest(asset);
    let elapsed = (now - state.started_at) as u64;

    // ── Market transition handling ───────────────────────────────────────
    let in_transition = state.poller.is_market_transition(class);
    if in_transition {
        // Positions on the outgoing ticker settle at fair value the moment
        // the roll is seen — no zombie positions.
        settle_outgoing_positions(state, persistence, class, &book, now);
    }
    let poller = state.poller.clone();
    let action =
        tick_loop
            .transitions
            .advance(class, in_transition, now, || poller.accept_transition(class));

    match &action {
        TransitionAction::Pending => {
            tick_loop.last_bids.remove(&class);
            return Ok(());
        }
        TransitionAction::Accepted { new_ticker } => {
            tick_loop.steam.clear();
            info!(class = %class, ticker = %new_ticker, "transition complete — quiet period begins");
            tick_loop.last_bids.remove(&class);
            return Ok(());
        }
        TransitionAction::QuietPeriod | TransitionAction::Clear => {}
    }

    // ── Detector updates (book-event detectors on short windows only) ────
    let is_short = class.is_short_window();
    let mut flash_event = None;
    if is_short {
        tick_loop.flash.update_bid(class, book.yes_bid, now);
        tick_loop
            .steam
            .update(&book.ticker, book.yes_bid, book.volume, now);
        flash_event = tick_loop.flash.detect(class, book.yes_bid, now);
    }

    if action == TransitionAction::QuietPeriod {
        tick_loop.last_bids.insert(class, book.yes_bid);
        return Ok(());
    }

    // ── Feature snapshot ─────────────────────────────────────────────────
    let time_until_close = state.poller.time_until_close(class, now);
    let indicators = state.prices.indicator_snapshot(asset);
    let (has_position, has_flash_position) = {
        let trader = state.trader.read();
        (
            !trader.open_positions_on(class).is_empty(),
            trader.has_open(class, StrategyTag::FlashSniper),
        )
    };

    // Cross-venue divergence, daily classes with time to spare.
    let divergence = if !is_short && time_until_close > 3600.0 {
        book.strike()
            .and_then(|strike| state.cross_venue.detect_divergence(asset, book.yes_bid, strike))
    } else {
        None
    };

    // On-demand depth imbalance, only when the class could actually trade.
    let depth_imbalance = if !has_position {
        state.depth.imbalance(&book.ticker, now).await
    } else {
        None
    };

    let pre_crash_price = flash_event.as_ref().map(|event| {
        tick_loop
            .flash
            .pre_crash_price(class, book.yes_bid, event.drop_pct, now)
    });

    let intent = {
        let trader = state.trader.read();
        let ctx = StrategyContext {
            config: &state.config,
            class,
            book: &book,
            last_bid: tick_loop.last_bids.get(&class).copied(),
            underlying,
            momentum_5s: state.prices.momentum(asset, 5.0, now),
            momentum_1m: state.prices.momentum(asset, 60.0, now),
            momentum_5m: state.prices.momentum(asset, 300.0, now),
            momentum_15m: state.prices.momentum(asset, 900.0, now),
            indicators: &indicators,
            time_until_close,
            engine_age_secs: now - state.started_at,
            long_short_ratio: state.derivatives.long_short_ratio(asset),
            burst: bursts.get(&asset).copied().unwrap_or(BurstStatus {
                direction: None,
                length: 0,
                total_move_pct: 0.0,
            }),
            steam: tick_loop.steam.detect(&book.ticker, now),
            flash: flash_event.as_ref(),
            pre_crash_price,
            cluster: state.prices.cluster_signal(asset, 10.0, now),
            divergence: divergence.as_ref(),
            depth_imbalance,
            has_position_on_class: has_position,
            has_flash_position_on_class: has_flash_position,
            secs_since_class_exit: trader.secs_since_class_exit(class, now),
            class_loss_streak: trader.loss_streak(class),
            secs_since_any_exit: trader.secs_since_any_exit(now),
            now,
        };
        tick_loop.strategy_engine.evaluate(&ctx)
    };

    if let Some(intent) = intent {
        let depth = state.depth.get(&intent.ticker, now).await;
        let opened = state.trader.write().open(&intent, depth.as_ref(), now);
        if opened.is_some() {
            state.push_signal(SignalRecord {
                strategy: intent.strategy,
                market_class: class,
                elapsed_secs: elapsed,
                detail: format!("{}@{:.2}", intent.side, intent.limit_price),
            });
        }
    }

    tick_loop.last_bids.insert(class, book.yes_bid);
    Ok(())
}

/// Settle positions still open on a ticker the poller has rolled away from.
/// Fair value comes from the cross-venue feed when it quotes a matching
/// strike, else the current book mid.
fn settle_outgoing_positions(
    state: &Arc<AppState>,
    persistence: &Persistence,
    class: MarketClass,
    new_book: &BookTop,
    now: f64,
) {
    let stale: Vec<Position> = state
        .trader
        .read()
        .open_positions_on(class)
        .into_iter()
        .filter(|p| p.ticker != new_book.ticker)
        .cloned()
        .collect();
    if stale.is_empty() {
        return;
    }

    let fair_value = stale
        .first()
        .and_then(|p| parse_strike(&p.ticker))
        .and_then(|strike| {
            state
                .cross_venue
                .nearest_strike(class.asset(), strike)
                .map(|(price, _)| price)
        })
        .unwrap_or_else(|| new_book.mid());

    info!(
        class = %class,
        fair_value,
        count = stale.len(),
        "settling positions from outgoing contract"
    );
    let settled = state.trader.write().settle_class(class, fair_value, now);
    for (id, pnl) in settled {
        info!(id = %id, pnl, "position settled at fair value");
        journal_close(state, persistence, &id);
    }
}

/// Per-tick management of every open position: favorable-price tracking,
/// trailing/hard stops, timeouts, flash exits.
async fn manage_positions(state: &Arc<AppState>, persistence: &Persistence, now: f64) {
    for class in MarketClass::ALL {
        let Some(book) = state.poller.focus(class) else {
            continue;
        };
        let asset = class.asset();
        let underlying = state.prices.latest(asset);
        let atr = state.prices.indicator_snapshot(asset).atr;
        let recent_vol = state.prices.volatility(asset, 300.0, now);
        let vol_regime = state.config.vol_regime_atr;

        let stop_fn = move |pos: &Position| {
            risk::adaptive_stop_dollar(atr, recent_vol, pos.strategy, pos.market_class, vol_regime)
        };

        let exits = state
            .trader
            .write()
            .manage_tick(class, &book, underlying, &stop_fn, now);

        for exit in exits {
            let depth = state.depth.get(&book.ticker, now).await;
            // The current bid stands in for the settlement price in CLV terms.
            let settlement_estimate = book.yes_bid;
            let pnl = state.trader.write().close(
                &exit.position_id,
                exit.exit_price,
                depth.as_ref(),
                exit.reason,
                Some(settlement_estimate),
                now,
            );
            if pnl.is_some() {
                journal_close(state, persistence, &exit.position_id);
            }
        }
    }
}

/// Append a freshly closed position to the trade journal.
fn journal_close(state: &Arc<AppState>, persistence: &Persistence, position_id: &str) {
    let trader = state.trader.read();
    let Some(pos) = trader.position(position_id) else {
        return;
    };
    let Some(entry) = JournalEntry::from_closed(pos, trader.realized_pnl) else {
        return;
    };
    if let Err(e) = persistence.append_trade(&entry) {
        error!(error = %e, "failed to journal trade");
    }
}

/// Periodic one-glance status block.
fn log_status(state: &Arc<AppState>, now: f64) {
    let trader = state.trader.read();
    let btc = state.prices.latest(Asset::Btc);
    let eth = state.prices.latest(Asset::Eth);
    let btc_momentum = state.prices.momentum(Asset::Btc, 60.0, now);
    let indicators = state.prices.indicator_snapshot(Asset::Btc);

    let win_rate = if trader.session.total > 0 {
        trader.session.wins as f64 / trader.session.total as f64
    } else {
        0.0
    };

    info!(
        btc = ?btc,
        btc_exchanges = state.prices.live_exchange_count(Asset::Btc),
        eth = ?eth,
        eth_exchanges = state.prices.live_exchange_count(Asset::Eth),
        momentum_1m = ?btc_momentum,
        transport = state.poller.transport_mode(),
        "market status"
    );
    info!(
        balance = trader.balance,
        pnl = trader.realized_pnl,
        trades = trader.session.total,
        win_rate,
        open = trader.open_positions().count(),
        "session status"
    );
    info!(
        atr = ?indicators.atr,
        rsi = ?indicators.rsi,
        ema_trend = %indicators.ema_trend,
        funding = ?state.derivatives.funding_rate(Asset::Btc),
        open_interest = ?state.derivatives.open_interest(Asset::Btc),
        ls_ratio = ?state.derivatives.long_short_ratio(Asset::Btc),
        book_vol = state.poller.book_volatility(MarketClass::BtcShort, 20),
        venue = %state.cross_venue.status_string(),
        "signal status"
    );
}
