// =============================================================================
// Strategy Engine — priority-ordered catalog evaluated per class per tick
// =============================================================================
//
// Each strategy implements one method: look at the snapshot, produce an entry
// intent or stay quiet. The engine walks the catalog in priority order and
// the first raw signal wins the tick; the winning candidate then has to clear
// the risk gate, the tradeable-price band, and multi-timeframe confirmation
// before it reaches the paper trader.
//
// Two deliberate asymmetries:
//   * the flash sniper is evaluated first and may fire even when a non-flash
//     position already exists on the class;
//   * a blocked candidate ends the tick for the class — it does not fall
//     through to lower-priority strategies.
//
// Market transitions are handled before any of this: a new focus ticker is
// accepted after 5 s, steam history is flushed, and a 120 s price-discovery
// quiet period suppresses entries on the class.
// =============================================================================

use std::collections::HashMap;

use tracing::{debug, info};

use crate::config::EngineConfig;
use crate::detectors::{BurstDirection, BurstStatus, FlashCrashEvent, SteamStatus};
use crate::feeds::cross_venue::DivergenceSignal;
use crate::feeds::exchange::ClusterDirection;
use crate::indicators::IndicatorSnapshot;
use crate::risk::{check_entry, mtf_confirmation, BlockReason, EntryCheck};
use crate::types::{BookTop, EntryIntent, FlashMeta, MarketClass, Side, StrategyTag};

/// New focus ticker accepted after this long.
const TRANSITION_ACCEPT_SECS: f64 = 5.0;
/// Price-discovery quiet period after a transition, no entries.
const TRANSITION_QUIET_SECS: f64 = 120.0;

/// Seconds before settlement where the rush strategy takes over the class.
const SETTLEMENT_WINDOW_SHORT_SECS: f64 = 300.0;
const SETTLEMENT_WINDOW_DAILY_SECS: f64 = 3600.0;

/// Candidate entry prices must sit in this band (flash and settlement rush
/// carry their own bands).
const ENTRY_BAND_LOW: f64 = 0.15;
const ENTRY_BAND_HIGH: f64 = 0.85;

/// Flash sniper tunables.
const FLASH_COOLDOWN_SECS: f64 = 60.0;
const FLASH_MAX_UNDERLYING_MOVE_PCT: f64 = 0.3;
const FLASH_MIN_ASK: f64 = 0.10;
const FLASH_MAX_ASK: f64 = 0.90;
const FLASH_RECOVERY_FRACTION: f64 = 0.80;
const FLASH_RSI_HIGH: f64 = 80.0;
const FLASH_RSI_LOW: f64 = 20.0;

/// Cross-venue lead only trades daily classes with this much time left.
const CROSS_VENUE_MIN_TIME_SECS: f64 = 3600.0;

/// Settlement rush: implied-probability conviction threshold and spread cap.
const RUSH_MIN_PROB: f64 = 0.6;
const RUSH_MAX_SPREAD: f64 = 0.05;

/// Steam trend filter dead zone, percent.
const STEAM_TREND_DEAD_ZONE_PCT: f64 = 0.05;

/// Tick-burst follow thresholds.
const BURST_MIN_LENGTH: usize = 4;
const BURST_MIN_TOTAL_PCT: f64 = 0.10;

/// Cluster follow thresholds.
const CLUSTER_MIN_EXCHANGES: usize = 3;
const CLUSTER_MIN_STRENGTH: f64 = 0.0008;

/// Order-book imbalance thresholds.
const IMBALANCE_MIN_DEPTH: f64 = 100.0;
const IMBALANCE_THRESHOLD: f64 = 0.3;

/// Delay arbitrage: underlying must have moved, contract must not have.
const DELAY_ARB_MIN_MOMENTUM_PCT: f64 = 0.20;
const DELAY_ARB_MAX_CONTRACT_CHG_PCT: f64 = 5.0;

// ---------------------------------------------------------------------------
// Context
// ---------------------------------------------------------------------------

/// Read-only snapshot handed to every strategy for one (class, tick) pair.
/// Built once per class by the main loop so all strategies see the same data.
pub struct StrategyContext<'a> {
    pub config: &'a EngineConfig,
    pub class: MarketClass,
    pub book: &'a BookTop,
    /// Focus bid from the previous tick of this class.
    pub last_bid: Option<f64>,
    pub underlying: Option<f64>,
    pub momentum_5s: Option<f64>,
    pub momentum_1m: Option<f64>,
    pub momentum_5m: Option<f64>,
    pub momentum_15m: Option<f64>,
    pub indicators: &'a IndicatorSnapshot,
    pub time_until_close: f64,
    pub engine_age_secs: f64,
    pub long_short_ratio: Option<f64>,
    pub burst: BurstStatus,
    pub steam: SteamStatus,
    /// Crash event fired this tick, short-window classes only.
    pub flash: Option<&'a FlashCrashEvent>,
    /// Pre-crash bid estimate from the detector when a crash fired.
    pub pre_crash_price: Option<f64>,
    pub cluster: Option<(ClusterDirection, f64, usize)>,
    pub divergence: Option<&'a DivergenceSignal>,
    /// (score, bid_volume, ask_volume) from the depth cache.
    pub depth_imbalance: Option<(f64, f64, f64)>,
    pub has_position_on_class: bool,
    pub has_flash_position_on_class: bool,
    pub secs_since_class_exit: Option<f64>,
    pub class_loss_streak: u32,
    pub secs_since_any_exit: Option<f64>,
    pub now: f64,
}

impl StrategyContext<'_> {
    fn settlement_window(&self) -> f64 {
        if self.class.is_short_window() {
            SETTLEMENT_WINDOW_SHORT_SECS
        } else {
            SETTLEMENT_WINDOW_DAILY_SECS
        }
    }

    fn entry_price(&self, side: Side) -> f64 {
        match side {
            Side::Yes => self.book.yes_ask,
            Side::No => 1.0 - self.book.yes_bid,
        }
    }

    /// Would the delay-arb signal fire on this snapshot?
    fn delay_arb_would_trigger(&self) -> bool {
        let (Some(last_bid), Some(momentum)) = (self.last_bid, self.momentum_1m) else {
            return false;
        };
        if last_bid <= 0.01 {
            return false;
        }
        let contract_chg_pct = (self.book.yes_bid - last_bid) / last_bid * 100.0;
        momentum.abs() > DELAY_ARB_MIN_MOMENTUM_PCT
            && contract_chg_pct.abs() < DELAY_ARB_MAX_CONTRACT_CHG_PCT
    }
}

// ---------------------------------------------------------------------------
// Strategy trait and catalog
// ---------------------------------------------------------------------------

/// One strategy: inspect the snapshot, produce an intent or stay quiet.
pub trait Strategy: Send {
    fn tag(&self) -> StrategyTag;
    fn evaluate(&mut self, ctx: &StrategyContext<'_>) -> Option<EntryIntent>;
}

fn intent(ctx: &StrategyContext<'_>, strategy: StrategyTag, side: Side) -> EntryIntent {
    EntryIntent {
        ticker: ctx.book.ticker.clone(),
        market_class: ctx.class,
        side,
        limit_price: ctx.entry_price(side),
        strategy,
        confidence: 1.0,
        mtf_ratio: 1.0,
        flash: None,
    }
}

// ---- Flash sniper ---------------------------------------------------------

/// Buys crashes that the underlying does not confirm: the drop is a book
/// event, not a price move, and should recover.
struct FlashSniper {
    last_fire: HashMap<MarketClass, f64>,
}

impl Strategy for FlashSniper {
    fn tag(&self) -> StrategyTag {
        StrategyTag::FlashSniper
    }

    fn evaluate(&mut self, ctx: &StrategyContext<'_>) -> Option<EntryIntent> {
        let crash = ctx.flash?;

        if ctx.has_flash_position_on_class {
            debug!(class = %ctx.class, "flash crash ignored: position already on");
            return None;
        }
        if let Some(last) = self.last_fire.get(&ctx.class) {
            if ctx.now - last < FLASH_COOLDOWN_SECS {
                return None;
            }
        }

        // The crash must be a liquidity event: underlying flat over 5 s.
        let underlying = ctx.underlying?;
        if let Some(momentum) = ctx.momentum_5s {
            if momentum.abs() > FLASH_MAX_UNDERLYING_MOVE_PCT {
                info!(class = %ctx.class, momentum, "flash crash skipped: underlying moved");
                return None;
            }
        }

        if let Some(atr) = ctx.indicators.atr {
            if atr >= ctx.config.vol_regime_atr {
                return None;
            }
        }
        if let Some(rsi) = ctx.indicators.rsi {
            if rsi >= FLASH_RSI_HIGH || rsi <= FLASH_RSI_LOW {
                return None;
            }
        }

        let entry = ctx.book.yes_ask;
        if !(FLASH_MIN_ASK..=FLASH_MAX_ASK).contains(&entry) {
            return None;
        }

        let pre_crash = ctx
            .pre_crash_price
            .unwrap_or(ctx.book.yes_bid + crash.drop_pct * ctx.book.yes_bid);
        let recovery_target = entry + FLASH_RECOVERY_FRACTION * (pre_crash - entry);

        self.last_fire.insert(ctx.class, ctx.now);
        info!(
            class = %ctx.class,
            pre_crash,
            crashed = ctx.book.yes_bid,
            drop_pct = crash.drop_pct,
            entry,
            target = recovery_target,
            "flash sniper firing"
        );

        let mut out = intent(ctx, StrategyTag::FlashSniper, Side::Yes);
        out.flash = Some(FlashMeta {
            pre_crash_price: pre_crash,
            crash_price: ctx.book.yes_bid,
            recovery_target,
            underlying_at_entry: underlying,
            drop_pct: crash.drop_pct,
        });
        Some(out)
    }
}

// ---- Cross-venue lead -----------------------------------------------------

/// The secondary venue moves first; trade our book's lag on daily classes.
struct CrossVenueLead;

impl Strategy for CrossVenueLead {
    fn tag(&self) -> StrategyTag {
        StrategyTag::CrossVenueLead
    }

    fn evaluate(&mut self, ctx: &StrategyContext<'_>) -> Option<EntryIntent> {
        if ctx.class.is_short_window() || ctx.time_until_close <= CROSS_VENUE_MIN_TIME_SECS {
            return None;
        }
        let signal = ctx.divergence?;
        let mut out = intent(ctx, StrategyTag::CrossVenueLead, signal.side);
        out.confidence = signal.confidence;
        Some(out)
    }
}

// ---- Settlement rush ------------------------------------------------------

/// In the final stretch the underlying's distance from the strike implies the
/// outcome; buy conviction when the book still prices doubt.
struct SettlementRush;

impl Strategy for SettlementRush {
    fn tag(&self) -> StrategyTag {
        StrategyTag::SettlementRush
    }

    fn evaluate(&mut self, ctx: &StrategyContext<'_>) -> Option<EntryIntent> {
        if ctx.time_until_close > ctx.settlement_window() {
            return None;
        }
        let underlying = ctx.underlying?;
        let strike = ctx.book.strike()?;
        if strike <= 0.0 || ctx.book.spread() >= RUSH_MAX_SPREAD {
            return None;
        }

        // Rough implied probability from the distance to the strike.
        let implied = (0.5 + 0.5 * ((underlying - strike) / strike) / 0.02).clamp(0.1, 0.9);

        if underlying > strike && implied > RUSH_MIN_PROB {
            info!(
                class = %ctx.class,
                underlying,
                strike,
                implied,
                t_minus = ctx.time_until_close,
                "settlement rush YES"
            );
            Some(intent(ctx, StrategyTag::SettlementRush, Side::Yes))
        } else if underlying < strike && (1.0 - implied) > RUSH_MIN_PROB {
            info!(
                class = %ctx.class,
                underlying,
                strike,
                implied,
                t_minus = ctx.time_until_close,
                "settlement rush NO"
            );
            Some(intent(ctx, StrategyTag::SettlementRush, Side::No))
        } else {
            None
        }
    }
}

// ---- Steam follow ---------------------------------------------------------

/// Follow informed money moving the book, but never against the underlying
/// trend.
struct SteamFollow;

impl Strategy for SteamFollow {
    fn tag(&self) -> StrategyTag {
        StrategyTag::SteamFollow
    }

    fn evaluate(&mut self, ctx: &StrategyContext<'_>) -> Option<EntryIntent> {
        if ctx.time_until_close <= ctx.settlement_window() {
            return None;
        }
        if !ctx.steam.detected {
            return None;
        }
        let side = match ctx.steam.direction? {
            d if d > 0 => Side::Yes,
            _ => Side::No,
        };

        // Trend filter: require agreement with 5-minute momentum outside the
        // dead zone; reject flat and counter-trend.
        if let Some(trend) = ctx.momentum_5m {
            if trend.abs() < STEAM_TREND_DEAD_ZONE_PCT {
                debug!(class = %ctx.class, trend, "steam skipped: flat trend");
                return None;
            }
            if trend > STEAM_TREND_DEAD_ZONE_PCT && side == Side::No {
                return None;
            }
            if trend < -STEAM_TREND_DEAD_ZONE_PCT && side == Side::Yes {
                return None;
            }
        }

        Some(intent(ctx, StrategyTag::SteamFollow, side))
    }
}

// ---- Tick-burst follow ----------------------------------------------------

struct TickBurstFollow;

impl Strategy for TickBurstFollow {
    fn tag(&self) -> StrategyTag {
        StrategyTag::TickBurst
    }

    fn evaluate(&mut self, ctx: &StrategyContext<'_>) -> Option<EntryIntent> {
        if ctx.time_until_close <= ctx.settlement_window() {
            return None;
        }
        let direction = ctx.burst.direction?;
        if ctx.burst.length < BURST_MIN_LENGTH || ctx.burst.total_move_pct <= BURST_MIN_TOTAL_PCT {
            return None;
        }
        let side = match direction {
            BurstDirection::Up => Side::Yes,
            BurstDirection::Down => Side::No,
        };
        Some(intent(ctx, StrategyTag::TickBurst, side))
    }
}

// ---- Cross-exchange cluster follow ----------------------------------------

struct ClusterFollow;

impl Strategy for ClusterFollow {
    fn tag(&self) -> StrategyTag {
        StrategyTag::MomentumCluster
    }

    fn evaluate(&mut self, ctx: &StrategyContext<'_>) -> Option<EntryIntent> {
        if ctx.time_until_close <= ctx.settlement_window() {
            return None;
        }
        let (direction, strength, agreeing) = ctx.cluster?;
        if agreeing < CLUSTER_MIN_EXCHANGES || strength <= CLUSTER_MIN_STRENGTH {
            return None;
        }
        // Delay-arb covers the same move; don't double up.
        if ctx.delay_arb_would_trigger() {
            debug!(class = %ctx.class, "cluster skipped: delay arb covers this move");
            return None;
        }
        let side = match direction {
            ClusterDirection::Up => Side::Yes,
            ClusterDirection::Down => Side::No,
        };
        Some(intent(ctx, StrategyTag::MomentumCluster, side))
    }
}

// ---- Order-book imbalance -------------------------------------------------

struct OrderbookImbalance;

impl Strategy for OrderbookImbalance {
    fn tag(&self) -> StrategyTag {
        StrategyTag::OrderbookImbalance
    }

    fn evaluate(&mut self, ctx: &StrategyContext<'_>) -> Option<EntryIntent> {
        if ctx.time_until_close <= ctx.settlement_window() {
            return None;
        }
        let (score, bid_vol, ask_vol) = ctx.depth_imbalance?;
        if bid_vol + ask_vol <= IMBALANCE_MIN_DEPTH {
            return None;
        }
        if score > IMBALANCE_THRESHOLD {
            Some(intent(ctx, StrategyTag::OrderbookImbalance, Side::Yes))
        } else if score < -IMBALANCE_THRESHOLD {
            Some(intent(ctx, StrategyTag::OrderbookImbalance, Side::No))
        } else {
            None
        }
    }
}

// ---- Delay arbitrage ------------------------------------------------------

/// The original edge: the underlying moved and the contract hasn't caught up.
struct DelayArb;

impl Strategy for DelayArb {
    fn tag(&self) -> StrategyTag {
        StrategyTag::DelayArb
    }

    fn evaluate(&mut self, ctx: &StrategyContext<'_>) -> Option<EntryIntent> {
        if !ctx.delay_arb_would_trigger() {
            return None;
        }
        let momentum = ctx.momentum_1m?;
        let side = if momentum > 0.0 { Side::Yes } else { Side::No };
        Some(intent(ctx, StrategyTag::DelayArb, side))
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Strategies that must clear multi-timeframe confirmation.
fn needs_mtf(tag: StrategyTag) -> bool {
    matches!(
        tag,
        StrategyTag::CrossVenueLead
            | StrategyTag::SteamFollow
            | StrategyTag::TickBurst
            | StrategyTag::MomentumCluster
            | StrategyTag::DelayArb
    )
}

/// Strategies whose entry price must sit in the standard tradeable band.
fn needs_entry_band(tag: StrategyTag) -> bool {
    !matches!(
        tag,
        StrategyTag::FlashSniper | StrategyTag::SettlementRush | StrategyTag::OrderbookImbalance
    )
}

/// Priority-ordered strategy catalog.
pub struct StrategyEngine {
    strategies: Vec<Box<dyn Strategy>>,
}

impl StrategyEngine {
    pub fn new() -> Self {
        Self {
            strategies: vec![
                Box::new(FlashSniper {
                    last_fire: HashMap::new(),
                }),
                Box::new(CrossVenueLead),
                Box::new(SettlementRush),
                Box::new(SteamFollow),
                Box::new(TickBurstFollow),
                Box::new(ClusterFollow),
                Box::new(OrderbookImbalance),
                Box::new(DelayArb),
            ],
        }
    }

    /// Evaluate the catalog for one class. Returns the approved intent, or
    /// `None` with the blocking reason logged.
    pub fn evaluate(&mut self, ctx: &StrategyContext<'_>) -> Option<EntryIntent> {
        let mut candidate: Option<EntryIntent> = None;

        for strategy in &mut self.strategies {
            // Only the flash sniper may add to a class that already has a
            // position.
            if ctx.has_position_on_class && strategy.tag() != StrategyTag::FlashSniper {
                continue;
            }
            if let Some(c) = strategy.evaluate(ctx) {
                candidate = Some(c);
                break;
            }
        }

        let mut candidate = candidate?;

        // Risk gate.
        let gate = EntryCheck {
            config: ctx.config,
            class: ctx.class,
            strategy: candidate.strategy,
            side: candidate.side,
            book: ctx.book,
            indicators: ctx.indicators,
            engine_age_secs: ctx.engine_age_secs,
            time_until_close: ctx.time_until_close,
            long_short_ratio: ctx.long_short_ratio,
            secs_since_class_exit: ctx.secs_since_class_exit,
            class_loss_streak: ctx.class_loss_streak,
            secs_since_any_exit: ctx.secs_since_any_exit,
        };
        if let Err(reason) = check_entry(&gate) {
            log_block(ctx, candidate.strategy, reason);
            return None;
        }

        // Tradeable price band.
        if needs_entry_band(candidate.strategy)
            && !(ENTRY_BAND_LOW..=ENTRY_BAND_HIGH).contains(&candidate.limit_price)
        {
            log_block(ctx, candidate.strategy, BlockReason::PriceExtreme);
            return None;
        }

        // Multi-timeframe confirmation.
        if needs_mtf(candidate.strategy) {
            let (pass, ratio) = mtf_confirmation(
                candidate.side,
                ctx.momentum_5m,
                ctx.momentum_15m,
                ctx.indicators.ema_trend,
            );
            if !pass {
                info!(
                    class = %ctx.class,
                    strategy = %candidate.strategy,
                    ratio,
                    "blocked: MTF_CONFIRM"
                );
                return None;
            }
            candidate.mtf_ratio = ratio;
        }

        Some(candidate)
    }
}

impl Default for StrategyEngine {
    fn default() -> Self {
        Self::new()
    }
}

fn log_block(ctx: &StrategyContext<'_>, strategy: StrategyTag, reason: BlockReason) {
    info!(class = %ctx.class, strategy = %strategy, reason = %reason, "entry blocked");
}

// ---------------------------------------------------------------------------
// Market transitions
// ---------------------------------------------------------------------------

/// What the main loop should do for a class this tick.
#[derive(Debug, Clone, PartialEq)]
pub enum TransitionAction {
    /// No transition in flight; trade normally.
    Clear,
    /// A new ticker appeared; hold off while it stabilises.
    Pending,
    /// The new ticker was just accepted: settle old positions, flush steam.
    Accepted { new_ticker: String },
    /// Inside the post-transition price-discovery window; no entries.
    QuietPeriod,
}

/// Tracks per-class transition timing: 5 s acceptance delay, then a 120 s
/// quiet period.
pub struct TransitionTracker {
    started: HashMap<MarketClass, f64>,
    completed: HashMap<MarketClass, f64>,
}

impl TransitionTracker {
    pub fn new() -> Self {
        Self {
            started: HashMap::new(),
            completed: HashMap::new(),
        }
    }

    /// Advance the per-class state machine. `in_transition` is the poller's
    /// current view; `accept` runs when the 5 s delay elapses and must
    /// return the newly accepted ticker.
    pub fn advance(
        &mut self,
        class: MarketClass,
        in_transition: bool,
        now: f64,
        accept: impl FnOnce() -> Option<String>,
    ) -> TransitionAction {
        if in_transition {
            let started = *self.started.entry(class).or_insert(now);
            if now - started > TRANSITION_ACCEPT_SECS {
                self.started.remove(&class);
                self.completed.insert(class, now);
                if let Some(new_ticker) = accept() {
                    return TransitionAction::Accepted { new_ticker };
                }
            }
            return TransitionAction::Pending;
        }

        self.started.remove(&class);

        if let Some(completed) = self.completed.get(&class) {
            if now - completed < TRANSITION_QUIET_SECS {
                return TransitionAction::QuietPeriod;
            }
            self.completed.remove(&class);
        }

        TransitionAction::Clear
    }
}

impl Default for TransitionTracker {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::detectors::SteamStatus;

    fn book(class: MarketClass, bid: f64, ask: f64) -> BookTop {
        let ticker = match class {
            MarketClass::BtcShort => "KXBTC15M-26FEB0217-T95000",
            MarketClass::BtcDaily => "KXBTCD-26FEB02-95000",
            MarketClass::EthShort => "KXETH15M-26FEB0217-T3200",
            MarketClass::EthDaily => "KXETHD-26FEB02-3200",
        };
        BookTop {
            ticker: ticker.to_string(),
            yes_bid: bid,
            yes_ask: ask,
            volume: 500.0,
            close_time: None,
            series: class.series_ticker().to_string(),
            captured_at: 0.0,
        }
    }

    struct Fixture {
        config: EngineConfig,
        book: BookTop,
        indicators: IndicatorSnapshot,
        flash: Option<FlashCrashEvent>,
        divergence: Option<DivergenceSignal>,
    }

    impl Fixture {
        fn new(class: MarketClass, bid: f64, ask: f64) -> Self {
            Self {
                config: EngineConfig::default(),
                book: book(class, bid, ask),
                indicators: IndicatorSnapshot::default(),
                flash: None,
                divergence: None,
            }
        }

        fn ctx(&self) -> StrategyContext<'_> {
            let class = MarketClass::from_ticker(&self.book.ticker).unwrap();
            StrategyContext {
                config: &self.config,
                class,
                book: &self.book,
                last_bid: None,
                underlying: Some(95_100.0),
                momentum_5s: Some(0.0),
                momentum_1m: None,
                momentum_5m: None,
                momentum_15m: None,
                indicators: &self.indicators,
                time_until_close: if class.is_short_window() { 450.0 } else { 7200.0 },
                engine_age_secs: 120.0,
                long_short_ratio: None,
                burst: BurstStatus {
                    direction: None,
                    length: 0,
                    total_move_pct: 0.0,
                },
                steam: SteamStatus {
                    detected: false,
                    kind: None,
                    price_move: 0.0,
                    volume_spike_ratio: 0.0,
                    direction: None,
                },
                flash: self.flash.as_ref(),
                pre_crash_price: None,
                cluster: None,
                divergence: self.divergence.as_ref(),
                depth_imbalance: None,
                has_position_on_class: false,
                has_flash_position_on_class: false,
                secs_since_class_exit: None,
                class_loss_streak: 0,
                secs_since_any_exit: None,
                now: 1_000.0,
            }
        }
    }

    fn crash_event(class: MarketClass) -> FlashCrashEvent {
        FlashCrashEvent {
            market_class: class,
            max_bid: 0.75,
            current_bid: 0.60,
            drop_pct: 0.20,
            at: 1_000.0,
        }
    }

    #[test]
    fn quiet_market_produces_no_intent() {
        let f = Fixture::new(MarketClass::BtcShort, 0.48, 0.50);
        let mut engine = StrategyEngine::new();
        assert!(engine.evaluate(&f.ctx()).is_none());
    }

    // ---- Flash sniper ------------------------------------------------------

    #[test]
    fn flash_sniper_fires_and_builds_meta() {
        let mut f = Fixture::new(MarketClass::BtcShort, 0.60, 0.62);
        f.flash = Some(crash_event(MarketClass::BtcShort));
        let mut ctx = f.ctx();
        ctx.pre_crash_price = Some(0.75);
        ctx.momentum_5s = Some(-0.1);

        let mut engine = StrategyEngine::new();
        let out = engine.evaluate(&ctx).unwrap();
        assert_eq!(out.strategy, StrategyTag::FlashSniper);
        assert_eq!(out.side, Side::Yes);
        assert!((out.limit_price - 0.62).abs() < 1e-12);
        let meta = out.flash.unwrap();
        assert!((meta.recovery_target - (0.62 + 0.8 * (0.75 - 0.62))).abs() < 1e-12);
        assert!((meta.recovery_target - 0.724).abs() < 1e-12);
    }

    #[test]
    fn flash_sniper_fires_despite_existing_position() {
        let mut f = Fixture::new(MarketClass::BtcShort, 0.60, 0.62);
        f.flash = Some(crash_event(MarketClass::BtcShort));
        let mut ctx = f.ctx();
        ctx.has_position_on_class = true;

        let mut engine = StrategyEngine::new();
        let out = engine.evaluate(&ctx).unwrap();
        assert_eq!(out.strategy, StrategyTag::FlashSniper);
    }

    #[test]
    fn flash_sniper_blocked_by_existing_flash_position() {
        let mut f = Fixture::new(MarketClass::BtcShort, 0.60, 0.62);
        f.flash = Some(crash_event(MarketClass::BtcShort));
        let mut ctx = f.ctx();
        ctx.has_position_on_class = true;
        ctx.has_flash_position_on_class = true;

        let mut engine = StrategyEngine::new();
        assert!(engine.evaluate(&ctx).is_none());
    }

    #[test]
    fn flash_sniper_rejects_real_moves() {
        let mut f = Fixture::new(MarketClass::BtcShort, 0.60, 0.62);
        f.flash = Some(crash_event(MarketClass::BtcShort));
        let mut ctx = f.ctx();
        ctx.momentum_5s = Some(-0.4); // underlying actually fell

        let mut engine = StrategyEngine::new();
        assert!(engine.evaluate(&ctx).is_none());
    }

    #[test]
    fn flash_sniper_respects_cooldown() {
        let mut f = Fixture::new(MarketClass::BtcShort, 0.60, 0.62);
        f.flash = Some(crash_event(MarketClass::BtcShort));
        let mut engine = StrategyEngine::new();
        assert!(engine.evaluate(&f.ctx()).is_some());

        // 30 s later the same class crashes again — cooldown holds it back.
        let mut ctx = f.ctx();
        ctx.now = 1_030.0;
        assert!(engine.evaluate(&ctx).is_none());

        // 70 s later it may fire again.
        let mut ctx = f.ctx();
        ctx.now = 1_070.0;
        assert!(engine.evaluate(&ctx).is_some());
    }

    #[test]
    fn flash_sniper_rejects_extreme_rsi_and_ask() {
        let mut f = Fixture::new(MarketClass::BtcShort, 0.60, 0.62);
        f.flash = Some(crash_event(MarketClass::BtcShort));
        f.indicators.rsi = Some(85.0);
        let mut engine = StrategyEngine::new();
        assert!(engine.evaluate(&f.ctx()).is_none());

        let mut f = Fixture::new(MarketClass::BtcShort, 0.04, 0.06);
        f.flash = Some(crash_event(MarketClass::BtcShort));
        let mut engine = StrategyEngine::new();
        assert!(engine.evaluate(&f.ctx()).is_none());
    }

    // ---- Cross-venue lead --------------------------------------------------

    #[test]
    fn cross_venue_lead_fires_on_daily_with_time() {
        let mut f = Fixture::new(MarketClass::BtcDaily, 0.52, 0.53);
        f.divergence = Some(DivergenceSignal {
            side: Side::Yes,
            venue_price: 0.57,
            venue_strike: 95_000.0,
            our_price: 0.52,
            our_strike: 95_000.0,
            divergence: 0.05,
            venue_momentum: 0.03,
            confidence: 0.5,
        });
        let mut ctx = f.ctx();
        ctx.momentum_5m = Some(0.2);
        ctx.momentum_15m = Some(0.1);

        let mut engine = StrategyEngine::new();
        let out = engine.evaluate(&ctx).unwrap();
        assert_eq!(out.strategy, StrategyTag::CrossVenueLead);
        assert_eq!(out.side, Side::Yes);
        assert!((out.limit_price - 0.53).abs() < 1e-12);
        assert!((out.confidence - 0.5).abs() < 1e-12);
        assert!((out.mtf_ratio - 1.0).abs() < 1e-12);
    }

    #[test]
    fn cross_venue_lead_ignores_short_windows_and_late_dailies() {
        let mut f = Fixture::new(MarketClass::BtcDaily, 0.52, 0.53);
        f.divergence = Some(DivergenceSignal {
            side: Side::Yes,
            venue_price: 0.57,
            venue_strike: 95_000.0,
            our_price: 0.52,
            our_strike: 95_000.0,
            divergence: 0.05,
            venue_momentum: 0.03,
            confidence: 0.5,
        });
        let mut ctx = f.ctx();
        ctx.time_until_close = 3_000.0; // inside the final hour
        let mut engine = StrategyEngine::new();
        // Falls through to settlement rush instead (underlying 95100 > 95000,
        // but implied ≈ 0.526 < 0.6 → nothing fires).
        assert!(engine.evaluate(&ctx).is_none());
    }

    // ---- Settlement rush ---------------------------------------------------

    #[test]
    fn settlement_rush_yes_when_probability_high() {
        let mut f = Fixture::new(MarketClass::BtcShort, 0.60, 0.62);
        f.book.ticker = "KXBTC15M-26FEB0217-T95000".to_string();
        let mut ctx = f.ctx();
        ctx.time_until_close = 120.0;
        ctx.underlying = Some(95_500.0); // 0.526% above strike → implied > 0.6

        let mut engine = StrategyEngine::new();
        let out = engine.evaluate(&ctx).unwrap();
        assert_eq!(out.strategy, StrategyTag::SettlementRush);
        assert_eq!(out.side, Side::Yes);
        assert!((out.limit_price - 0.62).abs() < 1e-12);
    }

    #[test]
    fn settlement_rush_no_when_below_strike() {
        let mut f = Fixture::new(MarketClass::BtcShort, 0.30, 0.33);
        f.book.ticker = "KXBTC15M-26FEB0217-T95000".to_string();
        let mut ctx = f.ctx();
        ctx.time_until_close = 120.0;
        ctx.underlying = Some(94_500.0);

        let mut engine = StrategyEngine::new();
        let out = engine.evaluate(&ctx).unwrap();
        assert_eq!(out.side, Side::No);
        assert!((out.limit_price - 0.70).abs() < 1e-12);
    }

    #[test]
    fn settlement_rush_needs_conviction() {
        let mut f = Fixture::new(MarketClass::BtcShort, 0.48, 0.50);
        f.book.ticker = "KXBTC15M-26FEB0217-T95000".to_string();
        let mut ctx = f.ctx();
        ctx.time_until_close = 120.0;
        ctx.underlying = Some(95_100.0); // only ~0.1% above strike

        let mut engine = StrategyEngine::new();
        assert!(engine.evaluate(&ctx).is_none());
    }

    // ---- Steam follow ------------------------------------------------------

    fn steam_up() -> SteamStatus {
        SteamStatus {
            detected: true,
            kind: Some(crate::detectors::steam::SteamKind::PriceAlone),
            price_move: 0.07,
            volume_spike_ratio: 0.0,
            direction: Some(1),
        }
    }

    #[test]
    fn steam_follow_requires_trend_agreement() {
        let f = Fixture::new(MarketClass::BtcShort, 0.48, 0.50);
        let mut engine = StrategyEngine::new();

        // Agreeing trend → fires. MTF: only 5m momentum present and agreeing.
        let mut ctx = f.ctx();
        ctx.steam = steam_up();
        ctx.momentum_5m = Some(0.2);
        let out = engine.evaluate(&ctx).unwrap();
        assert_eq!(out.strategy, StrategyTag::SteamFollow);
        assert_eq!(out.side, Side::Yes);

        // Flat trend → dead zone rejects.
        let mut ctx = f.ctx();
        ctx.steam = steam_up();
        ctx.momentum_5m = Some(0.01);
        assert!(engine.evaluate(&ctx).is_none());

        // Counter-trend → rejected.
        let mut ctx = f.ctx();
        ctx.steam = steam_up();
        ctx.momentum_5m = Some(-0.2);
        assert!(engine.evaluate(&ctx).is_none());
    }

    // ---- Tick burst --------------------------------------------------------

    #[test]
    fn tick_burst_needs_length_and_magnitude() {
        let f = Fixture::new(MarketClass::BtcShort, 0.48, 0.50);
        let mut engine = StrategyEngine::new();

        let mut ctx = f.ctx();
        ctx.burst = BurstStatus {
            direction: Some(BurstDirection::Up),
            length: 4,
            total_move_pct: 0.15,
        };
        ctx.momentum_5m = Some(0.2);
        let out = engine.evaluate(&ctx).unwrap();
        assert_eq!(out.strategy, StrategyTag::TickBurst);
        assert_eq!(out.side, Side::Yes);

        // Length 3 is not enough for the follow strategy.
        let mut ctx = f.ctx();
        ctx.burst = BurstStatus {
            direction: Some(BurstDirection::Up),
            length: 3,
            total_move_pct: 0.15,
        };
        assert!(engine.evaluate(&ctx).is_none());
    }

    // ---- Cluster -----------------------------------------------------------

    #[test]
    fn cluster_defers_to_delay_arb() {
        let f = Fixture::new(MarketClass::BtcShort, 0.48, 0.50);
        let mut engine = StrategyEngine::new();

        // Cluster alone fires.
        let mut ctx = f.ctx();
        ctx.cluster = Some((ClusterDirection::Up, 0.001, 3));
        ctx.momentum_5m = Some(0.2);
        let out = engine.evaluate(&ctx).unwrap();
        assert_eq!(out.strategy, StrategyTag::MomentumCluster);

        // With delay-arb also triggering, the cluster stands down and the
        // delay-arb entry (further down the list) wins instead.
        let mut ctx = f.ctx();
        ctx.cluster = Some((ClusterDirection::Up, 0.001, 3));
        ctx.momentum_5m = Some(0.2);
        ctx.last_bid = Some(0.48);
        ctx.momentum_1m = Some(0.25);
        let out = engine.evaluate(&ctx).unwrap();
        assert_eq!(out.strategy, StrategyTag::DelayArb);
    }

    // ---- Order-book imbalance ----------------------------------------------

    #[test]
    fn imbalance_thresholds() {
        let f = Fixture::new(MarketClass::BtcShort, 0.48, 0.50);
        let mut engine = StrategyEngine::new();

        let mut ctx = f.ctx();
        ctx.depth_imbalance = Some((0.4, 140.0, 60.0));
        let out = engine.evaluate(&ctx).unwrap();
        assert_eq!(out.strategy, StrategyTag::OrderbookImbalance);
        assert_eq!(out.side, Side::Yes);

        let mut ctx = f.ctx();
        ctx.depth_imbalance = Some((-0.4, 60.0, 140.0));
        let out = engine.evaluate(&ctx).unwrap();
        assert_eq!(out.side, Side::No);
        assert!((out.limit_price - 0.52).abs() < 1e-12);

        // Thin book: no trade.
        let mut ctx = f.ctx();
        ctx.depth_imbalance = Some((0.4, 60.0, 30.0));
        assert!(engine.evaluate(&ctx).is_none());

        // Weak signal: no trade.
        let mut ctx = f.ctx();
        ctx.depth_imbalance = Some((0.2, 140.0, 90.0));
        assert!(engine.evaluate(&ctx).is_none());
    }

    // ---- Delay arbitrage ---------------------------------------------------

    #[test]
    fn delay_arb_fires_on_lagging_contract() {
        let f = Fixture::new(MarketClass::BtcShort, 0.42, 0.42);
        let mut engine = StrategyEngine::new();

        let mut ctx = f.ctx();
        ctx.last_bid = Some(0.4158); // contract moved ~1%
        ctx.momentum_1m = Some(0.25);
        ctx.momentum_5m = Some(0.2);
        let out = engine.evaluate(&ctx).unwrap();
        assert_eq!(out.strategy, StrategyTag::DelayArb);
        assert_eq!(out.side, Side::Yes);
        assert!((out.limit_price - 0.42).abs() < 1e-12);
    }

    #[test]
    fn delay_arb_stands_down_when_contract_caught_up() {
        let f = Fixture::new(MarketClass::BtcShort, 0.48, 0.50);
        let mut engine = StrategyEngine::new();

        let mut ctx = f.ctx();
        ctx.last_bid = Some(0.44); // contract jumped ~9% already
        ctx.momentum_1m = Some(0.25);
        assert!(engine.evaluate(&ctx).is_none());
    }

    // ---- Central gate integration ------------------------------------------

    #[test]
    fn blocked_candidate_does_not_fall_through() {
        // Steam fires but the class sits in cooldown after a loss; the tick
        // produces nothing even though delay-arb would also have fired.
        let f = Fixture::new(MarketClass::BtcShort, 0.48, 0.50);
        let mut engine = StrategyEngine::new();

        let mut ctx = f.ctx();
        ctx.steam = steam_up();
        ctx.momentum_5m = Some(0.2);
        ctx.last_bid = Some(0.48);
        ctx.momentum_1m = Some(0.25);
        ctx.class_loss_streak = 1;
        ctx.secs_since_class_exit = Some(90.0); // < 120 s loss cooldown
        assert!(engine.evaluate(&ctx).is_none());
    }

    #[test]
    fn partial_mtf_sets_ratio_for_downsizing() {
        let mut f = Fixture::new(MarketClass::BtcShort, 0.48, 0.50);
        f.indicators.ema_trend = crate::indicators::EmaTrend::Bearish;
        let mut engine = StrategyEngine::new();

        let mut ctx = f.ctx();
        ctx.steam = steam_up();
        ctx.momentum_5m = Some(0.2);
        ctx.momentum_15m = Some(0.1);
        // 2/3 agreement: both momenta agree, EMA trend is bearish.
        let out = engine.evaluate(&ctx).unwrap();
        assert!((out.mtf_ratio - 2.0 / 3.0).abs() < 1e-9);
    }

    // ---- Transition tracker ------------------------------------------------

    #[test]
    fn transition_lifecycle() {
        let mut tracker = TransitionTracker::new();
        let class = MarketClass::BtcShort;

        // Steady state.
        assert_eq!(
            tracker.advance(class, false, 0.0, || None),
            TransitionAction::Clear
        );

        // Transition appears: pending while the 5 s delay runs.
        assert_eq!(
            tracker.advance(class, true, 10.0, || None),
            TransitionAction::Pending
        );
        assert_eq!(
            tracker.advance(class, true, 13.0, || None),
            TransitionAction::Pending
        );

        // 6 s in: accepted.
        let action = tracker.advance(class, true, 16.0, || Some("KXBTC15M-NEW".to_string()));
        assert_eq!(
            action,
            TransitionAction::Accepted {
                new_ticker: "KXBTC15M-NEW".to_string()
            }
        );

        // Quiet period holds for 120 s after acceptance.
        assert_eq!(
            tracker.advance(class, false, 100.0, || None),
            TransitionAction::QuietPeriod
        );
        assert_eq!(
            tracker.advance(class, false, 135.9, || None),
            TransitionAction::QuietPeriod
        );
        assert_eq!(
            tracker.advance(class, false, 137.0, || None),
            TransitionAction::Clear
        );
    }

    #[test]
    fn transition_per_class_isolation() {
        let mut tracker = TransitionTracker::new();
        tracker.advance(MarketClass::BtcShort, true, 0.0, || None);
        assert_eq!(
            tracker.advance(MarketClass::EthShort, false, 1.0, || None),
            TransitionAction::Clear
        );
    }
}
