// =============================================================================
// Risk Gate — entry filters, multi-timeframe confirmation, adaptive stops
// =============================================================================
//
// Every candidate entry passes through `check_entry` before it may become a
// position. The gate is a strict list of named filters evaluated in order;
// the first one that bites blocks the entry with a stable reason tag that
// shows up verbatim in the logs and the checkpoint's signal list.
//
// Strategy exemptions:
//   * flash sniper carries its own filter set in the strategy itself and
//     bypasses the standard gate entirely;
//   * settlement rush only answers to spread and volume (it trades exactly
//     when everything else says "too close to settlement").
// =============================================================================

use serde::Serialize;

use crate::config::EngineConfig;
use crate::indicators::{EmaTrend, IndicatorSnapshot};
use crate::types::{BookTop, MarketClass, Side, StrategyTag};

/// Engine must be this old before the first entry.
const WARMUP_SECS: f64 = 30.0;
/// Non-settlement strategies stand down this close to settlement.
const SETTLEMENT_GUARD_SECS: f64 = 300.0;
/// Short-window contracts cycle on this period.
const SHORT_WINDOW_PERIOD_SECS: f64 = 900.0;
/// Stand-down at the edges of a short window.
const WINDOW_EDGE_SECS: f64 = 30.0;
/// Tradeable mid-price band.
const MIN_MID: f64 = 0.15;
const MAX_MID: f64 = 0.85;
/// Settlement rush tolerates this spread everywhere.
const MAX_SPREAD_SETTLEMENT: f64 = 0.05;
/// RSI band outside which follow strategies stand down.
const RSI_HIGH: f64 = 75.0;
const RSI_LOW: f64 = 25.0;
/// Long/short ratio band outside which the crowd is too one-sided.
const LS_RATIO_HIGH: f64 = 4.0;
const LS_RATIO_LOW: f64 = 0.5;
/// Per-class cooldowns after an exit, seconds.
const COOLDOWN_AFTER_WIN_SECS: f64 = 60.0;
const COOLDOWN_AFTER_LOSS_SECS: f64 = 120.0;
const COOLDOWN_CIRCUIT_BREAKER_SECS: f64 = 300.0;
/// Losses on one class that trip the circuit breaker.
const CIRCUIT_BREAKER_LOSSES: u32 = 3;
/// Global stand-down after any exit, seconds.
const GLOBAL_COOLDOWN_SECS: f64 = 30.0;
/// Multi-timeframe momentum dead zone, percent.
const MTF_DEAD_ZONE_PCT: f64 = 0.05;
/// Required share of present timeframe signals agreeing with the entry.
const MTF_REQUIRED_RATIO: f64 = 0.67;

/// Why an entry was denied. `Display` yields the stable tag used in logs.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub enum BlockReason {
    StartupWarmup,
    TooCloseToSettlement,
    TransitionWindow,
    PriceExtreme,
    SpreadTooWide,
    VolumeTooLow,
    VolRegime,
    RsiFilter,
    LsRatio,
    ClassCooldown { secs: u32, losses: u32 },
    GlobalCooldown,
    MtfConfirm,
}

impl std::fmt::Display for BlockReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::StartupWarmup => write!(f, "startup_warmup"),
            Self::TooCloseToSettlement => write!(f, "too_close_to_settlement"),
            Self::TransitionWindow => write!(f, "market_transition_window"),
            Self::PriceExtreme => write!(f, "price_too_extreme"),
            Self::SpreadTooWide => write!(f, "spread_too_wide"),
            Self::VolumeTooLow => write!(f, "volume_too_low"),
            Self::VolRegime => write!(f, "VOL_REGIME"),
            Self::RsiFilter => write!(f, "RSI_FILTER"),
            Self::LsRatio => write!(f, "LS_RATIO"),
            Self::ClassCooldown { secs, losses } => {
                write!(f, "cooldown_period({secs}s,losses={losses})")
            }
            Self::GlobalCooldown => write!(f, "global_cooldown"),
            Self::MtfConfirm => write!(f, "MTF_CONFIRM"),
        }
    }
}

/// Everything the gate needs to judge one candidate entry.
pub struct EntryCheck<'a> {
    pub config: &'a EngineConfig,
    pub class: MarketClass,
    pub strategy: StrategyTag,
    pub side: Side,
    pub book: &'a BookTop,
    pub indicators: &'a IndicatorSnapshot,
    pub engine_age_secs: f64,
    pub time_until_close: f64,
    pub long_short_ratio: Option<f64>,
    pub secs_since_class_exit: Option<f64>,
    pub class_loss_streak: u32,
    pub secs_since_any_exit: Option<f64>,
}

/// RSI and long/short filters only bind trend-following entries.
fn is_follow_strategy(strategy: StrategyTag) -> bool {
    matches!(strategy, StrategyTag::SteamFollow | StrategyTag::DelayArb)
}

fn is_sentiment_sensitive(strategy: StrategyTag) -> bool {
    !matches!(
        strategy,
        StrategyTag::SettlementRush | StrategyTag::OrderbookImbalance
    )
}

/// Run the full filter list. `Ok(())` admits the entry.
pub fn check_entry(check: &EntryCheck<'_>) -> Result<(), BlockReason> {
    if check.engine_age_secs < WARMUP_SECS {
        return Err(BlockReason::StartupWarmup);
    }

    // Flash sniper carries its own filters.
    if check.strategy == StrategyTag::FlashSniper {
        return Ok(());
    }

    let spread = check.book.spread();

    // Settlement rush: spread and volume only.
    if check.strategy == StrategyTag::SettlementRush {
        if spread >= MAX_SPREAD_SETTLEMENT {
            return Err(BlockReason::SpreadTooWide);
        }
        if check.book.volume < check.config.min_volume {
            return Err(BlockReason::VolumeTooLow);
        }
        return Ok(());
    }

    if check.time_until_close < SETTLEMENT_GUARD_SECS {
        return Err(BlockReason::TooCloseToSettlement);
    }

    // First/last 30 s of a short window are pure churn.
    if check.class.is_short_window() {
        let window_age = check.time_until_close.rem_euclid(SHORT_WINDOW_PERIOD_SECS);
        if window_age < WINDOW_EDGE_SECS
            || window_age > SHORT_WINDOW_PERIOD_SECS - WINDOW_EDGE_SECS
        {
            return Err(BlockReason::TransitionWindow);
        }
    }

    // Deep ITM/OTM contracts: tiny moves are massive percent swings.
    let mid = check.book.mid();
    if mid <= MIN_MID || mid >= MAX_MID {
        return Err(BlockReason::PriceExtreme);
    }

    let max_spread = check.config.max_spread(check.class.asset() == crate::types::Asset::Eth);
    if spread >= max_spread {
        return Err(BlockReason::SpreadTooWide);
    }

    if check.book.volume < check.config.min_volume {
        return Err(BlockReason::VolumeTooLow);
    }

    if let Some(atr) = check.indicators.atr {
        if atr >= check.config.vol_regime_atr {
            return Err(BlockReason::VolRegime);
        }
    }

    if is_follow_strategy(check.strategy) {
        if let Some(rsi) = check.indicators.rsi {
            if rsi > RSI_HIGH && check.side == Side::Yes {
                return Err(BlockReason::RsiFilter);
            }
            if rsi < RSI_LOW && check.side == Side::No {
                return Err(BlockReason::RsiFilter);
            }
        }
    }

    if is_sentiment_sensitive(check.strategy) {
        if let Some(ratio) = check.long_short_ratio {
            if ratio > LS_RATIO_HIGH || ratio < LS_RATIO_LOW {
                return Err(BlockReason::LsRatio);
            }
        }
    }

    // Per-class cooldown: 60 s after a win, 120 s after a loss, 300 s after a
    // loss streak.
    if let Some(elapsed) = check.secs_since_class_exit {
        let cooldown = if check.class_loss_streak >= CIRCUIT_BREAKER_LOSSES {
            COOLDOWN_CIRCUIT_BREAKER_SECS
        } else if check.class_loss_streak > 0 {
            COOLDOWN_AFTER_LOSS_SECS
        } else {
            COOLDOWN_AFTER_WIN_SECS
        };
        if elapsed < cooldown {
            return Err(BlockReason::ClassCooldown {
                secs: cooldown as u32,
                losses: check.class_loss_streak,
            });
        }
    }

    if let Some(elapsed) = check.secs_since_any_exit {
        if elapsed < GLOBAL_COOLDOWN_SECS {
            return Err(BlockReason::GlobalCooldown);
        }
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Multi-timeframe confirmation
// ---------------------------------------------------------------------------

/// Agreement of {5-min momentum, 15-min momentum, EMA trend} with the intended
/// side. Each signal that has a value contributes; absent signals don't count
/// against the entry.
///
/// Returns `(pass, agreement_ratio)`: pass requires at least 2/3 of the
/// present signals aligned. An exactly-partial ratio (< 1.0) halves position
/// size downstream.
pub fn mtf_confirmation(
    side: Side,
    momentum_5m: Option<f64>,
    momentum_15m: Option<f64>,
    ema_trend: EmaTrend,
) -> (bool, f64) {
    let mut agreements = 0u32;
    let mut total = 0u32;

    for momentum in [momentum_5m, momentum_15m].into_iter().flatten() {
        total += 1;
        let agrees = match side {
            Side::Yes => momentum > MTF_DEAD_ZONE_PCT,
            Side::No => momentum < -MTF_DEAD_ZONE_PCT,
        };
        if agrees {
            agreements += 1;
        }
    }

    if ema_trend != EmaTrend::Neutral {
        total += 1;
        let agrees = matches!(
            (side, ema_trend),
            (Side::Yes, EmaTrend::Bullish) | (Side::No, EmaTrend::Bearish)
        );
        if agrees {
            agreements += 1;
        }
    }

    if total == 0 {
        return (true, 1.0);
    }

    let ratio = agreements as f64 / total as f64;
    (ratio >= MTF_REQUIRED_RATIO, ratio)
}

// ---------------------------------------------------------------------------
// Adaptive stop
// ---------------------------------------------------------------------------

/// ATR multiple for the stop distance in a normal regime.
const STOP_ATR_MULT: f64 = 1.5;
/// Widened multiple once ATR itself signals a high-vol regime.
const STOP_ATR_MULT_HIGH_VOL: f64 = 2.0;
/// ATR-based stop bounds, dollars per contract.
const STOP_ATR_MIN: f64 = 0.05;
const STOP_ATR_MAX: f64 = 0.20;
/// Fallback stop bounds when ATR is unavailable.
const STOP_FALLBACK_MIN: f64 = 0.04;
const STOP_FALLBACK_MAX: f64 = 0.15;

/// Hard-stop distance in dollars per contract.
///
/// Prefers an ATR-scaled stop; falls back to per-strategy defaults scaled by
/// recent realised volatility (up to +50%) when indicators aren't ready.
pub fn adaptive_stop_dollar(
    atr: Option<f64>,
    recent_volatility: f64,
    strategy: StrategyTag,
    class: MarketClass,
    vol_regime_atr: f64,
) -> f64 {
    if let Some(atr) = atr {
        let mult = if atr > vol_regime_atr {
            STOP_ATR_MULT_HIGH_VOL
        } else {
            STOP_ATR_MULT
        };
        return (atr * mult).clamp(STOP_ATR_MIN, STOP_ATR_MAX);
    }

    let base = match strategy {
        StrategyTag::SteamFollow => {
            if class.asset() == crate::types::Asset::Eth {
                0.12
            } else {
                0.15
            }
        }
        StrategyTag::SettlementRush => 0.05,
        _ => 0.08,
    };

    let vol_adj = 1.0 + (recent_volatility * 5.0).min(0.5);
    (base * vol_adj).clamp(STOP_FALLBACK_MIN, STOP_FALLBACK_MAX)
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn book(bid: f64, ask: f64, volume: f64) -> BookTop {
        BookTop {
            ticker: "KXETH15M-26FEB0217-T3200".to_string(),
            yes_bid: bid,
            yes_ask: ask,
            volume,
            close_time: None,
            series: "KXETH15M".to_string(),
            captured_at: 0.0,
        }
    }

    struct Fixture {
        config: EngineConfig,
        book: BookTop,
        indicators: IndicatorSnapshot,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                config: EngineConfig::default(),
                book: book(0.48, 0.50, 500.0),
                indicators: IndicatorSnapshot::default(),
            }
        }

        fn check(&self) -> EntryCheck<'_> {
            EntryCheck {
                config: &self.config,
                class: MarketClass::EthShort,
                strategy: StrategyTag::DelayArb,
                side: Side::Yes,
                book: &self.book,
                indicators: &self.indicators,
                engine_age_secs: 120.0,
                // Mid-window: 450 s into a 900 s cycle.
                time_until_close: 450.0,
                long_short_ratio: None,
                secs_since_class_exit: None,
                class_loss_streak: 0,
                secs_since_any_exit: None,
            }
        }
    }

    #[test]
    fn clean_entry_passes() {
        let f = Fixture::new();
        assert!(check_entry(&f.check()).is_ok());
    }

    #[test]
    fn warmup_blocks_everything_including_flash() {
        let f = Fixture::new();
        let mut c = f.check();
        c.engine_age_secs = 29.0;
        assert_eq!(check_entry(&c), Err(BlockReason::StartupWarmup));
        c.strategy = StrategyTag::FlashSniper;
        assert_eq!(check_entry(&c), Err(BlockReason::StartupWarmup));
    }

    #[test]
    fn flash_sniper_bypasses_standard_gate() {
        let f = Fixture::new();
        let mut c = f.check();
        c.strategy = StrategyTag::FlashSniper;
        c.time_until_close = 100.0; // would block anyone else
        assert!(check_entry(&c).is_ok());
    }

    #[test]
    fn settlement_guard_blocks_close_to_settlement() {
        let f = Fixture::new();
        let mut c = f.check();
        c.time_until_close = 299.0;
        assert_eq!(check_entry(&c), Err(BlockReason::TooCloseToSettlement));
    }

    #[test]
    fn settlement_rush_only_answers_to_spread_and_volume() {
        let mut f = Fixture::new();
        f.book = book(0.60, 0.64, 500.0);
        let mut c = f.check();
        c.strategy = StrategyTag::SettlementRush;
        c.time_until_close = 120.0;
        assert!(check_entry(&c).is_ok());

        // 5¢ spread blocks settlement rush.
        let mut f2 = Fixture::new();
        f2.book = book(0.60, 0.65, 500.0);
        let mut c2 = f2.check();
        c2.strategy = StrategyTag::SettlementRush;
        c2.time_until_close = 120.0;
        assert_eq!(check_entry(&c2), Err(BlockReason::SpreadTooWide));

        let mut f3 = Fixture::new();
        f3.book = book(0.60, 0.62, 40.0);
        let mut c3 = f3.check();
        c3.strategy = StrategyTag::SettlementRush;
        c3.time_until_close = 120.0;
        assert_eq!(check_entry(&c3), Err(BlockReason::VolumeTooLow));
    }

    #[test]
    fn short_window_edges_block() {
        let f = Fixture::new();
        // 10 s into the cycle (890 s remaining of 900): age = 890 % 900 = 890 > 870.
        let mut c = f.check();
        c.time_until_close = 890.0;
        assert_eq!(check_entry(&c), Err(BlockReason::TransitionWindow));
        // 890 s in (10 remaining) would be the other edge, but the settlement
        // guard fires first there.
        c.time_until_close = 310.0 + 900.0; // 1210 % 900 = 310 → mid-window for a later cycle
        assert!(check_entry(&c).is_ok());
    }

    #[test]
    fn mid_price_boundary() {
        // mid = 0.15 exactly blocks.
        let mut f = Fixture::new();
        f.book = book(0.13, 0.17, 500.0);
        assert_eq!(check_entry(&f.check()), Err(BlockReason::PriceExtreme));

        // mid = 0.1501 admits (spread kept tight).
        let mut f2 = Fixture::new();
        f2.book = book(0.1402, 0.16, 500.0);
        assert!(check_entry(&f2.check()).is_ok());
    }

    #[test]
    fn spread_boundary_eth() {
        // ask − bid = 0.04 exactly blocks on an ETH class.
        let mut f = Fixture::new();
        f.book = book(0.48, 0.52, 500.0);
        assert_eq!(check_entry(&f.check()), Err(BlockReason::SpreadTooWide));

        // 0.039 admits.
        let mut f2 = Fixture::new();
        f2.book = book(0.48, 0.519, 500.0);
        assert!(check_entry(&f2.check()).is_ok());
    }

    #[test]
    fn volume_floor_blocks() {
        let mut f = Fixture::new();
        f.book = book(0.48, 0.50, 49.0);
        assert_eq!(check_entry(&f.check()), Err(BlockReason::VolumeTooLow));
    }

    #[test]
    fn vol_regime_boundary() {
        let mut f = Fixture::new();
        f.indicators.atr = Some(0.0025);
        assert_eq!(check_entry(&f.check()), Err(BlockReason::VolRegime));

        f.indicators.atr = Some(0.0024);
        assert!(check_entry(&f.check()).is_ok());
    }

    #[test]
    fn rsi_filter_is_side_aware() {
        let mut f = Fixture::new();
        f.indicators.rsi = Some(80.0);
        // Overbought blocks YES on follow strategies...
        assert_eq!(check_entry(&f.check()), Err(BlockReason::RsiFilter));
        // ...but not NO.
        let mut c = f.check();
        c.side = Side::No;
        assert!(check_entry(&c).is_ok());

        f.indicators.rsi = Some(20.0);
        let mut c = f.check();
        c.side = Side::No;
        assert_eq!(check_entry(&c), Err(BlockReason::RsiFilter));

        // Non-follow strategies ignore RSI.
        let mut c = f.check();
        c.side = Side::No;
        c.strategy = StrategyTag::OrderbookImbalance;
        assert!(check_entry(&c).is_ok());
    }

    #[test]
    fn ls_ratio_band() {
        let f = Fixture::new();
        let mut c = f.check();
        c.long_short_ratio = Some(4.1);
        assert_eq!(check_entry(&c), Err(BlockReason::LsRatio));
        c.long_short_ratio = Some(0.4);
        assert_eq!(check_entry(&c), Err(BlockReason::LsRatio));
        c.long_short_ratio = Some(1.2);
        assert!(check_entry(&c).is_ok());

        // Order-book imbalance is exempt.
        c.long_short_ratio = Some(4.1);
        c.strategy = StrategyTag::OrderbookImbalance;
        assert!(check_entry(&c).is_ok());
    }

    #[test]
    fn class_cooldown_boundaries() {
        let f = Fixture::new();

        // After a win: blocked at 59 s, allowed at 60 s.
        let mut c = f.check();
        c.secs_since_class_exit = Some(59.0);
        assert!(matches!(
            check_entry(&c),
            Err(BlockReason::ClassCooldown { secs: 60, .. })
        ));
        c.secs_since_class_exit = Some(60.0);
        assert!(check_entry(&c).is_ok());

        // After 3 losses: blocked at 299 s, allowed at 301 s.
        let mut c = f.check();
        c.class_loss_streak = 3;
        c.secs_since_class_exit = Some(299.0);
        assert!(matches!(
            check_entry(&c),
            Err(BlockReason::ClassCooldown { secs: 300, losses: 3 })
        ));
        c.secs_since_class_exit = Some(301.0);
        assert!(check_entry(&c).is_ok());
    }

    #[test]
    fn global_cooldown_blocks() {
        let f = Fixture::new();
        let mut c = f.check();
        c.secs_since_any_exit = Some(29.0);
        assert_eq!(check_entry(&c), Err(BlockReason::GlobalCooldown));
        c.secs_since_any_exit = Some(31.0);
        assert!(check_entry(&c).is_ok());
    }

    // ---- MTF confirmation --------------------------------------------------

    #[test]
    fn mtf_no_signals_allows() {
        let (pass, ratio) = mtf_confirmation(Side::Yes, None, None, EmaTrend::Neutral);
        assert!(pass);
        assert!((ratio - 1.0).abs() < 1e-12);
    }

    #[test]
    fn mtf_two_of_three_passes_partially() {
        let (pass, ratio) =
            mtf_confirmation(Side::Yes, Some(0.2), Some(0.1), EmaTrend::Bearish);
        assert!(pass);
        assert!((ratio - 2.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn mtf_one_of_three_fails() {
        let (pass, _) = mtf_confirmation(Side::Yes, Some(0.2), Some(-0.1), EmaTrend::Bearish);
        assert!(!pass);
    }

    #[test]
    fn mtf_dead_zone_does_not_agree() {
        // +0.03% momentum sits inside the ±0.05% dead zone.
        let (pass, ratio) = mtf_confirmation(Side::Yes, Some(0.03), None, EmaTrend::Neutral);
        assert!(!pass);
        assert!((ratio - 0.0).abs() < 1e-12);
    }

    #[test]
    fn mtf_no_side_mirrors() {
        let (pass, ratio) =
            mtf_confirmation(Side::No, Some(-0.2), Some(-0.3), EmaTrend::Bearish);
        assert!(pass);
        assert!((ratio - 1.0).abs() < 1e-12);
    }

    // ---- Adaptive stop -----------------------------------------------------

    #[test]
    fn atr_stop_is_clamped() {
        // 1.5 × 0.002 = 0.003 → clamped up to $0.05.
        let stop = adaptive_stop_dollar(Some(0.002), 0.0, StrategyTag::DelayArb, MarketClass::BtcShort, 0.0025);
        assert!((stop - 0.05).abs() < 1e-12);

        // Huge ATR: 2.0 × 0.5 clamped down to $0.20.
        let stop = adaptive_stop_dollar(Some(0.5), 0.0, StrategyTag::DelayArb, MarketClass::BtcShort, 0.0025);
        assert!((stop - 0.20).abs() < 1e-12);
    }

    #[test]
    fn fallback_stop_by_strategy() {
        // No ATR: steam on BTC starts from $0.15.
        let stop = adaptive_stop_dollar(None, 0.0, StrategyTag::SteamFollow, MarketClass::BtcShort, 0.0025);
        assert!((stop - 0.15).abs() < 1e-12);

        // Steam on ETH starts from $0.12.
        let stop = adaptive_stop_dollar(None, 0.0, StrategyTag::SteamFollow, MarketClass::EthShort, 0.0025);
        assert!((stop - 0.12).abs() < 1e-12);

        // Settlement rush is tight.
        let stop = adaptive_stop_dollar(None, 0.0, StrategyTag::SettlementRush, MarketClass::BtcShort, 0.0025);
        assert!((stop - 0.05).abs() < 1e-12);
    }

    #[test]
    fn fallback_stop_scales_with_volatility_and_clamps() {
        // Base 0.08 with max +50% volatility adjustment = 0.12.
        let stop = adaptive_stop_dollar(None, 0.2, StrategyTag::DelayArb, MarketClass::BtcShort, 0.0025);
        assert!((stop - 0.12).abs() < 1e-12);

        // Steam BTC 0.15 × 1.5 = 0.225 → clamped to 0.15.
        let stop = adaptive_stop_dollar(None, 0.2, StrategyTag::SteamFollow, MarketClass::BtcShort, 0.0025);
        assert!((stop - 0.15).abs() < 1e-12);
    }
}
