// =============================================================================
// Paper Trader — position lifecycle, Kelly sizing, session accounting
// =============================================================================
//
// The single mutator of cash, positions, trade history, statistics, and
// cooldown state. Every other subsystem reads; only the main tick loop calls
// the mutating methods here.
//
// Accounting invariant, maintained by open/close:
//   balance = initial − Σ(open cost) + Σ(close proceeds)
//
// P&L uses one formula for both sides — (exit − entry) × size — because the
// fill layer always quotes prices in the position side's own frame.
//
// All time-dependent methods take `now` explicitly so the boundary behavior
// (cooldowns, timeouts) is testable to the second.
// =============================================================================

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::feeds::orderbook::DepthSnapshot;
use crate::fill::{simulate_entry, simulate_exit, FillResult};
use crate::types::{
    BookTop, EntryIntent, ExitReason, FlashMeta, MarketClass, Side, SizingMethod, StrategyTag,
};

/// Closed trades below which a strategy sizes at the fixed base.
const KELLY_WARMUP_TRADES: u32 = 20;
/// Kelly size bounds, contracts.
const KELLY_MIN_SIZE: u32 = 5;
const KELLY_MAX_SIZE: u32 = 50;

/// Trailing-stop arm threshold and pullback distance, dollars per contract.
const TRAIL_ARM: f64 = 0.03;
const TRAIL_DISTANCE: f64 = 0.03;
/// Steam trades ride bigger swings: wider arm and pullback.
const TRAIL_ARM_STEAM: f64 = 0.05;
const TRAIL_DISTANCE_STEAM: f64 = 0.04;

/// Position timeouts by strategy, seconds.
const TIMEOUT_SECS: f64 = 180.0;
const TIMEOUT_SECS_FLASH: f64 = 120.0;
const TIMEOUT_SECS_SETTLEMENT: f64 = 60.0;

/// Flash-sniper stop: drop below entry as a fraction of entry.
const FLASH_STOP_FRACTION: f64 = 0.10;
/// Flash-sniper stop: adverse underlying move, percent.
const FLASH_UNDERLYING_ADVERSE_PCT: f64 = 0.5;

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// How a position's size was decided, journaled with the trade.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SizingDecision {
    pub method: SizingMethod,
    pub base_size: u32,
    pub calculated_size: u32,
    pub strategy_trades: u32,
    pub win_rate: f64,
    pub win_loss_ratio: f64,
    pub kelly_fraction: f64,
}

/// A simulated position. Mutated only by the paper trader; closed exactly
/// once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub id: String,
    pub ticker: String,
    pub market_class: MarketClass,
    pub side: Side,
    pub size: f64,
    /// Post-slippage entry price in the side's own frame.
    pub entry_price: f64,
    pub theoretical_entry: f64,
    pub entry_fill: Option<FillResult>,
    pub opened_at: f64,
    pub strategy: StrategyTag,
    pub sizing: SizingDecision,
    /// Best price seen since entry, in the side's own frame.
    pub max_favorable_price: f64,
    pub is_open: bool,
    pub flash: Option<FlashMeta>,
    pub exit_price: Option<f64>,
    pub theoretical_exit: Option<f64>,
    pub exit_fill: Option<FillResult>,
    pub exit_reason: Option<ExitReason>,
    pub closed_at: Option<f64>,
    pub realized_pnl: Option<f64>,
}

/// Per-strategy win/loss aggregates feeding the Kelly sizer. Appended once
/// per close, never reset mid-session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StrategyStats {
    pub wins: u32,
    pub losses: u32,
    pub sum_win_pnl: f64,
    pub sum_loss_pnl: f64,
    pub closed_trades: u32,
}

/// Session-level counters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionStats {
    pub wins: u32,
    pub losses: u32,
    pub total: u32,
    pub consecutive_wins: u32,
}

/// Closing-line-value diagnostic, one per close with a settlement estimate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClvSample {
    pub strategy: StrategyTag,
    pub side: Side,
    pub entry_price: f64,
    pub settlement_estimate: f64,
    pub clv: f64,
    pub closed_at: f64,
}

/// A request to close a position, produced by the per-tick exit scan.
#[derive(Debug, Clone)]
pub struct ExitRequest {
    pub position_id: String,
    pub reason: ExitReason,
    /// Exit price in the side's own frame.
    pub exit_price: f64,
}

// ---------------------------------------------------------------------------
// Paper trader
// ---------------------------------------------------------------------------

#[derive(Serialize, Deserialize)]
pub struct PaperTrader {
    pub balance: f64,
    pub initial_balance: f64,
    pub realized_pnl: f64,
    base_trade_size: u32,
    positions: Vec<Position>,
    pub session: SessionStats,
    last_exit_time: Option<f64>,
    last_exit_by_class: HashMap<MarketClass, f64>,
    loss_streak_by_class: HashMap<MarketClass, u32>,
    strategy_stats: HashMap<StrategyTag, StrategyStats>,
    clv_samples: Vec<ClvSample>,
}

impl PaperTrader {
    pub fn new(initial_balance: f64, base_trade_size: u32) -> Self {
        let strategy_stats = StrategyTag::ALL
            .iter()
            .map(|tag| (*tag, StrategyStats::default()))
            .collect();
        Self {
            balance: initial_balance,
            initial_balance,
            realized_pnl: 0.0,
            base_trade_size,
            positions: Vec::new(),
            session: SessionStats::default(),
            last_exit_time: None,
            last_exit_by_class: HashMap::new(),
            loss_streak_by_class: HashMap::new(),
            strategy_stats,
            clv_samples: Vec::new(),
        }
    }

    // -------------------------------------------------------------------------
    // Kelly sizing
    // -------------------------------------------------------------------------

    /// Position size for a strategy: fixed base until the strategy has closed
    /// 20 trades, half-Kelly thereafter.
    ///
    /// ETH short-window contracts trade at half size (choppier market, wider
    /// spreads) — halved first, then floored at the Kelly minimum.
    pub fn kelly_size(&self, strategy: StrategyTag, class: MarketClass) -> SizingDecision {
        let stats = self.strategy_stats.get(&strategy).cloned().unwrap_or_default();
        let total = stats.closed_trades;

        let fixed = |method_trades: u32| SizingDecision {
            method: SizingMethod::Fixed,
            base_size: self.base_trade_size,
            calculated_size: self.base_trade_size,
            strategy_trades: method_trades,
            win_rate: 0.0,
            win_loss_ratio: 0.0,
            kelly_fraction: 0.0,
        };

        let mut decision = if total < KELLY_WARMUP_TRADES || stats.wins == 0 || stats.losses == 0 {
            fixed(total)
        } else {
            let win_rate = stats.wins as f64 / total as f64;
            let avg_win = stats.sum_win_pnl / stats.wins as f64;
            let avg_loss = stats.sum_loss_pnl.abs() / stats.losses as f64;

            if avg_win <= 0.0 || avg_loss <= 0.0 {
                fixed(total)
            } else {
                let b = avg_win / avg_loss;
                let half_kelly = (win_rate - (1.0 - win_rate) / b) / 2.0;
                let size = (half_kelly * 100.0).round();
                let clamped = size.clamp(KELLY_MIN_SIZE as f64, KELLY_MAX_SIZE as f64) as u32;
                SizingDecision {
                    method: SizingMethod::Kelly,
                    base_size: self.base_trade_size,
                    calculated_size: clamped,
                    strategy_trades: total,
                    win_rate,
                    win_loss_ratio: b,
                    kelly_fraction: half_kelly,
                }
            }
        };

        if class == MarketClass::EthShort {
            let halved = ((decision.calculated_size as f64) / 2.0).round() as u32;
            decision.calculated_size = halved.max(KELLY_MIN_SIZE);
        }

        decision
    }

    // -------------------------------------------------------------------------
    // Opening
    // -------------------------------------------------------------------------

    /// Open a position for an approved intent.
    ///
    /// Sizing starts from the Kelly decision, then scales down for partial
    /// multi-timeframe agreement (half) and, for cross-venue entries, low
    /// signal confidence (down to half).
    ///
    /// Entry price comes from walking `depth` when available; otherwise the
    /// intent's limit price stands with zero slippage. Returns `None` when
    /// the cost would exceed the cash balance.
    pub fn open(
        &mut self,
        intent: &EntryIntent,
        depth: Option<&DepthSnapshot>,
        now: f64,
    ) -> Option<String> {
        let sizing = self.kelly_size(intent.strategy, intent.market_class);
        let mut size = sizing.calculated_size as f64;

        if intent.mtf_ratio < 1.0 {
            size = (size / 2.0).round().max(KELLY_MIN_SIZE as f64);
            debug!(strategy = %intent.strategy, mtf = intent.mtf_ratio, size, "partial MTF alignment — size halved");
        }
        if intent.strategy == StrategyTag::CrossVenueLead && intent.confidence < 1.0 {
            let scale = intent.confidence.min(intent.mtf_ratio).max(0.5);
            size = (size * scale).round().max(KELLY_MIN_SIZE as f64);
        }

        let entry_fill = depth.and_then(|d| simulate_entry(d, intent.side, size));
        let entry_price = match &entry_fill {
            Some(fill) if fill.vwap > 0.0 => fill.vwap,
            _ => intent.limit_price,
        };

        let cost = size * entry_price;
        if cost > self.balance {
            info!(
                ticker = %intent.ticker,
                cost,
                balance = self.balance,
                "entry rejected: insufficient funds"
            );
            return None;
        }

        let id = Uuid::new_v4().to_string();
        let position = Position {
            id: id.clone(),
            ticker: intent.ticker.clone(),
            market_class: intent.market_class,
            side: intent.side,
            size,
            entry_price,
            theoretical_entry: intent.limit_price,
            entry_fill,
            opened_at: now,
            strategy: intent.strategy,
            sizing,
            max_favorable_price: entry_price,
            is_open: true,
            flash: intent.flash,
            exit_price: None,
            theoretical_exit: None,
            exit_fill: None,
            exit_reason: None,
            closed_at: None,
            realized_pnl: None,
        };

        self.balance -= cost;
        info!(
            id = %id,
            ticker = %intent.ticker,
            class = %intent.market_class,
            side = %intent.side,
            strategy = %intent.strategy,
            size,
            entry_price,
            balance = self.balance,
            "position opened"
        );
        self.positions.push(position);
        Some(id)
    }

    // -------------------------------------------------------------------------
    // Per-tick management
    // -------------------------------------------------------------------------

    /// Update favorable-price tracking for every open position on `class` and
    /// collect the exits due this tick.
    ///
    /// `stop_dollar` maps a position to its adaptive hard-stop distance;
    /// `underlying_price` feeds the flash sniper's adverse-move stop.
    pub fn manage_tick(
        &mut self,
        class: MarketClass,
        book: &BookTop,
        underlying_price: Option<f64>,
        stop_dollar: &dyn Fn(&Position) -> f64,
        now: f64,
    ) -> Vec<ExitRequest> {
        let mut exits = Vec::new();

        for pos in self
            .positions
            .iter_mut()
            .filter(|p| p.is_open && p.market_class == class)
        {
            // Current value in the side's own frame.
            let current = match pos.side {
                Side::Yes => book.yes_bid,
                Side::No => 1.0 - book.yes_ask,
            };
            if current <= 0.0 {
                continue;
            }
            pos.max_favorable_price = pos.max_favorable_price.max(current);

            let hold_secs = now - pos.opened_at;

            if let Some(flash) = pos.flash {
                // Flash sniper runs its own exit set.
                if current >= flash.recovery_target {
                    exits.push(ExitRequest {
                        position_id: pos.id.clone(),
                        reason: ExitReason::RecoveryTarget,
                        exit_price: current,
                    });
                } else if pos.entry_price - current >= pos.entry_price * FLASH_STOP_FRACTION {
                    exits.push(ExitRequest {
                        position_id: pos.id.clone(),
                        reason: ExitReason::HardStop,
                        exit_price: current,
                    });
                } else if let Some(underlying) = underlying_price {
                    let moved_pct = if flash.underlying_at_entry > 0.0 {
                        (underlying - flash.underlying_at_entry) / flash.underlying_at_entry
                            * 100.0
                    } else {
                        0.0
                    };
                    if moved_pct < -FLASH_UNDERLYING_ADVERSE_PCT {
                        exits.push(ExitRequest {
                            position_id: pos.id.clone(),
                            reason: ExitReason::UnderlyingAdverse,
                            exit_price: current,
                        });
                    } else if hold_secs > TIMEOUT_SECS_FLASH {
                        exits.push(ExitRequest {
                            position_id: pos.id.clone(),
                            reason: ExitReason::Timeout,
                            exit_price: current,
                        });
                    }
                } else if hold_secs > TIMEOUT_SECS_FLASH {
                    exits.push(ExitRequest {
                        position_id: pos.id.clone(),
                        reason: ExitReason::Timeout,
                        exit_price: current,
                    });
                }
                continue;
            }

            let is_steam = pos.strategy == StrategyTag::SteamFollow;
            let (arm, distance) = if is_steam {
                (TRAIL_ARM_STEAM, TRAIL_DISTANCE_STEAM)
            } else {
                (TRAIL_ARM, TRAIL_DISTANCE)
            };

            let max_profit = pos.max_favorable_price - pos.entry_price;
            let pullback = pos.max_favorable_price - current;

            if max_profit >= arm && pullback >= distance {
                exits.push(ExitRequest {
                    position_id: pos.id.clone(),
                    reason: ExitReason::TrailingStop,
                    exit_price: current,
                });
                continue;
            }

            if pos.entry_price - current >= stop_dollar(pos) {
                exits.push(ExitRequest {
                    position_id: pos.id.clone(),
                    reason: ExitReason::HardStop,
                    exit_price: current,
                });
                continue;
            }

            let timeout = if pos.strategy == StrategyTag::SettlementRush {
                TIMEOUT_SECS_SETTLEMENT
            } else {
                TIMEOUT_SECS
            };
            if hold_secs > timeout {
                exits.push(ExitRequest {
                    position_id: pos.id.clone(),
                    reason: ExitReason::Timeout,
                    exit_price: current,
                });
            }
        }

        exits
    }

    // -------------------------------------------------------------------------
    // Closing
    // -------------------------------------------------------------------------

    /// Close an open position. Returns the realised P&L, or `None` if no
    /// matching open position exists (a position closes exactly once).
    pub fn close(
        &mut self,
        position_id: &str,
        theoretical_exit: f64,
        depth: Option<&DepthSnapshot>,
        reason: ExitReason,
        settlement_estimate: Option<f64>,
        now: f64,
    ) -> Option<f64> {
        let pos = self
            .positions
            .iter_mut()
            .find(|p| p.id == position_id && p.is_open)?;

        let exit_fill = depth.and_then(|d| simulate_exit(d, pos.side, pos.size));
        let exit_price = match &exit_fill {
            Some(fill) if fill.vwap > 0.0 => fill.vwap,
            _ => theoretical_exit,
        };

        // Same formula for both sides: fills are already side-framed.
        let pnl = (exit_price - pos.entry_price) * pos.size;

        pos.exit_price = Some(exit_price);
        pos.theoretical_exit = Some(theoretical_exit);
        pos.exit_fill = exit_fill;
        pos.exit_reason = Some(reason);
        pos.closed_at = Some(now);
        pos.realized_pnl = Some(pnl);
        pos.is_open = false;

        let proceeds = pos.size * exit_price;
        let class = pos.market_class;
        let strategy = pos.strategy;
        let side = pos.side;
        let entry_price = pos.entry_price;
        let ticker = pos.ticker.clone();

        self.balance += proceeds;
        self.realized_pnl += pnl;

        // Session + cooldown state.
        self.session.total += 1;
        if pnl > 0.0 {
            self.session.wins += 1;
            self.session.consecutive_wins += 1;
            self.loss_streak_by_class.insert(class, 0);
        } else {
            self.session.losses += 1;
            self.session.consecutive_wins = 0;
            *self.loss_streak_by_class.entry(class).or_insert(0) += 1;
        }
        self.last_exit_time = Some(now);
        self.last_exit_by_class.insert(class, now);

        // Kelly statistics: appended once per close, never edited.
        let stats = self.strategy_stats.entry(strategy).or_default();
        stats.closed_trades += 1;
        if pnl > 0.0 {
            stats.wins += 1;
            stats.sum_win_pnl += pnl;
        } else {
            stats.losses += 1;
            stats.sum_loss_pnl += pnl;
        }

        if let Some(settlement) = settlement_estimate {
            let clv = match side {
                Side::Yes => settlement - entry_price,
                Side::No => (1.0 - settlement) - entry_price,
            };
            self.clv_samples.push(ClvSample {
                strategy,
                side,
                entry_price,
                settlement_estimate: settlement,
                clv,
                closed_at: now,
            });
        }

        info!(
            id = %position_id,
            ticker = %ticker,
            class = %class,
            strategy = %strategy,
            reason = %reason,
            exit_price,
            pnl,
            total_pnl = self.realized_pnl,
            balance = self.balance,
            "position closed"
        );

        Some(pnl)
    }

    /// Settle every open position on `class` at a fair-value estimate —
    /// called when the poller rolls to a new ticker while positions from the
    /// old one are still open. Never leaves zombie positions behind.
    ///
    /// Returns the realised P&L per settled position.
    pub fn settle_class(
        &mut self,
        class: MarketClass,
        fair_value_yes: f64,
        now: f64,
    ) -> Vec<(String, f64)> {
        let ids: Vec<String> = self
            .positions
            .iter()
            .filter(|p| p.is_open && p.market_class == class)
            .map(|p| p.id.clone())
            .collect();

        let mut settled = Vec::new();
        for id in ids {
            let side = self
                .positions
                .iter()
                .find(|p| p.id == id)
                .map(|p| p.side)
                .unwrap_or(Side::Yes);
            let exit = match side {
                Side::Yes => fair_value_yes,
                Side::No => 1.0 - fair_value_yes,
            };
            if let Some(pnl) = self.close(
                &id,
                exit,
                None,
                ExitReason::Settlement,
                Some(fair_value_yes),
                now,
            ) {
                settled.push((id, pnl));
            }
        }
        settled
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    pub fn open_positions(&self) -> impl Iterator<Item = &Position> {
        self.positions.iter().filter(|p| p.is_open)
    }

    pub fn open_positions_on(&self, class: MarketClass) -> Vec<&Position> {
        self.positions
            .iter()
            .filter(|p| p.is_open && p.market_class == class)
            .collect()
    }

    pub fn has_open(&self, class: MarketClass, strategy: StrategyTag) -> bool {
        self.positions
            .iter()
            .any(|p| p.is_open && p.market_class == class && p.strategy == strategy)
    }

    pub fn position(&self, id: &str) -> Option<&Position> {
        self.positions.iter().find(|p| p.id == id)
    }

    /// Closed trades, oldest first.
    pub fn closed_trades(&self) -> impl Iterator<Item = &Position> {
        self.positions.iter().filter(|p| !p.is_open)
    }

    pub fn strategy_stats(&self) -> &HashMap<StrategyTag, StrategyStats> {
        &self.strategy_stats
    }

    pub fn clv_samples(&self) -> &[ClvSample] {
        &self.clv_samples
    }

    pub fn secs_since_any_exit(&self, now: f64) -> Option<f64> {
        self.last_exit_time.map(|t| now - t)
    }

    pub fn secs_since_class_exit(&self, class: MarketClass, now: f64) -> Option<f64> {
        self.last_exit_by_class.get(&class).map(|t| now - t)
    }

    pub fn loss_streak(&self, class: MarketClass) -> u32 {
        self.loss_streak_by_class.get(&class).copied().unwrap_or(0)
    }

    /// Test hook for warm-starting strategy statistics.
    #[cfg(test)]
    pub fn set_strategy_stats(&mut self, strategy: StrategyTag, stats: StrategyStats) {
        self.strategy_stats.insert(strategy, stats);
    }
}
