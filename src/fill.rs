// =============================================================================
// Fill Simulator — VWAP book-walks with partial-fill semantics
// =============================================================================
//
// Paper executions consume a depth snapshot level by level and report the
// volume-weighted average price actually paid, so simulated results carry the
// same slippage a live order would. Prices come out in the position side's
// own frame of reference: a NO fill at 0.58 means 58¢ per NO contract. That
// normalisation is what lets P&L use one formula for both sides.
//
//   buy  YES → walk YES asks ascending          (price = level price)
//   buy  NO  → walk YES bids descending         (price = 1 − level price)
//   sell YES → walk YES bids descending         (price = level price)
//   sell NO  → walk YES asks ascending          (price = 1 − level price)
//
// When the walker runs out of depth before the order is filled, the fill is
// marked partial and the VWAP covers what was actually consumed. When the
// relevant side is empty the caller falls back to the quoted price with zero
// slippage.
// =============================================================================

use serde::{Deserialize, Serialize};

use crate::feeds::orderbook::DepthSnapshot;
use crate::types::Side;

/// Outcome of walking the book for one order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FillResult {
    /// Volume-weighted average price in the side's own frame.
    pub vwap: f64,
    pub levels_consumed: usize,
    /// VWAP minus the top-of-book reference (first level walked).
    pub slippage: f64,
    /// True when depth ran out before `desired_size` was filled.
    pub partial: bool,
    pub filled_size: f64,
}

/// Simulate an opening fill.
pub fn simulate_entry(depth: &DepthSnapshot, side: Side, desired_size: f64) -> Option<FillResult> {
    match side {
        // Buying YES lifts the asks.
        Side::Yes => walk(depth.no_levels.iter().map(|l| (l.price, l.size)), desired_size),
        // Buying NO hits the YES bids; each level is 1 − bid in NO frame.
        Side::No => walk(
            depth.yes_levels.iter().map(|l| (1.0 - l.price, l.size)),
            desired_size,
        ),
    }
}

/// Simulate a closing fill — the mirror of [`simulate_entry`].
pub fn simulate_exit(depth: &DepthSnapshot, side: Side, desired_size: f64) -> Option<FillResult> {
    match side {
        // Selling YES hits the bids.
        Side::Yes => walk(depth.yes_levels.iter().map(|l| (l.price, l.size)), desired_size),
        // Selling NO lifts the YES asks; each level is 1 − ask in NO frame.
        Side::No => walk(
            depth.no_levels.iter().map(|l| (1.0 - l.price, l.size)),
            desired_size,
        ),
    }
}

/// Consume levels in order, accumulating VWAP until `desired_size` is filled
/// or the book runs dry.
fn walk(levels: impl Iterator<Item = (f64, f64)>, desired_size: f64) -> Option<FillResult> {
    if desired_size <= 0.0 {
        return None;
    }

    let mut remaining = desired_size;
    let mut cost = 0.0;
    let mut filled = 0.0;
    let mut levels_consumed = 0;
    let mut reference: Option<f64> = None;

    for (price, size) in levels {
        if remaining <= 0.0 {
            break;
        }
        if reference.is_none() {
            reference = Some(price);
        }
        let take = remaining.min(size);
        cost += take * price;
        filled += take;
        remaining -= take;
        levels_consumed += 1;
    }

    if filled <= 0.0 {
        return None;
    }

    let vwap = cost / filled;
    Some(FillResult {
        vwap,
        levels_consumed,
        slippage: vwap - reference.unwrap_or(vwap),
        partial: remaining > 0.0,
        filled_size: filled,
    })
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::feeds::orderbook::DepthLevel;

    fn depth(yes: &[(f64, f64)], no: &[(f64, f64)]) -> DepthSnapshot {
        DepthSnapshot {
            yes_levels: yes.iter().map(|&(price, size)| DepthLevel { price, size }).collect(),
            no_levels: no.iter().map(|&(price, size)| DepthLevel { price, size }).collect(),
            fetched_at: 0.0,
        }
    }

    #[test]
    fn yes_buy_walks_asks_to_vwap() {
        // Asks at (0.55, 5) then (0.57, 10); buying 8 takes 5 + 3.
        let d = depth(&[], &[(0.55, 5.0), (0.57, 10.0)]);
        let fill = simulate_entry(&d, Side::Yes, 8.0).unwrap();
        let expected = (5.0 * 0.55 + 3.0 * 0.57) / 8.0;
        assert!((fill.vwap - expected).abs() < 1e-12);
        assert!((fill.vwap - 0.5575).abs() < 1e-12);
        assert_eq!(fill.levels_consumed, 2);
        assert!(!fill.partial);
        assert!((fill.filled_size - 8.0).abs() < 1e-12);
        assert!((fill.slippage - (0.5575 - 0.55)).abs() < 1e-12);
    }

    #[test]
    fn no_buy_complements_yes_bids() {
        // YES bids descending (0.45, 6), (0.43, 10) → NO asks 0.55 then 0.57.
        let d = depth(&[(0.45, 6.0), (0.43, 10.0)], &[]);
        let fill = simulate_entry(&d, Side::No, 8.0).unwrap();
        let expected = (6.0 * 0.55 + 2.0 * 0.57) / 8.0;
        assert!((fill.vwap - expected).abs() < 1e-12);
        assert!(!fill.partial);
    }

    #[test]
    fn partial_fill_when_depth_exhausted() {
        let d = depth(&[], &[(0.55, 5.0)]);
        let fill = simulate_entry(&d, Side::Yes, 8.0).unwrap();
        assert!(fill.partial);
        assert!((fill.filled_size - 5.0).abs() < 1e-12);
        assert!((fill.vwap - 0.55).abs() < 1e-12);
        assert!(fill.slippage.abs() < 1e-12);
    }

    #[test]
    fn empty_book_returns_none() {
        let d = depth(&[], &[]);
        assert!(simulate_entry(&d, Side::Yes, 5.0).is_none());
        assert!(simulate_entry(&d, Side::No, 5.0).is_none());
        assert!(simulate_exit(&d, Side::Yes, 5.0).is_none());
    }

    #[test]
    fn zero_size_returns_none() {
        let d = depth(&[(0.45, 6.0)], &[(0.55, 5.0)]);
        assert!(simulate_entry(&d, Side::Yes, 0.0).is_none());
    }

    #[test]
    fn yes_exit_hits_bids() {
        // Bids (0.48, 4), (0.46, 10): selling 6 YES takes 4 @ 0.48 + 2 @ 0.46.
        let d = depth(&[(0.48, 4.0), (0.46, 10.0)], &[]);
        let fill = simulate_exit(&d, Side::Yes, 6.0).unwrap();
        let expected = (4.0 * 0.48 + 2.0 * 0.46) / 6.0;
        assert!((fill.vwap - expected).abs() < 1e-12);
        // Exit slippage is negative: we receive less than top of book.
        assert!(fill.slippage < 0.0);
    }

    #[test]
    fn no_exit_complements_asks() {
        // YES asks (0.55, 10): selling NO receives 1 − 0.55 = 0.45.
        let d = depth(&[], &[(0.55, 10.0)]);
        let fill = simulate_exit(&d, Side::No, 5.0).unwrap();
        assert!((fill.vwap - 0.45).abs() < 1e-12);
        assert!(!fill.partial);
    }

    #[test]
    fn single_level_has_zero_slippage() {
        let d = depth(&[], &[(0.55, 100.0)]);
        let fill = simulate_entry(&d, Side::Yes, 10.0).unwrap();
        assert!(fill.slippage.abs() < 1e-12);
        assert_eq!(fill.levels_consumed, 1);
    }

    #[test]
    fn entry_and_exit_round_trip_conserves_value() {
        // Symmetric book: buy YES at asks, sell YES at bids; loss equals the
        // spread plus depth slippage, never a free lunch.
        let d = depth(&[(0.50, 20.0)], &[(0.54, 20.0)]);
        let entry = simulate_entry(&d, Side::Yes, 10.0).unwrap();
        let exit = simulate_exit(&d, Side::Yes, 10.0).unwrap();
        assert!(entry.vwap > exit.vwap);
        assert!(((entry.vwap - exit.vwap) - 0.04).abs() < 1e-12);
    }
}
