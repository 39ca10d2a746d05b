// =============================================================================
// Flash Crash Detector — abrupt book-only drops in a contract's bid
// =============================================================================
//
// A flash crash is a bid collapsing without the underlying moving: someone
// pulled liquidity or fat-fingered the book, and the price should snap back.
// Per market class we keep a short ring of (time, bid) samples and declare a
// crash when, within the last 10 seconds, the bid sits more than 15% below
// the window maximum.
//
// Only short-window classes feed this detector — daily classes swap their
// at-the-money contract often enough to fake crashes.
// =============================================================================

use std::collections::{HashMap, VecDeque};

use serde::Serialize;

use crate::types::MarketClass;

/// Bid samples retained per class.
const MAX_SAMPLES: usize = 30;
/// Sliding window the drop is measured over.
const WINDOW_SECS: f64 = 10.0;
/// Fractional drop from the window maximum that declares a crash.
const DROP_THRESHOLD: f64 = 0.15;

/// A detected crash, kept for the checkpoint's signal list.
#[derive(Debug, Clone, Serialize)]
pub struct FlashCrashEvent {
    pub market_class: MarketClass,
    pub max_bid: f64,
    pub current_bid: f64,
    pub drop_pct: f64,
    pub at: f64,
}

/// Per-class bid history and crash log.
pub struct FlashCrashDetector {
    history: HashMap<MarketClass, VecDeque<(f64, f64)>>,
    crashes: Vec<FlashCrashEvent>,
}

impl FlashCrashDetector {
    pub fn new() -> Self {
        Self {
            history: HashMap::new(),
            crashes: Vec::new(),
        }
    }

    /// Record a bid sample for the class.
    pub fn update_bid(&mut self, class: MarketClass, bid: f64, now: f64) {
        let ring = self.history.entry(class).or_default();
        ring.push_back((now, bid));
        while ring.len() > MAX_SAMPLES {
            ring.pop_front();
        }
    }

    /// Check for a crash: `current_bid` more than 15% below the maximum bid
    /// seen in the last 10 seconds. Records and returns the event when it
    /// fires.
    pub fn detect(
        &mut self,
        class: MarketClass,
        current_bid: f64,
        now: f64,
    ) -> Option<FlashCrashEvent> {
        let ring = self.history.get(&class)?;
        if ring.len() < 2 {
            return None;
        }

        let cutoff = now - WINDOW_SECS;
        let max_bid = ring
            .iter()
            .filter(|(t, _)| *t >= cutoff)
            .map(|(_, b)| *b)
            .fold(f64::NEG_INFINITY, f64::max);
        if !max_bid.is_finite() || max_bid <= 0.0 {
            return None;
        }

        let drop_pct = (max_bid - current_bid) / max_bid;
        if drop_pct <= DROP_THRESHOLD {
            return None;
        }

        let event = FlashCrashEvent {
            market_class: class,
            max_bid,
            current_bid,
            drop_pct,
            at: now,
        };
        self.crashes.push(event.clone());
        Some(event)
    }

    /// Bid in force at the start of the 10 s window — the "pre-crash" price
    /// the sniper aims to recover toward. Falls back to an estimate derived
    /// from the drop itself when the window has no samples.
    pub fn pre_crash_price(&self, class: MarketClass, current_bid: f64, drop_pct: f64, now: f64) -> f64 {
        let cutoff = now - WINDOW_SECS;
        self.history
            .get(&class)
            .and_then(|ring| ring.iter().find(|(t, _)| *t >= cutoff).map(|(_, b)| *b))
            .unwrap_or(current_bid + drop_pct * current_bid)
    }

    /// All crashes recorded this session.
    pub fn crashes(&self) -> &[FlashCrashEvent] {
        &self.crashes
    }
}

impl Default for FlashCrashDetector {
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

    #[test]
    fn no_crash_without_history() {
        let mut d = FlashCrashDetector::new();
        assert!(d.detect(MarketClass::BtcShort, 0.50, 100.0).is_none());
    }

    #[test]
    fn crash_fires_above_threshold() {
        let mut d = FlashCrashDetector::new();
        d.update_bid(MarketClass::BtcShort, 0.80, 95.0);
        d.update_bid(MarketClass::BtcShort, 0.65, 99.0);
        // drop = (0.80 - 0.65) / 0.80 = 0.1875 > 0.15
        let event = d.detect(MarketClass::BtcShort, 0.65, 100.0).unwrap();
        assert!((event.drop_pct - 0.1875).abs() < 1e-9);
        assert!((event.max_bid - 0.80).abs() < 1e-9);
        assert_eq!(d.crashes().len(), 1);
    }

    #[test]
    fn drop_at_threshold_does_not_fire() {
        let mut d = FlashCrashDetector::new();
        d.update_bid(MarketClass::BtcShort, 1.00, 95.0);
        d.update_bid(MarketClass::BtcShort, 0.85, 99.0);
        // Exactly 15% — not strictly greater.
        assert!(d.detect(MarketClass::BtcShort, 0.85, 100.0).is_none());
    }

    #[test]
    fn old_highs_outside_window_are_ignored() {
        let mut d = FlashCrashDetector::new();
        d.update_bid(MarketClass::BtcShort, 0.90, 50.0); // 50 s ago
        d.update_bid(MarketClass::BtcShort, 0.62, 95.0);
        d.update_bid(MarketClass::BtcShort, 0.60, 99.0);
        // Window max is 0.62, drop from it is ~3% — no crash.
        assert!(d.detect(MarketClass::BtcShort, 0.60, 100.0).is_none());
    }

    #[test]
    fn classes_do_not_cross_contaminate() {
        let mut d = FlashCrashDetector::new();
        d.update_bid(MarketClass::BtcShort, 0.80, 95.0);
        d.update_bid(MarketClass::BtcShort, 0.60, 99.0);
        assert!(d.detect(MarketClass::EthShort, 0.60, 100.0).is_none());
    }

    #[test]
    fn pre_crash_price_uses_window_start() {
        let mut d = FlashCrashDetector::new();
        d.update_bid(MarketClass::BtcShort, 0.75, 92.0);
        d.update_bid(MarketClass::BtcShort, 0.73, 96.0);
        d.update_bid(MarketClass::BtcShort, 0.60, 99.0);
        let pre = d.pre_crash_price(MarketClass::BtcShort, 0.60, 0.20, 100.0);
        assert!((pre - 0.75).abs() < 1e-9);
    }

    #[test]
    fn pre_crash_price_estimates_when_window_empty() {
        let d = FlashCrashDetector::new();
        let pre = d.pre_crash_price(MarketClass::BtcShort, 0.60, 0.20, 100.0);
        assert!((pre - (0.60 + 0.20 * 0.60)).abs() < 1e-9);
    }

    #[test]
    fn ring_is_bounded() {
        let mut d = FlashCrashDetector::new();
        for i in 0..100 {
            d.update_bid(MarketClass::BtcShort, 0.5, i as f64);
        }
        assert!(d.history.get(&MarketClass::BtcShort).unwrap().len() <= MAX_SAMPLES);
    }
}
