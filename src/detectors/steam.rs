// =============================================================================
// Steam Detector — abrupt contract price moves backed by abnormal volume
// =============================================================================
//
// "Steam" is the book moving because informed money is hitting it. Per ticker
// we keep five minutes of (time, yes_bid) and (time, cumulative volume)
// history and declare a steam move when:
//
//   * the price jumped more than 3¢ within 60 s AND last-minute volume ran
//     above 3× the average per-minute volume, or
//   * the price alone moved at least 6¢ within 60 s.
//
// Direction is the sign of the price move. History is flushed on market
// transitions so the old contract's prices can't fake a jump on the new one.
// =============================================================================

use std::collections::{HashMap, VecDeque};

/// Seconds of history retained per ticker.
const HISTORY_SECS: f64 = 300.0;
/// Price jump within 60 s that arms the detector (3¢).
const PRICE_JUMP: f64 = 0.03;
/// Price jump that fires without volume confirmation (6¢).
const PRICE_JUMP_ALONE: f64 = 0.06;
/// Last-minute volume multiple over the per-minute average.
const VOLUME_SPIKE_RATIO: f64 = 3.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SteamKind {
    PriceAndVolume,
    PriceAlone,
}

/// Result of a steam query.
#[derive(Debug, Clone, Copy)]
pub struct SteamStatus {
    pub detected: bool,
    pub kind: Option<SteamKind>,
    /// Price move over the last 60 s, dollars (0.03 = 3¢).
    pub price_move: f64,
    /// Last-minute volume over the per-minute average.
    pub volume_spike_ratio: f64,
    /// +1 price up, −1 price down; None when not detected.
    pub direction: Option<i8>,
}

impl SteamStatus {
    fn quiet() -> Self {
        Self {
            detected: false,
            kind: None,
            price_move: 0.0,
            volume_spike_ratio: 0.0,
            direction: None,
        }
    }
}

/// Per-ticker price and volume history.
pub struct SteamDetector {
    prices: HashMap<String, VecDeque<(f64, f64)>>,
    volumes: HashMap<String, VecDeque<(f64, f64)>>,
}

impl SteamDetector {
    pub fn new() -> Self {
        Self {
            prices: HashMap::new(),
            volumes: HashMap::new(),
        }
    }

    /// Record the current book top for a ticker.
    pub fn update(&mut self, ticker: &str, yes_bid: f64, cumulative_volume: f64, now: f64) {
        let cutoff = now - HISTORY_SECS;

        let prices = self.prices.entry(ticker.to_string()).or_default();
        prices.push_back((now, yes_bid));
        while prices.front().map_or(false, |(t, _)| *t < cutoff) {
            prices.pop_front();
        }

        let volumes = self.volumes.entry(ticker.to_string()).or_default();
        volumes.push_back((now, cumulative_volume));
        while volumes.front().map_or(false, |(t, _)| *t < cutoff) {
            volumes.pop_front();
        }
    }

    /// Flush all history — called on market transitions.
    pub fn clear(&mut self) {
        self.prices.clear();
        self.volumes.clear();
    }

    /// Evaluate steam for a ticker at `now`.
    pub fn detect(&self, ticker: &str, now: f64) -> SteamStatus {
        let Some(prices) = self.prices.get(ticker) else {
            return SteamStatus::quiet();
        };
        if prices.len() < 2 {
            return SteamStatus::quiet();
        }

        // Price move over the last 60 s: current vs the oldest sample inside
        // the window.
        let cutoff_60 = now - 60.0;
        let price_60s_ago = prices
            .iter()
            .find(|(t, _)| *t >= cutoff_60)
            .map(|(_, p)| *p);
        let current = prices.back().map(|(_, p)| *p).unwrap_or(0.0);

        let (price_move, signed_move) = match price_60s_ago {
            Some(old) => ((current - old).abs(), current - old),
            None => (0.0, 0.0),
        };
        let price_jumped = price_move > PRICE_JUMP;

        // Volume spike: last-minute traded volume vs the per-minute average
        // over the retained window. Volume is cumulative, so both are deltas.
        let volume_spike_ratio = self
            .volumes
            .get(ticker)
            .and_then(|volumes| {
                let latest = volumes.back()?.1;
                let at_minute_start = volumes.iter().find(|(t, _)| *t >= cutoff_60)?.1;
                let window_start = volumes.front()?;
                let window_span_min = ((now - window_start.0) / 60.0).max(1.0);
                let avg_per_minute = (latest - window_start.1) / window_span_min;
                if avg_per_minute <= 0.0 {
                    return None;
                }
                Some((latest - at_minute_start) / avg_per_minute)
            })
            .unwrap_or(0.0);
        let volume_spiked = volume_spike_ratio > VOLUME_SPIKE_RATIO;

        let kind = if price_jumped && price_move >= PRICE_JUMP_ALONE {
            Some(SteamKind::PriceAlone)
        } else if price_jumped && volume_spiked {
            Some(SteamKind::PriceAndVolume)
        } else {
            None
        };

        match kind {
            Some(kind) => SteamStatus {
                detected: true,
                kind: Some(kind),
                price_move,
                volume_spike_ratio,
                direction: Some(if signed_move > 0.0 { 1 } else { -1 }),
            },
            None => SteamStatus {
                detected: false,
                kind: None,
                price_move,
                volume_spike_ratio,
                direction: None,
            },
        }
    }
}

impl Default for SteamDetector {
    fn default() -> Self {
        Self::new()
    }
}
