// =============================================================================
// Indicator Engine — 1-minute candle builder feeding the pure indicators
// =============================================================================
//
// Consumes consensus price ticks, buckets them into 1-minute OHLCV candles,
// and recomputes the full indicator set every time a candle closes. Bootstraps
// from ~300 historical candles so indicators are live within seconds of
// startup instead of twenty minutes later.
//
// Candle invariant: `bucket_start` is always a multiple of 60.
// =============================================================================

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::indicators::atr::calculate_atr;
use crate::indicators::bollinger::{calculate_bollinger, is_squeeze};
use crate::indicators::ema::latest_ema;
use crate::indicators::rsi::latest_rsi;

/// Closed candles retained for indicator computation.
const MAX_CANDLES: usize = 300;
/// Bandwidth history retained for the squeeze percentile.
const MAX_BANDWIDTH_HISTORY: usize = 100;
/// Minimum closed candles before any indicator is produced.
const MIN_CANDLES: usize = 20;

/// A single 1-minute OHLCV candle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candle {
    /// Bucket start, epoch seconds, aligned to the minute.
    pub bucket_start: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// Relative position of the fast and slow EMA.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmaTrend {
    Bullish,
    Bearish,
    Neutral,
}

impl std::fmt::Display for EmaTrend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bullish => write!(f, "bullish"),
            Self::Bearish => write!(f, "bearish"),
            Self::Neutral => write!(f, "neutral"),
        }
    }
}

/// Point-in-time view of every indicator for one asset. Each value is absent
/// until enough candle history exists.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndicatorSnapshot {
    /// ATR(14) as a fraction of the latest close (0.0025 = 0.25%).
    pub atr: Option<f64>,
    /// RSI(14), Wilder smoothing, in [0, 100].
    pub rsi: Option<f64>,
    pub ema_fast: Option<f64>,
    pub ema_slow: Option<f64>,
    pub ema_trend: EmaTrend,
    pub bb_middle: Option<f64>,
    pub bb_upper: Option<f64>,
    pub bb_lower: Option<f64>,
    pub bb_bandwidth: Option<f64>,
    /// Bandwidth below its own 20th percentile.
    pub bb_squeeze: bool,
}

impl Default for IndicatorSnapshot {
    fn default() -> Self {
        Self {
            atr: None,
            rsi: None,
            ema_fast: None,
            ema_slow: None,
            ema_trend: EmaTrend::Neutral,
            bb_middle: None,
            bb_upper: None,
            bb_lower: None,
            bb_bandwidth: None,
            bb_squeeze: false,
        }
    }
}

/// Per-asset candle builder and indicator cache.
pub struct IndicatorEngine {
    candles: VecDeque<Candle>,
    current: Option<Candle>,
    bandwidth_history: VecDeque<f64>,
    snapshot: IndicatorSnapshot,
    bootstrapped: bool,
}

impl IndicatorEngine {
    pub fn new() -> Self {
        Self {
            candles: VecDeque::with_capacity(MAX_CANDLES + 1),
            current: None,
            bandwidth_history: VecDeque::with_capacity(MAX_BANDWIDTH_HISTORY + 1),
            snapshot: IndicatorSnapshot::default(),
            bootstrapped: false,
        }
    }

    /// Seed candle history from historical rows in the exchange's
    /// `[ts, low, high, open, close, volume]` format, newest first.
    ///
    /// Rows are reversed on insert so the internal ring stays oldest-first.
    pub fn bootstrap(&mut self, rows: &[[f64; 6]]) {
        for row in rows.iter().rev() {
            let ts = row[0] as i64;
            self.push_closed(Candle {
                bucket_start: ts - ts.rem_euclid(60),
                open: row[3],
                high: row[2],
                low: row[1],
                close: row[4],
                volume: row[5],
            });
        }
        self.recompute();
        self.bootstrapped = true;
        info!(candles = self.candles.len(), "indicator history bootstrapped");
    }

    pub fn is_bootstrapped(&self) -> bool {
        self.bootstrapped
    }

    /// Feed one consensus price tick at `now` (epoch seconds).
    ///
    /// Extends the current 1-minute candle, or closes it and starts a new one
    /// when the minute rolls; indicators recompute on every close.
    pub fn add_price(&mut self, price: f64, volume: f64, now: f64) {
        let bucket = {
            let secs = now as i64;
            secs - secs.rem_euclid(60)
        };

        match &mut self.current {
            Some(candle) if candle.bucket_start == bucket => {
                candle.high = candle.high.max(price);
                candle.low = candle.low.min(price);
                candle.close = price;
                candle.volume += volume;
            }
            _ => {
                if let Some(done) = self.current.take() {
                    self.push_closed(done);
                    self.recompute();
                }
                self.current = Some(Candle {
                    bucket_start: bucket,
                    open: price,
                    high: price,
                    low: price,
                    close: price,
                    volume,
                });
            }
        }
    }

    fn push_closed(&mut self, candle: Candle) {
        self.candles.push_back(candle);
        while self.candles.len() > MAX_CANDLES {
            self.candles.pop_front();
        }
    }

    /// Recompute every indicator over the closed-candle ring.
    fn recompute(&mut self) {
        if self.candles.len() < MIN_CANDLES {
            return;
        }

        let candles: Vec<Candle> = self.candles.iter().cloned().collect();
        let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();

        let atr = calculate_atr(&candles, 14);
        let rsi = latest_rsi(&closes, 14);
        let ema_fast = latest_ema(&closes, 5);
        let ema_slow = latest_ema(&closes, 20);

        let ema_trend = match (ema_fast, ema_slow) {
            (Some(f), Some(s)) if f > s => EmaTrend::Bullish,
            (Some(f), Some(s)) if f < s => EmaTrend::Bearish,
            _ => EmaTrend::Neutral,
        };

        let bb = calculate_bollinger(&closes, 20, 2.0);
        let (bb_middle, bb_upper, bb_lower, bb_bandwidth) = match &bb {
            Some(b) => (Some(b.middle), Some(b.upper), Some(b.lower), Some(b.bandwidth)),
            None => (None, None, None, None),
        };

        if let Some(bw) = bb_bandwidth {
            self.bandwidth_history.push_back(bw);
            while self.bandwidth_history.len() > MAX_BANDWIDTH_HISTORY {
                self.bandwidth_history.pop_front();
            }
        }

        let bb_squeeze = match bb_bandwidth {
            Some(bw) => {
                let history: Vec<f64> = self.bandwidth_history.iter().copied().collect();
                is_squeeze(bw, &history)
            }
            None => false,
        };

        self.snapshot = IndicatorSnapshot {
            atr,
            rsi,
            ema_fast,
            ema_slow,
            ema_trend,
            bb_middle,
            bb_upper,
            bb_lower,
            bb_bandwidth,
            bb_squeeze,
        };
    }

    pub fn snapshot(&self) -> IndicatorSnapshot {
        self.snapshot.clone()
    }

    pub fn atr(&self) -> Option<f64> {
        self.snapshot.atr
    }

    pub fn rsi(&self) -> Option<f64> {
        self.snapshot.rsi
    }

    pub fn ema_trend(&self) -> EmaTrend {
        self.snapshot.ema_trend
    }

    pub fn closed_candle_count(&self) -> usize {
        self.candles.len()
    }
}

impl Default for IndicatorEngine {
    fn default() -> Self {
        Self::new()
    }
}
