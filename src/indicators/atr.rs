// =============================================================================
// Average True Range (ATR)
// =============================================================================
//
// ATR measures market volatility by decomposing the entire range of a bar.
//
// True Range (TR) for each bar:
//   TR = max(H - L, |H - prevClose|, |L - prevClose|)
//
// The engine uses the simple moving average of the last `period` TR values,
// expressed as a fraction of the latest close so it is comparable across
// assets with different price scales (0.0025 = 0.25%).
// =============================================================================

use crate::indicators::engine::Candle;

/// Compute ATR over the last `period` candles as a fraction of the latest
/// close.
///
/// # Returns
/// `None` when:
/// - `period` is zero.
/// - There are fewer than `period + 1` candles (each True Range needs the
///   previous candle's close).
/// - The latest close is non-positive or any value is non-finite.
pub fn calculate_atr(candles: &[Candle], period: usize) -> Option<f64> {
    if period == 0 || candles.len() < period + 1 {
        return None;
    }

    // --- True Range for each consecutive pair --------------------------------
    let mut tr_values: Vec<f64> = Vec::with_capacity(candles.len() - 1);
    for i in 1..candles.len() {
        let high = candles[i].high;
        let low = candles[i].low;
        let prev_close = candles[i - 1].close;

        let hl = high - low;
        let hc = (high - prev_close).abs();
        let lc = (low - prev_close).abs();

        tr_values.push(hl.max(hc).max(lc));
    }

    if tr_values.len() < period {
        return None;
    }

    // --- Mean of the last `period` TR values, as a fraction of close ---------
    let atr: f64 = tr_values[tr_values.len() - period..].iter().sum::<f64>() / period as f64;

    let last_close = candles.last()?.close;
    if last_close <= 0.0 {
        return None;
    }

    let atr_frac = atr / last_close;
    if atr_frac.is_finite() {
        Some(atr_frac)
    } else {
        None
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    /// Build a test candle with the given OHLC values.
    fn candle(open: f64, high: f64, low: f64, close: f64) -> Candle {
        Candle {
            bucket_start: 0,
            open,
            high,
            low,
            close,
            volume: 100.0,
        }
    }

    #[test]
    fn atr_period_zero() {
        let candles = vec![candle(100.0, 105.0, 95.0, 102.0); 20];
        assert!(calculate_atr(&candles, 0).is_none());
    }

    #[test]
    fn atr_insufficient_data() {
        // Need period + 1 = 15 candles for period=14, only have 10.
        let candles = vec![candle(100.0, 105.0, 95.0, 102.0); 10];
        assert!(calculate_atr(&candles, 14).is_none());
    }

    #[test]
    fn atr_exact_minimum_data() {
        // period=3, need 4 candles to get 3 TR values.
        let candles = vec![
            candle(100.0, 102.0, 98.0, 101.0),
            candle(101.0, 104.0, 99.0, 103.0),
            candle(103.0, 106.0, 100.0, 105.0),
            candle(105.0, 108.0, 102.0, 107.0),
        ];
        let atr = calculate_atr(&candles, 3);
        assert!(atr.is_some());
        let val = atr.unwrap();
        assert!(val > 0.0);
        assert!(val.is_finite());
    }

    #[test]
    fn atr_constant_range_is_range_over_close() {
        // All candles range H-L = 10 around close 100 with no drift: every TR
        // is 10, so ATR fraction = 10 / close.
        let candles: Vec<Candle> = (0..30)
            .map(|_| candle(100.0, 105.0, 95.0, 100.0))
            .collect();
        let atr = calculate_atr(&candles, 14).unwrap();
        assert!((atr - 0.10).abs() < 1e-12, "expected 0.10, got {atr}");
    }

    #[test]
    fn atr_true_range_uses_prev_close() {
        // Gap scenario: |H - prevClose| > H - L
        let candles = vec![
            candle(100.0, 105.0, 95.0, 95.0),   // close at low
            candle(110.0, 115.0, 108.0, 112.0), // gap up: |115-95|=20 > 115-108=7
            candle(112.0, 118.0, 110.0, 115.0),
            candle(115.0, 120.0, 113.0, 118.0),
        ];
        let atr = calculate_atr(&candles, 3).unwrap();
        // First TR = 20 (|115-95|): mean of (20, 8, 7) / 118.
        let expected = (20.0 + 8.0 + 7.0) / 3.0 / 118.0;
        assert!((atr - expected).abs() < 1e-12, "got {atr}");
    }

    #[test]
    fn atr_uses_most_recent_window() {
        // Early candles are wild, the last 3 are calm — ATR(3) must only see
        // the calm tail.
        let mut candles = vec![candle(100.0, 150.0, 50.0, 100.0); 5];
        for _ in 0..4 {
            candles.push(candle(100.0, 101.0, 99.0, 100.0));
        }
        let atr = calculate_atr(&candles, 3).unwrap();
        assert!((atr - 0.02).abs() < 1e-12, "expected 0.02, got {atr}");
    }

    #[test]
    fn atr_nan_returns_none() {
        let candles = vec![
            candle(100.0, 105.0, 95.0, 100.0),
            candle(100.0, f64::NAN, 95.0, 100.0),
            candle(100.0, 105.0, 95.0, 100.0),
            candle(100.0, 105.0, 95.0, 100.0),
        ];
        assert!(calculate_atr(&candles, 3).is_none());
    }

    #[test]
    fn atr_zero_close_returns_none() {
        let candles = vec![
            candle(100.0, 105.0, 95.0, 100.0),
            candle(100.0, 105.0, 95.0, 100.0),
            candle(100.0, 105.0, 95.0, 100.0),
            candle(100.0, 105.0, 95.0, 0.0),
        ];
        assert!(calculate_atr(&candles, 3).is_none());
    }
}
