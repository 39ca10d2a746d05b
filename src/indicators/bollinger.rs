// =============================================================================
// Bollinger Bands
// =============================================================================
//
// Bollinger Bands consist of a middle band (SMA), an upper band (SMA + k*σ),
// and a lower band (SMA - k*σ). The bandwidth is the normalised distance:
// bandwidth = (upper - lower) / middle, a fraction.
//
// The bandwidth feeds the squeeze detector: a squeeze is declared when the
// current bandwidth sits below the 20th percentile of its own history.

/// Result of a Bollinger Band calculation.
#[derive(Debug, Clone)]
pub struct BollingerResult {
    pub upper: f64,
    pub middle: f64,
    pub lower: f64,
    pub bandwidth: f64,
}

/// Calculate Bollinger Bands over the trailing `period` closes.
///
/// Returns `Some(BollingerResult)` containing:
/// - `upper`     = SMA + `num_std` * σ
/// - `middle`    = SMA
/// - `lower`     = SMA - `num_std` * σ
/// - `bandwidth` = (upper - lower) / middle
///
/// Returns `None` when:
/// - Fewer than `period` data points.
/// - Middle band is zero (degenerate input).
pub fn calculate_bollinger(closes: &[f64], period: usize, num_std: f64) -> Option<BollingerResult> {
    if period == 0 || closes.len() < period {
        return None;
    }

    let window = &closes[closes.len() - period..];
    let sum: f64 = window.iter().sum();
    let middle = sum / period as f64;

    if middle == 0.0 {
        return None;
    }

    let variance = window.iter().map(|x| (x - middle).powi(2)).sum::<f64>() / period as f64;
    let std_dev = variance.sqrt();

    let upper = middle + num_std * std_dev;
    let lower = middle - num_std * std_dev;
    let bandwidth = (upper - lower) / middle;

    if bandwidth.is_finite() {
        Some(BollingerResult {
            upper,
            middle,
            lower,
            bandwidth,
        })
    } else {
        None
    }
}

/// True when `current` bandwidth is below the 20th percentile of `history`.
///
/// Requires at least 20 samples of history; returns `false` otherwise.
pub fn is_squeeze(current: f64, history: &[f64]) -> bool {
    if history.len() < 20 {
        return false;
    }
    let mut sorted: Vec<f64> = history.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let percentile_20 = sorted[sorted.len() / 5];
    current < percentile_20
}
