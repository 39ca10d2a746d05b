// =============================================================================
// Technical Indicators Module
// =============================================================================
//
// Pure, side-effect-free implementations of the core technical indicators used
// by the trading engine.  Every public function returns `Option<T>` so callers
// are forced to handle insufficient-data and numerical-edge-case scenarios.
//
// `engine` holds the per-asset candle builder that feeds these functions on
// every 1-minute candle close.

pub mod atr;
pub mod bollinger;
pub mod ema;
pub mod engine;
pub mod rsi;

pub use engine::{Candle, EmaTrend, IndicatorEngine, IndicatorSnapshot};
