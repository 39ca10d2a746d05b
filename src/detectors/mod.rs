// =============================================================================
// Signal Detectors
// =============================================================================
//
// Independent detectors, each fed the raw stream it watches: tick bursts on
// underlying prices, steam on contract book-tops, flash crashes on contract
// bids. The cross-exchange cluster detector lives with the price aggregator
// since it needs per-exchange history.

pub mod flash_crash;
pub mod steam;
pub mod tick_burst;

pub use flash_crash::{FlashCrashDetector, FlashCrashEvent};
pub use steam::{SteamDetector, SteamStatus};
pub use tick_burst::{BurstDirection, BurstStatus, TickBurstDetector};
