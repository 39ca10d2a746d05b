// =============================================================================
// Shared types used across the Vega trading engine
// =============================================================================

use serde::{Deserialize, Serialize};

/// Underlying asset tracked by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Asset {
    Btc,
    Eth,
}

impl std::fmt::Display for Asset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Btc => write!(f, "BTC"),
            Self::Eth => write!(f, "ETH"),
        }
    }
}

/// Which side of a binary contract a position is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Yes,
    No,
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Yes => write!(f, "YES"),
            Self::No => write!(f, "NO"),
        }
    }
}

/// A contract series tracked by the engine. Each class has exactly one
/// "focus" contract at any time — the book-top currently being traded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MarketClass {
    BtcShort,
    BtcDaily,
    EthShort,
    EthDaily,
}

impl MarketClass {
    /// All classes in evaluation order.
    pub const ALL: [MarketClass; 4] = [
        Self::BtcShort,
        Self::BtcDaily,
        Self::EthShort,
        Self::EthDaily,
    ];

    /// The venue series ticker this class subscribes to.
    pub fn series_ticker(&self) -> &'static str {
        match self {
            Self::BtcShort => "KXBTC15M",
            Self::BtcDaily => "KXBTCD",
            Self::EthShort => "KXETH15M",
            Self::EthDaily => "KXETHD",
        }
    }

    /// The underlying asset this class settles against.
    pub fn asset(&self) -> Asset {
        match self {
            Self::BtcShort | Self::BtcDaily => Asset::Btc,
            Self::EthShort | Self::EthDaily => Asset::Eth,
        }
    }

    /// Short-window classes settle every few minutes; daily classes once a day.
    pub fn is_short_window(&self) -> bool {
        matches!(self, Self::BtcShort | Self::EthShort)
    }

    /// Classify a contract ticker by its series prefix.
    ///
    /// Longer prefixes are matched first so `KXBTC15M-...` does not match
    /// the `KXBTCD` daily series.
    pub fn from_ticker(ticker: &str) -> Option<MarketClass> {
        if ticker.contains("KXBTC15M") {
            Some(Self::BtcShort)
        } else if ticker.contains("KXETH15M") {
            Some(Self::EthShort)
        } else if ticker.contains("KXBTCD") {
            Some(Self::BtcDaily)
        } else if ticker.contains("KXETHD") {
            Some(Self::EthDaily)
        } else {
            None
        }
    }
}

impl std::fmt::Display for MarketClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BtcShort => write!(f, "BTC_15M"),
            Self::BtcDaily => write!(f, "BTC_DAILY"),
            Self::EthShort => write!(f, "ETH_15M"),
            Self::EthDaily => write!(f, "ETH_DAILY"),
        }
    }
}

/// Identifies which strategy produced an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyTag {
    FlashSniper,
    CrossVenueLead,
    SettlementRush,
    SteamFollow,
    TickBurst,
    MomentumCluster,
    OrderbookImbalance,
    DelayArb,
}

impl StrategyTag {
    /// All strategies that keep Kelly statistics.
    pub const ALL: [StrategyTag; 8] = [
        Self::FlashSniper,
        Self::CrossVenueLead,
        Self::SettlementRush,
        Self::SteamFollow,
        Self::TickBurst,
        Self::MomentumCluster,
        Self::OrderbookImbalance,
        Self::DelayArb,
    ];
}

impl std::fmt::Display for StrategyTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::FlashSniper => write!(f, "flash_sniper"),
            Self::CrossVenueLead => write!(f, "cross_venue_lead"),
            Self::SettlementRush => write!(f, "settlement_rush"),
            Self::SteamFollow => write!(f, "steam_follow"),
            Self::TickBurst => write!(f, "tick_burst"),
            Self::MomentumCluster => write!(f, "momentum_cluster"),
            Self::OrderbookImbalance => write!(f, "orderbook_imbalance"),
            Self::DelayArb => write!(f, "delay_arb"),
        }
    }
}

/// Why a position was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    RecoveryTarget,
    TrailingStop,
    HardStop,
    UnderlyingAdverse,
    Timeout,
    Settlement,
    SessionEnd,
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RecoveryTarget => write!(f, "RECOVERY_TARGET"),
            Self::TrailingStop => write!(f, "TRAIL"),
            Self::HardStop => write!(f, "STOP"),
            Self::UnderlyingAdverse => write!(f, "UNDERLYING_ADVERSE"),
            Self::Timeout => write!(f, "TIMEOUT"),
            Self::Settlement => write!(f, "SETTLEMENT"),
            Self::SessionEnd => write!(f, "SESSION_END"),
        }
    }
}

/// How the size of a position was decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SizingMethod {
    Fixed,
    Kelly,
}

impl std::fmt::Display for SizingMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Fixed => write!(f, "fixed"),
            Self::Kelly => write!(f, "kelly"),
        }
    }
}

/// Top of book for one contract. All prices are dollar fractions in [0, 1];
/// the ingestion layer converts the venue's integer cents before anything
/// else sees them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookTop {
    pub ticker: String,
    pub yes_bid: f64,
    pub yes_ask: f64,
    /// Cumulative contract volume.
    pub volume: f64,
    /// Venue close time, ISO-8601.
    pub close_time: Option<String>,
    pub series: String,
    /// Epoch seconds when this top was captured.
    pub captured_at: f64,
}

impl BookTop {
    pub fn mid(&self) -> f64 {
        (self.yes_bid + self.yes_ask) / 2.0
    }

    pub fn spread(&self) -> f64 {
        self.yes_ask - self.yes_bid
    }

    /// NO-side quotes are the complement of the YES side.
    pub fn no_bid(&self) -> f64 {
        1.0 - self.yes_ask
    }

    pub fn no_ask(&self) -> f64 {
        1.0 - self.yes_bid
    }

    /// Strike price parsed from the ticker suffix
    /// (format: `KXBTCD-26FEB02-95000`).
    pub fn strike(&self) -> Option<f64> {
        parse_strike(&self.ticker)
    }
}

/// Strike price from a contract ticker's final segment.
pub fn parse_strike(ticker: &str) -> Option<f64> {
    let last = ticker.rsplit('-').next()?;
    // Some series prefix the strike with a T/B boundary marker.
    let digits: String = last
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    digits.parse::<f64>().ok().filter(|s| *s > 0.0)
}

/// Context a flash-sniper entry carries so its custom exit set can run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FlashMeta {
    /// Bid in force before the crash; the recovery anchor.
    pub pre_crash_price: f64,
    /// Bid at crash detection.
    pub crash_price: f64,
    /// Take-profit: entry + 0.80 × (pre_crash − entry).
    pub recovery_target: f64,
    /// Underlying consensus price at entry, for the adverse-move stop.
    pub underlying_at_entry: f64,
    pub drop_pct: f64,
}

/// A validated request to open a position, produced by the strategy layer
/// and consumed by the paper trader.
#[derive(Debug, Clone)]
pub struct EntryIntent {
    pub ticker: String,
    pub market_class: MarketClass,
    pub side: Side,
    /// Limit price in the side's own frame (YES: yes_ask; NO: 1 − yes_bid).
    pub limit_price: f64,
    pub strategy: StrategyTag,
    pub confidence: f64,
    /// Multi-timeframe agreement ratio at signal time; exactly-partial
    /// agreement halves the position size downstream.
    pub mtf_ratio: f64,
    /// Present only on flash-sniper entries.
    pub flash: Option<FlashMeta>,
}
