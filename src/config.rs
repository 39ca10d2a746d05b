// =============================================================================
// Engine Configuration — CLI arguments plus environment overrides
// =============================================================================
//
// The session duration comes from the command line; strategy tunables can be
// overridden through VEGA_* environment variables. Nothing is required — a
// bare `vega-bot` runs a paper session with the defaults below.
//
// Every field carries a serde default so a config embedded in an old
// checkpoint still deserialises after new fields are added.
// =============================================================================

use clap::Parser;
use serde::{Deserialize, Serialize};
use tracing::info;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_duration_min() -> u64 {
    480
}

fn default_initial_balance() -> f64 {
    1000.0
}

fn default_base_trade_size() -> u32 {
    10
}

fn default_checkpoint_secs() -> u64 {
    300
}

fn default_data_dir() -> String {
    "data".to_string()
}

fn default_log_dir() -> String {
    "logs".to_string()
}

fn default_vol_regime_atr() -> f64 {
    0.0025
}

fn default_max_spread_btc() -> f64 {
    0.05
}

fn default_max_spread_eth() -> f64 {
    0.04
}

fn default_min_volume() -> f64 {
    50.0
}

// =============================================================================
// CLI
// =============================================================================

/// Command-line interface for the paper-trading engine.
#[derive(Debug, Parser)]
#[command(name = "vega-bot", about = "Kalshi BTC/ETH paper-trading engine")]
pub struct Cli {
    /// Session duration in minutes.
    #[arg(default_value_t = default_duration_min())]
    pub duration_min: u64,

    /// Starting paper balance in dollars.
    #[arg(long, env = "VEGA_BALANCE", default_value_t = default_initial_balance())]
    pub balance: f64,

    /// Base position size in contracts (pre-Kelly).
    #[arg(long, env = "VEGA_BASE_SIZE", default_value_t = default_base_trade_size())]
    pub base_size: u32,

    /// Directory for checkpoints and results.
    #[arg(long, env = "VEGA_DATA_DIR", default_value_t = default_data_dir())]
    pub data_dir: String,

    /// Directory for session log files.
    #[arg(long, env = "VEGA_LOG_DIR", default_value_t = default_log_dir())]
    pub log_dir: String,
}

// =============================================================================
// EngineConfig
// =============================================================================

/// Resolved engine configuration, embedded verbatim in every checkpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_duration_min")]
    pub duration_min: u64,

    #[serde(default = "default_initial_balance")]
    pub initial_balance: f64,

    /// Base position size in contracts before Kelly sizing kicks in.
    #[serde(default = "default_base_trade_size")]
    pub base_trade_size: u32,

    #[serde(default = "default_checkpoint_secs")]
    pub checkpoint_interval_secs: u64,

    #[serde(default = "default_data_dir")]
    pub data_dir: String,

    #[serde(default = "default_log_dir")]
    pub log_dir: String,

    // --- Risk gate tunables --------------------------------------------------
    /// ATR fraction above which the volatility-regime gate blocks entries.
    #[serde(default = "default_vol_regime_atr")]
    pub vol_regime_atr: f64,

    /// Maximum tolerated spread for BTC classes, dollars.
    #[serde(default = "default_max_spread_btc")]
    pub max_spread_btc: f64,

    /// Maximum tolerated spread for ETH classes, dollars.
    #[serde(default = "default_max_spread_eth")]
    pub max_spread_eth: f64,

    /// Minimum cumulative contract volume required for entry.
    #[serde(default = "default_min_volume")]
    pub min_volume: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            duration_min: default_duration_min(),
            initial_balance: default_initial_balance(),
            base_trade_size: default_base_trade_size(),
            checkpoint_interval_secs: default_checkpoint_secs(),
            data_dir: default_data_dir(),
            log_dir: default_log_dir(),
            vol_regime_atr: default_vol_regime_atr(),
            max_spread_btc: default_max_spread_btc(),
            max_spread_eth: default_max_spread_eth(),
            min_volume: default_min_volume(),
        }
    }
}

impl EngineConfig {
    /// Build the engine configuration from parsed CLI arguments.
    pub fn from_cli(cli: &Cli) -> Self {
        let config = Self {
            duration_min: cli.duration_min,
            initial_balance: cli.balance,
            base_trade_size: cli.base_size,
            data_dir: cli.data_dir.clone(),
            log_dir: cli.log_dir.clone(),
            ..Self::default()
        };

        info!(
            duration_min = config.duration_min,
            balance = config.initial_balance,
            base_size = config.base_trade_size,
            "engine configured"
        );

        config
    }

    /// Maximum tolerated spread for a market class.
    pub fn max_spread(&self, is_eth: bool) -> f64 {
        if is_eth {
            self.max_spread_eth
        } else {
            self.max_spread_btc
        }
    }
}
