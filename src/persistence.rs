// =============================================================================
// Persistence — atomic checkpoints, append-only trade journal, session logs
// =============================================================================
//
// Three artifacts per session:
//   * `checkpoint.json` — full engine state, rewritten atomically (tmp +
//     fsync + rename) on the checkpoint interval and at shutdown;
//   * `trades.jsonl` — one line per closed trade, appended the moment the
//     trade closes;
//   * `results_<ts>.json` — the end-of-session summary.
//
// Logs go to a timestamped file, a "live" file that always points at the
// current session, and stdout (for supervisors); every line carries an
// ISO-8601 timestamp.
// =============================================================================

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use crate::app_state::Checkpoint;
use crate::paper::{PaperTrader, Position};
use crate::types::{ExitReason, MarketClass, Side, SizingMethod, StrategyTag};

/// File names inside the data directory.
const CHECKPOINT_FILE: &str = "checkpoint.json";
const JOURNAL_FILE: &str = "trades.jsonl";

/// One journal line. Flattened from a closed [`Position`] so each line is
/// self-contained.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalEntry {
    pub ticker: String,
    pub market_class: MarketClass,
    pub side: Side,
    pub size: f64,
    pub entry_price: f64,
    pub exit_price: f64,
    pub theoretical_entry: f64,
    pub theoretical_exit: f64,
    pub entry_fill: Option<crate::fill::FillResult>,
    pub exit_fill: Option<crate::fill::FillResult>,
    pub opened_at: f64,
    pub closed_at: f64,
    pub strategy_tag: StrategyTag,
    pub sizing_method: SizingMethod,
    pub exit_reason: Option<ExitReason>,
    pub realized_pnl: f64,
    pub cumulative_pnl: f64,
}

impl JournalEntry {
    /// Build a journal line from a closed position. Returns `None` while the
    /// position is still open.
    pub fn from_closed(pos: &Position, cumulative_pnl: f64) -> Option<Self> {
        if pos.is_open {
            return None;
        }
        Some(Self {
            ticker: pos.ticker.clone(),
            market_class: pos.market_class,
            side: pos.side,
            size: pos.size,
            entry_price: pos.entry_price,
            exit_price: pos.exit_price?,
            theoretical_entry: pos.theoretical_entry,
            theoretical_exit: pos.theoretical_exit.unwrap_or(pos.exit_price?),
            entry_fill: pos.entry_fill.clone(),
            exit_fill: pos.exit_fill.clone(),
            opened_at: pos.opened_at,
            closed_at: pos.closed_at?,
            strategy_tag: pos.strategy,
            sizing_method: pos.sizing.method,
            exit_reason: pos.exit_reason,
            realized_pnl: pos.realized_pnl?,
            cumulative_pnl,
        })
    }
}

/// Owns the session's data directory.
pub struct Persistence {
    data_dir: PathBuf,
}

impl Persistence {
    pub fn new(data_dir: impl Into<PathBuf>) -> Result<Self> {
        let data_dir = data_dir.into();
        fs::create_dir_all(&data_dir)
            .with_context(|| format!("failed to create data dir {}", data_dir.display()))?;
        Ok(Self { data_dir })
    }

    pub fn checkpoint_path(&self) -> PathBuf {
        self.data_dir.join(CHECKPOINT_FILE)
    }

    pub fn journal_path(&self) -> PathBuf {
        self.data_dir.join(JOURNAL_FILE)
    }

    /// Write the checkpoint atomically: temp file, fsync, rename.
    pub fn write_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()> {
        let path = self.checkpoint_path();
        let tmp_path = path.with_extension("json.tmp");

        let content = serde_json::to_string_pretty(checkpoint)
            .context("failed to serialise checkpoint")?;

        let mut file = File::create(&tmp_path)
            .with_context(|| format!("failed to create {}", tmp_path.display()))?;
        file.write_all(content.as_bytes())
            .context("failed to write checkpoint")?;
        file.sync_all().context("failed to fsync checkpoint")?;
        drop(file);

        fs::rename(&tmp_path, &path)
            .with_context(|| format!("failed to rename checkpoint into {}", path.display()))?;

        info!(path = %path.display(), elapsed = checkpoint.elapsed_secs, "checkpoint written");
        Ok(())
    }

    /// Read a checkpoint back, e.g. for post-session inspection.
    pub fn read_checkpoint(&self) -> Result<Checkpoint> {
        let path = self.checkpoint_path();
        let content = fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        serde_json::from_str(&content).context("failed to parse checkpoint")
    }

    /// Append one closed trade to the journal, immediately on close.
    pub fn append_trade(&self, entry: &JournalEntry) -> Result<()> {
        let line = serde_json::to_string(entry).context("failed to serialise journal entry")?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.journal_path())
            .context("failed to open trade journal")?;
        writeln!(file, "{line}").context("failed to append trade")?;
        Ok(())
    }

    /// Write the end-of-session results document.
    pub fn write_results(&self, summary: &SessionSummary, timestamp: &str) -> Result<()> {
        let path = self.data_dir.join(format!("results_{timestamp}.json"));
        let content =
            serde_json::to_string_pretty(summary).context("failed to serialise results")?;
        fs::write(&path, content)
            .with_context(|| format!("failed to write results to {}", path.display()))?;
        info!(path = %path.display(), "session results written");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Session summary
// ---------------------------------------------------------------------------

/// Per-strategy breakdown for the summary.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StrategyBreakdown {
    pub trades: u32,
    pub wins: u32,
    pub pnl: f64,
    pub avg_clv: Option<f64>,
}

/// End-of-session report, logged and written next to the checkpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    pub duration_secs: u64,
    pub trades: usize,
    pub realized_pnl: f64,
    pub win_rate: f64,
    pub avg_position_size: f64,
    pub kelly_sized_trades: usize,
    pub flash_crash_count: usize,
    pub transport_mode: String,
    pub by_strategy: HashMap<StrategyTag, StrategyBreakdown>,
}

/// Aggregate the session from the trader's closed trades.
pub fn build_summary(
    trader: &PaperTrader,
    duration_secs: u64,
    flash_crash_count: usize,
    transport_mode: &str,
) -> SessionSummary {
    let closed: Vec<&Position> = trader.closed_trades().collect();

    let mut by_strategy: HashMap<StrategyTag, StrategyBreakdown> = HashMap::new();
    for pos in &closed {
        let entry = by_strategy.entry(pos.strategy).or_default();
        entry.trades += 1;
        let pnl = pos.realized_pnl.unwrap_or(0.0);
        if pnl > 0.0 {
            entry.wins += 1;
        }
        entry.pnl += pnl;
    }

    // CLV diagnostic per strategy.
    let mut clv_sums: HashMap<StrategyTag, (f64, u32)> = HashMap::new();
    for sample in trader.clv_samples() {
        let slot = clv_sums.entry(sample.strategy).or_insert((0.0, 0));
        slot.0 += sample.clv;
        slot.1 += 1;
    }
    for (tag, (sum, count)) in clv_sums {
        if count > 0 {
            by_strategy.entry(tag).or_default().avg_clv = Some(sum / count as f64);
        }
    }

    let wins = closed
        .iter()
        .filter(|p| p.realized_pnl.unwrap_or(0.0) > 0.0)
        .count();
    let total_size: f64 = closed.iter().map(|p| p.size).sum();
    let kelly_sized = closed
        .iter()
        .filter(|p| p.sizing.method == SizingMethod::Kelly)
        .count();

    SessionSummary {
        duration_secs,
        trades: closed.len(),
        realized_pnl: trader.realized_pnl,
        win_rate: if closed.is_empty() {
            0.0
        } else {
            wins as f64 / closed.len() as f64
        },
        avg_position_size: if closed.is_empty() {
            0.0
        } else {
            total_size / closed.len() as f64
        },
        kelly_sized_trades: kelly_sized,
        flash_crash_count,
        transport_mode: transport_mode.to_string(),
        by_strategy,
    }
}

// ---------------------------------------------------------------------------
// Log setup
// ---------------------------------------------------------------------------

/// Wire tracing to stdout plus the session's two log files. The returned
/// guards must stay alive for the duration of the process or buffered lines
/// are lost.
pub fn init_logging(log_dir: &str, session_timestamp: &str) -> Result<Vec<WorkerGuard>> {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    fs::create_dir_all(log_dir)
        .with_context(|| format!("failed to create log dir {log_dir}"))?;

    let session_file = File::create(format!("{log_dir}/vega_{session_timestamp}.log"))
        .context("failed to create session log file")?;
    let live_file = File::create(format!("{log_dir}/vega_live.log"))
        .context("failed to create live log file")?;

    let (session_writer, session_guard) = tracing_appender::non_blocking(session_file);
    let (live_writer, live_guard) = tracing_appender::non_blocking(live_file);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(session_writer),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(live_writer),
        )
        .init();

    Ok(vec![session_guard, live_guard])
}
