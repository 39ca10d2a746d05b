// =============================================================================
// Tick Burst Detector — runs of significant same-direction underlying moves
// =============================================================================
//
// A tick is significant when it moves more than $10 or more than 0.01% from
// the previous tick. Significant moves in the same direction extend the run;
// a direction change restarts it and an insignificant tick resets it. The
// burst is "active" once the run reaches 3 ticks.
// =============================================================================

/// Dollar move that always counts as significant.
const SIGNIFICANT_DOLLARS: f64 = 10.0;
/// Percent move that counts as significant (0.01%).
const SIGNIFICANT_PCT: f64 = 0.01;
/// Run length at which a burst becomes active.
const MIN_BURST_LENGTH: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BurstDirection {
    Up,
    Down,
}

/// Current burst state. `direction` is `None` until the run is long enough.
#[derive(Debug, Clone, Copy)]
pub struct BurstStatus {
    pub direction: Option<BurstDirection>,
    pub length: usize,
    /// Cumulative percent move across the run.
    pub total_move_pct: f64,
}

impl BurstStatus {
    fn inactive() -> Self {
        Self {
            direction: None,
            length: 0,
            total_move_pct: 0.0,
        }
    }
}

/// Tracks directional runs in the underlying price stream.
pub struct TickBurstDetector {
    last_price: Option<f64>,
    run_direction: Option<BurstDirection>,
    run_length: usize,
    run_total_pct: f64,
}

impl TickBurstDetector {
    pub fn new() -> Self {
        Self {
            last_price: None,
            run_direction: None,
            run_length: 0,
            run_total_pct: 0.0,
        }
    }

    /// Feed one underlying price tick and return the burst state.
    pub fn update(&mut self, price: f64) -> BurstStatus {
        if let Some(last) = self.last_price {
            let change = price - last;
            let pct_change = if last > 0.0 {
                change / last * 100.0
            } else {
                0.0
            };

            let significant =
                change.abs() > SIGNIFICANT_DOLLARS || pct_change.abs() > SIGNIFICANT_PCT;

            if significant {
                let direction = if change > 0.0 {
                    BurstDirection::Up
                } else {
                    BurstDirection::Down
                };
                if self.run_direction == Some(direction) {
                    self.run_length += 1;
                    self.run_total_pct += pct_change.abs();
                } else {
                    self.run_direction = Some(direction);
                    self.run_length = 1;
                    self.run_total_pct = pct_change.abs();
                }
            } else {
                self.run_direction = None;
                self.run_length = 0;
                self.run_total_pct = 0.0;
            }
        }

        self.last_price = Some(price);
        self.status()
    }

    /// Burst state without feeding a tick.
    pub fn status(&self) -> BurstStatus {
        if self.run_length >= MIN_BURST_LENGTH {
            BurstStatus {
                direction: self.run_direction,
                length: self.run_length,
                total_move_pct: self.run_total_pct,
            }
        } else {
            BurstStatus::inactive()
        }
    }
}

impl Default for TickBurstDetector {
    fn default() -> Self {
        Self::new()
    }
}
