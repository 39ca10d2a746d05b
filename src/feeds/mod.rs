// =============================================================================
// Market Data Feeds
// =============================================================================
//
// Long-lived ingestion tasks. Each feed owns its own last-value cells; the
// main tick loop only ever reads. Failures reconnect with capped exponential
// backoff and never propagate into the strategy layer.

pub mod cross_venue;
pub mod derivatives;
pub mod exchange;
pub mod kalshi;
pub mod orderbook;

use std::time::Duration;

use tokio::time::sleep;

/// Wall-clock now as fractional epoch seconds.
pub fn epoch_secs() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// Capped exponential reconnect backoff: 1 s doubling to a 60 s ceiling,
/// reset to 1 s on the first successful message.
#[derive(Debug)]
pub struct Backoff {
    delay: Duration,
}

impl Backoff {
    pub fn new() -> Self {
        Self {
            delay: Duration::from_secs(1),
        }
    }

    /// Sleep for the current delay, then double it (capped at 60 s).
    pub async fn wait(&mut self) {
        sleep(self.delay).await;
        self.delay = (self.delay * 2).min(Duration::from_secs(60));
    }

    pub fn reset(&mut self) {
        self.delay = Duration::from_secs(1);
    }

    pub fn current(&self) -> Duration {
        self.delay
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let mut b = Backoff::new();
        assert_eq!(b.current(), Duration::from_secs(1));
        // Simulate the doubling without sleeping.
        for _ in 0..10 {
            b.delay = (b.delay * 2).min(Duration::from_secs(60));
        }
        assert_eq!(b.current(), Duration::from_secs(60));
        b.reset();
        assert_eq!(b.current(), Duration::from_secs(1));
    }
}
