//! Exponential reconnect backoff

use std::time::Duration;

/// Exponential delay between reconnect attempts
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Backoff {
    /// Delay before the first retry
    pub initial: Duration,
    /// Upper bound of any delay
    pub max: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(30),
        }
    }
}

impl Backoff {
    /// Create a backoff
    #[must_use]
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self { initial, max }
    }

    /// Delay before the given retry (1-based)
    ///
    /// `initial * 2^(retry - 1)`, capped at `max`.
    #[must_use]
    pub fn delay(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(31);
        self.initial
            .checked_mul(1u32 << exponent)
            .map_or(self.max, |d| d.min(self.max))
    }
}

/// How often a source is retried and how long to wait in between
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Retries allowed after the first attempt
    pub max_attempts: u32,
    /// Delay schedule
    pub backoff: Backoff,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff: Backoff::default(),
        }
    }
}

impl ReconnectPolicy {
    /// Total attempts including the first one
    #[must_use]
    pub fn total_attempts(&self) -> u32 {
        self.max_attempts.saturating_add(1)
    }
}
