//! Reconnection backoff schedule.
//!
//! Attempt `n` (1-based) waits `base_delay × n`, capped at `max_delay`. The
//! schedule is non-decreasing and bounded by `max_attempts`.

use crate::config::TransportConfig;
use std::time::Duration;

/// Configuration for reconnection after an unexpected link loss.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Maximum number of reconnection attempts. 0 disables reconnection.
    pub max_attempts: u32,
    /// Delay unit multiplied by the attempt number.
    pub base_delay: Duration,
    /// Maximum delay cap.
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: TransportConfig::RECONNECT_MAX_ATTEMPTS,
            base_delay: TransportConfig::RECONNECT_BASE_DELAY,
            max_delay: TransportConfig::RECONNECT_MAX_DELAY,
        }
    }
}

impl ReconnectPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// A policy that never reconnects.
    pub fn disabled() -> Self {
        Self::default().with_max_attempts(0)
    }

    /// Set the maximum number of attempts.
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Set the base delay.
    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Set the maximum delay cap.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Delay before the given attempt (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(attempt.max(1))
            .min(self.max_delay)
    }

    /// The full `(attempt, delay)` schedule.
    pub fn schedule(&self) -> impl Iterator<Item = (u32, Duration)> + '_ {
        (1..=self.max_attempts).map(move |attempt| (attempt, self.delay_for(attempt)))
    }
}
