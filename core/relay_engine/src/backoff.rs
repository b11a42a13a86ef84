//! Bounded exponential retry delay
//!
//! Every connection-owning worker (both uplinks and the socket client) keeps
//! one `Backoff` for its whole lifetime. Only the very first attempt runs
//! immediately; each later attempt waits the current delay, which then doubles
//! up to the cap. A reset after a successful connect brings the delay back to
//! the minimum, never to zero. Retries never stop.

use std::time::Duration;

// ============================================================================
// Constants
// ============================================================================

/// Uplink minimum delay between connection attempts
pub const UPLINK_MIN_DELAY: Duration = Duration::from_secs(2);

/// Uplink delay cap (2s doubled five times)
pub const UPLINK_MAX_DELAY: Duration = Duration::from_secs(64);

/// Socket client minimum reconnect delay
pub const CLIENT_MIN_DELAY: Duration = Duration::from_secs(5);

/// Socket client reconnect delay cap
pub const CLIENT_MAX_DELAY: Duration = Duration::from_secs(60);

/// Growth factor applied after each failed attempt
const FACTOR: u32 = 2;

// ============================================================================
// Backoff
// ============================================================================

/// Retry state for one connection owner
#[derive(Debug, Clone)]
pub struct Backoff {
    /// Delay used right after a reset
    min: Duration,
    /// Upper bound for the delay
    max: Duration,
    /// Delay the next failed attempt will wait
    current: Duration,
    /// Attempts made since the last reset
    attempts: u32,
    /// Set once the immediate first attempt has been handed out
    started: bool,
}

impl Backoff {
    /// Create a backoff with the given bounds. `max` below `min` is raised to `min`.
    pub fn new(min: Duration, max: Duration) -> Self {
        Backoff {
            min,
            max: max.max(min),
            current: min,
            attempts: 0,
            started: false,
        }
    }

    /// Delay to wait before the next attempt, advancing the state.
    pub fn next_delay(&mut self) -> Duration {
        let delay = if !self.started {
            self.started = true;
            Duration::ZERO
        } else {
            let delay = self.current;
            self.current = self.current.saturating_mul(FACTOR).min(self.max);
            delay
        };
        self.attempts = self.attempts.saturating_add(1);
        delay
    }

    /// Return to the minimum delay after a successful connect. The next
    /// attempt waits `min`.
    pub fn reset(&mut self) {
        self.current = self.min;
        self.attempts = 0;
    }

    /// Delay a failed attempt would wait right now
    pub fn current(&self) -> Duration {
        self.current
    }

    /// Attempts made since the last reset
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn min(&self) -> Duration {
        self.min
    }

    pub fn max(&self) -> Duration {
        self.max
    }
}

// ============================================================================
// Tests
// ============================================================================
