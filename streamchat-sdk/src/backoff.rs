//! Exponential delay policy for reconnect attempts.
//!
//! The interval starts at `min`, doubles on every [`Backoff::advance`] and is
//! capped at `max`. A confirmed successful send calls [`Backoff::reset`].
//! Only the task holding the session's reconnect guard advances it.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Backoff {
    min: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(min: Duration, max: Duration) -> Self {
        let max = max.max(min);
        Self { min, max, current: min }
    }

    /// Delay the next [`advance`](Self::advance) will wait. Does not mutate.
    pub fn peek_interval(&self) -> Duration {
        self.current
    }

    /// Consume the current interval and double it for the next attempt.
    ///
    /// Returns the delay the caller must wait before reconnecting. The session
    /// sleeps it through a wait that `close()` can cut short.
    pub fn advance(&mut self) -> Duration {
        let wait = self.current;
        self.current = self.current.saturating_mul(2).clamp(self.min, self.max);
        wait
    }

    pub fn reset(&mut self) {
        self.current = self.min;
    }
}
