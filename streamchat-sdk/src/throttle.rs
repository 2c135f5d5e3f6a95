//! Rolling-window throughput governor.
//!
//! The platform caps how many chat lines an account may send per window and
//! disconnects or mutes accounts that exceed it. The governor counts writes in
//! the current window and tells the consumer whether a candidate line may go
//! out now or after a delay.
//!
//! Windows are half-open: once `now` reaches the window end a new window
//! starts with the candidate as its first write.

use std::time::Duration;

use tokio::time::Instant;

/// Length of one rate-limit window on the platform.
pub const DEFAULT_WINDOW: Duration = Duration::from_millis(30_200);

/// Writes per window a priority line may still use after the limit is spent.
/// Fixed by the platform; not configurable.
pub const PRIORITY_CEILING: u32 = 100;

/// Limits applied to a single check. Built from live configuration each time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RatePolicy {
    /// Non-priority writes allowed per window.
    pub limit: f64,
    pub window: Duration,
}

impl Default for RatePolicy {
    fn default() -> Self {
        Self {
            limit: 20.0,
            window: DEFAULT_WINDOW,
        }
    }
}

/// Outcome of a throttle check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Send immediately; the write has been counted.
    Now,
    /// Limit reached. Sleep this long, then check again.
    Wait(Duration),
}

#[derive(Debug, Default)]
pub struct Throttle {
    writes: u32,
    window_end: Option<Instant>,
}

impl Throttle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check whether a line may be written at `now`.
    ///
    /// A [`Admission::Wait`] does not touch the window; the caller re-checks
    /// after sleeping and the elapsed time decides.
    pub fn check(&mut self, now: Instant, priority: bool, policy: RatePolicy) -> Admission {
        match self.window_end {
            Some(end) if end > now => {
                let under_limit = f64::from(self.writes) < policy.limit;
                let priority_room = priority && self.writes < PRIORITY_CEILING;
                if under_limit || priority_room {
                    self.writes += 1;
                    Admission::Now
                } else {
                    Admission::Wait(end - now)
                }
            }
            _ => {
                self.writes = 1;
                self.window_end = Some(now + policy.window);
                Admission::Now
            }
        }
    }

    /// Writes counted in the current window.
    pub fn writes(&self) -> u32 {
        self.writes
    }

    pub fn window_end(&self) -> Option<Instant> {
        self.window_end
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(limit: f64) -> RatePolicy {
        RatePolicy {
            limit,
            ..RatePolicy::default()
        }
    }

    #[test]
    fn first_write_opens_window() {
        let mut t = Throttle::new();
        let now = Instant::now();
        assert_eq!(t.check(now, false, policy(20.0)), Admission::Now);
        assert_eq!(t.writes(), 1);
        assert_eq!(t.window_end(), Some(now + DEFAULT_WINDOW));
    }

    #[test]
    fn limit_then_wait_until_window_end() {
        let mut t = Throttle::new();
        let start = Instant::now();
        for _ in 0..20 {
            assert_eq!(t.check(start, false, policy(20.0)), Admission::Now);
        }
        let later = start + Duration::from_secs(10);
        assert_eq!(
            t.check(later, false, policy(20.0)),
            Admission::Wait(DEFAULT_WINDOW - Duration::from_secs(10))
        );
        // Waiting does not count a write.
        assert_eq!(t.writes(), 20);
    }

    #[test]
    fn window_end_reached_starts_new_window() {
        let mut t = Throttle::new();
        let start = Instant::now();
        for _ in 0..20 {
            t.check(start, false, policy(20.0));
        }
        let end = start + DEFAULT_WINDOW;
        assert_eq!(t.check(end, false, policy(20.0)), Admission::Now);
        assert_eq!(t.writes(), 1);
        assert_eq!(t.window_end(), Some(end + DEFAULT_WINDOW));
    }

    #[test]
    fn priority_bypasses_limit_up_to_ceiling() {
        let mut t = Throttle::new();
        let now = Instant::now();
        for _ in 0..20 {
            t.check(now, false, policy(20.0));
        }
        assert!(matches!(t.check(now, false, policy(20.0)), Admission::Wait(_)));
        for _ in 20..PRIORITY_CEILING {
            assert_eq!(t.check(now, true, policy(20.0)), Admission::Now);
        }
        assert_eq!(t.writes(), PRIORITY_CEILING);
        assert!(matches!(t.check(now, true, policy(20.0)), Admission::Wait(_)));
    }

    #[test]
    fn limit_is_taken_from_each_call() {
        let mut t = Throttle::new();
        let now = Instant::now();
        for _ in 0..5 {
            t.check(now, false, policy(5.0));
        }
        assert!(matches!(t.check(now, false, policy(5.0)), Admission::Wait(_)));
        // Operator raises the limit mid-window.
        assert_eq!(t.check(now, false, policy(7.0)), Admission::Now);
    }

    #[test]
    fn fractional_limit_rounds_up() {
        let mut t = Throttle::new();
        let now = Instant::now();
        for _ in 0..3 {
            assert_eq!(t.check(now, false, policy(2.5)), Admission::Now);
        }
        assert!(matches!(t.check(now, false, policy(2.5)), Admission::Wait(_)));
    }
}
