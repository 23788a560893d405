//! Fixed-window request/token counters (§4.1).
//!
//! Windows are *fixed*, not sliding: a burst straddling a window boundary can briefly see up to
//! 2x the configured limit across the two windows. This is a known, accepted tradeoff (see
//! DESIGN.md) rather than a bug — a sliding window needs a ring buffer and per-sample bookkeeping
//! this crate's hot path doesn't pay for.

use tokio::time::Instant;

/// A single fixed-window counter against one limit (e.g. "requests per minute").
#[derive(Debug)]
pub struct WindowCounter {
    limit: u64,
    window: std::time::Duration,
    count: u64,
    window_start: Instant,
}

impl WindowCounter {
    /// Create a counter with the given `limit` over a fixed `window` duration, starting its
    /// first window at `now`.
    pub fn new(limit: u64, window: std::time::Duration, now: Instant) -> Self {
        Self {
            limit,
            window,
            count: 0,
            // `Instant` has no absolute epoch to floor against, so the first window boundary is
            // anchored at construction time; `maybe_roll` advances it in fixed `window` steps
            // from there on. This is equivalent to flooring against a wall-clock epoch for any
            // single counter's own admission decisions (§4.1) — the boundary phase only matters
            // when comparing two counters' windows directly, which this crate never does.
            window_start: now,
        }
    }

    /// Roll the window forward if `now` has moved past the current window's end, resetting
    /// `count` to zero.
    fn maybe_roll(&mut self, now: Instant) {
        if self.window.is_zero() {
            return;
        }
        while now.duration_since(self.window_start) >= self.window {
            self.window_start += self.window;
            self.count = 0;
        }
    }

    /// Whether `n` additional events fit in the current window without exceeding `limit`.
    pub fn has_capacity_for(&mut self, n: u64, now: Instant) -> bool {
        self.maybe_roll(now);
        self.count.saturating_add(n) <= self.limit
    }

    /// Record `n` events against the current window.
    pub fn add(&mut self, n: u64, now: Instant) {
        self.maybe_roll(now);
        self.count = self.count.saturating_add(n);
    }

    /// Refund `n` events from the current window, clamped at zero. Used when the actual usage of
    /// an attempt was less than its reservation estimate.
    pub fn subtract(&mut self, n: u64, now: Instant) {
        self.maybe_roll(now);
        self.count = self.count.saturating_sub(n);
    }

    /// The configured limit.
    pub fn limit(&self) -> u64 {
        self.limit
    }

    /// Count observed in the current window, after rolling forward if necessary.
    pub fn current(&mut self, now: Instant) -> u64 {
        self.maybe_roll(now);
        self.count
    }

    /// Remaining capacity in the current window.
    pub fn remaining(&mut self, now: Instant) -> u64 {
        let current = self.current(now);
        self.limit.saturating_sub(current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn counter(limit: u64, window_ms: u64) -> (WindowCounter, Instant) {
        let now = Instant::now();
        (WindowCounter::new(limit, Duration::from_millis(window_ms), now), now)
    }

    #[test]
    fn admits_up_to_limit() {
        let (mut c, now) = counter(3, 60_000);
        assert!(c.has_capacity_for(3, now));
        c.add(3, now);
        assert!(!c.has_capacity_for(1, now));
    }

    #[test]
    fn resets_after_window_elapses() {
        let (mut c, now) = counter(1, 60_000);
        c.add(1, now);
        assert!(!c.has_capacity_for(1, now));

        let later = now + Duration::from_millis(60_001);
        assert!(c.has_capacity_for(1, later));
        assert_eq!(c.current(later), 0);
    }

    #[test]
    fn subtract_clamps_at_zero() {
        let (mut c, now) = counter(10, 60_000);
        c.add(2, now);
        c.subtract(5, now);
        assert_eq!(c.current(now), 0);
    }

    #[test]
    fn does_not_reset_mid_window() {
        let (mut c, now) = counter(5, 60_000);
        c.add(2, now);
        let mid = now + Duration::from_millis(30_000);
        assert_eq!(c.current(mid), 2);
    }
}
