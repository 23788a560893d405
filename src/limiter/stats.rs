//! Uniform snapshot types for observability (component 10 of §2).

use serde::Serialize;

use crate::window::WindowCounter;

/// Snapshot of one time-window counter.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct CounterStats {
    /// Events observed in the current window.
    pub current: u64,
    /// The configured limit.
    pub limit: u64,
    /// `limit - current`.
    pub remaining: u64,
}

pub(crate) fn counter_snapshot(counter: &mut WindowCounter, now: tokio::time::Instant) -> CounterStats {
    CounterStats {
        current: counter.current(now),
        limit: counter.limit(),
        remaining: counter.remaining(now),
    }
}

/// Snapshot of a concurrency (or memory) semaphore.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct SemaphoreStats {
    /// Permits free to hand out right now.
    pub available: usize,
    /// Permits currently held.
    pub in_use: usize,
    /// Configured maximum capacity.
    pub max: usize,
}

/// Snapshot of one model's admission state.
#[derive(Debug, Clone, Serialize)]
pub struct ModelStats {
    /// The model this snapshot describes.
    pub model_id: String,
    /// Requests-per-minute counter, if configured.
    pub requests_per_minute: Option<CounterStats>,
    /// Requests-per-day counter, if configured.
    pub requests_per_day: Option<CounterStats>,
    /// Tokens-per-minute counter, if configured.
    pub tokens_per_minute: Option<CounterStats>,
    /// Tokens-per-day counter, if configured.
    pub tokens_per_day: Option<CounterStats>,
    /// Concurrency semaphore, if configured.
    pub concurrency: Option<SemaphoreStats>,
}
