//! RAII reservation held for the lifetime of one attempt.

use crate::{memory::MemoryPermit, model::UsageEstimate, semaphore::Permit};

/// A held compound reservation against one model's sub-limits.
///
/// Holding this open keeps the concurrency and memory permits (if configured) occupied; dropping
/// it (or letting [`crate::limiter::SingleModelLimiter::queue_job`] drop it after the job
/// completes) releases them. The time-window counter portion of the reservation is refunded
/// separately by `queue_job`, since it needs the actual usage to compute the refund amount —
/// unlike the semaphores, which always release in full (I5).
pub struct Reservation {
    estimate: UsageEstimate,
    concurrency: Option<Permit>,
    memory: Option<MemoryPermit>,
}

impl Reservation {
    pub(crate) fn new(
        estimate: UsageEstimate,
        concurrency: Option<Permit>,
        memory: Option<MemoryPermit>,
    ) -> Self {
        Self {
            estimate,
            concurrency,
            memory,
        }
    }

    /// The estimate this reservation was made against.
    pub fn estimate(&self) -> UsageEstimate {
        self.estimate
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        // `Permit` and `MemoryPermit` each release themselves on drop; this impl exists so the
        // release ordering (concurrency, then memory) is explicit and documented rather than
        // left to field-drop order, which would silently change if the struct's fields were
        // reordered.
        self.concurrency.take();
        self.memory.take();
    }
}
