//! Top-level observability snapshots (component 10 of §2), aggregating the per-model and
//! per-job-type stats exposed deeper in the tree.

use std::collections::HashMap;

use serde::Serialize;

use crate::limiter::{stats::SemaphoreStats, ModelStats};

/// One job type's slot-allocator snapshot.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct AllocatorStats {
    /// Current normalized ratio of total capacity.
    pub ratio: f64,
    /// Jobs of this type currently in flight.
    pub in_flight: usize,
    /// Slots currently allocated to this type.
    pub allocated_slots: usize,
}

/// A full snapshot of a [`crate::Scheduler`]'s admission state.
#[derive(Debug, Clone, Serialize)]
pub struct LimiterStats {
    /// Per-model counters and semaphore occupancy, keyed by model id.
    pub models: HashMap<String, ModelStats>,
    /// Per-job-type allocator state, keyed by job type id.
    pub job_types: HashMap<String, AllocatorStats>,
    /// The shared memory semaphore, if memory-based admission is enabled.
    pub memory: Option<SemaphoreStats>,
}
