//! Job-type configuration and the mutable per-type allocator state.

use std::sync::atomic::{AtomicUsize, Ordering};

use serde::{Deserialize, Serialize};

use crate::error::LimiterError;

/// Ratio tuning for one job type, controlling how the [`crate::allocator::SlotAllocator`] carves
/// up a worker's capacity.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RatioConfig {
    /// Starting share of capacity before any normalization or rebalancing, `0.0..=1.0`.
    #[serde(default)]
    pub initial_value: Option<f64>,
    /// Whether this type's ratio may be adjusted by rebalancing (donate when idle, receive when
    /// saturated).
    #[serde(default = "default_flexible")]
    pub flexible: bool,
}

fn default_flexible() -> bool {
    false
}

impl Default for RatioConfig {
    fn default() -> Self {
        Self {
            initial_value: None,
            flexible: default_flexible(),
        }
    }
}

/// Static resource estimation and ratio configuration for one job type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobTypeConfig {
    /// Identifier used in [`crate::scheduler::JobRequest::job_type`].
    pub id: String,
    /// Estimated tokens consumed by one invocation, used as the default
    /// [`crate::model::UsageEstimate`] when the caller doesn't supply one.
    #[serde(default)]
    pub estimated_used_tokens: u64,
    /// Estimated number of provider requests one invocation issues.
    #[serde(default = "default_requests")]
    pub estimated_number_of_requests: u64,
    /// Estimated memory, in KB, one invocation holds for the duration of its attempt.
    #[serde(default)]
    pub estimated_used_memory_kb: u64,
    /// Ratio tuning; defaults to an inflexible type with no initial value (normalized equally
    /// among its peers).
    #[serde(default)]
    pub ratio: RatioConfig,
}

fn default_requests() -> u64 {
    1
}

impl JobTypeConfig {
    /// Validate that the ratio, if set, is within bounds.
    pub fn validate(&self) -> Result<(), LimiterError> {
        if self.id.trim().is_empty() {
            return Err(LimiterError::InvalidConfig(
                "job type id must not be empty".into(),
            ));
        }
        if let Some(v) = self.ratio.initial_value {
            if !(0.0..=1.0).contains(&v) {
                return Err(LimiterError::InvalidConfig(format!(
                    "job type '{}' ratio.initial_value must be in [0, 1], got {v}",
                    self.id
                )));
            }
        }
        Ok(())
    }
}

/// Live, mutable allocator bookkeeping for one job type.
///
/// `in_flight` and `allocated_slots` are plain atomics rather than being behind the allocator's
/// mutex: they're read far more often (every `has_capacity` check) than written, and reads must
/// never block on a rebalance in progress.
#[derive(Debug)]
pub struct JobTypeState {
    pub(crate) config: JobTypeConfig,
    pub(crate) initial_ratio: f64,
    pub(crate) current_ratio: std::sync::atomic::AtomicU64, // f64 bits, see ratio()/set_ratio()
    pub(crate) in_flight: AtomicUsize,
    pub(crate) allocated_slots: AtomicUsize,
    pub(crate) releases_since_adjustment: AtomicUsize,
}

impl JobTypeState {
    pub(crate) fn new(config: JobTypeConfig, initial_ratio: f64) -> Self {
        Self {
            config,
            initial_ratio,
            current_ratio: std::sync::atomic::AtomicU64::new(initial_ratio.to_bits()),
            in_flight: AtomicUsize::new(0),
            allocated_slots: AtomicUsize::new(0),
            releases_since_adjustment: AtomicUsize::new(0),
        }
    }

    /// Current normalized share of total capacity, `0.0..=1.0`.
    pub fn ratio(&self) -> f64 {
        f64::from_bits(self.current_ratio.load(Ordering::Acquire))
    }

    pub(crate) fn set_ratio(&self, ratio: f64) {
        self.current_ratio.store(ratio.to_bits(), Ordering::Release);
    }

    /// Number of in-flight jobs of this type.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Slots currently allocated to this type.
    pub fn allocated_slots(&self) -> usize {
        self.allocated_slots.load(Ordering::Acquire)
    }

    /// Whether this type may donate/receive ratio during rebalancing.
    pub fn flexible(&self) -> bool {
        self.config.ratio.flexible
    }

    pub(crate) fn load(&self) -> f64 {
        let allocated = self.allocated_slots();
        if allocated == 0 {
            0.0
        } else {
            self.in_flight() as f64 / allocated as f64
        }
    }
}
