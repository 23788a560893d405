//! The backend abstraction (§4.9).
//!
//! The scheduler depends on this trait, never on a concrete transport — the distributed
//! coordinator (§4.8, [`crate::backend::distributed`]) is one conforming implementation;
//! [`LocalBackend`] is the trivial single-process one. This mirrors how the teacher's
//! `RejectionDelay` wraps `Box<dyn Limiter>` rather than a concrete limiter type, so behavior
//! composes without the wrapper knowing what it's wrapping.

pub mod distributed;

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{error::LimiterError, model::UsageEstimate};

/// A worker instance's current share of the global budget.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Allocation {
    /// Concurrency slots this instance may use.
    pub slots: usize,
    /// Tokens per minute this instance may consume, if the coordinator tracks a global TPM
    /// budget.
    pub tokens_per_minute: Option<u64>,
    /// Requests per minute this instance may issue, if the coordinator tracks a global RPM
    /// budget.
    pub requests_per_minute: Option<u64>,
    /// This instance's slot share of each globally ratio-split job type, when the coordinator is
    /// configured with `resources_per_job` (§4.8). Empty when no global job-type split is
    /// configured; job types absent from this map fall back to the local, per-instance ratio
    /// split in [`crate::allocator::SlotAllocator`].
    #[serde(default)]
    pub job_types: HashMap<String, usize>,
}

/// Context for one `acquire` call against the backend.
#[derive(Debug, Clone)]
pub struct AcquireCtx<'a> {
    /// This process's instance id.
    pub instance_id: &'a str,
    /// The model the caller wants to attempt.
    pub model_id: &'a str,
    /// The job being admitted, for tracing/debugging.
    pub job_id: &'a str,
    /// The job's configured type, for per-job-type global usage aggregation (§4.8).
    pub job_type: &'a str,
    /// Estimated resource consumption of the attempt.
    pub estimated: UsageEstimate,
}

/// Context for one `release` call against the backend.
#[derive(Debug, Clone)]
pub struct ReleaseCtx<'a> {
    /// This process's instance id.
    pub instance_id: &'a str,
    /// The model the attempt ran (or was about to run) against.
    pub model_id: &'a str,
    /// The job being released, for tracing/debugging.
    pub job_id: &'a str,
    /// The job's configured type, for per-job-type global usage aggregation (§4.8).
    pub job_type: &'a str,
    /// What was reserved at `acquire` time.
    pub estimated: UsageEstimate,
    /// What was actually consumed. `None` when the attempt never ran at all (e.g. local
    /// admission rejected it after the backend granted it) — equivalent to `actual = 0`, a full
    /// refund.
    pub actual: Option<UsageEstimate>,
}

/// Reason an allocation changed, passed to [`Backend::subscribe`] callbacks for observability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AllocationChangeReason {
    /// A new instance registered.
    InstanceJoined,
    /// An instance unregistered or was cleaned up after a missed heartbeat.
    InstanceLeft,
    /// The coordinator's own capacity configuration changed.
    ConfigChanged,
}

/// A callback invoked with this instance's new [`Allocation`] whenever the coordinator
/// redistributes the global budget (§4.8).
pub type AllocationCallback = Arc<dyn Fn(Allocation, AllocationChangeReason) + Send + Sync>;

/// Cancels a [`Backend::subscribe`] registration.
pub struct Unsubscribe(Box<dyn FnOnce() + Send>);

impl Unsubscribe {
    /// Wrap a cancellation closure.
    pub fn new(f: impl FnOnce() + Send + 'static) -> Self {
        Self(Box::new(f))
    }

    /// Cancel the subscription.
    pub fn unsubscribe(self) {
        (self.0)()
    }
}

/// The interface between the local scheduler and wherever global capacity is actually tracked.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Join the pool, receiving this instance's initial allocation.
    async fn register(&self, instance_id: &str) -> Result<Allocation, LimiterError>;

    /// Leave the pool.
    async fn unregister(&self, instance_id: &str) -> Result<(), LimiterError>;

    /// Record liveness. Implementations that don't need liveness tracking (e.g.
    /// [`LocalBackend`]) may no-op.
    async fn heartbeat(&self, instance_id: &str) -> Result<(), LimiterError>;

    /// Attempt to reserve `ctx.estimated` against this instance's allocation. `false` means the
    /// caller should escalate to the next model.
    async fn acquire(&self, ctx: AcquireCtx<'_>) -> Result<bool, LimiterError>;

    /// Release a reservation made by a prior successful `acquire`. Errors here are swallowed by
    /// callers per §7 — this fallible signature exists so implementations can log them.
    async fn release(&self, ctx: ReleaseCtx<'_>) -> Result<(), LimiterError>;

    /// Register a callback fired whenever this instance's allocation is redistributed.
    fn subscribe(&self, on_change: AllocationCallback) -> Unsubscribe;

    /// Current allocation, without subscribing.
    async fn current_allocation(&self, instance_id: &str) -> Result<Allocation, LimiterError>;
}

/// A trivial backend for single-process mode: a fixed allocation, always admits.
///
/// This is the default backend per §6; it performs no coordination because there is nothing to
/// coordinate with.
pub struct LocalBackend {
    allocation: Allocation,
}

impl LocalBackend {
    /// A local backend granting every instance the same fixed allocation.
    pub fn new(allocation: Allocation) -> Self {
        Self { allocation }
    }
}

#[async_trait]
impl Backend for LocalBackend {
    async fn register(&self, _instance_id: &str) -> Result<Allocation, LimiterError> {
        Ok(self.allocation.clone())
    }

    async fn unregister(&self, _instance_id: &str) -> Result<(), LimiterError> {
        Ok(())
    }

    async fn heartbeat(&self, _instance_id: &str) -> Result<(), LimiterError> {
        Ok(())
    }

    async fn acquire(&self, _ctx: AcquireCtx<'_>) -> Result<bool, LimiterError> {
        Ok(true)
    }

    async fn release(&self, _ctx: ReleaseCtx<'_>) -> Result<(), LimiterError> {
        Ok(())
    }

    fn subscribe(&self, _on_change: AllocationCallback) -> Unsubscribe {
        Unsubscribe::new(|| {})
    }

    async fn current_allocation(&self, _instance_id: &str) -> Result<Allocation, LimiterError> {
        Ok(self.allocation.clone())
    }
}
