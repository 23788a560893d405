//! The distributed coordinator (§4.8): fair redistribution of a global budget across a dynamic
//! set of worker instances, with heartbeat-based liveness and push notifications on allocation
//! change.
//!
//! Slot/window admission (`acquire`/`release`) is checked entirely against this instance's own,
//! most recently pushed [`Allocation`] — no store round trip per job. Only membership changes
//! (register/unregister/the periodic cleanup sweep) touch the shared [`Store`]; this keeps the
//! hot admission path as cheap as the single-process [`super::LocalBackend`] while still bounding
//! every instance to a fair, periodically-redistributed share of the global budget.

#[cfg(feature = "redis-backend")]
pub mod redis_store;
pub mod store;

pub use store::{CoordinatorConfig, InMemoryStore, Store};

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::{
    backend::{AcquireCtx, Allocation, AllocationCallback, AllocationChangeReason, Backend, ReleaseCtx, Unsubscribe},
    error::LimiterError,
    window::WindowCounter,
};

fn now_ms() -> Result<u64, LimiterError> {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .map_err(|e| LimiterError::Backend(e.to_string()))
}

struct LocalInstance {
    allocation: Allocation,
    in_flight: u64,
    job_type_in_flight: HashMap<String, u64>,
    tpm: Option<WindowCounter>,
    rpm: Option<WindowCounter>,
}

impl LocalInstance {
    fn from_allocation(allocation: Allocation, now: tokio::time::Instant) -> Self {
        Self {
            tpm: allocation
                .tokens_per_minute
                .map(|limit| WindowCounter::new(limit, Duration::from_secs(60), now)),
            rpm: allocation
                .requests_per_minute
                .map(|limit| WindowCounter::new(limit, Duration::from_secs(60), now)),
            in_flight: 0,
            job_type_in_flight: HashMap::new(),
            allocation,
        }
    }

    fn apply_allocation(&mut self, allocation: Allocation, now: tokio::time::Instant) {
        self.tpm = allocation
            .tokens_per_minute
            .map(|limit| WindowCounter::new(limit, Duration::from_secs(60), now));
        self.rpm = allocation
            .requests_per_minute
            .map(|limit| WindowCounter::new(limit, Duration::from_secs(60), now));
        self.allocation = allocation;
    }
}

struct CallbackEntry {
    id: u64,
    callback: AllocationCallback,
}

/// A [`Backend`] that coordinates capacity across a dynamic instance set through a [`Store`].
pub struct DistributedCoordinator<S: Store + 'static> {
    store: Arc<S>,
    config: CoordinatorConfig,
    instance_timeout: Duration,
    cleanup_interval: Duration,
    local: Mutex<HashMap<String, LocalInstance>>,
    callbacks: Arc<Mutex<Vec<CallbackEntry>>>,
    next_callback_id: AtomicU64,
    // Kept alive for the coordinator's lifetime; aborted on drop via `JoinHandle`'s own Drop glue
    // would detach rather than abort, so these are just held, not polled again.
    _background: Vec<JoinHandle<()>>,
}

impl<S: Store + 'static> DistributedCoordinator<S> {
    /// Build a coordinator over `store`, splitting `config`'s global budget fairly across
    /// whichever instances register, and spawn the cleanup-sweep and allocation-subscription
    /// background tasks. `instance_timeout` and `cleanup_interval` mirror §6's defaults (15 s /
    /// 10 s) but are caller-configurable.
    pub fn new(
        store: Arc<S>,
        config: CoordinatorConfig,
        instance_timeout: Duration,
        cleanup_interval: Duration,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak: &std::sync::Weak<Self>| {
            let cleanup = {
                let weak = weak.clone();
                let store = store.clone();
                tokio::spawn(async move {
                    let mut interval = tokio::time::interval(cleanup_interval);
                    loop {
                        interval.tick().await;
                        let Some(this) = weak.upgrade() else { break };
                        if let Ok(now) = now_ms() {
                            if let Ok((removed, allocations)) = store
                                .sweep_expired(now, this.instance_timeout.as_millis() as u64, &this.config)
                                .await
                            {
                                if !removed.is_empty() {
                                    this.apply_allocations(allocations, AllocationChangeReason::InstanceLeft);
                                }
                            }
                        }
                    }
                })
            };

            let subscription = {
                let weak = weak.clone();
                let mut rx = store.subscribe();
                tokio::spawn(async move {
                    while let Ok(allocations) = rx.recv().await {
                        let Some(this) = weak.upgrade() else { break };
                        this.apply_allocations(allocations, AllocationChangeReason::InstanceJoined);
                    }
                })
            };

            let mut background = vec![cleanup, subscription];
            if config.resources_per_job.is_some() {
                let weak = weak.clone();
                let store = store.clone();
                let interval_dur = config.rebalance.adjustment_interval();
                background.push(tokio::spawn(async move {
                    let mut interval = tokio::time::interval(interval_dur);
                    loop {
                        interval.tick().await;
                        let Some(this) = weak.upgrade() else { break };
                        this.report_job_type_usage().await;
                    }
                }));
            }

            Self {
                store,
                config,
                instance_timeout,
                cleanup_interval,
                local: Mutex::new(HashMap::new()),
                callbacks: Arc::new(Mutex::new(Vec::new())),
                next_callback_id: AtomicU64::new(0),
                _background: background,
            }
        })
    }

    /// Push this process's per-job-type in-flight snapshot to the store, which aggregates it
    /// with every other instance's snapshot and rebalances the global per-job-type ratio split
    /// (§4.8, mirroring §4.6's local donor/receiver algorithm over aggregated load instead of
    /// per-worker load). No-ops per instance if the store reports no change worth applying.
    async fn report_job_type_usage(&self) {
        let snapshots: Vec<(String, HashMap<String, u64>)> = {
            let local = self.local.lock().expect("local instance mutex poisoned");
            local
                .iter()
                .map(|(id, instance)| (id.clone(), instance.job_type_in_flight.clone()))
                .collect()
        };
        for (instance_id, counts) in snapshots {
            match self.store.report_job_type_usage(&instance_id, &counts, &self.config).await {
                Ok(allocations) => self.apply_allocations(allocations, AllocationChangeReason::ConfigChanged),
                Err(e) => warn!(target: "llm_rate_limiter", error = %e, "job-type usage report failed"),
            }
        }
    }

    fn apply_allocations(&self, allocations: HashMap<String, Allocation>, reason: AllocationChangeReason) {
        let now = tokio::time::Instant::now();
        let mut local = self.local.lock().expect("local instance mutex poisoned");
        let mut changed = Vec::new();
        for (instance_id, instance) in local.iter_mut() {
            if let Some(new_allocation) = allocations.get(instance_id) {
                if *new_allocation != instance.allocation {
                    instance.apply_allocation(new_allocation.clone(), now);
                    changed.push(new_allocation.clone());
                }
            }
        }
        drop(local);
        if changed.is_empty() {
            return;
        }
        let callbacks = self.callbacks.lock().expect("callbacks mutex poisoned");
        for allocation in changed {
            for entry in callbacks.iter() {
                (entry.callback)(allocation.clone(), reason);
            }
        }
    }
}

#[async_trait]
impl<S: Store + 'static> Backend for DistributedCoordinator<S> {
    async fn register(&self, instance_id: &str) -> Result<Allocation, LimiterError> {
        let now = now_ms()?;
        let allocations = self.store.register(instance_id, now, &self.config).await?;
        let allocation = allocations.get(instance_id).cloned().unwrap_or_default();
        self.local.lock().expect("local instance mutex poisoned").insert(
            instance_id.to_string(),
            LocalInstance::from_allocation(allocation.clone(), tokio::time::Instant::now()),
        );
        Ok(allocation)
    }

    async fn unregister(&self, instance_id: &str) -> Result<(), LimiterError> {
        self.store.unregister(instance_id, &self.config).await?;
        self.local.lock().expect("local instance mutex poisoned").remove(instance_id);
        Ok(())
    }

    async fn heartbeat(&self, instance_id: &str) -> Result<(), LimiterError> {
        let now = now_ms()?;
        self.store.heartbeat(instance_id, now).await
    }

    async fn acquire(&self, ctx: AcquireCtx<'_>) -> Result<bool, LimiterError> {
        let now = tokio::time::Instant::now();
        let mut local = self.local.lock().expect("local instance mutex poisoned");
        let Some(instance) = local.get_mut(ctx.instance_id) else {
            return Err(LimiterError::Backend(format!(
                "instance '{}' is not registered",
                ctx.instance_id
            )));
        };

        if instance.in_flight >= instance.allocation.slots as u64 {
            return Ok(false);
        }
        let tpm_ok = instance
            .tpm
            .as_mut()
            .map_or(true, |c| c.has_capacity_for(ctx.estimated.tokens, now));
        let rpm_ok = instance
            .rpm
            .as_mut()
            .map_or(true, |c| c.has_capacity_for(ctx.estimated.requests, now));
        if !tpm_ok || !rpm_ok {
            return Ok(false);
        }

        instance.in_flight += 1;
        *instance.job_type_in_flight.entry(ctx.job_type.to_string()).or_insert(0) += 1;
        if let Some(c) = instance.tpm.as_mut() {
            c.add(ctx.estimated.tokens, now);
        }
        if let Some(c) = instance.rpm.as_mut() {
            c.add(ctx.estimated.requests, now);
        }
        Ok(true)
    }

    async fn release(&self, ctx: ReleaseCtx<'_>) -> Result<(), LimiterError> {
        let now = tokio::time::Instant::now();
        let mut local = self.local.lock().expect("local instance mutex poisoned");
        let Some(instance) = local.get_mut(ctx.instance_id) else {
            // The instance may have been cleaned up concurrently (missed heartbeat); nothing to
            // release against. Per §7, backend release failures are swallowed, not propagated.
            return Ok(());
        };
        instance.in_flight = instance.in_flight.saturating_sub(1);
        if let Some(count) = instance.job_type_in_flight.get_mut(ctx.job_type) {
            *count = count.saturating_sub(1);
        }
        let actual = ctx.actual.unwrap_or_default();
        let refund_tokens = ctx.estimated.tokens.saturating_sub(actual.tokens);
        let refund_requests = ctx.estimated.requests.saturating_sub(actual.requests);
        if let Some(c) = instance.tpm.as_mut() {
            c.subtract(refund_tokens, now);
        }
        if let Some(c) = instance.rpm.as_mut() {
            c.subtract(refund_requests, now);
        }
        Ok(())
    }

    fn subscribe(&self, on_change: AllocationCallback) -> Unsubscribe {
        let id = self.next_callback_id.fetch_add(1, Ordering::SeqCst);
        self.callbacks
            .lock()
            .expect("callbacks mutex poisoned")
            .push(CallbackEntry { id, callback: on_change });

        let callbacks = self.callbacks.clone();
        Unsubscribe::new(move || {
            callbacks
                .lock()
                .expect("callbacks mutex poisoned")
                .retain(|entry| entry.id != id);
        })
    }

    async fn current_allocation(&self, instance_id: &str) -> Result<Allocation, LimiterError> {
        if let Some(instance) = self.local.lock().expect("local instance mutex poisoned").get(instance_id) {
            return Ok(instance.allocation.clone());
        }
        let allocations = self.store.current_allocations().await?;
        Ok(allocations.get(instance_id).cloned().unwrap_or_default())
    }
}
