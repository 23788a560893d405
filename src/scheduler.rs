//! The multi-model escalation scheduler (§4.7) and its public submission API (§6).
//!
//! This is the crate's front door: [`Scheduler::queue_job`] carves out a job-type slot (§4.6),
//! then walks the configured escalation chain (§4.7) trying the backend, the local per-model
//! limiter (§4.4), and finally the caller's own job in turn, accumulating usage across every
//! attempt so cost accounting reflects the whole chain, not just the model that ultimately
//! admitted the job.

use std::{
    collections::HashMap,
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use tokio::task::JoinHandle;
use tracing::{info, instrument, warn};

use crate::{
    allocator::SlotAllocator,
    backend::{AcquireCtx, Backend, ReleaseCtx, Unsubscribe},
    config::LimiterConfig,
    error::LimiterError,
    limiter::SingleModelLimiter,
    memory::MemoryManager,
    model::{Usage, UsageEntry, UsageEstimate},
    stats::LimiterStats,
};

/// What one model attempt decided, standing in for the distilled spec's `resolve()`/`reject()`
/// callback pair (§9): the closure returns this directly instead of calling one of two
/// side-effecting functions, so "must call resolve or reject exactly once" is enforced by the
/// return type rather than at runtime.
#[derive(Debug)]
pub enum Outcome<T> {
    /// The job succeeded on this model; the chain stops here.
    Resolved(T),
    /// The job did not complete on this model.
    Rejected {
        /// Whether the scheduler should try the next model in the chain.
        delegate: bool,
    },
}

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A job attempt: given the model id it's about to run against, returns the attempt's
/// [`Outcome`] and the [`Usage`] it actually consumed (reported regardless of resolve/reject,
/// since even a rejected attempt may have consumed tokens), or an `Err` if the attempt itself
/// failed (the user code threw rather than resolving/rejecting).
pub type JobFn<T> = Arc<dyn Fn(String) -> BoxFuture<'static, Result<(Outcome<T>, Usage), String>> + Send + Sync>;

/// One job submission.
pub struct JobRequest<T> {
    /// Identifier used in logging and callbacks.
    pub job_id: String,
    /// Which [`crate::job_type::JobTypeConfig`] this job belongs to, for slot allocation and
    /// default resource estimation.
    pub job_type: String,
    /// The attempt closure, invoked once per model tried.
    pub job: JobFn<T>,
    /// Per-attempt resource estimate. Defaults to the job type's configured estimate if `None`.
    pub estimate: Option<UsageEstimate>,
    /// Maximum time to wait for a job-type slot or per-model capacity before failing.
    pub max_wait: Duration,
}

/// The result of a successful [`Scheduler::queue_job`] call.
#[derive(Debug)]
pub struct JobOutcome<T> {
    /// The value the winning attempt resolved with.
    pub value: T,
    /// Total cost across every attempted model.
    pub total_cost: f64,
    /// One entry per attempted model, in attempt order.
    pub usage: Vec<UsageEntry>,
}

struct ModelEntry {
    limiter: Arc<SingleModelLimiter>,
    pricing: crate::model::Pricing,
}

/// Coordinates admission across a local job-type allocator, a per-model limiter chain, and a
/// pluggable [`Backend`] for cross-instance fairness.
pub struct Scheduler {
    instance_id: String,
    label: Option<String>,
    escalation_order: Vec<String>,
    models: HashMap<String, ModelEntry>,
    job_types: HashMap<String, crate::job_type::JobTypeConfig>,
    allocator: Arc<SlotAllocator>,
    memory: Option<Arc<MemoryManager>>,
    backend: Arc<dyn Backend>,
    on_log: Option<Arc<dyn Fn(&str, serde_json::Value) + Send + Sync>>,
    started: AtomicBool,
    heartbeat_task: std::sync::Mutex<Option<JoinHandle<()>>>,
    allocation_subscription: std::sync::Mutex<Option<Unsubscribe>>,
}

impl Scheduler {
    /// Build a scheduler from validated configuration, wiring a fresh [`SlotAllocator`] and one
    /// [`SingleModelLimiter`] per configured model. Does not contact the backend; call
    /// [`Scheduler::start`] for that.
    pub fn new(mut config: LimiterConfig) -> Result<Arc<Self>, LimiterError> {
        config.validate()?;

        let memory = config
            .memory
            .map(|mem_config| MemoryManager::acquire_shared(config.label.as_deref().unwrap_or("default"), mem_config));

        if let Some(memory) = &memory {
            for (id, job_type) in &config.resource_estimations_per_job {
                memory.register_job_type(id, job_type.estimated_used_memory_kb);
            }
        }

        let models = config
            .models
            .into_iter()
            .map(|(id, model_config)| {
                let pricing = model_config.pricing;
                let limiter = SingleModelLimiter::new(model_config, memory.clone());
                (id, ModelEntry { limiter, pricing })
            })
            .collect();

        // Capacity is unknown until `start()` registers with the backend and receives a real
        // allocation; constructing with zero slots means a scheduler that's built but never
        // started correctly admits nothing rather than some arbitrary guessed capacity.
        let job_type_configs: Vec<_> = config.resource_estimations_per_job.values().cloned().collect();
        let allocator = SlotAllocator::new(job_type_configs, 0, config.rebalance);

        Ok(Arc::new(Self {
            instance_id: uuid::Uuid::new_v4().to_string(),
            label: config.label,
            escalation_order: config.escalation_order,
            models,
            job_types: config.resource_estimations_per_job,
            allocator,
            memory,
            backend: config.backend,
            on_log: config.on_log,
            started: AtomicBool::new(false),
            heartbeat_task: std::sync::Mutex::new(None),
            allocation_subscription: std::sync::Mutex::new(None),
        }))
    }

    fn log(&self, event: &str, data: serde_json::Value) {
        if let Some(on_log) = &self.on_log {
            on_log(event, data.clone());
        }
        info!(target: "llm_rate_limiter", scheduler = self.label.as_deref().unwrap_or(""), event, %data);
    }

    /// Register with the backend, receive this instance's initial allocation, and start the
    /// heartbeat timer. Idempotent: a second call is a no-op.
    pub async fn start(self: &Arc<Self>) -> Result<(), LimiterError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let allocation = self.backend.register(&self.instance_id).await?;
        self.allocator.set_total_capacity(allocation.slots);
        if !allocation.job_types.is_empty() {
            self.allocator.set_job_type_capacities(&allocation.job_types);
        }
        self.log("instance_registered", serde_json::json!({ "instance_id": self.instance_id, "slots": allocation.slots }));

        // Membership changes elsewhere in the fleet redistribute the global budget without this
        // instance issuing any acquire/release of its own; subscribing is how it finds out its
        // slot share changed and keeps the local allocator's capacity in step (§4.8's "push
        // notifications on allocation changes").
        let subscription = {
            let allocator = self.allocator.clone();
            let label = self.label.clone();
            self.backend.subscribe(Arc::new(move |allocation, reason| {
                allocator.set_total_capacity(allocation.slots);
                if !allocation.job_types.is_empty() {
                    allocator.set_job_type_capacities(&allocation.job_types);
                }
                info!(
                    target: "llm_rate_limiter",
                    scheduler = label.as_deref().unwrap_or(""),
                    slots = allocation.slots,
                    reason = ?reason,
                    "allocation_changed"
                );
            }))
        };
        *self
            .allocation_subscription
            .lock()
            .expect("allocation subscription mutex poisoned") = Some(subscription);

        let handle = {
            let this = self.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(Duration::from_secs(5));
                loop {
                    interval.tick().await;
                    if let Err(e) = this.backend.heartbeat(&this.instance_id).await {
                        warn!(target: "llm_rate_limiter", error = %e, "heartbeat failed");
                    }
                }
            })
        };
        *self.heartbeat_task.lock().expect("heartbeat task mutex poisoned") = Some(handle);
        Ok(())
    }

    /// Unregister from the backend, cancel every pending waiter, and stop timers. Idempotent.
    /// In-flight user jobs are not cancelled; `stop()` does not wait for them to finish.
    pub async fn stop(self: &Arc<Self>) -> Result<(), LimiterError> {
        if !self.started.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(handle) = self.heartbeat_task.lock().expect("heartbeat task mutex poisoned").take() {
            handle.abort();
        }
        if let Some(subscription) = self
            .allocation_subscription
            .lock()
            .expect("allocation subscription mutex poisoned")
            .take()
        {
            subscription.unsubscribe();
        }
        self.allocator.cancel_all().await;
        for entry in self.models.values() {
            entry.limiter.cancel_all().await;
        }
        if let Some(memory) = &self.memory {
            memory.release();
        }
        self.backend.unregister(&self.instance_id).await
    }

    /// `stop()` clears `started` before cancelling waiters, so a waiter that loses the race sees
    /// `started == false` and is told it was cancelled rather than merely timed out — the wait
    /// queue's oneshot channel carries no reason of its own, only `None` (§4.3), so this is the
    /// only signal available to tell the two cases apart.
    fn wait_failure(&self) -> LimiterError {
        if self.started.load(Ordering::SeqCst) {
            LimiterError::Timeout
        } else {
            LimiterError::Cancelled
        }
    }

    fn default_estimate(&self, job_type_id: &str) -> UsageEstimate {
        self.job_types
            .get(job_type_id)
            .map(|jt| UsageEstimate {
                tokens: jt.estimated_used_tokens,
                requests: jt.estimated_number_of_requests,
            })
            .unwrap_or_default()
    }

    /// Submit a job, walking the full escalation chain (§4.7).
    #[instrument(skip(self, req), fields(job_id = %req.job_id, job_type = %req.job_type))]
    pub async fn queue_job<T: Send + 'static>(&self, req: JobRequest<T>) -> Result<JobOutcome<T>, LimiterError> {
        if !self.job_types.is_empty() && !self.job_types.contains_key(&req.job_type) {
            return Err(LimiterError::UnknownJobType(req.job_type));
        }
        let estimate = req.estimate.unwrap_or_else(|| self.default_estimate(&req.job_type));

        let slot_guard = self
            .allocator
            .acquire(&req.job_type, req.max_wait)
            .await
            .transpose()
            .map_err(|()| self.wait_failure())?;

        let mut usage_entries = Vec::new();
        let mut total_cost = 0.0;

        for model_id in &self.escalation_order {
            let entry = self
                .models
                .get(model_id)
                .expect("escalation_order was validated against models at construction");

            let granted = self
                .backend
                .acquire(AcquireCtx {
                    instance_id: &self.instance_id,
                    model_id,
                    job_id: &req.job_id,
                    job_type: &req.job_type,
                    estimated: estimate,
                })
                .await?;
            if !granted {
                self.log("backend_rejected", serde_json::json!({ "model": model_id, "job_id": req.job_id }));
                continue;
            }

            let local_result = entry
                .limiter
                .queue_job(&req.job_type, estimate, Duration::ZERO, {
                    let job = req.job.clone();
                    let model_id = model_id.clone();
                    move || job(model_id)
                })
                .await;

            let Ok(attempt) = local_result else {
                self.backend
                    .release(ReleaseCtx {
                        instance_id: &self.instance_id,
                        model_id,
                        job_id: &req.job_id,
                        job_type: &req.job_type,
                        estimated: estimate,
                        actual: None,
                    })
                    .await
                    .ok();
                self.log("local_admission_rejected", serde_json::json!({ "model": model_id, "job_id": req.job_id }));
                continue;
            };

            match attempt {
                Err(err) => {
                    self.backend
                        .release(ReleaseCtx {
                            instance_id: &self.instance_id,
                            model_id,
                            job_id: &req.job_id,
                            job_type: &req.job_type,
                            estimated: estimate,
                            actual: None,
                        })
                        .await
                        .ok();
                    drop(slot_guard);
                    return Err(LimiterError::JobFailed(err));
                }
                Ok((outcome, usage)) => {
                    let actual = usage.estimate();
                    self.backend
                        .release(ReleaseCtx {
                            instance_id: &self.instance_id,
                            model_id,
                            job_id: &req.job_id,
                            job_type: &req.job_type,
                            estimated: estimate,
                            actual: Some(actual),
                        })
                        .await
                        .ok();

                    let cost = entry.pricing.cost(usage.input_tokens, usage.cached_tokens, usage.output_tokens);
                    total_cost += cost;
                    usage_entries.push(UsageEntry {
                        model_id: model_id.clone(),
                        input_tokens: usage.input_tokens,
                        cached_tokens: usage.cached_tokens,
                        output_tokens: usage.output_tokens,
                        request_count: usage.request_count,
                        cost,
                    });

                    match outcome {
                        Outcome::Resolved(value) => {
                            drop(slot_guard);
                            self.log("job_resolved", serde_json::json!({ "model": model_id, "job_id": req.job_id, "total_cost": total_cost }));
                            return Ok(JobOutcome {
                                value,
                                total_cost,
                                usage: usage_entries,
                            });
                        }
                        Outcome::Rejected { delegate: true } => continue,
                        Outcome::Rejected { delegate: false } => {
                            drop(slot_guard);
                            return Err(LimiterError::RejectedWithoutDelegation);
                        }
                    }
                }
            }
        }

        drop(slot_guard);
        Err(LimiterError::AllModelsRejected)
    }

    /// Submit a job against a single named model, bypassing escalation entirely. Still subject
    /// to job-type slot allocation.
    pub async fn queue_job_for_model<T: Send + 'static>(
        &self,
        model_id: &str,
        req: JobRequest<T>,
    ) -> Result<JobOutcome<T>, LimiterError> {
        let entry = self
            .models
            .get(model_id)
            .ok_or_else(|| LimiterError::UnknownModel(model_id.to_string()))?;
        self.queue_job_single(model_id, entry, req).await
    }

    async fn queue_job_single<T: Send + 'static>(
        &self,
        model_id: &str,
        entry: &ModelEntry,
        req: JobRequest<T>,
    ) -> Result<JobOutcome<T>, LimiterError> {
        if !self.job_types.is_empty() && !self.job_types.contains_key(&req.job_type) {
            return Err(LimiterError::UnknownJobType(req.job_type));
        }
        let estimate = req.estimate.unwrap_or_else(|| self.default_estimate(&req.job_type));
        let slot_guard = self
            .allocator
            .acquire(&req.job_type, req.max_wait)
            .await
            .transpose()
            .map_err(|()| self.wait_failure())?;

        let granted = self
            .backend
            .acquire(AcquireCtx {
                instance_id: &self.instance_id,
                model_id,
                job_id: &req.job_id,
                job_type: &req.job_type,
                estimated: estimate,
            })
            .await?;
        if !granted {
            drop(slot_guard);
            return Err(LimiterError::AllModelsRejected);
        }

        let local_result = entry
            .limiter
            .queue_job(&req.job_type, estimate, req.max_wait, {
                let job = req.job.clone();
                let model_id = model_id.to_string();
                move || job(model_id)
            })
            .await;

        let Ok(attempt) = local_result else {
            self.backend
                .release(ReleaseCtx {
                    instance_id: &self.instance_id,
                    model_id,
                    job_id: &req.job_id,
                    job_type: &req.job_type,
                    estimated: estimate,
                    actual: None,
                })
                .await
                .ok();
            drop(slot_guard);
            return Err(self.wait_failure());
        };

        drop(slot_guard);
        match attempt {
            Err(err) => {
                self.backend
                    .release(ReleaseCtx {
                        instance_id: &self.instance_id,
                        model_id,
                        job_id: &req.job_id,
                        job_type: &req.job_type,
                        estimated: estimate,
                        actual: None,
                    })
                    .await
                    .ok();
                Err(LimiterError::JobFailed(err))
            }
            Ok((outcome, usage)) => {
                let actual = usage.estimate();
                self.backend
                    .release(ReleaseCtx {
                        instance_id: &self.instance_id,
                        model_id,
                        job_id: &req.job_id,
                        job_type: &req.job_type,
                        estimated: estimate,
                        actual: Some(actual),
                    })
                    .await
                    .ok();
                let cost = entry.pricing.cost(usage.input_tokens, usage.cached_tokens, usage.output_tokens);
                let entry_record = UsageEntry {
                    model_id: model_id.to_string(),
                    input_tokens: usage.input_tokens,
                    cached_tokens: usage.cached_tokens,
                    output_tokens: usage.output_tokens,
                    request_count: usage.request_count,
                    cost,
                };
                match outcome {
                    Outcome::Resolved(value) => Ok(JobOutcome {
                        value,
                        total_cost: cost,
                        usage: vec![entry_record],
                    }),
                    Outcome::Rejected { .. } => Err(LimiterError::RejectedWithoutDelegation),
                }
            }
        }
    }

    /// A snapshot of every configured model's counters/semaphores plus the allocator's state.
    pub fn stats(&self) -> LimiterStats {
        LimiterStats {
            models: self.models.iter().map(|(id, e)| (id.clone(), e.limiter.stats())).collect(),
            job_types: self
                .allocator
                .job_types()
                .filter_map(|id| {
                    self.allocator.state(id).map(|state| {
                        (
                            id.to_string(),
                            crate::stats::AllocatorStats {
                                ratio: state.ratio(),
                                in_flight: state.in_flight(),
                                allocated_slots: state.allocated_slots(),
                            },
                        )
                    })
                })
                .collect(),
            memory: self.memory.as_ref().map(|m| m.stats()),
        }
    }

    /// One model's stats, if configured.
    pub fn model_stats(&self, model_id: &str) -> Option<crate::limiter::ModelStats> {
        self.models.get(model_id).map(|e| e.limiter.stats())
    }

    /// Whether any model in the chain currently has room for a job type's default estimate.
    pub fn has_capacity(&self, job_type_id: &str) -> bool {
        let estimate = self.default_estimate(job_type_id);
        self.escalation_order
            .iter()
            .filter_map(|id| self.models.get(id))
            .any(|entry| entry.limiter.has_capacity(estimate))
    }
}
