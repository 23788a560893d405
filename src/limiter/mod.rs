//! The single-model limiter (§4.4): composes time-window counters, a concurrency semaphore, and
//! an optional memory semaphore into one admission decision per attempt.

mod reservation;
pub mod stats;

pub use reservation::Reservation;
pub use stats::ModelStats;

use std::{
    future::Future,
    sync::{Arc, Mutex},
    time::Duration,
};

use crate::{
    memory::MemoryManager,
    model::{ModelConfig, Usage, UsageEstimate},
    wait_queue::CapacityWaitQueue,
    window::WindowCounter,
};

struct Counters {
    rpm: Option<WindowCounter>,
    rpd: Option<WindowCounter>,
    tpm: Option<WindowCounter>,
    tpd: Option<WindowCounter>,
}

/// Admits and releases attempts against one model's rate limits.
///
/// The compound reservation acquires sub-limits in a fixed order — RPM, RPD, TPM, TPD,
/// concurrency, memory — and on any failure releases everything already acquired in reverse
/// order, so a rejected attempt never leaves a partial reservation behind (§4.4, I5). The whole
/// check-and-reserve is synchronous (guarded by a plain [`std::sync::Mutex`]) so it can be used
/// directly as a [`crate::wait_queue::CapacityWaitQueue`] `try_reserve` closure.
pub struct SingleModelLimiter {
    config: ModelConfig,
    counters: Mutex<Counters>,
    concurrency: Option<Arc<crate::semaphore::CountingSemaphore>>,
    memory: Option<Arc<MemoryManager>>,
    waiters: Arc<CapacityWaitQueue<Reservation>>,
    // Held only to keep the nudge task's `Weak` upgrade-able for this limiter's lifetime; never
    // polled again.
    _window_nudge: tokio::task::JoinHandle<()>,
}

/// Window rollovers free capacity without any corresponding `release()` call, so a waiter parked
/// purely on an exhausted time window would otherwise never be rechecked. This wakes the queue
/// periodically, independent of releases, so such waiters eventually see the reset window.
const WINDOW_NUDGE_INTERVAL: Duration = Duration::from_millis(250);

impl SingleModelLimiter {
    /// Build a limiter from a model's static configuration, optionally sharing a process-wide
    /// [`MemoryManager`].
    pub fn new(config: ModelConfig, memory: Option<Arc<MemoryManager>>) -> Arc<Self> {
        let now = tokio::time::Instant::now();
        let counters = Counters {
            rpm: config
                .requests_per_minute
                .map(|l| WindowCounter::new(l, Duration::from_secs(60), now)),
            rpd: config
                .requests_per_day
                .map(|l| WindowCounter::new(l, Duration::from_secs(86_400), now)),
            tpm: config
                .tokens_per_minute
                .map(|l| WindowCounter::new(l, Duration::from_secs(60), now)),
            tpd: config
                .tokens_per_day
                .map(|l| WindowCounter::new(l, Duration::from_secs(86_400), now)),
        };
        let concurrency = config
            .max_concurrent_requests
            .map(crate::semaphore::CountingSemaphore::new);
        let waiters = Arc::new(CapacityWaitQueue::new());
        let window_nudge = {
            let waiters = waiters.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(WINDOW_NUDGE_INTERVAL);
                loop {
                    interval.tick().await;
                    if Arc::strong_count(&waiters) == 1 {
                        break;
                    }
                    waiters.notify_capacity_available().await;
                }
            })
        };
        Arc::new(Self {
            config,
            counters: Mutex::new(counters),
            concurrency,
            memory,
            waiters,
            _window_nudge: window_nudge,
        })
    }

    /// The model id this limiter admits attempts for.
    pub fn model_id(&self) -> &str {
        &self.config.id
    }

    /// Whether `estimate` currently fits within every configured sub-limit, without reserving
    /// anything.
    pub fn has_capacity(&self, estimate: UsageEstimate) -> bool {
        let now = tokio::time::Instant::now();
        let mut counters = self.counters.lock().expect("counters mutex poisoned");
        let counters_ok = Self::counters_have_room(&mut counters, estimate, now);
        let concurrency_ok = self.concurrency.as_ref().map_or(true, |sem| sem.available() >= 1);
        counters_ok && concurrency_ok
    }

    fn counters_have_room(counters: &mut Counters, estimate: UsageEstimate, now: tokio::time::Instant) -> bool {
        let rpm_ok = counters
            .rpm
            .as_mut()
            .map_or(true, |c| c.has_capacity_for(estimate.requests, now));
        let rpd_ok = counters
            .rpd
            .as_mut()
            .map_or(true, |c| c.has_capacity_for(estimate.requests, now));
        let tpm_ok = counters
            .tpm
            .as_mut()
            .map_or(true, |c| c.has_capacity_for(estimate.tokens, now));
        let tpd_ok = counters
            .tpd
            .as_mut()
            .map_or(true, |c| c.has_capacity_for(estimate.tokens, now));
        rpm_ok && rpd_ok && tpm_ok && tpd_ok
    }

    /// Attempt to reserve `estimate` against every configured sub-limit, acquiring in the order
    /// RPM, RPD, TPM, TPD, concurrency, memory and unwinding in reverse on the first failure.
    ///
    /// Locks the counters mutex for the whole compound check-and-reserve, so the decision is
    /// atomic: no other attempt can observe a half-reserved state.
    fn try_reserve(self: &Arc<Self>, job_type_id: &str, estimate: UsageEstimate) -> Option<Reservation> {
        let now = tokio::time::Instant::now();
        {
            let mut counters = self.counters.lock().expect("counters mutex poisoned");
            if !Self::counters_have_room(&mut counters, estimate, now) {
                return None;
            }
            // All four counters have room; because the check and the reservation below happen
            // under the same lock, the group either commits together or not at all — there's no
            // window in which another caller observes e.g. RPM reserved but TPM not.
            if let Some(c) = counters.rpm.as_mut() {
                c.add(estimate.requests, now);
            }
            if let Some(c) = counters.rpd.as_mut() {
                c.add(estimate.requests, now);
            }
            if let Some(c) = counters.tpm.as_mut() {
                c.add(estimate.tokens, now);
            }
            if let Some(c) = counters.tpd.as_mut() {
                c.add(estimate.tokens, now);
            }
        }

        let concurrency_permit = if let Some(sem) = &self.concurrency {
            match sem.try_acquire(1) {
                Some(p) => Some(p),
                None => {
                    self.refund_counters(estimate, now);
                    return None;
                }
            }
        } else {
            None
        };

        let memory_permit = if let Some(mem) = &self.memory {
            match mem.try_acquire(job_type_id) {
                Some(p) => Some(p),
                None => {
                    drop(concurrency_permit);
                    self.refund_counters(estimate, now);
                    return None;
                }
            }
        } else {
            None
        };

        Some(Reservation::new(estimate, concurrency_permit, memory_permit))
    }

    fn refund_counters(&self, refund: UsageEstimate, now: tokio::time::Instant) {
        let mut counters = self.counters.lock().expect("counters mutex poisoned");
        if let Some(c) = counters.rpm.as_mut() {
            c.subtract(refund.requests, now);
        }
        if let Some(c) = counters.rpd.as_mut() {
            c.subtract(refund.requests, now);
        }
        if let Some(c) = counters.tpm.as_mut() {
            c.subtract(refund.tokens, now);
        }
        if let Some(c) = counters.tpd.as_mut() {
            c.subtract(refund.tokens, now);
        }
    }

    /// Run `job` under a reservation for `estimate`, waiting up to `max_wait` for capacity.
    ///
    /// On success, the reservation is held for the duration of `job`; afterwards the difference
    /// between `estimate` and the job's actual [`Usage`] is refunded to the time-window counters
    /// (never below zero) and the concurrency/memory permits are fully released (§4.4).
    ///
    /// Returns `Err(())` if capacity could not be reserved within `max_wait` — callers
    /// distinguish timeout from cancellation via the wait queue state, mirrored by
    /// [`crate::scheduler::Scheduler`] into the appropriate [`crate::error::LimiterError`].
    pub async fn queue_job<F, Fut, T, E>(
        self: &Arc<Self>,
        job_type_id: &str,
        estimate: UsageEstimate,
        max_wait: Duration,
        job: F,
    ) -> Result<Result<(T, Usage), E>, ()>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(T, Usage), E>>,
    {
        let reservation = {
            let limiter = self.clone();
            let job_type = job_type_id.to_string();
            self.waiters
                .wait_for_capacity(move || limiter.try_reserve(&job_type, estimate), max_wait)
                .await
        };

        let Some(reservation) = reservation else {
            return Err(());
        };

        let result = job().await;

        match &result {
            Ok((_, usage)) => {
                let actual = usage.estimate();
                self.refund_counters(estimate.saturating_sub(actual), tokio::time::Instant::now());
            }
            Err(_) => {
                self.refund_counters(estimate, tokio::time::Instant::now());
            }
        }
        drop(reservation);
        self.waiters.notify_capacity_available().await;

        Ok(result)
    }

    /// Cancel every waiter parked on this model's local admission (used by `Scheduler::stop`,
    /// alongside the job-type slot allocator's own `cancel_all`).
    pub async fn cancel_all(&self) {
        self.waiters.cancel_all().await;
    }

    /// A snapshot of this model's current counters and semaphore occupancy.
    pub fn stats(&self) -> ModelStats {
        let now = tokio::time::Instant::now();
        let mut counters = self.counters.lock().expect("counters mutex poisoned");
        ModelStats {
            model_id: self.config.id.clone(),
            requests_per_minute: counters.rpm.as_mut().map(|c| stats::counter_snapshot(c, now)),
            requests_per_day: counters.rpd.as_mut().map(|c| stats::counter_snapshot(c, now)),
            tokens_per_minute: counters.tpm.as_mut().map(|c| stats::counter_snapshot(c, now)),
            tokens_per_day: counters.tpd.as_mut().map(|c| stats::counter_snapshot(c, now)),
            concurrency: self.concurrency.as_ref().map(|sem| stats::SemaphoreStats {
                available: sem.available(),
                in_use: sem.in_use(),
                max: sem.max_permits(),
            }),
        }
    }
}

impl UsageEstimate {
    fn saturating_sub(self, rhs: UsageEstimate) -> UsageEstimate {
        UsageEstimate {
            tokens: self.tokens.saturating_sub(rhs.tokens),
            requests: self.requests.saturating_sub(rhs.requests),
        }
    }
}
