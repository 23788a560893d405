//! The process-wide memory manager (§4.5).
//!
//! A single [`MemoryManager`] per `label` is shared across every [`crate::Scheduler`] in the
//! process: host memory is a process-level resource, not a per-scheduler one, so each scheduler
//! acquiring its own independent estimate would double-count. The registry reference-counts
//! construction, starting the periodic resize timer on the first `start()` and stopping it on
//! the last `stop()` (§9, "Global memory singleton").

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex, OnceLock, Weak,
    },
};

use sysinfo::System;
use tokio::task::JoinHandle;

use crate::{config::MemoryConfig, semaphore::CountingSemaphore};

fn registry() -> &'static Mutex<HashMap<String, Weak<MemoryManager>>> {
    static REGISTRY: OnceLock<Mutex<HashMap<String, Weak<MemoryManager>>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// A held slice of the process-wide memory budget, released on drop.
pub struct MemoryPermit(crate::semaphore::Permit);

/// Resizes its internal semaphore to track a fraction of free host memory, shared by every
/// scheduler that opts in.
pub struct MemoryManager {
    semaphore: Arc<CountingSemaphore>,
    job_type_memory_kb: Mutex<HashMap<String, u64>>,
    refcount: AtomicUsize,
    label: String,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl MemoryManager {
    /// Get or create the shared manager for `label`, incrementing its reference count.
    ///
    /// Call [`MemoryManager::release`] (typically from `Scheduler::stop`) exactly once per call
    /// to this function to keep the refcount balanced; the resize timer stops when it reaches
    /// zero.
    pub fn acquire_shared(label: &str, config: MemoryConfig) -> Arc<Self> {
        let mut reg = registry().lock().expect("memory registry poisoned");
        if let Some(existing) = reg.get(label).and_then(Weak::upgrade) {
            existing.refcount.fetch_add(1, Ordering::SeqCst);
            return existing;
        }

        let initial_kb = estimate_available_kb(config.free_memory_ratio);
        let manager = Arc::new(Self {
            semaphore: CountingSemaphore::new(initial_kb as usize),
            job_type_memory_kb: Mutex::new(HashMap::new()),
            refcount: AtomicUsize::new(1),
            label: label.to_string(),
            timer: Mutex::new(None),
        });

        let handle = {
            let manager = manager.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(config.recalculation_interval());
                interval.tick().await; // first tick fires immediately; skip, we just sized above
                loop {
                    interval.tick().await;
                    let kb = estimate_available_kb(config.free_memory_ratio);
                    manager.semaphore.resize(kb as usize);
                }
            })
        };
        *manager.timer.lock().expect("timer mutex poisoned") = Some(handle);

        reg.insert(label.to_string(), Arc::downgrade(&manager));
        manager
    }

    /// Register a job type's per-invocation memory estimate, so [`MemoryManager::try_acquire`]
    /// knows how many KB to reserve for it.
    pub fn register_job_type(&self, job_type_id: &str, estimated_kb: u64) {
        self.job_type_memory_kb
            .lock()
            .expect("job type memory mutex poisoned")
            .insert(job_type_id.to_string(), estimated_kb);
    }

    /// Reserve `job_type_id`'s registered memory estimate, or `None` if insufficient memory is
    /// free. A job type with no registered estimate reserves zero KB, which always succeeds
    /// immediately (see [`CountingSemaphore::try_acquire`]'s zero-sized fast path) — it isn't
    /// memory-tracked, but still returns a (trivial) permit rather than `None`, so callers can't
    /// mistake "not tracked" for "rejected".
    pub fn try_acquire(self: &Arc<Self>, job_type_id: &str) -> Option<MemoryPermit> {
        let kb = *self
            .job_type_memory_kb
            .lock()
            .expect("job type memory mutex poisoned")
            .get(job_type_id)
            .unwrap_or(&0);
        self.semaphore.try_acquire(kb as usize).map(MemoryPermit)
    }

    /// Release this manager's reference, stopping the resize timer and evicting it from the
    /// registry once the last holder has released.
    pub fn release(&self) {
        if self.refcount.fetch_sub(1, Ordering::SeqCst) == 1 {
            if let Some(handle) = self.timer.lock().expect("timer mutex poisoned").take() {
                handle.abort();
            }
            registry()
                .lock()
                .expect("memory registry poisoned")
                .remove(&self.label);
        }
    }

    /// Snapshot of the shared memory semaphore.
    pub fn stats(&self) -> crate::limiter::stats::SemaphoreStats {
        crate::limiter::stats::SemaphoreStats {
            available: self.semaphore.available(),
            in_use: self.semaphore.in_use(),
            max: self.semaphore.max_permits(),
        }
    }
}

fn estimate_available_kb(free_memory_ratio: f64) -> u64 {
    let mut system = System::new();
    system.refresh_memory();
    let available_kb = system.available_memory() / 1024;
    ((available_kb as f64) * free_memory_ratio) as u64
}
