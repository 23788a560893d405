//! The shared-store interface behind the distributed coordinator (§4.8), plus the in-memory
//! reference implementation.
//!
//! Every multi-step sequence the coordinator needs — register, unregister, and the periodic
//! cleanup sweep, each of which reads the instance set, recomputes fair shares, and writes both
//! back — must be atomic (§4.8, "Concurrency on the shared store"). [`InMemoryStore`] gets this
//! for free from a single [`std::sync::Mutex`] critical section per call; [`super::redis_store::RedisStore`]
//! gets it from a Lua `EVAL` script doing the equivalent read-compute-write in one round trip.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::{backend::Allocation, config::RebalanceConfig, error::LimiterError, job_type::RatioConfig};

/// The global capacity this coordinator's instances split between them.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Total concurrency slots shared across every instance.
    pub total_capacity: usize,
    /// Total tokens-per-minute budget, if one is tracked globally.
    pub total_tokens_per_minute: Option<u64>,
    /// Total requests-per-minute budget, if one is tracked globally.
    pub total_requests_per_minute: Option<u64>,
    /// Per-job-type ratio tuning for a *global* mirror of §4.6's local rebalancing: when set,
    /// each job type's slot budget is carved from `total_capacity` by ratio, adaptively
    /// rebalanced from aggregated cross-instance in-flight counts rather than per-worker ones,
    /// then fair-shared across instances the same way the plain instance split is. `None` (the
    /// default) leaves job-type slot carving entirely to each instance's local
    /// [`crate::allocator::SlotAllocator`].
    pub resources_per_job: Option<HashMap<String, RatioConfig>>,
    /// Thresholds for the global job-type rebalance above. Ignored when `resources_per_job` is
    /// `None`.
    pub rebalance: RebalanceConfig,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            total_capacity: 0,
            total_tokens_per_minute: None,
            total_requests_per_minute: None,
            resources_per_job: None,
            rebalance: RebalanceConfig::default(),
        }
    }
}

/// Split `total` as evenly as possible across `n` recipients: a base share for everyone, plus one
/// extra for the lexicographically-first `remainder` recipients, so the shares sum to exactly
/// `total` (§4.8, "Redistribution", steps 2-3).
pub(crate) fn fair_share(total: u64, ids: &[String]) -> HashMap<String, u64> {
    let n = ids.len() as u64;
    if n == 0 {
        return HashMap::new();
    }
    let base = total / n;
    let remainder = (total % n) as usize;
    let mut sorted = ids.to_vec();
    sorted.sort();
    sorted
        .into_iter()
        .enumerate()
        .map(|(i, id)| (id, if i < remainder { base + 1 } else { base }))
        .collect()
}

/// Normalize `resources_per_job`'s `initial_value`s to sum to 1 (mirroring
/// [`crate::allocator::SlotAllocator::new`]'s normalization, generalized from one worker's ratios
/// to the global split): types with no explicit value share the remaining mass equally.
fn initial_job_type_ratios(resources_per_job: &HashMap<String, RatioConfig>) -> HashMap<String, f64> {
    let explicit_total: f64 = resources_per_job.values().filter_map(|r| r.initial_value).sum();
    let unset_count = resources_per_job.values().filter(|r| r.initial_value.is_none()).count();
    let remaining = (1.0 - explicit_total).max(0.0);
    let share_per_unset = if unset_count > 0 { remaining / unset_count as f64 } else { 0.0 };

    let mut ratios: HashMap<String, f64> = resources_per_job
        .iter()
        .map(|(id, r)| (id.clone(), r.initial_value.unwrap_or(share_per_unset)))
        .collect();
    let sum: f64 = ratios.values().sum();
    if sum > 0.0 {
        for v in ratios.values_mut() {
            *v /= sum;
        }
    }
    ratios
}

/// One rebalancing pass over the global per-job-type ratios, given each type's aggregated
/// cross-instance load. Mirrors [`crate::allocator::SlotAllocator::rebalance`]'s donor/receiver
/// arithmetic exactly, operating on plain maps instead of per-worker [`crate::job_type::JobTypeState`]s
/// since this ratio is shared store state rather than one allocator's.
fn rebalance_job_type_ratios(
    ratios: &HashMap<String, f64>,
    loads: &HashMap<String, f64>,
    resources_per_job: &HashMap<String, RatioConfig>,
    config: &RebalanceConfig,
) -> HashMap<String, f64> {
    let ratio_of = |id: &str| ratios.get(id).copied().unwrap_or(0.0);
    let load_of = |id: &str| loads.get(id).copied().unwrap_or(0.0);

    let mut donor_contributions: HashMap<&str, f64> = HashMap::new();
    let mut total_contribution = 0.0;
    for (id, cfg) in resources_per_job {
        if !cfg.flexible {
            continue;
        }
        let ratio = ratio_of(id);
        let load = load_of(id);
        if load < config.low_threshold && ratio > config.min_ratio {
            let contribution = (ratio - config.min_ratio).min(config.max_adjustment) * (1.0 - load);
            donor_contributions.insert(id.as_str(), contribution);
            total_contribution += contribution;
        }
    }

    let receiver_load_sum: f64 = resources_per_job
        .iter()
        .filter(|(id, cfg)| cfg.flexible && load_of(id) > config.high_threshold)
        .map(|(id, _)| load_of(id))
        .sum();

    let mut updated: HashMap<String, f64> = HashMap::with_capacity(resources_per_job.len());
    for (id, cfg) in resources_per_job {
        if !cfg.flexible {
            // Inflexible types retain their ratio exactly, every pass.
            updated.insert(id.clone(), ratio_of(id));
            continue;
        }
        let mut ratio = ratio_of(id);
        if let Some(contribution) = donor_contributions.get(id.as_str()) {
            ratio -= contribution;
        } else if total_contribution > 0.0 && receiver_load_sum > 0.0 {
            let load = load_of(id);
            if load > config.high_threshold {
                ratio += total_contribution * (load / receiver_load_sum);
            }
        }
        updated.insert(id.clone(), ratio);
    }

    let sum: f64 = updated.values().sum();
    if sum > 0.0 {
        for v in updated.values_mut() {
            *v /= sum;
        }
    }
    updated
}

fn compute_allocations(
    ids: &[String],
    config: &CoordinatorConfig,
    job_type_ratios: Option<&HashMap<String, f64>>,
) -> HashMap<String, Allocation> {
    let slots = fair_share(config.total_capacity as u64, ids);
    let tpm = config
        .total_tokens_per_minute
        .map(|total| fair_share(total, ids));
    let rpm = config
        .total_requests_per_minute
        .map(|total| fair_share(total, ids));

    // Each job type's global slot budget (total_capacity * ratio) is itself fair-shared across
    // instances, the same way the plain `slots` split above is — just one level deeper.
    let job_type_shares: HashMap<&String, HashMap<String, u64>> = job_type_ratios
        .into_iter()
        .flat_map(|ratios| ratios.iter())
        .map(|(job_type, ratio)| {
            let budget = (config.total_capacity as f64 * ratio).floor() as u64;
            (job_type, fair_share(budget, ids))
        })
        .collect();

    ids.iter()
        .map(|id| {
            let job_types = job_type_shares
                .iter()
                .filter_map(|(job_type, shares)| shares.get(id).map(|&s| ((*job_type).clone(), s as usize)))
                .collect();
            (
                id.clone(),
                Allocation {
                    slots: slots.get(id).copied().unwrap_or(0) as usize,
                    tokens_per_minute: tpm.as_ref().and_then(|m| m.get(id).copied()),
                    requests_per_minute: rpm.as_ref().and_then(|m| m.get(id).copied()),
                    job_types,
                },
            )
        })
        .collect()
}

/// The shared state a [`super::DistributedCoordinator`] coordinates through.
///
/// Each method is one atomic operation against the store, mirroring the reference design's
/// server-side-script approach (§4.8): a conforming implementation must not let a concurrent
/// caller observe a partially-applied register/unregister/sweep.
#[async_trait]
pub trait Store: Send + Sync {
    /// Add `instance_id` to the membership set and recompute every instance's allocation.
    /// Returns the full, post-redistribution allocation map.
    async fn register(
        &self,
        instance_id: &str,
        now_ms: u64,
        config: &CoordinatorConfig,
    ) -> Result<HashMap<String, Allocation>, LimiterError>;

    /// Remove `instance_id` and recompute. Returns the full, post-redistribution allocation map.
    async fn unregister(
        &self,
        instance_id: &str,
        config: &CoordinatorConfig,
    ) -> Result<HashMap<String, Allocation>, LimiterError>;

    /// Record liveness for `instance_id`. Not a CAS sequence — a plain timestamp write.
    async fn heartbeat(&self, instance_id: &str, now_ms: u64) -> Result<(), LimiterError>;

    /// Remove every instance whose last heartbeat is older than `timeout_ms`, recomputing
    /// allocations if any were removed. Returns the removed ids and the (possibly unchanged)
    /// allocation map.
    async fn sweep_expired(
        &self,
        now_ms: u64,
        timeout_ms: u64,
        config: &CoordinatorConfig,
    ) -> Result<(Vec<String>, HashMap<String, Allocation>), LimiterError>;

    /// The current allocation map, without mutating anything.
    async fn current_allocations(&self) -> Result<HashMap<String, Allocation>, LimiterError>;

    /// Report `instance_id`'s current per-job-type in-flight counts toward the global ratio
    /// split (§4.8, `CoordinatorConfig::resources_per_job`): aggregates them with every other
    /// instance's last-reported counts, runs one rebalancing pass over the resulting load, and
    /// recomputes every instance's allocation (including its `Allocation::job_types` share).
    /// A no-op returning the unchanged allocation map when `resources_per_job` isn't configured.
    async fn report_job_type_usage(
        &self,
        instance_id: &str,
        in_flight: &HashMap<String, u64>,
        config: &CoordinatorConfig,
    ) -> Result<HashMap<String, Allocation>, LimiterError>;

    /// Subscribe to allocation-map changes, as published by `register`/`unregister`/`sweep_expired`.
    fn subscribe(&self) -> broadcast::Receiver<HashMap<String, Allocation>>;
}

struct InMemoryState {
    instances: HashMap<String, u64>, // instance_id -> last_heartbeat_ms
    allocations: HashMap<String, Allocation>,
    job_type_ratios: HashMap<String, f64>, // normalized, persists across redistributions
    job_type_in_flight: HashMap<String, HashMap<String, u64>>, // instance_id -> job_type -> count
}

/// A single-process, mutex-guarded [`Store`], used for tests and for embedders who want
/// coordinated multi-worker semantics without an external dependency (e.g. several
/// [`crate::Scheduler`]s in one process sharing one [`InMemoryStore`]).
pub struct InMemoryStore {
    state: Mutex<InMemoryState>,
    notify: broadcast::Sender<HashMap<String, Allocation>>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    /// An empty store with no registered instances.
    pub fn new() -> Self {
        let (notify, _rx) = broadcast::channel(64);
        Self {
            state: Mutex::new(InMemoryState {
                instances: HashMap::new(),
                allocations: HashMap::new(),
                job_type_ratios: HashMap::new(),
                job_type_in_flight: HashMap::new(),
            }),
            notify,
        }
    }

    fn recompute_locked(
        &self,
        state: &mut InMemoryState,
        config: &CoordinatorConfig,
    ) -> HashMap<String, Allocation> {
        if let Some(resources_per_job) = &config.resources_per_job {
            if state.job_type_ratios.is_empty() && !resources_per_job.is_empty() {
                state.job_type_ratios = initial_job_type_ratios(resources_per_job);
            }
        }
        let ids: Vec<String> = state.instances.keys().cloned().collect();
        let ratios = (!state.job_type_ratios.is_empty()).then(|| state.job_type_ratios.clone());
        let allocations = compute_allocations(&ids, config, ratios.as_ref());
        state.allocations = allocations.clone();
        allocations
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn register(
        &self,
        instance_id: &str,
        now_ms: u64,
        config: &CoordinatorConfig,
    ) -> Result<HashMap<String, Allocation>, LimiterError> {
        let allocations = {
            let mut state = self.state.lock().expect("in-memory store mutex poisoned");
            state.instances.insert(instance_id.to_string(), now_ms);
            self.recompute_locked(&mut state, config)
        };
        let _ = self.notify.send(allocations.clone());
        Ok(allocations)
    }

    async fn unregister(
        &self,
        instance_id: &str,
        config: &CoordinatorConfig,
    ) -> Result<HashMap<String, Allocation>, LimiterError> {
        let allocations = {
            let mut state = self.state.lock().expect("in-memory store mutex poisoned");
            state.instances.remove(instance_id);
            self.recompute_locked(&mut state, config)
        };
        let _ = self.notify.send(allocations.clone());
        Ok(allocations)
    }

    async fn heartbeat(&self, instance_id: &str, now_ms: u64) -> Result<(), LimiterError> {
        let mut state = self.state.lock().expect("in-memory store mutex poisoned");
        if let Some(last) = state.instances.get_mut(instance_id) {
            *last = now_ms;
        }
        Ok(())
    }

    async fn sweep_expired(
        &self,
        now_ms: u64,
        timeout_ms: u64,
        config: &CoordinatorConfig,
    ) -> Result<(Vec<String>, HashMap<String, Allocation>), LimiterError> {
        let (removed, allocations) = {
            let mut state = self.state.lock().expect("in-memory store mutex poisoned");
            let expired: Vec<String> = state
                .instances
                .iter()
                .filter(|(_, &last)| now_ms.saturating_sub(last) >= timeout_ms)
                .map(|(id, _)| id.clone())
                .collect();
            if expired.is_empty() {
                (expired, state.allocations.clone())
            } else {
                for id in &expired {
                    state.instances.remove(id);
                }
                let allocations = self.recompute_locked(&mut state, config);
                (expired, allocations)
            }
        };
        if !removed.is_empty() {
            let _ = self.notify.send(allocations.clone());
        }
        Ok((removed, allocations))
    }

    async fn current_allocations(&self) -> Result<HashMap<String, Allocation>, LimiterError> {
        Ok(self
            .state
            .lock()
            .expect("in-memory store mutex poisoned")
            .allocations
            .clone())
    }

    async fn report_job_type_usage(
        &self,
        instance_id: &str,
        in_flight: &HashMap<String, u64>,
        config: &CoordinatorConfig,
    ) -> Result<HashMap<String, Allocation>, LimiterError> {
        let Some(resources_per_job) = config.resources_per_job.as_ref() else {
            return self.current_allocations().await;
        };
        let allocations = {
            let mut state = self.state.lock().expect("in-memory store mutex poisoned");
            if state.job_type_ratios.is_empty() && !resources_per_job.is_empty() {
                state.job_type_ratios = initial_job_type_ratios(resources_per_job);
            }
            state.job_type_in_flight.insert(instance_id.to_string(), in_flight.clone());

            let previous_budgets: HashMap<String, u64> = state
                .job_type_ratios
                .iter()
                .map(|(job_type, ratio)| (job_type.clone(), (config.total_capacity as f64 * ratio).floor() as u64))
                .collect();
            let loads: HashMap<String, f64> = resources_per_job
                .keys()
                .map(|job_type| {
                    let budget = previous_budgets.get(job_type).copied().unwrap_or(0);
                    let count: u64 = state
                        .job_type_in_flight
                        .values()
                        .filter_map(|counts| counts.get(job_type))
                        .sum();
                    let load = if budget == 0 { 0.0 } else { count as f64 / budget as f64 };
                    (job_type.clone(), load)
                })
                .collect();

            state.job_type_ratios =
                rebalance_job_type_ratios(&state.job_type_ratios, &loads, resources_per_job, &config.rebalance);
            self.recompute_locked(&mut state, config)
        };
        let _ = self.notify.send(allocations.clone());
        Ok(allocations)
    }

    fn subscribe(&self) -> broadcast::Receiver<HashMap<String, Allocation>> {
        self.notify.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fair_share_distributes_remainder_to_first_ids_lexicographically() {
        let ids = vec!["c".to_string(), "a".to_string(), "b".to_string()];
        let shares = fair_share(10, &ids);
        assert_eq!(shares["a"], 4);
        assert_eq!(shares["b"], 3);
        assert_eq!(shares["c"], 3);
        assert_eq!(shares.values().sum::<u64>(), 10);
    }

    #[test]
    fn fair_share_empty_is_noop() {
        assert!(fair_share(10, &[]).is_empty());
    }

    // P2 depends on every fair-share split accounting for the whole budget exactly, for any
    // number of recipients and any total — not just the two hand-picked cases above.
    #[test]
    fn fair_share_sums_to_total_for_arbitrary_inputs() {
        use proptest::prelude::*;
        use proptest::test_runner::TestRunner;

        let strategy = (0u64..10_000, proptest::collection::vec("[a-z]{1,8}", 0..20));
        let mut runner = TestRunner::default();
        runner
            .run(&strategy, |(total, mut ids)| {
                ids.sort();
                ids.dedup();
                let shares = fair_share(total, &ids);
                let sum: u64 = shares.values().sum();
                prop_assert_eq!(sum, total);
                prop_assert_eq!(shares.len(), ids.len());
                Ok(())
            })
            .unwrap();
    }

    #[tokio::test]
    async fn register_and_unregister_redistribute() {
        let store = InMemoryStore::new();
        let config = CoordinatorConfig {
            total_capacity: 10,
            ..CoordinatorConfig::default()
        };
        let allocations = store.register("a", 0, &config).await.unwrap();
        assert_eq!(allocations["a"].slots, 10);

        let allocations = store.register("b", 0, &config).await.unwrap();
        assert_eq!(allocations["a"].slots, 5);
        assert_eq!(allocations["b"].slots, 5);

        let allocations = store.unregister("a", &config).await.unwrap();
        assert_eq!(allocations["b"].slots, 10);
        assert!(!allocations.contains_key("a"));
    }

    #[tokio::test]
    async fn sweep_removes_stale_instances() {
        let store = InMemoryStore::new();
        let config = CoordinatorConfig {
            total_capacity: 10,
            ..CoordinatorConfig::default()
        };
        store.register("a", 0, &config).await.unwrap();
        store.register("b", 0, &config).await.unwrap();
        store.heartbeat("a", 20_000).await.unwrap();

        let (removed, allocations) = store.sweep_expired(20_000, 15_000, &config).await.unwrap();
        assert_eq!(removed, vec!["b".to_string()]);
        assert_eq!(allocations["a"].slots, 10);
    }

    fn ratio_cfg(initial: Option<f64>, flexible: bool) -> RatioConfig {
        RatioConfig {
            initial_value: initial,
            flexible,
        }
    }

    #[tokio::test]
    async fn job_type_usage_splits_global_budget_fairly_across_instances() {
        let store = InMemoryStore::new();
        let resources_per_job = HashMap::from([
            ("batch".to_string(), ratio_cfg(Some(0.5), true)),
            ("interactive".to_string(), ratio_cfg(Some(0.5), true)),
        ]);
        let config = CoordinatorConfig {
            total_capacity: 100,
            resources_per_job: Some(resources_per_job),
            ..CoordinatorConfig::default()
        };
        store.register("a", 0, &config).await.unwrap();
        store.register("b", 0, &config).await.unwrap();

        let allocations = store
            .report_job_type_usage("a", &HashMap::from([("batch".to_string(), 0)]), &config)
            .await
            .unwrap();

        assert_eq!(allocations["a"].job_types["batch"] + allocations["b"].job_types["batch"], 50);
        assert_eq!(
            allocations["a"].job_types["interactive"] + allocations["b"].job_types["interactive"],
            50
        );
    }

    #[tokio::test]
    async fn job_type_usage_donates_from_idle_to_saturated_globally() {
        let store = InMemoryStore::new();
        let resources_per_job = HashMap::from([
            ("idle".to_string(), ratio_cfg(Some(0.5), true)),
            ("busy".to_string(), ratio_cfg(Some(0.5), true)),
        ]);
        let config = CoordinatorConfig {
            total_capacity: 100,
            resources_per_job: Some(resources_per_job),
            rebalance: RebalanceConfig {
                low_threshold: 0.3,
                high_threshold: 0.7,
                min_ratio: 0.05,
                max_adjustment: 0.3,
                ..RebalanceConfig::default()
            },
            ..CoordinatorConfig::default()
        };
        store.register("a", 0, &config).await.unwrap();

        // "idle" has no in-flight jobs; "busy" is fully saturated against its current 50-slot
        // budget, aggregated from a single reporting instance.
        let allocations = store
            .report_job_type_usage("a", &HashMap::from([("idle".to_string(), 0), ("busy".to_string(), 50)]), &config)
            .await
            .unwrap();

        assert!(
            allocations["a"].job_types["busy"] > allocations["a"].job_types["idle"],
            "busy should have received ratio donated from idle: {:?}",
            allocations["a"].job_types
        );
    }
}
