//! Integration tests against the six concrete scenarios the public API is expected to satisfy:
//! a single-model RPM boundary, two instances sharing one slot, escalation across a two-model
//! chain, windowed fair-share across three instances, a twenty-instance global RPM budget, and
//! cancellation of pending waiters on `stop()`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use llm_rate_limiter::backend::distributed::{CoordinatorConfig, DistributedCoordinator, InMemoryStore};
use llm_rate_limiter::backend::{Backend, LocalBackend};
use llm_rate_limiter::config::LimiterConfig;
use llm_rate_limiter::job_type::{JobTypeConfig, RatioConfig};
use llm_rate_limiter::model::{ModelConfig, Pricing, Usage, UsageEstimate};
use llm_rate_limiter::scheduler::{JobFn, JobRequest, Outcome};
use llm_rate_limiter::{LimiterError, Scheduler};

fn model(id: &str, requests_per_minute: Option<u64>) -> ModelConfig {
    ModelConfig {
        id: id.to_string(),
        requests_per_minute,
        requests_per_day: None,
        tokens_per_minute: None,
        tokens_per_day: None,
        max_concurrent_requests: Some(1_000),
        pricing: Pricing::ZERO,
    }
}

fn config_one_model(model_cfg: ModelConfig, backend: Arc<dyn Backend>) -> LimiterConfig {
    let id = model_cfg.id.clone();
    LimiterConfig {
        models: HashMap::from([(id.clone(), model_cfg)]),
        escalation_order: vec![id],
        resource_estimations_per_job: HashMap::new(),
        memory: None,
        rebalance: Default::default(),
        backend,
        label: None,
        on_log: None,
    }
}

fn resolving_job() -> JobFn<()> {
    Arc::new(|_model_id: String| Box::pin(async move { Ok((Outcome::Resolved(()), Usage::default())) }))
}

// `resource_estimations_per_job` is left empty in every scenario below (the job-type slot
// allocator is exercised separately in `allocator.rs`'s own unit tests), so each request carries
// an explicit one-request estimate — otherwise `Scheduler::default_estimate` would fall back to
// an all-zero estimate and the distributed backend's RPM counters would never advance.
fn job_request(id: &str, job: JobFn<()>, max_wait: Duration) -> JobRequest<()> {
    JobRequest {
        job_id: id.to_string(),
        job_type: "default".to_string(),
        job,
        estimate: Some(UsageEstimate::new(0)),
        max_wait,
    }
}

// Scenario 1: single worker, RPM=1. Second job waits for the window to roll before admitting.
#[tokio::test(start_paused = true)]
async fn single_worker_admits_second_job_only_after_window_rolls() {
    let config = config_one_model(model("only", Some(1)), Arc::new(LocalBackend::new(Default::default())));
    let scheduler = Scheduler::new(config).unwrap();
    scheduler.start().await.unwrap();

    scheduler
        .queue_job_for_model("only", job_request("first", resolving_job(), Duration::ZERO))
        .await
        .expect("first job should be admitted immediately");

    // Escalation (`queue_job`) only ever probes a model's local limiter once per attempt (§4.7
    // step 2) — waiting happens against a single named model via `queue_job_for_model`.
    let waiter = {
        let scheduler = scheduler.clone();
        tokio::spawn(async move {
            scheduler
                .queue_job_for_model("only", job_request("second", resolving_job(), Duration::from_secs(120)))
                .await
        })
    };
    // Let the waiter register itself against the exhausted window before advancing the clock.
    for _ in 0..4 {
        tokio::task::yield_now().await;
    }
    assert!(!waiter.is_finished(), "second job should still be waiting within the first window");

    tokio::time::advance(Duration::from_millis(60_001)).await;
    waiter
        .await
        .unwrap()
        .expect("second job should be admitted once the window rolls");

    scheduler.stop().await.unwrap();
}

// Scenario 2: two instances share a single globally distributed slot. Exactly one admits.
#[tokio::test]
async fn two_instances_sharing_one_slot_admit_exactly_one() {
    let store = Arc::new(InMemoryStore::new());
    let coordinator_config = CoordinatorConfig {
        total_capacity: 1,
        ..CoordinatorConfig::default()
    };
    let backend_a = DistributedCoordinator::new(
        store.clone(),
        coordinator_config.clone(),
        Duration::from_secs(15),
        Duration::from_secs(10),
    );
    let backend_b = DistributedCoordinator::new(store, coordinator_config, Duration::from_secs(15), Duration::from_secs(10));

    let scheduler_a = Scheduler::new(config_one_model(model("m", None), backend_a)).unwrap();
    let scheduler_b = Scheduler::new(config_one_model(model("m", None), backend_b)).unwrap();
    scheduler_a.start().await.unwrap();
    scheduler_b.start().await.unwrap();

    let fifty_tokens: JobFn<()> = Arc::new(|_model_id: String| {
        Box::pin(async move {
            Ok((
                Outcome::Resolved(()),
                Usage {
                    input_tokens: 50,
                    ..Default::default()
                },
            ))
        })
    });

    let result_a = scheduler_a
        .queue_job(job_request("job-a", fifty_tokens.clone(), Duration::ZERO))
        .await;
    let result_b = scheduler_b
        .queue_job(job_request("job-b", fifty_tokens, Duration::ZERO))
        .await;

    let successes = [result_a.is_ok(), result_b.is_ok()];
    assert_eq!(successes.iter().filter(|ok| **ok).count(), 1, "exactly one instance should admit");

    let failure = if result_a.is_err() { result_a.unwrap_err() } else { result_b.unwrap_err() };
    assert_eq!(failure.to_string(), "All models rejected by backend");

    scheduler_a.stop().await.unwrap();
    scheduler_b.stop().await.unwrap();
}

// Scenario 3: escalation chain [A, B]; A rejects with delegation, B resolves. Usage accumulates
// across both attempts.
#[tokio::test]
async fn escalation_chain_accumulates_usage_across_both_attempts() {
    let model_a = ModelConfig {
        pricing: Pricing {
            input: 2.0,
            cached: 0.0,
            output: 0.0,
        },
        ..model("A", Some(1_000))
    };
    let model_b = ModelConfig {
        pricing: Pricing {
            input: 3.0,
            cached: 0.0,
            output: 0.0,
        },
        ..model("B", Some(1_000))
    };

    let config = LimiterConfig {
        models: HashMap::from([("A".to_string(), model_a), ("B".to_string(), model_b)]),
        escalation_order: vec!["A".to_string(), "B".to_string()],
        resource_estimations_per_job: HashMap::new(),
        memory: None,
        rebalance: Default::default(),
        backend: Arc::new(LocalBackend::new(Default::default())),
        label: None,
        on_log: None,
    };
    let scheduler = Scheduler::new(config).unwrap();
    scheduler.start().await.unwrap();

    let job: JobFn<()> = Arc::new(|model_id: String| {
        Box::pin(async move {
            if model_id == "A" {
                Ok((
                    Outcome::Rejected { delegate: true },
                    Usage {
                        input_tokens: 10,
                        ..Default::default()
                    },
                ))
            } else {
                Ok((
                    Outcome::Resolved(()),
                    Usage {
                        input_tokens: 20,
                        ..Default::default()
                    },
                ))
            }
        })
    });

    let outcome = scheduler
        .queue_job(job_request("escalating", job, Duration::from_secs(1)))
        .await
        .unwrap();

    assert_eq!(outcome.usage.len(), 2);
    assert_eq!(outcome.usage[0].model_id, "A");
    assert_eq!(outcome.usage[1].model_id, "B");
    let cost_a = 10.0 * 2.0 / 1_000_000.0;
    let cost_b = 20.0 * 3.0 / 1_000_000.0;
    assert!((outcome.total_cost - (cost_a + cost_b)).abs() < 1e-12);

    scheduler.stop().await.unwrap();
}

// Scenario 4: three instances sharing a global RPM=20 budget across three successive windows.
#[tokio::test(start_paused = true)]
async fn three_instances_share_global_rpm_across_three_windows() {
    let store = Arc::new(InMemoryStore::new());
    let coordinator_config = CoordinatorConfig {
        total_capacity: 1_000,
        total_tokens_per_minute: Some(200),
        total_requests_per_minute: Some(20),
        ..CoordinatorConfig::default()
    };

    let mut schedulers = Vec::new();
    for _ in 0..3 {
        let backend = DistributedCoordinator::new(
            store.clone(),
            coordinator_config.clone(),
            Duration::from_secs(15),
            Duration::from_secs(10),
        );
        let scheduler = Scheduler::new(config_one_model(model("m", None), backend)).unwrap();
        scheduler.start().await.unwrap();
        schedulers.push(scheduler);
    }

    let jobs_per_instance_per_window = 50 / 3;
    let mut total_completed = 0usize;

    for window in 0..3 {
        let mut handles = Vec::new();
        for (i, scheduler) in schedulers.iter().enumerate() {
            for j in 0..jobs_per_instance_per_window {
                let scheduler = scheduler.clone();
                let job_id = format!("w{window}-i{i}-j{j}");
                handles.push(tokio::spawn(async move {
                    scheduler
                        .queue_job(job_request(&job_id, resolving_job(), Duration::ZERO))
                        .await
                }));
            }
        }

        let mut completed_this_window = 0usize;
        for handle in handles {
            if handle.await.unwrap().is_ok() {
                completed_this_window += 1;
            }
        }
        assert!(completed_this_window <= 20, "window {window} admitted {completed_this_window} > 20");
        total_completed += completed_this_window;

        tokio::time::advance(Duration::from_millis(60_001)).await;
    }

    assert_eq!(total_completed, 60, "exactly 20 jobs per window across 3 windows should complete");

    for scheduler in &schedulers {
        scheduler.stop().await.unwrap();
    }
}

// Scenario 5: twenty instances sharing a global RPM=100 budget across five windows.
#[tokio::test(start_paused = true)]
async fn twenty_instances_share_global_rpm_across_five_windows() {
    let store = Arc::new(InMemoryStore::new());
    let coordinator_config = CoordinatorConfig {
        total_capacity: 10_000,
        total_requests_per_minute: Some(100),
        ..CoordinatorConfig::default()
    };

    let mut schedulers = Vec::new();
    for _ in 0..20 {
        let backend = DistributedCoordinator::new(
            store.clone(),
            coordinator_config.clone(),
            Duration::from_secs(15),
            Duration::from_secs(10),
        );
        let scheduler = Scheduler::new(config_one_model(model("m", None), backend)).unwrap();
        scheduler.start().await.unwrap();
        schedulers.push(scheduler);
    }

    for window in 0..5 {
        let mut per_instance_outcomes = vec![0usize; schedulers.len()];
        let mut per_instance_completed = vec![0usize; schedulers.len()];
        let mut handles = Vec::new();
        for (i, scheduler) in schedulers.iter().enumerate() {
            for j in 0..100 {
                let scheduler = scheduler.clone();
                let job_id = format!("w{window}-i{i}-j{j}");
                handles.push((i, tokio::spawn(async move {
                    scheduler
                        .queue_job(job_request(&job_id, resolving_job(), Duration::ZERO))
                        .await
                })));
            }
        }

        let mut completed_this_window = 0usize;
        for (i, handle) in handles {
            per_instance_outcomes[i] += 1;
            if handle.await.unwrap().is_ok() {
                completed_this_window += 1;
                per_instance_completed[i] += 1;
            }
        }

        assert!(completed_this_window <= 100, "window {window} admitted {completed_this_window} > 100");
        assert!(completed_this_window > 0, "window {window} admitted nothing");
        // fair_share(100, 20 instances) divides evenly with no remainder: every instance's exact
        // share is 5, and each of its 100 attempts resolves (no attempt is left hanging).
        for (i, (completed, attempted)) in per_instance_completed.iter().zip(&per_instance_outcomes).enumerate() {
            assert_eq!(*attempted, 100, "instance {i} should have every attempt resolve, none left pending");
            assert_eq!(*completed, 5, "instance {i} should admit exactly its fair share of 5");
        }

        tokio::time::advance(Duration::from_millis(60_001)).await;
    }

    for scheduler in &schedulers {
        scheduler.stop().await.unwrap();
    }
}

// Scenario 6: `stop()` resolves every pending waiter with a cancellation error.
#[tokio::test(start_paused = true)]
async fn stop_cancels_all_pending_waiters() {
    let config = config_one_model(model("only", Some(1)), Arc::new(LocalBackend::new(Default::default())));
    let scheduler = Scheduler::new(config).unwrap();
    scheduler.start().await.unwrap();

    scheduler
        .queue_job_for_model("only", job_request("first", resolving_job(), Duration::ZERO))
        .await
        .expect("first job should be admitted immediately");

    let mut waiters = Vec::new();
    for i in 0..10 {
        let scheduler = scheduler.clone();
        let job_id = format!("waiter-{i}");
        waiters.push(tokio::spawn(async move {
            scheduler
                .queue_job_for_model("only", job_request(&job_id, resolving_job(), Duration::from_secs(300)))
                .await
        }));
    }

    for _ in 0..4 {
        tokio::task::yield_now().await;
    }
    for waiter in &waiters {
        assert!(!waiter.is_finished(), "waiters should still be pending before stop()");
    }

    scheduler.stop().await.unwrap();

    for waiter in waiters {
        let result = waiter.await.unwrap();
        match result {
            Err(LimiterError::Cancelled) => {}
            other => panic!("expected Cancelled, got {other:?}"),
        }
    }
}

// A second instance joining must shrink the first's slot allocation without either of them
// calling acquire/release — the redistribution reaches the first instance purely through its
// `Backend::subscribe` callback refreshing the local `SlotAllocator`'s capacity.
#[tokio::test]
async fn joining_instance_redistributes_capacity_via_subscription() {
    let store = Arc::new(InMemoryStore::new());
    let coordinator_config = CoordinatorConfig {
        total_capacity: 10,
        ..CoordinatorConfig::default()
    };

    let job_types = HashMap::from([(
        "default".to_string(),
        JobTypeConfig {
            id: "default".to_string(),
            estimated_used_tokens: 0,
            estimated_number_of_requests: 1,
            estimated_used_memory_kb: 0,
            ratio: RatioConfig {
                initial_value: Some(1.0),
                flexible: false,
            },
        },
    )]);

    let backend_a = DistributedCoordinator::new(
        store.clone(),
        coordinator_config.clone(),
        Duration::from_secs(15),
        Duration::from_secs(10),
    );
    let mut config_a = config_one_model(model("m", None), backend_a);
    config_a.resource_estimations_per_job = job_types.clone();
    let scheduler_a = Scheduler::new(config_a).unwrap();
    scheduler_a.start().await.unwrap();

    assert_eq!(scheduler_a.stats().job_types["default"].allocated_slots, 10);

    let backend_b = DistributedCoordinator::new(store, coordinator_config, Duration::from_secs(15), Duration::from_secs(10));
    let mut config_b = config_one_model(model("m", None), backend_b);
    config_b.resource_estimations_per_job = job_types;
    let scheduler_b = Scheduler::new(config_b).unwrap();
    scheduler_b.start().await.unwrap();

    // Give the subscription's background relay task a chance to run.
    for _ in 0..4 {
        tokio::task::yield_now().await;
    }

    assert_eq!(
        scheduler_a.stats().job_types["default"].allocated_slots, 5,
        "instance a's allocator should shrink once instance b joins, with no acquire/release of its own"
    );
    assert_eq!(scheduler_b.stats().job_types["default"].allocated_slots, 5);

    scheduler_a.stop().await.unwrap();
    scheduler_b.stop().await.unwrap();
}
