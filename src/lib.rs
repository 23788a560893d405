//! Coordinated admission control for fleets of workers dispatching jobs to shared,
//! externally-rate-limited providers (e.g. LLM APIs).
//!
//! A [`Scheduler`] admits jobs against per-model time-window counters, a concurrency semaphore,
//! and an optional shared memory semaphore (see [`limiter`]), escalating across a configured
//! fallback chain of models on rejection. Within one worker, [`allocator::SlotAllocator`] carves
//! local capacity among job classes by ratio, adaptively rebalancing from idle classes to
//! saturated ones. Across a fleet, a [`backend::Backend`] — most commonly
//! [`backend::distributed::DistributedCoordinator`] — fairly redistributes a global budget among
//! a dynamic set of worker instances.
//!
//! ```no_run
//! use std::sync::Arc;
//! use llm_rate_limiter::{
//!     backend::LocalBackend,
//!     config::LimiterConfig,
//!     model::{ModelConfig, Usage},
//!     scheduler::{JobRequest, Outcome, Scheduler},
//! };
//!
//! # async fn run() -> Result<(), llm_rate_limiter::error::LimiterError> {
//! let config = LimiterConfig {
//!     models: [(
//!         "gpt-4".to_string(),
//!         ModelConfig {
//!             id: "gpt-4".to_string(),
//!             requests_per_minute: Some(60),
//!             requests_per_day: None,
//!             tokens_per_minute: None,
//!             tokens_per_day: None,
//!             max_concurrent_requests: None,
//!             pricing: Default::default(),
//!         },
//!     )]
//!     .into_iter()
//!     .collect(),
//!     escalation_order: vec!["gpt-4".to_string()],
//!     resource_estimations_per_job: Default::default(),
//!     memory: None,
//!     rebalance: Default::default(),
//!     backend: Arc::new(LocalBackend::new(Default::default())),
//!     label: None,
//!     on_log: None,
//! };
//! let scheduler = Scheduler::new(config)?;
//! scheduler.start().await?;
//!
//! let outcome = scheduler
//!     .queue_job(JobRequest {
//!         job_id: "job-1".to_string(),
//!         job_type: "default".to_string(),
//!         job: Arc::new(|_model_id| {
//!             Box::pin(async move { Ok((Outcome::Resolved(()), Usage::default())) })
//!         }),
//!         estimate: None,
//!         max_wait: std::time::Duration::from_secs(5),
//!     })
//!     .await?;
//! let _ = outcome.value;
//! scheduler.stop().await?;
//! # Ok(())
//! # }
//! ```

pub mod allocator;
pub mod backend;
pub mod config;
pub mod error;
pub mod job;
pub mod job_type;
pub mod limiter;
pub mod memory;
pub mod model;
pub mod scheduler;
pub mod stats;
mod wait_queue;
mod semaphore;
mod window;

pub use config::LimiterConfig;
pub use error::LimiterError;
pub use scheduler::{JobOutcome, JobRequest, Outcome, Scheduler};
pub use stats::LimiterStats;
