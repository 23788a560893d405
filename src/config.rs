//! Top-level configuration for a [`crate::Scheduler`].

use std::{collections::HashMap, sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{backend::Backend, error::LimiterError, job_type::JobTypeConfig, model::ModelConfig};

/// Tuning for the process-wide [`crate::memory::MemoryManager`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Fraction of free host memory usable by admitted jobs. Defaults to 0.8.
    #[serde(default = "default_free_memory_ratio")]
    pub free_memory_ratio: f64,
    /// How often the free-memory estimate is recomputed and the semaphore resized.
    #[serde(default = "default_recalculation_interval_ms")]
    pub recalculation_interval_ms: u64,
}

fn default_free_memory_ratio() -> f64 {
    0.8
}

fn default_recalculation_interval_ms() -> u64 {
    1000
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            free_memory_ratio: default_free_memory_ratio(),
            recalculation_interval_ms: default_recalculation_interval_ms(),
        }
    }
}

impl MemoryConfig {
    pub(crate) fn recalculation_interval(&self) -> Duration {
        Duration::from_millis(self.recalculation_interval_ms)
    }
}

/// Tuning for the adaptive rebalancing pass in [`crate::allocator::SlotAllocator`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RebalanceConfig {
    /// Minimum time between rebalances.
    #[serde(default = "default_adjustment_interval_ms")]
    pub adjustment_interval_ms: u64,
    /// Minimum number of releases (across all job types) between rebalances.
    #[serde(default = "default_releases_per_adjustment")]
    pub releases_per_adjustment: usize,
    /// Load percentage below which a flexible type is considered idle and may donate ratio.
    #[serde(default = "default_low_threshold")]
    pub low_threshold: f64,
    /// Load percentage above which a flexible type is considered saturated and may receive
    /// ratio.
    #[serde(default = "default_high_threshold")]
    pub high_threshold: f64,
    /// Floor below which a donor's ratio will not be reduced.
    #[serde(default = "default_min_ratio")]
    pub min_ratio: f64,
    /// Maximum ratio a single donor may give up in one rebalance pass.
    #[serde(default = "default_max_adjustment")]
    pub max_adjustment: f64,
}

fn default_adjustment_interval_ms() -> u64 {
    5_000
}
fn default_releases_per_adjustment() -> usize {
    10
}
fn default_low_threshold() -> f64 {
    0.3
}
fn default_high_threshold() -> f64 {
    0.8
}
fn default_min_ratio() -> f64 {
    0.05
}
fn default_max_adjustment() -> f64 {
    0.1
}

impl Default for RebalanceConfig {
    fn default() -> Self {
        Self {
            adjustment_interval_ms: default_adjustment_interval_ms(),
            releases_per_adjustment: default_releases_per_adjustment(),
            low_threshold: default_low_threshold(),
            high_threshold: default_high_threshold(),
            min_ratio: default_min_ratio(),
            max_adjustment: default_max_adjustment(),
        }
    }
}

impl RebalanceConfig {
    pub(crate) fn adjustment_interval(&self) -> Duration {
        Duration::from_millis(self.adjustment_interval_ms)
    }
}

/// Top-level configuration for a [`crate::Scheduler`].
///
/// `backend` and `on_log` are trait objects and so aren't `Deserialize`; construct a
/// [`LimiterConfig`] by deserializing [`LimiterConfigData`] for the declarative parts and then
/// filling in the collaborators.
#[derive(Clone)]
pub struct LimiterConfig {
    /// Rate/concurrency configuration for every model in the escalation chain.
    pub models: HashMap<String, ModelConfig>,
    /// Order in which models are tried. Defaults to `models`' iteration order if empty, though
    /// callers should set this explicitly since `HashMap` iteration order is unspecified.
    pub escalation_order: Vec<String>,
    /// Resource estimates and ratio tuning per job type.
    pub resource_estimations_per_job: HashMap<String, JobTypeConfig>,
    /// Process-wide memory manager tuning. `None` disables memory-based admission control.
    pub memory: Option<MemoryConfig>,
    /// Rebalancing tuning for the slot allocator.
    pub rebalance: RebalanceConfig,
    /// The backend coordinating capacity across instances. Defaults to a single-process
    /// [`crate::backend::LocalBackend`].
    pub backend: Arc<dyn Backend>,
    /// Human-readable prefix included in `tracing` spans and `on_log` calls, for disambiguating
    /// multiple schedulers in one process.
    pub label: Option<String>,
    /// Structured logging hook, invoked alongside the crate's own `tracing` events.
    pub on_log: Option<Arc<dyn Fn(&str, serde_json::Value) + Send + Sync>>,
}

impl std::fmt::Debug for LimiterConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LimiterConfig")
            .field("models", &self.models)
            .field("escalation_order", &self.escalation_order)
            .field(
                "resource_estimations_per_job",
                &self.resource_estimations_per_job,
            )
            .field("memory", &self.memory)
            .field("rebalance", &self.rebalance)
            .field("label", &self.label)
            .finish_non_exhaustive()
    }
}

impl LimiterConfig {
    /// Validate every model and job type, and resolve a default escalation order if none was
    /// given. Called once by [`crate::Scheduler::new`]; failures are fail-fast construction
    /// errors, never surfaced at job-submission time.
    pub fn validate(&mut self) -> Result<(), LimiterError> {
        if self.models.is_empty() {
            return Err(LimiterError::InvalidConfig(
                "at least one model must be configured".into(),
            ));
        }
        for model in self.models.values() {
            model.validate()?;
        }
        for job_type in self.resource_estimations_per_job.values() {
            job_type.validate()?;
        }
        if self.escalation_order.is_empty() {
            self.escalation_order = self.models.keys().cloned().collect();
        }
        for id in &self.escalation_order {
            if !self.models.contains_key(id) {
                return Err(LimiterError::InvalidConfig(format!(
                    "escalation_order references unknown model '{id}'"
                )));
            }
        }
        Ok(())
    }
}

/// The serde-friendly subset of [`LimiterConfig`], for embedders loading config from a file.
///
/// Combine with a [`Backend`] and optional log hook via [`LimiterConfigData::into_config`].
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LimiterConfigData {
    /// See [`LimiterConfig::models`].
    pub models: HashMap<String, ModelConfig>,
    /// See [`LimiterConfig::escalation_order`].
    #[serde(default)]
    pub escalation_order: Vec<String>,
    /// See [`LimiterConfig::resource_estimations_per_job`].
    #[serde(default)]
    pub resource_estimations_per_job: HashMap<String, JobTypeConfig>,
    /// See [`LimiterConfig::memory`].
    #[serde(default)]
    pub memory: Option<MemoryConfig>,
    /// See [`LimiterConfig::rebalance`].
    #[serde(default)]
    pub rebalance: RebalanceConfig,
    /// See [`LimiterConfig::label`].
    #[serde(default)]
    pub label: Option<String>,
}

impl LimiterConfigData {
    /// Combine the deserialized declarative config with a backend to produce a full
    /// [`LimiterConfig`].
    pub fn into_config(self, backend: Arc<dyn Backend>) -> LimiterConfig {
        LimiterConfig {
            models: self.models,
            escalation_order: self.escalation_order,
            resource_estimations_per_job: self.resource_estimations_per_job,
            memory: self.memory,
            rebalance: self.rebalance,
            backend,
            label: self.label,
            on_log: None,
        }
    }
}
