//! Per-model rate configuration and pricing.

use serde::{Deserialize, Serialize};

use crate::error::LimiterError;

/// Price per 1,000,000 tokens, split by token class.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Pricing {
    /// Price per 1M input tokens.
    pub input: f64,
    /// Price per 1M cached-input tokens.
    pub cached: f64,
    /// Price per 1M output tokens.
    pub output: f64,
}

impl Pricing {
    /// A pricing table where every token class is free. Useful for tests and for models whose
    /// cost isn't tracked.
    pub const ZERO: Pricing = Pricing {
        input: 0.0,
        cached: 0.0,
        output: 0.0,
    };

    pub(crate) fn cost(&self, input: u64, cached: u64, output: u64) -> f64 {
        let million = 1_000_000.0;
        (input as f64) * self.input / million
            + (cached as f64) * self.cached / million
            + (output as f64) * self.output / million
    }
}

impl Default for Pricing {
    fn default() -> Self {
        Self::ZERO
    }
}

/// Static configuration for a single model in the escalation chain.
///
/// At least one of the rate fields or [`ModelConfig::max_concurrent_requests`] must be set, or
/// the limiter would admit unboundedly and the config is rejected at construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Identifier used in escalation order, stats, and usage records.
    pub id: String,
    /// Requests allowed per rolling 60 s fixed window.
    #[serde(default)]
    pub requests_per_minute: Option<u64>,
    /// Requests allowed per rolling 24 h fixed window.
    #[serde(default)]
    pub requests_per_day: Option<u64>,
    /// Tokens allowed per rolling 60 s fixed window.
    #[serde(default)]
    pub tokens_per_minute: Option<u64>,
    /// Tokens allowed per rolling 24 h fixed window.
    #[serde(default)]
    pub tokens_per_day: Option<u64>,
    /// Maximum number of concurrently in-flight requests to this model.
    #[serde(default)]
    pub max_concurrent_requests: Option<usize>,
    /// Per-1M-token pricing, used to attribute cost to completed attempts.
    #[serde(default)]
    pub pricing: Pricing,
}

impl ModelConfig {
    /// Validate that this model configuration can actually admit anything.
    pub fn validate(&self) -> Result<(), LimiterError> {
        if self.id.trim().is_empty() {
            return Err(LimiterError::InvalidConfig(
                "model id must not be empty".into(),
            ));
        }
        let has_rate = self.requests_per_minute.is_some()
            || self.requests_per_day.is_some()
            || self.tokens_per_minute.is_some()
            || self.tokens_per_day.is_some();
        if !has_rate && self.max_concurrent_requests.is_none() {
            return Err(LimiterError::InvalidConfig(format!(
                "model '{}' must set at least one rate limit or max_concurrent_requests",
                self.id
            )));
        }
        Ok(())
    }
}

/// An estimate of the resources one attempt against a model is expected to consume, supplied by
/// the caller up front and reconciled against actual usage on completion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageEstimate {
    /// Estimated total tokens (input + output) the attempt will consume.
    pub tokens: u64,
    /// Estimated number of requests the attempt will issue (almost always 1).
    pub requests: u64,
}

impl UsageEstimate {
    /// A single request carrying an estimated token count.
    pub fn new(tokens: u64) -> Self {
        Self {
            tokens,
            requests: 1,
        }
    }
}

/// The actual resources one attempt consumed, as reported by the user job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    /// Tokens read from the prompt/context that were not served from cache.
    pub input_tokens: u64,
    /// Tokens read from a prompt cache, priced separately from fresh input tokens.
    pub cached_tokens: u64,
    /// Tokens generated by the model.
    pub output_tokens: u64,
    /// Number of HTTP requests this attempt issued against the provider.
    pub request_count: u64,
}

impl Usage {
    pub(crate) fn estimate(&self) -> UsageEstimate {
        UsageEstimate {
            tokens: self.input_tokens + self.cached_tokens + self.output_tokens,
            requests: self.request_count.max(1),
        }
    }
}

/// One model's contribution to a job's total usage and cost.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageEntry {
    /// Which model this attempt ran against.
    pub model_id: String,
    /// Fresh input tokens consumed.
    pub input_tokens: u64,
    /// Cached input tokens consumed.
    pub cached_tokens: u64,
    /// Output tokens generated.
    pub output_tokens: u64,
    /// Requests issued.
    pub request_count: u64,
    /// Cost of this attempt alone, in the same currency unit as [`Pricing`].
    pub cost: f64,
}
