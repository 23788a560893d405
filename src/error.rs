//! Stable error sentinels.
//!
//! The string form of each variant is part of the crate's public contract: embedders match on
//! `err.to_string()` as often as on the variant itself, so the `Display` text must not change
//! independently of a semver bump.

/// Errors returned by [`crate::Scheduler`] and the types it composes.
#[derive(Debug, thiserror::Error)]
pub enum LimiterError {
    /// A job finished without resolving or rejecting (only reachable via the dynamic
    /// [`crate::job::AnyJob`] adapter; the typed `Outcome` API makes this unrepresentable).
    #[error("Job must call resolve() or reject()")]
    NoResolution,

    /// The job rejected its current model attempt and did not request delegation to the next
    /// model in the escalation chain.
    #[error("Job rejected without delegation")]
    RejectedWithoutDelegation,

    /// Every model in the escalation chain was tried and none admitted or succeeded.
    #[error("All models rejected by backend")]
    AllModelsRejected,

    /// A job or `queue_job_for_model` call referenced a model id absent from
    /// [`crate::config::LimiterConfig::models`].
    #[error("Unknown model: {0}")]
    UnknownModel(String),

    /// A job referenced a job type absent from
    /// [`crate::config::LimiterConfig::resource_estimations_per_job`].
    #[error("Unknown job type: {0}")]
    UnknownJobType(String),

    /// The capacity wait queue timed out before a reservation could be made.
    #[error("timed out waiting for capacity")]
    Timeout,

    /// `stop()` was called while this job was still waiting for capacity.
    #[error("scheduler stopped while waiting for capacity")]
    Cancelled,

    /// A job's own logic failed; usage already attributed (if any) is still reported via
    /// `on_error`.
    #[error("job failed: {0}")]
    JobFailed(String),

    /// Configuration failed validation at construction time.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The backend could not complete an operation (I/O, serialization, protocol).
    #[error("backend error: {0}")]
    Backend(String),
}
