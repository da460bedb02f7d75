//! Error taxonomy for the governor.
//!
//! `Queued` is an expected, recoverable refusal: the host must treat it as
//! "the request does not proceed now", not as a bug. Both refusal variants
//! carry the structured decision payload so dashboards and callers see the
//! offending horizon and counts rather than a bare string.

use thiserror::Error;

use crate::types::{Horizon, QueueId};

/// Result type for governor operations.
pub type Result<T> = std::result::Result<T, TurnstileError>;

#[derive(Debug, Error)]
pub enum TurnstileError {
    /// A horizon is at capacity and the tenant is not eligible to queue.
    #[error("{horizon} limit exceeded: {current}/{limit} ({percent_used:.1}%)")]
    LimitExceeded {
        horizon: Horizon,
        current: i64,
        limit: i64,
        percent_used: f64,
    },

    /// A horizon is at capacity and the request was parked in the queue.
    #[error("request queued as {queue_id} ({horizon} at {current}/{limit})")]
    Queued {
        queue_id: QueueId,
        horizon: Horizon,
        current: i64,
        limit: i64,
        percent_used: f64,
    },

    /// Queueing attempted for a tier without the may-queue capability.
    #[error("queueing is not available on the free tier")]
    QueueDisabled,

    /// Queueing attempted past the tenant's queue capacity.
    #[error("queue is full ({max_queue_size} pending entries)")]
    QueueFull { max_queue_size: i64 },

    /// A tier-gated feature was invoked by a tenant without the capability.
    #[error("feature requires the pro tier: {feature}")]
    TierRestricted { feature: &'static str },

    /// Caller supplied an unknown provider, out-of-range priority, unknown
    /// horizon, or similarly malformed input.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Cancel/update on a non-existent or already-terminal entity.
    #[error("{resource} not found: {id}")]
    NotFound { resource: &'static str, id: String },

    /// The durable store refused an operation.
    #[error("store error: {0}")]
    Store(#[from] sqlx::Error),

    /// Schema migration failed.
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    /// Unexpected error with full context chain.
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl TurnstileError {
    /// Whether this value is one of the two expected admission refusals.
    pub fn is_refusal(&self) -> bool {
        matches!(
            self,
            TurnstileError::LimitExceeded { .. } | TurnstileError::Queued { .. }
        )
    }
}
