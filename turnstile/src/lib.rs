//! turnstile: a local, per-host API quota governor.
//!
//! The governor intercepts outgoing requests to external LLM providers and
//! decides, proactively, whether each request may proceed, must be queued,
//! or must be rejected, keeping the caller strictly within its configured
//! allocation of requests and tokens per window for every
//! (tenant, provider, model) tuple.
//!
//! The embedding host drives three hooks around each provider call:
//!
//! ```ignore
//! let governor = Manager::new(GovernorConfig::default()).await?;
//!
//! // Before the provider call. Errors mean "do not proceed":
//! // `Queued` is an expected refusal carrying the queue id.
//! governor.pre_call(&req_id, "anthropic", model, &wallet, &session, &mut request).await?;
//!
//! // After a successful call, record true token usage and drain the queue.
//! governor.post_call(&req_id, "anthropic", model, &wallet, &session, &request, &response).await;
//!
//! // At session teardown: pattern analysis and a usage summary.
//! let summary = governor.session_end(&session, &wallet).await;
//! ```
//!
//! State is durable in a single local SQLite database; nothing here
//! originates network calls or coordinates across hosts.

pub mod clock;
pub mod config;
pub mod error;
pub mod limits;
pub mod manager;
pub mod patterns;
pub mod queue;
pub mod store;
pub mod telemetry;
pub mod tiers;
pub mod types;
pub mod window;

pub use clock::Clock;
pub use config::{GovernorConfig, PatternConfig, QueueConfig, RetentionConfig};
pub use error::{Result, TurnstileError};
pub use limits::{default_limits, LimitConfig, LimitSet};
pub use manager::{Manager, QueueView, RetentionReport, SessionSummary, StatusSnapshot, DECISION_KEY};
pub use patterns::{Analysis, DetectedPattern, PatternDetector, Prediction};
pub use queue::QueueService;
pub use store::{NewEvent, QueueStats, Store};
pub use tiers::TierCapabilities;
pub use types::{
    EventKind, Horizon, PatternKind, QueueEntry, QueueId, QueueStatus, Tenant, Tier, UsageEvent,
    UsagePattern, Window, WindowKey,
};
pub use window::{ExceedCheck, WindowTracker};

#[cfg(test)]
mod test;
