//! Database row shapes and their conversions to domain types.
//!
//! Rows keep the raw column types (TEXT enums, millisecond INTEGER
//! timestamps); conversion to domain types is the one place decode errors
//! can surface.

use sqlx::FromRow;
use uuid::Uuid;

use crate::error::TurnstileError;
use crate::limits::{LimitConfig, LimitSet};
use crate::types::{from_millis, QueueEntry, Tenant, UsageEvent, UsagePattern, Window};

#[derive(Debug, FromRow)]
pub(super) struct TenantRow {
    pub wallet: String,
    pub tier: String,
    pub paid_until: Option<i64>,
    pub max_queue_size: i64,
    pub created_at: i64,
}

impl TryFrom<TenantRow> for Tenant {
    type Error = TurnstileError;

    fn try_from(row: TenantRow) -> Result<Self, Self::Error> {
        Ok(Tenant {
            wallet: row.wallet,
            tier: row.tier.parse()?,
            paid_until: row.paid_until.map(from_millis),
            max_queue_size: row.max_queue_size,
            created_at: from_millis(row.created_at),
        })
    }
}

#[derive(Debug, FromRow)]
pub(super) struct LimitConfigRow {
    pub provider: String,
    pub model: String,
    pub tier: String,
    pub requests_per_minute: Option<i64>,
    pub requests_per_hour: Option<i64>,
    pub requests_per_day: Option<i64>,
    pub tokens_per_minute: Option<i64>,
    pub tokens_per_day: Option<i64>,
    pub updated_at: i64,
}

impl TryFrom<LimitConfigRow> for LimitConfig {
    type Error = TurnstileError;

    fn try_from(row: LimitConfigRow) -> Result<Self, Self::Error> {
        Ok(LimitConfig {
            provider: row.provider,
            model: (!row.model.is_empty()).then_some(row.model),
            tier: row.tier.parse()?,
            limits: LimitSet {
                requests_per_minute: row.requests_per_minute,
                requests_per_hour: row.requests_per_hour,
                requests_per_day: row.requests_per_day,
                tokens_per_minute: row.tokens_per_minute,
                tokens_per_day: row.tokens_per_day,
            },
            updated_at: from_millis(row.updated_at),
        })
    }
}

#[derive(Debug, FromRow)]
pub(super) struct WindowRow {
    pub id: i64,
    pub tenant: String,
    pub provider: String,
    pub model: String,
    pub horizon: String,
    pub starts_at: i64,
    pub ends_at: i64,
    pub request_count: i64,
    pub token_count: i64,
    pub request_limit: Option<i64>,
    pub token_limit: Option<i64>,
    pub active: bool,
}

impl TryFrom<WindowRow> for Window {
    type Error = TurnstileError;

    fn try_from(row: WindowRow) -> Result<Self, Self::Error> {
        Ok(Window {
            id: row.id,
            tenant: row.tenant,
            provider: row.provider,
            model: row.model,
            horizon: row.horizon.parse()?,
            starts_at: from_millis(row.starts_at),
            ends_at: from_millis(row.ends_at),
            request_count: row.request_count,
            token_count: row.token_count,
            request_limit: row.request_limit,
            token_limit: row.token_limit,
            active: row.active,
        })
    }
}

#[derive(Debug, FromRow)]
pub(super) struct QueueEntryRow {
    pub id: String,
    pub tenant: String,
    pub provider: String,
    pub model: String,
    pub payload: String,
    pub priority: i64,
    pub retry_count: i64,
    pub max_retries: i64,
    pub status: String,
    pub error: Option<String>,
    pub queued_at: i64,
    pub processed_at: Option<i64>,
}

impl TryFrom<QueueEntryRow> for QueueEntry {
    type Error = TurnstileError;

    fn try_from(row: QueueEntryRow) -> Result<Self, Self::Error> {
        let id = Uuid::parse_str(&row.id)
            .map_err(|_| TurnstileError::InvalidInput(format!("malformed queue id: {}", row.id)))?;
        let payload = serde_json::from_str(&row.payload).map_err(anyhow::Error::from)?;
        Ok(QueueEntry {
            id: id.into(),
            tenant: row.tenant,
            provider: row.provider,
            model: row.model,
            payload,
            priority: row.priority,
            retry_count: row.retry_count,
            max_retries: row.max_retries,
            status: row.status.parse()?,
            error: row.error,
            queued_at: from_millis(row.queued_at),
            processed_at: row.processed_at.map(from_millis),
        })
    }
}

#[derive(Debug, FromRow)]
pub(super) struct EventRow {
    pub id: i64,
    pub tenant: String,
    pub provider: String,
    pub model: String,
    pub at: i64,
    pub kind: String,
    pub horizon: Option<String>,
    pub current_count: Option<i64>,
    pub limit_value: Option<i64>,
    pub percent_used: Option<f64>,
    pub request_id: Option<String>,
    pub was_queued: bool,
    pub queue_time_ms: Option<i64>,
    pub pattern_tag: Option<String>,
}

impl TryFrom<EventRow> for UsageEvent {
    type Error = TurnstileError;

    fn try_from(row: EventRow) -> Result<Self, Self::Error> {
        Ok(UsageEvent {
            id: row.id,
            tenant: row.tenant,
            provider: row.provider,
            model: row.model,
            at: from_millis(row.at),
            kind: row.kind.parse()?,
            horizon: row.horizon.as_deref().map(str::parse).transpose()?,
            current_count: row.current_count,
            limit: row.limit_value,
            percent_used: row.percent_used,
            request_id: row.request_id,
            was_queued: row.was_queued,
            queue_time_ms: row.queue_time_ms,
            pattern_tag: row.pattern_tag,
        })
    }
}

/// Aggregate produced by the queue-stats query; not a table row.
#[derive(Debug, FromRow)]
pub(super) struct QueueStatsRow {
    pub pending: i64,
    pub processing: i64,
    pub completed: i64,
    pub failed: i64,
    pub avg_wait_ms: Option<f64>,
    pub oldest_pending: Option<i64>,
}

#[derive(Debug, FromRow)]
pub(super) struct PatternRow {
    pub id: String,
    pub tenant: String,
    pub kind: String,
    pub window_label: String,
    pub avg_rpm: f64,
    pub peak_rpm: f64,
    pub confidence: f64,
    pub suggested_limit: Option<i64>,
    pub suggested_queue_size: Option<i64>,
    pub observations: i64,
    pub first_detected: i64,
    pub last_observed: i64,
}

impl TryFrom<PatternRow> for UsagePattern {
    type Error = TurnstileError;

    fn try_from(row: PatternRow) -> Result<Self, Self::Error> {
        Ok(UsagePattern {
            id: row.id,
            tenant: row.tenant,
            kind: row.kind.parse()?,
            window_label: row.window_label,
            avg_rpm: row.avg_rpm,
            peak_rpm: row.peak_rpm,
            confidence: row.confidence,
            suggested_limit: row.suggested_limit,
            suggested_queue_size: row.suggested_queue_size,
            observations: row.observations,
            first_detected: from_millis(row.first_detected),
            last_observed: from_millis(row.last_observed),
        })
    }
}
