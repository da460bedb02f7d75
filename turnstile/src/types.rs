//! Core value types shared across the governor.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::TurnstileError;

/// A unique identifier for a deferred request held in the queue.
///
/// Uses a short, readable display format like "q_abc123xy" instead of full UUIDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueueId(Uuid);

impl QueueId {
    /// Create a new random queue ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get the underlying UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }

    /// Convert to a short, readable string format.
    pub fn to_short_string(&self) -> String {
        let hex = format!("{:032x}", self.0.as_u128());
        format!("q_{}", &hex[..8])
    }
}

impl Default for QueueId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for QueueId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl std::fmt::Display for QueueId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_short_string())
    }
}

impl std::str::FromStr for QueueId {
    type Err = TurnstileError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|_| TurnstileError::InvalidInput(format!("malformed queue id: {s}")))
    }
}

/// One sliding-window accounting horizon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Horizon {
    Minute,
    Hour,
    Day,
}

impl Horizon {
    /// All horizons in enforcement order. The first refusal wins.
    pub const ALL: [Horizon; 3] = [Horizon::Minute, Horizon::Hour, Horizon::Day];

    pub fn duration_secs(&self) -> i64 {
        match self {
            Horizon::Minute => 60,
            Horizon::Hour => 3_600,
            Horizon::Day => 86_400,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Horizon::Minute => "minute",
            Horizon::Hour => "hour",
            Horizon::Day => "day",
        }
    }
}

impl std::fmt::Display for Horizon {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Horizon {
    type Err = TurnstileError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "minute" => Ok(Horizon::Minute),
            "hour" => Ok(Horizon::Hour),
            "day" => Ok(Horizon::Day),
            other => Err(TurnstileError::InvalidInput(format!("unknown horizon: {other}"))),
        }
    }
}

/// Tenant capability tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    #[default]
    Free,
    Pro,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Free => "free",
            Tier::Pro => "pro",
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Tier {
    type Err = TurnstileError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "free" => Ok(Tier::Free),
            "pro" => Ok(Tier::Pro),
            other => Err(TurnstileError::InvalidInput(format!("unknown tier: {other}"))),
        }
    }
}

/// The kind of an admission-decision audit event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Allowed,
    Warned,
    Blocked,
    Queued,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Allowed => "allowed",
            EventKind::Warned => "warned",
            EventKind::Blocked => "blocked",
            EventKind::Queued => "queued",
        }
    }
}

impl std::str::FromStr for EventKind {
    type Err = TurnstileError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "allowed" => Ok(EventKind::Allowed),
            "warned" => Ok(EventKind::Warned),
            "blocked" => Ok(EventKind::Blocked),
            "queued" => Ok(EventKind::Queued),
            other => Err(TurnstileError::InvalidInput(format!("unknown event kind: {other}"))),
        }
    }
}

/// The current status of a deferred request in the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    /// Waiting to be drained
    Pending,
    /// Claimed by a drain pass but not yet resolved
    Processing,
    /// Admitted and accounted against the windows
    Completed,
    /// Terminal failure (expired, cancelled, or out of retries)
    Failed,
}

impl QueueStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, QueueStatus::Completed | QueueStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            QueueStatus::Pending => "pending",
            QueueStatus::Processing => "processing",
            QueueStatus::Completed => "completed",
            QueueStatus::Failed => "failed",
        }
    }
}

impl std::str::FromStr for QueueStatus {
    type Err = TurnstileError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(QueueStatus::Pending),
            "processing" => Ok(QueueStatus::Processing),
            "completed" => Ok(QueueStatus::Completed),
            "failed" => Ok(QueueStatus::Failed),
            other => Err(TurnstileError::InvalidInput(format!("unknown queue status: {other}"))),
        }
    }
}

/// The kind of a detected usage pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternKind {
    TimeOfDay,
    DayOfWeek,
    Burst,
}

impl PatternKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PatternKind::TimeOfDay => "time_of_day",
            PatternKind::DayOfWeek => "day_of_week",
            PatternKind::Burst => "burst",
        }
    }
}

impl std::str::FromStr for PatternKind {
    type Err = TurnstileError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "time_of_day" => Ok(PatternKind::TimeOfDay),
            "day_of_week" => Ok(PatternKind::DayOfWeek),
            "burst" => Ok(PatternKind::Burst),
            other => Err(TurnstileError::InvalidInput(format!("unknown pattern kind: {other}"))),
        }
    }
}

/// The accounting key a window counts against.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WindowKey {
    pub tenant: String,
    pub provider: String,
    pub model: String,
    pub horizon: Horizon,
}

/// One accounting bucket: counts for a (tenant, provider, model, horizon) key
/// over a request-anchored interval `[starts_at, ends_at)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Window {
    pub id: i64,
    pub tenant: String,
    pub provider: String,
    pub model: String,
    pub horizon: Horizon,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    pub request_count: i64,
    pub token_count: i64,
    pub request_limit: Option<i64>,
    pub token_limit: Option<i64>,
    pub active: bool,
}

impl Window {
    /// Whether the window has passed its end at the given instant.
    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        self.ends_at <= now
    }
}

/// A deferred request held for opportunistic admission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub id: QueueId,
    pub tenant: String,
    pub provider: String,
    pub model: String,
    pub payload: serde_json::Value,
    pub priority: i64,
    pub retry_count: i64,
    pub max_retries: i64,
    pub status: QueueStatus,
    pub error: Option<String>,
    pub queued_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

/// Append-only audit record of one admission decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageEvent {
    pub id: i64,
    pub tenant: String,
    pub provider: String,
    pub model: String,
    pub at: DateTime<Utc>,
    pub kind: EventKind,
    pub horizon: Option<Horizon>,
    pub current_count: Option<i64>,
    pub limit: Option<i64>,
    pub percent_used: Option<f64>,
    pub request_id: Option<String>,
    pub was_queued: bool,
    pub queue_time_ms: Option<i64>,
    pub pattern_tag: Option<String>,
}

/// A persisted statistical summary of recent usage, with advisory
/// recommendations. Patterns never change limits by themselves.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsagePattern {
    pub id: String,
    pub tenant: String,
    pub kind: PatternKind,
    pub window_label: String,
    pub avg_rpm: f64,
    pub peak_rpm: f64,
    pub confidence: f64,
    pub suggested_limit: Option<i64>,
    pub suggested_queue_size: Option<i64>,
    pub observations: i64,
    pub first_detected: DateTime<Utc>,
    pub last_observed: DateTime<Utc>,
}

/// A tenant row: the principal whose quota is enforced, identified by an
/// opaque wallet string. Rows are lazily initialised on first reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tenant {
    pub wallet: String,
    pub tier: Tier,
    pub paid_until: Option<DateTime<Utc>>,
    pub max_queue_size: i64,
    pub created_at: DateTime<Utc>,
}

impl Tenant {
    /// The tier actually in force: `pro` only while paid up. An absent or
    /// elapsed paid-until means free regardless of the stored tier.
    pub fn effective_tier(&self, now: DateTime<Utc>) -> Tier {
        match (self.tier, self.paid_until) {
            (Tier::Pro, Some(until)) if until > now => Tier::Pro,
            _ => Tier::Free,
        }
    }
}

/// Convert a timestamp to the unix-millisecond form stored in the database.
pub(crate) fn to_millis(t: DateTime<Utc>) -> i64 {
    t.timestamp_millis()
}

/// Convert a stored unix-millisecond timestamp back to a `DateTime<Utc>`.
pub(crate) fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(ms).unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    #[test]
    fn queue_id_short_form() {
        let id = QueueId::new();
        let s = id.to_short_string();
        assert!(s.starts_with("q_"));
        assert_eq!(s.len(), 10);
    }

    #[test]
    fn horizon_durations() {
        assert_eq!(Horizon::Minute.duration_secs(), 60);
        assert_eq!(Horizon::Hour.duration_secs(), 3_600);
        assert_eq!(Horizon::Day.duration_secs(), 86_400);
    }

    #[test]
    fn effective_tier_requires_unexpired_payment() {
        let now = Utc::now();
        let mut tenant = Tenant {
            wallet: "0xabc".to_string(),
            tier: Tier::Pro,
            paid_until: Some(now + TimeDelta::days(1)),
            max_queue_size: 100,
            created_at: now,
        };
        assert_eq!(tenant.effective_tier(now), Tier::Pro);

        tenant.paid_until = Some(now - TimeDelta::seconds(1));
        assert_eq!(tenant.effective_tier(now), Tier::Free);

        tenant.paid_until = None;
        assert_eq!(tenant.effective_tier(now), Tier::Free);
    }

    #[test]
    fn queue_status_terminality() {
        assert!(!QueueStatus::Pending.is_terminal());
        assert!(!QueueStatus::Processing.is_terminal());
        assert!(QueueStatus::Completed.is_terminal());
        assert!(QueueStatus::Failed.is_terminal());
    }

    #[test]
    fn millis_round_trip() {
        let t = Utc::now();
        let back = from_millis(to_millis(t));
        assert_eq!(to_millis(back), to_millis(t));
    }
}
