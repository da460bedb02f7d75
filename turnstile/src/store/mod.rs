//! Durable state access layer.
//!
//! The `Store` is the sole custodian of governor state: limit configurations,
//! windows, queue entries, events, patterns, and tenants. It exposes CRUD and
//! targeted queries but contains no admission policy. Every operation is
//! individually atomic; composite invariants across calls are protected by
//! the manager's per-tenant mutex.
//!
//! Backed by a single local SQLite file in WAL mode. Timestamps are stored
//! as unix epoch milliseconds so ordering comparisons in SQL are exact.

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use tracing::instrument;

use crate::error::{Result, TurnstileError};
use crate::limits::{LimitConfig, LimitSet};
use crate::types::{
    from_millis, to_millis, EventKind, Horizon, QueueEntry, QueueId, QueueStatus, Tenant, Tier,
    UsageEvent, UsagePattern, Window, WindowKey,
};

mod rows;

use rows::{EventRow, LimitConfigRow, PatternRow, QueueEntryRow, QueueStatsRow, TenantRow, WindowRow};

/// An event to append; the store assigns the row id.
#[derive(Debug, Clone)]
pub struct NewEvent {
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

/// Per-tenant queue statistics.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct QueueStats {
    pub pending: i64,
    pub processing: i64,
    pub completed: i64,
    pub failed: i64,
    /// Mean wait of terminal entries, queued-at to processed-at.
    pub avg_wait_ms: Option<f64>,
    pub oldest_pending_at: Option<DateTime<Utc>>,
}

#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open (creating if missing) the database at `url` and run migrations.
    pub async fn connect(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5))
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// Wrap an existing pool (used by the sqlx test harness, which provisions
    /// databases with migrations already applied).
    pub fn with_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    // ---- tenants ----------------------------------------------------------

    /// Fetch a tenant row, lazily initialising a free-tier row on first
    /// reference.
    pub async fn tenant_or_default(&self, wallet: &str, now: DateTime<Utc>) -> Result<Tenant> {
        sqlx::query(
            "INSERT INTO tenants (wallet, tier, max_queue_size, created_at)
             VALUES (?1, 'free', 0, ?2)
             ON CONFLICT (wallet) DO NOTHING",
        )
        .bind(wallet)
        .bind(to_millis(now))
        .execute(&self.pool)
        .await?;

        let row = sqlx::query_as::<_, TenantRow>("SELECT * FROM tenants WHERE wallet = ?1")
            .bind(wallet)
            .fetch_one(&self.pool)
            .await?;
        row.try_into()
    }

    /// Set a tenant's stored tier and payment horizon. `max_queue_size = 0`
    /// means the tier default applies.
    #[instrument(skip(self), err)]
    pub async fn update_tenant(
        &self,
        wallet: &str,
        tier: Tier,
        paid_until: Option<DateTime<Utc>>,
        max_queue_size: i64,
        now: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO tenants (wallet, tier, paid_until, max_queue_size, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT (wallet) DO UPDATE SET
                 tier = excluded.tier,
                 paid_until = excluded.paid_until,
                 max_queue_size = excluded.max_queue_size",
        )
        .bind(wallet)
        .bind(tier.as_str())
        .bind(paid_until.map(to_millis))
        .bind(max_queue_size)
        .bind(to_millis(now))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ---- limit configurations ---------------------------------------------

    /// Return the most specific matching limit row for the requested tier:
    /// an exact model match is preferred over the provider-wide wildcard.
    /// Tiers are isolated; a row configured for one tier never applies to
    /// the other. `None` means nothing is configured for this tier and the
    /// caller falls back to the built-in defaults.
    pub async fn limit_config(
        &self,
        provider: &str,
        model: Option<&str>,
        tier: Tier,
    ) -> Result<Option<LimitConfig>> {
        let model = model.unwrap_or("");
        let row = sqlx::query_as::<_, LimitConfigRow>(
            "SELECT * FROM limit_configs
             WHERE provider = ?1 AND (model = ?2 OR model = '') AND tier = ?3
             ORDER BY (model = ?2) DESC
             LIMIT 1",
        )
        .bind(provider)
        .bind(model)
        .bind(tier.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.map(TryInto::try_into).transpose()
    }

    /// Insert or replace on the unique (provider, model, tier) key.
    #[instrument(skip(self, limits), fields(provider = %provider), err)]
    pub async fn upsert_limit_config(
        &self,
        provider: &str,
        model: Option<&str>,
        tier: Tier,
        limits: &LimitSet,
        now: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO limit_configs
                 (provider, model, tier, requests_per_minute, requests_per_hour,
                  requests_per_day, tokens_per_minute, tokens_per_day, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT (provider, model, tier) DO UPDATE SET
                 requests_per_minute = excluded.requests_per_minute,
                 requests_per_hour = excluded.requests_per_hour,
                 requests_per_day = excluded.requests_per_day,
                 tokens_per_minute = excluded.tokens_per_minute,
                 tokens_per_day = excluded.tokens_per_day,
                 updated_at = excluded.updated_at",
        )
        .bind(provider)
        .bind(model.unwrap_or(""))
        .bind(tier.as_str())
        .bind(limits.requests_per_minute)
        .bind(limits.requests_per_hour)
        .bind(limits.requests_per_day)
        .bind(limits.tokens_per_minute)
        .bind(limits.tokens_per_day)
        .bind(to_millis(now))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ---- windows -----------------------------------------------------------

    /// The active window for a key, expired or not. Rotation is the
    /// tracker's decision, so staleness is not filtered here.
    pub async fn active_window(&self, key: &WindowKey) -> Result<Option<Window>> {
        let row = sqlx::query_as::<_, WindowRow>(
            "SELECT * FROM windows
             WHERE tenant = ?1 AND provider = ?2 AND model = ?3 AND horizon = ?4 AND active = 1",
        )
        .bind(&key.tenant)
        .bind(&key.provider)
        .bind(&key.model)
        .bind(key.horizon.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.map(TryInto::try_into).transpose()
    }

    pub async fn create_window(
        &self,
        key: &WindowKey,
        starts_at: DateTime<Utc>,
        request_limit: Option<i64>,
        token_limit: Option<i64>,
    ) -> Result<Window> {
        let ends_at = starts_at + chrono::TimeDelta::seconds(key.horizon.duration_secs());
        let row = sqlx::query_as::<_, WindowRow>(
            "INSERT INTO windows
                 (tenant, provider, model, horizon, starts_at, ends_at,
                  request_count, token_count, request_limit, token_limit, active)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, 0, ?7, ?8, 1)
             RETURNING *",
        )
        .bind(&key.tenant)
        .bind(&key.provider)
        .bind(&key.model)
        .bind(key.horizon.as_str())
        .bind(to_millis(starts_at))
        .bind(to_millis(ends_at))
        .bind(request_limit)
        .bind(token_limit)
        .fetch_one(&self.pool)
        .await?;
        row.try_into()
    }

    pub async fn deactivate_window(&self, id: i64) -> Result<()> {
        sqlx::query("UPDATE windows SET active = 0 WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Add exactly one request and `delta_tokens` tokens to an active window.
    pub async fn increment_window(&self, id: i64, delta_tokens: i64) -> Result<()> {
        let result = sqlx::query(
            "UPDATE windows
             SET request_count = request_count + 1, token_count = token_count + ?1
             WHERE id = ?2 AND active = 1",
        )
        .bind(delta_tokens)
        .bind(id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(TurnstileError::NotFound {
                resource: "active window",
                id: id.to_string(),
            });
        }
        Ok(())
    }

    /// Raise only the token count; used by the post-call path so the request
    /// reserved in pre-call is not counted twice.
    pub async fn add_window_tokens(&self, id: i64, delta_tokens: i64) -> Result<()> {
        let result = sqlx::query(
            "UPDATE windows SET token_count = token_count + ?1 WHERE id = ?2 AND active = 1",
        )
        .bind(delta_tokens)
        .bind(id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(TurnstileError::NotFound {
                resource: "active window",
                id: id.to_string(),
            });
        }
        Ok(())
    }

    pub async fn active_windows(&self, tenant: &str) -> Result<Vec<Window>> {
        let rows = sqlx::query_as::<_, WindowRow>(
            "SELECT * FROM windows
             WHERE tenant = ?1 AND active = 1
             ORDER BY provider,
                      CASE horizon WHEN 'minute' THEN 0 WHEN 'hour' THEN 1 ELSE 2 END",
        )
        .bind(tenant)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    // ---- queue -------------------------------------------------------------

    pub async fn enqueue(&self, entry: &QueueEntry) -> Result<()> {
        let payload = serde_json::to_string(&entry.payload).map_err(anyhow::Error::from)?;
        sqlx::query(
            "INSERT INTO queue_entries
                 (id, tenant, provider, model, payload, priority, retry_count,
                  max_retries, status, error, queued_at, processed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        )
        .bind(entry.id.as_uuid().to_string())
        .bind(&entry.tenant)
        .bind(&entry.provider)
        .bind(&entry.model)
        .bind(payload)
        .bind(entry.priority)
        .bind(entry.retry_count)
        .bind(entry.max_retries)
        .bind(entry.status.as_str())
        .bind(&entry.error)
        .bind(to_millis(entry.queued_at))
        .bind(entry.processed_at.map(to_millis))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn pending_count(&self, tenant: &str) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM queue_entries WHERE tenant = ?1 AND status = 'pending'",
        )
        .bind(tenant)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    /// Atomically claim the next dequeue candidate: the highest-priority
    /// pending entry with retries remaining, ties broken by earliest
    /// queued-at. The claimed entry transitions to `processing` in the same
    /// statement, so concurrent drains cannot double-claim.
    pub async fn claim_next(&self, tenant: Option<&str>) -> Result<Option<QueueEntry>> {
        let row = sqlx::query_as::<_, QueueEntryRow>(
            "UPDATE queue_entries SET status = 'processing'
             WHERE id = (
                 SELECT id FROM queue_entries
                 WHERE status = 'pending'
                   AND retry_count < max_retries
                   AND (?1 IS NULL OR tenant = ?1)
                 ORDER BY priority DESC, queued_at ASC, id ASC
                 LIMIT 1
             )
             RETURNING *",
        )
        .bind(tenant)
        .fetch_optional(&self.pool)
        .await?;
        row.map(TryInto::try_into).transpose()
    }

    /// Move a claimed entry back to `pending`. This is not a failure, so the
    /// retry count is untouched.
    pub async fn repend(&self, id: QueueId) -> Result<()> {
        let result = sqlx::query(
            "UPDATE queue_entries SET status = 'pending' WHERE id = ?1 AND status = 'processing'",
        )
        .bind(id.as_uuid().to_string())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(TurnstileError::NotFound {
                resource: "processing queue entry",
                id: id.to_string(),
            });
        }
        Ok(())
    }

    /// Terminal transition for a claimed entry. Failure increments the retry
    /// count.
    pub async fn complete_queued(
        &self,
        id: QueueId,
        success: bool,
        error: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let result = if success {
            sqlx::query(
                "UPDATE queue_entries
                 SET status = 'completed', processed_at = ?1, error = NULL
                 WHERE id = ?2 AND status = 'processing'",
            )
            .bind(to_millis(now))
            .bind(id.as_uuid().to_string())
            .execute(&self.pool)
            .await?
        } else {
            sqlx::query(
                "UPDATE queue_entries
                 SET status = 'failed', processed_at = ?1, error = ?2,
                     retry_count = retry_count + 1
                 WHERE id = ?3 AND status = 'processing'",
            )
            .bind(to_millis(now))
            .bind(error)
            .bind(id.as_uuid().to_string())
            .execute(&self.pool)
            .await?
        };
        if result.rows_affected() == 0 {
            return Err(TurnstileError::NotFound {
                resource: "processing queue entry",
                id: id.to_string(),
            });
        }
        Ok(())
    }

    pub async fn queue_entry(&self, id: QueueId) -> Result<Option<QueueEntry>> {
        let row = sqlx::query_as::<_, QueueEntryRow>("SELECT * FROM queue_entries WHERE id = ?1")
            .bind(id.as_uuid().to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.map(TryInto::try_into).transpose()
    }

    /// Cancel a pending entry. Entries already claimed or terminal are not
    /// cancellable.
    #[instrument(skip(self), err)]
    pub async fn cancel_queued(&self, id: QueueId, now: DateTime<Utc>) -> Result<()> {
        let result = sqlx::query(
            "UPDATE queue_entries
             SET status = 'failed', error = 'cancelled', processed_at = ?1
             WHERE id = ?2 AND status = 'pending'",
        )
        .bind(to_millis(now))
        .bind(id.as_uuid().to_string())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(TurnstileError::NotFound {
                resource: "pending queue entry",
                id: id.to_string(),
            });
        }
        Ok(())
    }

    /// Reposition a pending entry. Priority changes on claimed or terminal
    /// entries are rejected.
    pub async fn update_priority(&self, id: QueueId, priority: i64) -> Result<()> {
        let result = sqlx::query(
            "UPDATE queue_entries SET priority = ?1 WHERE id = ?2 AND status = 'pending'",
        )
        .bind(priority)
        .bind(id.as_uuid().to_string())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(TurnstileError::NotFound {
                resource: "pending queue entry",
                id: id.to_string(),
            });
        }
        Ok(())
    }

    /// Count of same-tenant pending entries strictly ahead of `id` under the
    /// (priority desc, queued-at asc) ordering. Only pending entries have a
    /// position; anything else is `NotFound`.
    pub async fn queue_position(&self, id: QueueId) -> Result<i64> {
        let entry = self.queue_entry(id).await?;
        let Some(entry) = entry.filter(|e| e.status == QueueStatus::Pending) else {
            return Err(TurnstileError::NotFound {
                resource: "pending queue entry",
                id: id.to_string(),
            });
        };
        let position: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM queue_entries q
             WHERE q.status = 'pending' AND q.tenant = ?1
               AND (q.priority > ?2
                    OR (q.priority = ?2 AND q.queued_at < ?3)
                    OR (q.priority = ?2 AND q.queued_at = ?3 AND q.id < ?4))",
        )
        .bind(&entry.tenant)
        .bind(entry.priority)
        .bind(to_millis(entry.queued_at))
        .bind(id.as_uuid().to_string())
        .fetch_one(&self.pool)
        .await?;
        Ok(position)
    }

    /// Recent queue entries for a tenant: pending first in dequeue order,
    /// then claimed, then terminal.
    pub async fn queue_entries(&self, tenant: &str, limit: i64) -> Result<Vec<QueueEntry>> {
        let rows = sqlx::query_as::<_, QueueEntryRow>(
            "SELECT * FROM queue_entries WHERE tenant = ?1
             ORDER BY CASE status WHEN 'pending' THEN 0 WHEN 'processing' THEN 1 ELSE 2 END,
                      priority DESC, queued_at ASC
             LIMIT ?2",
        )
        .bind(tenant)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    pub async fn queue_stats(&self, tenant: &str) -> Result<QueueStats> {
        let row = sqlx::query_as::<_, QueueStatsRow>(
            "SELECT
                 COUNT(*) FILTER (WHERE status = 'pending') AS pending,
                 COUNT(*) FILTER (WHERE status = 'processing') AS processing,
                 COUNT(*) FILTER (WHERE status = 'completed') AS completed,
                 COUNT(*) FILTER (WHERE status = 'failed') AS failed,
                 AVG(processed_at - queued_at)
                     FILTER (WHERE status IN ('completed', 'failed')
                             AND processed_at IS NOT NULL) AS avg_wait_ms,
                 MIN(queued_at) FILTER (WHERE status = 'pending') AS oldest_pending
             FROM queue_entries WHERE tenant = ?1",
        )
        .bind(tenant)
        .fetch_one(&self.pool)
        .await?;
        Ok(QueueStats {
            pending: row.pending,
            processing: row.processing,
            completed: row.completed,
            failed: row.failed,
            avg_wait_ms: row.avg_wait_ms,
            oldest_pending_at: row.oldest_pending.map(from_millis),
        })
    }

    // ---- events ------------------------------------------------------------

    pub async fn record_event(&self, event: &NewEvent) -> Result<()> {
        sqlx::query(
            "INSERT INTO events
                 (tenant, provider, model, at, kind, horizon, current_count,
                  limit_value, percent_used, request_id, was_queued, queue_time_ms,
                  pattern_tag)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
        )
        .bind(&event.tenant)
        .bind(&event.provider)
        .bind(&event.model)
        .bind(to_millis(event.at))
        .bind(event.kind.as_str())
        .bind(event.horizon.map(|h| h.as_str()))
        .bind(event.current_count)
        .bind(event.limit)
        .bind(event.percent_used)
        .bind(&event.request_id)
        .bind(event.was_queued)
        .bind(event.queue_time_ms)
        .bind(&event.pattern_tag)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn events(
        &self,
        tenant: &str,
        kind: Option<EventKind>,
        since: Option<DateTime<Utc>>,
        limit: i64,
    ) -> Result<Vec<UsageEvent>> {
        let rows = sqlx::query_as::<_, EventRow>(
            "SELECT * FROM events
             WHERE tenant = ?1
               AND (?2 IS NULL OR kind = ?2)
               AND (?3 IS NULL OR at >= ?3)
             ORDER BY at DESC LIMIT ?4",
        )
        .bind(tenant)
        .bind(kind.map(|k| k.as_str()))
        .bind(since.map(to_millis))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    /// Timestamps of `allowed` events since the cutoff, ascending. This is
    /// the pattern detector's input.
    pub async fn allowed_event_times(
        &self,
        tenant: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<DateTime<Utc>>> {
        let times: Vec<i64> = sqlx::query_scalar(
            "SELECT at FROM events
             WHERE tenant = ?1 AND kind = 'allowed' AND at >= ?2
             ORDER BY at ASC",
        )
        .bind(tenant)
        .bind(to_millis(since))
        .fetch_all(&self.pool)
        .await?;
        Ok(times.into_iter().map(from_millis).collect())
    }

    // ---- patterns ----------------------------------------------------------

    /// Upsert keyed on the deterministic pattern id; first-detected survives
    /// refreshes.
    pub async fn upsert_pattern(&self, pattern: &UsagePattern) -> Result<()> {
        sqlx::query(
            "INSERT INTO patterns
                 (id, tenant, kind, window_label, avg_rpm, peak_rpm, confidence,
                  suggested_limit, suggested_queue_size, observations,
                  first_detected, last_observed)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
             ON CONFLICT (id) DO UPDATE SET
                 window_label = excluded.window_label,
                 avg_rpm = excluded.avg_rpm,
                 peak_rpm = excluded.peak_rpm,
                 confidence = excluded.confidence,
                 suggested_limit = excluded.suggested_limit,
                 suggested_queue_size = excluded.suggested_queue_size,
                 observations = excluded.observations,
                 last_observed = excluded.last_observed",
        )
        .bind(&pattern.id)
        .bind(&pattern.tenant)
        .bind(pattern.kind.as_str())
        .bind(&pattern.window_label)
        .bind(pattern.avg_rpm)
        .bind(pattern.peak_rpm)
        .bind(pattern.confidence)
        .bind(pattern.suggested_limit)
        .bind(pattern.suggested_queue_size)
        .bind(pattern.observations)
        .bind(to_millis(pattern.first_detected))
        .bind(to_millis(pattern.last_observed))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn patterns(&self, tenant: &str, limit: i64) -> Result<Vec<UsagePattern>> {
        let rows = sqlx::query_as::<_, PatternRow>(
            "SELECT * FROM patterns WHERE tenant = ?1 ORDER BY confidence DESC LIMIT ?2",
        )
        .bind(tenant)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    // ---- housekeeping ------------------------------------------------------

    #[instrument(skip(self), err)]
    pub async fn prune_events_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM events WHERE at < ?1")
            .bind(to_millis(cutoff))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    #[instrument(skip(self), err)]
    pub async fn prune_terminal_queue_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM queue_entries
             WHERE status IN ('completed', 'failed')
               AND COALESCE(processed_at, queued_at) < ?1",
        )
        .bind(to_millis(cutoff))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    #[instrument(skip(self), err)]
    pub async fn prune_inactive_windows_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM windows WHERE active = 0 AND ends_at < ?1")
            .bind(to_millis(cutoff))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    #[instrument(skip(self), err)]
    pub async fn prune_low_confidence_patterns(
        &self,
        max_confidence: f64,
        cutoff: DateTime<Utc>,
    ) -> Result<u64> {
        let result =
            sqlx::query("DELETE FROM patterns WHERE confidence < ?1 AND last_observed < ?2")
                .bind(max_confidence)
                .bind(to_millis(cutoff))
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests;
