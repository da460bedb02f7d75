//! Deferred-request queue.
//!
//! Admission refusals for tenants whose tier permits it land here instead of
//! failing outright. Entries are drained opportunistically by the post-call
//! path; ordering is priority descending with FIFO ties on queued-at.

use chrono::TimeDelta;
use serde_json::Value;
use tracing::debug;

use crate::clock::Clock;
use crate::config::QueueConfig;
use crate::error::{Result, TurnstileError};
use crate::store::{QueueStats, Store};
use crate::tiers::TierCapabilities;
use crate::types::{QueueEntry, QueueId, QueueStatus};

pub const DEFAULT_PRIORITY: i64 = 5;
pub const MIN_PRIORITY: i64 = 1;
pub const MAX_PRIORITY: i64 = 10;

#[derive(Clone)]
pub struct QueueService {
    store: Store,
    clock: Clock,
    config: QueueConfig,
}

impl QueueService {
    pub fn new(store: Store, clock: Clock, config: QueueConfig) -> Self {
        Self { store, clock, config }
    }

    /// Park a refused request, gated on the tenant's tier capabilities and
    /// queue capacity. A caller-supplied priority is honoured only when the
    /// tier has priority queueing; otherwise the default applies.
    pub async fn enqueue(
        &self,
        tenant: &str,
        capabilities: &TierCapabilities,
        tenant_max_queue_size: i64,
        provider: &str,
        model: &str,
        payload: Value,
        priority: Option<i64>,
    ) -> Result<QueueEntry> {
        if !capabilities.may_queue {
            return Err(TurnstileError::QueueDisabled);
        }
        let capacity = capabilities.effective_queue_capacity(tenant_max_queue_size);
        if self.store.pending_count(tenant).await? >= capacity {
            return Err(TurnstileError::QueueFull {
                max_queue_size: capacity,
            });
        }

        let priority = match priority {
            Some(p) if !(MIN_PRIORITY..=MAX_PRIORITY).contains(&p) => {
                return Err(TurnstileError::InvalidInput(format!(
                    "priority {p} out of range {MIN_PRIORITY}..={MAX_PRIORITY}"
                )));
            }
            Some(p) if capabilities.priority_queue_enabled => p,
            _ => DEFAULT_PRIORITY,
        };

        let entry = QueueEntry {
            id: QueueId::new(),
            tenant: tenant.to_string(),
            provider: provider.to_string(),
            model: model.to_string(),
            payload,
            priority,
            retry_count: 0,
            max_retries: self.config.default_max_retries,
            status: QueueStatus::Pending,
            error: None,
            queued_at: self.clock.now(),
            processed_at: None,
        };
        self.store.enqueue(&entry).await?;
        debug!(tenant, queue_id = %entry.id, priority, "request queued");
        Ok(entry)
    }

    /// Claim the next dequeue candidate, terminating over-age entries along
    /// the way. Returns `None` once no admissible entry remains.
    pub async fn next_eligible(&self, tenant: Option<&str>) -> Result<Option<QueueEntry>> {
        let max_age = TimeDelta::seconds(self.config.max_age_secs);
        loop {
            let Some(entry) = self.store.claim_next(tenant).await? else {
                return Ok(None);
            };
            let now = self.clock.now();
            if now - entry.queued_at > max_age {
                self.store
                    .complete_queued(entry.id, false, Some("expired"), now)
                    .await?;
                debug!(queue_id = %entry.id, "queue entry expired before admission");
                continue;
            }
            return Ok(Some(entry));
        }
    }

    /// Return a claimed-but-not-admissible entry to the pending pool. No
    /// failure occurred, so this never charges a retry.
    pub async fn repend(&self, id: QueueId) -> Result<()> {
        self.store.repend(id).await
    }

    /// Terminal transition for a claimed entry.
    pub async fn complete(&self, id: QueueId, success: bool, error: Option<&str>) -> Result<()> {
        self.store
            .complete_queued(id, success, error, self.clock.now())
            .await
    }

    /// Cancel a pending entry.
    pub async fn cancel(&self, id: QueueId) -> Result<()> {
        self.store.cancel_queued(id, self.clock.now()).await
    }

    /// Reposition a pending entry within the ordering.
    pub async fn update_priority(&self, id: QueueId, priority: i64) -> Result<()> {
        if !(MIN_PRIORITY..=MAX_PRIORITY).contains(&priority) {
            return Err(TurnstileError::InvalidInput(format!(
                "priority {priority} out of range {MIN_PRIORITY}..={MAX_PRIORITY}"
            )));
        }
        self.store.update_priority(id, priority).await
    }

    /// Number of same-tenant pending entries strictly ahead of `id`.
    pub async fn position(&self, id: QueueId) -> Result<i64> {
        self.store.queue_position(id).await
    }

    pub async fn entry(&self, id: QueueId) -> Result<Option<QueueEntry>> {
        self.store.queue_entry(id).await
    }

    pub async fn entries(&self, tenant: &str, limit: i64) -> Result<Vec<QueueEntry>> {
        self.store.queue_entries(tenant, limit).await
    }

    pub async fn stats(&self, tenant: &str) -> Result<QueueStats> {
        self.store.queue_stats(tenant).await
    }
}
