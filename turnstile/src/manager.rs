//! Orchestrator for the three pipeline hook points.
//!
//! The manager owns the other components by composition and serialises the
//! composite critical sections (admission, post-call accounting, queue
//! drain) behind a per-tenant mutex. Operations for different tenants run
//! in parallel; within one tenant, two concurrent pre-calls can never both
//! be admitted past a limit.
//!
//! Error posture follows the pipeline contract: pre-call surfaces refusals
//! and invalid input to the host and fails closed on store breakage;
//! post-call and session-end log and swallow everything, because a
//! successful provider call must never be invalidated by an accounting
//! failure.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, error, info, instrument, warn};

use crate::clock::Clock;
use crate::config::GovernorConfig;
use crate::error::{Result, TurnstileError};
use crate::limits::LimitSet;
use crate::patterns::{Analysis, PatternDetector, Prediction};
use crate::queue::QueueService;
use crate::store::{NewEvent, QueueStats, Store};
use crate::tiers::TierCapabilities;
use crate::types::{
    EventKind, Horizon, QueueEntry, QueueId, Tenant, Tier, UsageEvent, UsagePattern, Window,
    WindowKey,
};
use crate::window::{ExceedCheck, WindowTracker};

/// Key under which the admission decision is attached to the request
/// payload for the post-call hook's benefit.
pub const DECISION_KEY: &str = "_quota_decision";

/// Point-in-time view of one tenant for dashboards and CLI.
#[derive(Debug, Clone, serde::Serialize)]
pub struct StatusSnapshot {
    pub tenant: String,
    pub tier: Tier,
    pub capabilities: TierCapabilities,
    pub paid_until: Option<DateTime<Utc>>,
    pub active_windows: Vec<Window>,
    pub queue: QueueStats,
}

/// Queue listing plus aggregate statistics.
#[derive(Debug, Clone)]
pub struct QueueView {
    pub entries: Vec<QueueEntry>,
    pub stats: QueueStats,
}

/// Summary handed back at session end.
#[derive(Debug, Clone)]
pub struct SessionSummary {
    pub session_id: String,
    pub request_count: usize,
    pub duration_ms: i64,
    pub active_windows: Vec<Window>,
    pub patterns_detected: usize,
}

/// Rows removed by one retention sweep.
#[derive(Debug, Clone, Copy, Default)]
pub struct RetentionReport {
    pub events: u64,
    pub queue_entries: u64,
    pub windows: u64,
    pub patterns: u64,
}

#[derive(Debug)]
struct SessionRoster {
    started_at: DateTime<Utc>,
    request_ids: Vec<String>,
}

struct ManagerInner {
    store: Store,
    windows: WindowTracker,
    queue: QueueService,
    patterns: PatternDetector,
    clock: Clock,
    config: GovernorConfig,
    tenant_locks: parking_lot::Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    sessions: parking_lot::Mutex<HashMap<String, SessionRoster>>,
}

/// The quota governor. Cheap to clone; every clone shares the same store,
/// lock table, and session roster.
#[derive(Clone)]
pub struct Manager {
    inner: Arc<ManagerInner>,
}

impl Manager {
    /// Open the configured database and build a governor around it.
    pub async fn new(config: GovernorConfig) -> Result<Self> {
        let store = Store::connect(&config.database_url).await?;
        Ok(Self::from_parts(store, Clock::system(), config))
    }

    /// Assemble a governor from existing parts. Used by tests that provision
    /// their own store and drive a fixed clock.
    pub fn from_parts(store: Store, clock: Clock, config: GovernorConfig) -> Self {
        let windows = WindowTracker::new(store.clone(), clock.clone());
        let queue = QueueService::new(store.clone(), clock.clone(), config.queue);
        let patterns = PatternDetector::new(store.clone(), clock.clone(), config.patterns);
        Self {
            inner: Arc::new(ManagerInner {
                store,
                windows,
                queue,
                patterns,
                clock,
                config,
                tenant_locks: parking_lot::Mutex::new(HashMap::new()),
                sessions: parking_lot::Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn store(&self) -> &Store {
        &self.inner.store
    }

    fn tenant_lock(&self, wallet: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.inner.tenant_locks.lock();
        locks
            .entry(wallet.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    async fn tenant_context(&self, wallet: &str) -> Result<(Tenant, Tier, TierCapabilities)> {
        let tenant = self
            .inner
            .store
            .tenant_or_default(wallet, self.inner.clock.now())
            .await?;
        let tier = tenant.effective_tier(self.inner.clock.now());
        let capabilities = TierCapabilities::for_tier(tier);
        Ok((tenant, tier, capabilities))
    }

    // ---- pipeline hooks ----------------------------------------------------

    /// Admission decision for one outgoing request.
    ///
    /// Returns on admit, after reserving one request slot on every horizon
    /// and attaching the decision record to the payload. Refusals surface as
    /// [`TurnstileError::Queued`] or [`TurnstileError::LimitExceeded`]
    /// (or the queue gate errors); the host must not proceed with the call.
    #[instrument(skip(self, request))]
    pub async fn pre_call(
        &self,
        request_id: &str,
        provider: &str,
        model: &str,
        tenant: &str,
        session_id: &str,
        request: &mut Value,
    ) -> Result<()> {
        validate_identifier(request_id, "request id")?;
        validate_identifier(provider, "provider")?;
        validate_identifier(model, "model")?;
        validate_identifier(tenant, "tenant")?;
        validate_priority_field(request)?;

        let lock = self.tenant_lock(tenant);
        let _guard = lock.lock().await;

        match self.admit(request_id, provider, model, tenant, request).await {
            Ok(()) => {
                let mut sessions = self.inner.sessions.lock();
                let roster = sessions
                    .entry(session_id.to_string())
                    .or_insert_with(|| SessionRoster {
                        started_at: self.inner.clock.now(),
                        request_ids: Vec::new(),
                    });
                roster.request_ids.push(request_id.to_string());
                Ok(())
            }
            Err(refusal)
                if refusal.is_refusal()
                    || matches!(
                        refusal,
                        TurnstileError::QueueDisabled
                            | TurnstileError::QueueFull { .. }
                            | TurnstileError::InvalidInput(_)
                    ) =>
            {
                Err(refusal)
            }
            Err(failure) => {
                // Fail closed: a broken store never silently admits.
                error!(%failure, "admission path store failure, treating as limit exceeded");
                Err(TurnstileError::LimitExceeded {
                    horizon: Horizon::Minute,
                    current: 0,
                    limit: 0,
                    percent_used: 100.0,
                })
            }
        }
    }

    async fn admit(
        &self,
        request_id: &str,
        provider: &str,
        model: &str,
        wallet: &str,
        request: &mut Value,
    ) -> Result<()> {
        let (tenant, tier, capabilities) = self.tenant_context(wallet).await?;
        let estimated_tokens = request.get("estimated_tokens").and_then(Value::as_i64);

        let mut admitted = Vec::with_capacity(Horizon::ALL.len());
        for horizon in Horizon::ALL {
            let key = window_key(wallet, provider, model, horizon);
            let check = self
                .inner
                .windows
                .would_exceed(&key, tier, estimated_tokens)
                .await?;
            if check.exceeded {
                return self
                    .refuse(request_id, provider, model, &tenant, &capabilities, check, request)
                    .await;
            }
            admitted.push(check);
        }

        // Reserve the slot on every horizon before the provider call runs.
        for check in &admitted {
            self.inner.store.increment_window(check.window_id, 0).await?;
        }

        let minute = &admitted[0];
        let current = minute.current + 1;
        self.inner
            .store
            .record_event(&NewEvent {
                tenant: wallet.to_string(),
                provider: provider.to_string(),
                model: model.to_string(),
                at: self.inner.clock.now(),
                kind: EventKind::Allowed,
                horizon: Some(Horizon::Minute),
                current_count: Some(current),
                limit: minute.limit,
                percent_used: minute.limit.map(|l| percent(current, l)),
                request_id: Some(request_id.to_string()),
                was_queued: false,
                queue_time_ms: None,
                pattern_tag: None,
            })
            .await?;

        attach_decision(request, request_id, tier, self.inner.clock.now());
        Ok(())
    }

    async fn refuse(
        &self,
        request_id: &str,
        provider: &str,
        model: &str,
        tenant: &Tenant,
        capabilities: &TierCapabilities,
        check: ExceedCheck,
        request: &Value,
    ) -> Result<()> {
        let limit = check.limit.unwrap_or(0);
        if capabilities.may_queue {
            let priority = request.get("priority").and_then(Value::as_i64);
            match self
                .inner
                .queue
                .enqueue(
                    &tenant.wallet,
                    capabilities,
                    tenant.max_queue_size,
                    provider,
                    model,
                    request.clone(),
                    priority,
                )
                .await
            {
                Ok(entry) => {
                    self.record_refusal_event(
                        request_id, provider, model, &tenant.wallet, &check, EventKind::Queued, true,
                    )
                    .await?;
                    debug!(queue_id = %entry.id, horizon = %check.horizon, "request deferred");
                    Err(TurnstileError::Queued {
                        queue_id: entry.id,
                        horizon: check.horizon,
                        current: check.current,
                        limit,
                        percent_used: check.percent_used,
                    })
                }
                Err(gate @ (TurnstileError::QueueFull { .. } | TurnstileError::QueueDisabled)) => {
                    self.record_refusal_event(
                        request_id, provider, model, &tenant.wallet, &check, EventKind::Blocked, false,
                    )
                    .await?;
                    Err(gate)
                }
                Err(other) => Err(other),
            }
        } else {
            self.record_refusal_event(
                request_id, provider, model, &tenant.wallet, &check, EventKind::Blocked, false,
            )
            .await?;
            Err(TurnstileError::LimitExceeded {
                horizon: check.horizon,
                current: check.current,
                limit,
                percent_used: check.percent_used,
            })
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn record_refusal_event(
        &self,
        request_id: &str,
        provider: &str,
        model: &str,
        wallet: &str,
        check: &ExceedCheck,
        kind: EventKind,
        was_queued: bool,
    ) -> Result<()> {
        self.inner
            .store
            .record_event(&NewEvent {
                tenant: wallet.to_string(),
                provider: provider.to_string(),
                model: model.to_string(),
                at: self.inner.clock.now(),
                kind,
                horizon: Some(check.horizon),
                current_count: Some(check.current),
                limit: check.limit,
                percent_used: Some(check.percent_used),
                request_id: Some(request_id.to_string()),
                was_queued,
                queue_time_ms: None,
                pattern_tag: None,
            })
            .await
    }

    /// Post-call accounting: record true token usage, then drain the queue
    /// opportunistically. Never surfaces an error to the host.
    #[instrument(skip(self, request, response))]
    pub async fn post_call(
        &self,
        request_id: &str,
        provider: &str,
        model: &str,
        tenant: &str,
        _session_id: &str,
        request: &Value,
        response: &Value,
    ) {
        if let Err(failure) = self
            .post_call_inner(request_id, provider, model, tenant, request, response)
            .await
        {
            warn!(%request_id, %failure, "post-call accounting failed; provider result stands");
        }
    }

    async fn post_call_inner(
        &self,
        _request_id: &str,
        provider: &str,
        model: &str,
        wallet: &str,
        request: &Value,
        response: &Value,
    ) -> Result<()> {
        // Queued and blocked requests never pre-incremented, so there is
        // nothing to account.
        if request.get(DECISION_KEY).is_none() {
            return Ok(());
        }
        let tokens_used = extract_tokens_used(response);

        let lock = self.tenant_lock(wallet);
        let _guard = lock.lock().await;

        let (_, tier, capabilities) = self.tenant_context(wallet).await?;
        for horizon in Horizon::ALL {
            let key = window_key(wallet, provider, model, horizon);
            self.inner.windows.add_tokens(&key, tier, tokens_used).await?;
        }

        if capabilities.may_queue {
            self.drain(wallet, tier).await?;
        }
        Ok(())
    }

    /// Admit pending queue entries while minute capacity lasts, bounded per
    /// post-call so one caller never does unbounded work.
    async fn drain(&self, wallet: &str, tier: Tier) -> Result<()> {
        for _ in 0..self.inner.config.queue.drain_limit {
            let Some(entry) = self.inner.queue.next_eligible(Some(wallet)).await? else {
                break;
            };
            let minute_key = window_key(wallet, &entry.provider, &entry.model, Horizon::Minute);
            let check = self.inner.windows.would_exceed(&minute_key, tier, None).await?;
            if check.exceeded {
                self.inner.queue.repend(entry.id).await?;
                break;
            }

            self.inner.queue.complete(entry.id, true, None).await?;
            for horizon in Horizon::ALL {
                let key = window_key(wallet, &entry.provider, &entry.model, horizon);
                self.inner.windows.increment(&key, tier, 0).await?;
            }

            let waited_ms = (self.inner.clock.now() - entry.queued_at).num_milliseconds();
            self.inner
                .store
                .record_event(&NewEvent {
                    tenant: wallet.to_string(),
                    provider: entry.provider.clone(),
                    model: entry.model.clone(),
                    at: self.inner.clock.now(),
                    kind: EventKind::Allowed,
                    horizon: Some(Horizon::Minute),
                    current_count: Some(check.current + 1),
                    limit: check.limit,
                    percent_used: check.limit.map(|l| percent(check.current + 1, l)),
                    request_id: None,
                    was_queued: true,
                    queue_time_ms: Some(waited_ms),
                    pattern_tag: None,
                })
                .await?;
            info!(queue_id = %entry.id, waited_ms, "drained queue entry");
        }
        Ok(())
    }

    /// Session teardown: free the roster, run pattern analysis for tenants
    /// whose tier learns patterns, and snapshot active windows. Never
    /// surfaces an error to the host.
    #[instrument(skip(self))]
    pub async fn session_end(&self, session_id: &str, tenant: &str) -> SessionSummary {
        let roster = self.inner.sessions.lock().remove(session_id);
        let (request_count, duration_ms) = match &roster {
            Some(roster) => (
                roster.request_ids.len(),
                (self.inner.clock.now() - roster.started_at).num_milliseconds(),
            ),
            None => (0, 0),
        };

        let mut summary = SessionSummary {
            session_id: session_id.to_string(),
            request_count,
            duration_ms,
            active_windows: Vec::new(),
            patterns_detected: 0,
        };

        match self.tenant_context(tenant).await {
            Ok((_, _, capabilities)) if capabilities.may_learn_patterns => {
                match self.inner.patterns.analyze(tenant).await {
                    Ok(analysis) => summary.patterns_detected = analysis.patterns.len(),
                    Err(failure) => warn!(%failure, "pattern analysis failed at session end"),
                }
            }
            Ok(_) => {}
            Err(failure) => warn!(%failure, "tenant lookup failed at session end"),
        }

        match self.inner.store.active_windows(tenant).await {
            Ok(windows) => summary.active_windows = windows,
            Err(failure) => warn!(%failure, "window snapshot failed at session end"),
        }

        summary
    }

    // ---- read API ----------------------------------------------------------

    pub async fn status(&self, tenant: &str) -> Result<StatusSnapshot> {
        let (tenant_row, tier, capabilities) = self.tenant_context(tenant).await?;
        let active_windows = self.inner.store.active_windows(&tenant_row.wallet).await?;
        let queue = self.inner.queue.stats(&tenant_row.wallet).await?;
        Ok(StatusSnapshot {
            tenant: tenant_row.wallet,
            tier,
            capabilities,
            paid_until: tenant_row.paid_until,
            active_windows,
            queue,
        })
    }

    pub async fn active_windows(&self, tenant: &str) -> Result<Vec<Window>> {
        self.inner.store.active_windows(tenant).await
    }

    pub async fn patterns(&self, tenant: &str, limit: i64) -> Result<Vec<UsagePattern>> {
        self.inner.store.patterns(tenant, limit).await
    }

    pub async fn queue(&self, tenant: &str, limit: i64) -> Result<QueueView> {
        Ok(QueueView {
            entries: self.inner.queue.entries(tenant, limit).await?,
            stats: self.inner.queue.stats(tenant).await?,
        })
    }

    pub async fn events(
        &self,
        tenant: &str,
        kind: Option<EventKind>,
        since: Option<DateTime<Utc>>,
        limit: i64,
    ) -> Result<Vec<UsageEvent>> {
        self.inner.store.events(tenant, kind, since, limit).await
    }

    /// Usage prediction from stored patterns. Pro only.
    pub async fn predict(&self, tenant: &str) -> Result<Prediction> {
        let (_, _, capabilities) = self.tenant_context(tenant).await?;
        if !capabilities.may_learn_patterns {
            return Err(TurnstileError::TierRestricted {
                feature: "usage prediction",
            });
        }
        self.inner.patterns.predict(tenant).await
    }

    /// Run pattern analysis out of band (pro only).
    pub async fn analyze_patterns(&self, tenant: &str) -> Result<Analysis> {
        let (_, _, capabilities) = self.tenant_context(tenant).await?;
        if !capabilities.may_learn_patterns {
            return Err(TurnstileError::TierRestricted {
                feature: "pattern analysis",
            });
        }
        self.inner.patterns.analyze(tenant).await
    }

    /// Cancel a pending queue entry.
    pub async fn cancel_queued(&self, id: QueueId) -> Result<()> {
        self.inner.queue.cancel(id).await
    }

    /// Reposition a pending queue entry.
    pub async fn update_queue_priority(&self, id: QueueId, priority: i64) -> Result<()> {
        self.inner.queue.update_priority(id, priority).await
    }

    /// Entries strictly ahead of `id` in its tenant's queue.
    pub async fn queue_position(&self, id: QueueId) -> Result<i64> {
        self.inner.queue.position(id).await
    }

    // ---- admin mutators ----------------------------------------------------

    /// Store custom per-minute ceilings for a provider/model under the
    /// tenant's effective tier. Gated on the may-use-custom-limits
    /// capability.
    pub async fn set_limit(
        &self,
        tenant: &str,
        provider: &str,
        model: Option<&str>,
        requests_per_minute: Option<i64>,
        tokens_per_minute: Option<i64>,
    ) -> Result<()> {
        validate_identifier(provider, "provider")?;
        let (_, tier, capabilities) = self.tenant_context(tenant).await?;
        if !capabilities.may_use_custom_limits {
            return Err(TurnstileError::TierRestricted {
                feature: "custom limits",
            });
        }
        let limits = LimitSet {
            requests_per_minute,
            tokens_per_minute,
            ..Default::default()
        };
        self.inner
            .store
            .upsert_limit_config(provider, model, tier, &limits, self.inner.clock.now())
            .await
    }

    /// Set a tenant's stored tier, payment horizon, and queue capacity
    /// override. This is the seam the licensing mechanism feeds.
    pub async fn set_tenant_tier(
        &self,
        tenant: &str,
        tier: Tier,
        paid_until: Option<DateTime<Utc>>,
        max_queue_size: i64,
    ) -> Result<()> {
        self.inner
            .store
            .update_tenant(tenant, tier, paid_until, max_queue_size, self.inner.clock.now())
            .await
    }

    // ---- housekeeping ------------------------------------------------------

    /// Apply the retention policy once.
    pub async fn run_retention_sweep(&self) -> Result<RetentionReport> {
        let now = self.inner.clock.now();
        let retention = self.inner.config.retention;
        let report = RetentionReport {
            events: self
                .inner
                .store
                .prune_events_before(now - chrono::TimeDelta::days(retention.events_days))
                .await?,
            queue_entries: self
                .inner
                .store
                .prune_terminal_queue_before(now - chrono::TimeDelta::days(retention.terminal_queue_days))
                .await?,
            windows: self
                .inner
                .store
                .prune_inactive_windows_before(
                    now - chrono::TimeDelta::days(retention.inactive_windows_days),
                )
                .await?,
            patterns: self
                .inner
                .store
                .prune_low_confidence_patterns(
                    retention.pattern_min_confidence,
                    now - chrono::TimeDelta::days(retention.low_confidence_pattern_days),
                )
                .await?,
        };
        info!(
            events = report.events,
            queue_entries = report.queue_entries,
            windows = report.windows,
            patterns = report.patterns,
            "retention sweep complete"
        );
        Ok(report)
    }

    /// Spawn the periodic retention sweeper.
    pub fn spawn_retention(&self) -> tokio::task::JoinHandle<()> {
        let manager = self.clone();
        let period =
            std::time::Duration::from_secs(manager.inner.config.retention.sweep_interval_secs);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(failure) = manager.run_retention_sweep().await {
                    error!(%failure, "retention sweep failed");
                }
            }
        })
    }
}

fn window_key(tenant: &str, provider: &str, model: &str, horizon: Horizon) -> WindowKey {
    WindowKey {
        tenant: tenant.to_string(),
        provider: provider.to_string(),
        model: model.to_string(),
        horizon,
    }
}

fn percent(current: i64, limit: i64) -> f64 {
    if limit > 0 {
        current as f64 / limit as f64 * 100.0
    } else {
        0.0
    }
}

fn validate_identifier(value: &str, field: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(TurnstileError::InvalidInput(format!("{field} must not be empty")));
    }
    Ok(())
}

fn validate_priority_field(request: &Value) -> Result<()> {
    if let Some(priority) = request.get("priority") {
        let Some(priority) = priority.as_i64() else {
            return Err(TurnstileError::InvalidInput(
                "priority must be an integer".to_string(),
            ));
        };
        if !(crate::queue::MIN_PRIORITY..=crate::queue::MAX_PRIORITY).contains(&priority) {
            return Err(TurnstileError::InvalidInput(format!(
                "priority {priority} out of range"
            )));
        }
    }
    Ok(())
}

fn attach_decision(request: &mut Value, request_id: &str, tier: Tier, now: DateTime<Utc>) {
    if let Some(map) = request.as_object_mut() {
        map.insert(
            DECISION_KEY.to_string(),
            json!({
                "request_id": request_id,
                "admitted_at": now.timestamp_millis(),
                "tier": tier.as_str(),
            }),
        );
    }
}

/// Token usage read from the provider response, in precedence order:
/// `_cost_metrics.tokens_total`, then `usage.total_tokens`, else 0.
/// Absence is not an error.
fn extract_tokens_used(response: &Value) -> i64 {
    response
        .pointer("/_cost_metrics/tokens_total")
        .and_then(Value::as_i64)
        .or_else(|| response.pointer("/usage/total_tokens").and_then(Value::as_i64))
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_extraction_precedence() {
        let both = json!({
            "_cost_metrics": {"tokens_total": 123},
            "usage": {"total_tokens": 456},
        });
        assert_eq!(extract_tokens_used(&both), 123);

        let usage_only = json!({"usage": {"total_tokens": 456}});
        assert_eq!(extract_tokens_used(&usage_only), 456);

        assert_eq!(extract_tokens_used(&json!({})), 0);
        assert_eq!(extract_tokens_used(&json!({"usage": {"total_tokens": "n/a"}})), 0);
    }

    #[test]
    fn priority_field_validation() {
        assert!(validate_priority_field(&json!({})).is_ok());
        assert!(validate_priority_field(&json!({"priority": 7})).is_ok());
        assert!(validate_priority_field(&json!({"priority": "high"})).is_err());
        assert!(validate_priority_field(&json!({"priority": 0})).is_err());
        assert!(validate_priority_field(&json!({"priority": 11})).is_err());
    }

    #[test]
    fn decision_record_is_attached_to_objects() {
        let mut request = json!({"prompt": "hi"});
        attach_decision(&mut request, "req-1", Tier::Pro, Utc::now());
        assert_eq!(request[DECISION_KEY]["request_id"], "req-1");
        assert_eq!(request[DECISION_KEY]["tier"], "pro");
    }
}
