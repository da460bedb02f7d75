use chrono::{TimeDelta, Utc};
use sqlx::SqlitePool;

use super::*;

fn now_ms() -> chrono::DateTime<Utc> {
    // Truncate to stored precision so round-trip comparisons are exact.
    from_millis(to_millis(Utc::now()))
}

fn key(tenant: &str, horizon: Horizon) -> WindowKey {
    WindowKey {
        tenant: tenant.to_string(),
        provider: "anthropic".to_string(),
        model: "claude-sonnet".to_string(),
        horizon,
    }
}

fn pending_entry(tenant: &str, priority: i64, queued_at: chrono::DateTime<Utc>) -> QueueEntry {
    QueueEntry {
        id: QueueId::new(),
        tenant: tenant.to_string(),
        provider: "anthropic".to_string(),
        model: "claude-sonnet".to_string(),
        payload: serde_json::json!({"prompt": "hi"}),
        priority,
        retry_count: 0,
        max_retries: 3,
        status: QueueStatus::Pending,
        error: None,
        queued_at,
        processed_at: None,
    }
}

#[sqlx::test]
async fn tenant_rows_are_lazily_initialised(pool: SqlitePool) {
    let store = Store::with_pool(pool);
    let now = now_ms();

    let tenant = store.tenant_or_default("0xabc", now).await.unwrap();
    assert_eq!(tenant.tier, Tier::Free);
    assert_eq!(tenant.max_queue_size, 0);

    // Second reference returns the same row, not a fresh one.
    let again = store.tenant_or_default("0xabc", now + TimeDelta::days(1)).await.unwrap();
    assert_eq!(again.created_at, tenant.created_at);
}

#[sqlx::test]
async fn tenant_update_sets_tier_and_payment(pool: SqlitePool) {
    let store = Store::with_pool(pool);
    let now = now_ms();
    let until = now + TimeDelta::days(30);

    store
        .update_tenant("0xabc", Tier::Pro, Some(until), 100, now)
        .await
        .unwrap();
    let tenant = store.tenant_or_default("0xabc", now).await.unwrap();
    assert_eq!(tenant.tier, Tier::Pro);
    assert_eq!(tenant.paid_until, Some(until));
    assert_eq!(tenant.effective_tier(now), Tier::Pro);
}

#[sqlx::test]
async fn limit_config_prefers_exact_model_over_wildcard(pool: SqlitePool) {
    let store = Store::with_pool(pool);
    let now = now_ms();

    let wildcard = LimitSet {
        requests_per_minute: Some(10),
        ..Default::default()
    };
    let exact = LimitSet {
        requests_per_minute: Some(99),
        ..Default::default()
    };
    store
        .upsert_limit_config("anthropic", None, Tier::Free, &wildcard, now)
        .await
        .unwrap();
    store
        .upsert_limit_config("anthropic", Some("claude-sonnet"), Tier::Free, &exact, now)
        .await
        .unwrap();

    let resolved = store
        .limit_config("anthropic", Some("claude-sonnet"), Tier::Free)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(resolved.limits.requests_per_minute, Some(99));
    assert_eq!(resolved.model.as_deref(), Some("claude-sonnet"));

    // An unconfigured model falls back to the provider-wide row.
    let fallback = store
        .limit_config("anthropic", Some("claude-haiku"), Tier::Free)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(fallback.limits.requests_per_minute, Some(10));
    assert_eq!(fallback.model, None);

    // Nothing configured for the provider at all.
    let absent = store.limit_config("openai", Some("gpt-4o"), Tier::Free).await.unwrap();
    assert!(absent.is_none());
}

#[sqlx::test]
async fn limit_config_tiers_are_isolated(pool: SqlitePool) {
    let store = Store::with_pool(pool);
    let now = now_ms();

    // A pro-only custom row must not leak into free-tier resolution.
    let pro_only = LimitSet {
        requests_per_minute: Some(5_000),
        ..Default::default()
    };
    store
        .upsert_limit_config("anthropic", Some("claude-sonnet"), Tier::Pro, &pro_only, now)
        .await
        .unwrap();

    let free = store
        .limit_config("anthropic", Some("claude-sonnet"), Tier::Free)
        .await
        .unwrap();
    assert!(free.is_none());

    let pro = store
        .limit_config("anthropic", Some("claude-sonnet"), Tier::Pro)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(pro.limits.requests_per_minute, Some(5_000));
}

#[sqlx::test]
async fn limit_config_upsert_replaces_on_key(pool: SqlitePool) {
    let store = Store::with_pool(pool);
    let now = now_ms();

    let first = LimitSet {
        requests_per_minute: Some(10),
        ..Default::default()
    };
    let second = LimitSet {
        requests_per_minute: Some(20),
        tokens_per_minute: Some(1_000),
        ..Default::default()
    };
    store
        .upsert_limit_config("openai", Some("gpt-4o"), Tier::Pro, &first, now)
        .await
        .unwrap();
    store
        .upsert_limit_config("openai", Some("gpt-4o"), Tier::Pro, &second, now)
        .await
        .unwrap();

    let resolved = store
        .limit_config("openai", Some("gpt-4o"), Tier::Pro)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(resolved.limits.requests_per_minute, Some(20));
    assert_eq!(resolved.limits.tokens_per_minute, Some(1_000));
}

#[sqlx::test]
async fn window_lifecycle(pool: SqlitePool) {
    let store = Store::with_pool(pool);
    let now = now_ms();
    let key = key("0xabc", Horizon::Minute);

    assert!(store.active_window(&key).await.unwrap().is_none());

    let window = store.create_window(&key, now, Some(50), Some(40_000)).await.unwrap();
    assert_eq!(window.request_count, 0);
    assert_eq!(window.ends_at, now + TimeDelta::seconds(60));
    assert!(window.active);

    store.increment_window(window.id, 120).await.unwrap();
    store.increment_window(window.id, 0).await.unwrap();
    store.add_window_tokens(window.id, 80).await.unwrap();

    let current = store.active_window(&key).await.unwrap().unwrap();
    assert_eq!(current.request_count, 2);
    assert_eq!(current.token_count, 200);

    store.deactivate_window(window.id).await.unwrap();
    assert!(store.active_window(&key).await.unwrap().is_none());

    // Increments against a deactivated window are refused.
    let err = store.increment_window(window.id, 0).await.unwrap_err();
    assert!(matches!(err, TurnstileError::NotFound { .. }));
}

#[sqlx::test]
async fn second_active_window_per_key_is_rejected(pool: SqlitePool) {
    let store = Store::with_pool(pool);
    let now = now_ms();
    let key = key("0xabc", Horizon::Minute);

    store.create_window(&key, now, None, None).await.unwrap();
    let err = store.create_window(&key, now, None, None).await.unwrap_err();
    assert!(matches!(err, TurnstileError::Store(_)));
}

#[sqlx::test]
async fn active_windows_ordered_by_provider_then_horizon(pool: SqlitePool) {
    let store = Store::with_pool(pool);
    let now = now_ms();

    for (provider, horizon) in [
        ("openai", Horizon::Day),
        ("anthropic", Horizon::Hour),
        ("anthropic", Horizon::Minute),
        ("openai", Horizon::Minute),
    ] {
        let key = WindowKey {
            tenant: "0xabc".to_string(),
            provider: provider.to_string(),
            model: "m".to_string(),
            horizon,
        };
        store.create_window(&key, now, None, None).await.unwrap();
    }

    let windows = store.active_windows("0xabc").await.unwrap();
    let order: Vec<(String, Horizon)> =
        windows.into_iter().map(|w| (w.provider, w.horizon)).collect();
    assert_eq!(
        order,
        vec![
            ("anthropic".to_string(), Horizon::Minute),
            ("anthropic".to_string(), Horizon::Hour),
            ("openai".to_string(), Horizon::Minute),
            ("openai".to_string(), Horizon::Day),
        ]
    );
}

#[sqlx::test]
async fn claim_follows_priority_then_fifo(pool: SqlitePool) {
    let store = Store::with_pool(pool);
    let base = now_ms();

    let low = pending_entry("0xabc", 3, base);
    let high_first = pending_entry("0xabc", 8, base + TimeDelta::seconds(1));
    let high_second = pending_entry("0xabc", 8, base + TimeDelta::seconds(2));
    for entry in [&low, &high_first, &high_second] {
        store.enqueue(entry).await.unwrap();
    }

    let order: Vec<QueueId> = [
        store.claim_next(Some("0xabc")).await.unwrap().unwrap(),
        store.claim_next(Some("0xabc")).await.unwrap().unwrap(),
        store.claim_next(Some("0xabc")).await.unwrap().unwrap(),
    ]
    .iter()
    .map(|e| e.id)
    .collect();
    assert_eq!(order, vec![high_first.id, high_second.id, low.id]);
    assert!(store.claim_next(Some("0xabc")).await.unwrap().is_none());

    // Claimed entries are marked processing.
    let claimed = store.queue_entry(low.id).await.unwrap().unwrap();
    assert_eq!(claimed.status, QueueStatus::Processing);
}

#[sqlx::test]
async fn repend_returns_entry_without_charging_a_retry(pool: SqlitePool) {
    let store = Store::with_pool(pool);
    let entry = pending_entry("0xabc", 5, now_ms());
    store.enqueue(&entry).await.unwrap();

    let claimed = store.claim_next(Some("0xabc")).await.unwrap().unwrap();
    store.repend(claimed.id).await.unwrap();

    let back = store.queue_entry(entry.id).await.unwrap().unwrap();
    assert_eq!(back.status, QueueStatus::Pending);
    assert_eq!(back.retry_count, 0);
}

#[sqlx::test]
async fn failed_completion_charges_a_retry(pool: SqlitePool) {
    let store = Store::with_pool(pool);
    let now = now_ms();
    let entry = pending_entry("0xabc", 5, now);
    store.enqueue(&entry).await.unwrap();

    store.claim_next(Some("0xabc")).await.unwrap().unwrap();
    store
        .complete_queued(entry.id, false, Some("expired"), now)
        .await
        .unwrap();

    let failed = store.queue_entry(entry.id).await.unwrap().unwrap();
    assert_eq!(failed.status, QueueStatus::Failed);
    assert_eq!(failed.retry_count, 1);
    assert_eq!(failed.error.as_deref(), Some("expired"));
    assert_eq!(failed.processed_at, Some(now));
}

#[sqlx::test]
async fn exhausted_entries_are_not_dequeue_candidates(pool: SqlitePool) {
    let store = Store::with_pool(pool);
    let mut entry = pending_entry("0xabc", 5, now_ms());
    entry.retry_count = 3;
    entry.max_retries = 3;
    store.enqueue(&entry).await.unwrap();

    assert!(store.claim_next(Some("0xabc")).await.unwrap().is_none());
}

#[sqlx::test]
async fn cancel_and_reprioritise_pending_only(pool: SqlitePool) {
    let store = Store::with_pool(pool);
    let now = now_ms();
    let entry = pending_entry("0xabc", 5, now);
    store.enqueue(&entry).await.unwrap();

    store.update_priority(entry.id, 9).await.unwrap();
    store.cancel_queued(entry.id, now).await.unwrap();

    let cancelled = store.queue_entry(entry.id).await.unwrap().unwrap();
    assert_eq!(cancelled.status, QueueStatus::Failed);
    assert_eq!(cancelled.error.as_deref(), Some("cancelled"));

    // Terminal entries reject further mutations.
    assert!(matches!(
        store.cancel_queued(entry.id, now).await.unwrap_err(),
        TurnstileError::NotFound { .. }
    ));
    assert!(matches!(
        store.update_priority(entry.id, 1).await.unwrap_err(),
        TurnstileError::NotFound { .. }
    ));
}

#[sqlx::test]
async fn queue_position_counts_entries_ahead(pool: SqlitePool) {
    let store = Store::with_pool(pool);
    let base = now_ms();

    let first = pending_entry("0xabc", 5, base);
    let second = pending_entry("0xabc", 5, base + TimeDelta::seconds(1));
    let urgent = pending_entry("0xabc", 9, base + TimeDelta::seconds(2));
    for entry in [&first, &second, &urgent] {
        store.enqueue(entry).await.unwrap();
    }

    assert_eq!(store.queue_position(urgent.id).await.unwrap(), 0);
    assert_eq!(store.queue_position(first.id).await.unwrap(), 1);
    assert_eq!(store.queue_position(second.id).await.unwrap(), 2);
}

#[sqlx::test]
async fn queue_position_requires_a_pending_entry(pool: SqlitePool) {
    let store = Store::with_pool(pool);
    let now = now_ms();

    // Unknown ids have no position.
    assert!(matches!(
        store.queue_position(QueueId::new()).await.unwrap_err(),
        TurnstileError::NotFound { .. }
    ));

    // Neither do entries in a terminal status.
    let entry = pending_entry("0xabc", 5, now);
    store.enqueue(&entry).await.unwrap();
    store.claim_next(Some("0xabc")).await.unwrap().unwrap();
    store.complete_queued(entry.id, true, None, now).await.unwrap();
    assert!(matches!(
        store.queue_position(entry.id).await.unwrap_err(),
        TurnstileError::NotFound { .. }
    ));
}

#[sqlx::test]
async fn queue_stats_aggregate_by_status(pool: SqlitePool) {
    let store = Store::with_pool(pool);
    let base = now_ms();

    let done = pending_entry("0xabc", 5, base);
    let waiting = pending_entry("0xabc", 5, base + TimeDelta::seconds(5));
    store.enqueue(&done).await.unwrap();
    store.enqueue(&waiting).await.unwrap();

    store.claim_next(Some("0xabc")).await.unwrap().unwrap();
    store
        .complete_queued(done.id, true, None, base + TimeDelta::seconds(2))
        .await
        .unwrap();

    let stats = store.queue_stats("0xabc").await.unwrap();
    assert_eq!(stats.pending, 1);
    assert_eq!(stats.completed, 1);
    assert_eq!(stats.failed, 0);
    assert_eq!(stats.avg_wait_ms, Some(2_000.0));
    assert_eq!(stats.oldest_pending_at, Some(base + TimeDelta::seconds(5)));
}

#[sqlx::test]
async fn events_filter_by_kind_and_time(pool: SqlitePool) {
    let store = Store::with_pool(pool);
    let base = now_ms();

    for (offset, kind) in [
        (0, EventKind::Allowed),
        (10, EventKind::Blocked),
        (20, EventKind::Allowed),
    ] {
        store
            .record_event(&NewEvent {
                tenant: "0xabc".to_string(),
                provider: "anthropic".to_string(),
                model: "claude-sonnet".to_string(),
                at: base + TimeDelta::seconds(offset),
                kind,
                horizon: Some(Horizon::Minute),
                current_count: Some(1),
                limit: Some(50),
                percent_used: Some(2.0),
                request_id: Some(format!("req-{offset}")),
                was_queued: false,
                queue_time_ms: None,
                pattern_tag: None,
            })
            .await
            .unwrap();
    }

    let allowed = store
        .events("0xabc", Some(EventKind::Allowed), None, 10)
        .await
        .unwrap();
    assert_eq!(allowed.len(), 2);

    let recent = store
        .events("0xabc", None, Some(base + TimeDelta::seconds(5)), 10)
        .await
        .unwrap();
    assert_eq!(recent.len(), 2);

    let times = store.allowed_event_times("0xabc", base).await.unwrap();
    assert_eq!(times, vec![base, base + TimeDelta::seconds(20)]);
}

#[sqlx::test]
async fn pattern_upsert_preserves_first_detected(pool: SqlitePool) {
    let store = Store::with_pool(pool);
    let first_seen = now_ms();
    let later = first_seen + TimeDelta::days(1);

    let mut pattern = UsagePattern {
        id: "0xabc:time_of_day".to_string(),
        tenant: "0xabc".to_string(),
        kind: crate::types::PatternKind::TimeOfDay,
        window_label: "morning".to_string(),
        avg_rpm: 1.5,
        peak_rpm: 4.0,
        confidence: 0.7,
        suggested_limit: Some(5),
        suggested_queue_size: None,
        observations: 120,
        first_detected: first_seen,
        last_observed: first_seen,
    };
    store.upsert_pattern(&pattern).await.unwrap();

    pattern.window_label = "afternoon".to_string();
    pattern.confidence = 0.8;
    pattern.first_detected = later;
    pattern.last_observed = later;
    store.upsert_pattern(&pattern).await.unwrap();

    let stored = store.patterns("0xabc", 10).await.unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].window_label, "afternoon");
    assert_eq!(stored[0].confidence, 0.8);
    assert_eq!(stored[0].first_detected, first_seen);
    assert_eq!(stored[0].last_observed, later);
}

#[sqlx::test]
async fn retention_prunes_old_rows(pool: SqlitePool) {
    let store = Store::with_pool(pool);
    let now = now_ms();
    let old = now - TimeDelta::days(40);

    store
        .record_event(&NewEvent {
            tenant: "0xabc".to_string(),
            provider: "anthropic".to_string(),
            model: "m".to_string(),
            at: old,
            kind: EventKind::Allowed,
            horizon: None,
            current_count: None,
            limit: None,
            percent_used: None,
            request_id: None,
            was_queued: false,
            queue_time_ms: None,
            pattern_tag: None,
        })
        .await
        .unwrap();

    let entry = pending_entry("0xabc", 5, old);
    store.enqueue(&entry).await.unwrap();
    store.claim_next(Some("0xabc")).await.unwrap().unwrap();
    store.complete_queued(entry.id, true, None, old).await.unwrap();

    let key = key("0xabc", Horizon::Minute);
    let window = store.create_window(&key, old, None, None).await.unwrap();
    store.deactivate_window(window.id).await.unwrap();

    let cutoff = now - TimeDelta::days(30);
    assert_eq!(store.prune_events_before(cutoff).await.unwrap(), 1);
    assert_eq!(store.prune_terminal_queue_before(cutoff).await.unwrap(), 1);
    assert_eq!(store.prune_inactive_windows_before(cutoff).await.unwrap(), 1);
}
