//! End-to-end scenario tests driving the full governor through the three
//! pipeline hooks, with a fixed clock and a fresh database per test.


use chrono::{DateTime, TimeDelta, TimeZone, Utc};
use serde_json::Value;
use sqlx::SqlitePool;

use crate::types::{Horizon, Tier, WindowKey};
use crate::window::WindowTracker;
use crate::{Clock, GovernorConfig, Manager, Store};

/// Monday 2026-06-08, noon UTC.
fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 6, 8, 12, 0, 0).unwrap()
}

fn governor(pool: SqlitePool) -> (Manager, Clock) {
    let clock = Clock::fixed(base_time());
    let manager = Manager::from_parts(Store::with_pool(pool), clock.clone(), GovernorConfig::default());
    (manager, clock)
}

async fn make_pro(manager: &Manager, wallet: &str, clock: &Clock) {
    manager
        .set_tenant_tier(wallet, Tier::Pro, Some(clock.now() + TimeDelta::days(30)), 0)
        .await
        .unwrap();
}

/// Admit one request and return the payload carrying the decision record.
async fn admit(
    manager: &Manager,
    request_id: &str,
    provider: &str,
    model: &str,
    wallet: &str,
    session: &str,
) -> Value {
    let mut request = serde_json::json!({"prompt": "hello"});
    manager
        .pre_call(request_id, provider, model, wallet, session, &mut request)
        .await
        .unwrap();
    request
}

/// Push the minute window for a key to its request ceiling via synthetic
/// increments, so the next admission refuses.
async fn fill_minute_window(
    manager: &Manager,
    clock: &Clock,
    wallet: &str,
    provider: &str,
    model: &str,
    tier: Tier,
) {
    let tracker = WindowTracker::new(manager.store().clone(), clock.clone());
    let key = WindowKey {
        tenant: wallet.to_string(),
        provider: provider.to_string(),
        model: model.to_string(),
        horizon: Horizon::Minute,
    };
    let window = tracker.current_window(&key, tier).await.unwrap();
    let limit = window.request_limit.expect("minute request ceiling");
    for _ in window.request_count..limit {
        manager.store().increment_window(window.id, 0).await.unwrap();
    }
}
