//! Sliding-window accounting and the would-exceed predicate.
//!
//! Windows are request-anchored: a window starts at the instant of the first
//! admission that needs it, not at a wall-clock boundary, which avoids the
//! fixed-window burst artefact at boundary resets. A stale window is always
//! deactivated and replaced before any decision or increment is made
//! against it.

use tracing::debug;

use crate::clock::Clock;
use crate::error::Result;
use crate::limits::{default_limits, LimitSet};
use crate::store::Store;
use crate::types::{Horizon, Tier, Window, WindowKey};

/// Outcome of a would-exceed check against one horizon.
///
/// `current` and `limit` describe the ceiling that tripped (requests or
/// tokens); on an admit they describe request usage.
#[derive(Debug, Clone)]
pub struct ExceedCheck {
    pub horizon: Horizon,
    pub exceeded: bool,
    pub current: i64,
    pub limit: Option<i64>,
    pub percent_used: f64,
    /// The active window the check ran against; increments in the same
    /// critical section go through this id so the decision and the
    /// reservation hit the same bucket.
    pub window_id: i64,
}

#[derive(Clone)]
pub struct WindowTracker {
    store: Store,
    clock: Clock,
}

impl WindowTracker {
    pub fn new(store: Store, clock: Clock) -> Self {
        Self { store, clock }
    }

    /// Resolve the ceilings for a key: configured row if present, built-in
    /// defaults otherwise.
    async fn resolve_limits(&self, provider: &str, model: &str, tier: Tier) -> Result<LimitSet> {
        match self.store.limit_config(provider, Some(model), tier).await? {
            Some(config) => Ok(config.limits),
            None => Ok(default_limits(provider, tier)),
        }
    }

    /// The current window for a key, creating one on first use and rotating
    /// a stale one. The returned window always satisfies `ends_at > now`.
    pub async fn current_window(&self, key: &WindowKey, tier: Tier) -> Result<Window> {
        let now = self.clock.now();
        if let Some(window) = self.store.active_window(key).await? {
            if !window.is_stale(now) {
                return Ok(window);
            }
            self.store.deactivate_window(window.id).await?;
            debug!(
                tenant = %key.tenant,
                provider = %key.provider,
                horizon = %key.horizon,
                "rotated stale window"
            );
        }
        let limits = self.resolve_limits(&key.provider, &key.model, tier).await?;
        self.store
            .create_window(
                key,
                now,
                limits.request_limit(key.horizon),
                limits.token_limit(key.horizon),
            )
            .await
    }

    /// Would admitting one more request on this horizon breach a ceiling?
    ///
    /// The token comparison is a soft pre-check against counts already
    /// recorded; when the caller knows the request's estimated size it is
    /// also checked forward against the token ceiling.
    pub async fn would_exceed(
        &self,
        key: &WindowKey,
        tier: Tier,
        estimated_tokens: Option<i64>,
    ) -> Result<ExceedCheck> {
        let window = self.current_window(key, tier).await?;

        if let Some(limit) = window.request_limit {
            if window.request_count >= limit {
                return Ok(ExceedCheck {
                    horizon: key.horizon,
                    exceeded: true,
                    current: window.request_count,
                    limit: Some(limit),
                    percent_used: percent(window.request_count, limit),
                    window_id: window.id,
                });
            }
        }
        if let Some(limit) = window.token_limit {
            let projected = window.token_count + estimated_tokens.unwrap_or(0);
            if window.token_count >= limit || projected > limit {
                return Ok(ExceedCheck {
                    horizon: key.horizon,
                    exceeded: true,
                    current: window.token_count,
                    limit: Some(limit),
                    percent_used: percent(window.token_count, limit),
                    window_id: window.id,
                });
            }
        }

        Ok(ExceedCheck {
            horizon: key.horizon,
            exceeded: false,
            current: window.request_count,
            limit: window.request_limit,
            percent_used: window
                .request_limit
                .map(|limit| percent(window.request_count, limit))
                .unwrap_or(0.0),
            window_id: window.id,
        })
    }

    /// Reserve one request and `delta_tokens` tokens on the current window,
    /// creating or rotating it first as needed.
    pub async fn increment(&self, key: &WindowKey, tier: Tier, delta_tokens: i64) -> Result<()> {
        let window = self.current_window(key, tier).await?;
        self.store.increment_window(window.id, delta_tokens).await
    }

    /// Record observed token usage without counting another request.
    pub async fn add_tokens(&self, key: &WindowKey, tier: Tier, delta_tokens: i64) -> Result<()> {
        let window = self.current_window(key, tier).await?;
        self.store.add_window_tokens(window.id, delta_tokens).await
    }

    pub async fn active_windows(&self, tenant: &str) -> Result<Vec<Window>> {
        self.store.active_windows(tenant).await
    }
}

fn percent(current: i64, limit: i64) -> f64 {
    if limit > 0 {
        current as f64 / limit as f64 * 100.0
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeDelta, Utc};
    use sqlx::SqlitePool;

    fn tracker(pool: SqlitePool) -> (WindowTracker, Clock) {
        let clock = Clock::fixed(Utc::now());
        let store = Store::with_pool(pool);
        (WindowTracker::new(store, clock.clone()), clock)
    }

    fn minute_key(tenant: &str) -> WindowKey {
        WindowKey {
            tenant: tenant.to_string(),
            provider: "anthropic".to_string(),
            model: "claude-sonnet".to_string(),
            horizon: Horizon::Minute,
        }
    }

    #[sqlx::test]
    async fn first_check_creates_window_with_default_limits(pool: SqlitePool) {
        let (tracker, _clock) = tracker(pool);
        let key = minute_key("0xabc");

        let check = tracker.would_exceed(&key, Tier::Free, None).await.unwrap();
        assert!(!check.exceeded);
        assert_eq!(check.current, 0);
        assert_eq!(check.limit, Some(50));

        let window = tracker.current_window(&key, Tier::Free).await.unwrap();
        assert_eq!(window.request_limit, Some(50));
        assert_eq!(window.token_limit, Some(40_000));
    }

    #[sqlx::test]
    async fn stale_window_rotates_with_fresh_counts(pool: SqlitePool) {
        let (tracker, clock) = tracker(pool);
        let key = minute_key("0xabc");

        tracker.increment(&key, Tier::Free, 100).await.unwrap();
        let first = tracker.current_window(&key, Tier::Free).await.unwrap();
        assert_eq!(first.request_count, 1);

        clock.advance(TimeDelta::seconds(61));
        let rotated = tracker.current_window(&key, Tier::Free).await.unwrap();
        assert_ne!(rotated.id, first.id);
        assert_eq!(rotated.request_count, 0);
        assert_eq!(rotated.token_count, 0);
        assert_eq!(rotated.starts_at, clock.now());

        // The stale row is deactivated, leaving one active window per key.
        let active = tracker.active_windows("0xabc").await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, rotated.id);
    }

    #[sqlx::test]
    async fn request_ceiling_trips_at_limit(pool: SqlitePool) {
        let (tracker, _clock) = tracker(pool);
        let key = minute_key("0xabc");

        for _ in 0..50 {
            let check = tracker.would_exceed(&key, Tier::Free, None).await.unwrap();
            assert!(!check.exceeded);
            tracker.increment(&key, Tier::Free, 0).await.unwrap();
        }

        let check = tracker.would_exceed(&key, Tier::Free, None).await.unwrap();
        assert!(check.exceeded);
        assert_eq!(check.current, 50);
        assert_eq!(check.limit, Some(50));
        assert_eq!(check.percent_used, 100.0);
    }

    #[sqlx::test]
    async fn token_ceiling_trips_once_counts_reach_limit(pool: SqlitePool) {
        let (tracker, _clock) = tracker(pool);
        let key = WindowKey {
            tenant: "0xabc".to_string(),
            provider: "openai".to_string(),
            model: "gpt-4o".to_string(),
            horizon: Horizon::Minute,
        };

        tracker.increment(&key, Tier::Free, 0).await.unwrap();
        tracker.add_tokens(&key, Tier::Free, 39_999).await.unwrap();
        let check = tracker.would_exceed(&key, Tier::Free, None).await.unwrap();
        assert!(!check.exceeded);

        tracker.add_tokens(&key, Tier::Free, 1).await.unwrap();
        let check = tracker.would_exceed(&key, Tier::Free, None).await.unwrap();
        assert!(check.exceeded);
        assert_eq!(check.current, 40_000);
        assert_eq!(check.limit, Some(40_000));
    }

    #[sqlx::test]
    async fn estimated_tokens_are_checked_forward(pool: SqlitePool) {
        let (tracker, _clock) = tracker(pool);
        let key = WindowKey {
            tenant: "0xabc".to_string(),
            provider: "openai".to_string(),
            model: "gpt-4o".to_string(),
            horizon: Horizon::Minute,
        };

        tracker.increment(&key, Tier::Free, 0).await.unwrap();
        tracker.add_tokens(&key, Tier::Free, 35_000).await.unwrap();

        // Without an estimate the post-hoc check still admits.
        let check = tracker.would_exceed(&key, Tier::Free, None).await.unwrap();
        assert!(!check.exceeded);

        // A 6k estimate would land past the 40k ceiling.
        let check = tracker
            .would_exceed(&key, Tier::Free, Some(6_000))
            .await
            .unwrap();
        assert!(check.exceeded);
    }

    #[sqlx::test]
    async fn add_tokens_does_not_count_a_request(pool: SqlitePool) {
        let (tracker, _clock) = tracker(pool);
        let key = minute_key("0xabc");

        tracker.increment(&key, Tier::Free, 0).await.unwrap();
        tracker.add_tokens(&key, Tier::Free, 500).await.unwrap();

        let window = tracker.current_window(&key, Tier::Free).await.unwrap();
        assert_eq!(window.request_count, 1);
        assert_eq!(window.token_count, 500);
    }

    #[sqlx::test]
    async fn configured_limits_override_defaults(pool: SqlitePool) {
        let store = Store::with_pool(pool);
        let clock = Clock::fixed(Utc::now());
        store
            .upsert_limit_config(
                "anthropic",
                Some("claude-sonnet"),
                Tier::Free,
                &LimitSet {
                    requests_per_minute: Some(3),
                    ..Default::default()
                },
                clock.now(),
            )
            .await
            .unwrap();

        let tracker = WindowTracker::new(store, clock);
        let key = minute_key("0xabc");
        let window = tracker.current_window(&key, Tier::Free).await.unwrap();
        assert_eq!(window.request_limit, Some(3));
        assert_eq!(window.token_limit, None);
    }
}
