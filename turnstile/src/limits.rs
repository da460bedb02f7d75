//! Limit ceilings and their resolution.
//!
//! Precedence when resolving the ceilings for an admission check:
//! exact (provider, model, tier) row → (provider, wildcard, tier) row →
//! built-in default table keyed on provider + tier.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{Horizon, Tier};

/// The five optional ceilings of one limit configuration. An absent ceiling
/// is simply not enforced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LimitSet {
    pub requests_per_minute: Option<i64>,
    pub requests_per_hour: Option<i64>,
    pub requests_per_day: Option<i64>,
    pub tokens_per_minute: Option<i64>,
    pub tokens_per_day: Option<i64>,
}

impl LimitSet {
    /// The request ceiling enforced on the given horizon, if any.
    pub fn request_limit(&self, horizon: Horizon) -> Option<i64> {
        match horizon {
            Horizon::Minute => self.requests_per_minute,
            Horizon::Hour => self.requests_per_hour,
            Horizon::Day => self.requests_per_day,
        }
    }

    /// The token ceiling enforced on the given horizon, if any. Tokens are
    /// only capped per minute and per day.
    pub fn token_limit(&self, horizon: Horizon) -> Option<i64> {
        match horizon {
            Horizon::Minute => self.tokens_per_minute,
            Horizon::Hour => None,
            Horizon::Day => self.tokens_per_day,
        }
    }
}

/// One stored limit configuration row. `model: None` is the provider-wide
/// fallback; uniqueness key is (provider, model, tier).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitConfig {
    pub provider: String,
    pub model: Option<String>,
    pub tier: Tier,
    pub limits: LimitSet,
    pub updated_at: DateTime<Utc>,
}

/// Built-in defaults applied when no configuration row matches.
///
/// Unknown providers fall back to a shared conservative allowance on the
/// free tier and run uncapped on pro, where operators are expected to
/// configure explicit rows.
pub fn default_limits(provider: &str, tier: Tier) -> LimitSet {
    match (provider, tier) {
        ("anthropic", Tier::Free) => LimitSet {
            requests_per_minute: Some(50),
            requests_per_hour: None,
            requests_per_day: Some(1_000),
            tokens_per_minute: Some(40_000),
            tokens_per_day: Some(300_000),
        },
        ("anthropic", Tier::Pro) => LimitSet {
            requests_per_minute: Some(1_000),
            requests_per_hour: None,
            requests_per_day: Some(10_000),
            tokens_per_minute: Some(80_000),
            tokens_per_day: Some(2_500_000),
        },
        ("openai", Tier::Free) => LimitSet {
            requests_per_minute: Some(60),
            requests_per_hour: None,
            requests_per_day: Some(200),
            tokens_per_minute: Some(40_000),
            tokens_per_day: None,
        },
        ("openai", Tier::Pro) => LimitSet {
            requests_per_minute: Some(500),
            requests_per_hour: None,
            requests_per_day: Some(10_000),
            tokens_per_minute: Some(150_000),
            tokens_per_day: None,
        },
        ("google", Tier::Free) => LimitSet {
            requests_per_minute: Some(60),
            requests_per_hour: None,
            requests_per_day: Some(1_500),
            tokens_per_minute: None,
            tokens_per_day: None,
        },
        ("google", Tier::Pro) => LimitSet {
            requests_per_minute: Some(1_000),
            requests_per_hour: None,
            requests_per_day: Some(15_000),
            tokens_per_minute: None,
            tokens_per_day: None,
        },
        (_, Tier::Free) => LimitSet {
            requests_per_minute: Some(100),
            ..LimitSet::default()
        },
        (_, Tier::Pro) => LimitSet::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("anthropic", Tier::Free, Some(50), Some(40_000))]
    #[case("anthropic", Tier::Pro, Some(1_000), Some(80_000))]
    #[case("openai", Tier::Free, Some(60), Some(40_000))]
    #[case("openai", Tier::Pro, Some(500), Some(150_000))]
    #[case("google", Tier::Free, Some(60), None)]
    #[case("google", Tier::Pro, Some(1_000), None)]
    fn default_table_minute_ceilings(
        #[case] provider: &str,
        #[case] tier: Tier,
        #[case] rpm: Option<i64>,
        #[case] tpm: Option<i64>,
    ) {
        let limits = default_limits(provider, tier);
        assert_eq!(limits.request_limit(Horizon::Minute), rpm);
        assert_eq!(limits.token_limit(Horizon::Minute), tpm);
    }

    #[test]
    fn unknown_provider_gets_shared_free_allowance() {
        let free = default_limits("mistral", Tier::Free);
        assert_eq!(free.requests_per_minute, Some(100));
        assert_eq!(free.requests_per_day, None);

        let pro = default_limits("mistral", Tier::Pro);
        assert_eq!(pro, LimitSet::default());
    }

    #[test]
    fn tokens_are_never_capped_hourly() {
        let limits = default_limits("anthropic", Tier::Pro);
        assert_eq!(limits.token_limit(Horizon::Hour), None);
        assert_eq!(limits.token_limit(Horizon::Day), Some(2_500_000));
    }
}
