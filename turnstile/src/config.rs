//! Governor configuration.
//!
//! Defaults are layered under an optional YAML file and `TURNSTILE_`-prefixed
//! environment variables, so an embedding host can tune the governor without
//! code changes. Nested fields use `__` in the environment, e.g.
//! `TURNSTILE_QUEUE__MAX_AGE_SECS=900`.

use std::path::Path;

use figment::{
    providers::{Env, Format, Serialized, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::Result;

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct GovernorConfig {
    /// SQLite connection string for the durable store.
    pub database_url: String,
    pub queue: QueueConfig,
    pub patterns: PatternConfig,
    pub retention: RetentionConfig,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://turnstile.db".to_string(),
            queue: QueueConfig::default(),
            patterns: PatternConfig::default(),
            retention: RetentionConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Entries older than this on a dequeue attempt fail as expired.
    pub max_age_secs: i64,
    /// Upper bound on entries drained per post-call.
    pub drain_limit: usize,
    /// Default retry budget for new entries.
    pub default_max_retries: i64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_age_secs: 1_800,
            drain_limit: 5,
            default_max_retries: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
#[serde(default)]
pub struct PatternConfig {
    /// How far back analysis looks for allowed events.
    pub lookback_days: i64,
    /// Below this many events, analysis reports insufficient data.
    pub min_events: usize,
    /// Patterns below this confidence are discarded, not persisted.
    pub confidence_threshold: f64,
}

impl Default for PatternConfig {
    fn default() -> Self {
        Self {
            lookback_days: 7,
            min_events: 10,
            confidence_threshold: 0.6,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
#[serde(default)]
pub struct RetentionConfig {
    pub events_days: i64,
    /// Queue entries in a terminal status are pruned after this many days.
    pub terminal_queue_days: i64,
    pub inactive_windows_days: i64,
    /// Patterns below this confidence are pruned once old enough.
    pub pattern_min_confidence: f64,
    pub low_confidence_pattern_days: i64,
    /// Interval for the optional background sweeper.
    pub sweep_interval_secs: u64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            events_days: 30,
            terminal_queue_days: 7,
            inactive_windows_days: 7,
            pattern_min_confidence: 0.3,
            low_confidence_pattern_days: 30,
            sweep_interval_secs: 3_600,
        }
    }
}

impl GovernorConfig {
    /// Load configuration: defaults, then the YAML file (if given), then
    /// environment variables.
    pub fn load(config_file: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(GovernorConfig::default()));
        if let Some(path) = config_file {
            figment = figment.merge(Yaml::file(path));
        }
        let config: GovernorConfig = figment
            .merge(Env::prefixed("TURNSTILE_").split("__"))
            .extract()
            .map_err(anyhow::Error::from)?;
        Ok(config)
    }
}
