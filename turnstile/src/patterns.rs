//! Offline statistical analysis of admit history.
//!
//! Three independent analyses (hourly, weekly, burstiness) summarise the
//! tenant's recent `allowed` events into persisted patterns with confidence
//! scores and advisory recommendations. Everything here is read-mostly and
//! advisory: no window or queue state is ever mutated, and no limit changes
//! happen without an explicit configuration update by an operator.

use chrono::{DateTime, Datelike, TimeDelta, Timelike, Utc};

use crate::clock::Clock;
use crate::config::PatternConfig;
use crate::error::Result;
use crate::store::Store;
use crate::types::{PatternKind, UsagePattern};

/// One detected pattern plus its natural-language description.
#[derive(Debug, Clone)]
pub struct DetectedPattern {
    pub pattern: UsagePattern,
    pub description: String,
}

/// Result of one analysis run.
#[derive(Debug, Clone)]
pub struct Analysis {
    pub patterns: Vec<DetectedPattern>,
    /// Mean confidence of retained patterns, with a small multi-pattern
    /// bonus, capped at 1.0.
    pub overall_confidence: f64,
    pub analyzed_events: usize,
    /// True when fewer events than the minimum were available.
    pub insufficient_data: bool,
}

/// Stored-pattern lookup plus advisory recommendations for the near future.
#[derive(Debug, Clone)]
pub struct Prediction {
    /// The stored pattern of highest confidence, if any.
    pub pattern: Option<UsagePattern>,
    pub recommendations: Vec<String>,
}

#[derive(Clone)]
pub struct PatternDetector {
    store: Store,
    clock: Clock,
    config: PatternConfig,
}

impl PatternDetector {
    pub fn new(store: Store, clock: Clock, config: PatternConfig) -> Self {
        Self { store, clock, config }
    }

    /// Analyse the lookback horizon of allowed events and persist every
    /// pattern that clears the confidence threshold.
    pub async fn analyze(&self, tenant: &str) -> Result<Analysis> {
        let now = self.clock.now();
        let since = now - TimeDelta::days(self.config.lookback_days);
        let times = self.store.allowed_event_times(tenant, since).await?;

        if times.len() < self.config.min_events {
            return Ok(Analysis {
                patterns: Vec::new(),
                overall_confidence: 0.0,
                analyzed_events: times.len(),
                insufficient_data: true,
            });
        }

        let mut detected = Vec::new();
        for candidate in [
            hourly_pattern(tenant, &times, now),
            weekly_pattern(tenant, &times, now),
            burst_pattern(tenant, &times, now),
        ]
        .into_iter()
        .flatten()
        {
            if candidate.pattern.confidence >= self.config.confidence_threshold {
                detected.push(candidate);
            }
        }

        for found in &detected {
            self.store.upsert_pattern(&found.pattern).await?;
        }

        Ok(Analysis {
            overall_confidence: overall_confidence(&detected),
            analyzed_events: times.len(),
            insufficient_data: false,
            patterns: detected,
        })
    }

    /// Return the best stored pattern and a narrow set of advisory
    /// recommendations for the current instant.
    pub async fn predict(&self, tenant: &str) -> Result<Prediction> {
        let stored = self.store.patterns(tenant, 10).await?;
        let now = self.clock.now();
        let mut recommendations = Vec::new();

        for pattern in &stored {
            match pattern.kind {
                PatternKind::TimeOfDay => {
                    let current = coarse_window(now.hour());
                    if pattern.window_label.contains(current) {
                        recommendations.push(format!(
                            "currently in peak window ({})",
                            pattern.window_label
                        ));
                        if let Some(limit) = pattern.suggested_limit {
                            recommendations
                                .push(format!("consider a per-minute limit of {limit}"));
                        }
                    }
                }
                PatternKind::DayOfWeek => {
                    let weekday = now.weekday().num_days_from_monday() < 5;
                    if (pattern.window_label == "weekday-heavy" && weekday)
                        || (pattern.window_label == "weekend-heavy" && !weekday)
                    {
                        recommendations.push(format!(
                            "today falls in the {} usage band",
                            pattern.window_label
                        ));
                    }
                }
                PatternKind::Burst => {
                    if pattern.window_label == "bursty" {
                        if let Some(size) = pattern.suggested_queue_size {
                            recommendations
                                .push(format!("bursty traffic: consider queue size {size}"));
                        }
                    }
                }
            }
        }

        Ok(Prediction {
            pattern: stored.into_iter().next(),
            recommendations,
        })
    }
}

fn overall_confidence(detected: &[DetectedPattern]) -> f64 {
    if detected.is_empty() {
        return 0.0;
    }
    let mean = detected.iter().map(|d| d.pattern.confidence).sum::<f64>() / detected.len() as f64;
    let bonus = if detected.len() >= 2 { 0.1 } else { 0.0 };
    (mean + bonus).min(1.0)
}

fn mean_and_variance(counts: &[f64]) -> (f64, f64) {
    let n = counts.len() as f64;
    let mean = counts.iter().sum::<f64>() / n;
    let variance = counts.iter().map(|c| (c - mean).powi(2)).sum::<f64>() / n;
    (mean, variance)
}

/// Coarse daypart for an hour of day.
fn coarse_window(hour: u32) -> &'static str {
    match hour {
        6..=11 => "morning",
        12..=17 => "afternoon",
        18..=23 => "evening",
        _ => "night",
    }
}

fn hourly_pattern(
    tenant: &str,
    times: &[DateTime<Utc>],
    now: DateTime<Utc>,
) -> Option<DetectedPattern> {
    let mut counts = [0f64; 24];
    for t in times {
        counts[t.hour() as usize] += 1.0;
    }
    let (mean, variance) = mean_and_variance(&counts);
    let peak_hours: Vec<usize> = (0..24).filter(|&h| counts[h] > 1.5 * mean).collect();

    let confidence = if peak_hours.is_empty() {
        0.3
    } else {
        (variance / mean * 0.5 + 0.3).min(1.0)
    };

    let mut dayparts: Vec<&str> = Vec::new();
    for &h in &peak_hours {
        let part = coarse_window(h as u32);
        if !dayparts.contains(&part) {
            dayparts.push(part);
        }
    }
    let label = if dayparts.is_empty() {
        "uniform".to_string()
    } else {
        dayparts.join("+")
    };

    let max_count = counts.iter().cloned().fold(0f64, f64::max);
    let peak_rpm = (max_count / 60.0).ceil();
    let suggested_limit = (peak_rpm * 1.2).ceil() as i64;

    let description = if peak_hours.is_empty() {
        "usage is spread evenly across the day".to_string()
    } else {
        format!(
            "peak usage during the {label} (hours {peak_hours:?}), around {peak_rpm:.0} requests per minute at the top"
        )
    };

    Some(DetectedPattern {
        pattern: UsagePattern {
            id: format!("{tenant}:{}", PatternKind::TimeOfDay.as_str()),
            tenant: tenant.to_string(),
            kind: PatternKind::TimeOfDay,
            window_label: label,
            avg_rpm: mean / 60.0,
            peak_rpm,
            confidence,
            suggested_limit: Some(suggested_limit),
            suggested_queue_size: None,
            observations: times.len() as i64,
            first_detected: now,
            last_observed: now,
        },
        description,
    })
}

fn weekly_pattern(
    tenant: &str,
    times: &[DateTime<Utc>],
    now: DateTime<Utc>,
) -> Option<DetectedPattern> {
    let mut counts = [0f64; 7];
    for t in times {
        counts[t.weekday().num_days_from_monday() as usize] += 1.0;
    }
    let (mean, variance) = mean_and_variance(&counts);

    let weekday_sum: f64 = counts[..5].iter().sum();
    let weekend_sum: f64 = counts[5..].iter().sum();
    let label = if weekday_sum > 1.5 * weekend_sum {
        "weekday-heavy"
    } else if weekend_sum > 1.5 * weekday_sum {
        "weekend-heavy"
    } else {
        "balanced"
    };

    let confidence = (variance / mean * 0.4 + 0.4).min(1.0);
    let max_count = counts.iter().cloned().fold(0f64, f64::max);
    let peak_rpm = max_count / (24.0 * 60.0);

    Some(DetectedPattern {
        pattern: UsagePattern {
            id: format!("{tenant}:{}", PatternKind::DayOfWeek.as_str()),
            tenant: tenant.to_string(),
            kind: PatternKind::DayOfWeek,
            window_label: label.to_string(),
            avg_rpm: mean / (24.0 * 60.0),
            peak_rpm,
            confidence,
            suggested_limit: None,
            suggested_queue_size: None,
            observations: times.len() as i64,
            first_detected: now,
            last_observed: now,
        },
        description: format!("usage over the week is {label}"),
    })
}

fn burst_pattern(
    tenant: &str,
    times: &[DateTime<Utc>],
    now: DateTime<Utc>,
) -> Option<DetectedPattern> {
    if times.len() < 2 {
        return None;
    }
    let deltas: Vec<f64> = times
        .windows(2)
        .map(|pair| (pair[1] - pair[0]).num_milliseconds() as f64 / 1_000.0)
        .collect();
    let (mean, variance) = mean_and_variance(&deltas);
    let cv = if mean > 0.0 {
        variance.sqrt() / mean
    } else {
        f64::INFINITY
    };

    let label = if cv > 1.0 {
        "bursty"
    } else if cv < 0.5 {
        "steady"
    } else {
        "mixed"
    };
    let suggested_queue_size = if cv > 2.0 {
        100
    } else if cv > 1.5 {
        50
    } else if cv > 1.0 {
        25
    } else {
        10
    };
    let confidence = ((cv - 1.0).abs() * 0.5 + 0.4).min(1.0);

    let avg_rpm = if mean > 0.0 { 60.0 / mean } else { 0.0 };
    let min_delta = deltas.iter().cloned().filter(|d| *d > 0.0).fold(f64::INFINITY, f64::min);
    let peak_rpm = if min_delta.is_finite() { 60.0 / min_delta } else { avg_rpm };

    Some(DetectedPattern {
        pattern: UsagePattern {
            id: format!("{tenant}:{}", PatternKind::Burst.as_str()),
            tenant: tenant.to_string(),
            kind: PatternKind::Burst,
            window_label: label.to_string(),
            avg_rpm,
            peak_rpm,
            confidence,
            suggested_limit: None,
            suggested_queue_size: Some(suggested_queue_size),
            observations: times.len() as i64,
            first_detected: now,
            last_observed: now,
        },
        description: format!(
            "inter-arrival coefficient of variation {cv:.2}: traffic looks {label}"
        ),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(day: u32, hour: u32, minute: u32, second: u32) -> DateTime<Utc> {
        // June 2026: the 1st is a Monday.
        Utc.with_ymd_and_hms(2026, 6, day, hour, minute, second).unwrap()
    }

    #[test]
    fn hourly_pattern_finds_morning_peak() {
        let mut times = Vec::new();
        for day in 1..=5 {
            for hour in 9..=11 {
                for i in 0..13 {
                    times.push(at(day, hour, i, 0));
                }
            }
        }
        times.sort();

        let found = hourly_pattern("0xabc", &times, Utc::now()).unwrap();
        assert_eq!(found.pattern.kind, PatternKind::TimeOfDay);
        assert_eq!(found.pattern.window_label, "morning");
        assert!(found.pattern.confidence >= 0.6);
        assert!(found.pattern.suggested_limit.unwrap() >= 1);
    }

    #[test]
    fn weekly_pattern_detects_weekday_heavy_usage() {
        let mut times = Vec::new();
        for day in 1..=5 {
            for i in 0..40 {
                times.push(at(day, 10, i % 60, 0));
            }
        }
        times.sort();

        let found = weekly_pattern("0xabc", &times, Utc::now()).unwrap();
        assert_eq!(found.pattern.window_label, "weekday-heavy");
        assert!(found.pattern.confidence >= 0.6);
    }

    #[test_log::test]
    fn burst_classification_by_cv() {
        // Steady: identical 60 s gaps.
        let steady: Vec<_> = (0..30).map(|i| at(1, 8, i, 0)).collect();
        let found = burst_pattern("0xabc", &steady, Utc::now()).unwrap();
        assert_eq!(found.pattern.window_label, "steady");
        assert_eq!(found.pattern.suggested_queue_size, Some(10));

        // Bursty: tight clusters separated by long gaps.
        let mut bursty = Vec::new();
        for cluster in 0..6 {
            for i in 0..5 {
                bursty.push(at(1, 2 * cluster, 0, i));
            }
        }
        bursty.sort();
        let found = burst_pattern("0xabc", &bursty, Utc::now()).unwrap();
        assert_eq!(found.pattern.window_label, "bursty");
        assert!(found.pattern.suggested_queue_size.unwrap() >= 25);
        assert!(found.pattern.confidence >= 0.6);
    }

    #[test]
    fn overall_confidence_gets_multi_pattern_bonus() {
        let times: Vec<_> = (0..30).map(|i| at(1, 8, i, 0)).collect();
        let single = vec![burst_pattern("0xabc", &times, Utc::now()).unwrap()];
        let base = overall_confidence(&single);

        let both = vec![
            burst_pattern("0xabc", &times, Utc::now()).unwrap(),
            burst_pattern("0xabc", &times, Utc::now()).unwrap(),
        ];
        assert!((overall_confidence(&both) - (base + 0.1).min(1.0)).abs() < 1e-9);
    }

    #[test]
    fn coarse_windows_cover_the_day() {
        assert_eq!(coarse_window(3), "night");
        assert_eq!(coarse_window(6), "morning");
        assert_eq!(coarse_window(12), "afternoon");
        assert_eq!(coarse_window(19), "evening");
        assert_eq!(coarse_window(23), "evening");
    }
}
