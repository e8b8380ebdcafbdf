use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Smoothing factor for the response time moving average.
pub const LATENCY_EMA_ALPHA: f64 = 0.1;
/// Number of most recent checks the success rate is computed over.
pub const SUCCESS_RATE_WINDOW: usize = 100;

/// Trailing window of probe history kept per provider.
pub fn history_window() -> Duration {
    Duration::hours(24)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheckResult {
    pub provider: String,
    pub healthy: bool,
    pub response_time_ms: u64,
    pub status_code: Option<u16>,
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Rolling health summary for one provider. Always rebuilt from the
/// probe history, never adjusted in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderHealthProfile {
    pub provider: String,
    pub is_healthy: bool,
    pub consecutive_failures: u32,
    pub success_rate: f64,
    pub avg_response_time_ms: f64,
    pub uptime_percent: f64,
    pub last_checked_at: DateTime<Utc>,
    pub checks_in_window: usize,
}

impl ProviderHealthProfile {
    /// Folds a chronologically ordered history into a profile. Returns `None`
    /// for an empty history.
    pub fn from_history<'a, I>(provider: &str, history: I) -> Option<Self>
    where
        I: IntoIterator<Item = &'a HealthCheckResult>,
        I::IntoIter: DoubleEndedIterator + ExactSizeIterator + Clone,
    {
        let iter = history.into_iter();
        let total = iter.len();
        let last = iter.clone().next_back()?;

        let consecutive_failures = iter.clone().rev().take_while(|r| !r.healthy).count() as u32;

        let healthy_total = iter.clone().filter(|r| r.healthy).count();
        let uptime_percent = percentage(healthy_total, total);

        let recent = total.min(SUCCESS_RATE_WINDOW);
        let healthy_recent = iter.clone().rev().take(recent).filter(|r| r.healthy).count();
        let success_rate = percentage(healthy_recent, recent);

        let mut avg: Option<f64> = None;
        for result in iter {
            let sample = result.response_time_ms as f64;
            avg = Some(match avg {
                None => sample,
                Some(prev) => prev * (1.0 - LATENCY_EMA_ALPHA) + sample * LATENCY_EMA_ALPHA,
            });
        }

        Some(Self {
            provider: provider.to_string(),
            is_healthy: last.healthy,
            consecutive_failures,
            success_rate,
            avg_response_time_ms: avg.unwrap_or_default(),
            uptime_percent,
            last_checked_at: last.timestamp,
            checks_in_window: total,
        })
    }

    /// `0.4·successRate + 0.3·(100 − avgResponseTimeMs/100) + 0.3·uptime`.
    pub fn composite_score(&self) -> f64 {
        0.4 * self.success_rate
            + 0.3 * (100.0 - self.avg_response_time_ms / 100.0)
            + 0.3 * self.uptime_percent
    }
}

fn percentage(part: usize, whole: usize) -> f64 {
    if whole == 0 {
        return 0.0;
    }
    part as f64 / whole as f64 * 100.0
}

/// Emitted whenever a probe flips `is_healthy`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthStatusChange {
    pub provider: String,
    pub was_healthy: bool,
    pub is_healthy: bool,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Recommendation {
    pub provider: String,
    /// True when neither the preferred provider nor its fallback was usable.
    pub degraded: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn result(healthy: bool, response_time_ms: u64, minute: i64) -> HealthCheckResult {
        HealthCheckResult {
            provider: "paystack".into(),
            healthy,
            response_time_ms,
            status_code: Some(if healthy { 200 } else { 503 }),
            error: None,
            timestamp: DateTime::<Utc>::UNIX_EPOCH + Duration::minutes(minute),
        }
    }

    #[test]
    fn empty_history_has_no_profile() {
        let history: Vec<HealthCheckResult> = Vec::new();
        assert!(ProviderHealthProfile::from_history("paystack", &history).is_none());
    }

    #[test]
    fn counts_trailing_failures_only() {
        let history = vec![
            result(false, 100, 0),
            result(true, 100, 5),
            result(false, 100, 10),
            result(false, 100, 15),
        ];
        let profile = ProviderHealthProfile::from_history("paystack", &history).unwrap();
        assert_eq!(profile.consecutive_failures, 2);
        assert!(!profile.is_healthy);
        assert_eq!(profile.uptime_percent, 25.0);
        assert_eq!(profile.last_checked_at, history[3].timestamp);
    }

    #[test]
    fn latency_is_exponentially_smoothed() {
        let history = vec![result(true, 1000, 0), result(true, 2000, 5)];
        let profile = ProviderHealthProfile::from_history("paystack", &history).unwrap();
        assert!((profile.avg_response_time_ms - 1100.0).abs() < 1e-9);
    }

    #[test]
    fn success_rate_uses_recent_window() {
        let mut history: Vec<_> = (0..50).map(|m| result(false, 100, m)).collect();
        history.extend((50..150).map(|m| result(true, 100, m)));
        let profile = ProviderHealthProfile::from_history("paystack", &history).unwrap();
        assert_eq!(profile.success_rate, 100.0);
        assert!((profile.uptime_percent - 100.0 * 100.0 / 150.0).abs() < 1e-9);
    }

    #[test]
    fn composite_score_weights() {
        let history = vec![result(true, 500, 0)];
        let profile = ProviderHealthProfile::from_history("paystack", &history).unwrap();
        // 0.4*100 + 0.3*(100 - 5) + 0.3*100
        assert!((profile.composite_score() - 98.5).abs() < 1e-9);
    }

    proptest! {
        #[test]
        fn consecutive_failures_match_trailing_run(outcomes in proptest::collection::vec(any::<bool>(), 1..200)) {
            let history: Vec<_> = outcomes
                .iter()
                .enumerate()
                .map(|(i, healthy)| result(*healthy, 50, i as i64))
                .collect();
            let profile = ProviderHealthProfile::from_history("paystack", &history).unwrap();
            let expected = outcomes.iter().rev().take_while(|h| !**h).count() as u32;
            prop_assert_eq!(profile.consecutive_failures, expected);
        }
    }
}
