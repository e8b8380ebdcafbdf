use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::app::error::RouterError;
use crate::ledger::AttemptLedger;
use crate::models::{AttemptStatus, PaymentAttempt, RecoveryAction};
use crate::services::atomic_metrics::{RetryMetrics, RetryMetricsSnapshot};
use crate::services::recovery_engine::RecoveryEngine;
use crate::utils::Clock;

pub const CRITICAL_SUCCESS_RATE: f64 = 50.0;
pub const DEGRADED_SUCCESS_RATE: f64 = 70.0;
pub const MAX_QUEUE_BACKLOG: usize = 100;
pub const MAX_AVG_RETRY_TIME_MS: f64 = 30_000.0;

const HEALTH_WINDOW: Duration = Duration::from_secs(60 * 60);
/// Failed transactions older than this no longer count as backlog.
const BACKLOG_WINDOW: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderAttemptStats {
    pub attempts: u64,
    pub successes: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryStatistics {
    pub range_secs: u64,
    pub total_transactions: u64,
    pub total_attempts: u64,
    pub successful_transactions: u64,
    pub success_rate: f64,
    pub average_attempts: f64,
    pub average_retry_time_ms: f64,
    /// Transactions that failed at least once before succeeding.
    pub recovered_after_retry: u64,
    pub providers: BTreeMap<String, ProviderAttemptStats>,
    pub error_codes: BTreeMap<String, u64>,
}

impl RetryStatistics {
    /// Folds attempt records into per-transaction aggregates.
    pub fn from_attempts(attempts: &[PaymentAttempt], range: Duration) -> Self {
        let mut stats = RetryStatistics {
            range_secs: range.as_secs(),
            total_attempts: attempts.len() as u64,
            ..Default::default()
        };

        let mut by_transaction: BTreeMap<&str, Vec<&PaymentAttempt>> = BTreeMap::new();
        for attempt in attempts {
            by_transaction
                .entry(attempt.transaction_id.as_str())
                .or_default()
                .push(attempt);

            let provider = stats.providers.entry(attempt.provider.clone()).or_default();
            provider.attempts += 1;
            if attempt.status == AttemptStatus::Success {
                provider.successes += 1;
            }
            if let Some(code) = &attempt.error_code {
                *stats.error_codes.entry(code.clone()).or_default() += 1;
            }
        }

        let mut retry_time_total_ms = 0.0;
        for group in by_transaction.values() {
            let succeeded = group.iter().any(|a| a.status == AttemptStatus::Success);
            if succeeded {
                stats.successful_transactions += 1;
                if group.len() > 1 {
                    stats.recovered_after_retry += 1;
                }
            }

            let first_start = group.iter().map(|a| a.created_at).min();
            let last_finish = group.iter().filter_map(|a| a.completed_at).max();
            if let (Some(start), Some(finish)) = (first_start, last_finish) {
                retry_time_total_ms += (finish - start).num_milliseconds().max(0) as f64;
            }
        }

        stats.total_transactions = by_transaction.len() as u64;
        if stats.total_transactions > 0 {
            let total = stats.total_transactions as f64;
            stats.success_rate = stats.successful_transactions as f64 / total * 100.0;
            stats.average_attempts = stats.total_attempts as f64 / total;
            stats.average_retry_time_ms = retry_time_total_ms / total;
        }
        stats
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SystemStatus {
    Healthy,
    Degraded,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StrategySummary {
    pub name: String,
    pub priority: i32,
    pub action: RecoveryAction,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetrySystemHealth {
    pub status: SystemStatus,
    pub success_rate: f64,
    pub average_retry_time_ms: f64,
    pub queue_backlog: usize,
    pub active_retry_loops: u64,
    pub strategies: Vec<StrategySummary>,
    pub issues: Vec<String>,
    pub metrics: RetryMetricsSnapshot,
}

/// Grades one hour of traffic. No traffic is healthy.
pub fn grade(stats: &RetryStatistics, queue_backlog: usize) -> (SystemStatus, Vec<String>) {
    let mut status = SystemStatus::Healthy;
    let mut issues = Vec::new();

    if stats.total_transactions > 0 {
        if stats.success_rate < CRITICAL_SUCCESS_RATE {
            status = SystemStatus::Critical;
            issues.push(format!("success rate {:.1}% below {}%", stats.success_rate, CRITICAL_SUCCESS_RATE));
        } else if stats.success_rate < DEGRADED_SUCCESS_RATE {
            status = SystemStatus::Degraded;
            issues.push(format!("success rate {:.1}% below {}%", stats.success_rate, DEGRADED_SUCCESS_RATE));
        }
        if stats.average_retry_time_ms > MAX_AVG_RETRY_TIME_MS {
            status = status.max_with(SystemStatus::Degraded);
            issues.push(format!("average retry time {:.0}ms", stats.average_retry_time_ms));
        }
    }
    if queue_backlog > MAX_QUEUE_BACKLOG {
        status = status.max_with(SystemStatus::Degraded);
        issues.push(format!("{} failed transactions awaiting recovery", queue_backlog));
    }
    (status, issues)
}

impl SystemStatus {
    fn rank(self) -> u8 {
        match self {
            SystemStatus::Healthy => 0,
            SystemStatus::Degraded => 1,
            SystemStatus::Critical => 2,
        }
    }

    fn max_with(self, other: SystemStatus) -> SystemStatus {
        if other.rank() > self.rank() {
            other
        } else {
            self
        }
    }
}

pub struct RetryAnalytics {
    ledger: Arc<dyn AttemptLedger>,
    engine: Arc<RecoveryEngine>,
    metrics: Arc<RetryMetrics>,
    clock: Arc<dyn Clock>,
    retry_ceiling: u32,
}

impl RetryAnalytics {
    pub fn new(
        ledger: Arc<dyn AttemptLedger>,
        engine: Arc<RecoveryEngine>,
        metrics: Arc<RetryMetrics>,
        clock: Arc<dyn Clock>,
        retry_ceiling: u32,
    ) -> Self {
        Self {
            ledger,
            engine,
            metrics,
            clock,
            retry_ceiling,
        }
    }

    pub async fn statistics(&self, range: Duration) -> Result<RetryStatistics, RouterError> {
        let range_chrono = chrono::Duration::from_std(range)
            .map_err(|e| RouterError::Config(format!("statistics range out of range: {}", e)))?;
        let since = self.clock.now() - range_chrono;
        let attempts = self.ledger.attempts_since(since).await?;
        debug!("Computing retry statistics over {} attempts", attempts.len());
        Ok(RetryStatistics::from_attempts(&attempts, range))
    }

    /// Failed transactions still under the retry ceiling.
    pub async fn queue_backlog(&self) -> Result<usize, RouterError> {
        let window = chrono::Duration::from_std(BACKLOG_WINDOW)
            .map_err(|e| RouterError::Config(e.to_string()))?;
        let failed = self
            .ledger
            .failed_transactions(self.clock.now() - window, usize::MAX)
            .await?;
        Ok(failed
            .iter()
            .filter(|tx| tx.retry_count < self.retry_ceiling)
            .count())
    }

    pub async fn system_health(&self) -> Result<RetrySystemHealth, RouterError> {
        let stats = self.statistics(HEALTH_WINDOW).await?;
        let queue_backlog = self.queue_backlog().await?;
        let (status, issues) = grade(&stats, queue_backlog);

        let strategies = self
            .engine
            .strategies()
            .into_iter()
            .filter(|s| s.enabled)
            .map(|s| StrategySummary {
                name: s.name,
                priority: s.priority,
                action: s.action,
            })
            .collect();

        Ok(RetrySystemHealth {
            status,
            success_rate: stats.success_rate,
            average_retry_time_ms: stats.average_retry_time_ms,
            queue_backlog,
            active_retry_loops: self.metrics.active_loops(),
            strategies,
            issues,
            metrics: self.metrics.snapshot(),
        })
    }
}
