//! Per-transaction retry loop and batch recovery of failed transactions.
//!
//! Attempts for one transaction run strictly one after another; the ledger
//! sees each attempt as `pending` before the adapter is called and as
//! `success`/`failed` afterwards. Adapter failures never escape the loop: they
//! become attempt records and a recovery decision. Only wiring mistakes
//! (unknown provider, ledger refusal) surface as [`RouterError`].

use futures::future::join_all;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::app::config::Config;
use crate::app::error::{codes, ErrorCategory, ProviderError, RouterError};
use crate::ledger::AttemptLedger;
use crate::models::{
    ManualReviewItem, PaymentAttempt, PaymentData, ProviderCharge, RecoveryContext,
    RecoveryDecision, RetryConfig, RetryOutcome, TransactionRecord, TransactionStatus,
};
use crate::services::atomic_metrics::RetryMetrics;
use crate::services::health_monitor::HealthMonitor;
use crate::services::provider_registry::{PaymentProvider, ProviderRegistry};
use crate::services::provider_selector::ProviderSelector;
use crate::services::recovery_engine::RecoveryEngine;
use crate::utils::{delay_after_attempt, Clock};

#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    pub attempt_timeout: Duration,
    /// `max_attempts` for each batch-recovery re-run.
    pub recovery_max_attempts: u32,
    /// Transactions with this many attempts are no longer recovered.
    pub recovery_retry_ceiling: u32,
}

impl CoordinatorSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            attempt_timeout: config.attempt_timeout(),
            recovery_max_attempts: config.recovery_max_attempts,
            recovery_retry_ceiling: config.recovery_retry_ceiling,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryReport {
    pub recovered: usize,
    pub still_failed: usize,
    pub skipped: usize,
}

pub struct RetryCoordinator {
    registry: Arc<ProviderRegistry>,
    monitor: Arc<HealthMonitor>,
    selector: Arc<ProviderSelector>,
    engine: Arc<RecoveryEngine>,
    ledger: Arc<dyn AttemptLedger>,
    clock: Arc<dyn Clock>,
    metrics: Arc<RetryMetrics>,
    settings: CoordinatorSettings,
    shutdown: CancellationToken,
}

enum Interrupted {
    Cancelled,
}

impl RetryCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<ProviderRegistry>,
        monitor: Arc<HealthMonitor>,
        selector: Arc<ProviderSelector>,
        engine: Arc<RecoveryEngine>,
        ledger: Arc<dyn AttemptLedger>,
        clock: Arc<dyn Clock>,
        metrics: Arc<RetryMetrics>,
        settings: CoordinatorSettings,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            registry,
            monitor,
            selector,
            engine,
            ledger,
            clock,
            metrics,
            settings,
            shutdown,
        }
    }

    /// Runs a new transaction until it succeeds, stops, or exhausts
    /// `max_attempts`. Cancelled only by process shutdown.
    pub async fn run(
        &self,
        payment: PaymentData,
        preferred_provider: Option<&str>,
        config: Option<RetryConfig>,
    ) -> Result<RetryOutcome, RouterError> {
        let cancel = self.shutdown.child_token();
        self.run_with_cancel(payment, preferred_provider, config, &cancel).await
    }

    pub async fn run_with_cancel(
        &self,
        payment: PaymentData,
        preferred_provider: Option<&str>,
        config: Option<RetryConfig>,
        cancel: &CancellationToken,
    ) -> Result<RetryOutcome, RouterError> {
        let config = config.unwrap_or_default();
        config.validate()?;

        let selection = self
            .selector
            .select(Some(&payment.currency), payment.country.as_deref(), preferred_provider)
            .await?;

        let mut transaction =
            TransactionRecord::new(payment, preferred_provider.map(String::from), self.clock.now())
                .with_retry_config(config.clone());
        self.ledger.upsert_transaction(&transaction).await?;
        info!(
            "Transaction {} ({}) starting on {} ({:?})",
            transaction.id, transaction.payment.reference, selection.provider, selection.reason
        );

        self.drive(&mut transaction, selection.provider, &config, 0, cancel)
            .await
    }

    /// The retry loop. `prior_attempts` offsets ledger numbering when an
    /// existing transaction is re-run; strategy matching and backoff use the
    /// loop-local attempt number.
    async fn drive(
        &self,
        transaction: &mut TransactionRecord,
        provider: String,
        config: &RetryConfig,
        prior_attempts: u32,
        cancel: &CancellationToken,
    ) -> Result<RetryOutcome, RouterError> {
        let _active = self.metrics.loop_started();
        let started = Instant::now();
        let mut current = provider;
        let mut attempts = Vec::new();
        let mut last_decision: Option<RecoveryDecision> = None;

        for local in 1..=config.max_attempts {
            let attempt_number = prior_attempts + local;
            let adapter = self.registry.adapter(&current)?;

            if self.settled_elsewhere(transaction).await? {
                return Ok(self.settled_outcome(transaction, attempts, current, started, last_decision));
            }
            transaction.status = TransactionStatus::Attempting;
            transaction.provider = Some(current.clone());
            self.save(transaction).await?;

            let mut attempt =
                PaymentAttempt::pending(&transaction.id, &current, attempt_number, self.clock.now());
            self.ledger.begin_attempt(attempt.clone()).await?;
            debug!(
                "Transaction {} attempt {} on {}",
                transaction.id, attempt_number, current
            );

            let attempt_started = Instant::now();
            let result = self
                .attempt_once(adapter.as_ref(), &transaction.payment, cancel)
                .await;
            let elapsed_ms = attempt_started.elapsed().as_millis() as u64;
            transaction.retry_count = attempt_number;

            let error = match result {
                Ok(charge) => {
                    attempt.succeed(elapsed_ms, self.clock.now());
                    self.ledger.complete_attempt(&attempt).await?;
                    attempts.push(attempt);

                    transaction.status = TransactionStatus::Succeeded;
                    transaction.provider_reference = Some(charge.provider_reference.clone());
                    transaction.error_code = None;
                    transaction.error_message = None;
                    self.save(transaction).await?;
                    self.metrics.increment_succeeded();
                    info!(
                        "Transaction {} succeeded on {} at attempt {}",
                        transaction.id, current, attempt_number
                    );
                    return Ok(self.outcome(transaction, Some(charge), attempts, current, started, last_decision, false));
                }
                Err(error) => error,
            };

            attempt.fail(&error, elapsed_ms, self.clock.now());
            self.ledger.complete_attempt(&attempt).await?;
            attempts.push(attempt);

            if self.settled_elsewhere(transaction).await? {
                return Ok(self.settled_outcome(transaction, attempts, current, started, last_decision));
            }
            transaction.error_code = Some(error.code.clone());
            transaction.error_message = Some(error.message.clone());

            if error.is_cancellation() {
                return self
                    .finish_cancelled(transaction, attempts, current, started, last_decision)
                    .await;
            }
            warn!(
                "Transaction {} attempt {} on {} failed: {}",
                transaction.id, attempt_number, current, error
            );

            // Fraud-class errors always reach the engine so they land in review.
            if error.category() != ErrorCategory::Fraud && !config.is_retryable_error(&error) {
                info!(
                    "Transaction {} stopped on non-retryable {}",
                    transaction.id, error.code
                );
                break;
            }

            let decision = {
                let ctx = RecoveryContext {
                    error: &error,
                    provider: &current,
                    attempt_number: local,
                    currency: Some(&transaction.payment.currency),
                    country: transaction.payment.country.as_deref(),
                };
                self.engine.decide(&ctx, config).await
            };

            if decision.manual_review {
                self.escalate(transaction, &current, &error, &decision).await?;
                return Ok(self.outcome(transaction, None, attempts, current, started, Some(decision), false));
            }
            if decision.should_stop || local == config.max_attempts {
                last_decision = Some(decision);
                break;
            }

            if let Some(next) = &decision.new_provider {
                info!(
                    "Transaction {} failing over {} -> {}",
                    transaction.id, current, next
                );
                current = next.clone();
            }
            let delay = decision
                .delay
                .unwrap_or_else(|| delay_after_attempt(config, local));
            last_decision = Some(decision);

            transaction.status = TransactionStatus::Retrying;
            self.save(transaction).await?;
            debug!("Transaction {} backing off {:?}", transaction.id, delay);

            if let Err(Interrupted::Cancelled) = self.backoff(delay, cancel).await {
                transaction.error_code = Some(codes::CANCELLED.to_string());
                transaction.error_message = Some("cancelled while backing off".into());
                return self
                    .finish_cancelled(transaction, attempts, current, started, last_decision)
                    .await;
            }
        }

        transaction.status = TransactionStatus::FailedTerminal;
        self.save(transaction).await?;
        self.metrics.increment_failed();
        warn!(
            "Transaction {} failed after {} attempt(s): {:?}",
            transaction.id,
            attempts.len(),
            transaction.error_code
        );
        Ok(self.outcome(transaction, None, attempts, current, started, last_decision, false))
    }

    /// Pre-check, then one bounded adapter call, both abandoned on `cancel`.
    /// Every failure comes back as a classified [`ProviderError`].
    async fn attempt_once(
        &self,
        adapter: &dyn PaymentProvider,
        payment: &PaymentData,
        cancel: &CancellationToken,
    ) -> Result<ProviderCharge, ProviderError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ProviderError::cancelled()),
            result = self.gated_attempt(adapter, payment) => result,
        }
    }

    async fn gated_attempt(
        &self,
        adapter: &dyn PaymentProvider,
        payment: &PaymentData,
    ) -> Result<ProviderCharge, ProviderError> {
        let provider = adapter.name();
        if !self.monitor.should_use_provider(provider).await {
            if self.has_usable_alternative(provider, payment).await {
                return Err(ProviderError::degraded(provider));
            }
            warn!(
                "{} failed its health gate but nothing else is usable, attempting anyway",
                provider
            );
        }

        let timeout = self.settings.attempt_timeout;
        match tokio::time::timeout(timeout, adapter.attempt_payment(payment)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(ProviderError::timeout(provider, timeout.as_millis() as u64)),
        }
    }

    async fn has_usable_alternative(&self, provider: &str, payment: &PaymentData) -> bool {
        for candidate in self.registry.names().filter(|name| *name != provider) {
            if self
                .registry
                .supports(candidate, Some(&payment.currency), payment.country.as_deref())
                && self.monitor.should_use_provider(candidate).await
            {
                return true;
            }
        }
        false
    }

    async fn backoff(&self, delay: Duration, cancel: &CancellationToken) -> Result<(), Interrupted> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Interrupted::Cancelled),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }

    async fn escalate(
        &self,
        transaction: &mut TransactionRecord,
        provider: &str,
        error: &ProviderError,
        decision: &RecoveryDecision,
    ) -> Result<(), RouterError> {
        transaction.status = TransactionStatus::ManualReview;
        self.save(transaction).await?;
        self.ledger
            .enqueue_manual_review(ManualReviewItem {
                transaction_id: transaction.id.clone(),
                reference: transaction.payment.reference.clone(),
                provider: provider.to_string(),
                strategy: decision.strategy.clone(),
                error_code: error.code.clone(),
                error_message: error.message.clone(),
                enqueued_at: self.clock.now(),
            })
            .await?;
        self.metrics.increment_manual_reviews();
        warn!(
            "Transaction {} queued for manual review: {}",
            transaction.id, decision.reason
        );
        Ok(())
    }

    async fn finish_cancelled(
        &self,
        transaction: &mut TransactionRecord,
        attempts: Vec<PaymentAttempt>,
        provider: String,
        started: Instant,
        last_decision: Option<RecoveryDecision>,
    ) -> Result<RetryOutcome, RouterError> {
        transaction.status = TransactionStatus::FailedTerminal;
        self.save(transaction).await?;
        self.metrics.increment_cancelled();
        self.metrics.increment_failed();
        warn!(
            "Transaction {} cancelled after {} attempt(s)",
            transaction.id,
            attempts.len()
        );
        Ok(self.outcome(transaction, None, attempts, provider, started, last_decision, true))
    }

    /// Adopts a `Succeeded` status that webhook reconciliation wrote while
    /// this loop was still running. The loop then makes no further attempts.
    async fn settled_elsewhere(&self, transaction: &mut TransactionRecord) -> Result<bool, RouterError> {
        let Some(stored) = self.ledger.transaction(&transaction.id).await? else {
            return Ok(false);
        };
        if stored.status != TransactionStatus::Succeeded {
            return Ok(false);
        }

        let retry_count = transaction.retry_count.max(stored.retry_count);
        *transaction = stored;
        transaction.retry_count = retry_count;
        self.save(transaction).await?;
        Ok(true)
    }

    fn settled_outcome(
        &self,
        transaction: &TransactionRecord,
        attempts: Vec<PaymentAttempt>,
        provider: String,
        started: Instant,
        last_decision: Option<RecoveryDecision>,
    ) -> RetryOutcome {
        self.metrics.increment_succeeded();
        info!(
            "Transaction {} confirmed by provider webhook after {} attempt(s), stopping retries",
            transaction.id,
            attempts.len()
        );
        self.outcome(transaction, None, attempts, provider, started, last_decision, false)
    }

    async fn save(&self, transaction: &mut TransactionRecord) -> Result<(), RouterError> {
        transaction.updated_at = self.clock.now();
        self.ledger.upsert_transaction(transaction).await
    }

    #[allow(clippy::too_many_arguments)]
    fn outcome(
        &self,
        transaction: &TransactionRecord,
        charge: Option<ProviderCharge>,
        attempts: Vec<PaymentAttempt>,
        final_provider: String,
        started: Instant,
        recovery: Option<RecoveryDecision>,
        cancelled: bool,
    ) -> RetryOutcome {
        RetryOutcome {
            success: transaction.status == TransactionStatus::Succeeded,
            status: transaction.status,
            transaction: transaction.clone(),
            charge,
            attempts,
            final_provider,
            total_time_ms: started.elapsed().as_millis() as u64,
            recovery,
            cancelled,
        }
    }

    /// Re-runs `FailedTerminal` transactions younger than `max_age`, oldest
    /// first, concurrently. Transactions at the retry ceiling are skipped.
    pub async fn recover_failed_payments(
        &self,
        batch_size: usize,
        max_age: Duration,
    ) -> Result<RecoveryReport, RouterError> {
        let max_age = chrono::Duration::from_std(max_age)
            .map_err(|e| RouterError::Config(format!("recovery max age out of range: {}", e)))?;
        let cutoff = self.clock.now() - max_age;
        let candidates = self.ledger.failed_transactions(cutoff, batch_size).await?;

        let mut report = RecoveryReport::default();
        let mut eligible = Vec::new();
        for transaction in candidates {
            if transaction.retry_count >= self.settings.recovery_retry_ceiling {
                debug!(
                    "Skipping {}: {} attempts already made",
                    transaction.id, transaction.retry_count
                );
                report.skipped += 1;
            } else {
                eligible.push(transaction);
            }
        }

        info!(
            "Batch recovery: {} eligible, {} at retry ceiling",
            eligible.len(),
            report.skipped
        );

        let cancel = self.shutdown.child_token();
        let runs = eligible.into_iter().map(|tx| self.recover_one(tx, &cancel));
        for result in join_all(runs).await {
            match result {
                Ok(outcome) if outcome.success => report.recovered += 1,
                Ok(_) => report.still_failed += 1,
                Err(e) => {
                    error!("Batch recovery run failed: {}", e);
                    report.still_failed += 1;
                }
            }
        }

        info!(
            "Batch recovery finished: {} recovered, {} still failed, {} skipped",
            report.recovered, report.still_failed, report.skipped
        );
        Ok(report)
    }

    async fn recover_one(
        &self,
        mut transaction: TransactionRecord,
        cancel: &CancellationToken,
    ) -> Result<RetryOutcome, RouterError> {
        let prior_attempts = self.ledger.attempts_for(&transaction.id).await?.len() as u32;
        let remaining = self
            .settings
            .recovery_retry_ceiling
            .saturating_sub(prior_attempts);
        let config = RetryConfig {
            max_attempts: self.settings.recovery_max_attempts.min(remaining).max(1),
            ..transaction.retry_config.clone()
        };

        let selection = self
            .selector
            .select(
                Some(&transaction.payment.currency),
                transaction.payment.country.as_deref(),
                transaction.preferred_provider.as_deref(),
            )
            .await?;
        info!(
            "Recovering transaction {} on {} ({} prior attempts)",
            transaction.id, selection.provider, prior_attempts
        );

        self.drive(&mut transaction, selection.provider, &config, prior_attempts, cancel)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AttemptStatus;
    use crate::testing::{payment, Harness, ScriptedAttempt, ScriptedProbe};

    #[tokio::test(start_paused = true)]
    async fn degraded_current_provider_counts_as_a_failed_attempt() {
        let h = Harness::new().await;
        h.paystack.push_attempt(ScriptedAttempt::fail(codes::RATE_LIMITED, "slow down"));

        let run = h
            .state
            .coordinator
            .run(payment("deg-1", "ZAR"), Some("paystack"), None);
        let degrade = async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            h.paystack.set_default_probe(ScriptedProbe::Status(503));
            h.state.monitor.force_health_check(Some("paystack")).await.unwrap();
        };
        let (outcome, ()) = tokio::join!(run, degrade);
        let outcome = outcome.unwrap();

        assert!(outcome.success);
        assert_eq!(outcome.final_provider, "yoco");
        let codes_seen: Vec<_> = outcome.attempts.iter().map(|a| a.error_code.as_deref()).collect();
        assert_eq!(
            codes_seen,
            vec![Some(codes::RATE_LIMITED), Some(codes::PROVIDER_DEGRADED), None]
        );
        assert_eq!(h.paystack.attempt_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn degraded_everywhere_still_attempts() {
        let h = Harness::new().await;
        h.paystack.set_default_probe(ScriptedProbe::Status(503));
        h.yoco.set_default_probe(ScriptedProbe::Status(503));

        let outcome = h
            .state
            .coordinator
            .run(payment("deg-2", "NGN"), None, None)
            .await
            .unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.attempts.len(), 1);
        assert_eq!(h.paystack.attempt_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn hung_adapter_times_out_and_is_retried() {
        let h = Harness::new().await;
        h.paystack.push_attempt(ScriptedAttempt::Hang);

        let started = Instant::now();
        let outcome = h
            .state
            .coordinator
            .run(payment("hang-1", "NGN"), None, None)
            .await
            .unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.attempts[0].error_code.as_deref(), Some(codes::TIMEOUT));
        assert_eq!(outcome.attempts[1].status, AttemptStatus::Success);
        assert!(started.elapsed() >= Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_interrupts_a_slow_health_pre_check() {
        let h = Harness::new().await;
        h.paystack.push_attempt(ScriptedAttempt::fail(codes::RATE_LIMITED, "slow down"));
        h.yoco.set_default_probe(ScriptedProbe::Slow {
            status: 200,
            delay: Duration::from_secs(9),
        });
        let cancel = CancellationToken::new();

        let run = h.state.coordinator.run_with_cancel(
            payment("pre-1", "ZAR"),
            Some("paystack"),
            None,
            &cancel,
        );
        let interrupt = async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            h.paystack.set_default_probe(ScriptedProbe::Status(503));
            h.state.monitor.force_health_check(Some("paystack")).await.unwrap();
            // Attempt 2's pre-check is now waiting on yoco's cold probe.
            while h.yoco.probe_calls() == 0 {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            cancel.cancel();
            Instant::now()
        };
        let (outcome, cancelled_at) = tokio::join!(run, interrupt);
        let outcome = outcome.unwrap();

        assert!(outcome.cancelled);
        assert!(cancelled_at.elapsed() < Duration::from_secs(1));
        assert_eq!(outcome.attempts.len(), 2);
        assert_eq!(outcome.attempts[1].error_code.as_deref(), Some(codes::CANCELLED));
        assert!(outcome.attempts.iter().all(|a| a.status != AttemptStatus::Pending));
        assert_eq!(h.paystack.attempt_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn recovery_reruns_under_the_submitted_policy() {
        let h = Harness::new().await;
        h.paystack
            .set_default_attempt(ScriptedAttempt::fail(codes::TIMEOUT, "upstream slow"));
        let config = RetryConfig {
            max_attempts: 1,
            retryable_errors: [codes::GATEWAY_ERROR.to_string()].into_iter().collect(),
            ..RetryConfig::default()
        };

        let first = h
            .state
            .coordinator
            .run(payment("rr-1", "NGN"), None, Some(config.clone()))
            .await
            .unwrap();
        assert_eq!(first.transaction.retry_config, config);

        let report = h
            .state
            .coordinator
            .recover_failed_payments(10, Duration::from_secs(3600))
            .await
            .unwrap();
        assert_eq!(report.still_failed, 1);

        // TIMEOUT is not retryable under the submitted policy, so the re-run
        // stops after one attempt instead of using the default two.
        let stored = h
            .state
            .ledger
            .transaction(&first.transaction.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.retry_count, 2);
        assert_eq!(h.paystack.attempt_calls(), 2);
    }

    #[tokio::test]
    async fn invalid_retry_config_is_a_hard_error() {
        let h = Harness::new().await;
        let config = RetryConfig {
            max_attempts: 0,
            ..RetryConfig::default()
        };
        let err = h
            .state
            .coordinator
            .run(payment("bad-1", "NGN"), None, Some(config))
            .await
            .unwrap_err();
        assert!(matches!(err, RouterError::InvalidRetryConfig(_)));
        assert!(h.state.ledger.transaction_by_reference("bad-1").await.unwrap().is_none());
    }
}
