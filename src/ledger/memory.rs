use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;

use super::AttemptLedger;
use crate::app::error::RouterError;
use crate::models::health::history_window;
use crate::models::{
    HealthCheckResult, ManualReviewItem, PaymentAttempt, TransactionRecord, TransactionStatus,
};

#[derive(Default)]
pub struct MemoryLedger {
    transactions: DashMap<String, TransactionRecord>,
    references: DashMap<String, String>,
    attempts: DashMap<String, Vec<PaymentAttempt>>,
    manual_reviews: Mutex<Vec<ManualReviewItem>>,
    health: DashMap<String, VecDeque<HealthCheckResult>>,
    /// `(provider, event_id)` -> first delivery, kept for [`webhook_dedup_window`].
    webhook_events: DashMap<(String, String), DateTime<Utc>>,
}

/// How long a delivered webhook event id is remembered for deduplication.
fn webhook_dedup_window() -> chrono::Duration {
    chrono::Duration::hours(24)
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AttemptLedger for MemoryLedger {
    async fn begin_attempt(&self, attempt: PaymentAttempt) -> Result<(), RouterError> {
        // The entry guard serialises writers for one transaction.
        let mut attempts = self.attempts.entry(attempt.transaction_id.clone()).or_default();

        if attempts.iter().any(PaymentAttempt::is_pending) {
            return Err(RouterError::Ledger(format!(
                "transaction {} already has a pending attempt",
                attempt.transaction_id
            )));
        }
        let expected = attempts.len() as u32 + 1;
        if attempt.attempt_number != expected {
            return Err(RouterError::Ledger(format!(
                "transaction {} expected attempt {} but got {}",
                attempt.transaction_id, expected, attempt.attempt_number
            )));
        }

        attempts.push(attempt);
        Ok(())
    }

    async fn complete_attempt(&self, attempt: &PaymentAttempt) -> Result<(), RouterError> {
        let mut attempts = self
            .attempts
            .get_mut(&attempt.transaction_id)
            .ok_or_else(|| RouterError::Ledger(format!("unknown transaction {}", attempt.transaction_id)))?;

        let stored = attempts
            .iter_mut()
            .find(|a| a.id == attempt.id)
            .ok_or_else(|| RouterError::Ledger(format!("unknown attempt {}", attempt.id)))?;

        if !stored.is_pending() {
            return Err(RouterError::Ledger(format!(
                "attempt {} is already {:?}",
                attempt.id, stored.status
            )));
        }
        if attempt.is_pending() {
            return Err(RouterError::Ledger(format!(
                "attempt {} completed without a terminal status",
                attempt.id
            )));
        }

        *stored = attempt.clone();
        Ok(())
    }

    async fn attempts_for(&self, transaction_id: &str) -> Result<Vec<PaymentAttempt>, RouterError> {
        Ok(self
            .attempts
            .get(transaction_id)
            .map(|entry| entry.clone())
            .unwrap_or_default())
    }

    async fn attempts_since(&self, since: DateTime<Utc>) -> Result<Vec<PaymentAttempt>, RouterError> {
        let mut found: Vec<PaymentAttempt> = self
            .attempts
            .iter()
            .flat_map(|entry| {
                entry
                    .value()
                    .iter()
                    .filter(|a| a.created_at >= since)
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .collect();
        found.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(found)
    }

    async fn upsert_transaction(&self, transaction: &TransactionRecord) -> Result<(), RouterError> {
        self.references
            .insert(transaction.payment.reference.clone(), transaction.id.clone());
        self.transactions
            .insert(transaction.id.clone(), transaction.clone());
        Ok(())
    }

    async fn transaction(&self, id: &str) -> Result<Option<TransactionRecord>, RouterError> {
        Ok(self.transactions.get(id).map(|entry| entry.clone()))
    }

    async fn transaction_by_reference(
        &self,
        reference: &str,
    ) -> Result<Option<TransactionRecord>, RouterError> {
        let Some(id) = self.references.get(reference).map(|entry| entry.clone()) else {
            return Ok(None);
        };
        self.transaction(&id).await
    }

    async fn failed_transactions(
        &self,
        created_after: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<TransactionRecord>, RouterError> {
        let mut failed: Vec<TransactionRecord> = self
            .transactions
            .iter()
            .filter(|entry| {
                entry.status == TransactionStatus::FailedTerminal && entry.created_at > created_after
            })
            .map(|entry| entry.clone())
            .collect();
        failed.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        failed.truncate(limit);
        Ok(failed)
    }

    async fn enqueue_manual_review(&self, item: ManualReviewItem) -> Result<(), RouterError> {
        self.manual_reviews.lock().push(item);
        Ok(())
    }

    async fn manual_review_queue(&self) -> Result<Vec<ManualReviewItem>, RouterError> {
        Ok(self.manual_reviews.lock().clone())
    }

    async fn record_health_check(&self, result: &HealthCheckResult) -> Result<(), RouterError> {
        let mut rows = self.health.entry(result.provider.clone()).or_default();
        rows.push_back(result.clone());
        let cutoff = result.timestamp - history_window();
        while rows.front().map(|r| r.timestamp < cutoff).unwrap_or(false) {
            rows.pop_front();
        }
        Ok(())
    }

    async fn health_history(
        &self,
        provider: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<HealthCheckResult>, RouterError> {
        Ok(self
            .health
            .get(provider)
            .map(|rows| rows.iter().filter(|r| r.timestamp >= since).cloned().collect())
            .unwrap_or_default())
    }

    async fn record_webhook_event(
        &self,
        provider: &str,
        event_id: &str,
        received_at: DateTime<Utc>,
    ) -> Result<bool, RouterError> {
        let cutoff = received_at - webhook_dedup_window();
        self.webhook_events.retain(|_, seen| *seen >= cutoff);

        match self
            .webhook_events
            .entry((provider.to_string(), event_id.to_string()))
        {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(slot) => {
                slot.insert(received_at);
                Ok(true)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::error::ProviderError;
    use crate::models::PaymentData;
    use chrono::Duration;

    fn now() -> DateTime<Utc> {
        DateTime::<Utc>::UNIX_EPOCH + Duration::days(10_000)
    }

    fn payment(reference: &str) -> PaymentData {
        PaymentData {
            reference: reference.into(),
            amount: 5_000,
            currency: "NGN".into(),
            country: Some("NG".into()),
            email: "buyer@example.com".into(),
            metadata: Default::default(),
        }
    }

    #[tokio::test]
    async fn attempt_numbers_must_be_contiguous() {
        let ledger = MemoryLedger::new();
        let err = ledger
            .begin_attempt(PaymentAttempt::pending("tx", "paystack", 2, now()))
            .await
            .unwrap_err();
        assert!(matches!(err, RouterError::Ledger(_)));

        ledger
            .begin_attempt(PaymentAttempt::pending("tx", "paystack", 1, now()))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn only_one_pending_attempt_per_transaction() {
        let ledger = MemoryLedger::new();
        let mut first = PaymentAttempt::pending("tx", "paystack", 1, now());
        ledger.begin_attempt(first.clone()).await.unwrap();

        let second = PaymentAttempt::pending("tx", "paystack", 2, now());
        assert!(ledger.begin_attempt(second.clone()).await.is_err());

        first.fail(&ProviderError::new("TIMEOUT", "slow"), 10_000, now());
        ledger.complete_attempt(&first).await.unwrap();
        ledger.begin_attempt(second).await.unwrap();

        let attempts = ledger.attempts_for("tx").await.unwrap();
        assert_eq!(attempts.len(), 2);
        assert_eq!(attempts[0].error_code.as_deref(), Some("TIMEOUT"));
    }

    #[tokio::test]
    async fn terminal_attempts_are_never_reopened() {
        let ledger = MemoryLedger::new();
        let mut attempt = PaymentAttempt::pending("tx", "yoco", 1, now());
        ledger.begin_attempt(attempt.clone()).await.unwrap();
        attempt.succeed(120, now());
        ledger.complete_attempt(&attempt).await.unwrap();

        attempt.fail(&ProviderError::new("GATEWAY_ERROR", "late"), 1, now());
        assert!(ledger.complete_attempt(&attempt).await.is_err());
    }

    #[tokio::test]
    async fn failed_transactions_filters_by_age_and_status() {
        let ledger = MemoryLedger::new();
        let mut old = TransactionRecord::new(payment("old"), None, now() - Duration::days(3));
        old.status = TransactionStatus::FailedTerminal;
        let mut fresh = TransactionRecord::new(payment("fresh"), None, now() - Duration::hours(1));
        fresh.status = TransactionStatus::FailedTerminal;
        let mut done = TransactionRecord::new(payment("done"), None, now());
        done.status = TransactionStatus::Succeeded;
        for tx in [&old, &fresh, &done] {
            ledger.upsert_transaction(tx).await.unwrap();
        }

        let found = ledger
            .failed_transactions(now() - Duration::days(1), 10)
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].payment.reference, "fresh");

        let by_ref = ledger.transaction_by_reference("done").await.unwrap().unwrap();
        assert_eq!(by_ref.id, done.id);
    }

    #[tokio::test]
    async fn webhook_events_are_deduplicated_per_provider() {
        let ledger = MemoryLedger::new();
        assert!(ledger.record_webhook_event("paystack", "evt_1", now()).await.unwrap());
        assert!(!ledger.record_webhook_event("paystack", "evt_1", now()).await.unwrap());
        assert!(ledger.record_webhook_event("yoco", "evt_1", now()).await.unwrap());
    }

    #[tokio::test]
    async fn webhook_event_ids_expire_after_the_dedup_window() {
        let ledger = MemoryLedger::new();
        assert!(ledger.record_webhook_event("paystack", "evt_1", now()).await.unwrap());

        let later = now() + Duration::hours(12);
        assert!(!ledger.record_webhook_event("paystack", "evt_1", later).await.unwrap());

        let next_day = now() + Duration::hours(25);
        assert!(ledger.record_webhook_event("paystack", "evt_2", next_day).await.unwrap());
        assert_eq!(ledger.webhook_events.len(), 1);
        assert!(ledger.record_webhook_event("paystack", "evt_1", next_day).await.unwrap());
    }

    #[tokio::test]
    async fn health_rows_are_trimmed_to_the_trailing_window() {
        let ledger = MemoryLedger::new();
        for hours in [0, 12, 30] {
            ledger
                .record_health_check(&HealthCheckResult {
                    provider: "paystack".into(),
                    healthy: true,
                    response_time_ms: 80,
                    status_code: Some(200),
                    error: None,
                    timestamp: now() + Duration::hours(hours),
                })
                .await
                .unwrap();
        }
        let rows = ledger
            .health_history("paystack", DateTime::<Utc>::UNIX_EPOCH)
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);
    }
}
