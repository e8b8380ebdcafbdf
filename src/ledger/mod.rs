//! Record store for transactions, attempts, health history and the manual
//! review queue.
//!
//! The retry loop and the health monitor only talk to [`AttemptLedger`]; the
//! in-memory implementation backs the server and the tests.

mod memory;

pub use memory::MemoryLedger;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::app::error::RouterError;
use crate::models::{HealthCheckResult, ManualReviewItem, PaymentAttempt, TransactionRecord};

#[async_trait]
pub trait AttemptLedger: Send + Sync {
    /// Appends a pending attempt. Rejects gaps in the attempt numbering and a
    /// second pending attempt for the same transaction.
    async fn begin_attempt(&self, attempt: PaymentAttempt) -> Result<(), RouterError>;

    /// Stores the terminal state of a pending attempt. Terminal attempts are
    /// never reopened.
    async fn complete_attempt(&self, attempt: &PaymentAttempt) -> Result<(), RouterError>;

    async fn attempts_for(&self, transaction_id: &str) -> Result<Vec<PaymentAttempt>, RouterError>;

    async fn attempts_since(&self, since: DateTime<Utc>) -> Result<Vec<PaymentAttempt>, RouterError>;

    async fn upsert_transaction(&self, transaction: &TransactionRecord) -> Result<(), RouterError>;

    async fn transaction(&self, id: &str) -> Result<Option<TransactionRecord>, RouterError>;

    async fn transaction_by_reference(
        &self,
        reference: &str,
    ) -> Result<Option<TransactionRecord>, RouterError>;

    /// `FailedTerminal` transactions created after `created_after`, oldest first.
    async fn failed_transactions(
        &self,
        created_after: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<TransactionRecord>, RouterError>;

    async fn enqueue_manual_review(&self, item: ManualReviewItem) -> Result<(), RouterError>;

    async fn manual_review_queue(&self) -> Result<Vec<ManualReviewItem>, RouterError>;

    async fn record_health_check(&self, result: &HealthCheckResult) -> Result<(), RouterError>;

    async fn health_history(
        &self,
        provider: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<HealthCheckResult>, RouterError>;

    /// Returns `false` when `(provider, event_id)` was already recorded within
    /// the deduplication window. Older entries are forgotten.
    async fn record_webhook_event(
        &self,
        provider: &str,
        event_id: &str,
        received_at: DateTime<Utc>,
    ) -> Result<bool, RouterError>;
}
