use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::app::error::ProviderError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    Pending,
    Success,
    Failed,
}

/// One try against one provider. Mutable only while `Pending`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentAttempt {
    pub id: String,
    pub transaction_id: String,
    pub provider: String,
    pub attempt_number: u32,
    pub status: AttemptStatus,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub response_time_ms: Option<u64>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl PaymentAttempt {
    pub fn pending(
        transaction_id: &str,
        provider: &str,
        attempt_number: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            transaction_id: transaction_id.to_string(),
            provider: provider.to_string(),
            attempt_number,
            status: AttemptStatus::Pending,
            error_code: None,
            error_message: None,
            response_time_ms: None,
            created_at: now,
            completed_at: None,
        }
    }

    pub fn succeed(&mut self, response_time_ms: u64, now: DateTime<Utc>) {
        self.status = AttemptStatus::Success;
        self.response_time_ms = Some(response_time_ms);
        self.completed_at = Some(now);
    }

    pub fn fail(&mut self, error: &ProviderError, response_time_ms: u64, now: DateTime<Utc>) {
        self.status = AttemptStatus::Failed;
        self.error_code = Some(error.code.clone());
        self.error_message = Some(error.message.clone());
        self.response_time_ms = Some(response_time_ms);
        self.completed_at = Some(now);
    }

    pub fn is_pending(&self) -> bool {
        self.status == AttemptStatus::Pending
    }
}
