use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::retry::RetryConfig;

/// What the caller wants charged. Amounts are in minor units (kobo, cents).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentData {
    pub reference: String,
    pub amount: u64,
    pub currency: String,
    #[serde(default)]
    pub country: Option<String>,
    pub email: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

/// Body of `POST /payments`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRequest {
    pub payment: PaymentData,
    #[serde(default)]
    pub preferred_provider: Option<String>,
    #[serde(default)]
    pub retry_config: Option<RetryConfig>,
}

/// Successful provider response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderCharge {
    pub provider: String,
    pub provider_reference: String,
    pub status: String,
    pub amount: u64,
    pub fee: Option<u64>,
    #[serde(default)]
    pub authorization_url: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Initiated,
    Attempting,
    /// Between a failed attempt and the next one, while backing off.
    Retrying,
    Succeeded,
    FailedTerminal,
    ManualReview,
}

impl TransactionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TransactionStatus::Succeeded
                | TransactionStatus::FailedTerminal
                | TransactionStatus::ManualReview
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionRecord {
    pub id: String,
    pub payment: PaymentData,
    pub preferred_provider: Option<String>,
    pub status: TransactionStatus,
    pub provider: Option<String>,
    /// Total attempts made across the original loop and any batch recovery.
    pub retry_count: u32,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub provider_reference: Option<String>,
    /// Policy the transaction was submitted with; batch recovery re-runs
    /// under it.
    #[serde(default)]
    pub retry_config: RetryConfig,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TransactionRecord {
    pub fn new(payment: PaymentData, preferred_provider: Option<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            payment,
            preferred_provider,
            status: TransactionStatus::Initiated,
            provider: None,
            retry_count: 0,
            error_code: None,
            error_message: None,
            provider_reference: None,
            retry_config: RetryConfig::default(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_retry_config(mut self, config: RetryConfig) -> Self {
        self.retry_config = config;
        self
    }
}

/// An entry in the manual review queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManualReviewItem {
    pub transaction_id: String,
    pub reference: String,
    pub provider: String,
    pub strategy: Option<String>,
    pub error_code: String,
    pub error_message: String,
    pub enqueued_at: DateTime<Utc>,
}
