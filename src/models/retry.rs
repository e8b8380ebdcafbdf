use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;

use super::attempt::PaymentAttempt;
use super::payment::{ProviderCharge, TransactionRecord, TransactionStatus};
use crate::app::error::{codes, ProviderError, RouterError};

/// Per-request retry policy. Immutable for the lifetime of one retry loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub enable_provider_fallback: bool,
    /// Substrings matched against the error code and message.
    pub retryable_errors: BTreeSet<String>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            backoff_multiplier: 2.0,
            enable_provider_fallback: true,
            retryable_errors: [
                codes::TIMEOUT,
                codes::NETWORK_ERROR,
                codes::RATE_LIMITED,
                codes::GATEWAY_ERROR,
                codes::SERVICE_UNAVAILABLE,
                codes::PROVIDER_DEGRADED,
                "CONNECTION",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
        }
    }
}

impl RetryConfig {
    pub fn validate(&self) -> Result<(), RouterError> {
        if self.max_attempts == 0 {
            return Err(RouterError::InvalidRetryConfig(
                "maxAttempts must be at least 1".into(),
            ));
        }
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(RouterError::InvalidRetryConfig(
                "backoffMultiplier must be a finite number >= 1".into(),
            ));
        }
        if self.base_delay_ms > self.max_delay_ms {
            return Err(RouterError::InvalidRetryConfig(
                "baseDelayMs cannot exceed maxDelayMs".into(),
            ));
        }
        Ok(())
    }

    pub fn is_retryable_error(&self, error: &ProviderError) -> bool {
        let code = error.code.to_ascii_uppercase();
        let message = error.message.to_ascii_uppercase();
        self.retryable_errors.iter().any(|pattern| {
            let pattern = pattern.to_ascii_uppercase();
            code.contains(&pattern) || message.contains(&pattern)
        })
    }
}

/// What the recovery engine wants the retry loop to do next.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryDecision {
    pub should_stop: bool,
    pub new_provider: Option<String>,
    /// Overrides the exponential backoff for the next sleep.
    #[serde(default, with = "duration_ms")]
    pub delay: Option<Duration>,
    pub manual_review: bool,
    pub strategy: Option<String>,
    pub reason: String,
}

impl RecoveryDecision {
    pub fn continue_until_exhausted(attempt_number: u32, max_attempts: u32, reason: impl Into<String>) -> Self {
        Self {
            should_stop: attempt_number >= max_attempts,
            new_provider: None,
            delay: None,
            manual_review: false,
            strategy: None,
            reason: reason.into(),
        }
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}

/// Result of driving one transaction through the retry loop.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryOutcome {
    pub success: bool,
    pub status: TransactionStatus,
    pub transaction: TransactionRecord,
    pub charge: Option<ProviderCharge>,
    pub attempts: Vec<PaymentAttempt>,
    pub final_provider: String,
    pub total_time_ms: u64,
    pub recovery: Option<RecoveryDecision>,
    pub cancelled: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(RetryConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_nonsense_configs() {
        let zero = RetryConfig {
            max_attempts: 0,
            ..RetryConfig::default()
        };
        assert!(zero.validate().is_err());

        let shrinking = RetryConfig {
            backoff_multiplier: 0.5,
            ..RetryConfig::default()
        };
        assert!(shrinking.validate().is_err());

        let inverted = RetryConfig {
            base_delay_ms: 60_000,
            ..RetryConfig::default()
        };
        assert!(inverted.validate().is_err());
    }

    #[test]
    fn retryable_is_substring_match_on_code_or_message() {
        let config = RetryConfig::default();
        assert!(config.is_retryable_error(&ProviderError::new("GATEWAY_ERROR", "502")));
        assert!(config.is_retryable_error(&ProviderError::new("E1", "connection refused")));
        assert!(!config.is_retryable_error(&ProviderError::new("INVALID_AMOUNT", "too low")));
        assert!(!config.is_retryable_error(&ProviderError::new("FRAUD_SUSPECTED", "blocked")));
    }

    #[test]
    fn partial_json_fills_defaults() {
        let config: RetryConfig = serde_json::from_str(r#"{"maxAttempts": 5}"#).unwrap();
        assert_eq!(config.max_attempts, 5);
        assert_eq!(config.base_delay_ms, 1_000);
        assert!(config.retryable_errors.contains("TIMEOUT"));
    }
}
