use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error codes produced by the adapters and the retry loop itself.
pub mod codes {
    pub const GATEWAY_ERROR: &str = "GATEWAY_ERROR";
    pub const NETWORK_ERROR: &str = "NETWORK_ERROR";
    pub const TIMEOUT: &str = "TIMEOUT";
    pub const RATE_LIMITED: &str = "RATE_LIMITED";
    pub const SERVICE_UNAVAILABLE: &str = "SERVICE_UNAVAILABLE";
    pub const PROVIDER_DEGRADED: &str = "PROVIDER_DEGRADED";
    pub const FRAUD_SUSPECTED: &str = "FRAUD_SUSPECTED";
    pub const INVALID_AMOUNT: &str = "INVALID_AMOUNT";
    pub const INVALID_REQUEST: &str = "INVALID_REQUEST";
    pub const CANCELLED: &str = "CANCELLED";
    pub const UNKNOWN: &str = "UNKNOWN";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Transport,
    RateLimited,
    Validation,
    Fraud,
    Unknown,
}

/// A classified failure returned by a provider adapter (or synthesised by the
/// retry loop for timeouts, degraded providers and cancellation).
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{code}: {message}")]
pub struct ProviderError {
    pub code: String,
    pub message: String,
}

impl ProviderError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn timeout(provider: &str, after_ms: u64) -> Self {
        Self::new(
            codes::TIMEOUT,
            format!("{} did not respond within {}ms", provider, after_ms),
        )
    }

    pub fn degraded(provider: &str) -> Self {
        Self::new(
            codes::PROVIDER_DEGRADED,
            format!("{} is failing its health gate", provider),
        )
    }

    pub fn cancelled() -> Self {
        Self::new(codes::CANCELLED, "payment cancelled by caller")
    }

    pub fn is_cancellation(&self) -> bool {
        self.code == codes::CANCELLED
    }

    pub fn category(&self) -> ErrorCategory {
        let code = self.code.to_ascii_uppercase();
        let message = self.message.to_ascii_lowercase();

        if code.contains("FRAUD") || message.contains("fraud") || message.contains("compliance") {
            ErrorCategory::Fraud
        } else if code.contains("RATE_LIMIT") || message.contains("too many requests") {
            ErrorCategory::RateLimited
        } else if ["TIMEOUT", "GATEWAY", "NETWORK", "CONNECTION", "UNAVAILABLE", "DEGRADED"]
            .iter()
            .any(|needle| code.contains(needle))
        {
            ErrorCategory::Transport
        } else if code.contains("INVALID") || code.contains("AMOUNT") || code.contains("VALIDATION") {
            ErrorCategory::Validation
        } else {
            ErrorCategory::Unknown
        }
    }
}

/// Hard failures. These escape to the caller instead of becoming attempt records.
#[derive(Debug, Error)]
pub enum RouterError {
    #[error("unknown provider: {0}")]
    UnknownProvider(String),
    #[error("invalid recovery strategy: {0}")]
    InvalidStrategy(String),
    #[error("invalid retry config: {0}")]
    InvalidRetryConfig(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("ledger error: {0}")]
    Ledger(String),
    #[error("strategy persistence failed: {0}")]
    Persistence(#[from] std::io::Error),
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("unknown provider: {0}")]
    UnknownProvider(String),
    #[error("webhook signature rejected")]
    InvalidSignature,
    #[error("malformed webhook payload: {0}")]
    MalformedPayload(String),
    #[error(transparent)]
    Router(#[from] RouterError),
}
