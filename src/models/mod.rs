pub mod attempt;
pub mod health;
pub mod payment;
pub mod provider;
pub mod retry;
pub mod strategy;

pub use attempt::{AttemptStatus, PaymentAttempt};
pub use health::{HealthCheckResult, HealthStatusChange, ProviderHealthProfile, Recommendation};
pub use payment::{
    ManualReviewItem, PaymentData, PaymentRequest, ProviderCharge, TransactionRecord,
    TransactionStatus,
};
pub use provider::{
    ProbeResponse, ProviderCapabilities, ProviderKind, WebhookEvent, WebhookHeaders,
    WebhookPaymentStatus,
};
pub use retry::{RecoveryDecision, RetryConfig, RetryOutcome};
pub use strategy::{
    ConditionField, ConditionOperator, ConditionValue, RecoveryAction, RecoveryContext,
    RecoveryStrategy, StrategyCondition,
};
