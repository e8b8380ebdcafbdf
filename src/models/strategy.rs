use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::app::error::ProviderError;

pub const DEFAULT_DELAY_MS: u64 = 5_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConditionField {
    ErrorCode,
    ErrorMessage,
    Provider,
    AttemptNumber,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConditionOperator {
    Equals,
    Contains,
    GreaterThan,
    LessThan,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConditionValue {
    Number(f64),
    Text(String),
}

impl ConditionValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ConditionValue::Number(n) => Some(*n),
            ConditionValue::Text(s) => s.trim().parse().ok(),
        }
    }

    pub fn as_text(&self) -> String {
        match self {
            ConditionValue::Number(n) if n.fract() == 0.0 => format!("{}", *n as i64),
            ConditionValue::Number(n) => n.to_string(),
            ConditionValue::Text(s) => s.clone(),
        }
    }
}

impl From<&str> for ConditionValue {
    fn from(value: &str) -> Self {
        ConditionValue::Text(value.to_string())
    }
}

impl From<f64> for ConditionValue {
    fn from(value: f64) -> Self {
        ConditionValue::Number(value)
    }
}

/// Everything a condition may look at.
#[derive(Debug, Clone, Copy)]
pub struct RecoveryContext<'a> {
    pub error: &'a ProviderError,
    pub provider: &'a str,
    /// 1-based position within the current loop.
    pub attempt_number: u32,
    pub currency: Option<&'a str>,
    pub country: Option<&'a str>,
}

enum Subject<'a> {
    Text(&'a str),
    Number(f64),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyCondition {
    pub field: ConditionField,
    pub operator: ConditionOperator,
    pub value: ConditionValue,
}

impl StrategyCondition {
    pub fn new(field: ConditionField, operator: ConditionOperator, value: impl Into<ConditionValue>) -> Self {
        Self {
            field,
            operator,
            value: value.into(),
        }
    }

    pub fn matches(&self, ctx: &RecoveryContext<'_>) -> bool {
        let subject = match self.field {
            ConditionField::ErrorCode => Subject::Text(&ctx.error.code),
            ConditionField::ErrorMessage => Subject::Text(&ctx.error.message),
            ConditionField::Provider => Subject::Text(ctx.provider),
            ConditionField::AttemptNumber => Subject::Number(f64::from(ctx.attempt_number)),
        };

        match (self.operator, subject) {
            (ConditionOperator::Equals, Subject::Text(s)) => s == self.value.as_text(),
            (ConditionOperator::Equals, Subject::Number(n)) => self.value.as_f64() == Some(n),
            // Contains is case-insensitive; provider messages are not consistent about case.
            (ConditionOperator::Contains, Subject::Text(s)) => s
                .to_ascii_lowercase()
                .contains(&self.value.as_text().to_ascii_lowercase()),
            (ConditionOperator::Contains, Subject::Number(n)) => {
                (n as i64).to_string().contains(&self.value.as_text())
            }
            (ConditionOperator::GreaterThan, subject) => compare(subject, &self.value)
                .map(|(lhs, rhs)| lhs > rhs)
                .unwrap_or(false),
            (ConditionOperator::LessThan, subject) => compare(subject, &self.value)
                .map(|(lhs, rhs)| lhs < rhs)
                .unwrap_or(false),
        }
    }
}

fn compare(subject: Subject<'_>, value: &ConditionValue) -> Option<(f64, f64)> {
    let lhs = match subject {
        Subject::Number(n) => n,
        Subject::Text(s) => s.trim().parse().ok()?,
    };
    Some((lhs, value.as_f64()?))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryAction {
    RetrySameProvider,
    SwitchProvider,
    DelayRetry,
    ManualReview,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryStrategy {
    pub name: String,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    pub priority: i32,
    pub conditions: Vec<StrategyCondition>,
    pub action: RecoveryAction,
    #[serde(default)]
    pub parameters: Map<String, Value>,
}

fn enabled_by_default() -> bool {
    true
}

impl RecoveryStrategy {
    pub fn new(name: &str, priority: i32, action: RecoveryAction, conditions: Vec<StrategyCondition>) -> Self {
        Self {
            name: name.to_string(),
            enabled: true,
            priority,
            conditions,
            action,
            parameters: Map::new(),
        }
    }

    pub fn with_parameter(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.parameters.insert(key.to_string(), value.into());
        self
    }

    /// Conditions are ANDed.
    pub fn matches(&self, ctx: &RecoveryContext<'_>) -> bool {
        self.enabled && self.conditions.iter().all(|c| c.matches(ctx))
    }

    pub fn delay_ms(&self) -> u64 {
        self.parameters
            .get("delayMs")
            .and_then(Value::as_u64)
            .unwrap_or(DEFAULT_DELAY_MS)
    }

    /// Explicit failover target, if the operator pinned one.
    pub fn target_provider(&self) -> Option<&str> {
        self.parameters.get("provider").and_then(Value::as_str)
    }
}

/// Built-in table, in declaration order.
pub fn default_strategies() -> Vec<RecoveryStrategy> {
    use ConditionField::*;
    use ConditionOperator::*;

    vec![
        RecoveryStrategy::new(
            "fraud_manual_review",
            150,
            RecoveryAction::ManualReview,
            vec![StrategyCondition::new(ErrorCode, Contains, "FRAUD")],
        ),
        RecoveryStrategy::new(
            "gateway_error_failover",
            100,
            RecoveryAction::SwitchProvider,
            vec![StrategyCondition::new(ErrorCode, Contains, "GATEWAY")],
        ),
        RecoveryStrategy::new(
            "network_error_failover",
            100,
            RecoveryAction::SwitchProvider,
            vec![StrategyCondition::new(ErrorCode, Contains, "NETWORK")],
        ),
        RecoveryStrategy::new(
            "degraded_provider_failover",
            100,
            RecoveryAction::SwitchProvider,
            vec![StrategyCondition::new(ErrorCode, Equals, "PROVIDER_DEGRADED")],
        ),
        RecoveryStrategy::new(
            "rate_limit_backoff",
            90,
            RecoveryAction::DelayRetry,
            vec![StrategyCondition::new(ErrorCode, Contains, "RATE_LIMIT")],
        )
        .with_parameter("delayMs", 10_000u64),
        RecoveryStrategy::new(
            "early_timeout_retry",
            80,
            RecoveryAction::RetrySameProvider,
            vec![
                StrategyCondition::new(ErrorCode, Contains, "TIMEOUT"),
                StrategyCondition::new(AttemptNumber, LessThan, 4.0),
            ],
        ),
    ]
}
