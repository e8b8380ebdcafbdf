//! Rule table mapping a failed attempt to the next step of the retry loop.
//!
//! Strategies are kept sorted by descending priority with a stable sort, so
//! among equal priorities the one registered first wins.

use parking_lot::RwLock;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::app::error::{ErrorCategory, RouterError};
use crate::models::strategy::default_strategies;
use crate::models::{
    ConditionField, ConditionOperator, RecoveryAction, RecoveryContext, RecoveryDecision,
    RecoveryStrategy, RetryConfig,
};
use crate::services::health_monitor::HealthMonitor;
use crate::services::provider_registry::ProviderRegistry;

pub struct RecoveryEngine {
    registry: Arc<ProviderRegistry>,
    monitor: Arc<HealthMonitor>,
    strategies: RwLock<Vec<RecoveryStrategy>>,
    store: Option<PathBuf>,
}

impl RecoveryEngine {
    /// Engine with the built-in table and no persistence.
    pub fn new(registry: Arc<ProviderRegistry>, monitor: Arc<HealthMonitor>) -> Self {
        let mut strategies = default_strategies();
        sort_by_priority(&mut strategies);
        Self {
            registry,
            monitor,
            strategies: RwLock::new(strategies),
            store: None,
        }
    }

    /// Loads the table from `path` if it exists, otherwise starts from the
    /// built-in table. Changes are written back to `path`.
    pub async fn with_store(
        registry: Arc<ProviderRegistry>,
        monitor: Arc<HealthMonitor>,
        path: PathBuf,
    ) -> Result<Self, RouterError> {
        let mut engine = Self::new(registry, monitor);

        match tokio::fs::read_to_string(&path).await {
            Ok(raw) => {
                let mut loaded: Vec<RecoveryStrategy> = serde_json::from_str(&raw)?;
                for strategy in &loaded {
                    engine.validate(strategy)?;
                }
                sort_by_priority(&mut loaded);
                info!("Loaded {} recovery strategies from {}", loaded.len(), path.display());
                *engine.strategies.write() = loaded;
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("No strategy file at {}, using built-in strategies", path.display());
            }
            Err(e) => return Err(e.into()),
        }

        engine.store = Some(path);
        Ok(engine)
    }

    pub fn strategies(&self) -> Vec<RecoveryStrategy> {
        self.strategies.read().clone()
    }

    pub fn strategy(&self, name: &str) -> Option<RecoveryStrategy> {
        self.strategies.read().iter().find(|s| s.name == name).cloned()
    }

    fn matching(&self, ctx: &RecoveryContext<'_>) -> Option<RecoveryStrategy> {
        self.strategies.read().iter().find(|s| s.matches(ctx)).cloned()
    }

    pub async fn decide(&self, ctx: &RecoveryContext<'_>, config: &RetryConfig) -> RecoveryDecision {
        let decision = match self.matching(ctx) {
            None => RecoveryDecision::continue_until_exhausted(
                ctx.attempt_number,
                config.max_attempts,
                "no recovery strategy matched",
            ),
            Some(strategy) => self.apply(&strategy, ctx, config).await,
        };

        let decision = if ctx.error.category() == ErrorCategory::Fraud && !decision.manual_review {
            warn!(
                "Fraud-class error {} on {} forced to manual review",
                ctx.error.code, ctx.provider
            );
            RecoveryDecision {
                should_stop: true,
                new_provider: None,
                delay: None,
                manual_review: true,
                strategy: decision.strategy,
                reason: "fraud-class errors are never retried automatically".into(),
            }
        } else {
            decision
        };

        info!(
            "Recovery for {} attempt {} ({}): stop={} switch={:?} strategy={:?}",
            ctx.provider,
            ctx.attempt_number,
            ctx.error.code,
            decision.should_stop,
            decision.new_provider,
            decision.strategy
        );
        decision
    }

    async fn apply(
        &self,
        strategy: &RecoveryStrategy,
        ctx: &RecoveryContext<'_>,
        config: &RetryConfig,
    ) -> RecoveryDecision {
        let exhausted = ctx.attempt_number >= config.max_attempts;
        let name = Some(strategy.name.clone());

        match strategy.action {
            RecoveryAction::ManualReview => RecoveryDecision {
                should_stop: true,
                new_provider: None,
                delay: None,
                manual_review: true,
                strategy: name,
                reason: format!("{} escalated to manual review", strategy.name),
            },
            RecoveryAction::DelayRetry => {
                let delay_ms = strategy.delay_ms();
                RecoveryDecision {
                    should_stop: exhausted,
                    new_provider: None,
                    delay: Some(Duration::from_millis(delay_ms)),
                    manual_review: false,
                    strategy: name,
                    reason: format!("{} delays the next attempt by {}ms", strategy.name, delay_ms),
                }
            }
            RecoveryAction::RetrySameProvider => RecoveryDecision {
                strategy: name,
                ..RecoveryDecision::continue_until_exhausted(
                    ctx.attempt_number,
                    config.max_attempts,
                    format!("{} retries {}", strategy.name, ctx.provider),
                )
            },
            RecoveryAction::SwitchProvider => {
                if !config.enable_provider_fallback {
                    return RecoveryDecision {
                        strategy: name,
                        ..RecoveryDecision::continue_until_exhausted(
                            ctx.attempt_number,
                            config.max_attempts,
                            "provider fallback disabled for this request",
                        )
                    };
                }
                match self.alternate_provider(strategy, ctx).await {
                    Some(alternate) => RecoveryDecision {
                        should_stop: exhausted,
                        reason: format!("{} switches {} -> {}", strategy.name, ctx.provider, alternate),
                        new_provider: Some(alternate),
                        delay: None,
                        manual_review: false,
                        strategy: name,
                    },
                    None => RecoveryDecision {
                        strategy: name,
                        ..RecoveryDecision::continue_until_exhausted(
                            ctx.attempt_number,
                            config.max_attempts,
                            "no healthy alternate provider",
                        )
                    },
                }
            }
        }
    }

    /// First usable provider other than the current one, honouring a pinned
    /// `provider` parameter.
    async fn alternate_provider(
        &self,
        strategy: &RecoveryStrategy,
        ctx: &RecoveryContext<'_>,
    ) -> Option<String> {
        let candidates: Vec<&str> = match strategy.target_provider() {
            Some(target) => vec![target],
            None => self.registry.names().collect(),
        };

        for candidate in candidates {
            if candidate == ctx.provider
                || !self.registry.supports(candidate, ctx.currency, ctx.country)
            {
                continue;
            }
            if self.monitor.should_use_provider(candidate).await {
                return Some(candidate.to_string());
            }
            debug!("Alternate {} rejected by health gate", candidate);
        }
        None
    }

    pub fn validate(&self, strategy: &RecoveryStrategy) -> Result<(), RouterError> {
        let invalid = |reason: String| -> Result<(), RouterError> { Err(RouterError::InvalidStrategy(reason)) };

        if strategy.name.trim().is_empty() {
            return invalid("name must not be empty".into());
        }
        if strategy.conditions.is_empty() {
            return invalid(format!("{} has no conditions", strategy.name));
        }

        for condition in &strategy.conditions {
            let numeric_operator = matches!(
                condition.operator,
                ConditionOperator::GreaterThan | ConditionOperator::LessThan
            );
            let numeric_field = condition.field == ConditionField::AttemptNumber
                && condition.operator != ConditionOperator::Contains;
            if (numeric_operator || numeric_field) && condition.value.as_f64().is_none() {
                return invalid(format!(
                    "{}: {:?} {:?} needs a numeric value",
                    strategy.name, condition.field, condition.operator
                ));
            }
        }

        if let Some(delay) = strategy.parameters.get("delayMs") {
            if delay.as_u64().is_none() {
                return invalid(format!("{}: delayMs must be a non-negative integer", strategy.name));
            }
        }
        if let Some(target) = strategy.parameters.get("provider") {
            match target.as_str() {
                Some(name) if self.registry.contains(name) => {}
                _ => return invalid(format!("{}: provider parameter names no registered provider", strategy.name)),
            }
        }
        Ok(())
    }

    /// Validates and hot-swaps a strategy (replacing one with the same name),
    /// then persists the table.
    pub async fn configure(&self, strategy: RecoveryStrategy) -> Result<(), RouterError> {
        self.validate(&strategy)?;
        {
            let mut strategies = self.strategies.write();
            match strategies.iter_mut().find(|s| s.name == strategy.name) {
                Some(existing) => *existing = strategy.clone(),
                None => strategies.push(strategy.clone()),
            }
            sort_by_priority(&mut strategies);
        }
        info!(
            "Configured recovery strategy {} (priority {}, {:?})",
            strategy.name, strategy.priority, strategy.action
        );
        self.persist().await
    }

    pub async fn remove(&self, name: &str) -> Result<bool, RouterError> {
        let removed = {
            let mut strategies = self.strategies.write();
            let before = strategies.len();
            strategies.retain(|s| s.name != name);
            strategies.len() != before
        };
        if removed {
            info!("Removed recovery strategy {}", name);
            self.persist().await?;
        }
        Ok(removed)
    }

    async fn persist(&self) -> Result<(), RouterError> {
        let Some(path) = &self.store else {
            return Ok(());
        };
        let snapshot = serde_json::to_vec_pretty(&self.strategies())?;
        let staging = path.with_extension("tmp");
        tokio::fs::write(&staging, snapshot).await?;
        tokio::fs::rename(&staging, path).await?;
        Ok(())
    }
}

fn sort_by_priority(strategies: &mut [RecoveryStrategy]) {
    strategies.sort_by(|a, b| b.priority.cmp(&a.priority));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::error::ProviderError;
    use crate::ledger::MemoryLedger;
    use crate::models::{ProviderCapabilities, StrategyCondition};
    use crate::services::health_monitor::HealthMonitorSettings;
    use crate::testing::{ScriptedProbe, ScriptedProvider};
    use crate::utils::SystemClock;

    struct Fixture {
        yoco: Arc<ScriptedProvider>,
        registry: Arc<ProviderRegistry>,
        monitor: Arc<HealthMonitor>,
        engine: RecoveryEngine,
    }

    fn fixture() -> Fixture {
        let yoco = ScriptedProvider::arc("yoco");
        let mut registry = ProviderRegistry::new();
        registry
            .register(ScriptedProvider::arc("paystack"), ProviderCapabilities::new(["NGN", "ZAR"], ["NG", "ZA"]))
            .unwrap();
        registry
            .register(yoco.clone(), ProviderCapabilities::new(["ZAR"], ["ZA"]))
            .unwrap();
        let registry = Arc::new(registry);
        let monitor = Arc::new(HealthMonitor::new(
            registry.clone(),
            Arc::new(MemoryLedger::new()),
            Arc::new(SystemClock),
            HealthMonitorSettings {
                interval: Duration::from_secs(300),
                probe_timeout: Duration::from_secs(10),
                jitter: Duration::ZERO,
                healthy_latency_ms: 3_000,
                default_provider: "paystack".into(),
            },
        ));
        let engine = RecoveryEngine::new(registry.clone(), monitor.clone());
        Fixture {
            yoco,
            registry,
            monitor,
            engine,
        }
    }

    fn ctx<'a>(error: &'a ProviderError, attempt_number: u32) -> RecoveryContext<'a> {
        RecoveryContext {
            error,
            provider: "paystack",
            attempt_number,
            currency: Some("ZAR"),
            country: None,
        }
    }

    #[tokio::test]
    async fn gateway_error_switches_to_healthy_alternate() {
        let f = fixture();
        let err = ProviderError::new("GATEWAY_ERROR", "502");
        let decision = f.engine.decide(&ctx(&err, 1), &RetryConfig::default()).await;
        assert_eq!(decision.new_provider.as_deref(), Some("yoco"));
        assert_eq!(decision.strategy.as_deref(), Some("gateway_error_failover"));
        assert!(!decision.should_stop);
    }

    #[tokio::test]
    async fn switch_falls_through_when_alternate_is_unhealthy() {
        let f = fixture();
        f.yoco.set_default_probe(ScriptedProbe::Status(503));
        let err = ProviderError::new("GATEWAY_ERROR", "502");

        let decision = f.engine.decide(&ctx(&err, 1), &RetryConfig::default()).await;
        assert!(decision.new_provider.is_none());
        assert!(!decision.should_stop);

        let last = f.engine.decide(&ctx(&err, 3), &RetryConfig::default()).await;
        assert!(last.should_stop);
    }

    #[tokio::test]
    async fn switch_respects_disabled_fallback_and_currency() {
        let f = fixture();
        let err = ProviderError::new("NETWORK_ERROR", "reset");
        let config = RetryConfig {
            enable_provider_fallback: false,
            ..RetryConfig::default()
        };
        assert!(f.engine.decide(&ctx(&err, 1), &config).await.new_provider.is_none());

        let ngn = RecoveryContext {
            currency: Some("NGN"),
            ..ctx(&err, 1)
        };
        assert!(f.engine.decide(&ngn, &RetryConfig::default()).await.new_provider.is_none());
    }

    #[tokio::test]
    async fn rate_limits_delay_without_switching() {
        let f = fixture();
        let err = ProviderError::new("RATE_LIMITED", "429");
        let decision = f.engine.decide(&ctx(&err, 1), &RetryConfig::default()).await;
        assert_eq!(decision.delay, Some(Duration::from_secs(10)));
        assert!(decision.new_provider.is_none());
        assert!(!decision.should_stop);
    }

    #[tokio::test]
    async fn timeouts_retry_same_provider_only_early() {
        let f = fixture();
        let err = ProviderError::new("TIMEOUT", "slow");
        let config = RetryConfig {
            max_attempts: 6,
            ..RetryConfig::default()
        };
        let early = f.engine.decide(&ctx(&err, 3), &config).await;
        assert_eq!(early.strategy.as_deref(), Some("early_timeout_retry"));
        let late = f.engine.decide(&ctx(&err, 4), &config).await;
        assert_eq!(late.strategy, None);
        assert!(!late.should_stop);
    }

    #[tokio::test]
    async fn fraud_wins_over_other_matches_regardless_of_attempt() {
        let f = fixture();
        f.engine
            .configure(RecoveryStrategy::new(
                "gateway_message_switch",
                120,
                RecoveryAction::SwitchProvider,
                vec![StrategyCondition::new(ConditionField::ErrorMessage, ConditionOperator::Contains, "gateway")],
            ))
            .await
            .unwrap();

        let err = ProviderError::new("FRAUD_SUSPECTED", "gateway flagged this card");
        let decision = f.engine.decide(&ctx(&err, 1), &RetryConfig::default()).await;
        assert!(decision.should_stop && decision.manual_review);
        assert_eq!(decision.strategy.as_deref(), Some("fraud_manual_review"));
    }

    #[tokio::test]
    async fn fraud_goes_to_review_even_with_its_strategy_disabled() {
        let f = fixture();
        let mut fraud = f.engine.strategy("fraud_manual_review").unwrap();
        fraud.enabled = false;
        f.engine.configure(fraud).await.unwrap();

        let err = ProviderError::new("FRAUD_SUSPECTED", "blocked");
        let decision = f.engine.decide(&ctx(&err, 1), &RetryConfig::default()).await;
        assert!(decision.manual_review && decision.should_stop);
    }

    #[tokio::test]
    async fn equal_priority_ties_go_to_first_registered() {
        let f = fixture();
        let condition = || vec![StrategyCondition::new(ConditionField::ErrorCode, ConditionOperator::Equals, "E42")];
        f.engine
            .configure(RecoveryStrategy::new("first", 50, RecoveryAction::RetrySameProvider, condition()))
            .await
            .unwrap();
        f.engine
            .configure(RecoveryStrategy::new("second", 50, RecoveryAction::DelayRetry, condition()))
            .await
            .unwrap();

        let err = ProviderError::new("E42", "odd");
        let decision = f.engine.decide(&ctx(&err, 1), &RetryConfig::default()).await;
        assert_eq!(decision.strategy.as_deref(), Some("first"));

        f.engine
            .configure(RecoveryStrategy::new("second", 60, RecoveryAction::DelayRetry, condition()))
            .await
            .unwrap();
        let decision = f.engine.decide(&ctx(&err, 1), &RetryConfig::default()).await;
        assert_eq!(decision.strategy.as_deref(), Some("second"));
    }

    #[tokio::test]
    async fn unmatched_errors_continue_until_max_attempts() {
        let f = fixture();
        let err = ProviderError::new("E42", "odd");
        assert!(!f.engine.decide(&ctx(&err, 2), &RetryConfig::default()).await.should_stop);
        assert!(f.engine.decide(&ctx(&err, 3), &RetryConfig::default()).await.should_stop);
    }

    #[tokio::test]
    async fn rejects_invalid_strategies() {
        let f = fixture();
        let no_conditions = RecoveryStrategy::new("empty", 1, RecoveryAction::DelayRetry, vec![]);
        assert!(f.engine.configure(no_conditions).await.is_err());

        let bad_number = RecoveryStrategy::new(
            "bad",
            1,
            RecoveryAction::RetrySameProvider,
            vec![StrategyCondition::new(ConditionField::AttemptNumber, ConditionOperator::LessThan, "three")],
        );
        assert!(f.engine.configure(bad_number).await.is_err());

        let bad_target = RecoveryStrategy::new(
            "pinned",
            1,
            RecoveryAction::SwitchProvider,
            vec![StrategyCondition::new(ConditionField::ErrorCode, ConditionOperator::Contains, "X")],
        )
        .with_parameter("provider", "stripe");
        assert!(matches!(
            f.engine.configure(bad_target).await,
            Err(RouterError::InvalidStrategy(_))
        ));
    }

    #[tokio::test]
    async fn configured_strategies_survive_a_restart() {
        let f = fixture();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("strategies.json");

        let engine = RecoveryEngine::with_store(f.registry.clone(), f.monitor.clone(), path.clone())
            .await
            .unwrap();
        engine
            .configure(
                RecoveryStrategy::new(
                    "insufficient_funds_pause",
                    95,
                    RecoveryAction::DelayRetry,
                    vec![StrategyCondition::new(ConditionField::ErrorMessage, ConditionOperator::Contains, "insufficient")],
                )
                .with_parameter("delayMs", 60_000u64),
            )
            .await
            .unwrap();
        assert!(engine.remove("early_timeout_retry").await.unwrap());
        assert!(!engine.remove("early_timeout_retry").await.unwrap());

        let reloaded = RecoveryEngine::with_store(f.registry.clone(), f.monitor.clone(), path)
            .await
            .unwrap();
        assert_eq!(reloaded.strategies(), engine.strategies());
        assert_eq!(reloaded.strategy("insufficient_funds_pause").unwrap().delay_ms(), 60_000);
        assert!(reloaded.strategy("early_timeout_retry").is_none());
    }
}
