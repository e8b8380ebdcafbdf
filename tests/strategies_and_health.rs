use std::time::Duration;

use payment_failover::app::error::codes;
use payment_failover::models::{
    ConditionField, ConditionOperator, RecoveryAction, RecoveryStrategy, StrategyCondition,
};
use payment_failover::services::retry_statistics::SystemStatus;
use payment_failover::testing::{payment, test_config, Harness, ScriptedAttempt};

fn insufficient_funds_review() -> RecoveryStrategy {
    RecoveryStrategy::new(
        "insufficient_funds_review",
        200,
        RecoveryAction::ManualReview,
        vec![StrategyCondition::new(
            ConditionField::ErrorMessage,
            ConditionOperator::Contains,
            "insufficient",
        )],
    )
}

#[tokio::test]
async fn configured_strategy_is_visible_without_restart() {
    let h = Harness::new().await;
    tokio_test::assert_ok!(h.state.engine.configure(insufficient_funds_review()).await);

    let health = h.state.analytics.system_health().await.unwrap();
    assert_eq!(health.strategies[0].name, "insufficient_funds_review");
    assert_eq!(health.strategies[0].priority, 200);

    let mut disabled = insufficient_funds_review();
    disabled.enabled = false;
    h.state.engine.configure(disabled).await.unwrap();
    let health = h.state.analytics.system_health().await.unwrap();
    assert!(health.strategies.iter().all(|s| s.name != "insufficient_funds_review"));
}

#[tokio::test(start_paused = true)]
async fn configured_strategy_changes_loop_behaviour() {
    let h = Harness::new().await;
    h.state.engine.configure(insufficient_funds_review()).await.unwrap();
    h.paystack
        .push_attempt(ScriptedAttempt::fail(codes::GATEWAY_ERROR, "insufficient liquidity at acquirer"));

    let outcome = h
        .state
        .coordinator
        .run(payment("ifr-1", "ZAR"), Some("paystack"), None)
        .await
        .unwrap();
    assert_eq!(outcome.attempts.len(), 1);
    assert_eq!(
        outcome.recovery.and_then(|d| d.strategy).as_deref(),
        Some("insufficient_funds_review")
    );
}

#[tokio::test]
async fn strategies_persist_across_restarts() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config();
    config.strategy_file = Some(dir.path().join("strategies.json"));

    let before = Harness::with_config(config.clone()).await;
    before.state.engine.configure(insufficient_funds_review()).await.unwrap();

    let after = Harness::with_config(config).await;
    assert!(after.state.engine.strategy("insufficient_funds_review").is_some());
    assert_eq!(after.state.engine.strategies(), before.state.engine.strategies());
}

#[tokio::test(start_paused = true)]
async fn statistics_and_system_health_reflect_traffic() {
    let h = Harness::new().await;
    assert_eq!(
        h.state.analytics.system_health().await.unwrap().status,
        SystemStatus::Healthy
    );

    h.paystack
        .push_attempt(ScriptedAttempt::fail(codes::TIMEOUT, "slow"))
        .push_attempt(ScriptedAttempt::fail(codes::INVALID_REQUEST, "declined"))
        .push_attempt(ScriptedAttempt::fail(codes::INVALID_REQUEST, "declined"));
    for reference in ["st-1", "st-2", "st-3"] {
        h.state
            .coordinator
            .run(payment(reference, "NGN"), None, None)
            .await
            .unwrap();
    }

    let stats = h
        .state
        .analytics
        .statistics(Duration::from_secs(3600))
        .await
        .unwrap();
    assert_eq!(stats.total_transactions, 3);
    assert_eq!(stats.total_attempts, 4);
    assert_eq!(stats.successful_transactions, 1);
    assert_eq!(stats.recovered_after_retry, 1);
    assert_eq!(stats.error_codes[codes::INVALID_REQUEST], 2);

    let health = h.state.analytics.system_health().await.unwrap();
    assert_eq!(health.status, SystemStatus::Critical);
    assert_eq!(health.queue_backlog, 2);
    assert_eq!(health.active_retry_loops, 0);
    assert!(!health.issues.is_empty());
}
