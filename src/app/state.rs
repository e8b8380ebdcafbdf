use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::config::Config;
use super::error::RouterError;
use crate::ledger::{AttemptLedger, MemoryLedger};
use crate::services::atomic_metrics::RetryMetrics;
use crate::services::health_monitor::{HealthMonitor, HealthMonitorSettings};
use crate::services::provider_registry::ProviderRegistry;
use crate::services::provider_selector::{ProviderSelector, SelectionRules};
use crate::services::recovery_engine::RecoveryEngine;
use crate::services::retry_coordinator::{CoordinatorSettings, RetryCoordinator};
use crate::services::retry_statistics::RetryAnalytics;
use crate::services::webhook_service::WebhookService;
use crate::utils::{Clock, SystemClock};

/// Everything the handlers need, constructed once and shared.
pub struct AppState {
    pub config: Config,
    pub registry: Arc<ProviderRegistry>,
    pub ledger: Arc<dyn AttemptLedger>,
    pub clock: Arc<dyn Clock>,
    pub monitor: Arc<HealthMonitor>,
    pub selector: Arc<ProviderSelector>,
    pub engine: Arc<RecoveryEngine>,
    pub coordinator: Arc<RetryCoordinator>,
    pub analytics: Arc<RetryAnalytics>,
    pub webhooks: Arc<WebhookService>,
    pub metrics: Arc<RetryMetrics>,
    /// Cancelled on shutdown; every retry loop runs under a child token.
    pub shutdown: CancellationToken,
}

impl AppState {
    /// Production wiring: HTTP adapters from `config`, in-memory ledger,
    /// wall clock.
    pub async fn build(config: Config) -> Result<Self, RouterError> {
        let registry = Arc::new(ProviderRegistry::from_config(&config)?);
        Self::assemble(config, registry, Arc::new(MemoryLedger::new()), Arc::new(SystemClock)).await
    }

    pub async fn assemble(
        config: Config,
        registry: Arc<ProviderRegistry>,
        ledger: Arc<dyn AttemptLedger>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, RouterError> {
        let shutdown = CancellationToken::new();
        let metrics = Arc::new(RetryMetrics::new());

        let monitor = Arc::new(HealthMonitor::new(
            registry.clone(),
            ledger.clone(),
            clock.clone(),
            HealthMonitorSettings::from_config(&config),
        ));
        let selector = Arc::new(ProviderSelector::new(
            registry.clone(),
            monitor.clone(),
            SelectionRules::from_config(&config),
        )?);

        let engine = Arc::new(match &config.strategy_file {
            Some(path) => RecoveryEngine::with_store(registry.clone(), monitor.clone(), path.clone()).await?,
            None => RecoveryEngine::new(registry.clone(), monitor.clone()),
        });

        let coordinator = Arc::new(RetryCoordinator::new(
            registry.clone(),
            monitor.clone(),
            selector.clone(),
            engine.clone(),
            ledger.clone(),
            clock.clone(),
            metrics.clone(),
            CoordinatorSettings::from_config(&config),
            shutdown.clone(),
        ));
        let analytics = Arc::new(RetryAnalytics::new(
            ledger.clone(),
            engine.clone(),
            metrics.clone(),
            clock.clone(),
            config.recovery_retry_ceiling,
        ));
        let webhooks = Arc::new(WebhookService::new(registry.clone(), ledger.clone(), clock.clone()));

        info!(
            "Router ready with {} providers and {} recovery strategies",
            registry.len(),
            engine.strategies().len()
        );

        Ok(Self {
            config,
            registry,
            ledger,
            clock,
            monitor,
            selector,
            engine,
            coordinator,
            analytics,
            webhooks,
            metrics,
            shutdown,
        })
    }

    /// Stops health probing and cancels every in-flight retry loop.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.monitor.shutdown().await;
        info!("Router shut down");
    }
}
