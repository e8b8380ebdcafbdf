pub mod atomic_metrics;
pub mod health_monitor;
pub mod payment_processor_client;
pub mod provider_registry;
pub mod provider_selector;
pub mod recovery_engine;
pub mod retry_coordinator;
pub mod retry_statistics;
pub mod webhook_service;

pub use health_monitor::HealthMonitor;
pub use payment_processor_client::HttpProvider;
pub use provider_registry::{PaymentProvider, ProviderRegistry};
pub use provider_selector::ProviderSelector;
pub use recovery_engine::RecoveryEngine;
pub use retry_coordinator::{RecoveryReport, RetryCoordinator};
pub use retry_statistics::RetryAnalytics;
pub use webhook_service::WebhookService;
