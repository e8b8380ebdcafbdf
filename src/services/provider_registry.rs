use async_trait::async_trait;
use std::sync::Arc;

use crate::app::config::Config;
use crate::app::error::{ProviderError, RouterError, WebhookError};
use crate::models::{
    PaymentData, ProbeResponse, ProviderCapabilities, ProviderCharge, WebhookEvent, WebhookHeaders,
};
use crate::services::payment_processor_client::HttpProvider;

/// What the router needs from a payment provider adapter.
#[async_trait]
pub trait PaymentProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn attempt_payment(&self, payment: &PaymentData) -> Result<ProviderCharge, ProviderError>;

    /// Liveness call. Transport failures come back as `Err`.
    async fn probe(&self) -> Result<ProbeResponse, ProviderError>;

    fn verify_signature(&self, headers: &WebhookHeaders, body: &[u8]) -> bool;

    fn handle_webhook(&self, body: &[u8]) -> Result<WebhookEvent, WebhookError>;
}

#[derive(Clone)]
pub struct ProviderEntry {
    pub adapter: Arc<dyn PaymentProvider>,
    pub capabilities: ProviderCapabilities,
}

/// Explicitly constructed provider table, shared by every component.
/// Iteration follows registration order.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    entries: Vec<(String, ProviderEntry)>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &Config) -> Result<Self, RouterError> {
        let mut registry = Self::new();
        for settings in &config.providers {
            let adapter = HttpProvider::new(settings)?;
            let capabilities = ProviderCapabilities::new(&settings.currencies, &settings.countries);
            registry.register(Arc::new(adapter), capabilities)?;
        }
        Ok(registry)
    }

    pub fn register(
        &mut self,
        adapter: Arc<dyn PaymentProvider>,
        capabilities: ProviderCapabilities,
    ) -> Result<(), RouterError> {
        let name = adapter.name().to_string();
        if self.contains(&name) {
            return Err(RouterError::Config(format!("provider {} registered twice", name)));
        }
        self.entries.push((name, ProviderEntry { adapter, capabilities }));
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.iter().any(|(n, _)| n == name)
    }

    pub fn get(&self, name: &str) -> Result<&ProviderEntry, RouterError> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, entry)| entry)
            .ok_or_else(|| RouterError::UnknownProvider(name.to_string()))
    }

    pub fn adapter(&self, name: &str) -> Result<Arc<dyn PaymentProvider>, RouterError> {
        self.get(name).map(|entry| Arc::clone(&entry.adapter))
    }

    pub fn supports(&self, name: &str, currency: Option<&str>, country: Option<&str>) -> bool {
        self.get(name)
            .map(|entry| entry.capabilities.supports(currency, country))
            .unwrap_or(false)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(n, _)| n.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
