use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::app::config::Config;
use crate::app::error::RouterError;
use crate::services::health_monitor::HealthMonitor;
use crate::services::provider_registry::ProviderRegistry;

#[derive(Debug, Clone)]
pub struct SelectionRules {
    pub default_provider: String,
    pub home_currency: String,
    pub home_country: String,
    pub home_provider: String,
    pub currency_routes: BTreeMap<String, String>,
}

impl SelectionRules {
    pub fn from_config(config: &Config) -> Self {
        Self {
            default_provider: config.default_provider.clone(),
            home_currency: config.home_currency.clone(),
            home_country: config.home_country.clone(),
            home_provider: config.home_provider.clone(),
            currency_routes: config.currency_routes.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionReason {
    UserPreference,
    CurrencyRule,
    CountryRule,
    DefaultProvider,
    HealthScore,
    /// Nothing was usable; the default is tried anyway.
    DegradedDefault,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Selection {
    pub provider: String,
    pub reason: SelectionReason,
}

pub struct ProviderSelector {
    registry: Arc<ProviderRegistry>,
    monitor: Arc<HealthMonitor>,
    rules: SelectionRules,
}

impl ProviderSelector {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        monitor: Arc<HealthMonitor>,
        rules: SelectionRules,
    ) -> Result<Self, RouterError> {
        let referenced = [&rules.default_provider, &rules.home_provider]
            .into_iter()
            .chain(rules.currency_routes.values());
        for name in referenced {
            registry.get(name)?;
        }
        Ok(Self {
            registry,
            monitor,
            rules,
        })
    }

    /// Picks exactly one provider. Never refuses on health grounds.
    pub async fn select(
        &self,
        currency: Option<&str>,
        country: Option<&str>,
        preference: Option<&str>,
    ) -> Result<Selection, RouterError> {
        let currency = currency.map(str::to_ascii_uppercase);
        let country = country.map(str::to_ascii_uppercase);
        let (currency, country) = (currency.as_deref(), country.as_deref());

        if let Some(preferred) = preference {
            self.registry.get(preferred)?;
            if !self.registry.supports(preferred, currency, country) {
                warn!(
                    "Preferred provider {} does not support {:?}/{:?}, ignoring preference",
                    preferred, currency, country
                );
            } else if self.usable(preferred, currency, country).await {
                return Ok(self.chosen(preferred, SelectionReason::UserPreference));
            }
        }

        if let Some(currency) = currency {
            let routed = if currency == self.rules.home_currency {
                Some(self.rules.home_provider.as_str())
            } else {
                self.rules.currency_routes.get(currency).map(String::as_str)
            };
            if let Some(provider) = routed {
                if self.usable(provider, Some(currency), country).await {
                    return Ok(self.chosen(provider, SelectionReason::CurrencyRule));
                }
            }
        }

        if country == Some(self.rules.home_country.as_str()) {
            let provider = self.rules.home_provider.as_str();
            if self.usable(provider, currency, country).await {
                return Ok(self.chosen(provider, SelectionReason::CountryRule));
            }
        }

        if self.monitor.should_use_provider(&self.rules.default_provider).await {
            return Ok(self.chosen(&self.rules.default_provider, SelectionReason::DefaultProvider));
        }

        let recommendation = self.monitor.recommend(None, None).await;
        if self.monitor.should_use_provider(&recommendation.provider).await {
            return Ok(self.chosen(&recommendation.provider, SelectionReason::HealthScore));
        }

        warn!(
            "No healthy provider available, degrading to default {}",
            self.rules.default_provider
        );
        Ok(self.chosen(&self.rules.default_provider, SelectionReason::DegradedDefault))
    }

    async fn usable(&self, provider: &str, currency: Option<&str>, country: Option<&str>) -> bool {
        self.registry.supports(provider, currency, country)
            && self.monitor.should_use_provider(provider).await
    }

    fn chosen(&self, provider: &str, reason: SelectionReason) -> Selection {
        debug!("Selected provider {} ({:?})", provider, reason);
        Selection {
            provider: provider.to_string(),
            reason,
        }
    }
}
