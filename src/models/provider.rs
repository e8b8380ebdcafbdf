use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

/// Which wire dialect an HTTP adapter speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    Paystack,
    Yoco,
}

/// Currencies and countries a provider accepts. Codes are stored upper-case.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderCapabilities {
    pub currencies: BTreeSet<String>,
    pub countries: BTreeSet<String>,
}

impl ProviderCapabilities {
    pub fn new<C, K>(currencies: C, countries: K) -> Self
    where
        C: IntoIterator,
        C::Item: AsRef<str>,
        K: IntoIterator,
        K::Item: AsRef<str>,
    {
        Self {
            currencies: currencies
                .into_iter()
                .map(|c| c.as_ref().to_ascii_uppercase())
                .collect(),
            countries: countries
                .into_iter()
                .map(|c| c.as_ref().to_ascii_uppercase())
                .collect(),
        }
    }

    /// Missing request fields are treated as compatible.
    pub fn supports(&self, currency: Option<&str>, country: Option<&str>) -> bool {
        let currency_ok = currency
            .map(|c| self.currencies.contains(&c.to_ascii_uppercase()))
            .unwrap_or(true);
        let country_ok = country
            .map(|c| self.countries.contains(&c.to_ascii_uppercase()))
            .unwrap_or(true);
        currency_ok && country_ok
    }
}

/// Raw response of a liveness call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeResponse {
    pub status_code: u16,
}

impl ProbeResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }
}

/// Lower-cased header name to value.
pub type WebhookHeaders = HashMap<String, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookPaymentStatus {
    Succeeded,
    Failed,
    Other,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookEvent {
    pub provider: String,
    pub event_id: String,
    pub event_type: String,
    pub reference: Option<String>,
    pub status: WebhookPaymentStatus,
}
