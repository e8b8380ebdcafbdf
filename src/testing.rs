//! In-memory provider double for exercising the router without live
//! payment providers.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::app::config::Config;
use crate::app::error::{ProviderError, WebhookError};
use crate::app::state::AppState;
use crate::ledger::MemoryLedger;
use crate::models::{
    PaymentData, ProbeResponse, ProviderCapabilities, ProviderCharge, WebhookEvent, WebhookHeaders,
    WebhookPaymentStatus,
};
use crate::services::provider_registry::{PaymentProvider, ProviderRegistry};
use crate::utils::SystemClock;

#[derive(Debug, Clone)]
pub enum ScriptedAttempt {
    Succeed,
    Fail { code: String, message: String },
    /// Never answers; only a timeout or cancellation ends the call.
    Hang,
}

impl ScriptedAttempt {
    pub fn fail(code: &str, message: &str) -> Self {
        ScriptedAttempt::Fail {
            code: code.to_string(),
            message: message.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub enum ScriptedProbe {
    Status(u16),
    Slow { status: u16, delay: Duration },
    TransportError(String),
}

/// Replays queued outcomes, then falls back to the configured defaults.
/// Webhooks carry a shared-secret header `x-test-signature` and a JSON body
/// `{"id", "type", "reference"}`.
pub struct ScriptedProvider {
    name: String,
    attempts: Mutex<VecDeque<ScriptedAttempt>>,
    default_attempt: Mutex<ScriptedAttempt>,
    probes: Mutex<VecDeque<ScriptedProbe>>,
    default_probe: Mutex<ScriptedProbe>,
    attempt_calls: AtomicU32,
    probe_calls: AtomicU32,
    webhook_secret: String,
}

impl ScriptedProvider {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            attempts: Mutex::new(VecDeque::new()),
            default_attempt: Mutex::new(ScriptedAttempt::Succeed),
            probes: Mutex::new(VecDeque::new()),
            default_probe: Mutex::new(ScriptedProbe::Status(200)),
            attempt_calls: AtomicU32::new(0),
            probe_calls: AtomicU32::new(0),
            webhook_secret: format!("{}-secret", name),
        }
    }

    pub fn arc(name: &str) -> Arc<Self> {
        Arc::new(Self::new(name))
    }

    pub fn push_attempt(&self, outcome: ScriptedAttempt) -> &Self {
        self.attempts.lock().push_back(outcome);
        self
    }

    pub fn set_default_attempt(&self, outcome: ScriptedAttempt) {
        *self.default_attempt.lock() = outcome;
    }

    pub fn push_probe(&self, probe: ScriptedProbe) -> &Self {
        self.probes.lock().push_back(probe);
        self
    }

    pub fn set_default_probe(&self, probe: ScriptedProbe) {
        *self.default_probe.lock() = probe;
    }

    pub fn attempt_calls(&self) -> u32 {
        self.attempt_calls.load(Ordering::SeqCst)
    }

    pub fn probe_calls(&self) -> u32 {
        self.probe_calls.load(Ordering::SeqCst)
    }

    pub fn webhook_secret(&self) -> &str {
        &self.webhook_secret
    }
}

#[async_trait]
impl PaymentProvider for ScriptedProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn attempt_payment(&self, payment: &PaymentData) -> Result<ProviderCharge, ProviderError> {
        self.attempt_calls.fetch_add(1, Ordering::SeqCst);
        let next = self
            .attempts
            .lock()
            .pop_front()
            .unwrap_or_else(|| self.default_attempt.lock().clone());

        match next {
            ScriptedAttempt::Succeed => Ok(ProviderCharge {
                provider: self.name.clone(),
                provider_reference: format!("{}-{}", self.name, payment.reference),
                status: "success".into(),
                amount: payment.amount,
                fee: Some(payment.amount / 100),
                authorization_url: None,
            }),
            ScriptedAttempt::Fail { code, message } => Err(ProviderError::new(code, message)),
            ScriptedAttempt::Hang => futures::future::pending().await,
        }
    }

    async fn probe(&self) -> Result<ProbeResponse, ProviderError> {
        self.probe_calls.fetch_add(1, Ordering::SeqCst);
        let next = self
            .probes
            .lock()
            .pop_front()
            .unwrap_or_else(|| self.default_probe.lock().clone());

        match next {
            ScriptedProbe::Status(status_code) => Ok(ProbeResponse { status_code }),
            ScriptedProbe::Slow { status, delay } => {
                tokio::time::sleep(delay).await;
                Ok(ProbeResponse { status_code: status })
            }
            ScriptedProbe::TransportError(message) => {
                Err(ProviderError::new("NETWORK_ERROR", message))
            }
        }
    }

    fn verify_signature(&self, headers: &WebhookHeaders, _body: &[u8]) -> bool {
        headers.get("x-test-signature").map(String::as_str) == Some(self.webhook_secret.as_str())
    }

    fn handle_webhook(&self, body: &[u8]) -> Result<WebhookEvent, WebhookError> {
        let value: serde_json::Value = serde_json::from_slice(body)
            .map_err(|e| WebhookError::MalformedPayload(e.to_string()))?;
        let field = |key: &str| value.get(key).and_then(|v| v.as_str()).map(String::from);

        let event_id = field("id").ok_or_else(|| WebhookError::MalformedPayload("missing id".into()))?;
        let event_type = field("type").unwrap_or_default();
        let status = match event_type.as_str() {
            "payment.succeeded" => WebhookPaymentStatus::Succeeded,
            "payment.failed" => WebhookPaymentStatus::Failed,
            _ => WebhookPaymentStatus::Other,
        };

        Ok(WebhookEvent {
            provider: self.name.clone(),
            event_id,
            event_type,
            reference: field("reference"),
            status,
        })
    }
}

/// Router settings for the scripted two-provider setup: paystack is the
/// default and home (NGN/NG) provider, ZAR routes to yoco.
pub fn test_config() -> Config {
    Config {
        server_port: 0,
        default_provider: "paystack".into(),
        home_currency: "NGN".into(),
        home_country: "NG".into(),
        home_provider: "paystack".into(),
        currency_routes: [("ZAR".to_string(), "yoco".to_string())].into_iter().collect(),
        health_check_interval_secs: 300,
        health_check_timeout_ms: 10_000,
        health_check_jitter_ms: 0,
        attempt_timeout_ms: 10_000,
        strategy_file: None,
        recovery_max_attempts: 2,
        recovery_retry_ceiling: 5,
        providers: Vec::new(),
    }
}

pub fn payment(reference: &str, currency: &str) -> PaymentData {
    PaymentData {
        reference: reference.to_string(),
        amount: 250_000,
        currency: currency.to_string(),
        country: None,
        email: "customer@example.com".into(),
        metadata: Default::default(),
    }
}

/// Fully wired [`AppState`] over two scripted providers and an in-memory
/// ledger. Panics on wiring errors.
pub struct Harness {
    pub paystack: Arc<ScriptedProvider>,
    pub yoco: Arc<ScriptedProvider>,
    pub state: AppState,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_config(test_config()).await
    }

    pub async fn with_config(config: Config) -> Self {
        let paystack = ScriptedProvider::arc("paystack");
        let yoco = ScriptedProvider::arc("yoco");

        let mut registry = ProviderRegistry::new();
        registry
            .register(paystack.clone(), ProviderCapabilities::new(["NGN", "GHS", "ZAR", "USD"], ["NG", "GH", "ZA"]))
            .expect("paystack registers");
        registry
            .register(yoco.clone(), ProviderCapabilities::new(["ZAR"], ["ZA"]))
            .expect("yoco registers");

        let state = AppState::assemble(
            config,
            Arc::new(registry),
            Arc::new(MemoryLedger::new()),
            Arc::new(SystemClock),
        )
        .await
        .expect("harness wiring");

        Self { paystack, yoco, state }
    }
}
