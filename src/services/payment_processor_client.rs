use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hmac::{Hmac, Mac};
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};
use sha2::{Sha256, Sha512};
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

use crate::app::config::ProviderSettings;
use crate::app::error::{codes, ProviderError, RouterError, WebhookError};
use crate::models::{
    PaymentData, ProbeResponse, ProviderCharge, ProviderKind, WebhookEvent, WebhookHeaders,
    WebhookPaymentStatus,
};
use crate::services::provider_registry::PaymentProvider;

type HmacSha256 = Hmac<Sha256>;
type HmacSha512 = Hmac<Sha512>;

const PAYSTACK_SIGNATURE_HEADER: &str = "x-paystack-signature";
const YOCO_ID_HEADER: &str = "webhook-id";
const YOCO_TIMESTAMP_HEADER: &str = "webhook-timestamp";
const YOCO_SIGNATURE_HEADER: &str = "webhook-signature";

/// HTTP adapter for one provider. The wire dialect is picked by `kind`.
pub struct HttpProvider {
    name: String,
    kind: ProviderKind,
    base_url: Url,
    secret_key: String,
    webhook_secret: Option<String>,
    client: Client,
}

impl HttpProvider {
    pub fn new(settings: &ProviderSettings) -> Result<Self, RouterError> {
        // Callers bound each call more tightly; this is a backstop.
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .pool_max_idle_per_host(20)
            .pool_idle_timeout(Duration::from_secs(30))
            .tcp_keepalive(Duration::from_secs(60))
            .build()
            .map_err(|e| RouterError::Config(format!("HTTP client for {}: {}", settings.name, e)))?;

        Ok(Self {
            name: settings.name.clone(),
            kind: settings.kind,
            base_url: settings.base_url.clone(),
            secret_key: settings.secret_key.clone(),
            webhook_secret: settings.webhook_secret.clone(),
            client,
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url.as_str().trim_end_matches('/'), path)
    }

    fn charge_request(&self, payment: &PaymentData) -> (String, Value) {
        match self.kind {
            ProviderKind::Paystack => (
                self.endpoint("transaction/initialize"),
                json!({
                    "email": payment.email,
                    "amount": payment.amount,
                    "currency": payment.currency,
                    "reference": payment.reference,
                    "metadata": payment.metadata,
                }),
            ),
            ProviderKind::Yoco => {
                let mut metadata = payment.metadata.clone();
                metadata.insert("reference".into(), payment.reference.clone());
                (
                    self.endpoint("api/checkouts"),
                    json!({
                        "amount": payment.amount,
                        "currency": payment.currency,
                        "metadata": metadata,
                    }),
                )
            }
        }
    }

    fn probe_url(&self) -> String {
        match self.kind {
            ProviderKind::Paystack => self.endpoint("bank?perPage=1"),
            ProviderKind::Yoco => self.endpoint("api/webhooks"),
        }
    }

    fn parse_charge(&self, payment: &PaymentData, body: &Value) -> Result<ProviderCharge, ProviderError> {
        match self.kind {
            ProviderKind::Paystack => {
                if body.get("status").and_then(Value::as_bool) != Some(true) {
                    return Err(error_from_body(StatusCode::OK, body));
                }
                let data = body.get("data").cloned().unwrap_or(Value::Null);
                Ok(ProviderCharge {
                    provider: self.name.clone(),
                    provider_reference: str_field(&data, "reference")
                        .unwrap_or_else(|| payment.reference.clone()),
                    status: "initialized".into(),
                    amount: payment.amount,
                    fee: None,
                    authorization_url: str_field(&data, "authorization_url"),
                })
            }
            ProviderKind::Yoco => Ok(ProviderCharge {
                provider: self.name.clone(),
                provider_reference: str_field(body, "id").ok_or_else(|| {
                    ProviderError::new(codes::GATEWAY_ERROR, "checkout response without id")
                })?,
                status: str_field(body, "status").unwrap_or_else(|| "created".into()),
                amount: payment.amount,
                fee: None,
                authorization_url: str_field(body, "redirectUrl"),
            }),
        }
    }

    fn verify_paystack(&self, headers: &WebhookHeaders, body: &[u8]) -> bool {
        let Some(signature) = headers.get(PAYSTACK_SIGNATURE_HEADER) else {
            return false;
        };
        let Ok(expected) = hex::decode(signature.trim()) else {
            return false;
        };
        let Ok(mut mac) = <HmacSha512 as Mac>::new_from_slice(self.secret_key.as_bytes()) else {
            return false;
        };
        mac.update(body);
        mac.verify_slice(&expected).is_ok()
    }

    fn verify_yoco(&self, headers: &WebhookHeaders, body: &[u8]) -> bool {
        let (Some(id), Some(timestamp), Some(signatures)) = (
            headers.get(YOCO_ID_HEADER),
            headers.get(YOCO_TIMESTAMP_HEADER),
            headers.get(YOCO_SIGNATURE_HEADER),
        ) else {
            return false;
        };
        let Some(secret) = self.webhook_secret.as_deref() else {
            warn!("{} webhook received but no webhook secret is configured", self.name);
            return false;
        };
        let Ok(key) = BASE64.decode(secret.trim_start_matches("whsec_")) else {
            return false;
        };

        let mut signed = format!("{}.{}.", id, timestamp).into_bytes();
        signed.extend_from_slice(body);

        signatures
            .split_whitespace()
            .filter_map(|entry| entry.strip_prefix("v1,"))
            .filter_map(|sig| BASE64.decode(sig).ok())
            .any(|candidate| {
                <HmacSha256 as Mac>::new_from_slice(&key)
                    .map(|mut mac| {
                        mac.update(&signed);
                        mac.verify_slice(&candidate).is_ok()
                    })
                    .unwrap_or(false)
            })
    }
}

#[async_trait]
impl PaymentProvider for HttpProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn attempt_payment(&self, payment: &PaymentData) -> Result<ProviderCharge, ProviderError> {
        let (url, payload) = self.charge_request(payment);
        debug!("POST {} for payment {}", url, payment.reference);

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.secret_key)
            .header("Idempotency-Key", &payment.reference)
            .json(&payload)
            .send()
            .await
            .map_err(classify_transport)?;

        let status = response.status();
        let body: Value = response.json().await.unwrap_or(Value::Null);

        if status.is_success() {
            self.parse_charge(payment, &body)
        } else {
            Err(error_from_body(status, &body))
        }
    }

    async fn probe(&self) -> Result<ProbeResponse, ProviderError> {
        let response = self
            .client
            .get(self.probe_url())
            .bearer_auth(&self.secret_key)
            .send()
            .await
            .map_err(classify_transport)?;

        Ok(ProbeResponse {
            status_code: response.status().as_u16(),
        })
    }

    fn verify_signature(&self, headers: &WebhookHeaders, body: &[u8]) -> bool {
        match self.kind {
            ProviderKind::Paystack => self.verify_paystack(headers, body),
            ProviderKind::Yoco => self.verify_yoco(headers, body),
        }
    }

    fn handle_webhook(&self, body: &[u8]) -> Result<WebhookEvent, WebhookError> {
        let value: Value = serde_json::from_slice(body)
            .map_err(|e| WebhookError::MalformedPayload(e.to_string()))?;
        match self.kind {
            ProviderKind::Paystack => parse_paystack_event(&self.name, &value),
            ProviderKind::Yoco => parse_yoco_event(&self.name, &value),
        }
    }
}

fn str_field(value: &Value, key: &str) -> Option<String> {
    value.get(key).and_then(Value::as_str).map(String::from)
}

fn classify_transport(err: reqwest::Error) -> ProviderError {
    if err.is_timeout() {
        ProviderError::new(codes::TIMEOUT, err.to_string())
    } else if err.is_connect() || err.is_request() {
        ProviderError::new(codes::NETWORK_ERROR, err.to_string())
    } else {
        ProviderError::new(codes::GATEWAY_ERROR, err.to_string())
    }
}

fn error_from_body(status: StatusCode, body: &Value) -> ProviderError {
    let message = str_field(body, "message")
        .or_else(|| str_field(body, "description"))
        .unwrap_or_else(|| format!("HTTP {}", status));

    if status == StatusCode::TOO_MANY_REQUESTS {
        return ProviderError::new(codes::RATE_LIMITED, message);
    }
    if status.is_server_error() {
        return ProviderError::new(codes::GATEWAY_ERROR, message);
    }

    let lowered = message.to_ascii_lowercase();
    let code = if lowered.contains("fraud") {
        codes::FRAUD_SUSPECTED.to_string()
    } else if lowered.contains("amount") {
        codes::INVALID_AMOUNT.to_string()
    } else {
        str_field(body, "code").unwrap_or_else(|| codes::INVALID_REQUEST.to_string())
    };
    ProviderError::new(code, message)
}

fn parse_paystack_event(provider: &str, value: &Value) -> Result<WebhookEvent, WebhookError> {
    let event_type = str_field(value, "event")
        .ok_or_else(|| WebhookError::MalformedPayload("missing event".into()))?;
    let data = value
        .get("data")
        .ok_or_else(|| WebhookError::MalformedPayload("missing data".into()))?;
    let data_id = match data.get("id") {
        Some(Value::Number(n)) => n.to_string(),
        Some(Value::String(s)) => s.clone(),
        _ => return Err(WebhookError::MalformedPayload("missing data.id".into())),
    };

    let status = if event_type == "charge.success" {
        WebhookPaymentStatus::Succeeded
    } else if event_type.ends_with("failed") || str_field(data, "status").as_deref() == Some("failed") {
        WebhookPaymentStatus::Failed
    } else {
        WebhookPaymentStatus::Other
    };

    Ok(WebhookEvent {
        provider: provider.to_string(),
        event_id: format!("{}:{}", event_type, data_id),
        reference: str_field(data, "reference"),
        event_type,
        status,
    })
}

fn parse_yoco_event(provider: &str, value: &Value) -> Result<WebhookEvent, WebhookError> {
    let event_id = str_field(value, "id").ok_or_else(|| WebhookError::MalformedPayload("missing id".into()))?;
    let event_type = str_field(value, "type").unwrap_or_default();
    let reference = value
        .pointer("/payload/metadata/reference")
        .and_then(Value::as_str)
        .map(String::from);

    let status = match event_type.as_str() {
        "payment.succeeded" => WebhookPaymentStatus::Succeeded,
        "payment.failed" => WebhookPaymentStatus::Failed,
        _ => WebhookPaymentStatus::Other,
    };

    Ok(WebhookEvent {
        provider: provider.to_string(),
        event_id,
        event_type,
        reference,
        status,
    })
}
