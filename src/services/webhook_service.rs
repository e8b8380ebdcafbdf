use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

use crate::app::error::{RouterError, WebhookError};
use crate::ledger::AttemptLedger;
use crate::models::{TransactionStatus, WebhookHeaders, WebhookPaymentStatus};
use crate::services::provider_registry::ProviderRegistry;
use crate::utils::Clock;

pub const PROVIDER_REPORTED_FAILURE: &str = "PROVIDER_REPORTED_FAILURE";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookOutcome {
    Applied,
    /// Same `(provider, event_id)` seen before; acknowledged, not applied.
    Duplicate,
    /// No transaction carries the event's reference.
    Unmatched,
    Ignored,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookReceipt {
    pub provider: String,
    pub event_id: String,
    pub event_type: String,
    pub outcome: WebhookOutcome,
    pub transaction_id: Option<String>,
}

pub struct WebhookService {
    registry: Arc<ProviderRegistry>,
    ledger: Arc<dyn AttemptLedger>,
    clock: Arc<dyn Clock>,
}

impl WebhookService {
    pub fn new(registry: Arc<ProviderRegistry>, ledger: Arc<dyn AttemptLedger>, clock: Arc<dyn Clock>) -> Self {
        Self {
            registry,
            ledger,
            clock,
        }
    }

    /// Verify, parse, dedupe, then reconcile the matching transaction.
    pub async fn handle(
        &self,
        provider: &str,
        headers: &WebhookHeaders,
        body: &[u8],
    ) -> Result<WebhookReceipt, WebhookError> {
        let adapter = self.registry.adapter(provider).map_err(|e| match e {
            RouterError::UnknownProvider(name) => WebhookError::UnknownProvider(name),
            other => WebhookError::Router(other),
        })?;

        if !adapter.verify_signature(headers, body) {
            warn!("Rejected {} webhook with a bad signature", provider);
            return Err(WebhookError::InvalidSignature);
        }
        let event = adapter.handle_webhook(body)?;

        let mut receipt = WebhookReceipt {
            provider: event.provider.clone(),
            event_id: event.event_id.clone(),
            event_type: event.event_type.clone(),
            outcome: WebhookOutcome::Ignored,
            transaction_id: None,
        };

        if !self
            .ledger
            .record_webhook_event(provider, &event.event_id, self.clock.now())
            .await?
        {
            info!("Duplicate {} webhook {}", provider, event.event_id);
            receipt.outcome = WebhookOutcome::Duplicate;
            return Ok(receipt);
        }

        let Some(reference) = event.reference.as_deref() else {
            return Ok(receipt);
        };
        let Some(mut transaction) = self.ledger.transaction_by_reference(reference).await? else {
            warn!("{} webhook {} references unknown payment {}", provider, event.event_id, reference);
            receipt.outcome = WebhookOutcome::Unmatched;
            return Ok(receipt);
        };
        receipt.transaction_id = Some(transaction.id.clone());

        let in_flight = !transaction.status.is_terminal();
        let applied = match event.status {
            // A running loop adopts this before its next attempt and stops.
            WebhookPaymentStatus::Succeeded if transaction.status != TransactionStatus::Succeeded => {
                transaction.status = TransactionStatus::Succeeded;
                transaction.provider = Some(event.provider.clone());
                transaction.error_code = None;
                transaction.error_message = None;
                true
            }
            // Failures of a payment still in its retry loop are the loop's to record.
            WebhookPaymentStatus::Failed if transaction.status == TransactionStatus::Succeeded => {
                transaction.status = TransactionStatus::FailedTerminal;
                transaction.error_code = Some(PROVIDER_REPORTED_FAILURE.to_string());
                transaction.error_message = Some(format!("{} reported {}", provider, event.event_type));
                true
            }
            _ => false,
        };

        if applied {
            transaction.updated_at = self.clock.now();
            self.ledger.upsert_transaction(&transaction).await?;
            info!(
                "{} webhook {} moved transaction {} to {:?}{}",
                provider,
                event.event_id,
                transaction.id,
                transaction.status,
                if in_flight { " while its retry loop is running" } else { "" }
            );
            receipt.outcome = WebhookOutcome::Applied;
        }
        Ok(receipt)
    }
}
