use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::Json,
};
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

use super::ApiError;
use crate::app::state::AppState;
use crate::ledger::AttemptLedger;
use crate::models::{ManualReviewItem, PaymentRequest, RetryOutcome};
use crate::services::retry_coordinator::RecoveryReport;

pub async fn create_payment(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<Value>,
) -> Result<Json<RetryOutcome>, ApiError> {
    let request: PaymentRequest = serde_json::from_value(payload).map_err(|e| {
        error!("Invalid payment request: {}", e);
        ApiError::new(StatusCode::BAD_REQUEST, e.to_string())
    })?;

    info!(
        "Received payment {} for {} {}",
        request.payment.reference, request.payment.amount, request.payment.currency
    );

    // A dropped request cancels the loop, which still closes out its records.
    let cancel = state.shutdown.child_token();
    let _disconnect = cancel.clone().drop_guard();
    let coordinator = state.coordinator.clone();
    let run = tokio::spawn(async move {
        coordinator
            .run_with_cancel(
                request.payment,
                request.preferred_provider.as_deref(),
                request.retry_config,
                &cancel,
            )
            .await
    });

    let outcome = run.await.map_err(|e| {
        error!("Retry loop task failed: {}", e);
        ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "retry loop aborted")
    })??;
    Ok(Json(outcome))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoverParams {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_age_hours")]
    pub max_age_hours: u64,
}

fn default_batch_size() -> usize {
    50
}

fn default_max_age_hours() -> u64 {
    24
}

pub async fn recover_payments(
    State(state): State<Arc<AppState>>,
    Query(params): Query<RecoverParams>,
) -> Result<Json<RecoveryReport>, ApiError> {
    let max_age = Duration::from_secs(params.max_age_hours.saturating_mul(3600));
    let report = state
        .coordinator
        .recover_failed_payments(params.batch_size, max_age)
        .await?;
    Ok(Json(report))
}

pub async fn manual_review_queue(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<ManualReviewItem>>, ApiError> {
    Ok(Json(state.ledger.manual_review_queue().await?))
}
