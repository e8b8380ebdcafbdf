use axum::{
    body::Bytes,
    extract::{Path, State},
    http::HeaderMap,
    response::Json,
};
use std::sync::Arc;

use super::ApiError;
use crate::app::state::AppState;
use crate::models::WebhookHeaders;
use crate::services::webhook_service::WebhookReceipt;

pub async fn receive_webhook(
    State(state): State<Arc<AppState>>,
    Path(provider): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookReceipt>, ApiError> {
    let headers: WebhookHeaders = headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
        })
        .collect();

    let receipt = state.webhooks.handle(&provider, &headers, &body).await?;
    Ok(Json(receipt))
}
