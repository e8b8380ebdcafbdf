pub mod health;
pub mod payments;
pub mod retry;
pub mod webhooks;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{delete, get, post},
    Router,
};
use std::sync::Arc;
use tracing::error;

use crate::app::error::{RouterError, WebhookError};
use crate::app::state::AppState;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health::service_health))
        .route("/payments", post(payments::create_payment))
        .route("/payments/recover", post(payments::recover_payments))
        .route("/manual-review", get(payments::manual_review_queue))
        .route("/providers/health", get(health::all_providers_health))
        .route("/providers/health-check", post(health::force_health_check))
        .route("/providers/:name/health", get(health::provider_health))
        .route("/retry/statistics", get(retry::retry_statistics))
        .route("/retry/health", get(retry::retry_system_health))
        .route(
            "/retry/strategies",
            get(retry::list_strategies).put(retry::configure_strategy),
        )
        .route("/retry/strategies/:name", delete(retry::remove_strategy))
        .route("/webhooks/:provider", post(webhooks::receive_webhook))
        .with_state(state)
}

/// Error body `{"error": ...}` with a status derived from the failure kind.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(serde_json::json!({ "error": self.message }))).into_response()
    }
}

impl From<RouterError> for ApiError {
    fn from(err: RouterError) -> Self {
        let status = match &err {
            RouterError::UnknownProvider(_) => StatusCode::NOT_FOUND,
            RouterError::InvalidStrategy(_) | RouterError::InvalidRetryConfig(_) => StatusCode::BAD_REQUEST,
            RouterError::Config(_)
            | RouterError::Ledger(_)
            | RouterError::Persistence(_)
            | RouterError::Serialization(_) => {
                error!("Request failed: {}", err);
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        ApiError::new(status, err.to_string())
    }
}

impl From<WebhookError> for ApiError {
    fn from(err: WebhookError) -> Self {
        match err {
            WebhookError::UnknownProvider(_) => ApiError::new(StatusCode::NOT_FOUND, err.to_string()),
            WebhookError::InvalidSignature => ApiError::new(StatusCode::UNAUTHORIZED, err.to_string()),
            WebhookError::MalformedPayload(_) => ApiError::new(StatusCode::BAD_REQUEST, err.to_string()),
            WebhookError::Router(inner) => inner.into(),
        }
    }
}
