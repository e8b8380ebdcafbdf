use axum::{
    extract::{Path, Query, State},
    response::Json,
};
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;

use super::ApiError;
use crate::app::state::AppState;
use crate::models::{HealthCheckResult, ProviderHealthProfile};

pub async fn service_health(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(serde_json::json!({
        "status": "ok",
        "providers": state.registry.len(),
        "monitorRunning": state.monitor.is_running(),
        "activeRetryLoops": state.metrics.active_loops(),
    }))
}

pub async fn all_providers_health(State(state): State<Arc<AppState>>) -> Json<Vec<ProviderHealthProfile>> {
    Json(state.monitor.get_all_providers_health().await)
}

pub async fn provider_health(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let profile = state.monitor.get_health(&name).await?;
    Ok(Json(serde_json::json!({
        "profile": profile,
        "usable": state.monitor.should_use_provider(&name).await,
        "score": profile.composite_score(),
    })))
}

#[derive(Debug, Deserialize)]
pub struct HealthCheckParams {
    pub provider: Option<String>,
}

pub async fn force_health_check(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HealthCheckParams>,
) -> Result<Json<Vec<HealthCheckResult>>, ApiError> {
    let results = state
        .monitor
        .force_health_check(params.provider.as_deref())
        .await?;
    Ok(Json(results))
}
