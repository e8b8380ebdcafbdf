use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use super::ApiError;
use crate::app::state::AppState;
use crate::models::RecoveryStrategy;
use crate::services::retry_statistics::{RetryStatistics, RetrySystemHealth};

#[derive(Debug, Deserialize)]
pub struct StatisticsParams {
    #[serde(default = "default_hours")]
    pub hours: u64,
}

fn default_hours() -> u64 {
    24
}

pub async fn retry_statistics(
    State(state): State<Arc<AppState>>,
    Query(params): Query<StatisticsParams>,
) -> Result<Json<RetryStatistics>, ApiError> {
    let range = Duration::from_secs(params.hours.max(1).saturating_mul(3600));
    Ok(Json(state.analytics.statistics(range).await?))
}

pub async fn retry_system_health(
    State(state): State<Arc<AppState>>,
) -> Result<Json<RetrySystemHealth>, ApiError> {
    Ok(Json(state.analytics.system_health().await?))
}

pub async fn list_strategies(State(state): State<Arc<AppState>>) -> Json<Vec<RecoveryStrategy>> {
    Json(state.engine.strategies())
}

pub async fn configure_strategy(
    State(state): State<Arc<AppState>>,
    Json(strategy): Json<RecoveryStrategy>,
) -> Result<Json<Vec<RecoveryStrategy>>, ApiError> {
    info!("Configuring recovery strategy {}", strategy.name);
    state.engine.configure(strategy).await?;
    Ok(Json(state.engine.strategies()))
}

pub async fn remove_strategy(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<StatusCode, ApiError> {
    if state.engine.remove(&name).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::new(StatusCode::NOT_FOUND, format!("no strategy named {}", name)))
    }
}
