//! Observability feeds.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::extract::rejection::QueryRejection;
use axum::extract::{Query, State};
use axum::Json;
use megamodel_engine::ActivityEntry;
use megamodel_storage::{CoherenceState, TransitionRecord};
use serde::Deserialize;

use super::error::ApiResult;
use super::state::AppState;

#[derive(Debug, Deserialize)]
pub(crate) struct LimitQuery {
    pub limit: Option<usize>,
}

/// GET /api/metrics/state-distribution
pub(crate) async fn state_distribution(
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<BTreeMap<CoherenceState, u64>>> {
    Ok(Json(state.metrics.state_distribution().await?))
}

/// GET /api/metrics/total-operations
pub(crate) async fn total_operations(State(state): State<Arc<AppState>>) -> ApiResult<Json<u64>> {
    Ok(Json(state.metrics.total_operations().await?))
}

/// GET /api/metrics/transition-counts
pub(crate) async fn transition_counts(
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<BTreeMap<CoherenceState, u64>>> {
    Ok(Json(state.metrics.transition_counts().await?))
}

/// GET /api/metrics/recent-transitions?limit=
pub(crate) async fn recent_transitions(
    State(state): State<Arc<AppState>>,
    query: Result<Query<LimitQuery>, QueryRejection>,
) -> ApiResult<Json<Vec<TransitionRecord>>> {
    let Query(query) = query?;
    Ok(Json(state.metrics.recent_transitions(query.limit).await?))
}

/// GET /api/metrics/component-logs?limit=
pub(crate) async fn component_logs(
    State(state): State<Arc<AppState>>,
    query: Result<Query<LimitQuery>, QueryRejection>,
) -> ApiResult<Json<Vec<ActivityEntry>>> {
    let Query(query) = query?;
    Ok(Json(state.metrics.component_logs(query.limit).await?))
}
