//! GOM and GOM instance handlers.

use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use megamodel_engine::{ExecuteRequest, GomDraft};
use megamodel_storage::{GomInstanceRecord, GomRecord};

use super::error::ApiResult;
use super::state::AppState;

/// GET /api/goms
pub(crate) async fn list_goms(
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<Vec<GomRecord>>> {
    Ok(Json(state.catalog.list_goms().await?))
}

/// POST /api/goms
pub(crate) async fn create_gom(
    State(state): State<Arc<AppState>>,
    body: Result<Json<GomDraft>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<GomRecord>)> {
    let Json(draft) = body?;
    let gom = state.catalog.create_gom(draft).await?;
    Ok((StatusCode::CREATED, Json(gom)))
}

/// GET /api/goms/{id}
pub(crate) async fn get_gom(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<GomRecord>> {
    Ok(Json(state.catalog.get_gom(&id).await?))
}

/// PUT /api/goms/{id}
pub(crate) async fn update_gom(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    body: Result<Json<GomDraft>, JsonRejection>,
) -> ApiResult<Json<GomRecord>> {
    let Json(draft) = body?;
    Ok(Json(state.catalog.update_gom(&id, draft).await?))
}

/// DELETE /api/goms/{id}
pub(crate) async fn delete_gom(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    state.catalog.delete_gom(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /api/goms/{id}/instances
///
/// Runs the instance to a terminal state before answering. A `FAILED`
/// instance is still a successful request; the failure is on the instance.
pub(crate) async fn execute_gom(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    body: Result<Json<ExecuteRequest>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<GomInstanceRecord>)> {
    let Json(request) = body?;
    let instance = state.orchestrator.execute(&id, request).await?;
    Ok((StatusCode::CREATED, Json(instance)))
}

/// GET /api/goms/{id}/instances
pub(crate) async fn list_instances(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Vec<GomInstanceRecord>>> {
    Ok(Json(state.orchestrator.list_instances(&id).await?))
}

/// GET /api/gom-instances/{id}
pub(crate) async fn get_instance(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<GomInstanceRecord>> {
    Ok(Json(state.orchestrator.get_instance(&id).await?))
}

/// DELETE /api/gom-instances/{id}
pub(crate) async fn delete_instance(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    state.orchestrator.delete_instance(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}
