//! Health, fallback and catalog handlers.

use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use megamodel_engine::{ComponentDraft, ErrorKind, MicroserviceDraft};
use megamodel_storage::{ComponentRecord, MicroserviceRecord};

use super::error::ApiResult;
use super::json_error;
use super::state::AppState;

/// Fallback handler for unmatched routes.
pub(crate) async fn handle_not_found() -> impl IntoResponse {
    json_error(StatusCode::NOT_FOUND, ErrorKind::NotFound, "not found")
}

/// GET /health
pub(crate) async fn handle_health() -> impl IntoResponse {
    let response = serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    });
    (StatusCode::OK, Json(response))
}

// ──────────────────────────────────────────────
// Components
// ──────────────────────────────────────────────

/// GET /api/components
pub(crate) async fn list_components(
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<Vec<ComponentRecord>>> {
    Ok(Json(state.catalog.list_components().await?))
}

/// POST /api/components
pub(crate) async fn create_component(
    State(state): State<Arc<AppState>>,
    body: Result<Json<ComponentDraft>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<ComponentRecord>)> {
    let Json(draft) = body?;
    let record = state.catalog.create_component(draft).await?;
    Ok((StatusCode::CREATED, Json(record)))
}

/// GET /api/components/{id}
pub(crate) async fn get_component(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<ComponentRecord>> {
    Ok(Json(state.catalog.get_component(&id).await?))
}

/// PUT /api/components/{id}
pub(crate) async fn update_component(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    body: Result<Json<ComponentDraft>, JsonRejection>,
) -> ApiResult<Json<ComponentRecord>> {
    let Json(draft) = body?;
    Ok(Json(state.catalog.update_component(&id, draft).await?))
}

/// DELETE /api/components/{id}
pub(crate) async fn delete_component(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    state.catalog.delete_component(&id).await?;
    state.engine.forget_component(&id).await;
    Ok(StatusCode::NO_CONTENT)
}

// ──────────────────────────────────────────────
// Microservices
// ──────────────────────────────────────────────

/// GET /api/microservices
pub(crate) async fn list_microservices(
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<Vec<MicroserviceRecord>>> {
    Ok(Json(state.catalog.list_microservices().await?))
}

/// POST /api/microservices
pub(crate) async fn create_microservice(
    State(state): State<Arc<AppState>>,
    body: Result<Json<MicroserviceDraft>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<MicroserviceRecord>)> {
    let Json(draft) = body?;
    let record = state.catalog.create_microservice(draft).await?;
    Ok((StatusCode::CREATED, Json(record)))
}

/// GET /api/microservices/{id}
pub(crate) async fn get_microservice(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<MicroserviceRecord>> {
    Ok(Json(state.catalog.get_microservice(&id).await?))
}

/// PUT /api/microservices/{id}
pub(crate) async fn update_microservice(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    body: Result<Json<MicroserviceDraft>, JsonRejection>,
) -> ApiResult<Json<MicroserviceRecord>> {
    let Json(draft) = body?;
    Ok(Json(state.catalog.update_microservice(&id, draft).await?))
}

/// DELETE /api/microservices/{id}
pub(crate) async fn delete_microservice(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    state.catalog.delete_microservice(&id).await?;
    state.engine.forget_microservice(&id).await;
    Ok(StatusCode::NO_CONTENT)
}
