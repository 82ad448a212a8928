//! Coherence table and read/write operation handlers.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::Json;
use megamodel_engine::{OperationReport, OperationRequest};
use megamodel_storage::{CoherenceRecord, CoherenceState, ConsistencyType, StateKey};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use super::error::ApiResult;
use super::state::AppState;

#[derive(Debug, Serialize)]
pub(crate) struct NamedRef {
    pub id: String,
    pub name: String,
}

/// A coherence row joined with its microservice and component.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct StateView {
    pub id: u64,
    pub microservice: NamedRef,
    pub component_model: NamedRef,
    pub state: CoherenceState,
    pub consistency_type: ConsistencyType,
    pub version: u64,
    pub revision: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub staleness_bound: Option<u64>,
}

impl StateView {
    fn new(row: CoherenceRecord, microservice_name: String, component_name: String) -> Self {
        Self {
            id: row.id,
            microservice: NamedRef {
                id: row.microservice_id,
                name: microservice_name,
            },
            component_model: NamedRef {
                id: row.component_id,
                name: component_name,
            },
            state: row.state,
            consistency_type: row.consistency_type,
            version: row.version,
            revision: row.revision,
            timestamp: row.timestamp,
            staleness_bound: row.staleness_bound_ms,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ListQuery {
    pub component_id: Option<String>,
}

/// GET /api/states
pub(crate) async fn list_states(
    State(state): State<Arc<AppState>>,
    query: Result<Query<ListQuery>, QueryRejection>,
) -> ApiResult<Json<Vec<StateView>>> {
    let Query(query) = query?;
    let rows = state.engine.list_states(query.component_id.as_deref()).await?;
    let microservices: HashMap<String, String> = state
        .catalog
        .list_microservices()
        .await?
        .into_iter()
        .map(|m| (m.id, m.name))
        .collect();
    let components: HashMap<String, String> = state
        .catalog
        .list_components()
        .await?
        .into_iter()
        .map(|c| (c.id, c.name))
        .collect();

    let views = rows
        .into_iter()
        .map(|row| {
            let ms = microservices
                .get(&row.microservice_id)
                .cloned()
                .unwrap_or_default();
            let comp = components
                .get(&row.component_id)
                .cloned()
                .unwrap_or_default();
            StateView::new(row, ms, comp)
        })
        .collect();
    Ok(Json(views))
}

async fn view(state: &AppState, row: CoherenceRecord) -> ApiResult<StateView> {
    let ms = state.catalog.get_microservice(&row.microservice_id).await?;
    let comp = state.catalog.get_component(&row.component_id).await?;
    Ok(StateView::new(row, ms.name, comp.name))
}

/// GET /api/states/{microserviceId}/{componentId}
pub(crate) async fn get_state(
    State(state): State<Arc<AppState>>,
    Path((microservice_id, component_id)): Path<(String, String)>,
) -> ApiResult<Json<StateView>> {
    let row = state
        .engine
        .get_state(&StateKey::new(microservice_id, component_id))
        .await?;
    Ok(Json(view(&state, row).await?))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ConfigureBody {
    pub consistency_type: ConsistencyType,
    pub staleness_bound: Option<u64>,
}

/// PUT /api/states/{microserviceId}/{componentId}
pub(crate) async fn configure_state(
    State(state): State<Arc<AppState>>,
    Path((microservice_id, component_id)): Path<(String, String)>,
    body: Result<Json<ConfigureBody>, JsonRejection>,
) -> ApiResult<Json<StateView>> {
    let Json(body) = body?;
    let row = state
        .engine
        .configure(
            &StateKey::new(microservice_id, component_id),
            body.consistency_type,
            body.staleness_bound,
        )
        .await?;
    Ok(Json(view(&state, row).await?))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct OperationQuery {
    pub microservice_id: String,
    pub component_id: String,
    pub consistency_type: Option<ConsistencyType>,
    pub session_id: Option<String>,
}

impl OperationQuery {
    fn into_request(self) -> OperationRequest {
        let mut req = OperationRequest::new(self.microservice_id, self.component_id);
        if let Some(ct) = self.consistency_type {
            req = req.with_consistency(ct);
        }
        if let Some(session) = self.session_id {
            req = req.with_session(session);
        }
        req
    }
}

/// POST /api/states/operations/read
pub(crate) async fn read_operation(
    State(state): State<Arc<AppState>>,
    query: Result<Query<OperationQuery>, QueryRejection>,
) -> ApiResult<Json<OperationReport>> {
    let Query(query) = query?;
    Ok(Json(state.engine.read(&query.into_request()).await?))
}

/// POST /api/states/operations/write
pub(crate) async fn write_operation(
    State(state): State<Arc<AppState>>,
    query: Result<Query<OperationQuery>, QueryRejection>,
) -> ApiResult<Json<OperationReport>> {
    let Query(query) = query?;
    Ok(Json(state.engine.write(&query.into_request()).await?))
}
