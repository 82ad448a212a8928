//! `megamodel serve` -- HTTP JSON API over the coherence engine.
//!
//! Endpoints (all JSON, everything except `/health` under `/api`):
//! - GET  /health
//! - GET/POST /components, GET/PUT/DELETE /components/{id}
//! - GET/POST /microservices, GET/PUT/DELETE /microservices/{id}
//! - GET  /states, GET/PUT /states/{microserviceId}/{componentId}
//! - POST /states/operations/read, POST /states/operations/write
//! - GET/POST /goms, GET/PUT/DELETE /goms/{id}
//! - GET/POST /goms/{id}/instances, GET/DELETE /gom-instances/{id}
//! - GET  /metrics/{state-distribution,total-operations,transition-counts,
//!   recent-transitions,component-logs}
//!
//! Cross-origin requests with credentials are allowed for the configured
//! origins, or for any origin when none are configured.

mod error;
mod goms;
mod handlers;
mod metrics;
mod middleware;
mod state;
mod states;

use std::sync::Arc;
use std::time::Duration;

use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{middleware as axum_middleware, Json, Router};
use megamodel_engine::{spawn_sweeper, ErrorKind};
use megamodel_storage::CoherenceStore;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tower_http::cors::CorsLayer;

use self::handlers::{
    create_component, create_microservice, delete_component, delete_microservice,
    get_component, get_microservice, handle_health, handle_not_found, list_components,
    list_microservices, update_component, update_microservice,
};
use self::middleware::{cors_layer, trace_requests};
use self::state::{AppState, Store};
use crate::config::ServerConfig;

/// Construct a JSON error response in the shape every API error uses.
fn json_error(status: StatusCode, kind: ErrorKind, message: &str) -> impl IntoResponse {
    (
        status,
        Json(serde_json::json!({"error": message, "kind": kind})),
    )
}

pub(crate) fn router(state: Arc<AppState>, cors: CorsLayer) -> Router {
    let api = Router::new()
        .route("/components", get(list_components).post(create_component))
        .route(
            "/components/{id}",
            get(get_component)
                .put(update_component)
                .delete(delete_component),
        )
        .route(
            "/microservices",
            get(list_microservices).post(create_microservice),
        )
        .route(
            "/microservices/{id}",
            get(get_microservice)
                .put(update_microservice)
                .delete(delete_microservice),
        )
        .route("/states", get(states::list_states))
        .route("/states/operations/read", post(states::read_operation))
        .route("/states/operations/write", post(states::write_operation))
        .route(
            "/states/{microservice_id}/{component_id}",
            get(states::get_state).put(states::configure_state),
        )
        .route("/goms", get(goms::list_goms).post(goms::create_gom))
        .route(
            "/goms/{id}",
            get(goms::get_gom)
                .put(goms::update_gom)
                .delete(goms::delete_gom),
        )
        .route(
            "/goms/{id}/instances",
            get(goms::list_instances).post(goms::execute_gom),
        )
        .route(
            "/gom-instances/{id}",
            get(goms::get_instance).delete(goms::delete_instance),
        )
        .route(
            "/metrics/state-distribution",
            get(metrics::state_distribution),
        )
        .route("/metrics/total-operations", get(metrics::total_operations))
        .route("/metrics/transition-counts", get(metrics::transition_counts))
        .route(
            "/metrics/recent-transitions",
            get(metrics::recent_transitions),
        )
        .route("/metrics/component-logs", get(metrics::component_logs));

    Router::new()
        .route("/health", get(handle_health))
        .nest("/api", api)
        .fallback(handle_not_found)
        .layer(axum_middleware::from_fn(trace_requests))
        .layer(cors)
        .with_state(state)
}

/// Open the store, start the background tasks and serve until a shutdown
/// signal arrives. The store is closed on the way out.
pub(crate) async fn start_server(config: ServerConfig) -> Result<(), Box<dyn std::error::Error>> {
    let store = Arc::new(Store::new());
    store.open().await?;

    let state = Arc::new(AppState::new(store.clone(), config.engine.clone()));
    let sweeper = spawn_sweeper(state.engine.clone());
    let reporter = spawn_metrics_report(state.clone(), config.metrics_report_interval_ms);

    let app = router(state.clone(), cors_layer(&config.allowed_origins));
    let addr = format!("{}:{}", config.bind, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(
        addr = %addr,
        sweep_interval_ms = config.engine.sweep_interval_ms,
        allowed_origins = ?config.allowed_origins,
        "megamodel listening"
    );
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    for task in [sweeper, reporter].into_iter().flatten() {
        task.abort();
    }
    state.engine.settle().await;
    store.close().await?;
    tracing::info!("server shut down");
    Ok(())
}

/// Log a metrics summary every `interval_ms`; 0 disables the report.
fn spawn_metrics_report(state: Arc<AppState>, interval_ms: u64) -> Option<JoinHandle<()>> {
    if interval_ms == 0 {
        return None;
    }
    Some(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match state.metrics.snapshot().await {
                Ok(snapshot) => tracing::info!(
                    total_operations = snapshot.total_operations,
                    state_distribution = ?snapshot.state_distribution,
                    transition_counts = ?snapshot.transition_counts,
                    "metrics report"
                ),
                Err(e) => tracing::error!(error = %e, "metrics report failed"),
            }
        }
    }))
}

/// Wait for Ctrl+C, or SIGTERM on unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("received shutdown signal");
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::{header, Method, Request};
    use megamodel_engine::EngineConfig;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use super::*;

    async fn app() -> Router {
        app_with(&[]).await
    }

    async fn app_with(origins: &[&str]) -> Router {
        let store = Arc::new(Store::new());
        store.open().await.unwrap();
        let state = Arc::new(AppState::new(store, EngineConfig::default()));
        let origins: Vec<String> = origins.iter().map(|o| o.to_string()).collect();
        router(state, cors_layer(&origins))
    }

    async fn send(
        app: &Router,
        method: Method,
        uri: &str,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(v) => {
                builder = builder.header(header::CONTENT_TYPE, "application/json");
                Body::from(v.to_string())
            }
            None => Body::empty(),
        };
        let response = app
            .clone()
            .oneshot(builder.body(body).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, json)
    }

    async fn seed(app: &Router) {
        for id in ["orders", "billing"] {
            let (status, _) = send(
                app,
                Method::POST,
                "/api/microservices",
                Some(json!({"id": id, "name": id})),
            )
            .await;
            assert_eq!(status, StatusCode::CREATED);
        }
        let (status, _) = send(
            app,
            Method::POST,
            "/api/components",
            Some(json!({"id": "schema", "name": "Order schema", "metamodel": "json-schema"})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
    }

    #[tokio::test]
    async fn health_reports_version() {
        let (status, body) = send(&app().await, Method::GET, "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
    }

    #[tokio::test]
    async fn unknown_route_is_json_404() {
        let (status, body) = send(&app().await, Method::GET, "/api/nope", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "not found");
        assert_eq!(body["kind"], "NOT_FOUND");
    }

    #[tokio::test]
    async fn deleting_catalog_entries_releases_session_marks() {
        let store = Arc::new(Store::new());
        store.open().await.unwrap();
        let state = Arc::new(AppState::new(store, EngineConfig::default()));
        let app = router(state.clone(), cors_layer(&[]));
        seed(&app).await;
        for ms in ["orders", "billing"] {
            let uri = format!("/api/states/operations/read?microserviceId={ms}&componentId=schema");
            let (status, _) = send(&app, Method::POST, &uri, None).await;
            assert_eq!(status, StatusCode::OK);
        }
        assert_eq!(state.engine.tracked_sessions().await, 2);

        let (status, _) = send(&app, Method::DELETE, "/api/microservices/orders", None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        assert_eq!(state.engine.tracked_sessions().await, 1);

        let (status, _) = send(&app, Method::DELETE, "/api/components/schema", None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        assert_eq!(state.engine.tracked_sessions().await, 0);
    }

    #[tokio::test]
    async fn component_crud() {
        let app = app().await;
        let (status, created) = send(
            &app,
            Method::POST,
            "/api/components",
            Some(json!({"name": "Customer model"})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let id = created["id"].as_str().unwrap().to_string();
        assert!(!id.is_empty());

        let (status, updated) = send(
            &app,
            Method::PUT,
            &format!("/api/components/{id}"),
            Some(json!({"name": "Customer model v2", "description": "renamed"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(updated["name"], "Customer model v2");

        let (_, list) = send(&app, Method::GET, "/api/components", None).await;
        assert_eq!(list.as_array().unwrap().len(), 1);

        let (status, _) = send(&app, Method::DELETE, &format!("/api/components/{id}"), None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (status, body) = send(&app, Method::GET, &format!("/api/components/{id}"), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["kind"], "NOT_FOUND");
    }

    #[tokio::test]
    async fn duplicate_and_malformed_bodies_are_validation_errors() {
        let app = app().await;
        seed(&app).await;
        let (status, body) = send(
            &app,
            Method::POST,
            "/api/components",
            Some(json!({"id": "schema", "name": "again"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["kind"], "VALIDATION_ERROR");

        let (status, body) = send(
            &app,
            Method::PUT,
            "/api/states/orders/schema",
            Some(json!({"consistencyType": "LINEARIZABLE"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["kind"], "VALIDATION_ERROR");
    }

    #[tokio::test]
    async fn read_then_strong_write_through_the_api() {
        let app = app().await;
        seed(&app).await;

        let (status, read) = send(
            &app,
            Method::POST,
            "/api/states/operations/read?microserviceId=billing&componentId=schema",
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(read["row"]["state"], "SHARED_MINUS");
        assert_eq!(read["servedVersion"], 0);
        assert_eq!(read["refreshed"], true);

        let (status, write) = send(
            &app,
            Method::POST,
            "/api/states/operations/write?microserviceId=orders&componentId=schema&consistencyType=STRONG",
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(write["row"]["state"], "MODIFIED");
        assert_eq!(write["row"]["version"], 1);
        assert_eq!(write["guarantee"], "EXCLUSIVE");

        let (status, states) = send(&app, Method::GET, "/api/states", None).await;
        assert_eq!(status, StatusCode::OK);
        let states = states.as_array().unwrap();
        assert_eq!(states.len(), 2);
        let billing = &states[0];
        assert_eq!(billing["microservice"]["id"], "billing");
        assert_eq!(billing["componentModel"]["id"], "schema");
        assert_eq!(billing["componentModel"]["name"], "Order schema");
        assert_eq!(billing["state"], "INVALID");
        assert_eq!(billing["consistencyType"], "EVENTUAL");
        assert!(billing["stalenessBound"].is_null());
        assert!(billing["timestamp"].is_string());
    }

    #[tokio::test]
    async fn operation_on_unknown_pair_is_404() {
        let app = app().await;
        seed(&app).await;
        let (status, body) = send(
            &app,
            Method::POST,
            "/api/states/operations/write?microserviceId=ghost&componentId=schema",
            None,
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["kind"], "NOT_FOUND");

        let (status, body) = send(
            &app,
            Method::POST,
            "/api/states/operations/read?microserviceId=orders",
            None,
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["kind"], "VALIDATION_ERROR");
    }

    #[tokio::test]
    async fn configure_registers_row_with_default_bound() {
        let app = app().await;
        seed(&app).await;
        let (status, _) = send(&app, Method::GET, "/api/states/orders/schema", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, row) = send(
            &app,
            Method::PUT,
            "/api/states/orders/schema",
            Some(json!({"consistencyType": "BOUNDED_STALENESS"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(row["state"], "INVALID");
        assert_eq!(row["consistencyType"], "BOUNDED_STALENESS");
        assert_eq!(row["stalenessBound"], 30_000);

        let (status, row) = send(&app, Method::GET, "/api/states/orders/schema", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(row["microservice"]["name"], "orders");
    }

    #[tokio::test]
    async fn gom_lifecycle_over_http() {
        let app = app().await;
        seed(&app).await;
        let (status, gom) = send(
            &app,
            Method::POST,
            "/api/goms",
            Some(json!({
                "name": "publish",
                "microserviceRequirements": [
                    {"microserviceId": "orders", "requiredComponents": [
                        {"componentId": "schema", "consistencyType": "STRONG", "operation": "write"}
                    ]},
                    {"microserviceId": "billing", "requiredComponents": [
                        {"componentId": "schema", "consistencyType": "STRONG"}
                    ]}
                ],
                "postconditions": ["billing/schema.version == 1"]
            })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let gom_id = gom["id"].as_str().unwrap().to_string();

        let (status, instance) = send(
            &app,
            Method::POST,
            &format!("/api/goms/{gom_id}/instances"),
            Some(json!({"name": "first run"})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(instance["status"], "COMPLETED");
        assert_eq!(instance["postconditionsHeld"], 1);
        assert_eq!(instance["gomSnapshot"]["id"], gom_id.as_str());
        let instance_id = instance["id"].as_str().unwrap().to_string();

        let (_, list) = send(&app, Method::GET, &format!("/api/goms/{gom_id}/instances"), None).await;
        assert_eq!(list.as_array().unwrap().len(), 1);

        let (status, _) = send(
            &app,
            Method::DELETE,
            &format!("/api/gom-instances/{instance_id}"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (status, _) = send(
            &app,
            Method::GET,
            &format!("/api/gom-instances/{instance_id}"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn gom_with_bad_condition_is_rejected() {
        let app = app().await;
        seed(&app).await;
        let (status, body) = send(
            &app,
            Method::POST,
            "/api/goms",
            Some(json!({"name": "broken", "preconditions": ["orders/schema.state < MODIFIED"]})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["kind"], "VALIDATION_ERROR");
    }

    #[tokio::test]
    async fn metrics_feeds() {
        let app = app().await;
        seed(&app).await;
        send(
            &app,
            Method::POST,
            "/api/states/operations/write?microserviceId=orders&componentId=schema",
            None,
        )
        .await;
        send(
            &app,
            Method::POST,
            "/api/states/operations/read?microserviceId=ghost&componentId=schema",
            None,
        )
        .await;

        let (_, dist) = send(&app, Method::GET, "/api/metrics/state-distribution", None).await;
        assert_eq!(dist["MODIFIED"], 1);
        assert_eq!(dist["SHARED_PLUS"], 0);

        let (_, total) = send(&app, Method::GET, "/api/metrics/total-operations", None).await;
        assert_eq!(total, 1);

        let (_, counts) = send(&app, Method::GET, "/api/metrics/transition-counts", None).await;
        assert_eq!(counts["MODIFIED"], 1);
        assert_eq!(counts["INVALID"], 0);

        let (_, recent) = send(
            &app,
            Method::GET,
            "/api/metrics/recent-transitions?limit=5",
            None,
        )
        .await;
        assert_eq!(recent[0]["toState"], "MODIFIED");
        assert_eq!(recent[0]["cause"], "DIRECT");

        let (_, logs) = send(&app, Method::GET, "/api/metrics/component-logs", None).await;
        let logs = logs.as_array().unwrap();
        assert_eq!(logs.len(), 3);
        assert_eq!(logs[0]["type"], "STATE_TRANSITION");
        assert_eq!(logs[1]["type"], "OPERATION");
        assert_eq!(logs[2]["outcome"], "REJECTED");
        assert_eq!(logs[2]["errorKind"], "NOT_FOUND");
    }

    #[tokio::test]
    async fn cors_preflight_allows_credentials() {
        let app = app_with(&["http://localhost:5173"]).await;
        let request = Request::builder()
            .method(Method::OPTIONS)
            .uri("/api/states")
            .header(header::ORIGIN, "http://localhost:5173")
            .header(header::ACCESS_CONTROL_REQUEST_METHOD, "PUT")
            .header(header::ACCESS_CONTROL_REQUEST_HEADERS, "content-type")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        let headers = response.headers();
        assert_eq!(
            headers[header::ACCESS_CONTROL_ALLOW_ORIGIN],
            "http://localhost:5173"
        );
        assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_CREDENTIALS], "true");
    }

    #[tokio::test]
    async fn cors_mirrors_any_origin_when_unconfigured() {
        let app = app().await;
        let request = Request::builder()
            .uri("/health")
            .header(header::ORIGIN, "http://ui.example")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(
            response.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN],
            "http://ui.example"
        );
    }
}
