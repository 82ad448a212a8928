use std::future::Future;

use super::{make_component, TestResult};
use crate::{CoherenceStore, StorageError};

pub(super) async fn run_lifecycle_tests<S, F, Fut>(factory: &F) -> Vec<TestResult>
where
    S: CoherenceStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    vec![
        TestResult::from_result(
            "lifecycle",
            "fresh_store_is_closed",
            fresh_store_is_closed(factory).await,
        ),
        TestResult::from_result(
            "lifecycle",
            "open_is_idempotent",
            open_is_idempotent(factory).await,
        ),
        TestResult::from_result(
            "lifecycle",
            "closed_store_rejects_every_call",
            closed_store_rejects_every_call(factory).await,
        ),
    ]
}

async fn fresh_store_is_closed<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: CoherenceStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let store = factory().await;
    if store.is_open() {
        return Err("new store reports open before open()".to_string());
    }
    match store.list_microservices().await {
        Err(StorageError::Closed) => Ok(()),
        other => Err(format!("expected Closed, got {other:?}")),
    }
}

async fn open_is_idempotent<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: CoherenceStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let store = factory().await;
    store.open().await.map_err(|e| format!("first open: {e}"))?;
    store
        .insert_component(make_component("c1"))
        .await
        .map_err(|e| format!("insert: {e}"))?;
    store.open().await.map_err(|e| format!("second open: {e}"))?;
    let components = store
        .list_components()
        .await
        .map_err(|e| format!("list: {e}"))?;
    if components.len() != 1 {
        return Err(format!(
            "second open() lost data: {} components",
            components.len()
        ));
    }
    Ok(())
}

async fn closed_store_rejects_every_call<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: CoherenceStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let store = factory().await;
    store.open().await.map_err(|e| format!("open: {e}"))?;
    store.close().await.map_err(|e| format!("close: {e}"))?;
    if store.is_open() {
        return Err("store reports open after close()".to_string());
    }

    let checks: Vec<(&str, Result<(), StorageError>)> = vec![
        ("list_states", store.list_states(None).await.map(drop)),
        ("get_component", store.get_component("c1").await.map(drop)),
        ("list_goms", store.list_goms().await.map(drop)),
        ("list_transitions", store.list_transitions(0).await.map(drop)),
    ];
    for (name, result) in checks {
        match result {
            Err(StorageError::Closed) => {}
            other => return Err(format!("{name}: expected Closed, got {other:?}")),
        }
    }
    Ok(())
}
