use std::future::Future;

use time::OffsetDateTime;

use super::{seeded, TestResult};
use crate::{CoherenceState, CoherenceStore, ConsistencyType, RecordKind, StateKey, StorageError};

pub(super) async fn run_cas_tests<S, F, Fut>(factory: &F) -> Vec<TestResult>
where
    S: CoherenceStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    vec![
        TestResult::from_result(
            "cas",
            "get_or_init_registers_invalid_row",
            get_or_init_registers_invalid_row(factory).await,
        ),
        TestResult::from_result(
            "cas",
            "get_or_init_keeps_existing_row",
            get_or_init_keeps_existing_row(factory).await,
        ),
        TestResult::from_result(
            "cas",
            "get_or_init_requires_catalog_entries",
            get_or_init_requires_catalog_entries(factory).await,
        ),
        TestResult::from_result(
            "cas",
            "cas_applies_and_bumps_revision",
            cas_applies_and_bumps_revision(factory).await,
        ),
        TestResult::from_result(
            "cas",
            "cas_rejects_stale_revision",
            cas_rejects_stale_revision(factory).await,
        ),
        TestResult::from_result(
            "cas",
            "list_states_orders_and_filters",
            list_states_orders_and_filters(factory).await,
        ),
        TestResult::from_result(
            "cas",
            "high_water_survives_microservice_delete",
            high_water_survives_microservice_delete(factory).await,
        ),
    ]
}

async fn get_or_init_registers_invalid_row<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: CoherenceStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let store = seeded(factory).await?;
    let key = StateKey::new("m1", "c1");
    if store.get_state(&key).await.map_err(|e| e.to_string())?.is_some() {
        return Err("row exists before registration".to_string());
    }
    let row = store
        .get_or_init(&key, ConsistencyType::BoundedStaleness, Some(30_000))
        .await
        .map_err(|e| format!("get_or_init: {e}"))?;
    if row.state != CoherenceState::Invalid || row.version != 0 || row.revision != 0 {
        return Err(format!("unexpected new row: {row:?}"));
    }
    if row.consistency_type != ConsistencyType::BoundedStaleness
        || row.staleness_bound_ms != Some(30_000)
    {
        return Err(format!("policy not stored: {row:?}"));
    }
    let fetched = store
        .get_state(&key)
        .await
        .map_err(|e| e.to_string())?
        .ok_or("row missing after get_or_init")?;
    if fetched != row {
        return Err(format!("get_state returned {fetched:?}, expected {row:?}"));
    }
    Ok(())
}

async fn get_or_init_keeps_existing_row<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: CoherenceStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let store = seeded(factory).await?;
    let key = StateKey::new("m1", "c1");
    let first = store
        .get_or_init(&key, ConsistencyType::Strong, None)
        .await
        .map_err(|e| e.to_string())?;
    let second = store
        .get_or_init(&key, ConsistencyType::Eventual, None)
        .await
        .map_err(|e| e.to_string())?;
    if first != second {
        return Err(format!("second get_or_init changed the row: {second:?}"));
    }
    Ok(())
}

async fn get_or_init_requires_catalog_entries<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: CoherenceStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let store = seeded(factory).await?;
    match store
        .get_or_init(&StateKey::new("ghost", "c1"), ConsistencyType::Eventual, None)
        .await
    {
        Err(StorageError::NotFound {
            kind: RecordKind::Microservice,
            ..
        }) => {}
        other => return Err(format!("unknown microservice: got {other:?}")),
    }
    match store
        .get_or_init(&StateKey::new("m1", "ghost"), ConsistencyType::Eventual, None)
        .await
    {
        Err(StorageError::NotFound {
            kind: RecordKind::Component,
            ..
        }) => Ok(()),
        other => Err(format!("unknown component: got {other:?}")),
    }
}

async fn cas_applies_and_bumps_revision<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: CoherenceStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let store = seeded(factory).await?;
    let key = StateKey::new("m1", "c1");
    let row = store
        .get_or_init(&key, ConsistencyType::Eventual, None)
        .await
        .map_err(|e| e.to_string())?;
    let now = OffsetDateTime::now_utc();
    let updated = store
        .compare_and_swap(
            &key,
            row.revision,
            row.update()
                .state(CoherenceState::Modified)
                .version(1)
                .touched(now),
        )
        .await
        .map_err(|e| format!("cas: {e}"))?;
    if updated.state != CoherenceState::Modified || updated.version != 1 {
        return Err(format!("update not applied: {updated:?}"));
    }
    if updated.revision != row.revision + 1 {
        return Err(format!(
            "revision {} after cas, expected {}",
            updated.revision,
            row.revision + 1
        ));
    }
    if updated.id != row.id {
        return Err("cas changed the row id".to_string());
    }
    Ok(())
}

async fn cas_rejects_stale_revision<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: CoherenceStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let store = seeded(factory).await?;
    let key = StateKey::new("m1", "c1");
    let row = store
        .get_or_init(&key, ConsistencyType::Eventual, None)
        .await
        .map_err(|e| e.to_string())?;
    store
        .compare_and_swap(&key, row.revision, row.update().version(1))
        .await
        .map_err(|e| format!("first cas: {e}"))?;

    match store
        .compare_and_swap(&key, row.revision, row.update().version(2))
        .await
    {
        Err(StorageError::ConcurrentConflict {
            key: conflict_key,
            expected_revision,
        }) => {
            if conflict_key != key || expected_revision != row.revision {
                return Err(format!(
                    "conflict carries {conflict_key}@{expected_revision}"
                ));
            }
        }
        other => return Err(format!("expected ConcurrentConflict, got {other:?}")),
    }

    let current = store
        .get_state(&key)
        .await
        .map_err(|e| e.to_string())?
        .ok_or("row vanished")?;
    if current.version != 1 {
        return Err(format!("losing cas leaked version {}", current.version));
    }

    match store
        .compare_and_swap(&StateKey::new("m2", "c1"), 0, row.update())
        .await
    {
        Err(StorageError::NotFound { .. }) => Ok(()),
        other => Err(format!("cas on missing row: got {other:?}")),
    }
}

async fn list_states_orders_and_filters<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: CoherenceStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let store = seeded(factory).await?;
    for (m, c) in [("m3", "c1"), ("m1", "c2"), ("m1", "c1"), ("m2", "c1")] {
        store
            .get_or_init(&StateKey::new(m, c), ConsistencyType::Eventual, None)
            .await
            .map_err(|e| format!("init {m}/{c}: {e}"))?;
    }
    let all: Vec<String> = store
        .list_states(None)
        .await
        .map_err(|e| e.to_string())?
        .iter()
        .map(|r| r.key().to_string())
        .collect();
    if all != ["m1/c1", "m1/c2", "m2/c1", "m3/c1"] {
        return Err(format!("unexpected order: {all:?}"));
    }
    let c1: Vec<String> = store
        .list_states(Some("c1"))
        .await
        .map_err(|e| e.to_string())?
        .iter()
        .map(|r| r.microservice_id.clone())
        .collect();
    if c1 != ["m1", "m2", "m3"] {
        return Err(format!("filter by component returned {c1:?}"));
    }
    Ok(())
}

async fn high_water_survives_microservice_delete<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: CoherenceStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let store = seeded(factory).await?;
    if store.version_high_water("c1").await.map_err(|e| e.to_string())? != 0 {
        return Err("fresh component has a high-water mark".to_string());
    }
    for (m, version) in [("m1", 7), ("m2", 3)] {
        let key = StateKey::new(m, "c1");
        let row = store
            .get_or_init(&key, ConsistencyType::Eventual, None)
            .await
            .map_err(|e| e.to_string())?;
        store
            .compare_and_swap(&key, row.revision, row.update().version(version))
            .await
            .map_err(|e| format!("cas {m}: {e}"))?;
    }
    store
        .delete_microservice("m1")
        .await
        .map_err(|e| format!("delete m1: {e}"))?;
    let mark = store.version_high_water("c1").await.map_err(|e| e.to_string())?;
    if mark != 7 {
        return Err(format!("high-water {mark} after microservice delete, expected 7"));
    }
    if store.version_high_water("c2").await.map_err(|e| e.to_string())? != 0 {
        return Err("high-water leaked across components".to_string());
    }
    store
        .delete_component("c1")
        .await
        .map_err(|e| format!("delete c1: {e}"))?;
    let mark = store.version_high_water("c1").await.map_err(|e| e.to_string())?;
    if mark != 0 {
        return Err(format!("high-water {mark} after component delete"));
    }
    Ok(())
}
