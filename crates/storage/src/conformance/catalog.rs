use std::future::Future;

use time::OffsetDateTime;

use super::{make_component, make_microservice, seeded, TestResult};
use crate::{
    CoherenceStore, ComponentRequirement, ConsistencyType, GomInstanceRecord, GomRecord,
    InstanceStatus, MicroserviceRequirement, OperationKind, RecordKind, StateKey, StorageError,
};

pub(super) async fn run_catalog_tests<S, F, Fut>(factory: &F) -> Vec<TestResult>
where
    S: CoherenceStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    vec![
        TestResult::from_result(
            "catalog",
            "duplicate_ids_rejected",
            duplicate_ids_rejected(factory).await,
        ),
        TestResult::from_result(
            "catalog",
            "update_requires_existing_record",
            update_requires_existing_record(factory).await,
        ),
        TestResult::from_result(
            "catalog",
            "delete_component_cascades_rows",
            delete_component_cascades_rows(factory).await,
        ),
        TestResult::from_result(
            "catalog",
            "delete_microservice_cascades_rows",
            delete_microservice_cascades_rows(factory).await,
        ),
        TestResult::from_result(
            "catalog",
            "instances_follow_their_gom",
            instances_follow_their_gom(factory).await,
        ),
    ]
}

fn make_gom(id: &str) -> GomRecord {
    GomRecord {
        id: id.to_string(),
        name: format!("model {id}"),
        description: String::new(),
        microservice_requirements: vec![MicroserviceRequirement {
            microservice_id: "m1".to_string(),
            required_components: vec![ComponentRequirement {
                component_id: "c1".to_string(),
                consistency_type: ConsistencyType::Strong,
                operation: OperationKind::Read,
            }],
        }],
        preconditions: Vec::new(),
        postconditions: Vec::new(),
    }
}

fn make_instance(id: &str, gom: &GomRecord) -> GomInstanceRecord {
    let now = OffsetDateTime::now_utc();
    GomInstanceRecord {
        id: id.to_string(),
        gom_id: gom.id.clone(),
        name: format!("run {id}"),
        status: InstanceStatus::Running,
        microservice_states: Vec::new(),
        steps: Vec::new(),
        postconditions_held: 0,
        failure: None,
        gom_snapshot: gom.clone(),
        created_at: now,
        updated_at: now,
    }
}

async fn duplicate_ids_rejected<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: CoherenceStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let store = seeded(factory).await?;
    match store.insert_component(make_component("c1")).await {
        Err(StorageError::AlreadyExists {
            kind: RecordKind::Component,
            ..
        }) => {}
        other => return Err(format!("duplicate component: got {other:?}")),
    }
    match store.insert_microservice(make_microservice("m1")).await {
        Err(StorageError::AlreadyExists {
            kind: RecordKind::Microservice,
            ..
        }) => {}
        other => return Err(format!("duplicate microservice: got {other:?}")),
    }
    store
        .insert_gom(make_gom("g1"))
        .await
        .map_err(|e| format!("insert gom: {e}"))?;
    match store.insert_gom(make_gom("g1")).await {
        Err(StorageError::AlreadyExists {
            kind: RecordKind::Gom,
            ..
        }) => Ok(()),
        other => Err(format!("duplicate gom: got {other:?}")),
    }
}

async fn update_requires_existing_record<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: CoherenceStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let store = seeded(factory).await?;
    let mut c1 = make_component("c1");
    c1.description = "order schema".to_string();
    store
        .update_component(c1.clone())
        .await
        .map_err(|e| format!("update: {e}"))?;
    let fetched = store
        .get_component("c1")
        .await
        .map_err(|e| e.to_string())?;
    if fetched != c1 {
        return Err(format!("update not visible: {fetched:?}"));
    }
    match store.update_component(make_component("ghost")).await {
        Err(StorageError::NotFound { .. }) => {}
        other => return Err(format!("update unknown component: got {other:?}")),
    }
    match store.update_gom(make_gom("ghost")).await {
        Err(StorageError::NotFound { .. }) => Ok(()),
        other => Err(format!("update unknown gom: got {other:?}")),
    }
}

async fn delete_component_cascades_rows<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: CoherenceStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let store = seeded(factory).await?;
    for (m, c) in [("m1", "c1"), ("m2", "c1"), ("m1", "c2")] {
        store
            .get_or_init(&StateKey::new(m, c), ConsistencyType::Eventual, None)
            .await
            .map_err(|e| e.to_string())?;
    }
    store
        .delete_component("c1")
        .await
        .map_err(|e| format!("delete: {e}"))?;
    let rows = store.list_states(None).await.map_err(|e| e.to_string())?;
    if rows.len() != 1 || rows[0].component_id != "c2" {
        return Err(format!("rows left after delete: {rows:?}"));
    }
    match store.get_component("c1").await {
        Err(StorageError::NotFound { .. }) => {}
        other => return Err(format!("deleted component still readable: {other:?}")),
    }
    match store.delete_component("c1").await {
        Err(StorageError::NotFound { .. }) => Ok(()),
        other => Err(format!("second delete: got {other:?}")),
    }
}

async fn delete_microservice_cascades_rows<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: CoherenceStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let store = seeded(factory).await?;
    for (m, c) in [("m1", "c1"), ("m1", "c2"), ("m2", "c1")] {
        store
            .get_or_init(&StateKey::new(m, c), ConsistencyType::Eventual, None)
            .await
            .map_err(|e| e.to_string())?;
    }
    store
        .delete_microservice("m1")
        .await
        .map_err(|e| format!("delete: {e}"))?;
    let rows = store.list_states(None).await.map_err(|e| e.to_string())?;
    if rows.len() != 1 || rows[0].microservice_id != "m2" {
        return Err(format!("rows left after delete: {rows:?}"));
    }
    Ok(())
}

async fn instances_follow_their_gom<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: CoherenceStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let store = seeded(factory).await?;
    let gom = make_gom("g1");

    match store.insert_instance(make_instance("i0", &gom)).await {
        Err(StorageError::NotFound {
            kind: RecordKind::Gom,
            ..
        }) => {}
        other => return Err(format!("instance of unknown gom: got {other:?}")),
    }

    store.insert_gom(gom.clone()).await.map_err(|e| e.to_string())?;
    for id in ["i1", "i2", "i3"] {
        store
            .insert_instance(make_instance(id, &gom))
            .await
            .map_err(|e| format!("insert {id}: {e}"))?;
    }
    let ids: Vec<String> = store
        .list_instances("g1")
        .await
        .map_err(|e| e.to_string())?
        .into_iter()
        .map(|i| i.id)
        .collect();
    if ids != ["i1", "i2", "i3"] {
        return Err(format!("instances not in creation order: {ids:?}"));
    }

    let mut done = make_instance("i2", &gom);
    done.status = InstanceStatus::Completed;
    store
        .update_instance(done)
        .await
        .map_err(|e| format!("update: {e}"))?;
    let fetched = store.get_instance("i2").await.map_err(|e| e.to_string())?;
    if fetched.status != InstanceStatus::Completed {
        return Err(format!("instance update lost: {:?}", fetched.status));
    }

    store
        .delete_instance("i1")
        .await
        .map_err(|e| format!("delete instance: {e}"))?;
    match store.update_instance(make_instance("i1", &gom)).await {
        Err(StorageError::NotFound { .. }) => {}
        other => return Err(format!("update of deleted instance: got {other:?}")),
    }

    store
        .delete_gom("g1")
        .await
        .map_err(|e| format!("delete gom: {e}"))?;
    match store.get_instance("i3").await {
        Err(StorageError::NotFound { .. }) => Ok(()),
        other => Err(format!("instance survived gom delete: {other:?}")),
    }
}
