#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use megamodel_engine::{
    AuthoritativeCopy, Catalog, CoherenceEngine, ComponentDraft, EngineConfig, EngineError,
    InvalidationAck, InvalidationCommand, MicroserviceDraft, OperationRequest, PeerLink,
};
use megamodel_storage::{
    CoherenceRecord, CoherenceState, CoherenceStore, ConsistencyType, MemoryStore, StateKey,
};

pub type Engine = CoherenceEngine<MemoryStore>;

/// Open a store with the given microservices and components catalogued.
pub async fn seeded_store(microservices: &[&str], components: &[&str]) -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::new());
    store.open().await.unwrap();
    let catalog = Catalog::new(store.clone());
    for id in microservices {
        catalog
            .create_microservice(MicroserviceDraft {
                id: Some(id.to_string()),
                name: format!("service {id}"),
                ..MicroserviceDraft::default()
            })
            .await
            .unwrap();
    }
    for id in components {
        catalog
            .create_component(ComponentDraft {
                id: Some(id.to_string()),
                name: format!("component {id}"),
                ..ComponentDraft::default()
            })
            .await
            .unwrap();
    }
    store
}

pub async fn engine(
    microservices: &[&str],
    components: &[&str],
) -> (Arc<MemoryStore>, Arc<Engine>) {
    engine_with(microservices, components, EngineConfig::default()).await
}

pub async fn engine_with(
    microservices: &[&str],
    components: &[&str],
    config: EngineConfig,
) -> (Arc<MemoryStore>, Arc<Engine>) {
    let store = seeded_store(microservices, components).await;
    let engine = Arc::new(CoherenceEngine::new(store.clone(), config));
    (store, engine)
}

pub fn op(microservice: &str, component: &str) -> OperationRequest {
    OperationRequest::new(microservice, component)
}

pub fn strong(microservice: &str, component: &str) -> OperationRequest {
    op(microservice, component).with_consistency(ConsistencyType::Strong)
}

pub async fn row(store: &MemoryStore, microservice: &str, component: &str) -> CoherenceRecord {
    store
        .get_state(&StateKey::new(microservice, component))
        .await
        .unwrap()
        .unwrap_or_else(|| panic!("no row for {microservice}/{component}"))
}

/// Force a row into a state directly through the store.
pub async fn force_state(
    store: &MemoryStore,
    microservice: &str,
    component: &str,
    state: CoherenceState,
    consistency: ConsistencyType,
) {
    let key = StateKey::new(microservice, component);
    let current = store.get_or_init(&key, consistency, None).await.unwrap();
    store
        .compare_and_swap(
            &key,
            current.revision,
            current.update().state(state).policy(consistency, None),
        )
        .await
        .unwrap();
}

pub fn short_timeouts() -> EngineConfig {
    EngineConfig {
        fence_timeout_ms: 50,
        refetch_timeout_ms: 50,
        ..EngineConfig::default()
    }
}

/// A link to peers that never answer.
pub struct StalledLink;

#[async_trait]
impl PeerLink for StalledLink {
    async fn invalidate(
        &self,
        _command: InvalidationCommand,
    ) -> Result<InvalidationAck, EngineError> {
        std::future::pending().await
    }

    async fn fetch(&self, _component_id: &str) -> Result<AuthoritativeCopy, EngineError> {
        std::future::pending().await
    }
}

/// A link whose peers always report a conflicting concurrent update.
#[derive(Default)]
pub struct ContendedLink {
    pub invalidations: AtomicUsize,
}

#[async_trait]
impl PeerLink for ContendedLink {
    async fn invalidate(
        &self,
        command: InvalidationCommand,
    ) -> Result<InvalidationAck, EngineError> {
        self.invalidations.fetch_add(1, Ordering::SeqCst);
        Err(EngineError::CoherenceConflict {
            key: command.target,
            attempts: 1,
        })
    }

    async fn fetch(&self, _component_id: &str) -> Result<AuthoritativeCopy, EngineError> {
        Ok(AuthoritativeCopy {
            version: 0,
            holder: None,
        })
    }
}

pub async fn engine_over_link(
    microservices: &[&str],
    components: &[&str],
    link: Arc<dyn PeerLink>,
    config: EngineConfig,
) -> (Arc<MemoryStore>, Arc<Engine>) {
    let store = seeded_store(microservices, components).await;
    let engine = Arc::new(CoherenceEngine::with_link(
        store.clone(),
        link,
        Arc::new(config),
    ));
    (store, engine)
}
