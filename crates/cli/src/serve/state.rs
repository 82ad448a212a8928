//! Application state shared across request handlers.

use std::sync::Arc;

use megamodel_engine::{
    Catalog, CoherenceEngine, EngineConfig, GomOrchestrator, MetricsAggregator,
};
use megamodel_storage::MemoryStore;

pub(crate) type Store = MemoryStore;

pub(crate) struct AppState {
    pub(crate) engine: Arc<CoherenceEngine<Store>>,
    pub(crate) catalog: Catalog<Store>,
    pub(crate) orchestrator: GomOrchestrator<Store>,
    pub(crate) metrics: MetricsAggregator<Store>,
}

impl AppState {
    /// Wire every service over one opened store.
    pub(crate) fn new(store: Arc<Store>, config: EngineConfig) -> Self {
        let recent_window = config.recent_window;
        let engine = Arc::new(CoherenceEngine::new(store.clone(), config));
        Self {
            catalog: Catalog::new(store.clone()),
            orchestrator: GomOrchestrator::new(engine.clone()),
            metrics: MetricsAggregator::new(store, recent_window),
            engine,
        }
    }
}
