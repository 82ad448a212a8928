//! In-process `CoherenceStore` backend.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error::{RecordKind, StorageError};
use crate::record::{
    CoherenceRecord, CoherenceState, CoherenceUpdate, ComponentRecord, ConsistencyType,
    GomInstanceRecord, GomRecord, MicroserviceRecord, OperationRecord, StateKey, TransitionRecord,
};
use crate::traits::CoherenceStore;

/// A `CoherenceStore` holding everything in memory behind one async lock.
///
/// Every method takes the lock for the duration of a single call, so each
/// call (in particular `compare_and_swap`) is atomic. Nothing survives the
/// process.
#[derive(Default)]
pub struct MemoryStore {
    open: AtomicBool,
    inner: RwLock<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
    next_row_id: u64,
    next_seq: u64,
    rows: BTreeMap<StateKey, CoherenceRecord>,
    /// Highest version per component id.
    high_water: BTreeMap<String, u64>,
    components: BTreeMap<String, ComponentRecord>,
    microservices: BTreeMap<String, MicroserviceRecord>,
    goms: BTreeMap<String, GomRecord>,
    /// Kept in creation order.
    instances: Vec<GomInstanceRecord>,
    transitions: Vec<TransitionRecord>,
    operations: Vec<OperationRecord>,
}

impl MemoryInner {
    fn next_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }
}

fn tail<T: Clone>(items: &[T], limit: usize) -> Vec<T> {
    let start = if limit == 0 {
        0
    } else {
        items.len().saturating_sub(limit)
    };
    items[start..].to_vec()
}

impl MemoryStore {
    /// Create a closed store. Call [`CoherenceStore::open`] before use.
    pub fn new() -> Self {
        Self::default()
    }

    fn check_open(&self) -> Result<(), StorageError> {
        if self.open.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(StorageError::Closed)
        }
    }

    async fn read(&self) -> Result<RwLockReadGuard<'_, MemoryInner>, StorageError> {
        self.check_open()?;
        Ok(self.inner.read().await)
    }

    async fn write(&self) -> Result<RwLockWriteGuard<'_, MemoryInner>, StorageError> {
        self.check_open()?;
        Ok(self.inner.write().await)
    }
}

#[async_trait]
impl CoherenceStore for MemoryStore {
    async fn open(&self) -> Result<(), StorageError> {
        self.open.store(true, Ordering::Release);
        Ok(())
    }

    async fn close(&self) -> Result<(), StorageError> {
        self.open.store(false, Ordering::Release);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    async fn get_or_init(
        &self,
        key: &StateKey,
        consistency_type: ConsistencyType,
        staleness_bound_ms: Option<u64>,
    ) -> Result<CoherenceRecord, StorageError> {
        let mut inner = self.write().await?;
        if let Some(rec) = inner.rows.get(key) {
            return Ok(rec.clone());
        }
        if !inner.microservices.contains_key(&key.microservice_id) {
            return Err(StorageError::not_found(
                RecordKind::Microservice,
                &key.microservice_id,
            ));
        }
        if !inner.components.contains_key(&key.component_id) {
            return Err(StorageError::not_found(
                RecordKind::Component,
                &key.component_id,
            ));
        }
        inner.next_row_id += 1;
        let rec = CoherenceRecord {
            id: inner.next_row_id,
            microservice_id: key.microservice_id.clone(),
            component_id: key.component_id.clone(),
            state: CoherenceState::Invalid,
            consistency_type,
            version: 0,
            revision: 0,
            timestamp: OffsetDateTime::now_utc(),
            staleness_bound_ms,
        };
        inner.rows.insert(key.clone(), rec.clone());
        Ok(rec)
    }

    async fn get_state(&self, key: &StateKey) -> Result<Option<CoherenceRecord>, StorageError> {
        let inner = self.read().await?;
        Ok(inner.rows.get(key).cloned())
    }

    async fn compare_and_swap(
        &self,
        key: &StateKey,
        expected_revision: u64,
        update: CoherenceUpdate,
    ) -> Result<CoherenceRecord, StorageError> {
        let mut inner = self.write().await?;
        let row = inner
            .rows
            .get_mut(key)
            .ok_or_else(|| StorageError::not_found(RecordKind::State, key.to_string()))?;
        if row.revision != expected_revision {
            return Err(StorageError::ConcurrentConflict {
                key: key.clone(),
                expected_revision,
            });
        }
        row.state = update.state;
        row.consistency_type = update.consistency_type;
        row.version = update.version;
        row.timestamp = update.timestamp;
        row.staleness_bound_ms = update.staleness_bound_ms;
        row.revision += 1;
        let row = row.clone();
        let mark = inner.high_water.entry(key.component_id.clone()).or_default();
        *mark = (*mark).max(row.version);
        Ok(row)
    }

    async fn list_states(
        &self,
        component_id: Option<&str>,
    ) -> Result<Vec<CoherenceRecord>, StorageError> {
        let inner = self.read().await?;
        Ok(inner
            .rows
            .values()
            .filter(|r| component_id.map_or(true, |c| r.component_id == c))
            .cloned()
            .collect())
    }

    async fn version_high_water(&self, component_id: &str) -> Result<u64, StorageError> {
        let inner = self.read().await?;
        Ok(inner.high_water.get(component_id).copied().unwrap_or(0))
    }

    // ── Catalog ───────────────────────────────────────────────────────────────

    async fn insert_component(&self, record: ComponentRecord) -> Result<(), StorageError> {
        let mut inner = self.write().await?;
        if inner.components.contains_key(&record.id) {
            return Err(StorageError::exists(RecordKind::Component, &record.id));
        }
        inner.components.insert(record.id.clone(), record);
        Ok(())
    }

    async fn update_component(&self, record: ComponentRecord) -> Result<(), StorageError> {
        let mut inner = self.write().await?;
        match inner.components.get_mut(&record.id) {
            Some(existing) => {
                *existing = record;
                Ok(())
            }
            None => Err(StorageError::not_found(RecordKind::Component, &record.id)),
        }
    }

    async fn get_component(&self, id: &str) -> Result<ComponentRecord, StorageError> {
        let inner = self.read().await?;
        inner
            .components
            .get(id)
            .cloned()
            .ok_or_else(|| StorageError::not_found(RecordKind::Component, id))
    }

    async fn list_components(&self) -> Result<Vec<ComponentRecord>, StorageError> {
        let inner = self.read().await?;
        Ok(inner.components.values().cloned().collect())
    }

    async fn delete_component(&self, id: &str) -> Result<(), StorageError> {
        let mut inner = self.write().await?;
        if inner.components.remove(id).is_none() {
            return Err(StorageError::not_found(RecordKind::Component, id));
        }
        inner.rows.retain(|key, _| key.component_id != id);
        inner.high_water.remove(id);
        Ok(())
    }

    async fn insert_microservice(&self, record: MicroserviceRecord) -> Result<(), StorageError> {
        let mut inner = self.write().await?;
        if inner.microservices.contains_key(&record.id) {
            return Err(StorageError::exists(RecordKind::Microservice, &record.id));
        }
        inner.microservices.insert(record.id.clone(), record);
        Ok(())
    }

    async fn update_microservice(&self, record: MicroserviceRecord) -> Result<(), StorageError> {
        let mut inner = self.write().await?;
        match inner.microservices.get_mut(&record.id) {
            Some(existing) => {
                *existing = record;
                Ok(())
            }
            None => Err(StorageError::not_found(
                RecordKind::Microservice,
                &record.id,
            )),
        }
    }

    async fn get_microservice(&self, id: &str) -> Result<MicroserviceRecord, StorageError> {
        let inner = self.read().await?;
        inner
            .microservices
            .get(id)
            .cloned()
            .ok_or_else(|| StorageError::not_found(RecordKind::Microservice, id))
    }

    async fn list_microservices(&self) -> Result<Vec<MicroserviceRecord>, StorageError> {
        let inner = self.read().await?;
        Ok(inner.microservices.values().cloned().collect())
    }

    async fn delete_microservice(&self, id: &str) -> Result<(), StorageError> {
        let mut inner = self.write().await?;
        if inner.microservices.remove(id).is_none() {
            return Err(StorageError::not_found(RecordKind::Microservice, id));
        }
        inner.rows.retain(|key, _| key.microservice_id != id);
        Ok(())
    }

    // ── GOMs and instances ────────────────────────────────────────────────────

    async fn insert_gom(&self, record: GomRecord) -> Result<(), StorageError> {
        let mut inner = self.write().await?;
        if inner.goms.contains_key(&record.id) {
            return Err(StorageError::exists(RecordKind::Gom, &record.id));
        }
        inner.goms.insert(record.id.clone(), record);
        Ok(())
    }

    async fn update_gom(&self, record: GomRecord) -> Result<(), StorageError> {
        let mut inner = self.write().await?;
        match inner.goms.get_mut(&record.id) {
            Some(existing) => {
                *existing = record;
                Ok(())
            }
            None => Err(StorageError::not_found(RecordKind::Gom, &record.id)),
        }
    }

    async fn get_gom(&self, id: &str) -> Result<GomRecord, StorageError> {
        let inner = self.read().await?;
        inner
            .goms
            .get(id)
            .cloned()
            .ok_or_else(|| StorageError::not_found(RecordKind::Gom, id))
    }

    async fn list_goms(&self) -> Result<Vec<GomRecord>, StorageError> {
        let inner = self.read().await?;
        Ok(inner.goms.values().cloned().collect())
    }

    async fn delete_gom(&self, id: &str) -> Result<(), StorageError> {
        let mut inner = self.write().await?;
        if inner.goms.remove(id).is_none() {
            return Err(StorageError::not_found(RecordKind::Gom, id));
        }
        inner.instances.retain(|i| i.gom_id != id);
        Ok(())
    }

    async fn insert_instance(&self, record: GomInstanceRecord) -> Result<(), StorageError> {
        let mut inner = self.write().await?;
        if !inner.goms.contains_key(&record.gom_id) {
            return Err(StorageError::not_found(RecordKind::Gom, &record.gom_id));
        }
        if inner.instances.iter().any(|i| i.id == record.id) {
            return Err(StorageError::exists(RecordKind::Instance, &record.id));
        }
        inner.instances.push(record);
        Ok(())
    }

    async fn update_instance(&self, record: GomInstanceRecord) -> Result<(), StorageError> {
        let mut inner = self.write().await?;
        match inner.instances.iter_mut().find(|i| i.id == record.id) {
            Some(existing) => {
                *existing = record;
                Ok(())
            }
            None => Err(StorageError::not_found(RecordKind::Instance, &record.id)),
        }
    }

    async fn get_instance(&self, id: &str) -> Result<GomInstanceRecord, StorageError> {
        let inner = self.read().await?;
        inner
            .instances
            .iter()
            .find(|i| i.id == id)
            .cloned()
            .ok_or_else(|| StorageError::not_found(RecordKind::Instance, id))
    }

    async fn list_instances(&self, gom_id: &str) -> Result<Vec<GomInstanceRecord>, StorageError> {
        let inner = self.read().await?;
        if !inner.goms.contains_key(gom_id) {
            return Err(StorageError::not_found(RecordKind::Gom, gom_id));
        }
        Ok(inner
            .instances
            .iter()
            .filter(|i| i.gom_id == gom_id)
            .cloned()
            .collect())
    }

    async fn delete_instance(&self, id: &str) -> Result<(), StorageError> {
        let mut inner = self.write().await?;
        let before = inner.instances.len();
        inner.instances.retain(|i| i.id != id);
        if inner.instances.len() == before {
            return Err(StorageError::not_found(RecordKind::Instance, id));
        }
        Ok(())
    }

    // ── Logs ──────────────────────────────────────────────────────────────────

    async fn append_transition(&self, mut record: TransitionRecord) -> Result<u64, StorageError> {
        let mut inner = self.write().await?;
        let seq = inner.next_seq();
        record.seq = seq;
        inner.transitions.push(record);
        Ok(seq)
    }

    async fn append_operation(&self, mut record: OperationRecord) -> Result<u64, StorageError> {
        let mut inner = self.write().await?;
        let seq = inner.next_seq();
        record.seq = seq;
        inner.operations.push(record);
        Ok(seq)
    }

    async fn list_transitions(&self, limit: usize) -> Result<Vec<TransitionRecord>, StorageError> {
        let inner = self.read().await?;
        Ok(tail(&inner.transitions, limit))
    }

    async fn list_operations(&self, limit: usize) -> Result<Vec<OperationRecord>, StorageError> {
        let inner = self.read().await?;
        Ok(tail(&inner.operations, limit))
    }
}
