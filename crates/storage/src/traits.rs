use async_trait::async_trait;

use crate::error::StorageError;
use crate::record::{
    CoherenceRecord, CoherenceUpdate, ComponentRecord, ConsistencyType, GomInstanceRecord,
    GomRecord, MicroserviceRecord, OperationRecord, StateKey, TransitionRecord,
};

/// The storage trait for megamodel coherence backends.
///
/// A `CoherenceStore` holds the coherence table, the component and
/// microservice catalogs, Global Operation Models with their instances, and
/// the append-only transition and operation logs.
///
/// ## Lifecycle
///
/// A store is injected into the engine and has an explicit lifecycle:
/// `open()` at startup, `close()` at shutdown. Every other method returns
/// `Err(StorageError::Closed)` while the store is not open.
///
/// ## OCC Conflict Detection
///
/// `compare_and_swap` is the only way to change a coherence row. It applies
/// the update only if the row's `revision` still equals `expected_revision`
/// and bumps the revision on success. Otherwise it returns
/// `Err(StorageError::ConcurrentConflict { ... })`. Concurrent callers racing
/// on the same key see exactly one winner.
///
/// ## Referential integrity
///
/// Coherence rows exist only for catalogued microservices and components.
/// Deleting either cascades to its rows. Deleting a GOM cascades to its
/// instances. The logs are never rewritten, and a component's version
/// high-water mark outlives the rows it was read from.
///
/// ## Thread Safety
///
/// Implementations must be `Send + Sync + 'static` to be shared by the engine,
/// axum application state, and spawned fan-out tasks.
#[async_trait]
pub trait CoherenceStore: Send + Sync + 'static {
    // ── Lifecycle ─────────────────────────────────────────────────────────────

    /// Open the store. Opening an already open store is a no-op.
    async fn open(&self) -> Result<(), StorageError>;

    /// Close the store. Data held by durable backends survives a close.
    async fn close(&self) -> Result<(), StorageError>;

    fn is_open(&self) -> bool;

    // ── Coherence rows ────────────────────────────────────────────────────────

    /// Read a row, registering it at `INVALID` / version 0 with the given
    /// policy if absent.
    ///
    /// Returns `Err(StorageError::NotFound)` if the microservice or the
    /// component is not catalogued.
    async fn get_or_init(
        &self,
        key: &StateKey,
        consistency_type: ConsistencyType,
        staleness_bound_ms: Option<u64>,
    ) -> Result<CoherenceRecord, StorageError>;

    /// Read a row without registering it.
    async fn get_state(&self, key: &StateKey) -> Result<Option<CoherenceRecord>, StorageError>;

    /// Apply a revision-validated update to a row (OCC).
    ///
    /// Returns the updated row on success.
    async fn compare_and_swap(
        &self,
        key: &StateKey,
        expected_revision: u64,
        update: CoherenceUpdate,
    ) -> Result<CoherenceRecord, StorageError>;

    /// List rows ordered by (microservice id, component id), optionally
    /// restricted to one component.
    async fn list_states(
        &self,
        component_id: Option<&str>,
    ) -> Result<Vec<CoherenceRecord>, StorageError>;

    /// Highest data version any row of the component has ever held through
    /// `compare_and_swap`, or 0. Deleting a microservice does not lower it;
    /// deleting the component resets it.
    async fn version_high_water(&self, component_id: &str) -> Result<u64, StorageError>;

    // ── Catalog ───────────────────────────────────────────────────────────────

    async fn insert_component(&self, record: ComponentRecord) -> Result<(), StorageError>;
    async fn update_component(&self, record: ComponentRecord) -> Result<(), StorageError>;
    async fn get_component(&self, id: &str) -> Result<ComponentRecord, StorageError>;
    async fn list_components(&self) -> Result<Vec<ComponentRecord>, StorageError>;
    /// Delete a component together with every coherence row for it.
    async fn delete_component(&self, id: &str) -> Result<(), StorageError>;

    async fn insert_microservice(&self, record: MicroserviceRecord) -> Result<(), StorageError>;
    async fn update_microservice(&self, record: MicroserviceRecord) -> Result<(), StorageError>;
    async fn get_microservice(&self, id: &str) -> Result<MicroserviceRecord, StorageError>;
    async fn list_microservices(&self) -> Result<Vec<MicroserviceRecord>, StorageError>;
    /// Delete a microservice together with every coherence row it holds.
    async fn delete_microservice(&self, id: &str) -> Result<(), StorageError>;

    // ── GOMs and instances ────────────────────────────────────────────────────

    async fn insert_gom(&self, record: GomRecord) -> Result<(), StorageError>;
    async fn update_gom(&self, record: GomRecord) -> Result<(), StorageError>;
    async fn get_gom(&self, id: &str) -> Result<GomRecord, StorageError>;
    async fn list_goms(&self) -> Result<Vec<GomRecord>, StorageError>;
    /// Delete a GOM together with its instances.
    async fn delete_gom(&self, id: &str) -> Result<(), StorageError>;

    /// Insert an instance. `gom_id` must reference an existing GOM.
    async fn insert_instance(&self, record: GomInstanceRecord) -> Result<(), StorageError>;
    /// Replace an instance. Fails with `NotFound` once the instance was deleted.
    async fn update_instance(&self, record: GomInstanceRecord) -> Result<(), StorageError>;
    async fn get_instance(&self, id: &str) -> Result<GomInstanceRecord, StorageError>;
    /// List a GOM's instances in creation order.
    async fn list_instances(&self, gom_id: &str) -> Result<Vec<GomInstanceRecord>, StorageError>;
    async fn delete_instance(&self, id: &str) -> Result<(), StorageError>;

    // ── Logs ──────────────────────────────────────────────────────────────────

    /// Append a transition record. The store assigns `seq` (any caller value
    /// is overwritten) from the sequence shared with the operation log and
    /// returns it.
    async fn append_transition(&self, record: TransitionRecord) -> Result<u64, StorageError>;

    /// Append an operation attempt record. `seq` is assigned as for transitions.
    async fn append_operation(&self, record: OperationRecord) -> Result<u64, StorageError>;

    /// The last `limit` transition records, oldest first (0 = all).
    async fn list_transitions(&self, limit: usize) -> Result<Vec<TransitionRecord>, StorageError>;

    /// The last `limit` operation records, oldest first (0 = all).
    async fn list_operations(&self, limit: usize) -> Result<Vec<OperationRecord>, StorageError>;
}
