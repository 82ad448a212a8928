//! Row updates paired with their transition records.

use megamodel_storage::{
    CoherenceRecord, CoherenceState, CoherenceStore, CoherenceUpdate, OperationKind, StorageError,
    TransitionCause, TransitionRecord,
};
use time::OffsetDateTime;

/// Why a transition is being recorded.
#[derive(Debug, Clone, Copy)]
pub(crate) struct TransitionMeta<'a> {
    pub operation: OperationKind,
    pub cause: TransitionCause,
    pub gom_instance_id: Option<&'a str>,
}

impl<'a> TransitionMeta<'a> {
    pub fn direct(operation: OperationKind, gom_instance_id: Option<&'a str>) -> Self {
        Self {
            operation,
            cause: TransitionCause::Direct,
            gom_instance_id,
        }
    }
}

/// Compare-and-swap `row` to `update` and append the transition record.
pub(crate) async fn commit<S: CoherenceStore>(
    store: &S,
    row: &CoherenceRecord,
    update: CoherenceUpdate,
    meta: TransitionMeta<'_>,
) -> Result<CoherenceRecord, StorageError> {
    let updated = store
        .compare_and_swap(&row.key(), row.revision, update)
        .await?;
    record(store, row.state, &updated, meta).await?;
    Ok(updated)
}

/// Append a transition record for `row`, which went from `from` to its
/// current state.
pub(crate) async fn record<S: CoherenceStore>(
    store: &S,
    from: CoherenceState,
    row: &CoherenceRecord,
    meta: TransitionMeta<'_>,
) -> Result<u64, StorageError> {
    let seq = store
        .append_transition(TransitionRecord {
            seq: 0,
            microservice_id: row.microservice_id.clone(),
            component_id: row.component_id.clone(),
            from_state: from,
            to_state: row.state,
            operation: meta.operation,
            cause: meta.cause,
            version: row.version,
            gom_instance_id: meta.gom_instance_id.map(str::to_string),
            timestamp: OffsetDateTime::now_utc(),
        })
        .await?;
    if from != row.state {
        tracing::debug!(
            microservice = %row.microservice_id,
            component = %row.component_id,
            from = %from,
            to = %row.state,
            version = row.version,
            cause = ?meta.cause,
            seq,
            "state transition"
        );
    }
    Ok(seq)
}
