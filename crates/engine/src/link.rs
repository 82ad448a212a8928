//! Peer link: the channel fencing commands and coherence fetches travel over.
//!
//! The engine never mutates a peer's row directly. It sends an
//! [`InvalidationCommand`] to the peer's entry point and waits for the ack,
//! and it asks the link for the authoritative copy when a read needs one.
//! [`LocalLink`] delivers both against the shared store in-process; a
//! multi-process deployment swaps in a networked implementation.

use std::sync::Arc;

use async_trait::async_trait;
use megamodel_storage::{
    CoherenceRecord, CoherenceState, CoherenceStore, OperationKind, RecordKind, StateKey,
    TransitionCause,
};
use time::OffsetDateTime;

use crate::error::EngineError;
use crate::journal::{self, TransitionMeta};
use crate::policy::demote_on_invalidation;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidationMode {
    /// Move the peer to `INVALID` unconditionally.
    Fence,
    /// Let the peer react according to its own consistency type.
    Demote,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidationCommand {
    pub target: StateKey,
    pub mode: InvalidationMode,
    /// Version being written. A peer already at or beyond it ignores the command.
    pub version: u64,
    pub gom_instance_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidationAck {
    pub target: StateKey,
    pub from: CoherenceState,
    pub to: CoherenceState,
    /// False when the command was dropped or changed nothing.
    pub applied: bool,
}

/// The authoritative copy of a component.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthoritativeCopy {
    pub version: u64,
    /// Row the version was taken from, if any row exists.
    pub holder: Option<StateKey>,
}

#[async_trait]
pub trait PeerLink: Send + Sync {
    /// Deliver an invalidation to the target row's entry point.
    ///
    /// Makes one attempt. A concurrent update of the target surfaces as a
    /// conflict and the caller decides whether to retry.
    async fn invalidate(
        &self,
        command: InvalidationCommand,
    ) -> Result<InvalidationAck, EngineError>;

    /// Fetch the authoritative version of a component.
    async fn fetch(&self, component_id: &str) -> Result<AuthoritativeCopy, EngineError>;
}

/// Pick the authoritative copy among a component's rows: the `MODIFIED`
/// holder, else the newest `SHARED_PLUS`, else the newest row of any state.
pub fn authoritative_copy(rows: &[CoherenceRecord]) -> AuthoritativeCopy {
    let newest = |state: Option<CoherenceState>| {
        rows.iter()
            .filter(|r| state.map_or(true, |s| r.state == s))
            .max_by_key(|r| r.version)
    };
    newest(Some(CoherenceState::Modified))
        .or_else(|| newest(Some(CoherenceState::SharedPlus)))
        .or_else(|| newest(None))
        .map_or(
            AuthoritativeCopy {
                version: 0,
                holder: None,
            },
            |r| AuthoritativeCopy {
                version: r.version,
                holder: Some(r.key()),
            },
        )
}

/// In-process link applying commands to the shared store.
pub struct LocalLink<S> {
    store: Arc<S>,
}

impl<S: CoherenceStore> LocalLink<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    async fn apply(&self, command: &InvalidationCommand) -> Result<InvalidationAck, EngineError> {
        let Some(row) = self.store.get_state(&command.target).await? else {
            return Err(EngineError::not_found(
                RecordKind::State,
                command.target.to_string(),
            ));
        };
        let next = match command.mode {
            InvalidationMode::Fence => CoherenceState::Invalid,
            InvalidationMode::Demote => demote_on_invalidation(row.consistency_type, row.state),
        };
        let unchanged = InvalidationAck {
            target: command.target.clone(),
            from: row.state,
            to: row.state,
            applied: false,
        };
        // Stale or no-op commands are dropped.
        if next == row.state || row.version >= command.version {
            return Ok(unchanged);
        }
        let update = row
            .update()
            .state(next)
            .touched(OffsetDateTime::now_utc());
        let meta = TransitionMeta {
            operation: OperationKind::Write,
            cause: TransitionCause::Invalidation,
            gom_instance_id: command.gom_instance_id.as_deref(),
        };
        let updated = journal::commit(self.store.as_ref(), &row, update, meta).await?;
        Ok(InvalidationAck {
            target: command.target.clone(),
            from: row.state,
            to: updated.state,
            applied: true,
        })
    }
}

#[async_trait]
impl<S: CoherenceStore> PeerLink for LocalLink<S> {
    async fn invalidate(
        &self,
        command: InvalidationCommand,
    ) -> Result<InvalidationAck, EngineError> {
        self.apply(&command).await
    }

    async fn fetch(&self, component_id: &str) -> Result<AuthoritativeCopy, EngineError> {
        let rows = self.store.list_states(Some(component_id)).await?;
        Ok(authoritative_copy(&rows))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use megamodel_storage::{ComponentRecord, ConsistencyType, MemoryStore, MicroserviceRecord};

    fn row(ms: &str, state: CoherenceState, version: u64) -> CoherenceRecord {
        CoherenceRecord {
            id: 0,
            microservice_id: ms.into(),
            component_id: "c1".into(),
            state,
            consistency_type: ConsistencyType::Eventual,
            version,
            revision: 0,
            timestamp: OffsetDateTime::UNIX_EPOCH,
            staleness_bound_ms: None,
        }
    }

    #[test]
    fn modified_holder_is_authoritative() {
        let rows = vec![
            row("m1", CoherenceState::SharedPlus, 9),
            row("m2", CoherenceState::Modified, 4),
        ];
        let copy = authoritative_copy(&rows);
        assert_eq!(copy.version, 4);
        assert_eq!(copy.holder, Some(StateKey::new("m2", "c1")));
    }

    #[test]
    fn falls_back_to_shared_plus_then_any_row() {
        let rows = vec![
            row("m1", CoherenceState::SharedMinus, 7),
            row("m2", CoherenceState::SharedPlus, 5),
        ];
        assert_eq!(authoritative_copy(&rows).version, 5);

        let rows = vec![
            row("m1", CoherenceState::Invalid, 3),
            row("m2", CoherenceState::SharedMinus, 2),
        ];
        assert_eq!(authoritative_copy(&rows).version, 3);
        assert_eq!(
            authoritative_copy(&[]),
            AuthoritativeCopy {
                version: 0,
                holder: None
            }
        );
    }

    type Seed<'a> = (&'a str, CoherenceState, ConsistencyType, u64);

    async fn store_with(rows: &[Seed<'_>]) -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        store.open().await.unwrap();
        store
            .insert_component(ComponentRecord {
                id: "c1".into(),
                name: "c1".into(),
                metamodel: String::new(),
                description: String::new(),
            })
            .await
            .unwrap();
        for (ms, state, ct, version) in rows {
            store
                .insert_microservice(MicroserviceRecord {
                    id: ms.to_string(),
                    name: ms.to_string(),
                    description: String::new(),
                })
                .await
                .unwrap();
            let key = StateKey::new(*ms, "c1");
            let row = store.get_or_init(&key, *ct, None).await.unwrap();
            store
                .compare_and_swap(
                    &key,
                    row.revision,
                    row.update().state(*state).version(*version),
                )
                .await
                .unwrap();
        }
        store
    }

    fn command(ms: &str, mode: InvalidationMode, version: u64) -> InvalidationCommand {
        InvalidationCommand {
            target: StateKey::new(ms, "c1"),
            mode,
            version,
            gom_instance_id: None,
        }
    }

    #[tokio::test]
    async fn demotion_depends_on_peer_policy() {
        let store = store_with(&[
            ("m1", CoherenceState::SharedPlus, ConsistencyType::Eventual, 1),
            ("m2", CoherenceState::SharedPlus, ConsistencyType::Strong, 1),
        ])
        .await;
        let link = LocalLink::new(store.clone());

        let ack = link
            .invalidate(command("m1", InvalidationMode::Demote, 2))
            .await
            .unwrap();
        assert!(ack.applied);
        assert_eq!(ack.to, CoherenceState::SharedMinus);

        let ack = link
            .invalidate(command("m2", InvalidationMode::Demote, 2))
            .await
            .unwrap();
        assert_eq!(ack.to, CoherenceState::Invalid);

        let log = store.list_transitions(0).await.unwrap();
        assert_eq!(log.len(), 2);
        assert!(log.iter().all(|t| t.cause == TransitionCause::Invalidation));
    }

    #[tokio::test]
    async fn stale_commands_are_dropped() {
        let store = store_with(&[(
            "m1",
            CoherenceState::SharedPlus,
            ConsistencyType::Eventual,
            5,
        )])
        .await;
        let link = LocalLink::new(store.clone());
        let ack = link
            .invalidate(command("m1", InvalidationMode::Fence, 5))
            .await
            .unwrap();
        assert!(!ack.applied);
        let row = store
            .get_state(&StateKey::new("m1", "c1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.state, CoherenceState::SharedPlus);
    }

    #[tokio::test]
    async fn fence_invalidates_and_keeps_version() {
        let store = store_with(&[(
            "m1",
            CoherenceState::Modified,
            ConsistencyType::Eventual,
            3,
        )])
        .await;
        let link = LocalLink::new(store.clone());
        let ack = link
            .invalidate(command("m1", InvalidationMode::Fence, 4))
            .await
            .unwrap();
        assert_eq!(
            (ack.from, ack.to),
            (CoherenceState::Modified, CoherenceState::Invalid)
        );
        let copy = link.fetch("c1").await.unwrap();
        assert_eq!(copy.version, 3);
    }
}
