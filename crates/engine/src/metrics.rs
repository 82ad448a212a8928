//! Metrics and activity views over the transition and operation logs.
//!
//! Every method is a pure projection: nothing here writes to the store, and
//! computing a view twice over the same logs gives the same answer.

use std::collections::BTreeMap;
use std::sync::Arc;

use megamodel_storage::{CoherenceState, CoherenceStore, OperationRecord, TransitionRecord};
use serde::Serialize;

use crate::error::EngineError;

/// One entry of the combined activity log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActivityEntry {
    StateTransition(TransitionRecord),
    Operation(OperationRecord),
}

impl ActivityEntry {
    pub fn seq(&self) -> u64 {
        match self {
            ActivityEntry::StateTransition(t) => t.seq,
            ActivityEntry::Operation(o) => o.seq,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub state_distribution: BTreeMap<CoherenceState, u64>,
    pub total_operations: u64,
    pub transition_counts: BTreeMap<CoherenceState, u64>,
}

pub struct MetricsAggregator<S> {
    store: Arc<S>,
    recent_window: usize,
}

fn zeroed() -> BTreeMap<CoherenceState, u64> {
    CoherenceState::ALL.into_iter().map(|s| (s, 0)).collect()
}

impl<S: CoherenceStore> MetricsAggregator<S> {
    /// `recent_window` is the feed length used when a caller gives no limit.
    pub fn new(store: Arc<S>, recent_window: usize) -> Self {
        Self {
            store,
            recent_window,
        }
    }

    /// Number of rows currently in each state. Every state is present.
    pub async fn state_distribution(
        &self,
    ) -> Result<BTreeMap<CoherenceState, u64>, EngineError> {
        let mut counts = zeroed();
        for row in self.store.list_states(None).await? {
            *counts.entry(row.state).or_default() += 1;
        }
        Ok(counts)
    }

    /// Number of transition records in the log.
    pub async fn total_operations(&self) -> Result<u64, EngineError> {
        Ok(self.store.list_transitions(0).await?.len() as u64)
    }

    /// Number of state changes into each state. Records of operations that
    /// left the state as it was are not counted. Every state is present.
    pub async fn transition_counts(
        &self,
    ) -> Result<BTreeMap<CoherenceState, u64>, EngineError> {
        let mut counts = zeroed();
        for t in self.store.list_transitions(0).await? {
            if t.from_state != t.to_state {
                *counts.entry(t.to_state).or_default() += 1;
            }
        }
        Ok(counts)
    }

    /// The most recent transitions, oldest first.
    pub async fn recent_transitions(
        &self,
        limit: Option<usize>,
    ) -> Result<Vec<TransitionRecord>, EngineError> {
        let limit = limit.unwrap_or(self.recent_window);
        if limit == 0 {
            return Ok(Vec::new());
        }
        Ok(self.store.list_transitions(limit).await?)
    }

    /// Transitions and operation attempts interleaved by sequence number,
    /// most recent `limit` entries, oldest first.
    pub async fn component_logs(
        &self,
        limit: Option<usize>,
    ) -> Result<Vec<ActivityEntry>, EngineError> {
        let limit = limit.unwrap_or(self.recent_window);
        if limit == 0 {
            return Ok(Vec::new());
        }
        let transitions = self.store.list_transitions(limit).await?;
        let operations = self.store.list_operations(limit).await?;
        let mut entries: Vec<ActivityEntry> = transitions
            .into_iter()
            .map(ActivityEntry::StateTransition)
            .chain(operations.into_iter().map(ActivityEntry::Operation))
            .collect();
        entries.sort_by_key(ActivityEntry::seq);
        let skip = entries.len().saturating_sub(limit);
        Ok(entries.split_off(skip))
    }

    pub async fn snapshot(&self) -> Result<MetricsSnapshot, EngineError> {
        Ok(MetricsSnapshot {
            state_distribution: self.state_distribution().await?,
            total_operations: self.total_operations().await?,
            transition_counts: self.transition_counts().await?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use megamodel_storage::{
        ComponentRecord, ConsistencyType, MemoryStore, MicroserviceRecord, OperationKind,
        OperationOutcome, StateKey, TransitionCause,
    };
    use time::OffsetDateTime;

    fn transition(to: CoherenceState) -> TransitionRecord {
        TransitionRecord {
            seq: 0,
            microservice_id: "m1".into(),
            component_id: "c1".into(),
            from_state: CoherenceState::Invalid,
            to_state: to,
            operation: OperationKind::Read,
            cause: TransitionCause::Direct,
            version: 0,
            gom_instance_id: None,
            timestamp: OffsetDateTime::UNIX_EPOCH,
        }
    }

    fn operation() -> OperationRecord {
        OperationRecord {
            seq: 0,
            microservice_id: "m1".into(),
            component_id: "c1".into(),
            operation: OperationKind::Write,
            consistency_type: None,
            outcome: OperationOutcome::Rejected,
            error_kind: Some("TIMEOUT".into()),
            message: None,
            gom_instance_id: None,
            timestamp: OffsetDateTime::UNIX_EPOCH,
        }
    }

    async fn store() -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        store.open().await.unwrap();
        store
    }

    #[tokio::test]
    async fn empty_store_reports_zeroes_for_every_state() {
        let metrics = MetricsAggregator::new(store().await, 50);
        let dist = metrics.state_distribution().await.unwrap();
        assert_eq!(dist.len(), 4);
        assert!(dist.values().all(|&n| n == 0));
        let json = serde_json::to_value(&dist).unwrap();
        assert_eq!(json["SHARED_MINUS"], 0);
        assert_eq!(metrics.total_operations().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn counts_transitions_by_target_state() {
        let store = store().await;
        for to in [
            CoherenceState::SharedMinus,
            CoherenceState::Modified,
            CoherenceState::Modified,
        ] {
            store.append_transition(transition(to)).await.unwrap();
        }
        let metrics = MetricsAggregator::new(store, 50);
        let counts = metrics.transition_counts().await.unwrap();
        assert_eq!(counts[&CoherenceState::Modified], 2);
        assert_eq!(counts[&CoherenceState::SharedMinus], 1);
        assert_eq!(counts[&CoherenceState::Invalid], 0);
        assert_eq!(metrics.total_operations().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn reads_that_keep_the_state_are_not_transitions() {
        let store = store().await;
        store
            .append_transition(transition(CoherenceState::SharedMinus))
            .await
            .unwrap();
        for _ in 0..9 {
            let mut served = transition(CoherenceState::SharedMinus);
            served.from_state = CoherenceState::SharedMinus;
            store.append_transition(served).await.unwrap();
        }
        let metrics = MetricsAggregator::new(store, 50);
        let counts = metrics.transition_counts().await.unwrap();
        assert_eq!(counts[&CoherenceState::SharedMinus], 1);
        assert_eq!(counts.values().sum::<u64>(), 1);
        // Every attempt is still an operation.
        assert_eq!(metrics.total_operations().await.unwrap(), 10);
    }

    #[tokio::test]
    async fn activity_log_interleaves_by_seq_and_keeps_the_tail() {
        let store = store().await;
        for entry in [
            Some(CoherenceState::SharedMinus),
            None,
            Some(CoherenceState::Modified),
            None,
        ] {
            match entry {
                Some(to) => store.append_transition(transition(to)).await.unwrap(),
                None => store.append_operation(operation()).await.unwrap(),
            };
        }

        let metrics = MetricsAggregator::new(store, 50);
        let all = metrics.component_logs(None).await.unwrap();
        let seqs: Vec<u64> = all.iter().map(ActivityEntry::seq).collect();
        assert_eq!(seqs, vec![1, 2, 3, 4]);

        let tail = metrics.component_logs(Some(2)).await.unwrap();
        let tail_seqs: Vec<u64> = tail.iter().map(ActivityEntry::seq).collect();
        assert_eq!(tail_seqs, vec![3, 4]);
        let json = serde_json::to_value(&tail[0]).unwrap();
        assert_eq!(json["type"], "STATE_TRANSITION");
        assert_eq!(json["toState"], "MODIFIED");
    }

    #[tokio::test]
    async fn recomputation_is_idempotent() {
        let store = store().await;
        store
            .insert_microservice(MicroserviceRecord {
                id: "m1".into(),
                name: "m1".into(),
                description: String::new(),
            })
            .await
            .unwrap();
        store
            .insert_component(ComponentRecord {
                id: "c1".into(),
                name: "c1".into(),
                metamodel: String::new(),
                description: String::new(),
            })
            .await
            .unwrap();
        store
            .get_or_init(&StateKey::new("m1", "c1"), ConsistencyType::Eventual, None)
            .await
            .unwrap();
        store
            .append_transition(transition(CoherenceState::SharedPlus))
            .await
            .unwrap();

        let metrics = MetricsAggregator::new(store, 10);
        let first = metrics.snapshot().await.unwrap();
        let second = metrics.snapshot().await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.state_distribution[&CoherenceState::Invalid], 1);
        assert_eq!(
            metrics.recent_transitions(None).await.unwrap(),
            metrics.recent_transitions(None).await.unwrap()
        );
    }
}
