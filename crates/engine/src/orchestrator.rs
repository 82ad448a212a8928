//! GOM orchestrator.
//!
//! Executes one instance of a Global Operation Model: preconditions, then
//! every required (microservice, component) step in declaration order, then
//! postconditions. Steps run sequentially because later steps may rely on
//! the coherence effects of earlier ones. The first failure marks the
//! instance `FAILED` and stops it; transitions already applied stay in place.

use std::collections::BTreeMap;
use std::sync::Arc;

use megamodel_storage::{
    CoherenceRecord, CoherenceStore, GomInstanceRecord, GomRecord, InstanceFailure,
    InstanceStatus, InstanceStep, OperationKind, StateKey, StateSnapshot, StorageError,
};
use serde::Deserialize;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::condition::Condition;
use crate::error::EngineError;
use crate::transition::{CoherenceEngine, OperationRequest};

/// Explicit operation for one step, overriding the requirement's own.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Trigger {
    pub microservice_id: String,
    pub component_id: String,
    pub operation: OperationKind,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteRequest {
    pub name: String,
    #[serde(default)]
    pub triggers: Vec<Trigger>,
}

pub struct GomOrchestrator<S: CoherenceStore> {
    engine: Arc<CoherenceEngine<S>>,
}

/// Why an instance stopped early.
enum Halt {
    /// A condition or step failed; recorded on the instance.
    Failed {
        error: EngineError,
        step: Option<usize>,
    },
    /// The instance was deleted while running.
    Deleted(EngineError),
}

impl Halt {
    /// Classify a failure to read or save the running instance. Only a
    /// missing instance means it was deleted; anything else fails it.
    fn from_store(error: StorageError, step: Option<usize>) -> Self {
        match error {
            StorageError::NotFound { .. } => Halt::Deleted(error.into()),
            error => Halt::Failed {
                error: error.into(),
                step,
            },
        }
    }
}

impl<S: CoherenceStore> GomOrchestrator<S> {
    pub fn new(engine: Arc<CoherenceEngine<S>>) -> Self {
        Self { engine }
    }

    fn store(&self) -> &S {
        self.engine.store().as_ref()
    }

    pub async fn get_instance(&self, id: &str) -> Result<GomInstanceRecord, EngineError> {
        Ok(self.store().get_instance(id).await?)
    }

    pub async fn list_instances(
        &self,
        gom_id: &str,
    ) -> Result<Vec<GomInstanceRecord>, EngineError> {
        Ok(self.store().list_instances(gom_id).await?)
    }

    /// Administrative delete. Transitions the instance applied stay in place.
    pub async fn delete_instance(&self, id: &str) -> Result<(), EngineError> {
        self.store().delete_instance(id).await?;
        tracing::info!(instance = %id, "gom instance deleted");
        Ok(())
    }

    /// Run a new instance of `gom_id` to completion and return it.
    ///
    /// Request problems (unknown GOM, blank name, bad triggers) are returned
    /// as errors before any instance exists. Once the instance is created,
    /// failures are recorded on it and the call returns `Ok` with status
    /// `FAILED`. The errors after that point are the instance being deleted
    /// while it runs and a failure to save its final state.
    pub async fn execute(
        &self,
        gom_id: &str,
        request: ExecuteRequest,
    ) -> Result<GomInstanceRecord, EngineError> {
        let gom = self.store().get_gom(gom_id).await?;
        let name = request.name.trim();
        if name.is_empty() {
            return Err(EngineError::Validation(
                "instance name must not be empty".to_string(),
            ));
        }
        let overrides = resolve_triggers(&gom, &request.triggers)?;
        let preconditions = parse_all(&gom.preconditions)?;
        let postconditions = parse_all(&gom.postconditions)?;

        let now = OffsetDateTime::now_utc();
        let mut instance = GomInstanceRecord {
            id: Uuid::new_v4().to_string(),
            gom_id: gom.id.clone(),
            name: name.to_string(),
            status: InstanceStatus::Running,
            microservice_states: Vec::new(),
            steps: Vec::new(),
            postconditions_held: 0,
            failure: None,
            gom_snapshot: gom.clone(),
            created_at: now,
            updated_at: now,
        };
        self.store().insert_instance(instance.clone()).await?;
        tracing::info!(
            instance = %instance.id,
            gom = %gom.id,
            name = %instance.name,
            "gom instance started"
        );

        let outcome = self
            .run(&gom, &overrides, &preconditions, &postconditions, &mut instance)
            .await;
        // Steps run under the instance id as session; no later run reuses it.
        self.engine.end_session(&instance.id).await;
        match outcome {
            Ok(()) => instance.status = InstanceStatus::Completed,
            Err(Halt::Deleted(error)) => {
                tracing::info!(instance = %instance.id, "gom instance deleted while running");
                return Err(error);
            }
            Err(Halt::Failed { error, step }) => {
                tracing::warn!(
                    instance = %instance.id,
                    kind = %error.kind(),
                    step = ?step,
                    error = %error,
                    "gom instance failed"
                );
                instance.status = InstanceStatus::Failed;
                instance.failure = Some(InstanceFailure {
                    kind: error.kind().as_str().to_string(),
                    message: error.to_string(),
                    step,
                });
            }
        }
        instance.updated_at = OffsetDateTime::now_utc();
        self.store().update_instance(instance.clone()).await?;
        tracing::info!(
            instance = %instance.id,
            status = ?instance.status,
            steps = instance.steps.len(),
            "gom instance finished"
        );
        Ok(instance)
    }

    async fn run(
        &self,
        gom: &GomRecord,
        overrides: &BTreeMap<StateKey, OperationKind>,
        preconditions: &[Condition],
        postconditions: &[Condition],
        instance: &mut GomInstanceRecord,
    ) -> Result<(), Halt> {
        let halt = |error: EngineError, step: Option<usize>| Halt::Failed { error, step };
        let default_consistency = self.engine.config().default_consistency;

        let rows = self.rows().await.map_err(|e| halt(e, None))?;
        for condition in preconditions {
            if !condition.evaluate(&rows, default_consistency) {
                return Err(halt(
                    EngineError::PreconditionFailed(condition.text().to_string()),
                    None,
                ));
            }
        }

        for (index, (microservice_id, requirement)) in gom.steps().enumerate() {
            // Deleting the instance is an administrative stop.
            self.store()
                .get_instance(&instance.id)
                .await
                .map_err(|e| Halt::from_store(e, Some(index)))?;

            let key = StateKey::new(microservice_id, &requirement.component_id);
            let operation = overrides
                .get(&key)
                .copied()
                .unwrap_or(requirement.operation);
            let request = OperationRequest::new(microservice_id, &requirement.component_id)
                .with_consistency(requirement.consistency_type)
                .with_session(&instance.id)
                .with_gom_instance(&instance.id);
            let result = match operation {
                OperationKind::Read => self.engine.read(&request).await,
                OperationKind::Write => self.engine.write(&request).await,
            };

            let mut step = InstanceStep {
                microservice_id: microservice_id.to_string(),
                component_id: requirement.component_id.clone(),
                operation,
                consistency_type: requirement.consistency_type,
                state: None,
                version: None,
                error_kind: None,
                timestamp: OffsetDateTime::now_utc(),
            };
            match result {
                Ok(report) => {
                    step.state = Some(report.row.state);
                    step.version = Some(report.row.version);
                    instance.steps.push(step);
                    record_snapshot(instance, StateSnapshot::from(&report.row));
                }
                Err(error) => {
                    step.error_kind = Some(error.kind().as_str().to_string());
                    instance.steps.push(step);
                    return Err(halt(error, Some(index)));
                }
            }
            instance.updated_at = OffsetDateTime::now_utc();
            self.store()
                .update_instance(instance.clone())
                .await
                .map_err(|e| Halt::from_store(e, Some(index)))?;
        }

        let rows = self.rows().await.map_err(|e| halt(e, None))?;
        for condition in postconditions {
            if !condition.evaluate(&rows, default_consistency) {
                return Err(halt(
                    EngineError::PostconditionFailed(condition.text().to_string()),
                    None,
                ));
            }
            instance.postconditions_held += 1;
        }
        Ok(())
    }

    async fn rows(&self) -> Result<BTreeMap<StateKey, CoherenceRecord>, EngineError> {
        Ok(self
            .store()
            .list_states(None)
            .await?
            .into_iter()
            .map(|row| (row.key(), row))
            .collect())
    }
}

/// Replace the snapshot of the same pair, or append a new one.
fn record_snapshot(instance: &mut GomInstanceRecord, snapshot: StateSnapshot) {
    match instance.microservice_states.iter_mut().find(|s| {
        s.microservice_id == snapshot.microservice_id && s.component_id == snapshot.component_id
    }) {
        Some(existing) => *existing = snapshot,
        None => instance.microservice_states.push(snapshot),
    }
}

fn resolve_triggers(
    gom: &GomRecord,
    triggers: &[Trigger],
) -> Result<BTreeMap<StateKey, OperationKind>, EngineError> {
    let mut overrides = BTreeMap::new();
    for trigger in triggers {
        let known = gom.steps().any(|(m, req)| {
            m == trigger.microservice_id && req.component_id == trigger.component_id
        });
        if !known {
            return Err(EngineError::Validation(format!(
                "trigger {}/{} is not a step of gom {}",
                trigger.microservice_id, trigger.component_id, gom.id
            )));
        }
        overrides.insert(
            StateKey::new(&trigger.microservice_id, &trigger.component_id),
            trigger.operation,
        );
    }
    Ok(overrides)
}

fn parse_all(texts: &[String]) -> Result<Vec<Condition>, EngineError> {
    texts
        .iter()
        .map(|t| Condition::parse(t).map_err(EngineError::from))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use megamodel_storage::RecordKind;

    #[test]
    fn only_a_missing_instance_counts_as_deleted() {
        let missing = StorageError::NotFound {
            kind: RecordKind::Instance,
            id: "i1".to_string(),
        };
        assert!(matches!(
            Halt::from_store(missing, Some(0)),
            Halt::Deleted(EngineError::NotFound { .. })
        ));

        for error in [StorageError::Closed, StorageError::Backend("disk full".into())] {
            match Halt::from_store(error, Some(2)) {
                Halt::Failed { error, step } => {
                    assert_eq!(error.kind(), ErrorKind::Storage);
                    assert_eq!(step, Some(2));
                }
                Halt::Deleted(_) => panic!("storage fault treated as a delete"),
            }
        }
    }
}
