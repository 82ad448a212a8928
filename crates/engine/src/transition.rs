//! Transition engine: reads, writes, fencing and invalidation fan-out.
//!
//! Row updates go through the store's compare-and-swap. Writes and coherence
//! fetches on one component are serialised by a per-component fence lock;
//! reads served from a valid copy take no lock at all. A write that loses a
//! CAS race, or whose peer fencing conflicts, is retried as a whole with
//! exponential backoff until `max_write_retries` is exhausted.

use std::future::Future;
use std::sync::Arc;

use megamodel_storage::{
    CoherenceRecord, CoherenceState, CoherenceStore, ConsistencyType, OperationKind,
    OperationOutcome, OperationRecord, RecordKind, StateKey,
};
use serde::Serialize;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use tokio::task::JoinSet;

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::fence::FenceTable;
use crate::journal::{self, TransitionMeta};
use crate::link::{InvalidationCommand, InvalidationMode, LocalLink, PeerLink};
use crate::policy::{
    ConsistencyPolicy, FenceMode, Guarantee, ReadContext, ReadDecision, SessionMarks,
};
use crate::session::SessionLedger;

/// A read or write on one (microservice, component) pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationRequest {
    pub key: StateKey,
    /// Consistency type for this operation only; the row's own type otherwise.
    pub consistency: Option<ConsistencyType>,
    /// Session for READ_MY_WRITES / MONOTONIC_READS; defaults to the microservice id.
    pub session_id: Option<String>,
    pub gom_instance_id: Option<String>,
}

impl OperationRequest {
    pub fn new(microservice_id: impl Into<String>, component_id: impl Into<String>) -> Self {
        Self {
            key: StateKey::new(microservice_id, component_id),
            consistency: None,
            session_id: None,
            gom_instance_id: None,
        }
    }

    pub fn with_consistency(mut self, consistency: ConsistencyType) -> Self {
        self.consistency = Some(consistency);
        self
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_gom_instance(mut self, instance_id: impl Into<String>) -> Self {
        self.gom_instance_id = Some(instance_id.into());
        self
    }

    fn session(&self) -> &str {
        self.session_id
            .as_deref()
            .unwrap_or(&self.key.microservice_id)
    }
}

/// Outcome of a successful read or write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationReport {
    pub operation: OperationKind,
    /// The row after the operation.
    pub row: CoherenceRecord,
    pub from_state: CoherenceState,
    /// Version the caller read or wrote.
    pub served_version: u64,
    pub guarantee: Guarantee,
    /// Whether a coherence fetch from the authoritative holder happened.
    pub refreshed: bool,
}

/// The coherence protocol engine.
///
/// Stateless apart from the fence locks, the session marks and the set of
/// in-flight deferred invalidations; everything durable lives in the store.
pub struct CoherenceEngine<S: CoherenceStore> {
    pub(crate) store: Arc<S>,
    pub(crate) link: Arc<dyn PeerLink>,
    pub(crate) config: Arc<EngineConfig>,
    pub(crate) fences: FenceTable,
    sessions: SessionLedger,
    fanout: Mutex<JoinSet<()>>,
}

impl<S: CoherenceStore> CoherenceEngine<S> {
    /// Engine delivering invalidations in-process through a [`LocalLink`].
    pub fn new(store: Arc<S>, config: EngineConfig) -> Self {
        let config = Arc::new(config);
        let link = Arc::new(LocalLink::new(store.clone()));
        Self::with_link(store, link, config)
    }

    pub fn with_link(
        store: Arc<S>,
        link: Arc<dyn PeerLink>,
        config: Arc<EngineConfig>,
    ) -> Self {
        Self {
            store,
            link,
            config,
            fences: FenceTable::default(),
            sessions: SessionLedger::default(),
            fanout: Mutex::new(JoinSet::new()),
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // ──────────────────────────────────────────────
    // Rows
    // ──────────────────────────────────────────────

    pub async fn get_state(&self, key: &StateKey) -> Result<CoherenceRecord, EngineError> {
        self.store
            .get_state(key)
            .await?
            .ok_or_else(|| EngineError::not_found(RecordKind::State, key.to_string()))
    }

    pub async fn list_states(
        &self,
        component_id: Option<&str>,
    ) -> Result<Vec<CoherenceRecord>, EngineError> {
        Ok(self.store.list_states(component_id).await?)
    }

    /// Set the consistency type (and staleness bound) of a row, registering
    /// the row first if needed. Does not change state, version or timestamp.
    pub async fn configure(
        &self,
        key: &StateKey,
        consistency_type: ConsistencyType,
        staleness_bound_ms: Option<u64>,
    ) -> Result<CoherenceRecord, EngineError> {
        let bound = self.config.bound_for(consistency_type, staleness_bound_ms);
        let row = self
            .with_retries(key, || async move {
                let row = self.register(key).await?;
                let update = row.update().policy(consistency_type, bound);
                let row = self.store.compare_and_swap(key, row.revision, update).await?;
                Ok::<_, EngineError>(row)
            })
            .await?;
        tracing::info!(
            microservice = %key.microservice_id,
            component = %key.component_id,
            consistency = %consistency_type,
            staleness_bound_ms = ?bound,
            "consistency policy updated"
        );
        Ok(row)
    }

    async fn register(&self, key: &StateKey) -> Result<CoherenceRecord, EngineError> {
        let consistency = self.config.default_consistency;
        Ok(self
            .store
            .get_or_init(key, consistency, self.config.bound_for(consistency, None))
            .await?)
    }

    fn policy_for(
        &self,
        row: &CoherenceRecord,
        requested: Option<ConsistencyType>,
    ) -> ConsistencyPolicy {
        let consistency = requested.unwrap_or(row.consistency_type);
        let bound = if consistency == row.consistency_type {
            row.staleness_bound_ms
        } else {
            None
        };
        ConsistencyPolicy::new(consistency, bound, self.config.default_staleness_bound_ms)
    }

    // ──────────────────────────────────────────────
    // Read
    // ──────────────────────────────────────────────

    pub async fn read(&self, req: &OperationRequest) -> Result<OperationReport, EngineError> {
        let result = self.read_inner(req).await;
        self.log_attempt(req, OperationKind::Read, &result).await;
        result
    }

    async fn read_inner(&self, req: &OperationRequest) -> Result<OperationReport, EngineError> {
        let row = self.register(&req.key).await?;
        let policy = self.policy_for(&row, req.consistency);
        let session = req.session();
        let marks = self.sessions.marks(session, &req.key.component_id).await;
        let decision = policy.on_read(&ReadContext {
            row: &row,
            now: OffsetDateTime::now_utc(),
            session: marks,
        });

        let report = match decision {
            ReadDecision::Serve(guarantee) => {
                let meta =
                    TransitionMeta::direct(OperationKind::Read, req.gom_instance_id.as_deref());
                journal::record(self.store.as_ref(), row.state, &row, meta).await?;
                OperationReport {
                    operation: OperationKind::Read,
                    from_state: row.state,
                    served_version: row.version,
                    guarantee,
                    refreshed: false,
                    row,
                }
            }
            ReadDecision::Fetch { target } => {
                self.with_retries(&req.key, || self.try_refresh(req, policy, target, marks))
                    .await?
            }
        };

        self.sessions
            .record_observed(session, &req.key.component_id, report.served_version)
            .await;
        Ok(report)
    }

    /// Pull the authoritative version into the caller's row.
    async fn try_refresh(
        &self,
        req: &OperationRequest,
        policy: ConsistencyPolicy,
        target: CoherenceState,
        marks: SessionMarks,
    ) -> Result<OperationReport, EngineError> {
        let wait = self.config.refetch_timeout();
        let _fence = self.fences.acquire(&req.key.component_id, wait).await?;
        let meta = TransitionMeta::direct(OperationKind::Read, req.gom_instance_id.as_deref());

        // The row may have moved while we waited for the lock.
        let row = self.register(&req.key).await?;
        if row.state == CoherenceState::Modified {
            journal::record(self.store.as_ref(), row.state, &row, meta).await?;
            return Ok(OperationReport {
                operation: OperationKind::Read,
                from_state: row.state,
                served_version: row.version,
                guarantee: Guarantee::Exclusive,
                refreshed: false,
                row,
            });
        }

        let copy = tokio::time::timeout(wait, self.link.fetch(&req.key.component_id))
            .await
            .map_err(|_| EngineError::Timeout {
                operation: format!("refetch of {}", req.key),
                after_ms: self.config.refetch_timeout_ms,
            })??;
        let guarantee = policy
            .admit_fetched(copy.version, &marks)
            .map_err(|reason| EngineError::ConsistencyViolation {
                key: req.key.clone(),
                consistency_type: policy.consistency_type(),
                reason,
            })?;

        let updated = if row.state == target && row.version == copy.version {
            journal::record(self.store.as_ref(), row.state, &row, meta).await?;
            row.clone()
        } else {
            let update = row
                .update()
                .state(target)
                .version(copy.version)
                .touched(OffsetDateTime::now_utc());
            journal::commit(self.store.as_ref(), &row, update, meta).await?
        };
        Ok(OperationReport {
            operation: OperationKind::Read,
            from_state: row.state,
            served_version: updated.version,
            guarantee,
            refreshed: true,
            row: updated,
        })
    }

    // ──────────────────────────────────────────────
    // Write
    // ──────────────────────────────────────────────

    pub async fn write(&self, req: &OperationRequest) -> Result<OperationReport, EngineError> {
        let result = self.write_inner(req).await;
        self.log_attempt(req, OperationKind::Write, &result).await;
        result
    }

    async fn write_inner(&self, req: &OperationRequest) -> Result<OperationReport, EngineError> {
        let (report, deferred) = self
            .with_retries(&req.key, || self.try_write(req))
            .await?;
        self.sessions
            .record_write(req.session(), &req.key.component_id, report.served_version)
            .await;
        if !deferred.is_empty() {
            self.spawn_fanout(deferred).await;
        }
        Ok(report)
    }

    /// One write attempt: fence the peers that must be fenced up front, then
    /// take `MODIFIED`. Returns the invalidations left for the fan-out.
    async fn try_write(
        &self,
        req: &OperationRequest,
    ) -> Result<(OperationReport, Vec<InvalidationCommand>), EngineError> {
        let wait = self.config.fence_timeout();
        let _fence = self.fences.acquire(&req.key.component_id, wait).await?;

        let own = self.register(&req.key).await?;
        let policy = self.policy_for(&own, req.consistency);
        let mut peers: Vec<CoherenceRecord> = self
            .store
            .list_states(Some(&req.key.component_id))
            .await?
            .into_iter()
            .filter(|r| r.microservice_id != own.microservice_id)
            .collect();
        peers.sort_by(|a, b| a.microservice_id.cmp(&b.microservice_id));
        // Rows of deleted microservices are gone; the high-water mark is not.
        let high_water = self
            .store
            .version_high_water(&req.key.component_id)
            .await?;
        let next_version = peers
            .iter()
            .map(|r| r.version)
            .fold(own.version.max(high_water), u64::max)
            + 1;

        let synchronous = policy.fence_mode() == FenceMode::Synchronous;
        let mut deferred = Vec::new();
        for peer in &peers {
            if peer.state == CoherenceState::Invalid {
                continue;
            }
            // A MODIFIED peer is always fenced first: only one row may hold MODIFIED.
            let fence_now = synchronous || peer.state == CoherenceState::Modified;
            let command = InvalidationCommand {
                target: peer.key(),
                mode: if fence_now {
                    InvalidationMode::Fence
                } else {
                    InvalidationMode::Demote
                },
                version: next_version,
                gom_instance_id: req.gom_instance_id.clone(),
            };
            if !fence_now {
                deferred.push(command);
                continue;
            }
            tokio::time::timeout(wait, self.link.invalidate(command))
                .await
                .map_err(|_| EngineError::Timeout {
                    operation: format!("fencing {}", peer.key()),
                    after_ms: self.config.fence_timeout_ms,
                })??;
        }

        let update = own
            .update()
            .state(CoherenceState::Modified)
            .version(next_version)
            .touched(OffsetDateTime::now_utc());
        let meta = TransitionMeta::direct(OperationKind::Write, req.gom_instance_id.as_deref());
        let updated = journal::commit(self.store.as_ref(), &own, update, meta).await?;
        let report = OperationReport {
            operation: OperationKind::Write,
            from_state: own.state,
            served_version: next_version,
            guarantee: Guarantee::Exclusive,
            refreshed: false,
            row: updated,
        };
        Ok((report, deferred))
    }

    async fn spawn_fanout(&self, commands: Vec<InvalidationCommand>) {
        let link = self.link.clone();
        let config = self.config.clone();
        let mut tasks = self.fanout.lock().await;
        while tasks.try_join_next().is_some() {}
        tasks.spawn(async move {
            for command in commands {
                deliver_deferred(link.as_ref(), &config, command).await;
            }
        });
    }

    /// Wait until every deferred invalidation issued so far has been delivered.
    pub async fn settle(&self) {
        let mut tasks = std::mem::take(&mut *self.fanout.lock().await);
        while tasks.join_next().await.is_some() {}
    }

    // ──────────────────────────────────────────────
    // Sessions
    // ──────────────────────────────────────────────

    /// Forget the READ_MY_WRITES / MONOTONIC_READS marks of a session.
    pub async fn end_session(&self, session_id: &str) {
        self.sessions.end_session(session_id).await;
    }

    /// Release what the engine keeps for a deleted component.
    pub async fn forget_component(&self, component_id: &str) {
        self.sessions.forget_component(component_id).await;
        self.fences.forget(component_id).await;
    }

    /// Release the default session of a deleted microservice.
    pub async fn forget_microservice(&self, microservice_id: &str) {
        self.sessions.end_session(microservice_id).await;
    }

    /// Number of (session, component) marks currently held.
    pub async fn tracked_sessions(&self) -> usize {
        self.sessions.len().await
    }

    // ──────────────────────────────────────────────
    // Helpers
    // ──────────────────────────────────────────────

    async fn with_retries<T, F, Fut>(
        &self,
        key: &StateKey,
        mut attempt_op: F,
    ) -> Result<T, EngineError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, EngineError>>,
    {
        let mut attempt = 0;
        loop {
            match attempt_op().await {
                Err(e) if e.is_conflict() => {
                    if attempt >= self.config.max_write_retries {
                        return Err(EngineError::CoherenceConflict {
                            key: key.clone(),
                            attempts: attempt + 1,
                        });
                    }
                    tracing::debug!(key = %key, attempt, error = %e, "conflict, retrying");
                    tokio::time::sleep(self.config.backoff(attempt)).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    /// Append the operation log entry for an attempt, applied or rejected.
    async fn log_attempt(
        &self,
        req: &OperationRequest,
        operation: OperationKind,
        result: &Result<OperationReport, EngineError>,
    ) {
        let (outcome, consistency_type, error_kind, message) = match result {
            Ok(report) => (
                OperationOutcome::Applied,
                Some(req.consistency.unwrap_or(report.row.consistency_type)),
                None,
                None,
            ),
            Err(e) => {
                tracing::warn!(
                    microservice = %req.key.microservice_id,
                    component = %req.key.component_id,
                    operation = %operation,
                    kind = %e.kind(),
                    error = %e,
                    "operation rejected"
                );
                (
                    OperationOutcome::Rejected,
                    req.consistency,
                    Some(e.kind().as_str().to_string()),
                    Some(e.to_string()),
                )
            }
        };
        let record = OperationRecord {
            seq: 0,
            microservice_id: req.key.microservice_id.clone(),
            component_id: req.key.component_id.clone(),
            operation,
            consistency_type,
            outcome,
            error_kind,
            message,
            gom_instance_id: req.gom_instance_id.clone(),
            timestamp: OffsetDateTime::now_utc(),
        };
        if let Err(e) = self.store.append_operation(record).await {
            tracing::error!(error = %e, "failed to append operation record");
        }
    }
}

/// Deliver one deferred invalidation, retrying conflicts with backoff. No
/// fence lock is held here.
async fn deliver_deferred(
    link: &dyn PeerLink,
    config: &EngineConfig,
    command: InvalidationCommand,
) {
    let peer = command.target.clone();
    let wait = config.fence_timeout();
    let mut attempt = 0;
    loop {
        match tokio::time::timeout(wait, link.invalidate(command.clone())).await {
            Ok(Ok(_)) => return,
            Ok(Err(e)) if e.is_conflict() && attempt < config.max_write_retries => {
                tokio::time::sleep(config.backoff(attempt)).await;
                attempt += 1;
            }
            Ok(Err(e)) => {
                tracing::warn!(peer = %peer, error = %e, "deferred invalidation failed");
                return;
            }
            Err(_) => {
                tracing::warn!(peer = %peer, "deferred invalidation timed out");
                return;
            }
        }
    }
}
