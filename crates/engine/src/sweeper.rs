//! Background anti-entropy sweep.
//!
//! Expires `BOUNDED_STALENESS` copies that outlived their bound and catches
//! `EVENTUAL` copies up with the authoritative version.

use std::sync::Arc;

use megamodel_storage::{
    CoherenceRecord, CoherenceState, CoherenceStore, ConsistencyType, OperationKind,
    TransitionCause,
};
use serde::Serialize;
use time::OffsetDateTime;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::error::EngineError;
use crate::journal::{self, TransitionMeta};
use crate::transition::CoherenceEngine;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepReport {
    /// Rows moved to `INVALID` because their copy outlived the bound.
    pub expired: usize,
    /// Rows moved to `SHARED_PLUS` at a newer version.
    pub refreshed: usize,
    pub failed: usize,
}

enum Swept {
    Expired,
    Refreshed,
}

const SWEEP: TransitionMeta<'static> = TransitionMeta {
    operation: OperationKind::Read,
    cause: TransitionCause::Sweep,
    gom_instance_id: None,
};

impl<S: CoherenceStore> CoherenceEngine<S> {
    /// Run one sweep over every `SHARED_MINUS` row.
    ///
    /// Rows that change concurrently are skipped until the next sweep.
    pub async fn sweep_once(&self) -> Result<SweepReport, EngineError> {
        let now = OffsetDateTime::now_utc();
        let rows = self.store.list_states(None).await?;
        let mut report = SweepReport::default();

        for row in rows
            .iter()
            .filter(|r| r.state == CoherenceState::SharedMinus)
        {
            let outcome = match row.consistency_type {
                ConsistencyType::BoundedStaleness => {
                    let bound = row
                        .staleness_bound_ms
                        .unwrap_or(self.config.default_staleness_bound_ms);
                    if row.age_ms(now) <= bound {
                        continue;
                    }
                    self.expire(row).await.map(|()| Swept::Expired)
                }
                ConsistencyType::Eventual => match self.catch_up(row).await {
                    Ok(true) => Ok(Swept::Refreshed),
                    Ok(false) => continue,
                    Err(e) => Err(e),
                },
                _ => continue,
            };
            match outcome {
                Ok(Swept::Expired) => report.expired += 1,
                Ok(Swept::Refreshed) => report.refreshed += 1,
                Err(e) if e.is_conflict() => {
                    tracing::debug!(key = %row.key(), "row moved during sweep, skipped");
                }
                Err(e) => {
                    tracing::error!(key = %row.key(), error = %e, "sweep failed for row");
                    report.failed += 1;
                }
            }
        }

        if report != SweepReport::default() {
            tracing::info!(
                expired = report.expired,
                refreshed = report.refreshed,
                failed = report.failed,
                "sweep finished"
            );
        }
        Ok(report)
    }

    async fn expire(&self, row: &CoherenceRecord) -> Result<(), EngineError> {
        let update = row
            .update()
            .state(CoherenceState::Invalid)
            .touched(OffsetDateTime::now_utc());
        journal::commit(self.store.as_ref(), row, update, SWEEP).await?;
        Ok(())
    }

    /// Refresh an EVENTUAL copy that trails the authoritative version.
    async fn catch_up(&self, row: &CoherenceRecord) -> Result<bool, EngineError> {
        let wait = self.config.refetch_timeout();
        let _fence = self.fences.acquire(&row.component_id, wait).await?;
        let copy = tokio::time::timeout(wait, self.link.fetch(&row.component_id))
            .await
            .map_err(|_| EngineError::Timeout {
                operation: format!("sweep refetch of {}", row.key()),
                after_ms: self.config.refetch_timeout_ms,
            })??;
        if copy.version <= row.version {
            return Ok(false);
        }
        let update = row
            .update()
            .state(CoherenceState::SharedPlus)
            .version(copy.version)
            .touched(OffsetDateTime::now_utc());
        journal::commit(self.store.as_ref(), row, update, SWEEP).await?;
        Ok(true)
    }
}

/// Run [`CoherenceEngine::sweep_once`] every `sweep_interval_ms`.
///
/// Returns `None` when the sweeper is disabled. Abort the handle to stop it.
pub fn spawn_sweeper<S: CoherenceStore>(
    engine: Arc<CoherenceEngine<S>>,
) -> Option<JoinHandle<()>> {
    let period = engine.config().sweep_interval()?;
    Some(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if let Err(e) = engine.sweep_once().await {
                tracing::error!(error = %e, "sweep failed");
            }
        }
    }))
}
