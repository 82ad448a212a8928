//! Per-component fence locks.
//!
//! Writes and coherence fetches on the same component are serialised by one
//! async mutex per component id. Within a write, peers are then fenced in
//! sorted microservice order, so the lock order is deterministic.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::error::EngineError;

#[derive(Default)]
pub(crate) struct FenceTable {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl FenceTable {
    /// Take the fence lock of `component_id`, waiting at most `wait`.
    pub async fn acquire(
        &self,
        component_id: &str,
        wait: Duration,
    ) -> Result<OwnedMutexGuard<()>, EngineError> {
        let lock = {
            let mut locks = self.locks.lock().await;
            if !locks.contains_key(component_id) {
                // Nobody holds or waits on a lock whose only owner is the table.
                locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            }
            locks
                .entry(component_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        tokio::time::timeout(wait, lock.lock_owned())
            .await
            .map_err(|_| EngineError::Timeout {
                operation: format!("fence lock on component {component_id}"),
                after_ms: wait.as_millis() as u64,
            })
    }

    /// Drop the lock of a deleted component unless someone still holds it.
    pub async fn forget(&self, component_id: &str) {
        let mut locks = self.locks.lock().await;
        if locks
            .get(component_id)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(component_id);
        }
    }

    #[cfg(test)]
    async fn len(&self) -> usize {
        self.locks.lock().await.len()
    }
}
