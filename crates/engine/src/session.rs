//! Session marks for READ_MY_WRITES and MONOTONIC_READS.

use std::collections::HashMap;

use tokio::sync::RwLock;

use crate::policy::SessionMarks;

/// Marks kept before the least recently touched ones are evicted.
const MAX_MARKS: usize = 65_536;

/// Last write and highest observed version per (session, component).
///
/// Callers choose session ids freely, so the ledger is bounded: past
/// `capacity` entries the least recently touched mark is dropped.
pub(crate) struct SessionLedger {
    capacity: usize,
    inner: RwLock<Ledger>,
}

#[derive(Default)]
struct Ledger {
    clock: u64,
    marks: HashMap<(String, String), (SessionMarks, u64)>,
}

impl Ledger {
    fn touch(&mut self, session: &str, component_id: &str, capacity: usize) -> &mut SessionMarks {
        self.clock += 1;
        let key = (session.to_string(), component_id.to_string());
        if !self.marks.contains_key(&key) && self.marks.len() >= capacity {
            let oldest = self
                .marks
                .iter()
                .min_by_key(|(_, (_, touched))| *touched)
                .map(|(k, _)| k.clone());
            if let Some(oldest) = oldest {
                self.marks.remove(&oldest);
            }
        }
        let clock = self.clock;
        let entry = self.marks.entry(key).or_default();
        entry.1 = clock;
        &mut entry.0
    }
}

impl Default for SessionLedger {
    fn default() -> Self {
        Self::with_capacity(MAX_MARKS)
    }
}

impl SessionLedger {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: RwLock::new(Ledger::default()),
        }
    }

    pub async fn marks(&self, session: &str, component_id: &str) -> SessionMarks {
        self.inner
            .read()
            .await
            .marks
            .get(&(session.to_string(), component_id.to_string()))
            .map(|(marks, _)| *marks)
            .unwrap_or_default()
    }

    pub async fn record_write(&self, session: &str, component_id: &str, version: u64) {
        let mut inner = self.inner.write().await;
        let entry = inner.touch(session, component_id, self.capacity);
        entry.last_write = Some(version);
        entry.last_observed = Some(entry.last_observed.map_or(version, |v| v.max(version)));
    }

    pub async fn record_observed(&self, session: &str, component_id: &str, version: u64) {
        let mut inner = self.inner.write().await;
        let entry = inner.touch(session, component_id, self.capacity);
        entry.last_observed = Some(entry.last_observed.map_or(version, |v| v.max(version)));
    }

    /// Drop every mark of a session.
    pub async fn end_session(&self, session: &str) {
        self.inner
            .write()
            .await
            .marks
            .retain(|(s, _), _| s != session);
    }

    /// Drop every mark on a component.
    pub async fn forget_component(&self, component_id: &str) {
        self.inner
            .write()
            .await
            .marks
            .retain(|(_, c), _| c != component_id);
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.marks.len()
    }
}
