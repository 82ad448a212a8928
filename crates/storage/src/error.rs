use std::fmt;

use crate::record::StateKey;

/// The kind of record a lookup failed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    Component,
    Microservice,
    State,
    Gom,
    Instance,
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RecordKind::Component => "component",
            RecordKind::Microservice => "microservice",
            RecordKind::State => "state",
            RecordKind::Gom => "gom",
            RecordKind::Instance => "gom instance",
        };
        f.write_str(name)
    }
}

/// All errors that can be returned by a CoherenceStore implementation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StorageError {
    /// Optimistic concurrency control conflict: another caller modified the
    /// row concurrently. The expected revision was not found.
    #[error("concurrent conflict on {key}: expected revision {expected_revision}")]
    ConcurrentConflict {
        key: StateKey,
        expected_revision: u64,
    },

    /// No record with the given identity.
    #[error("{kind} not found: {id}")]
    NotFound { kind: RecordKind, id: String },

    /// A record with this identity already exists.
    #[error("{kind} already exists: {id}")]
    AlreadyExists { kind: RecordKind, id: String },

    /// The store has not been opened, or has been closed.
    #[error("store is closed")]
    Closed,

    /// A backend-specific storage error (connection, serialization, etc.).
    #[error("storage backend error: {0}")]
    Backend(String),
}

impl StorageError {
    pub(crate) fn not_found(kind: RecordKind, id: impl Into<String>) -> Self {
        StorageError::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub(crate) fn exists(kind: RecordKind, id: impl Into<String>) -> Self {
        StorageError::AlreadyExists {
            kind,
            id: id.into(),
        }
    }
}
