use std::fmt;

use megamodel_storage::{ConsistencyType, RecordKind, StateKey, StorageError};
use serde::{Deserialize, Serialize};

use crate::condition::ConditionError;

/// Stable, client-facing classification of an [`EngineError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    NotFound,
    ConsistencyViolation,
    CoherenceConflict,
    PreconditionFailed,
    PostconditionFailed,
    Timeout,
    #[serde(rename = "VALIDATION_ERROR")]
    Validation,
    Storage,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NotFound => "NOT_FOUND",
            ErrorKind::ConsistencyViolation => "CONSISTENCY_VIOLATION",
            ErrorKind::CoherenceConflict => "COHERENCE_CONFLICT",
            ErrorKind::PreconditionFailed => "PRECONDITION_FAILED",
            ErrorKind::PostconditionFailed => "POSTCONDITION_FAILED",
            ErrorKind::Timeout => "TIMEOUT",
            ErrorKind::Validation => "VALIDATION_ERROR",
            ErrorKind::Storage => "STORAGE",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors surfaced by the engine, the catalog and the orchestrator.
#[derive(Debug, Clone, thiserror::Error)]
pub enum EngineError {
    #[error("{kind} not found: {id}")]
    NotFound { kind: RecordKind, id: String },

    /// The consistency policy rejected the operation.
    #[error("consistency violation on {key} under {consistency_type}: {reason}")]
    ConsistencyViolation {
        key: StateKey,
        consistency_type: ConsistencyType,
        reason: String,
    },

    /// CAS or fencing retries were exhausted.
    #[error("coherence conflict on {key} after {attempts} attempts")]
    CoherenceConflict { key: StateKey, attempts: u32 },

    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("postcondition failed: {0}")]
    PostconditionFailed(String),

    /// Fencing, fence-lock acquisition or a refetch exceeded its bound.
    #[error("{operation} timed out after {after_ms} ms")]
    Timeout { operation: String, after_ms: u64 },

    #[error("validation error: {0}")]
    Validation(String),

    #[error("storage error: {0}")]
    Storage(StorageError),
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::NotFound { .. } => ErrorKind::NotFound,
            EngineError::ConsistencyViolation { .. } => ErrorKind::ConsistencyViolation,
            EngineError::CoherenceConflict { .. } => ErrorKind::CoherenceConflict,
            EngineError::PreconditionFailed(_) => ErrorKind::PreconditionFailed,
            EngineError::PostconditionFailed(_) => ErrorKind::PostconditionFailed,
            EngineError::Timeout { .. } => ErrorKind::Timeout,
            EngineError::Validation(_) => ErrorKind::Validation,
            EngineError::Storage(_) => ErrorKind::Storage,
        }
    }

    /// Whether a whole write may be retried after this error.
    pub(crate) fn is_conflict(&self) -> bool {
        matches!(
            self,
            EngineError::CoherenceConflict { .. }
                | EngineError::Storage(StorageError::ConcurrentConflict { .. })
        )
    }

    pub(crate) fn not_found(kind: RecordKind, id: impl Into<String>) -> Self {
        EngineError::NotFound {
            kind,
            id: id.into(),
        }
    }
}

impl From<StorageError> for EngineError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::NotFound { kind, id } => EngineError::NotFound { kind, id },
            StorageError::AlreadyExists { kind, id } => {
                EngineError::Validation(format!("{kind} already exists: {id}"))
            }
            other => EngineError::Storage(other),
        }
    }
}

impl From<ConditionError> for EngineError {
    fn from(e: ConditionError) -> Self {
        EngineError::Validation(e.to_string())
    }
}
