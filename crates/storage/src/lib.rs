//! Storage layer for the megamodel coherence engine.
//!
//! Holds the coherence table (one row per microservice/component pair), the
//! component and microservice catalogs, Global Operation Models and their
//! instances, and the append-only transition and operation logs.
//!
//! Backends implement [`CoherenceStore`]. [`MemoryStore`] is the bundled
//! in-process backend; [`conformance`] checks any backend against the
//! contract the engine relies on.

pub mod conformance;
mod error;
mod memory;
mod record;
mod traits;

pub use error::{RecordKind, StorageError};
pub use memory::MemoryStore;
pub use record::{
    CoherenceRecord, CoherenceState, CoherenceUpdate, ComponentRecord, ComponentRequirement,
    ConsistencyType, GomInstanceRecord, GomRecord, InstanceFailure, InstanceStatus, InstanceStep,
    MicroserviceRecord, MicroserviceRequirement, OperationKind, OperationOutcome, OperationRecord,
    StateKey, StateSnapshot, TransitionCause, TransitionRecord,
};
pub use traits::CoherenceStore;
