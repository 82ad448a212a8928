//! Megamodel coherence engine.
//!
//! Keeps per-(microservice, component) copies of shared components coherent
//! with an MSI-style protocol (`MODIFIED`, `SHARED_PLUS`, `SHARED_MINUS`,
//! `INVALID`) under one of five consistency contracts, and drives Global
//! Operation Model instances against it.
//!
//! The pieces, leaf first:
//!
//! - [`policy`]: what a read or write may do under each consistency type
//! - [`CoherenceEngine`]: reads, writes, fencing and invalidation fan-out
//! - [`PeerLink`]: the command channel invalidations and fetches travel over
//! - [`GomOrchestrator`]: executes GOM instances step by step
//! - [`MetricsAggregator`]: read-only projections over the logs
//!
//! All state lives behind an injected [`CoherenceStore`](megamodel_storage::CoherenceStore).

pub mod catalog;
pub mod condition;
pub mod config;
pub mod error;
mod fence;
mod journal;
pub mod link;
pub mod metrics;
pub mod orchestrator;
pub mod policy;
mod session;
mod sweeper;
pub mod transition;

pub use catalog::{Catalog, ComponentDraft, GomDraft, MicroserviceDraft};
pub use condition::{Condition, ConditionError};
pub use config::{ConfigError, EngineConfig};
pub use error::{EngineError, ErrorKind};
pub use link::{
    AuthoritativeCopy, InvalidationAck, InvalidationCommand, InvalidationMode, LocalLink, PeerLink,
};
pub use metrics::{ActivityEntry, MetricsAggregator, MetricsSnapshot};
pub use orchestrator::{ExecuteRequest, GomOrchestrator, Trigger};
pub use policy::{ConsistencyPolicy, FenceMode, Guarantee, ReadDecision};
pub use sweeper::{spawn_sweeper, SweepReport};
pub use transition::{CoherenceEngine, OperationReport, OperationRequest};
