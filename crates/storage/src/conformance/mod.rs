//! Conformance test suite for `CoherenceStore` implementations.
//!
//! This module provides a backend-agnostic test suite that any `CoherenceStore`
//! implementation can run to verify correctness. The suite covers:
//!
//! - **Lifecycle**: closed stores reject calls, open/close round trips
//! - **Compare-and-swap**: implicit registration, revision checks, conflicts
//! - **Concurrency**: racing CAS callers see exactly one winner
//! - **Catalog**: CRUD, duplicate detection, cascading deletes
//! - **Logs**: shared sequence numbering and tail queries
//!
//! # Usage
//!
//! Backend crates call [`run_conformance_suite`] with a factory function that
//! creates a fresh, empty (closed) storage instance for each test:
//!
//! ```ignore
//! use megamodel_storage::conformance::run_conformance_suite;
//!
//! #[tokio::test]
//! async fn sqlite_conformance() {
//!     let report = run_conformance_suite(|| async { SqliteStore::temporary() }).await;
//!     assert!(report.failed == 0, "{report}");
//! }
//! ```

mod cas;
mod catalog;
mod concurrent;
mod lifecycle;
mod log;

use std::fmt;
use std::future::Future;

use time::OffsetDateTime;

use crate::record::{
    ComponentRecord, MicroserviceRecord, OperationKind, OperationOutcome, OperationRecord,
    TransitionCause, TransitionRecord,
};
use crate::{CoherenceState, CoherenceStore};

/// Result of a single conformance test.
#[derive(Debug, Clone)]
pub struct TestResult {
    /// Test category (e.g. "lifecycle", "cas", "catalog").
    pub category: String,
    /// Test name (e.g. "get_or_init_registers_invalid_row").
    pub name: String,
    /// Whether the test passed.
    pub passed: bool,
    /// Error message if the test failed.
    pub message: Option<String>,
}

impl TestResult {
    fn pass(category: &str, name: &str) -> Self {
        Self {
            category: category.to_string(),
            name: name.to_string(),
            passed: true,
            message: None,
        }
    }

    fn fail(category: &str, name: &str, msg: String) -> Self {
        Self {
            category: category.to_string(),
            name: name.to_string(),
            passed: false,
            message: Some(msg),
        }
    }

    fn from_result(category: &str, name: &str, result: Result<(), String>) -> Self {
        match result {
            Ok(()) => Self::pass(category, name),
            Err(msg) => Self::fail(category, name, msg),
        }
    }
}

/// Aggregated report from a full conformance suite run.
#[derive(Debug, Clone)]
pub struct ConformanceReport {
    pub results: Vec<TestResult>,
    pub passed: usize,
    pub failed: usize,
    pub total: usize,
}

impl fmt::Display for ConformanceReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Conformance: {}/{} passed ({} failed)",
            self.passed, self.total, self.failed
        )?;
        for r in &self.results {
            if !r.passed {
                writeln!(
                    f,
                    "  FAIL [{}/{}]: {}",
                    r.category,
                    r.name,
                    r.message.as_deref().unwrap_or("(no message)")
                )?;
            }
        }
        Ok(())
    }
}

/// Run the full conformance suite against a storage backend.
///
/// The `factory` function is called once per test to create a fresh, empty
/// storage instance, ensuring test isolation. Tests open the store themselves.
pub async fn run_conformance_suite<S, F, Fut>(factory: F) -> ConformanceReport
where
    S: CoherenceStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let mut results = Vec::new();

    results.extend(lifecycle::run_lifecycle_tests(&factory).await);
    results.extend(cas::run_cas_tests(&factory).await);
    results.extend(concurrent::run_concurrent_tests(&factory).await);
    results.extend(catalog::run_catalog_tests(&factory).await);
    results.extend(log::run_log_tests(&factory).await);

    let passed = results.iter().filter(|r| r.passed).count();
    let total = results.len();

    ConformanceReport {
        results,
        passed,
        failed: total - passed,
        total,
    }
}

// ── Helpers: seeded stores and record constructors ───────────────────────────

/// Open a fresh store and catalog microservices `m1..m3` and components `c1`, `c2`.
async fn seeded<S, F, Fut>(factory: &F) -> Result<S, String>
where
    S: CoherenceStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let store = factory().await;
    store.open().await.map_err(|e| format!("open: {e}"))?;
    for id in ["m1", "m2", "m3"] {
        store
            .insert_microservice(make_microservice(id))
            .await
            .map_err(|e| format!("insert microservice {id}: {e}"))?;
    }
    for id in ["c1", "c2"] {
        store
            .insert_component(make_component(id))
            .await
            .map_err(|e| format!("insert component {id}: {e}"))?;
    }
    Ok(store)
}

fn make_component(id: &str) -> ComponentRecord {
    ComponentRecord {
        id: id.to_string(),
        name: format!("component {id}"),
        metamodel: "uml".to_string(),
        description: String::new(),
    }
}

fn make_microservice(id: &str) -> MicroserviceRecord {
    MicroserviceRecord {
        id: id.to_string(),
        name: format!("service {id}"),
        description: String::new(),
    }
}

fn make_transition(microservice_id: &str, component_id: &str, version: u64) -> TransitionRecord {
    TransitionRecord {
        seq: 0,
        microservice_id: microservice_id.to_string(),
        component_id: component_id.to_string(),
        from_state: CoherenceState::Invalid,
        to_state: CoherenceState::Modified,
        operation: OperationKind::Write,
        cause: TransitionCause::Direct,
        version,
        gom_instance_id: None,
        timestamp: OffsetDateTime::now_utc(),
    }
}

fn make_operation(microservice_id: &str, component_id: &str) -> OperationRecord {
    OperationRecord {
        seq: 0,
        microservice_id: microservice_id.to_string(),
        component_id: component_id.to_string(),
        operation: OperationKind::Read,
        consistency_type: None,
        outcome: OperationOutcome::Applied,
        error_kind: None,
        message: None,
        gom_instance_id: None,
        timestamp: OffsetDateTime::now_utc(),
    }
}
