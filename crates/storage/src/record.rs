use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

// ── Domain enums ─────────────────────────────────────────────────────────────

/// Coherence state of one microservice's copy of a component.
///
/// Mirrors the MSI cache-coherence states, with the shared state split into a
/// fresh (`SHARED_PLUS`) and a possibly stale (`SHARED_MINUS`) variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CoherenceState {
    Invalid,
    SharedMinus,
    SharedPlus,
    Modified,
}

impl CoherenceState {
    pub const ALL: [CoherenceState; 4] = [
        CoherenceState::Modified,
        CoherenceState::SharedPlus,
        CoherenceState::SharedMinus,
        CoherenceState::Invalid,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CoherenceState::Invalid => "INVALID",
            CoherenceState::SharedMinus => "SHARED_MINUS",
            CoherenceState::SharedPlus => "SHARED_PLUS",
            CoherenceState::Modified => "MODIFIED",
        }
    }

    /// Short protocol code (`m`, `s+`, `s-`, `i`).
    pub fn code(&self) -> &'static str {
        match self {
            CoherenceState::Invalid => "i",
            CoherenceState::SharedMinus => "s-",
            CoherenceState::SharedPlus => "s+",
            CoherenceState::Modified => "m",
        }
    }

    pub fn is_shared(&self) -> bool {
        matches!(self, CoherenceState::SharedMinus | CoherenceState::SharedPlus)
    }
}

impl fmt::Display for CoherenceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CoherenceState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CoherenceState::ALL
            .into_iter()
            .find(|st| st.as_str() == s || st.code() == s)
            .ok_or_else(|| format!("unknown coherence state '{}'", s))
    }
}

/// Consistency contract a microservice holds a component copy under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConsistencyType {
    Strong,
    Eventual,
    BoundedStaleness,
    ReadMyWrites,
    MonotonicReads,
}

impl ConsistencyType {
    pub const ALL: [ConsistencyType; 5] = [
        ConsistencyType::Strong,
        ConsistencyType::Eventual,
        ConsistencyType::BoundedStaleness,
        ConsistencyType::ReadMyWrites,
        ConsistencyType::MonotonicReads,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ConsistencyType::Strong => "STRONG",
            ConsistencyType::Eventual => "EVENTUAL",
            ConsistencyType::BoundedStaleness => "BOUNDED_STALENESS",
            ConsistencyType::ReadMyWrites => "READ_MY_WRITES",
            ConsistencyType::MonotonicReads => "MONOTONIC_READS",
        }
    }

    /// Short code (`sc`, `ec`, `bs`, `rmw`, `mr`).
    pub fn code(&self) -> &'static str {
        match self {
            ConsistencyType::Strong => "sc",
            ConsistencyType::Eventual => "ec",
            ConsistencyType::BoundedStaleness => "bs",
            ConsistencyType::ReadMyWrites => "rmw",
            ConsistencyType::MonotonicReads => "mr",
        }
    }
}

impl fmt::Display for ConsistencyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConsistencyType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ConsistencyType::ALL
            .into_iter()
            .find(|ct| ct.as_str() == s || ct.code() == s)
            .ok_or_else(|| format!("unknown consistency type '{}'", s))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    #[default]
    Read,
    Write,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Read => "read",
            OperationKind::Write => "write",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What produced a transition record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransitionCause {
    /// The row's own read or write.
    Direct,
    /// Fencing or invalidation fan-out from a write on a peer row.
    Invalidation,
    /// The background anti-entropy sweeper.
    Sweep,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceStatus {
    Running,
    Completed,
    Failed,
}

impl InstanceStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, InstanceStatus::Running)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationOutcome {
    Applied,
    Rejected,
}

// ── Coherence table ──────────────────────────────────────────────────────────

/// Identity of a coherence row: one microservice's copy of one component.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateKey {
    pub microservice_id: String,
    pub component_id: String,
}

impl StateKey {
    pub fn new(microservice_id: impl Into<String>, component_id: impl Into<String>) -> Self {
        Self {
            microservice_id: microservice_id.into(),
            component_id: component_id.into(),
        }
    }
}

impl fmt::Display for StateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.microservice_id, self.component_id)
    }
}

/// A row of the coherence table as stored in the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoherenceRecord {
    /// Backend-assigned row id.
    pub id: u64,
    pub microservice_id: String,
    pub component_id: String,
    pub state: CoherenceState,
    pub consistency_type: ConsistencyType,
    /// Data version of the copy this row holds.
    pub version: u64,
    /// Row-level OCC counter, bumped by every successful compare-and-swap.
    pub revision: u64,
    /// Time of the last transition.
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    /// Maximum age in milliseconds a `SHARED_MINUS` copy may be served at.
    #[serde(rename = "stalenessBound")]
    pub staleness_bound_ms: Option<u64>,
}

impl CoherenceRecord {
    pub fn key(&self) -> StateKey {
        StateKey::new(&self.microservice_id, &self.component_id)
    }

    /// Milliseconds elapsed since the last transition, saturating at zero.
    pub fn age_ms(&self, now: OffsetDateTime) -> u64 {
        let millis = (now - self.timestamp).whole_milliseconds();
        u64::try_from(millis).unwrap_or(0)
    }

    /// Start an update carrying this row's current values.
    pub fn update(&self) -> CoherenceUpdate {
        CoherenceUpdate {
            state: self.state,
            consistency_type: self.consistency_type,
            version: self.version,
            timestamp: self.timestamp,
            staleness_bound_ms: self.staleness_bound_ms,
        }
    }
}

/// New values written by a compare-and-swap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoherenceUpdate {
    pub state: CoherenceState,
    pub consistency_type: ConsistencyType,
    pub version: u64,
    pub timestamp: OffsetDateTime,
    pub staleness_bound_ms: Option<u64>,
}

impl CoherenceUpdate {
    pub fn state(mut self, state: CoherenceState) -> Self {
        self.state = state;
        self
    }

    pub fn version(mut self, version: u64) -> Self {
        self.version = version;
        self
    }

    pub fn touched(mut self, at: OffsetDateTime) -> Self {
        self.timestamp = at;
        self
    }

    pub fn policy(mut self, consistency_type: ConsistencyType, bound_ms: Option<u64>) -> Self {
        self.consistency_type = consistency_type;
        self.staleness_bound_ms = bound_ms;
        self
    }
}

// ── Catalog ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentRecord {
    pub id: String,
    pub name: String,
    /// Schema or kind tag of the component artifact.
    #[serde(default)]
    pub metamodel: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MicroserviceRecord {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
}

// ── Global Operation Models ──────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentRequirement {
    pub component_id: String,
    pub consistency_type: ConsistencyType,
    /// Operation performed on the component when an instance runs.
    #[serde(default)]
    pub operation: OperationKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MicroserviceRequirement {
    pub microservice_id: String,
    #[serde(default)]
    pub required_components: Vec<ComponentRequirement>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GomRecord {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub microservice_requirements: Vec<MicroserviceRequirement>,
    #[serde(default)]
    pub preconditions: Vec<String>,
    #[serde(default)]
    pub postconditions: Vec<String>,
}

impl GomRecord {
    /// Every (microservice, component requirement) pair in declaration order.
    pub fn steps(&self) -> impl Iterator<Item = (&str, &ComponentRequirement)> + '_ {
        self.microservice_requirements.iter().flat_map(|req| {
            req.required_components
                .iter()
                .map(move |c| (req.microservice_id.as_str(), c))
        })
    }
}

/// Point-in-time copy of one coherence row, kept on a GOM instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateSnapshot {
    pub microservice_id: String,
    pub component_id: String,
    pub state: CoherenceState,
    pub consistency_type: ConsistencyType,
    pub version: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

impl From<&CoherenceRecord> for StateSnapshot {
    fn from(rec: &CoherenceRecord) -> Self {
        Self {
            microservice_id: rec.microservice_id.clone(),
            component_id: rec.component_id.clone(),
            state: rec.state,
            consistency_type: rec.consistency_type,
            version: rec.version,
            timestamp: rec.timestamp,
        }
    }
}

/// A single step executed by a GOM instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceStep {
    pub microservice_id: String,
    pub component_id: String,
    pub operation: OperationKind,
    pub consistency_type: ConsistencyType,
    /// State after the step, absent when the step failed.
    pub state: Option<CoherenceState>,
    pub version: Option<u64>,
    pub error_kind: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceFailure {
    pub kind: String,
    pub message: String,
    /// Index of the failing step, absent for condition failures.
    pub step: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GomInstanceRecord {
    pub id: String,
    pub gom_id: String,
    pub name: String,
    pub status: InstanceStatus,
    pub microservice_states: Vec<StateSnapshot>,
    pub steps: Vec<InstanceStep>,
    pub postconditions_held: usize,
    pub failure: Option<InstanceFailure>,
    /// The model as it was when the instance started.
    pub gom_snapshot: GomRecord,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

// ── Logs ─────────────────────────────────────────────────────────────────────

/// A record of a single coherence state transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransitionRecord {
    /// Log position, assigned by the store on append.
    pub seq: u64,
    pub microservice_id: String,
    pub component_id: String,
    pub from_state: CoherenceState,
    pub to_state: CoherenceState,
    pub operation: OperationKind,
    pub cause: TransitionCause,
    /// Data version held after the transition.
    pub version: u64,
    pub gom_instance_id: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

/// A record of an attempted read or write, including rejected ones.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationRecord {
    /// Log position, assigned by the store on append.
    pub seq: u64,
    pub microservice_id: String,
    pub component_id: String,
    pub operation: OperationKind,
    pub consistency_type: Option<ConsistencyType>,
    pub outcome: OperationOutcome,
    pub error_kind: Option<String>,
    pub message: Option<String>,
    pub gom_instance_id: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}
