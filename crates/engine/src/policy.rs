//! Consistency policies.
//!
//! The five consistency types form a closed set, so the policy is a plain
//! enum and every decision is a `match`. Policies are pure: they look at a
//! row, the clock and the caller's session marks, and never touch storage.

use megamodel_storage::{CoherenceRecord, CoherenceState, ConsistencyType};
use serde::Serialize;
use time::OffsetDateTime;

/// What the caller of a successful operation may rely on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Guarantee {
    /// The caller holds the only writable copy.
    Exclusive,
    /// The copy matches the latest authoritative version.
    Latest,
    /// The copy may trail a concurrent write elsewhere.
    PossiblyStale,
    /// The copy is no older than the row's staleness bound.
    WithinBound,
    /// The caller's own writes are visible.
    ReadYourWrites,
    /// The version is not older than anything the caller saw before.
    Monotonic,
}

/// How peers are invalidated when a write is granted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FenceMode {
    /// Every peer holding a copy is moved to `INVALID` before the write is acknowledged.
    Synchronous,
    /// Only a `MODIFIED` peer is fenced up front; shared peers are demoted
    /// after the write returns.
    Deferred,
}

/// Per-(session, component) marks used by the session guarantees.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionMarks {
    /// Version of the session's last write.
    pub last_write: Option<u64>,
    /// Highest version the session has read.
    pub last_observed: Option<u64>,
}

impl SessionMarks {
    fn floor(&self, consistency_type: ConsistencyType) -> Option<u64> {
        match consistency_type {
            ConsistencyType::ReadMyWrites => self.last_write,
            ConsistencyType::MonotonicReads => self.last_observed,
            _ => None,
        }
    }
}

pub struct ReadContext<'a> {
    pub row: &'a CoherenceRecord,
    pub now: OffsetDateTime,
    pub session: SessionMarks,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadDecision {
    /// Serve the row as it is.
    Serve(Guarantee),
    /// Fetch the authoritative version and move the row to `target` first.
    Fetch { target: CoherenceState },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsistencyPolicy {
    Strong,
    Eventual,
    BoundedStaleness { bound_ms: u64 },
    ReadMyWrites,
    MonotonicReads,
}

impl ConsistencyPolicy {
    /// Build the policy for a consistency type. A bounded-staleness policy
    /// without an explicit bound uses `default_bound_ms`.
    pub fn new(
        consistency_type: ConsistencyType,
        bound_ms: Option<u64>,
        default_bound_ms: u64,
    ) -> Self {
        match consistency_type {
            ConsistencyType::Strong => ConsistencyPolicy::Strong,
            ConsistencyType::Eventual => ConsistencyPolicy::Eventual,
            ConsistencyType::BoundedStaleness => ConsistencyPolicy::BoundedStaleness {
                bound_ms: bound_ms.unwrap_or(default_bound_ms),
            },
            ConsistencyType::ReadMyWrites => ConsistencyPolicy::ReadMyWrites,
            ConsistencyType::MonotonicReads => ConsistencyPolicy::MonotonicReads,
        }
    }

    pub fn consistency_type(&self) -> ConsistencyType {
        match self {
            ConsistencyPolicy::Strong => ConsistencyType::Strong,
            ConsistencyPolicy::Eventual => ConsistencyType::Eventual,
            ConsistencyPolicy::BoundedStaleness { .. } => ConsistencyType::BoundedStaleness,
            ConsistencyPolicy::ReadMyWrites => ConsistencyType::ReadMyWrites,
            ConsistencyPolicy::MonotonicReads => ConsistencyType::MonotonicReads,
        }
    }

    /// State a row enters on a read that fetches a fresh copy.
    ///
    /// STRONG readers get `SHARED_PLUS`, everybody else `SHARED_MINUS`.
    pub fn fresh_read_state(&self) -> CoherenceState {
        match self {
            ConsistencyPolicy::Strong => CoherenceState::SharedPlus,
            _ => CoherenceState::SharedMinus,
        }
    }

    pub fn fence_mode(&self) -> FenceMode {
        match self {
            ConsistencyPolicy::Strong => FenceMode::Synchronous,
            _ => FenceMode::Deferred,
        }
    }

    fn served(&self) -> Guarantee {
        match self {
            ConsistencyPolicy::Strong => Guarantee::Latest,
            ConsistencyPolicy::Eventual => Guarantee::PossiblyStale,
            ConsistencyPolicy::BoundedStaleness { .. } => Guarantee::WithinBound,
            ConsistencyPolicy::ReadMyWrites => Guarantee::ReadYourWrites,
            ConsistencyPolicy::MonotonicReads => Guarantee::Monotonic,
        }
    }

    /// Decide how a read of `ctx.row` proceeds.
    pub fn on_read(&self, ctx: &ReadContext<'_>) -> ReadDecision {
        let row = ctx.row;
        match row.state {
            CoherenceState::Modified => ReadDecision::Serve(Guarantee::Exclusive),
            CoherenceState::Invalid => ReadDecision::Fetch {
                target: self.fresh_read_state(),
            },
            CoherenceState::SharedPlus | CoherenceState::SharedMinus => {
                let refresh = ReadDecision::Fetch {
                    target: CoherenceState::SharedPlus,
                };
                match self {
                    // A shared copy may trail a write whose invalidation is
                    // still in flight; validate against the holder.
                    ConsistencyPolicy::Strong => refresh,
                    ConsistencyPolicy::Eventual => ReadDecision::Serve(self.served()),
                    ConsistencyPolicy::BoundedStaleness { bound_ms } => {
                        if row.state == CoherenceState::SharedMinus
                            && row.age_ms(ctx.now) > *bound_ms
                        {
                            refresh
                        } else {
                            ReadDecision::Serve(self.served())
                        }
                    }
                    ConsistencyPolicy::ReadMyWrites | ConsistencyPolicy::MonotonicReads => {
                        match ctx.session.floor(self.consistency_type()) {
                            Some(floor) if floor > row.version => refresh,
                            _ => ReadDecision::Serve(self.served()),
                        }
                    }
                }
            }
        }
    }

    /// Check a fetched version against the session guarantees.
    ///
    /// Returns the violation reason when the authoritative copy is older
    /// than what the session already wrote or observed.
    pub fn admit_fetched(
        &self,
        version: u64,
        session: &SessionMarks,
    ) -> Result<Guarantee, String> {
        match session.floor(self.consistency_type()) {
            Some(floor) if floor > version => Err(match self {
                ConsistencyPolicy::ReadMyWrites => format!(
                    "session wrote version {floor} but the authoritative copy is version {version}"
                ),
                _ => format!(
                    "session already observed version {floor}; version {version} would go backwards"
                ),
            }),
            _ => Ok(self.served()),
        }
    }
}

/// How a peer configured with `consistency_type` reacts to an asynchronous
/// invalidation while in `state`.
pub fn demote_on_invalidation(
    consistency_type: ConsistencyType,
    state: CoherenceState,
) -> CoherenceState {
    match (consistency_type, state) {
        (_, CoherenceState::Invalid) => CoherenceState::Invalid,
        (ConsistencyType::Strong, _) => CoherenceState::Invalid,
        (_, CoherenceState::SharedPlus) => CoherenceState::SharedMinus,
        (_, CoherenceState::SharedMinus) => CoherenceState::SharedMinus,
        (_, CoherenceState::Modified) => CoherenceState::Invalid,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::Duration;

    fn row(
        state: CoherenceState,
        version: u64,
        age_ms: i64,
        now: OffsetDateTime,
    ) -> CoherenceRecord {
        CoherenceRecord {
            id: 1,
            microservice_id: "m1".into(),
            component_id: "c1".into(),
            state,
            consistency_type: ConsistencyType::Eventual,
            version,
            revision: 0,
            timestamp: now - Duration::milliseconds(age_ms),
            staleness_bound_ms: None,
        }
    }

    fn decide(
        policy: ConsistencyPolicy,
        row: &CoherenceRecord,
        now: OffsetDateTime,
        session: SessionMarks,
    ) -> ReadDecision {
        policy.on_read(&ReadContext { row, now, session })
    }

    #[test]
    fn invalid_rows_fetch_into_policy_state() {
        let now = OffsetDateTime::now_utc();
        let r = row(CoherenceState::Invalid, 0, 0, now);
        assert_eq!(
            decide(ConsistencyPolicy::Strong, &r, now, SessionMarks::default()),
            ReadDecision::Fetch { target: CoherenceState::SharedPlus }
        );
        assert_eq!(
            decide(ConsistencyPolicy::Eventual, &r, now, SessionMarks::default()),
            ReadDecision::Fetch { target: CoherenceState::SharedMinus }
        );
    }

    #[test]
    fn modified_holder_reads_its_own_copy() {
        let now = OffsetDateTime::now_utc();
        let r = row(CoherenceState::Modified, 4, 0, now);
        for policy in [
            ConsistencyPolicy::Strong,
            ConsistencyPolicy::Eventual,
            ConsistencyPolicy::MonotonicReads,
        ] {
            assert_eq!(
                decide(policy, &r, now, SessionMarks::default()),
                ReadDecision::Serve(Guarantee::Exclusive)
            );
        }
    }

    #[test]
    fn bounded_staleness_refreshes_expired_copies_only() {
        let now = OffsetDateTime::now_utc();
        let policy = ConsistencyPolicy::BoundedStaleness { bound_ms: 1_000 };
        let young = row(CoherenceState::SharedMinus, 2, 500, now);
        let old = row(CoherenceState::SharedMinus, 2, 1_500, now);
        let old_plus = row(CoherenceState::SharedPlus, 2, 1_500, now);
        assert_eq!(
            decide(policy, &young, now, SessionMarks::default()),
            ReadDecision::Serve(Guarantee::WithinBound)
        );
        assert_eq!(
            decide(policy, &old, now, SessionMarks::default()),
            ReadDecision::Fetch { target: CoherenceState::SharedPlus }
        );
        assert_eq!(
            decide(policy, &old_plus, now, SessionMarks::default()),
            ReadDecision::Serve(Guarantee::WithinBound)
        );
    }

    #[test]
    fn strong_validates_shared_copies_and_eventual_serves_them() {
        let now = OffsetDateTime::now_utc();
        let r = row(CoherenceState::SharedMinus, 1, 60_000, now);
        assert_eq!(
            decide(ConsistencyPolicy::Strong, &r, now, SessionMarks::default()),
            ReadDecision::Fetch { target: CoherenceState::SharedPlus }
        );
        assert_eq!(
            decide(ConsistencyPolicy::Eventual, &r, now, SessionMarks::default()),
            ReadDecision::Serve(Guarantee::PossiblyStale)
        );
    }

    #[test]
    fn session_policies_refresh_when_row_trails_the_session() {
        let now = OffsetDateTime::now_utc();
        let r = row(CoherenceState::SharedMinus, 3, 0, now);
        let wrote_five = SessionMarks { last_write: Some(5), last_observed: None };
        let saw_two = SessionMarks { last_write: None, last_observed: Some(2) };
        assert_eq!(
            decide(ConsistencyPolicy::ReadMyWrites, &r, now, wrote_five),
            ReadDecision::Fetch { target: CoherenceState::SharedPlus }
        );
        assert_eq!(
            decide(ConsistencyPolicy::MonotonicReads, &r, now, saw_two),
            ReadDecision::Serve(Guarantee::Monotonic)
        );
        // Other sessions are not forced to refresh.
        assert_eq!(
            decide(ConsistencyPolicy::ReadMyWrites, &r, now, SessionMarks::default()),
            ReadDecision::Serve(Guarantee::ReadYourWrites)
        );
    }

    #[test]
    fn fetched_versions_must_not_go_backwards() {
        let saw_seven = SessionMarks { last_write: None, last_observed: Some(7) };
        assert!(ConsistencyPolicy::MonotonicReads.admit_fetched(6, &saw_seven).is_err());
        assert_eq!(
            ConsistencyPolicy::MonotonicReads.admit_fetched(7, &saw_seven),
            Ok(Guarantee::Monotonic)
        );
        assert_eq!(
            ConsistencyPolicy::Eventual.admit_fetched(0, &saw_seven),
            Ok(Guarantee::PossiblyStale)
        );
    }

    #[test]
    fn demotion_follows_peer_policy() {
        use CoherenceState::*;
        assert_eq!(demote_on_invalidation(ConsistencyType::Strong, SharedPlus), Invalid);
        assert_eq!(demote_on_invalidation(ConsistencyType::Eventual, SharedPlus), SharedMinus);
        assert_eq!(demote_on_invalidation(ConsistencyType::ReadMyWrites, SharedMinus), SharedMinus);
        assert_eq!(demote_on_invalidation(ConsistencyType::Eventual, Invalid), Invalid);
    }

    #[test]
    fn policy_round_trips_its_type() {
        for ct in ConsistencyType::ALL {
            assert_eq!(ConsistencyPolicy::new(ct, None, 10).consistency_type(), ct);
        }
        assert_eq!(
            ConsistencyPolicy::new(ConsistencyType::BoundedStaleness, None, 10),
            ConsistencyPolicy::BoundedStaleness { bound_ms: 10 }
        );
    }
}
