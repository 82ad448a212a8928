use std::future::Future;
use std::sync::Arc;

use super::{seeded, TestResult};
use crate::{CoherenceState, CoherenceStore, ConsistencyType, StateKey, StorageError};

/// Number of concurrent tasks to spawn in each test.
const N: usize = 10;

pub(super) async fn run_concurrent_tests<S, F, Fut>(factory: &F) -> Vec<TestResult>
where
    S: CoherenceStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    vec![
        TestResult::from_result(
            "concurrent",
            "concurrent_cas_exactly_one_wins",
            concurrent_cas_exactly_one_wins(factory).await,
        ),
        TestResult::from_result(
            "concurrent",
            "concurrent_get_or_init_yields_one_row",
            concurrent_get_or_init_yields_one_row(factory).await,
        ),
        TestResult::from_result(
            "concurrent",
            "concurrent_cas_different_rows_all_succeed",
            concurrent_cas_different_rows_all_succeed(factory).await,
        ),
        TestResult::from_result(
            "concurrent",
            "concurrent_appends_get_distinct_seqs",
            concurrent_appends_get_distinct_seqs(factory).await,
        ),
    ]
}

// ── Same row: exactly one winner ─────────────────────────────────────────────

/// N tasks race a compare-and-swap from revision 0 on the same row. Exactly
/// one must succeed; the rest must get ConcurrentConflict.
async fn concurrent_cas_exactly_one_wins<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: CoherenceStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let store = Arc::new(seeded(factory).await?);
    let key = StateKey::new("m1", "c1");
    let row = store
        .get_or_init(&key, ConsistencyType::Strong, None)
        .await
        .map_err(|e| format!("init: {e}"))?;

    let mut handles = Vec::new();
    for i in 0..N {
        let s = store.clone();
        let key = key.clone();
        let update = row
            .update()
            .state(CoherenceState::Modified)
            .version(i as u64 + 1);
        handles.push(tokio::spawn(async move {
            s.compare_and_swap(&key, 0, update).await
        }));
    }

    let mut winners = 0;
    let mut conflicts = 0;
    for handle in handles {
        match handle.await.map_err(|e| format!("join: {e}"))? {
            Ok(_) => winners += 1,
            Err(StorageError::ConcurrentConflict { .. }) => conflicts += 1,
            Err(e) => return Err(format!("unexpected error: {e}")),
        }
    }

    if winners != 1 {
        return Err(format!("expected exactly 1 winner, got {winners}"));
    }
    if conflicts != N - 1 {
        return Err(format!("expected {} conflicts, got {conflicts}", N - 1));
    }

    let final_row = store
        .get_state(&key)
        .await
        .map_err(|e| e.to_string())?
        .ok_or("row missing after race")?;
    if final_row.revision != 1 {
        return Err(format!("final revision {}, expected 1", final_row.revision));
    }
    Ok(())
}

// ── Concurrent registration ──────────────────────────────────────────────────

async fn concurrent_get_or_init_yields_one_row<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: CoherenceStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let store = Arc::new(seeded(factory).await?);
    let key = StateKey::new("m2", "c2");

    let mut handles = Vec::new();
    for _ in 0..N {
        let s = store.clone();
        let key = key.clone();
        handles.push(tokio::spawn(async move {
            s.get_or_init(&key, ConsistencyType::Eventual, None).await
        }));
    }

    let mut ids = Vec::new();
    for handle in handles {
        let row = handle
            .await
            .map_err(|e| format!("join: {e}"))?
            .map_err(|e| format!("get_or_init: {e}"))?;
        ids.push(row.id);
    }
    ids.dedup();
    if ids.len() != 1 {
        return Err(format!("concurrent registration produced rows {ids:?}"));
    }

    let rows = store
        .list_states(Some("c2"))
        .await
        .map_err(|e| e.to_string())?;
    if rows.len() != 1 {
        return Err(format!("expected 1 row for c2, got {}", rows.len()));
    }
    Ok(())
}

// ── Different rows: no false conflicts ───────────────────────────────────────

async fn concurrent_cas_different_rows_all_succeed<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: CoherenceStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let store = Arc::new(seeded(factory).await?);
    let mut rows = Vec::new();
    for m in ["m1", "m2", "m3"] {
        for c in ["c1", "c2"] {
            let row = store
                .get_or_init(&StateKey::new(m, c), ConsistencyType::Eventual, None)
                .await
                .map_err(|e| format!("init {m}/{c}: {e}"))?;
            rows.push(row);
        }
    }

    let mut handles = Vec::new();
    for row in rows {
        let s = store.clone();
        handles.push(tokio::spawn(async move {
            let update = row.update().state(CoherenceState::SharedPlus).version(1);
            s.compare_and_swap(&row.key(), row.revision, update).await
        }));
    }

    for handle in handles {
        handle
            .await
            .map_err(|e| format!("join: {e}"))?
            .map_err(|e| format!("independent rows conflicted: {e}"))?;
    }
    Ok(())
}

// ── Log appends ──────────────────────────────────────────────────────────────

async fn concurrent_appends_get_distinct_seqs<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: CoherenceStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let store = Arc::new(seeded(factory).await?);

    let mut handles = Vec::new();
    for i in 0..N {
        let s = store.clone();
        handles.push(tokio::spawn(async move {
            if i % 2 == 0 {
                s.append_transition(super::make_transition("m1", "c1", i as u64))
                    .await
            } else {
                s.append_operation(super::make_operation("m1", "c1")).await
            }
        }));
    }

    let mut seqs = Vec::new();
    for handle in handles {
        let seq = handle
            .await
            .map_err(|e| format!("join: {e}"))?
            .map_err(|e| format!("append: {e}"))?;
        seqs.push(seq);
    }
    seqs.sort_unstable();
    seqs.dedup();
    if seqs.len() != N {
        return Err(format!("duplicate sequence numbers: {seqs:?}"));
    }
    Ok(())
}
