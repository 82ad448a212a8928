use std::future::Future;

use super::{make_operation, make_transition, seeded, TestResult};
use crate::CoherenceStore;

pub(super) async fn run_log_tests<S, F, Fut>(factory: &F) -> Vec<TestResult>
where
    S: CoherenceStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    vec![
        TestResult::from_result(
            "log",
            "appends_share_one_sequence",
            appends_share_one_sequence(factory).await,
        ),
        TestResult::from_result(
            "log",
            "limit_returns_most_recent_oldest_first",
            limit_returns_most_recent_oldest_first(factory).await,
        ),
    ]
}

async fn appends_share_one_sequence<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: CoherenceStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let store = seeded(factory).await?;
    let mut with_bogus_seq = make_transition("m1", "c1", 1);
    with_bogus_seq.seq = 999;
    let t1 = store
        .append_transition(with_bogus_seq)
        .await
        .map_err(|e| e.to_string())?;
    let o1 = store
        .append_operation(make_operation("m1", "c1"))
        .await
        .map_err(|e| e.to_string())?;
    let t2 = store
        .append_transition(make_transition("m2", "c1", 2))
        .await
        .map_err(|e| e.to_string())?;
    if !(t1 < o1 && o1 < t2) {
        return Err(format!("sequence not increasing: {t1}, {o1}, {t2}"));
    }

    let transitions = store.list_transitions(0).await.map_err(|e| e.to_string())?;
    let seqs: Vec<u64> = transitions.iter().map(|t| t.seq).collect();
    if seqs != [t1, t2] {
        return Err(format!("stored seqs {seqs:?}, expected [{t1}, {t2}]"));
    }
    let operations = store.list_operations(0).await.map_err(|e| e.to_string())?;
    if operations.len() != 1 || operations[0].seq != o1 {
        return Err(format!("operation log: {operations:?}"));
    }
    Ok(())
}

async fn limit_returns_most_recent_oldest_first<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: CoherenceStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let store = seeded(factory).await?;
    for version in 1..=5 {
        store
            .append_transition(make_transition("m1", "c1", version))
            .await
            .map_err(|e| e.to_string())?;
    }
    let versions: Vec<u64> = store
        .list_transitions(3)
        .await
        .map_err(|e| e.to_string())?
        .iter()
        .map(|t| t.version)
        .collect();
    if versions != [3, 4, 5] {
        return Err(format!("limit 3 returned versions {versions:?}"));
    }
    let all = store.list_transitions(0).await.map_err(|e| e.to_string())?;
    if all.len() != 5 {
        return Err(format!("limit 0 returned {} records", all.len()));
    }
    Ok(())
}
