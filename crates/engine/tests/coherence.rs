mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::*;
use megamodel_engine::{EngineConfig, ErrorKind, Guarantee};
use megamodel_storage::{
    CoherenceState, CoherenceStore, ConsistencyType, OperationKind, OperationOutcome,
    StateKey, TransitionCause,
};

#[tokio::test]
async fn eventual_read_then_strong_write_scenario() {
    let (store, engine) = engine(&["M1", "M2"], &["C1"]).await;

    let read = engine.read(&op("M1", "C1")).await.unwrap();
    assert_eq!(read.from_state, CoherenceState::Invalid);
    assert_eq!(read.row.state, CoherenceState::SharedMinus);
    assert_eq!(read.row.version, 0);
    assert!(read.refreshed);

    engine.read(&op("M2", "C1")).await.unwrap();

    let write = engine.write(&strong("M1", "C1")).await.unwrap();
    assert_eq!(write.row.state, CoherenceState::Modified);
    assert_eq!(write.row.version, 1);
    assert_eq!(write.guarantee, Guarantee::Exclusive);

    // Fenced before the write was acknowledged, no settle needed.
    assert_eq!(row(&store, "M2", "C1").await.state, CoherenceState::Invalid);
}

#[tokio::test]
async fn strong_read_after_strong_write_sees_new_version() {
    let (store, engine) = engine(&["m1", "m2", "m3"], &["c1"]).await;
    let before = engine.read(&strong("m2", "c1")).await.unwrap();
    assert_eq!(before.row.state, CoherenceState::SharedPlus);

    engine.write(&strong("m1", "c1")).await.unwrap();

    for reader in ["m2", "m3"] {
        let read = engine.read(&strong(reader, "c1")).await.unwrap();
        assert_eq!(read.served_version, 1, "{reader} read a stale version");
        assert_eq!(read.row.state, CoherenceState::SharedPlus);
        assert_eq!(read.guarantee, Guarantee::Latest);
    }
    // The modifier keeps its copy when others read it.
    assert_eq!(row(&store, "m1", "c1").await.state, CoherenceState::Modified);
}

#[tokio::test]
async fn modifier_reads_its_own_copy() {
    let (_store, engine) = engine(&["m1"], &["c1"]).await;
    engine.write(&op("m1", "c1")).await.unwrap();
    let read = engine.read(&strong("m1", "c1")).await.unwrap();
    assert_eq!(read.row.state, CoherenceState::Modified);
    assert_eq!(read.guarantee, Guarantee::Exclusive);
    assert!(!read.refreshed);
}

#[tokio::test]
async fn eventual_write_demotes_shared_peers_after_fanout() {
    let (store, engine) = engine(&["m1", "m2", "m3"], &["c1"]).await;
    engine
        .configure(&StateKey::new("m3", "c1"), ConsistencyType::Strong, None)
        .await
        .unwrap();
    engine.read(&strong("m2", "c1")).await.unwrap();
    engine.read(&strong("m3", "c1")).await.unwrap();
    assert_eq!(row(&store, "m2", "c1").await.state, CoherenceState::SharedPlus);

    let write = engine.write(&op("m1", "c1")).await.unwrap();
    assert_eq!(write.row.version, 1);
    engine.settle().await;

    // m2 runs EVENTUAL and keeps a possibly stale copy, m3 runs STRONG.
    let m2 = row(&store, "m2", "c1").await;
    assert_eq!((m2.state, m2.version), (CoherenceState::SharedMinus, 0));
    assert_eq!(row(&store, "m3", "c1").await.state, CoherenceState::Invalid);

    let invalidations: Vec<_> = store
        .list_transitions(0)
        .await
        .unwrap()
        .into_iter()
        .filter(|t| t.cause == TransitionCause::Invalidation)
        .collect();
    assert_eq!(invalidations.len(), 2);
}

#[tokio::test]
async fn modified_peer_is_fenced_even_for_eventual_writes() {
    let (store, engine) = engine(&["m1", "m2"], &["c1"]).await;
    engine.write(&op("m1", "c1")).await.unwrap();
    let second = engine.write(&op("m2", "c1")).await.unwrap();
    assert_eq!(second.row.version, 2);

    let m1 = row(&store, "m1", "c1").await;
    assert_eq!((m1.state, m1.version), (CoherenceState::Invalid, 1));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_writers_keep_exclusivity_and_monotonic_versions() {
    const WRITERS: usize = 6;
    const WRITES_EACH: usize = 5;

    let names: Vec<String> = (0..WRITERS).map(|i| format!("m{i}")).collect();
    let refs: Vec<&str> = names.iter().map(String::as_str).collect();
    let (store, engine) = engine(&refs, &["c1"]).await;

    // Watch the table while the writers race.
    let done = Arc::new(AtomicBool::new(false));
    let watcher = {
        let store = store.clone();
        let done = done.clone();
        tokio::spawn(async move {
            let mut worst = 0;
            while !done.load(Ordering::Acquire) {
                let rows = store.list_states(Some("c1")).await.unwrap();
                let modified = rows
                    .iter()
                    .filter(|r| r.state == CoherenceState::Modified)
                    .count();
                worst = worst.max(modified);
                tokio::task::yield_now().await;
            }
            worst
        })
    };

    let mut handles = Vec::new();
    for (i, name) in names.iter().enumerate() {
        let engine = engine.clone();
        let name = name.clone();
        handles.push(tokio::spawn(async move {
            for n in 0..WRITES_EACH {
                let mut req = op(&name, "c1");
                if (i + n) % 2 == 0 {
                    req = req.with_consistency(ConsistencyType::Strong);
                }
                engine.write(&req).await?;
                engine.read(&op(&name, "c1")).await?;
            }
            Ok::<_, megamodel_engine::EngineError>(())
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }
    engine.settle().await;
    done.store(true, Ordering::Release);
    assert!(watcher.await.unwrap() <= 1, "two rows were MODIFIED at once");

    let rows = store.list_states(Some("c1")).await.unwrap();
    let modified: Vec<_> = rows
        .iter()
        .filter(|r| r.state == CoherenceState::Modified)
        .collect();
    assert_eq!(modified.len(), 1);
    assert_eq!(modified[0].version, (WRITERS * WRITES_EACH) as u64);

    let versions: Vec<u64> = store
        .list_transitions(0)
        .await
        .unwrap()
        .into_iter()
        .filter(|t| t.operation == OperationKind::Write && t.cause == TransitionCause::Direct)
        .map(|t| t.version)
        .collect();
    assert_eq!(versions.len(), WRITERS * WRITES_EACH);
    assert!(
        versions.windows(2).all(|w| w[0] < w[1]),
        "versions went backwards: {versions:?}"
    );
}

#[tokio::test]
async fn versions_keep_climbing_after_the_newest_holder_is_deleted() {
    let (store, engine) = engine(&["m1", "m2"], &["c1"]).await;
    for _ in 0..5 {
        engine.write(&strong("m1", "c1")).await.unwrap();
    }
    let watcher = op("m2", "c1")
        .with_consistency(ConsistencyType::MonotonicReads)
        .with_session("watcher");
    assert_eq!(engine.read(&watcher).await.unwrap().served_version, 5);

    store.delete_microservice("m1").await.unwrap();

    let write = engine.write(&strong("m2", "c1")).await.unwrap();
    assert_eq!(write.served_version, 6);
    // The session that saw version 5 keeps reading forward.
    assert_eq!(engine.read(&watcher).await.unwrap().served_version, 6);

    let versions: Vec<u64> = store
        .list_transitions(0)
        .await
        .unwrap()
        .into_iter()
        .filter(|t| t.operation == OperationKind::Write && t.cause == TransitionCause::Direct)
        .map(|t| t.version)
        .collect();
    assert_eq!(versions, [1, 2, 3, 4, 5, 6]);
    assert!(
        versions.windows(2).all(|w| w[0] < w[1]),
        "versions went backwards: {versions:?}"
    );
}

#[tokio::test]
async fn bounded_staleness_serves_young_copies_and_refreshes_old_ones() {
    let (_store, engine) = engine(&["m1", "m2"], &["c1"]).await;
    let key = StateKey::new("m1", "c1");
    let configured = engine
        .configure(&key, ConsistencyType::BoundedStaleness, Some(250))
        .await
        .unwrap();
    assert_eq!(configured.staleness_bound_ms, Some(250));

    let first = engine.read(&op("m1", "c1")).await.unwrap();
    assert_eq!(first.row.state, CoherenceState::SharedMinus);
    assert!(first.refreshed);

    let served = engine.read(&op("m1", "c1")).await.unwrap();
    assert!(!served.refreshed);
    assert_eq!(served.guarantee, Guarantee::WithinBound);
    assert_eq!(served.row.timestamp, first.row.timestamp);

    tokio::time::sleep(Duration::from_millis(300)).await;
    let refreshed = engine.read(&op("m1", "c1")).await.unwrap();
    assert!(refreshed.refreshed);
    assert_eq!(refreshed.from_state, CoherenceState::SharedMinus);
    assert_eq!(refreshed.row.state, CoherenceState::SharedPlus);
}

#[tokio::test]
async fn configure_installs_default_bound_and_registers_row() {
    let (store, engine) = engine(&["m1"], &["c1"]).await;
    let key = StateKey::new("m1", "c1");
    let configured = engine
        .configure(&key, ConsistencyType::BoundedStaleness, None)
        .await
        .unwrap();
    assert_eq!(configured.state, CoherenceState::Invalid);
    assert_eq!(configured.staleness_bound_ms, Some(30_000));
    assert!(store.list_transitions(0).await.unwrap().is_empty());

    let unknown = engine
        .configure(&StateKey::new("ghost", "c1"), ConsistencyType::Strong, None)
        .await
        .unwrap_err();
    assert_eq!(unknown.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn read_my_writes_refreshes_only_for_the_writing_session() {
    let (_store, engine) = engine(&["m1", "m2", "m3"], &["c1"]).await;
    engine.read(&op("m2", "c1")).await.unwrap();
    engine.read(&op("m3", "c1")).await.unwrap();

    engine
        .write(&op("m1", "c1").with_session("alice"))
        .await
        .unwrap();
    engine.settle().await;

    let alice = engine
        .read(
            &op("m2", "c1")
                .with_session("alice")
                .with_consistency(ConsistencyType::ReadMyWrites),
        )
        .await
        .unwrap();
    assert!(alice.refreshed);
    assert_eq!(alice.served_version, 1);
    assert_eq!(alice.guarantee, Guarantee::ReadYourWrites);

    let bob = engine
        .read(
            &op("m3", "c1")
                .with_session("bob")
                .with_consistency(ConsistencyType::ReadMyWrites),
        )
        .await
        .unwrap();
    assert!(!bob.refreshed);
    assert_eq!(bob.served_version, 0);
}

#[tokio::test]
async fn monotonic_reads_reject_going_backwards() {
    let (store, engine) = engine(&["m1", "m2", "m3"], &["c1"]).await;
    engine.write(&op("m1", "c1")).await.unwrap();
    let seen = engine
        .read(
            &op("m2", "c1")
                .with_session("s")
                .with_consistency(ConsistencyType::MonotonicReads),
        )
        .await
        .unwrap();
    assert_eq!(seen.served_version, 1);

    // Drop every holder of version 1.
    store.delete_microservice("m1").await.unwrap();
    store.delete_microservice("m2").await.unwrap();

    let err = engine
        .read(
            &op("m3", "c1")
                .with_session("s")
                .with_consistency(ConsistencyType::MonotonicReads),
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConsistencyViolation);

    let last = store.list_operations(1).await.unwrap();
    assert_eq!(last[0].outcome, OperationOutcome::Rejected);
    assert_eq!(last[0].error_kind.as_deref(), Some("CONSISTENCY_VIOLATION"));
}

#[tokio::test]
async fn unknown_pairs_are_not_found_and_create_nothing() {
    let (store, engine) = engine(&["m1"], &["c1"]).await;
    let err = engine.read(&op("m1", "nope")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    let err = engine.write(&op("ghost", "c1")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert!(store.list_states(None).await.unwrap().is_empty());
}

#[tokio::test]
async fn stalled_refetch_times_out() {
    let (_store, engine) =
        engine_over_link(&["m1"], &["c1"], Arc::new(StalledLink), short_timeouts()).await;
    let err = engine.read(&strong("m1", "c1")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Timeout);
}

#[tokio::test]
async fn stalled_fencing_times_out_and_leaves_writer_unchanged() {
    let (store, engine) =
        engine_over_link(&["m1", "m2"], &["c1"], Arc::new(StalledLink), short_timeouts()).await;
    force_state(
        &store,
        "m2",
        "c1",
        CoherenceState::SharedPlus,
        ConsistencyType::Eventual,
    )
    .await;

    let err = engine.write(&strong("m1", "c1")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Timeout);
    assert_eq!(row(&store, "m1", "c1").await.state, CoherenceState::Invalid);
}

#[tokio::test]
async fn persistent_fencing_conflicts_exhaust_retries() {
    let config = EngineConfig {
        max_write_retries: 2,
        backoff_base_ms: 1,
        backoff_max_ms: 2,
        ..EngineConfig::default()
    };
    let link = Arc::new(ContendedLink::default());
    let (store, engine) = engine_over_link(&["m1", "m2"], &["c1"], link.clone(), config).await;
    force_state(
        &store,
        "m2",
        "c1",
        CoherenceState::Modified,
        ConsistencyType::Eventual,
    )
    .await;

    let err = engine.write(&op("m1", "c1")).await.unwrap_err();
    match err {
        megamodel_engine::EngineError::CoherenceConflict { attempts, .. } => assert_eq!(attempts, 3),
        other => panic!("expected CoherenceConflict, got {other:?}"),
    }
    // One fencing command per attempt: the link does not retry on its own.
    assert_eq!(link.invalidations.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn every_attempt_leaves_a_record() {
    let (store, engine) = engine(&["m1", "m2"], &["c1"]).await;
    engine.read(&op("m1", "c1")).await.unwrap();
    engine.read(&op("m1", "c1")).await.unwrap();
    engine.write(&op("m2", "c1")).await.unwrap();
    let _ = engine.read(&op("m1", "missing")).await;

    let operations = store.list_operations(0).await.unwrap();
    assert_eq!(operations.len(), 4);
    assert_eq!(
        operations
            .iter()
            .filter(|o| o.outcome == OperationOutcome::Applied)
            .count(),
        3
    );

    let direct: Vec<_> = store
        .list_transitions(0)
        .await
        .unwrap()
        .into_iter()
        .filter(|t| t.cause == TransitionCause::Direct)
        .collect();
    assert_eq!(direct.len(), 3);
    // The second read served the copy unchanged.
    assert_eq!(direct[1].from_state, direct[1].to_state);
    assert_eq!(direct[2].operation, OperationKind::Write);
}

#[tokio::test]
async fn sweep_expires_bounded_copies_and_catches_up_eventual_ones() {
    let (store, engine) = engine(&["m1", "m2", "m3"], &["c1"]).await;
    engine
        .configure(
            &StateKey::new("m3", "c1"),
            ConsistencyType::BoundedStaleness,
            Some(10),
        )
        .await
        .unwrap();
    engine.read(&op("m2", "c1")).await.unwrap();
    engine.read(&op("m3", "c1")).await.unwrap();
    engine.write(&op("m1", "c1")).await.unwrap();
    engine.settle().await;
    tokio::time::sleep(Duration::from_millis(30)).await;

    let report = engine.sweep_once().await.unwrap();
    assert_eq!(report.expired, 1);
    assert_eq!(report.refreshed, 1);
    assert_eq!(report.failed, 0);

    assert_eq!(row(&store, "m3", "c1").await.state, CoherenceState::Invalid);
    let m2 = row(&store, "m2", "c1").await;
    assert_eq!((m2.state, m2.version), (CoherenceState::SharedPlus, 1));

    let swept = store
        .list_transitions(0)
        .await
        .unwrap()
        .into_iter()
        .filter(|t| t.cause == TransitionCause::Sweep)
        .count();
    assert_eq!(swept, 2);

    // Nothing left to do.
    assert_eq!(engine.sweep_once().await.unwrap(), Default::default());
}
