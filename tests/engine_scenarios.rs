//! End-to-end engine scenarios over a scripted portal and a temporary
//! database: completeness, failure recovery, stop/resume idempotency, and
//! the audit verdicts.

use std::sync::Arc;
use std::time::Duration;

use bhoomi_engine::domain::entities::{SearchParams, SessionStatus};
use bhoomi_engine::domain::ports::{LocationScope, PortalError};
use bhoomi_engine::engine::testing::{MockAdapterFactory, StaticCatalog};
use bhoomi_engine::engine::{EngineConfig, EngineError, SearchEngine};
use bhoomi_engine::infrastructure::{CheckpointStore, DatabaseConnection};
use tempfile::TempDir;

struct Harness {
    _dir: TempDir,
    engine: SearchEngine,
    store: CheckpointStore,
    factory: MockAdapterFactory,
}

fn fast_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.worker_count = 2;
    config.worker_startup_delay_ms = 0;
    config.requests_per_second = 10_000;
    config.monitor_poll_interval_ms = 10;
    config
}

/// Three villages under one hobli, lettered A..C with codes 1..3.
fn three_village_catalog() -> StaticCatalog {
    StaticCatalog::new().with_hobli(
        "3",
        "Yelahanka",
        vec![("1", "Agrahara"), ("2", "Bettahalli"), ("3", "Chikkajala")],
    )
}

async fn harness(catalog: StaticCatalog, config: EngineConfig) -> Harness {
    // only the first test to get here actually installs the subscriber
    let _ = bhoomi_engine::infrastructure::logging::init();

    let dir = tempfile::tempdir().unwrap();
    let db = DatabaseConnection::new(dir.path().join("engine.db"))
        .await
        .unwrap();
    db.migrate().await.unwrap();
    let store = CheckpointStore::new(db.pool().clone());

    let factory = MockAdapterFactory::new();
    let engine = SearchEngine::new(
        store.clone(),
        Arc::new(catalog),
        Arc::new(factory.clone()),
        config,
    );
    Harness {
        _dir: dir,
        engine,
        store,
        factory,
    }
}

fn params(max_survey: u32) -> SearchParams {
    SearchParams::new(
        "Ramappa",
        LocationScope {
            district_code: "2".into(),
            district_name: "Bangalore Urban".into(),
            taluk_code: "5".into(),
            taluk_name: "Bangalore North".into(),
            hobli_code: None,
            village_code: None,
        },
        max_survey,
    )
}

async fn run_to_completion(h: &Harness, session_id: &str) -> SessionStatus {
    tokio::time::timeout(
        Duration::from_secs(30),
        h.engine.wait_for_completion(session_id),
    )
    .await
    .expect("run did not reach a terminal state in time")
    .unwrap()
}

#[tokio::test]
async fn session_expiry_is_recovered_without_losing_villages() {
    let h = harness(three_village_catalog(), fast_config()).await;
    h.factory.with_data("1", (1..=5).collect());
    h.factory.with_data("2", (1..=3).collect());
    h.factory.with_data("3", (1..=4).collect());
    // one village hits an expired session twice before succeeding
    h.factory
        .push_submit_fault("2", PortalError::SessionInvalid("session expired".into()));
    h.factory
        .push_submit_fault("2", PortalError::SessionInvalid("session expired".into()));

    let session_id = h.engine.start(params(20)).await.unwrap();
    let status = run_to_completion(&h, &session_id).await;
    assert_eq!(status, SessionStatus::Completed);

    let snapshot = h.engine.status(&session_id).await.unwrap();
    assert_eq!(snapshot.live.session_recoveries, 2);
    assert_eq!(snapshot.stats.villages_completed, 3);
    assert_eq!(snapshot.stats.villages_failed, 0);

    // every declared village is accounted for, none left pending
    let resume = h.engine.resume_state(&session_id).await.unwrap();
    assert_eq!(resume.completed_villages.len(), 3);
    assert!(resume.in_progress.is_empty());
    assert!(resume.pending_villages.is_empty());

    let audit = h.store.get_audit(&session_id).await.unwrap().unwrap();
    assert!(audit.missing_villages.is_empty());
    assert!(audit.failed_villages.is_empty());
    assert!((audit.coverage_score - 100.0).abs() < f64::EPSILON);
    assert!(audit.totals_reconciled);

    let records = h.engine.export(&session_id, false).await.unwrap();
    assert_eq!(records.len(), 12);
    assert!(records.iter().all(|r| r.is_match));
}

#[tokio::test]
async fn stop_and_resume_yields_the_same_record_set() {
    let h = harness(three_village_catalog(), fast_config()).await;
    for code in ["1", "2", "3"] {
        h.factory.with_data(code, (1..=30).collect());
    }
    h.factory.set_call_delay(Duration::from_millis(2));

    let session_id = h.engine.start(params(40)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(60)).await;
    h.engine.stop(&session_id).await.unwrap();
    let status = run_to_completion(&h, &session_id).await;
    assert!(matches!(
        status,
        SessionStatus::Stopped | SessionStatus::Completed
    ));

    h.factory.set_call_delay(Duration::from_millis(0));
    h.engine.resume(&session_id).await.unwrap();
    let status = run_to_completion(&h, &session_id).await;
    assert_eq!(status, SessionStatus::Completed);

    // resume re-processes from the checkpoint; the unique natural key keeps
    // re-inserted rows from duplicating
    let records = h.engine.export(&session_id, false).await.unwrap();
    assert_eq!(records.len(), 90);

    let audit = h.store.get_audit(&session_id).await.unwrap().unwrap();
    assert!(audit.missing_villages.is_empty());
    assert!(audit.failed_villages.is_empty());
}

#[tokio::test]
async fn dead_driver_fails_only_its_village() {
    let h = harness(three_village_catalog(), fast_config()).await;
    h.factory.with_data("1", (1..=5).collect());
    h.factory.with_data("2", (1..=5).collect());
    h.factory.with_data("3", (1..=5).collect());
    h.factory.fail_restarts();
    h.factory
        .push_submit_fault("2", PortalError::DriverDead("chrome exited".into()));

    let session_id = h.engine.start(params(20)).await.unwrap();
    let status = run_to_completion(&h, &session_id).await;
    assert_eq!(status, SessionStatus::Incomplete);

    let audit = h.store.get_audit(&session_id).await.unwrap().unwrap();
    assert_eq!(audit.failed_villages, vec!["Bettahalli".to_string()]);
    assert!(audit.missing_villages.is_empty());
    assert!((audit.coverage_score - (2.0 / 3.0 * 100.0)).abs() < 1e-9);

    // the failed village carries its error text for a scoped retry run
    let villages = h.store.village_tasks(&session_id).await.unwrap();
    let failed = villages
        .iter()
        .find(|v| v.village_name == "Bettahalli")
        .unwrap();
    assert!(failed
        .error_message
        .as_deref()
        .unwrap()
        .contains("driver unusable"));
}

#[tokio::test]
async fn unavailable_catalog_crashes_the_session_at_startup() {
    let h = harness(StaticCatalog::unavailable(), fast_config()).await;

    let session_id = h.engine.start(params(20)).await.unwrap();
    let status = run_to_completion(&h, &session_id).await;
    assert_eq!(status, SessionStatus::Crashed);

    // no audit for a run that never had a village list
    assert!(h.store.get_audit(&session_id).await.unwrap().is_none());
}

#[tokio::test]
async fn concurrent_start_is_rejected() {
    let h = harness(three_village_catalog(), fast_config()).await;
    for code in ["1", "2", "3"] {
        h.factory.with_data(code, (1..=10).collect());
    }
    h.factory.set_call_delay(Duration::from_millis(5));

    let session_id = h.engine.start(params(40)).await.unwrap();
    match h.engine.start(params(40)).await {
        Err(EngineError::AlreadyRunning) => {}
        other => panic!("expected AlreadyRunning, got {other:?}"),
    }

    h.engine.stop(&session_id).await.unwrap();
    run_to_completion(&h, &session_id).await;
}
