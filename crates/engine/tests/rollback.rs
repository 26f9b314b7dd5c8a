//! Integration tests for rollback eligibility and execution.

mod common;

use std::time::Duration;

use assert_matches::assert_matches;
use chrono::Utc;
use common::{healthy_fleet, request, test_config, Harness, ScriptedApplier};
use strata_core::error::CoreError;
use strata_core::lock::{rollback_key, PURPOSE_MIGRATION, PURPOSE_ROLLBACK};
use strata_core::retry::ApplyOutcome;
use strata_core::rollback::RollbackStrategyKind;
use strata_core::scope::ScopeRequest;
use strata_db::models::batch::MigrationBatch;
use strata_db::models::status::RollbackStatus;
use strata_engine::external::{Direction, InMemoryCatalog};
use strata_engine::EngineError;
use strata_events::bus::{NOTICE_ROLLBACK_COMPLETED, NOTICE_ROLLBACK_FAILED};

async fn completed_batch(h: &Harness) -> MigrationBatch {
    let batch = h
        .orchestrator
        .run_batch(request(ScopeRequest::All))
        .await
        .expect("batch should run");
    assert_eq!(batch.completed_targets, 7);
    batch
}

// ---------------------------------------------------------------------------
// Test: eligibility
// ---------------------------------------------------------------------------

/// A freshly completed batch with undo scripts is eligible for both
/// strategies it has material for.
#[tokio::test]
async fn completed_batch_is_eligible() {
    let h = Harness::new(healthy_fleet(), InMemoryCatalog::uniform(2, true));
    let batch = completed_batch(&h).await;

    let report = h.rollback.check_eligibility(batch.id).await.unwrap();

    assert!(report.eligible, "{:?}", report.reasons);
    let undo = &report.strategies[0];
    assert_eq!(undo.strategy, RollbackStrategyKind::UndoScripts);
    assert!(undo.available);
    let snapshot = &report.strategies[1];
    assert!(!snapshot.available);
    assert!(snapshot.reason.as_deref().unwrap().starts_with("No snapshot"));
}

/// Past the window a batch is ineligible and nothing is recorded.
#[tokio::test]
async fn window_elapsed_is_ineligible() {
    let h = Harness::new(healthy_fleet(), InMemoryCatalog::uniform(2, true));
    let batch = completed_batch(&h).await;
    assert!(
        h.store
            .set_completed_at(batch.id, Utc::now() - chrono::Duration::hours(25))
            .await
    );

    let report = h.rollback.check_eligibility(batch.id).await.unwrap();
    assert!(!report.eligible);
    assert!(report.reasons.iter().any(|r| r.contains("window")));

    let err = h
        .rollback
        .execute_rollback(batch.id, None, false, "ops")
        .await
        .unwrap_err();
    assert_matches!(err, EngineError::Core(CoreError::Ineligible { .. }));
    assert!(h.rollback.list_rollbacks(batch.id).await.unwrap().is_empty());
    assert!(h.applier.calls().iter().all(|c| c.direction == Direction::Up));
}

/// Failed and dry-run batches cannot be rolled back.
#[tokio::test]
async fn failed_and_dry_run_batches_are_ineligible() {
    let h = Harness::new(healthy_fleet(), InMemoryCatalog::uniform(2, true));
    h.applier
        .script("platform", vec![ApplyOutcome::Fatal("broken".into())]);
    let failed = h.orchestrator.run_batch(request(ScopeRequest::All)).await.unwrap();

    let report = h.rollback.check_eligibility(failed.id).await.unwrap();
    assert!(!report.eligible);
    assert!(report.reasons[0].contains("failed"));

    let mut input = request(ScopeRequest::All);
    input.dry_run = true;
    let dry = h.orchestrator.run_batch(input).await.unwrap();
    let report = h.rollback.check_eligibility(dry.id).await.unwrap();
    assert!(!report.eligible);
    assert!(report.reasons.iter().any(|r| r.contains("Dry-run")));
}

/// A batch still running cannot be rolled back, even though some of its
/// targets already completed.
#[tokio::test]
async fn running_batch_is_ineligible() {
    let h = Harness::build(
        healthy_fleet(),
        InMemoryCatalog::uniform(2, true),
        ScriptedApplier::with_delay(Duration::from_millis(50)),
        test_config(),
    );
    let batch_id = h.orchestrator.start_batch(request(ScopeRequest::All)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(80)).await;

    let report = h.rollback.check_eligibility(batch_id).await.unwrap();
    assert!(!report.eligible);
    assert!(report.reasons[0].contains("status is running"), "{:?}", report.reasons);

    let err = h
        .rollback
        .execute_rollback(batch_id, None, false, "ops")
        .await
        .unwrap_err();
    assert_matches!(err, EngineError::Core(CoreError::Ineligible { .. }));
    assert!(h.rollback.list_rollbacks(batch_id).await.unwrap().is_empty());
}

/// Without undo scripts or snapshots no strategy is available.
#[tokio::test]
async fn no_strategy_means_ineligible() {
    let h = Harness::new(healthy_fleet(), InMemoryCatalog::uniform(2, false));
    let batch = completed_batch(&h).await;

    let report = h.rollback.check_eligibility(batch.id).await.unwrap();
    assert!(!report.eligible);
    assert_eq!(report.reasons, vec!["No rollback strategy is available".to_string()]);
}

// ---------------------------------------------------------------------------
// Test: execution
// ---------------------------------------------------------------------------

/// Undo scripts run latest wave first, the batch is marked rolled back,
/// and a second rollback is refused.
#[tokio::test]
async fn undo_scripts_revert_in_reverse_wave_order() {
    let h = Harness::new(healthy_fleet(), InMemoryCatalog::uniform(2, true));
    let batch = completed_batch(&h).await;
    let mut notices = h.bus.subscribe();

    let execution = h
        .rollback
        .execute_rollback(batch.id, None, false, "ops@example.com")
        .await
        .unwrap();

    assert_eq!(execution.status(), RollbackStatus::Completed);
    assert_eq!(execution.strategy, "undo_scripts");
    assert!(execution.completed_at.is_some());

    let downs: Vec<String> = h
        .applier
        .calls()
        .into_iter()
        .filter(|c| c.direction == Direction::Down)
        .map(|c| {
            assert_eq!(c.to, 1);
            c.target_id
        })
        .collect();
    assert_eq!(
        downs,
        ["tenant-a", "tenant-b", "template-eu", "analytics-eu", "shared-eu", "admin", "platform"]
    );

    let batch = h.orchestrator.get_batch(batch.id).await.unwrap();
    assert_eq!(batch.metadata["rolled_back"], true);
    assert_eq!(batch.metadata["rollback_execution_id"], execution.id);
    assert_eq!(notices.recv().await.unwrap().notice_type, NOTICE_ROLLBACK_COMPLETED);

    let err = h
        .rollback
        .execute_rollback(batch.id, None, false, "ops@example.com")
        .await
        .unwrap_err();
    assert_matches!(
        err,
        EngineError::Core(CoreError::Ineligible { ref reasons }) if reasons[0].contains("already been rolled back")
    );
}

/// With undo scripts missing the snapshot strategy is used.
#[tokio::test]
async fn snapshot_restore_used_when_undo_missing() {
    let h = Harness::new(healthy_fleet(), InMemoryCatalog::uniform(2, false));
    let batch = completed_batch(&h).await;
    for target in healthy_fleet() {
        h.snapshots.add(&target.target_id);
    }

    let execution = h
        .rollback
        .execute_rollback(batch.id, None, false, "ops")
        .await
        .unwrap();

    assert_eq!(execution.strategy, "snapshot_restore");
    assert_eq!(execution.status(), RollbackStatus::Completed);
    assert_eq!(h.snapshots.restored().len(), 7);

    assert_matches!(
        h.rollback
            .execute_rollback(batch.id, Some(RollbackStrategyKind::UndoScripts), false, "ops")
            .await,
        Err(EngineError::Core(CoreError::Ineligible { .. }))
    );
}

/// A rollback already holding the batch's lock blocks a second one.
#[tokio::test]
async fn concurrent_rollback_conflicts() {
    let h = Harness::new(healthy_fleet(), InMemoryCatalog::uniform(2, true));
    let batch = completed_batch(&h).await;
    assert!(h
        .locks
        .acquire(&rollback_key(batch.id), "other-engine", Duration::from_secs(60), PURPOSE_ROLLBACK)
        .await
        .unwrap());

    let err = h
        .rollback
        .execute_rollback(batch.id, None, false, "ops")
        .await
        .unwrap_err();

    assert_matches!(err, EngineError::Core(CoreError::Conflict(_)));
    assert!(h.rollback.list_rollbacks(batch.id).await.unwrap().is_empty());
}

/// A target whose `scope:target-id` lock is held by another operation is
/// not reverted; the rollback stops there and is recorded failed.
#[tokio::test]
async fn busy_target_stops_rollback() {
    let h = Harness::new(healthy_fleet(), InMemoryCatalog::uniform(2, true));
    let batch = completed_batch(&h).await;
    assert!(h
        .locks
        .acquire("tenant:tenant-b", "other-engine/batch-99", Duration::from_secs(60), PURPOSE_MIGRATION)
        .await
        .unwrap());

    let execution = h
        .rollback
        .execute_rollback(batch.id, None, false, "ops")
        .await
        .unwrap();

    assert_eq!(execution.status(), RollbackStatus::Failed);
    assert_eq!(
        execution.error_message.as_deref(),
        Some("tenant-b: target busy, held by other-engine/batch-99")
    );
    let downs: Vec<String> = h
        .applier
        .calls()
        .into_iter()
        .filter(|c| c.direction == Direction::Down)
        .map(|c| c.target_id)
        .collect();
    assert_eq!(downs, ["tenant-a"]);

    assert!(h.store.find_lock("tenant:tenant-a").await.is_none());
    assert_eq!(
        h.store.find_lock("tenant:tenant-b").await.unwrap().holder_id,
        "other-engine/batch-99"
    );
    assert!(h.rollback.check_eligibility(batch.id).await.unwrap().eligible);
}

/// A target that refuses its undo fails the rollback, which is recorded
/// and leaves the batch eligible for another attempt.
#[tokio::test]
async fn failed_revert_recorded() {
    let h = Harness::new(healthy_fleet(), InMemoryCatalog::uniform(2, true));
    let batch = completed_batch(&h).await;
    h.applier
        .script("tenant-b", vec![ApplyOutcome::Fatal("relation in use".into())]);
    let mut notices = h.bus.subscribe();

    let execution = h
        .rollback
        .execute_rollback(batch.id, None, false, "ops")
        .await
        .unwrap();

    assert_eq!(execution.status(), RollbackStatus::Failed);
    assert_eq!(execution.error_message.as_deref(), Some("tenant-b: relation in use"));
    assert_eq!(notices.recv().await.unwrap().notice_type, NOTICE_ROLLBACK_FAILED);
    assert!(h.store.find_lock(&rollback_key(batch.id)).await.is_none());

    let batch = h.orchestrator.get_batch(batch.id).await.unwrap();
    assert!(batch.metadata.get("rolled_back").is_none());
    assert!(h.rollback.check_eligibility(batch.id).await.unwrap().eligible);
}

/// A dry-run rollback touches nothing and does not mark the batch.
#[tokio::test]
async fn dry_run_rollback_changes_nothing() {
    let h = Harness::new(healthy_fleet(), InMemoryCatalog::uniform(2, true));
    let batch = completed_batch(&h).await;

    let execution = h
        .rollback
        .execute_rollback(batch.id, None, true, "ops")
        .await
        .unwrap();

    assert!(execution.dry_run);
    assert_eq!(execution.status(), RollbackStatus::Completed);
    assert!(h.applier.calls().iter().all(|c| c.direction == Direction::Up));
    assert!(h.rollback.check_eligibility(batch.id).await.unwrap().eligible);
    assert_eq!(h.rollback.list_rollbacks(batch.id).await.unwrap().len(), 1);
}
