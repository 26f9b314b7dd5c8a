//! Rollback of completed batches.
//!
//! Eligibility is decided up front and an ineligible request changes
//! nothing. Two strategies exist, tried in priority order: undo scripts,
//! then snapshot restore. A `rollback:<batch-id>` lock keeps two rollbacks
//! of one batch from running at once. A failed rollback is recorded and
//! reported; it is never retried automatically.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use strata_core::error::CoreError;
use strata_core::lock::{rollback_key, PURPOSE_ROLLBACK};
use strata_core::retry::{Applied, ApplyOutcome};
use strata_core::rollback::{
    ineligibility_reasons, select_strategy, BatchFacts, EligibilityReport, RollbackStrategyKind,
    StrategyAvailability, METADATA_ROLLED_BACK,
};
use strata_core::scope::Scope;
use strata_core::target::{MigrationTarget, TargetFilter};
use strata_core::types::DbId;
use strata_db::models::batch::MigrationBatch;
use strata_db::models::batch_detail::BatchDetail;
use strata_db::models::rollback::{CreateRollback, RollbackExecution};
use strata_db::models::status::{DetailStatus, RollbackStatus};
use strata_events::bus::{NOTICE_ROLLBACK_COMPLETED, NOTICE_ROLLBACK_FAILED};
use strata_events::{EngineNotice, EventBus};

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::external::{Direction, ScriptApplier, ScriptCatalog, ScriptSet, SnapshotProvider, TargetDirectory};
use crate::lock_manager::LockManager;
use crate::store::{BatchStore, RollbackStore};

// ---------------------------------------------------------------------------
// Strategies
// ---------------------------------------------------------------------------

/// One way of reversing the targets a batch migrated.
#[async_trait]
pub trait RollbackStrategy: Send + Sync {
    fn kind(&self) -> RollbackStrategyKind;

    /// Whether this strategy can reverse every completed detail of `batch`.
    async fn availability(
        &self,
        batch: &MigrationBatch,
        completed: &[&BatchDetail],
    ) -> EngineResult<StrategyAvailability>;

    /// Reverse one target. `dry_run` validates without touching it.
    async fn revert(
        &self,
        batch_id: DbId,
        target: &MigrationTarget,
        detail: &BatchDetail,
        dry_run: bool,
    ) -> ApplyOutcome;
}

fn unavailable(strategy: RollbackStrategyKind, reason: String) -> StrategyAvailability {
    StrategyAvailability {
        strategy,
        available: false,
        reason: Some(reason),
    }
}

fn available(strategy: RollbackStrategyKind) -> StrategyAvailability {
    StrategyAvailability {
        strategy,
        available: true,
        reason: None,
    }
}

/// Runs the down-scripts from the applied version back to the version
/// each target had before the batch.
pub struct UndoScriptStrategy {
    catalog: Arc<dyn ScriptCatalog>,
    applier: Arc<dyn ScriptApplier>,
}

impl UndoScriptStrategy {
    pub fn new(catalog: Arc<dyn ScriptCatalog>, applier: Arc<dyn ScriptApplier>) -> Self {
        Self { catalog, applier }
    }
}

#[async_trait]
impl RollbackStrategy for UndoScriptStrategy {
    fn kind(&self) -> RollbackStrategyKind {
        RollbackStrategyKind::UndoScripts
    }

    async fn availability(
        &self,
        _batch: &MigrationBatch,
        completed: &[&BatchDetail],
    ) -> EngineResult<StrategyAvailability> {
        for detail in completed {
            let Some(applied) = detail.target_version else {
                continue;
            };
            let scope: Scope = detail.scope.parse()?;
            if !self
                .catalog
                .has_undo(scope, detail.previous_version, applied)
                .await?
            {
                return Ok(unavailable(
                    self.kind(),
                    format!("Missing undo scripts for {} ({scope})", detail.target_id),
                ));
            }
        }
        Ok(available(self.kind()))
    }

    async fn revert(
        &self,
        _batch_id: DbId,
        target: &MigrationTarget,
        detail: &BatchDetail,
        dry_run: bool,
    ) -> ApplyOutcome {
        let Some(applied) = detail.target_version else {
            return ApplyOutcome::Fatal(format!("No applied version recorded for {}", detail.target_id));
        };
        let restore_to = detail.previous_version.unwrap_or(0);
        if dry_run {
            return ApplyOutcome::Applied(Applied {
                new_version: restore_to,
                duration_ms: 0,
            });
        }
        let scripts = ScriptSet {
            scope: target.scope,
            from: Some(applied),
            to: restore_to,
            direction: Direction::Down,
        };
        self.applier.apply(target, &scripts, false).await
    }
}

/// Restores the snapshot taken before each target was migrated.
pub struct SnapshotRestoreStrategy {
    snapshots: Arc<dyn SnapshotProvider>,
}

impl SnapshotRestoreStrategy {
    pub fn new(snapshots: Arc<dyn SnapshotProvider>) -> Self {
        Self { snapshots }
    }
}

#[async_trait]
impl RollbackStrategy for SnapshotRestoreStrategy {
    fn kind(&self) -> RollbackStrategyKind {
        RollbackStrategyKind::SnapshotRestore
    }

    async fn availability(
        &self,
        batch: &MigrationBatch,
        completed: &[&BatchDetail],
    ) -> EngineResult<StrategyAvailability> {
        for detail in completed {
            if !self.snapshots.has_snapshot(batch.id, &detail.target_id).await? {
                return Ok(unavailable(
                    self.kind(),
                    format!("No snapshot for {}", detail.target_id),
                ));
            }
        }
        Ok(available(self.kind()))
    }

    async fn revert(
        &self,
        batch_id: DbId,
        target: &MigrationTarget,
        detail: &BatchDetail,
        dry_run: bool,
    ) -> ApplyOutcome {
        if dry_run {
            return ApplyOutcome::Applied(Applied {
                new_version: detail.previous_version.unwrap_or(0),
                duration_ms: 0,
            });
        }
        self.snapshots.restore(batch_id, target).await
    }
}

// ---------------------------------------------------------------------------
// Service
// ---------------------------------------------------------------------------

/// Collaborators a [`RollbackService`] is built from.
pub struct RollbackParts {
    pub batches: Arc<dyn BatchStore>,
    pub rollbacks: Arc<dyn RollbackStore>,
    pub locks: LockManager,
    pub directory: Arc<dyn TargetDirectory>,
    pub catalog: Arc<dyn ScriptCatalog>,
    pub applier: Arc<dyn ScriptApplier>,
    pub snapshots: Arc<dyn SnapshotProvider>,
    pub bus: Arc<EventBus>,
}

#[derive(Clone)]
pub struct RollbackService {
    instance_id: String,
    window: std::time::Duration,
    lock_ttl: std::time::Duration,
    batches: Arc<dyn BatchStore>,
    rollbacks: Arc<dyn RollbackStore>,
    locks: LockManager,
    directory: Arc<dyn TargetDirectory>,
    strategies: Vec<Arc<dyn RollbackStrategy>>,
    bus: Arc<EventBus>,
}

impl RollbackService {
    pub fn new(config: &EngineConfig, parts: RollbackParts) -> Self {
        let strategies: Vec<Arc<dyn RollbackStrategy>> = vec![
            Arc::new(UndoScriptStrategy::new(parts.catalog, parts.applier)),
            Arc::new(SnapshotRestoreStrategy::new(parts.snapshots)),
        ];
        Self {
            instance_id: config.instance_id.clone(),
            window: config.rollback_window,
            lock_ttl: config.lock_ttl,
            batches: parts.batches,
            rollbacks: parts.rollbacks,
            locks: parts.locks,
            directory: parts.directory,
            strategies,
            bus: parts.bus,
        }
    }

    pub async fn list_rollbacks(&self, batch_id: DbId) -> EngineResult<Vec<RollbackExecution>> {
        self.rollbacks.list_rollbacks(batch_id).await
    }

    /// Whether `batch_id` may be rolled back, with every reason it may not
    /// and the availability of each strategy.
    pub async fn check_eligibility(&self, batch_id: DbId) -> EngineResult<EligibilityReport> {
        let batch = self.load_batch(batch_id).await?;
        let details = self.batches.list_details(batch_id).await?;
        self.eligibility(&batch, &details).await
    }

    async fn eligibility(&self, batch: &MigrationBatch, details: &[BatchDetail]) -> EngineResult<EligibilityReport> {
        let facts = BatchFacts {
            status: batch.status(),
            completed_at: batch.completed_at,
            dry_run: batch.dry_run,
            metadata: &batch.metadata,
        };
        let mut reasons = ineligibility_reasons(facts, Utc::now(), self.window);

        let completed = completed_details(details);
        let mut strategies = Vec::with_capacity(self.strategies.len());
        for strategy in &self.strategies {
            let availability = if completed.is_empty() {
                unavailable(strategy.kind(), "Batch migrated no targets".to_string())
            } else {
                strategy.availability(batch, &completed).await?
            };
            strategies.push(availability);
        }
        if !strategies.iter().any(|s| s.available) {
            reasons.push("No rollback strategy is available".to_string());
        }

        Ok(EligibilityReport {
            eligible: reasons.is_empty(),
            reasons,
            strategies,
        })
    }

    /// Reverse a completed batch.
    ///
    /// Ineligible requests and a busy rollback lock fail before anything is
    /// written. Otherwise an execution row is recorded and the outcome of
    /// the reversal, success or failure, is stored on it.
    pub async fn execute_rollback(
        &self,
        batch_id: DbId,
        requested: Option<RollbackStrategyKind>,
        dry_run: bool,
        initiated_by: &str,
    ) -> EngineResult<RollbackExecution> {
        let batch = self.load_batch(batch_id).await?;
        let details = self.batches.list_details(batch_id).await?;
        let report = self.eligibility(&batch, &details).await?;
        if !report.eligible {
            tracing::warn!(batch_id, reasons = ?report.reasons, "Rollback rejected");
            return Err(CoreError::Ineligible {
                reasons: report.reasons,
            }
            .into());
        }
        let strategy_kind = select_strategy(requested, &report.strategies)?;

        let key = rollback_key(batch_id);
        let holder = format!("{}/rollback-{}", self.instance_id, uuid::Uuid::new_v4());
        if !self
            .locks
            .acquire(&key, &holder, self.lock_ttl, PURPOSE_ROLLBACK)
            .await?
        {
            return Err(CoreError::Conflict(format!("Rollback already in progress for batch {batch_id}")).into());
        }

        let result = self
            .run_locked(batch_id, strategy_kind, dry_run, initiated_by, &holder)
            .await;
        if let Err(e) = self.locks.release(&key, &holder).await {
            tracing::warn!(resource_key = %key, error = %e, "Failed to release rollback lock");
        }
        result
    }

    async fn run_locked(
        &self,
        batch_id: DbId,
        strategy_kind: RollbackStrategyKind,
        dry_run: bool,
        initiated_by: &str,
        holder: &str,
    ) -> EngineResult<RollbackExecution> {
        // The batch may have been rolled back between the check and the lock.
        let batch = self.load_batch(batch_id).await?;
        let details = self.batches.list_details(batch_id).await?;
        let report = self.eligibility(&batch, &details).await?;
        if !report.eligible {
            return Err(CoreError::Ineligible {
                reasons: report.reasons,
            }
            .into());
        }

        let strategy = self
            .strategies
            .iter()
            .find(|s| s.kind() == strategy_kind)
            .cloned()
            .ok_or_else(|| CoreError::Internal(format!("Strategy {strategy_kind} not registered")))?;

        let execution = self
            .rollbacks
            .create_rollback(&CreateRollback {
                batch_id,
                strategy: strategy_kind,
                dry_run,
                initiated_by: initiated_by.to_string(),
            })
            .await?;
        tracing::info!(
            batch_id,
            rollback_id = execution.id,
            strategy = %strategy_kind,
            dry_run,
            initiated_by,
            "Rollback started"
        );

        let outcome = self
            .revert_all(strategy.as_ref(), &batch, &details, dry_run, holder)
            .await;
        match outcome {
            Ok(reverted) => {
                let finished = self
                    .rollbacks
                    .finish_rollback(execution.id, RollbackStatus::Completed, None)
                    .await?
                    .unwrap_or(execution);
                if !dry_run {
                    let patch = serde_json::json!({
                        METADATA_ROLLED_BACK: true,
                        "rolled_back_at": Utc::now(),
                        "rollback_execution_id": finished.id,
                    });
                    self.batches.merge_metadata(batch_id, &patch).await?;
                }
                tracing::info!(batch_id, rollback_id = finished.id, reverted, dry_run, "Rollback completed");
                self.bus.publish(
                    EngineNotice::new(NOTICE_ROLLBACK_COMPLETED)
                        .with_batch(batch_id)
                        .with_payload(serde_json::json!({
                            "rollback_id": finished.id,
                            "strategy": strategy_kind,
                            "reverted": reverted,
                            "dry_run": dry_run,
                        })),
                );
                Ok(finished)
            }
            Err(error) => {
                tracing::error!(batch_id, rollback_id = execution.id, error = %error, "Rollback failed");
                let finished = self
                    .rollbacks
                    .finish_rollback(execution.id, RollbackStatus::Failed, Some(error.as_str()))
                    .await?
                    .unwrap_or(execution);
                self.bus.publish(
                    EngineNotice::new(NOTICE_ROLLBACK_FAILED)
                        .with_batch(batch_id)
                        .with_payload(serde_json::json!({
                            "rollback_id": finished.id,
                            "strategy": strategy_kind,
                            "error": error,
                        })),
                );
                Ok(finished)
            }
        }
    }

    /// Revert every completed detail, latest wave first, each under its
    /// `scope:target-id` lock. Stops at the first failure or busy target
    /// and returns its message.
    async fn revert_all(
        &self,
        strategy: &dyn RollbackStrategy,
        batch: &MigrationBatch,
        details: &[BatchDetail],
        dry_run: bool,
        holder: &str,
    ) -> Result<usize, String> {
        let fleet = self
            .directory
            .list_targets(&TargetFilter::default())
            .await
            .map_err(|e| format!("Target directory unavailable: {e}"))?;
        let targets: HashMap<&str, &MigrationTarget> =
            fleet.iter().map(|t| (t.target_id.as_str(), t)).collect();

        let mut completed = completed_details(details);
        completed.sort_by(|a, b| b.wave_index.cmp(&a.wave_index).then(a.target_id.cmp(&b.target_id)));

        let mut reverted = 0;
        for detail in completed {
            let Some(target) = targets.get(detail.target_id.as_str()) else {
                return Err(format!("{}: target no longer in directory", detail.target_id));
            };
            let key = target.resource_key();
            let granted = self
                .locks
                .acquire(&key, holder, self.lock_ttl, PURPOSE_ROLLBACK)
                .await
                .map_err(|e| format!("{}: lock unavailable: {e}", detail.target_id))?;
            if !granted {
                let held_by = self
                    .locks
                    .holder_of(&key)
                    .await
                    .ok()
                    .flatten()
                    .unwrap_or_else(|| "unknown".to_string());
                tracing::warn!(batch_id = batch.id, target_id = %detail.target_id, held_by = %held_by, "Target busy, rollback stopped");
                return Err(format!("{}: target busy, held by {held_by}", detail.target_id));
            }

            let outcome = strategy.revert(batch.id, target, detail, dry_run).await;
            if let Err(e) = self.locks.release(&key, holder).await {
                tracing::warn!(resource_key = %key, error = %e, "Failed to release target lock");
            }
            match outcome {
                ApplyOutcome::Applied(_) => {
                    tracing::debug!(batch_id = batch.id, target_id = %detail.target_id, "Target reverted");
                    reverted += 1;
                }
                ApplyOutcome::Retryable(msg) | ApplyOutcome::Fatal(msg) => {
                    return Err(format!("{}: {msg}", detail.target_id));
                }
            }
        }
        Ok(reverted)
    }

    async fn load_batch(&self, batch_id: DbId) -> EngineResult<MigrationBatch> {
        self.batches
            .find_batch(batch_id)
            .await?
            .ok_or_else(|| EngineError::not_found("MigrationBatch", batch_id))
    }
}

fn completed_details(details: &[BatchDetail]) -> Vec<&BatchDetail> {
    details
        .iter()
        .filter(|d| d.status() == DetailStatus::Completed)
        .collect()
}
