//! Batch orchestration: resolve a request into waves, persist the batch
//! with one pending detail per target, then drive the waves.
//!
//! Waves are barriers. Inside a wave up to `parallelism` targets run at
//! once, each under its `scope:target-id` lock and through the retry
//! layer. After every wave the batch stops if a failed scope is a hard
//! prerequisite of anything still to run. Pause and cancel are
//! cooperative: they are observed between waves, in-flight applies finish.

use std::collections::HashMap;
use std::sync::Arc;

use futures::stream::{FuturesUnordered, StreamExt};
use strata_core::batch::{blocking_failure, final_status, summarize};
use strata_core::error::CoreError;
use strata_core::lock::PURPOSE_MIGRATION;
use strata_core::progress::ProgressSnapshot;
use strata_core::resolver::{resolve_plan, ExecutionPlan, Wave};
use strata_core::retry::{Applied, ApplyOutcome};
use strata_core::scope::{Scope, ScopeRequest};
use strata_core::target::{MigrationTarget, TargetFilter};
use strata_core::types::{DbId, SchemaVersion};
use strata_db::models::batch::{BatchListQuery, CreateBatch, MigrationBatch};
use strata_db::models::batch_detail::{BatchDetail, CreateBatchDetail, FinishDetail};
use strata_db::models::status::{BatchStatus, DetailStatus};
use strata_events::bus::{
    NOTICE_BATCH_CANCELLED, NOTICE_BATCH_COMPLETED, NOTICE_BATCH_FAILED, NOTICE_BATCH_STARTED,
};
use strata_events::{EngineNotice, EventBus};
use validator::Validate;

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::external::{Direction, ScriptApplier, ScriptCatalog, ScriptSet, TargetDirectory};
use crate::lock_manager::LockManager;
use crate::progress::ProgressTracker;
use crate::retry::{RetryLayer, RetryOutcome};
use crate::store::BatchStore;

pub const SKIP_BUSY: &str = "busy";
pub const SKIP_UP_TO_DATE: &str = "up to date";

/// Collaborators an [`Orchestrator`] is built from.
pub struct OrchestratorParts {
    pub store: Arc<dyn BatchStore>,
    pub locks: LockManager,
    pub directory: Arc<dyn TargetDirectory>,
    pub catalog: Arc<dyn ScriptCatalog>,
    pub applier: Arc<dyn ScriptApplier>,
    pub progress: Arc<ProgressTracker>,
    pub bus: Arc<EventBus>,
}

/// A persisted batch with its plan, ready to be driven.
struct PreparedBatch {
    batch: MigrationBatch,
    plan: ExecutionPlan,
    details: HashMap<String, BatchDetail>,
}

/// How one target ended within a wave.
#[derive(Debug)]
struct TargetResult {
    target_id: String,
    scope: Scope,
    status: DetailStatus,
    error: Option<String>,
}

#[derive(Clone)]
pub struct Orchestrator {
    config: Arc<EngineConfig>,
    store: Arc<dyn BatchStore>,
    locks: LockManager,
    retry: Arc<RetryLayer>,
    directory: Arc<dyn TargetDirectory>,
    catalog: Arc<dyn ScriptCatalog>,
    applier: Arc<dyn ScriptApplier>,
    progress: Arc<ProgressTracker>,
    bus: Arc<EventBus>,
}

impl Orchestrator {
    pub fn new(config: EngineConfig, parts: OrchestratorParts) -> Self {
        let retry = RetryLayer::new(config.retry.clone(), config.breaker, config.apply_timeout);
        Self {
            config: Arc::new(config),
            store: parts.store,
            locks: parts.locks,
            retry: Arc::new(retry),
            directory: parts.directory,
            catalog: parts.catalog,
            applier: parts.applier,
            progress: parts.progress,
            bus: parts.bus,
        }
    }

    pub fn progress_tracker(&self) -> &Arc<ProgressTracker> {
        &self.progress
    }

    pub fn retry_layer(&self) -> &RetryLayer {
        &self.retry
    }

    // -----------------------------------------------------------------------
    // Public operations
    // -----------------------------------------------------------------------

    /// Resolve and persist a batch, then drive it in the background.
    /// Resolution failures return an error and create no batch.
    pub async fn start_batch(&self, input: CreateBatch) -> EngineResult<DbId> {
        let prepared = self.prepare(&input).await?;
        let batch_id = prepared.batch.id;
        let this = self.clone();
        tokio::spawn(async move {
            if let Err(e) = this.drive(prepared).await {
                tracing::error!(batch_id, error = %e, "Batch driver failed");
            }
        });
        Ok(batch_id)
    }

    /// Resolve, persist and drive a batch to its end on the calling task.
    pub async fn run_batch(&self, input: CreateBatch) -> EngineResult<MigrationBatch> {
        let prepared = self.prepare(&input).await?;
        self.drive(prepared).await
    }

    pub async fn get_batch(&self, id: DbId) -> EngineResult<MigrationBatch> {
        self.store
            .find_batch(id)
            .await?
            .ok_or_else(|| EngineError::not_found("MigrationBatch", id))
    }

    pub async fn list_batches(&self, query: &BatchListQuery) -> EngineResult<Vec<MigrationBatch>> {
        self.store.list_batches(query).await
    }

    pub async fn batch_details(&self, id: DbId) -> EngineResult<Vec<BatchDetail>> {
        self.get_batch(id).await?;
        self.store.list_details(id).await
    }

    /// Cancel a batch that has not finished. Running applies complete; no
    /// further wave starts.
    pub async fn cancel_batch(&self, id: DbId) -> EngineResult<MigrationBatch> {
        let batch = self.get_batch(id).await?;
        batch
            .status()
            .validate_transition(BatchStatus::Cancelled)
            .map_err(CoreError::Conflict)?;
        if !self.store.cancel_batch(id).await? {
            return Err(CoreError::Conflict(format!("Batch {id} already finished")).into());
        }
        tracing::info!(batch_id = id, "Batch cancelled");
        self.announce(id, BatchStatus::Cancelled, None);
        self.get_batch(id).await
    }

    pub async fn pause_batch(&self, id: DbId) -> EngineResult<MigrationBatch> {
        self.transition(id, BatchStatus::Running, BatchStatus::Paused).await
    }

    pub async fn resume_batch(&self, id: DbId) -> EngineResult<MigrationBatch> {
        self.transition(id, BatchStatus::Paused, BatchStatus::Running).await
    }

    /// Live progress for a batch, rebuilt from persisted rows on every call
    /// when this instance is not driving it.
    pub async fn progress(&self, id: DbId) -> EngineResult<ProgressSnapshot> {
        if let Some(snapshot) = self.progress.snapshot(id).await {
            return Ok(snapshot);
        }
        let batch = self.get_batch(id).await?;
        let details = self.store.list_details(id).await?;
        Ok(ProgressTracker::rebuild(&batch, &details))
    }

    async fn transition(&self, id: DbId, from: BatchStatus, to: BatchStatus) -> EngineResult<MigrationBatch> {
        let batch = self.get_batch(id).await?;
        let current = batch.status();
        if current != from {
            return Err(CoreError::Conflict(format!("Invalid batch transition: {current} -> {to}")).into());
        }
        if !self.store.transition_batch(id, &[from], to).await? {
            return Err(CoreError::Conflict(format!("Batch {id} changed status concurrently")).into());
        }
        tracing::info!(batch_id = id, from = %from, to = %to, "Batch status changed");
        self.progress.set_status(id, to).await;
        self.get_batch(id).await
    }

    // -----------------------------------------------------------------------
    // Planning
    // -----------------------------------------------------------------------

    async fn prepare(&self, input: &CreateBatch) -> EngineResult<PreparedBatch> {
        input.validate()?;

        let fleet = self.fleet_for(&input.requested_scope).await?;
        let plan = resolve_plan(&input.requested_scope, &fleet).inspect_err(|e| {
            tracing::warn!(scope = %input.requested_scope, error = %e, "Scope request rejected");
        })?;

        let mut latest: HashMap<Scope, Option<SchemaVersion>> = HashMap::new();
        let mut rows = Vec::with_capacity(plan.total_targets());
        for wave in plan.waves() {
            for target in &wave.targets {
                let target_version = match latest.get(&target.scope) {
                    Some(version) => *version,
                    None => {
                        let version = self.catalog.latest_version(target.scope).await?;
                        latest.insert(target.scope, version);
                        version
                    }
                };
                rows.push(CreateBatchDetail {
                    target_id: target.target_id.clone(),
                    scope: target.scope.as_str().to_string(),
                    region: target.region.clone(),
                    wave_index: wave.index as i32,
                    previous_version: target.current_version,
                    target_version,
                });
            }
        }

        let (batch, details) = self.store.create_batch(input, &rows).await?;
        tracing::info!(
            batch_id = batch.id,
            scope = %input.requested_scope,
            total_targets = batch.total_targets,
            waves = plan.waves().len(),
            dry_run = batch.dry_run,
            initiated_by = %batch.initiated_by,
            "Batch created"
        );

        Ok(PreparedBatch {
            batch,
            plan,
            details: details.into_iter().map(|d| (d.target_id.clone(), d)).collect(),
        })
    }

    /// The part of the fleet a request can touch: the targets it selects
    /// plus every target in their prerequisite scopes.
    async fn fleet_for(&self, request: &ScopeRequest) -> EngineResult<Vec<MigrationTarget>> {
        let filter = match request {
            ScopeRequest::All => return self.directory.list_targets(&TargetFilter::default()).await,
            ScopeRequest::Scope(scope) => TargetFilter {
                scope: Some(*scope),
                ..Default::default()
            },
            ScopeRequest::Region(region) => TargetFilter {
                region: Some(region.clone()),
                ..Default::default()
            },
            ScopeRequest::Target(id) => TargetFilter {
                target_id: Some(id.clone()),
                ..Default::default()
            },
        };
        let mut fleet = self.directory.list_targets(&filter).await?;

        let mut prerequisites: Vec<Scope> = fleet
            .iter()
            .flat_map(|t| t.scope.all_prerequisites())
            .collect();
        prerequisites.sort();
        prerequisites.dedup();
        for scope in prerequisites {
            let upstream = self
                .directory
                .list_targets(&TargetFilter {
                    scope: Some(scope),
                    ..Default::default()
                })
                .await?;
            for target in upstream {
                if !fleet.iter().any(|t| t.target_id == target.target_id) {
                    fleet.push(target);
                }
            }
        }
        Ok(fleet)
    }

    // -----------------------------------------------------------------------
    // Execution
    // -----------------------------------------------------------------------

    async fn drive(&self, prepared: PreparedBatch) -> EngineResult<MigrationBatch> {
        let batch_id = prepared.batch.id;
        if let Err(e) = self.run_waves(&prepared).await {
            tracing::error!(batch_id, error = %e, "Batch aborted by internal error");
            let summary = format!("Internal error: {e}");
            match self
                .store
                .finish_batch(batch_id, BatchStatus::Failed, Some(summary.as_str()))
                .await
            {
                Ok(true) => self.announce(batch_id, BatchStatus::Failed, Some(summary.as_str())),
                Ok(false) => {
                    tracing::warn!(batch_id, "Batch not marked failed, it left the running state first")
                }
                Err(e) => tracing::error!(batch_id, error = %e, "Failed to record batch failure"),
            }
            self.progress.finish(batch_id, BatchStatus::Failed).await;
        }
        self.get_batch(batch_id).await
    }

    async fn run_waves(&self, prepared: &PreparedBatch) -> EngineResult<()> {
        let batch_id = prepared.batch.id;
        let plan = &prepared.plan;

        if !self
            .store
            .transition_batch(batch_id, &[BatchStatus::Pending], BatchStatus::Running)
            .await?
        {
            tracing::info!(batch_id, "Batch no longer pending, not started");
            return Ok(());
        }
        self.announce(batch_id, BatchStatus::Running, None);
        self.progress
            .start(batch_id, plan.total_targets(), plan.waves().len())
            .await;

        let mut errors: Vec<(String, String)> = Vec::new();
        for wave in plan.waves() {
            if let Some(stopped) = self.wait_until_runnable(batch_id).await? {
                tracing::info!(batch_id, wave_index = wave.index, status = %stopped, "Batch stopped before wave");
                self.progress.finish(batch_id, stopped).await;
                return Ok(());
            }

            tracing::info!(batch_id, wave_index = wave.index, targets = wave.targets.len(), "Wave started");
            self.progress.wave_started(batch_id, wave.index).await;

            let results = self.run_wave(prepared, wave).await;

            let mut failed_scopes = Vec::new();
            for result in results {
                if result.status == DetailStatus::Failed {
                    failed_scopes.push(result.scope);
                    errors.push((result.target_id, result.error.unwrap_or_default()));
                }
            }
            errors.sort();

            if let Some(blocked) = blocking_failure(&failed_scopes, &plan.scopes_after(wave.index)) {
                let counts = self.get_batch(batch_id).await?.counts();
                let summary = format!(
                    "{}; aborted: {} failure blocks {}",
                    summarize(&counts, &errors),
                    blocked.failed,
                    blocked.blocked
                );
                tracing::error!(
                    batch_id,
                    wave_index = wave.index,
                    failed_scope = %blocked.failed,
                    blocked_scope = %blocked.blocked,
                    "Hard prerequisite failed, remaining waves skipped"
                );
                return self.close(batch_id, BatchStatus::Failed, Some(summary)).await;
            }
        }

        let counts = self.get_batch(batch_id).await?.counts();
        let status = final_status(&counts);
        let summary = (!errors.is_empty()).then(|| summarize(&counts, &errors));
        self.close(batch_id, status, summary).await
    }

    /// Run one wave with at most `parallelism` targets in flight.
    async fn run_wave(&self, prepared: &PreparedBatch, wave: &Wave) -> Vec<TargetResult> {
        let work: Vec<(&MigrationTarget, &BatchDetail)> = wave
            .targets
            .iter()
            .filter_map(|t| prepared.details.get(&t.target_id).map(|d| (t, d)))
            .collect();
        let mut queue = work.into_iter();
        let mut running = FuturesUnordered::new();
        for (target, detail) in queue.by_ref().take(self.config.parallelism.max(1)) {
            running.push(self.run_target(&prepared.batch, detail, target));
        }

        let mut results = Vec::with_capacity(wave.targets.len());
        while let Some(result) = running.next().await {
            results.push(result);
            if let Some((target, detail)) = queue.next() {
                running.push(self.run_target(&prepared.batch, detail, target));
            }
        }
        results
    }

    /// `None` when the batch may start its next wave; otherwise the
    /// terminal status that stopped it. Paused batches are polled.
    async fn wait_until_runnable(&self, batch_id: DbId) -> EngineResult<Option<BatchStatus>> {
        let mut announced = false;
        loop {
            match self.get_batch(batch_id).await?.status() {
                BatchStatus::Running => return Ok(None),
                BatchStatus::Paused | BatchStatus::Pending => {
                    if !announced {
                        tracing::info!(batch_id, "Batch paused, waiting before next wave");
                        announced = true;
                    }
                    tokio::time::sleep(self.config.pause_poll_interval).await;
                }
                terminal => return Ok(Some(terminal)),
            }
        }
    }

    /// Record the final status once the batch is running. A pause that
    /// lands after the last wave holds completion until resume; a cancel
    /// wins.
    async fn close(&self, batch_id: DbId, status: BatchStatus, summary: Option<String>) -> EngineResult<()> {
        loop {
            if let Some(stopped) = self.wait_until_runnable(batch_id).await? {
                tracing::info!(batch_id, status = %stopped, "Batch finished elsewhere");
                self.progress.finish(batch_id, stopped).await;
                return Ok(());
            }
            if self
                .store
                .finish_batch(batch_id, status, summary.as_deref())
                .await?
            {
                tracing::info!(batch_id, status = %status, summary = summary.as_deref().unwrap_or(""), "Batch finished");
                self.announce(batch_id, status, summary.as_deref());
                self.progress.finish(batch_id, status).await;
                return Ok(());
            }
        }
    }

    async fn run_target(&self, batch: &MigrationBatch, detail: &BatchDetail, target: &MigrationTarget) -> TargetResult {
        match self.try_run_target(batch, detail, target).await {
            Ok(result) => result,
            Err(e) => {
                let error = format!("Internal error: {e}");
                tracing::error!(batch_id = batch.id, target_id = %target.target_id, error = %e, "Target execution failed");
                if let Err(e) = self
                    .finish_detail(batch.id, detail, target, DetailStatus::Failed, None, Some(error.clone()))
                    .await
                {
                    tracing::error!(batch_id = batch.id, target_id = %target.target_id, error = %e, "Failed to record target failure");
                }
                TargetResult {
                    target_id: target.target_id.clone(),
                    scope: target.scope,
                    status: DetailStatus::Failed,
                    error: Some(error),
                }
            }
        }
    }

    async fn try_run_target(
        &self,
        batch: &MigrationBatch,
        detail: &BatchDetail,
        target: &MigrationTarget,
    ) -> EngineResult<TargetResult> {
        let to_version = match detail.target_version {
            Some(to) if target.current_version.is_none_or(|current| current < to) => to,
            _ => {
                return self
                    .finish_detail(batch.id, detail, target, DetailStatus::Skipped, None, Some(SKIP_UP_TO_DATE.into()))
                    .await;
            }
        };

        let key = target.resource_key();
        let holder = format!("{}/batch-{}", self.config.instance_id, batch.id);
        if !self
            .locks
            .acquire(&key, &holder, self.config.lock_ttl, PURPOSE_MIGRATION)
            .await?
        {
            let held_by = self.locks.holder_of(&key).await?.unwrap_or_default();
            tracing::info!(batch_id = batch.id, target_id = %target.target_id, held_by = %held_by, "Target locked elsewhere, skipped");
            return self
                .finish_detail(batch.id, detail, target, DetailStatus::Skipped, None, Some(SKIP_BUSY.into()))
                .await;
        }

        let result = self.apply_locked(batch, detail, target, to_version).await;
        if let Err(e) = self.locks.release(&key, &holder).await {
            tracing::warn!(resource_key = %key, error = %e, "Failed to release target lock");
        }
        result
    }

    async fn apply_locked(
        &self,
        batch: &MigrationBatch,
        detail: &BatchDetail,
        target: &MigrationTarget,
        to_version: SchemaVersion,
    ) -> EngineResult<TargetResult> {
        if !self.store.mark_detail_running(detail.id).await? {
            return Err(CoreError::Conflict(format!(
                "Detail {} for {} was not pending",
                detail.id, target.target_id
            ))
            .into());
        }
        self.progress.target_started(batch.id, &target.target_id).await;

        let scripts = ScriptSet {
            scope: target.scope,
            from: target.current_version,
            to: to_version,
            direction: Direction::Up,
        };
        let store = &self.store;
        let applier = &self.applier;
        let scripts_ref = &scripts;
        let dry_run = batch.dry_run;
        let detail_id = detail.id;

        let outcome = self
            .retry
            .execute(&target.target_id, |attempt| async move {
                if let Err(e) = store.record_attempt(detail_id, attempt as i32).await {
                    tracing::warn!(detail_id, attempt, error = %e, "Failed to record attempt");
                }
                if dry_run {
                    ApplyOutcome::Applied(Applied {
                        new_version: scripts_ref.to,
                        duration_ms: 0,
                    })
                } else {
                    applier.apply(target, scripts_ref, false).await
                }
            })
            .await;

        match outcome {
            RetryOutcome::Applied { applied, attempts } => {
                tracing::info!(
                    batch_id = batch.id,
                    target_id = %target.target_id,
                    new_version = applied.new_version,
                    duration_ms = applied.duration_ms,
                    attempts,
                    dry_run,
                    "Target migrated"
                );
                self.finish_detail(
                    batch.id,
                    detail,
                    target,
                    DetailStatus::Completed,
                    Some(applied),
                    None,
                )
                .await
            }
            RetryOutcome::Failed { error, attempts, .. } => {
                tracing::error!(batch_id = batch.id, target_id = %target.target_id, attempts, error = %error, "Target failed");
                self.finish_detail(batch.id, detail, target, DetailStatus::Failed, None, Some(error))
                    .await
            }
            RetryOutcome::CircuitOpen { retry_after, .. } => {
                let error = format!("Circuit open for target, retry after {}", retry_after.to_rfc3339());
                self.finish_detail(batch.id, detail, target, DetailStatus::Failed, None, Some(error))
                    .await
            }
        }
    }

    async fn finish_detail(
        &self,
        batch_id: DbId,
        detail: &BatchDetail,
        target: &MigrationTarget,
        status: DetailStatus,
        applied: Option<Applied>,
        error: Option<String>,
    ) -> EngineResult<TargetResult> {
        let outcome = FinishDetail {
            status,
            applied_version: applied.map(|a| a.new_version),
            duration_ms: applied.map(|a| a.duration_ms),
            error_message: error.clone(),
        };
        self.store.finish_detail(batch_id, detail.id, &outcome).await?;
        self.progress
            .target_finished(batch_id, &target.target_id, status, outcome.duration_ms)
            .await;
        Ok(TargetResult {
            target_id: target.target_id.clone(),
            scope: target.scope,
            status,
            error,
        })
    }

    fn announce(&self, batch_id: DbId, status: BatchStatus, summary: Option<&str>) {
        let notice_type = match status {
            BatchStatus::Running => NOTICE_BATCH_STARTED,
            BatchStatus::Completed => NOTICE_BATCH_COMPLETED,
            BatchStatus::Failed => NOTICE_BATCH_FAILED,
            BatchStatus::Cancelled => NOTICE_BATCH_CANCELLED,
            BatchStatus::Pending | BatchStatus::Paused => return,
        };
        self.bus.publish(
            EngineNotice::new(notice_type)
                .with_batch(batch_id)
                .with_payload(serde_json::json!({ "summary": summary })),
        );
    }
}
