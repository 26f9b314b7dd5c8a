//! Persistence seams used by the engine.
//!
//! [`PgStore`] maps each call onto the static `strata_db` repositories.
//! [`MemoryStore`] applies the same guarded transitions to in-process
//! state; it backs single-process dry runs and the integration tests.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use strata_core::lock::expires_at;
use strata_core::types::{DbId, Timestamp};
use strata_db::models::batch::{BatchListQuery, CreateBatch, MigrationBatch};
use strata_db::models::batch_detail::{BatchDetail, CreateBatchDetail, FinishDetail};
use strata_db::models::lock::ResourceLock;
use strata_db::models::rollback::{CreateRollback, RollbackExecution};
use strata_db::models::status::{BatchStatus, DetailStatus, RollbackStatus};
use strata_db::repositories::{BatchDetailRepo, BatchRepo, LockRepo, RollbackRepo};
use strata_db::DbPool;
use tokio::sync::Mutex;

use crate::error::EngineResult;

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

#[async_trait]
pub trait LockStore: Send + Sync {
    /// Single atomic conditional insert. `true` when granted, or when
    /// `holder_id` already holds a live lease on the key.
    async fn try_acquire(
        &self,
        resource_key: &str,
        holder_id: &str,
        purpose: &str,
        ttl: Duration,
    ) -> EngineResult<bool>;

    async fn release(&self, resource_key: &str, holder_id: &str) -> EngineResult<bool>;

    async fn reap_expired(&self) -> EngineResult<u64>;

    /// The lease row on `resource_key`, live or expired.
    async fn current_lock(&self, resource_key: &str) -> EngineResult<Option<ResourceLock>>;
}

#[async_trait]
pub trait BatchStore: Send + Sync {
    /// Persist a pending batch together with one pending detail per target.
    async fn create_batch(
        &self,
        input: &CreateBatch,
        details: &[CreateBatchDetail],
    ) -> EngineResult<(MigrationBatch, Vec<BatchDetail>)>;

    async fn find_batch(&self, id: DbId) -> EngineResult<Option<MigrationBatch>>;

    async fn list_batches(&self, query: &BatchListQuery) -> EngineResult<Vec<MigrationBatch>>;

    /// Guarded status change; `false` when the batch was not in `from`.
    async fn transition_batch(&self, id: DbId, from: &[BatchStatus], to: BatchStatus) -> EngineResult<bool>;

    /// Terminal status plus summary; `false` unless the batch's current
    /// status may move to `status` (a paused batch cannot finish).
    async fn finish_batch(&self, id: DbId, status: BatchStatus, summary: Option<&str>) -> EngineResult<bool>;

    async fn cancel_batch(&self, id: DbId) -> EngineResult<bool>;

    async fn merge_metadata(&self, id: DbId, patch: &serde_json::Value) -> EngineResult<()>;

    async fn list_details(&self, batch_id: DbId) -> EngineResult<Vec<BatchDetail>>;

    async fn mark_detail_running(&self, detail_id: DbId) -> EngineResult<bool>;

    async fn record_attempt(&self, detail_id: DbId, attempt: i32) -> EngineResult<()>;

    /// Move a detail to its terminal status and bump the matching batch
    /// counter as one unit. `false` (and no counter change) if it was
    /// already terminal.
    async fn finish_detail(&self, batch_id: DbId, detail_id: DbId, outcome: &FinishDetail) -> EngineResult<bool>;
}

#[async_trait]
pub trait RollbackStore: Send + Sync {
    async fn create_rollback(&self, input: &CreateRollback) -> EngineResult<RollbackExecution>;

    async fn finish_rollback(
        &self,
        id: DbId,
        status: RollbackStatus,
        error: Option<&str>,
    ) -> EngineResult<Option<RollbackExecution>>;

    async fn list_rollbacks(&self, batch_id: DbId) -> EngineResult<Vec<RollbackExecution>>;
}

// ---------------------------------------------------------------------------
// Postgres
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct PgStore {
    pool: DbPool,
}

impl PgStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LockStore for PgStore {
    async fn try_acquire(
        &self,
        resource_key: &str,
        holder_id: &str,
        purpose: &str,
        ttl: Duration,
    ) -> EngineResult<bool> {
        let ttl_ms = ttl.as_millis() as i64;
        Ok(LockRepo::try_acquire(&self.pool, resource_key, holder_id, purpose, ttl_ms).await?)
    }

    async fn release(&self, resource_key: &str, holder_id: &str) -> EngineResult<bool> {
        Ok(LockRepo::release(&self.pool, resource_key, holder_id).await?)
    }

    async fn reap_expired(&self) -> EngineResult<u64> {
        Ok(LockRepo::reap_expired(&self.pool).await?)
    }

    async fn current_lock(&self, resource_key: &str) -> EngineResult<Option<ResourceLock>> {
        Ok(LockRepo::find(&self.pool, resource_key).await?)
    }
}

#[async_trait]
impl BatchStore for PgStore {
    async fn create_batch(
        &self,
        input: &CreateBatch,
        details: &[CreateBatchDetail],
    ) -> EngineResult<(MigrationBatch, Vec<BatchDetail>)> {
        let mut tx = self.pool.begin().await?;
        let batch = BatchRepo::create(&mut tx, input, details.len() as i32).await?;
        let rows = BatchDetailRepo::create_many(&mut tx, batch.id, details).await?;
        tx.commit().await?;
        Ok((batch, rows))
    }

    async fn find_batch(&self, id: DbId) -> EngineResult<Option<MigrationBatch>> {
        Ok(BatchRepo::find_by_id(&self.pool, id).await?)
    }

    async fn list_batches(&self, query: &BatchListQuery) -> EngineResult<Vec<MigrationBatch>> {
        Ok(BatchRepo::list(&self.pool, query).await?)
    }

    async fn transition_batch(&self, id: DbId, from: &[BatchStatus], to: BatchStatus) -> EngineResult<bool> {
        Ok(BatchRepo::transition(&self.pool, id, from, to).await?)
    }

    async fn finish_batch(&self, id: DbId, status: BatchStatus, summary: Option<&str>) -> EngineResult<bool> {
        Ok(BatchRepo::finish(&self.pool, id, status, summary).await?)
    }

    async fn cancel_batch(&self, id: DbId) -> EngineResult<bool> {
        Ok(BatchRepo::cancel(&self.pool, id).await?)
    }

    async fn merge_metadata(&self, id: DbId, patch: &serde_json::Value) -> EngineResult<()> {
        Ok(BatchRepo::merge_metadata(&self.pool, id, patch).await?)
    }

    async fn list_details(&self, batch_id: DbId) -> EngineResult<Vec<BatchDetail>> {
        Ok(BatchDetailRepo::list_by_batch(&self.pool, batch_id).await?)
    }

    async fn mark_detail_running(&self, detail_id: DbId) -> EngineResult<bool> {
        Ok(BatchDetailRepo::mark_running(&self.pool, detail_id).await?)
    }

    async fn record_attempt(&self, detail_id: DbId, attempt: i32) -> EngineResult<()> {
        Ok(BatchDetailRepo::record_attempt(&self.pool, detail_id, attempt).await?)
    }

    async fn finish_detail(&self, batch_id: DbId, detail_id: DbId, outcome: &FinishDetail) -> EngineResult<bool> {
        let mut tx = self.pool.begin().await?;
        let finished = BatchDetailRepo::finish(&mut tx, detail_id, outcome).await?;
        if finished {
            BatchRepo::increment_count(&mut tx, batch_id, outcome.status).await?;
        }
        tx.commit().await?;
        Ok(finished)
    }
}

#[async_trait]
impl RollbackStore for PgStore {
    async fn create_rollback(&self, input: &CreateRollback) -> EngineResult<RollbackExecution> {
        Ok(RollbackRepo::create_running(&self.pool, input).await?)
    }

    async fn finish_rollback(
        &self,
        id: DbId,
        status: RollbackStatus,
        error: Option<&str>,
    ) -> EngineResult<Option<RollbackExecution>> {
        Ok(RollbackRepo::finish(&self.pool, id, status, error).await?)
    }

    async fn list_rollbacks(&self, batch_id: DbId) -> EngineResult<Vec<RollbackExecution>> {
        Ok(RollbackRepo::list_by_batch(&self.pool, batch_id).await?)
    }
}

// ---------------------------------------------------------------------------
// In-memory
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MemoryState {
    next_id: DbId,
    clock_offset_ms: i64,
    locks: HashMap<String, ResourceLock>,
    batches: Vec<MigrationBatch>,
    details: Vec<BatchDetail>,
    rollbacks: Vec<RollbackExecution>,
}

impl MemoryState {
    fn now(&self) -> Timestamp {
        Utc::now() + chrono::Duration::milliseconds(self.clock_offset_ms)
    }

    fn next_id(&mut self) -> DbId {
        self.next_id += 1;
        self.next_id
    }

    fn batch_mut(&mut self, id: DbId) -> Option<&mut MigrationBatch> {
        self.batches.iter_mut().find(|b| b.id == id)
    }

    fn detail_mut(&mut self, id: DbId) -> Option<&mut BatchDetail> {
        self.details.iter_mut().find(|d| d.id == id)
    }
}

/// Whole-engine store kept in process memory. Every call takes one mutex,
/// so each operation is atomic with respect to the others.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Move the store's clock forward. Lock expiry and row timestamps use
    /// the shifted clock.
    pub async fn advance_clock(&self, by: chrono::Duration) {
        self.state.lock().await.clock_offset_ms += by.num_milliseconds();
    }

    pub async fn find_lock(&self, resource_key: &str) -> Option<ResourceLock> {
        self.state.lock().await.locks.get(resource_key).cloned()
    }

    /// Shift a batch's completion time, e.g. to age it past a window.
    pub async fn set_completed_at(&self, batch_id: DbId, completed_at: Timestamp) -> bool {
        let mut state = self.state.lock().await;
        match state.batch_mut(batch_id) {
            Some(batch) => {
                batch.completed_at = Some(completed_at);
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl LockStore for MemoryStore {
    async fn try_acquire(
        &self,
        resource_key: &str,
        holder_id: &str,
        purpose: &str,
        ttl: Duration,
    ) -> EngineResult<bool> {
        let mut state = self.state.lock().await;
        let now = state.now();
        if let Some(existing) = state.locks.get(resource_key) {
            if !existing.is_expired(now) {
                return Ok(existing.holder_id == holder_id);
            }
        }
        state.locks.insert(
            resource_key.to_string(),
            ResourceLock {
                resource_key: resource_key.to_string(),
                holder_id: holder_id.to_string(),
                purpose: purpose.to_string(),
                acquired_at: now,
                expires_at: expires_at(now, ttl),
            },
        );
        Ok(true)
    }

    async fn release(&self, resource_key: &str, holder_id: &str) -> EngineResult<bool> {
        let mut state = self.state.lock().await;
        match state.locks.get(resource_key) {
            Some(lock) if lock.holder_id == holder_id => {
                state.locks.remove(resource_key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn reap_expired(&self) -> EngineResult<u64> {
        let mut state = self.state.lock().await;
        let now = state.now();
        let before = state.locks.len();
        state.locks.retain(|_, lock| !lock.is_expired(now));
        Ok((before - state.locks.len()) as u64)
    }

    async fn current_lock(&self, resource_key: &str) -> EngineResult<Option<ResourceLock>> {
        Ok(self.find_lock(resource_key).await)
    }
}

#[async_trait]
impl BatchStore for MemoryStore {
    async fn create_batch(
        &self,
        input: &CreateBatch,
        details: &[CreateBatchDetail],
    ) -> EngineResult<(MigrationBatch, Vec<BatchDetail>)> {
        let mut state = self.state.lock().await;
        let now = state.now();
        let batch = MigrationBatch {
            id: state.next_id(),
            requested_scope: input.requested_scope.to_string(),
            status_id: BatchStatus::Pending.id(),
            dry_run: input.dry_run,
            total_targets: details.len() as i32,
            completed_targets: 0,
            failed_targets: 0,
            skipped_targets: 0,
            initiated_by: input.initiated_by.clone(),
            metadata: input
                .metadata
                .clone()
                .unwrap_or_else(|| serde_json::json!({})),
            error_summary: None,
            started_at: None,
            completed_at: None,
            created_at: now,
            updated_at: now,
        };
        state.batches.push(batch.clone());

        let mut rows = Vec::with_capacity(details.len());
        for input in details {
            let row = BatchDetail {
                id: state.next_id(),
                batch_id: batch.id,
                target_id: input.target_id.clone(),
                scope: input.scope.clone(),
                region: input.region.clone(),
                wave_index: input.wave_index,
                status_id: DetailStatus::Pending.id(),
                previous_version: input.previous_version,
                target_version: input.target_version,
                attempt_count: 0,
                duration_ms: None,
                error_message: None,
                started_at: None,
                completed_at: None,
                created_at: now,
                updated_at: now,
            };
            state.details.push(row.clone());
            rows.push(row);
        }
        Ok((batch, rows))
    }

    async fn find_batch(&self, id: DbId) -> EngineResult<Option<MigrationBatch>> {
        let state = self.state.lock().await;
        Ok(state.batches.iter().find(|b| b.id == id).cloned())
    }

    async fn list_batches(&self, query: &BatchListQuery) -> EngineResult<Vec<MigrationBatch>> {
        let state = self.state.lock().await;
        let limit = query.limit.unwrap_or(50).clamp(1, 100) as usize;
        let offset = query.offset.unwrap_or(0).max(0) as usize;
        Ok(state
            .batches
            .iter()
            .rev()
            .filter(|b| query.status_id.is_none_or(|s| b.status_id == s))
            .filter(|b| {
                query
                    .initiated_by
                    .as_ref()
                    .is_none_or(|by| &b.initiated_by == by)
            })
            .skip(offset)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn transition_batch(&self, id: DbId, from: &[BatchStatus], to: BatchStatus) -> EngineResult<bool> {
        let mut state = self.state.lock().await;
        let now = state.now();
        let Some(batch) = state.batch_mut(id) else {
            return Ok(false);
        };
        if !from.contains(&batch.status()) {
            return Ok(false);
        }
        batch.status_id = to.id();
        if to == BatchStatus::Running && batch.started_at.is_none() {
            batch.started_at = Some(now);
        }
        batch.updated_at = now;
        Ok(true)
    }

    async fn finish_batch(&self, id: DbId, status: BatchStatus, summary: Option<&str>) -> EngineResult<bool> {
        let mut state = self.state.lock().await;
        let now = state.now();
        let Some(batch) = state.batch_mut(id) else {
            return Ok(false);
        };
        if !status.is_terminal() || !batch.status().can_transition(status) {
            return Ok(false);
        }
        batch.status_id = status.id();
        batch.error_summary = summary.map(str::to_string);
        batch.completed_at = Some(now);
        batch.updated_at = now;
        Ok(true)
    }

    async fn cancel_batch(&self, id: DbId) -> EngineResult<bool> {
        let mut state = self.state.lock().await;
        let now = state.now();
        let Some(batch) = state.batch_mut(id) else {
            return Ok(false);
        };
        if batch.status().is_terminal() {
            return Ok(false);
        }
        batch.status_id = BatchStatus::Cancelled.id();
        batch.completed_at = Some(now);
        batch.updated_at = now;
        Ok(true)
    }

    async fn merge_metadata(&self, id: DbId, patch: &serde_json::Value) -> EngineResult<()> {
        let mut state = self.state.lock().await;
        let now = state.now();
        if let Some(batch) = state.batch_mut(id) {
            if let (Some(target), Some(source)) = (batch.metadata.as_object_mut(), patch.as_object()) {
                for (key, value) in source {
                    target.insert(key.clone(), value.clone());
                }
            }
            batch.updated_at = now;
        }
        Ok(())
    }

    async fn list_details(&self, batch_id: DbId) -> EngineResult<Vec<BatchDetail>> {
        let state = self.state.lock().await;
        let mut rows: Vec<BatchDetail> = state
            .details
            .iter()
            .filter(|d| d.batch_id == batch_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| (a.wave_index, &a.target_id).cmp(&(b.wave_index, &b.target_id)));
        Ok(rows)
    }

    async fn mark_detail_running(&self, detail_id: DbId) -> EngineResult<bool> {
        let mut state = self.state.lock().await;
        let now = state.now();
        match state.detail_mut(detail_id) {
            Some(detail) if detail.status() == DetailStatus::Pending => {
                detail.status_id = DetailStatus::Running.id();
                detail.started_at = Some(now);
                detail.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn record_attempt(&self, detail_id: DbId, attempt: i32) -> EngineResult<()> {
        let mut state = self.state.lock().await;
        let now = state.now();
        if let Some(detail) = state.detail_mut(detail_id) {
            if detail.status() == DetailStatus::Running {
                detail.attempt_count = detail.attempt_count.max(attempt);
                detail.updated_at = now;
            }
        }
        Ok(())
    }

    async fn finish_detail(&self, batch_id: DbId, detail_id: DbId, outcome: &FinishDetail) -> EngineResult<bool> {
        let mut state = self.state.lock().await;
        let now = state.now();
        let Some(detail) = state.detail_mut(detail_id) else {
            return Ok(false);
        };
        if !detail.status().can_transition(outcome.status) {
            return Ok(false);
        }
        detail.status_id = outcome.status.id();
        if outcome.applied_version.is_some() {
            detail.target_version = outcome.applied_version;
        }
        detail.duration_ms = outcome.duration_ms;
        detail.error_message = outcome.error_message.clone();
        detail.completed_at = Some(now);
        detail.updated_at = now;

        if let Some(batch) = state.batch_mut(batch_id) {
            match outcome.status {
                DetailStatus::Completed => batch.completed_targets += 1,
                DetailStatus::Failed => batch.failed_targets += 1,
                DetailStatus::Skipped => batch.skipped_targets += 1,
                DetailStatus::Pending | DetailStatus::Running => {}
            }
            batch.updated_at = now;
        }
        Ok(true)
    }
}

#[async_trait]
impl RollbackStore for MemoryStore {
    async fn create_rollback(&self, input: &CreateRollback) -> EngineResult<RollbackExecution> {
        let mut state = self.state.lock().await;
        let now = state.now();
        let row = RollbackExecution {
            id: state.next_id(),
            batch_id: input.batch_id,
            strategy: input.strategy.as_str().to_string(),
            status_id: RollbackStatus::Running.id(),
            dry_run: input.dry_run,
            initiated_by: input.initiated_by.clone(),
            error_message: None,
            started_at: Some(now),
            completed_at: None,
            created_at: now,
            updated_at: now,
        };
        state.rollbacks.push(row.clone());
        Ok(row)
    }

    async fn finish_rollback(
        &self,
        id: DbId,
        status: RollbackStatus,
        error: Option<&str>,
    ) -> EngineResult<Option<RollbackExecution>> {
        let mut state = self.state.lock().await;
        let now = state.now();
        let Some(row) = state
            .rollbacks
            .iter_mut()
            .find(|r| r.id == id && r.status() == RollbackStatus::Running)
        else {
            return Ok(None);
        };
        row.status_id = status.id();
        row.error_message = error.map(str::to_string);
        row.completed_at = Some(now);
        row.updated_at = now;
        Ok(Some(row.clone()))
    }

    async fn list_rollbacks(&self, batch_id: DbId) -> EngineResult<Vec<RollbackExecution>> {
        let state = self.state.lock().await;
        Ok(state
            .rollbacks
            .iter()
            .rev()
            .filter(|r| r.batch_id == batch_id)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use strata_core::scope::ScopeRequest;

    use super::*;

    fn create_input() -> CreateBatch {
        CreateBatch {
            requested_scope: ScopeRequest::All,
            dry_run: false,
            initiated_by: "ops".into(),
            metadata: None,
        }
    }

    fn detail(target: &str) -> CreateBatchDetail {
        CreateBatchDetail {
            target_id: target.into(),
            scope: "tenant".into(),
            region: Some("eu".into()),
            wave_index: 0,
            previous_version: Some(1),
            target_version: Some(2),
        }
    }

    #[tokio::test]
    async fn expired_lock_taken_over_live_lock_contended() {
        let store = MemoryStore::new();
        let ttl = Duration::from_secs(60);
        assert!(store.try_acquire("tenant:t1", "a", "migration", ttl).await.unwrap());
        assert!(!store.try_acquire("tenant:t1", "b", "migration", ttl).await.unwrap());
        assert!(store.try_acquire("tenant:t1", "a", "migration", ttl).await.unwrap());

        store.advance_clock(chrono::Duration::seconds(61)).await;
        assert!(store.try_acquire("tenant:t1", "b", "migration", ttl).await.unwrap());
        assert_eq!(store.find_lock("tenant:t1").await.unwrap().holder_id, "b");
    }

    #[tokio::test]
    async fn release_requires_holder() {
        let store = MemoryStore::new();
        let ttl = Duration::from_secs(60);
        store.try_acquire("k", "a", "migration", ttl).await.unwrap();
        assert!(!store.release("k", "b").await.unwrap());
        assert!(store.release("k", "a").await.unwrap());
        assert!(store.find_lock("k").await.is_none());
    }

    #[tokio::test]
    async fn reap_removes_only_expired() {
        let store = MemoryStore::new();
        store.try_acquire("short", "a", "migration", Duration::from_secs(1)).await.unwrap();
        store.try_acquire("long", "a", "migration", Duration::from_secs(600)).await.unwrap();
        store.advance_clock(chrono::Duration::seconds(2)).await;
        assert_eq!(store.reap_expired().await.unwrap(), 1);
        assert!(store.find_lock("long").await.is_some());
    }

    #[tokio::test]
    async fn detail_finish_is_monotonic_and_counts_once() {
        let store = MemoryStore::new();
        let (batch, details) = store
            .create_batch(&create_input(), &[detail("t1"), detail("t2")])
            .await
            .unwrap();
        assert_eq!(batch.total_targets, 2);

        let done = FinishDetail {
            status: DetailStatus::Skipped,
            applied_version: None,
            duration_ms: None,
            error_message: Some("busy".into()),
        };
        assert!(store.finish_detail(batch.id, details[0].id, &done).await.unwrap());
        assert!(!store.finish_detail(batch.id, details[0].id, &done).await.unwrap());

        let batch = store.find_batch(batch.id).await.unwrap().unwrap();
        assert_eq!(batch.skipped_targets, 1);
        assert!(batch.counts().is_consistent());
    }

    #[tokio::test]
    async fn terminal_batch_cannot_be_cancelled_or_refinished() {
        let store = MemoryStore::new();
        let (batch, _) = store.create_batch(&create_input(), &[]).await.unwrap();
        assert!(!store.finish_batch(batch.id, BatchStatus::Completed, None).await.unwrap());
        assert!(store
            .transition_batch(batch.id, &[BatchStatus::Pending], BatchStatus::Running)
            .await
            .unwrap());
        assert!(store.finish_batch(batch.id, BatchStatus::Completed, None).await.unwrap());
        assert!(!store.cancel_batch(batch.id).await.unwrap());
        assert!(!store.finish_batch(batch.id, BatchStatus::Failed, Some("late")).await.unwrap());
    }

    /// A paused batch only leaves pause through resume or cancel.
    #[tokio::test]
    async fn paused_batch_cannot_be_finished() {
        let store = MemoryStore::new();
        let (batch, _) = store.create_batch(&create_input(), &[detail("t1")]).await.unwrap();
        store
            .transition_batch(batch.id, &[BatchStatus::Pending], BatchStatus::Running)
            .await
            .unwrap();
        store
            .transition_batch(batch.id, &[BatchStatus::Running], BatchStatus::Paused)
            .await
            .unwrap();

        assert!(!store.finish_batch(batch.id, BatchStatus::Completed, None).await.unwrap());
        assert!(!store.finish_batch(batch.id, BatchStatus::Failed, Some("x")).await.unwrap());
        assert!(!store.finish_batch(batch.id, BatchStatus::Paused, None).await.unwrap());
        let batch = store.find_batch(batch.id).await.unwrap().unwrap();
        assert_eq!(batch.status(), BatchStatus::Paused);
        assert!(batch.completed_at.is_none());

        assert!(store.cancel_batch(batch.id).await.unwrap());
    }

    #[tokio::test]
    async fn current_lock_reports_holder() {
        let store = MemoryStore::new();
        assert!(store.current_lock("k").await.unwrap().is_none());
        store.try_acquire("k", "a", "rollback", Duration::from_secs(5)).await.unwrap();
        let lock = store.current_lock("k").await.unwrap().unwrap();
        assert_eq!(lock.holder_id, "a");
        assert_eq!(lock.purpose, "rollback");
    }

    #[tokio::test]
    async fn metadata_merge_keeps_existing_keys() {
        let store = MemoryStore::new();
        let mut input = create_input();
        input.metadata = Some(serde_json::json!({"ticket": "OPS-7"}));
        let (batch, _) = store.create_batch(&input, &[]).await.unwrap();
        store
            .merge_metadata(batch.id, &serde_json::json!({"rolled_back": true}))
            .await
            .unwrap();
        let batch = store.find_batch(batch.id).await.unwrap().unwrap();
        assert_eq!(batch.metadata["ticket"], "OPS-7");
        assert_eq!(batch.metadata["rolled_back"], true);
    }
}
