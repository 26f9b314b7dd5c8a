//! Live per-batch progress with subscriber callbacks.
//!
//! A best-effort cache fed by the orchestrator on every detail
//! transition. Persisted batch and detail rows stay the source of truth;
//! [`ProgressTracker::rebuild`] recreates a snapshot from them after a
//! restart or when a batch is driven by another instance. Rebuilt
//! snapshots are never cached: only the driving instance keeps entries.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use strata_core::progress::{ProgressSnapshot, ThroughputEstimator};
use strata_core::status::{BatchStatus, DetailStatus};
use strata_core::types::DbId;
use strata_db::models::batch::MigrationBatch;
use strata_db::models::batch_detail::BatchDetail;
use tokio::sync::Mutex;

pub type ProgressCallback = Arc<dyn Fn(&ProgressSnapshot) + Send + Sync>;

/// Handle returned by [`ProgressTracker::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Entry {
    snapshot: ProgressSnapshot,
    estimator: ThroughputEstimator,
}

#[derive(Default)]
pub struct ProgressTracker {
    entries: Mutex<HashMap<DbId, Entry>>,
    subscribers: Mutex<HashMap<DbId, Vec<(SubscriptionId, ProgressCallback)>>>,
    next_subscription: AtomicU64,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn subscribe(&self, batch_id: DbId, callback: ProgressCallback) -> SubscriptionId {
        let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::Relaxed));
        self.subscribers
            .lock()
            .await
            .entry(batch_id)
            .or_default()
            .push((id, callback));
        id
    }

    pub async fn unsubscribe(&self, batch_id: DbId, subscription: SubscriptionId) -> bool {
        let mut subscribers = self.subscribers.lock().await;
        let Some(list) = subscribers.get_mut(&batch_id) else {
            return false;
        };
        let before = list.len();
        list.retain(|(id, _)| *id != subscription);
        let removed = list.len() < before;
        if list.is_empty() {
            subscribers.remove(&batch_id);
        }
        removed
    }

    pub async fn snapshot(&self, batch_id: DbId) -> Option<ProgressSnapshot> {
        self.entries
            .lock()
            .await
            .get(&batch_id)
            .map(|e| e.snapshot.clone())
    }

    /// Start tracking a batch about to run.
    pub async fn start(&self, batch_id: DbId, total: usize, wave_count: usize) {
        let mut snapshot = ProgressSnapshot::new(batch_id, total, wave_count, Utc::now());
        snapshot.status = BatchStatus::Running;
        self.entries.lock().await.insert(
            batch_id,
            Entry {
                snapshot: snapshot.clone(),
                estimator: ThroughputEstimator::default(),
            },
        );
        self.notify(&snapshot).await;
    }

    pub async fn wave_started(&self, batch_id: DbId, wave_index: usize) {
        self.update(batch_id, |entry| entry.snapshot.wave_index = wave_index)
            .await;
    }

    pub async fn set_status(&self, batch_id: DbId, status: BatchStatus) {
        self.update(batch_id, |entry| entry.snapshot.status = status).await;
    }

    pub async fn target_started(&self, batch_id: DbId, target_id: &str) {
        self.update(batch_id, |entry| {
            entry.snapshot.in_flight.push(target_id.to_string());
        })
        .await;
    }

    /// A detail reached a terminal status. Durations of applied targets
    /// feed the completion estimate.
    pub async fn target_finished(
        &self,
        batch_id: DbId,
        target_id: &str,
        status: DetailStatus,
        duration_ms: Option<i64>,
    ) {
        self.update(batch_id, |entry| {
            entry.snapshot.in_flight.retain(|t| t != target_id);
            match status {
                DetailStatus::Completed => entry.snapshot.completed += 1,
                DetailStatus::Failed => entry.snapshot.failed += 1,
                DetailStatus::Skipped => entry.snapshot.skipped += 1,
                DetailStatus::Pending | DetailStatus::Running => {}
            }
            if let Some(ms) = duration_ms {
                entry.estimator.record(ms);
            }
        })
        .await;
    }

    /// Final update for a batch; its entry and subscribers are dropped.
    pub async fn finish(&self, batch_id: DbId, status: BatchStatus) {
        self.set_status(batch_id, status).await;
        self.entries.lock().await.remove(&batch_id);
        self.subscribers.lock().await.remove(&batch_id);
    }

    /// Recreate a snapshot from persisted rows.
    pub fn rebuild(batch: &MigrationBatch, details: &[BatchDetail]) -> ProgressSnapshot {
        let wave_count = details
            .iter()
            .map(|d| d.wave_index as usize + 1)
            .max()
            .unwrap_or(0);
        let mut snapshot = ProgressSnapshot::new(batch.id, batch.total_targets.max(0) as usize, wave_count, Utc::now());
        snapshot.status = batch.status();

        let mut estimator = ThroughputEstimator::default();
        for detail in details {
            match detail.status() {
                DetailStatus::Completed => snapshot.completed += 1,
                DetailStatus::Failed => snapshot.failed += 1,
                DetailStatus::Skipped => snapshot.skipped += 1,
                DetailStatus::Running => snapshot.in_flight.push(detail.target_id.clone()),
                DetailStatus::Pending => {}
            }
            if detail.status() != DetailStatus::Pending {
                snapshot.wave_index = snapshot.wave_index.max(detail.wave_index as usize);
            }
            if let (DetailStatus::Completed, Some(ms)) = (detail.status(), detail.duration_ms) {
                estimator.record(ms);
            }
        }
        refresh_estimate(&mut snapshot, &estimator);
        snapshot
    }

    async fn update<F>(&self, batch_id: DbId, apply: F)
    where
        F: FnOnce(&mut Entry),
    {
        let snapshot = {
            let mut entries = self.entries.lock().await;
            let Some(entry) = entries.get_mut(&batch_id) else {
                return;
            };
            apply(entry);
            let Entry { snapshot, estimator } = entry;
            snapshot.updated_at = Utc::now();
            refresh_estimate(snapshot, estimator);
            snapshot.clone()
        };
        self.notify(&snapshot).await;
    }

    async fn notify(&self, snapshot: &ProgressSnapshot) {
        let callbacks: Vec<ProgressCallback> = self
            .subscribers
            .lock()
            .await
            .get(&snapshot.batch_id)
            .map(|list| list.iter().map(|(_, cb)| Arc::clone(cb)).collect())
            .unwrap_or_default();
        for callback in callbacks {
            callback(snapshot);
        }
    }
}

fn refresh_estimate(snapshot: &mut ProgressSnapshot, estimator: &ThroughputEstimator) {
    snapshot.estimated_remaining_ms = estimator.estimate_remaining_ms(snapshot.remaining());
    snapshot.estimated_completion = snapshot
        .estimated_remaining_ms
        .map(|ms| snapshot.updated_at + chrono::Duration::milliseconds(ms));
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use super::*;

    fn collector() -> (ProgressCallback, Arc<StdMutex<Vec<ProgressSnapshot>>>) {
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let callback: ProgressCallback = Arc::new(move |s: &ProgressSnapshot| {
            sink.lock().unwrap().push(s.clone());
        });
        (callback, seen)
    }

    #[tokio::test]
    async fn callbacks_fire_on_each_transition() {
        let tracker = ProgressTracker::new();
        let (callback, seen) = collector();
        tracker.subscribe(1, callback).await;

        tracker.start(1, 2, 1).await;
        tracker.target_started(1, "a").await;
        tracker
            .target_finished(1, "a", DetailStatus::Completed, Some(100))
            .await;

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[1].in_flight, vec!["a".to_string()]);
        let last = seen.last().unwrap();
        assert!(last.in_flight.is_empty());
        assert_eq!(last.completed, 1);
        assert_eq!(last.estimated_remaining_ms, Some(100));
    }

    #[tokio::test]
    async fn unsubscribed_callback_stops_firing() {
        let tracker = ProgressTracker::new();
        let (callback, seen) = collector();
        let id = tracker.subscribe(1, callback).await;
        tracker.start(1, 1, 1).await;
        assert!(tracker.unsubscribe(1, id).await);
        assert!(!tracker.unsubscribe(1, id).await);
        tracker.target_started(1, "a").await;
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn finish_drops_entry() {
        let tracker = ProgressTracker::new();
        tracker.start(5, 1, 1).await;
        assert!(tracker.snapshot(5).await.is_some());
        tracker.finish(5, BatchStatus::Completed).await;
        assert!(tracker.snapshot(5).await.is_none());
    }
}
