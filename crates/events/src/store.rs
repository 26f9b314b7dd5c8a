//! Storage seam for the event queue.
//!
//! [`PgEventStore`] delegates to [`EventRepo`] and is what the worker runs
//! on. [`MemoryEventStore`] keeps the same claim and transition rules in a
//! mutex-guarded vector for single-process use and tests.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use strata_core::migration_event::EventPriority;
use strata_core::types::{DbId, Timestamp};
use strata_db::models::event::MigrationEvent;
use strata_db::models::status::EventStatus;
use strata_db::repositories::EventRepo;
use strata_db::DbPool;
use tokio::sync::Mutex;

use crate::queue::QueueError;

/// A fully resolved insert: lane, budget and due time already decided.
#[derive(Debug, Clone)]
pub struct EventInsert {
    pub event_type: &'static str,
    pub priority: EventPriority,
    pub payload: serde_json::Value,
    pub max_retries: i32,
    pub scheduled_at: Option<Timestamp>,
}

/// Outcome of one stale-claim sweep.
#[derive(Debug, Clone, Default)]
pub struct Reclaimed {
    /// Back in the retrying lane with the expired claim counted as an attempt.
    pub requeued: u64,
    /// Expired claim used up the last attempt; now failed.
    pub dead_lettered: Vec<MigrationEvent>,
}

impl Reclaimed {
    pub fn is_empty(&self) -> bool {
        self.requeued == 0 && self.dead_lettered.is_empty()
    }
}

#[async_trait]
pub trait EventStore: Send + Sync {
    async fn insert(&self, event: EventInsert) -> Result<MigrationEvent, QueueError>;

    /// Claim the first due event, by lane rank then insertion order, and
    /// mark it processing. `lane` restricts the claim to one lane.
    async fn claim_next(&self, lane: Option<EventPriority>) -> Result<Option<MigrationEvent>, QueueError>;

    async fn mark_completed(&self, id: DbId, batch_id: Option<DbId>) -> Result<bool, QueueError>;

    /// Processing → retrying, one more retry counted, due after `delay`.
    async fn schedule_retry(
        &self,
        id: DbId,
        delay: Duration,
        error: &str,
    ) -> Result<Option<MigrationEvent>, QueueError>;

    /// Processing → failed (terminal).
    async fn mark_failed(&self, id: DbId, error: &str) -> Result<bool, QueueError>;

    /// Refresh the claim time of a processing event. `false` once it left
    /// processing.
    async fn renew_claim(&self, id: DbId) -> Result<bool, QueueError>;

    /// Settle processing events claimed before `claimed_before`, counting
    /// the expired claim as one attempt.
    async fn reclaim_stale(&self, claimed_before: Timestamp, error: &str) -> Result<Reclaimed, QueueError>;

    /// Delete terminal events completed before `cutoff`.
    async fn purge_terminal(&self, cutoff: Timestamp) -> Result<u64, QueueError>;

    async fn find(&self, id: DbId) -> Result<Option<MigrationEvent>, QueueError>;
}

// ---------------------------------------------------------------------------
// Postgres
// ---------------------------------------------------------------------------

pub struct PgEventStore {
    pool: DbPool,
}

impl PgEventStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl EventStore for PgEventStore {
    async fn insert(&self, event: EventInsert) -> Result<MigrationEvent, QueueError> {
        let row = EventRepo::insert(
            &self.pool,
            event.event_type,
            event.priority.rank(),
            &event.payload,
            event.max_retries,
            event.scheduled_at,
        )
        .await?;
        Ok(row)
    }

    async fn claim_next(&self, lane: Option<EventPriority>) -> Result<Option<MigrationEvent>, QueueError> {
        Ok(EventRepo::claim_next(&self.pool, lane.map(EventPriority::rank)).await?)
    }

    async fn mark_completed(&self, id: DbId, batch_id: Option<DbId>) -> Result<bool, QueueError> {
        Ok(EventRepo::mark_completed(&self.pool, id, batch_id).await?)
    }

    async fn schedule_retry(
        &self,
        id: DbId,
        delay: Duration,
        error: &str,
    ) -> Result<Option<MigrationEvent>, QueueError> {
        Ok(EventRepo::schedule_retry(&self.pool, id, delay.as_millis() as i64, error).await?)
    }

    async fn mark_failed(&self, id: DbId, error: &str) -> Result<bool, QueueError> {
        Ok(EventRepo::mark_failed(&self.pool, id, error).await?)
    }

    async fn renew_claim(&self, id: DbId) -> Result<bool, QueueError> {
        Ok(EventRepo::renew_claim(&self.pool, id).await?)
    }

    async fn reclaim_stale(&self, claimed_before: Timestamp, error: &str) -> Result<Reclaimed, QueueError> {
        let (requeued, dead_lettered) = EventRepo::reclaim_stale(&self.pool, claimed_before, error).await?;
        Ok(Reclaimed {
            requeued,
            dead_lettered,
        })
    }

    async fn purge_terminal(&self, cutoff: Timestamp) -> Result<u64, QueueError> {
        Ok(EventRepo::purge_terminal(&self.pool, cutoff).await?)
    }

    async fn find(&self, id: DbId) -> Result<Option<MigrationEvent>, QueueError> {
        Ok(EventRepo::find_by_id(&self.pool, id).await?)
    }
}

// ---------------------------------------------------------------------------
// In-memory
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MemoryState {
    next_id: DbId,
    events: Vec<MigrationEvent>,
}

#[derive(Default)]
pub struct MemoryEventStore {
    state: Mutex<MemoryState>,
}

impl MemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every stored event, in insertion order.
    pub async fn all(&self) -> Vec<MigrationEvent> {
        self.state.lock().await.events.clone()
    }
}

fn with_status(event: &mut MigrationEvent, status: EventStatus, now: Timestamp) {
    event.status_id = status.id();
    event.updated_at = now;
}

fn to_chrono(delay: Duration) -> chrono::Duration {
    chrono::Duration::milliseconds(delay.as_millis().min(i64::MAX as u128) as i64)
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn insert(&self, event: EventInsert) -> Result<MigrationEvent, QueueError> {
        let now = Utc::now();
        let mut state = self.state.lock().await;
        state.next_id += 1;
        let row = MigrationEvent {
            id: state.next_id,
            event_type: event.event_type.to_string(),
            priority: event.priority.rank(),
            status_id: EventStatus::Pending.id(),
            payload: event.payload,
            retry_count: 0,
            max_retries: event.max_retries,
            scheduled_at: event.scheduled_at.unwrap_or(now),
            claimed_at: None,
            last_error: None,
            batch_id: None,
            completed_at: None,
            created_at: now,
            updated_at: now,
        };
        state.events.push(row.clone());
        Ok(row)
    }

    async fn claim_next(&self, lane: Option<EventPriority>) -> Result<Option<MigrationEvent>, QueueError> {
        let now = Utc::now();
        let mut state = self.state.lock().await;
        let next = state
            .events
            .iter_mut()
            .filter(|e| e.status().is_claimable() && e.scheduled_at <= now)
            .filter(|e| lane.is_none_or(|l| e.priority == l.rank()))
            .min_by_key(|e| (e.priority, e.created_at, e.id));

        Ok(next.map(|event| {
            with_status(event, EventStatus::Processing, now);
            event.claimed_at = Some(now);
            event.clone()
        }))
    }

    async fn mark_completed(&self, id: DbId, batch_id: Option<DbId>) -> Result<bool, QueueError> {
        let now = Utc::now();
        let mut state = self.state.lock().await;
        let Some(event) = state
            .events
            .iter_mut()
            .find(|e| e.id == id && e.status() == EventStatus::Processing)
        else {
            return Ok(false);
        };
        with_status(event, EventStatus::Completed, now);
        event.batch_id = batch_id.or(event.batch_id);
        event.completed_at = Some(now);
        Ok(true)
    }

    async fn schedule_retry(
        &self,
        id: DbId,
        delay: Duration,
        error: &str,
    ) -> Result<Option<MigrationEvent>, QueueError> {
        let now = Utc::now();
        let mut state = self.state.lock().await;
        let Some(event) = state
            .events
            .iter_mut()
            .find(|e| e.id == id && e.status() == EventStatus::Processing)
        else {
            return Ok(None);
        };
        with_status(event, EventStatus::Retrying, now);
        event.retry_count += 1;
        event.last_error = Some(error.to_string());
        event.claimed_at = None;
        event.scheduled_at = now + to_chrono(delay);
        Ok(Some(event.clone()))
    }

    async fn mark_failed(&self, id: DbId, error: &str) -> Result<bool, QueueError> {
        let now = Utc::now();
        let mut state = self.state.lock().await;
        let Some(event) = state
            .events
            .iter_mut()
            .find(|e| e.id == id && e.status() == EventStatus::Processing)
        else {
            return Ok(false);
        };
        with_status(event, EventStatus::Failed, now);
        event.last_error = Some(error.to_string());
        event.completed_at = Some(now);
        Ok(true)
    }

    async fn renew_claim(&self, id: DbId) -> Result<bool, QueueError> {
        let now = Utc::now();
        let mut state = self.state.lock().await;
        match state
            .events
            .iter_mut()
            .find(|e| e.id == id && e.status() == EventStatus::Processing)
        {
            Some(event) => {
                event.claimed_at = Some(now);
                event.updated_at = now;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn reclaim_stale(&self, claimed_before: Timestamp, error: &str) -> Result<Reclaimed, QueueError> {
        let now = Utc::now();
        let mut state = self.state.lock().await;
        let mut reclaimed = Reclaimed::default();
        for event in state.events.iter_mut().filter(|e| {
            e.status() == EventStatus::Processing && e.claimed_at.is_some_and(|at| at < claimed_before)
        }) {
            event.last_error = Some(error.to_string());
            if event.has_retry_budget() {
                with_status(event, EventStatus::Retrying, now);
                event.retry_count += 1;
                event.claimed_at = None;
                event.scheduled_at = now;
                reclaimed.requeued += 1;
            } else {
                with_status(event, EventStatus::Failed, now);
                event.completed_at = Some(now);
                reclaimed.dead_lettered.push(event.clone());
            }
        }
        Ok(reclaimed)
    }

    async fn purge_terminal(&self, cutoff: Timestamp) -> Result<u64, QueueError> {
        let mut state = self.state.lock().await;
        let before = state.events.len();
        state.events.retain(|e| {
            !(e.status().is_terminal() && e.completed_at.is_some_and(|at| at < cutoff))
        });
        Ok((before - state.events.len()) as u64)
    }

    async fn find(&self, id: DbId) -> Result<Option<MigrationEvent>, QueueError> {
        let state = self.state.lock().await;
        Ok(state.events.iter().find(|e| e.id == id).cloned())
    }
}
