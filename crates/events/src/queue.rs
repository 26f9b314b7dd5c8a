//! Durable priority queue of migration trigger events.
//!
//! Four lanes (critical, high, normal, low) drained in rank order, oldest
//! first within a lane. A failed event is pushed back into the delayed
//! lane with exponential backoff until its retry budget runs out, then
//! dead-lettered: marked failed and announced on the [`EventBus`].

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use strata_core::error::CoreError;
use strata_core::migration_event::{EventBackoff, EventPriority, DEFAULT_MAX_EVENT_RETRIES};
use strata_core::types::DbId;
use strata_db::models::event::{MigrationEvent, NewEvent};
use strata_db::models::status::EventStatus;

use crate::bus::{EngineNotice, EventBus, NOTICE_EVENT_DEAD_LETTERED};
use crate::store::{EventInsert, EventStore, Reclaimed};

/// Recorded on events whose consumer stopped renewing its claim.
pub const CLAIM_EXPIRED: &str = "Claim expired before the event was settled";

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Invalid event payload: {0}")]
    Payload(#[from] serde_json::Error),

    #[error(transparent)]
    Core(#[from] CoreError),
}

/// How handling a claimed event ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    Succeeded { batch_id: Option<DbId> },
    Failed { error: String },
}

pub struct EventQueue {
    store: Arc<dyn EventStore>,
    bus: Arc<EventBus>,
    backoff: EventBackoff,
    default_max_retries: i32,
}

impl EventQueue {
    pub fn new(store: Arc<dyn EventStore>, bus: Arc<EventBus>) -> Self {
        Self {
            store,
            bus,
            backoff: EventBackoff::default(),
            default_max_retries: DEFAULT_MAX_EVENT_RETRIES,
        }
    }

    pub fn with_backoff(mut self, backoff: EventBackoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_default_max_retries(mut self, max_retries: i32) -> Self {
        self.default_max_retries = max_retries;
        self
    }

    /// Persist a new event in its lane. Maintenance events are held back
    /// until their window opens.
    pub async fn enqueue(&self, event: NewEvent) -> Result<MigrationEvent, QueueError> {
        let max_retries = event.max_retries.unwrap_or(self.default_max_retries);
        if max_retries < 0 {
            return Err(CoreError::Validation(format!(
                "max_retries must be non-negative, got {max_retries}"
            ))
            .into());
        }

        let insert = EventInsert {
            event_type: event.payload.event_type(),
            priority: event.lane(),
            payload: serde_json::to_value(&event.payload)?,
            max_retries,
            scheduled_at: event.not_before(),
        };
        let row = self.store.insert(insert).await?;
        tracing::debug!(
            event_id = row.id,
            event_type = %row.event_type,
            priority = %row.priority(),
            scheduled_at = %row.scheduled_at,
            "Event enqueued"
        );
        Ok(row)
    }

    /// Claim the next due event. With `lane` set only that lane is
    /// considered; otherwise lanes are served in rank order.
    pub async fn dequeue(&self, lane: Option<EventPriority>) -> Result<Option<MigrationEvent>, QueueError> {
        let claimed = self.store.claim_next(lane).await?;
        if let Some(event) = &claimed {
            tracing::debug!(
                event_id = event.id,
                event_type = %event.event_type,
                retry_count = event.retry_count,
                "Event claimed"
            );
        }
        Ok(claimed)
    }

    /// Record the outcome of handling `event`. Returns the status the
    /// event ended up in. When the claim was lost meanwhile (reclaimed
    /// after it expired) nothing is written and the current status is
    /// returned.
    pub async fn complete(&self, event: &MigrationEvent, completion: Completion) -> Result<EventStatus, QueueError> {
        match completion {
            Completion::Succeeded { batch_id } => {
                if !self.store.mark_completed(event.id, batch_id).await? {
                    return self.lost_claim(event).await;
                }
                tracing::info!(event_id = event.id, batch_id, "Event completed");
                Ok(EventStatus::Completed)
            }
            Completion::Failed { error } if event.has_retry_budget() => {
                let delay = self.backoff.delay(event.retry_count + 1);
                if self.store.schedule_retry(event.id, delay, &error).await?.is_none() {
                    return self.lost_claim(event).await;
                }
                tracing::warn!(
                    event_id = event.id,
                    retry_count = event.retry_count + 1,
                    max_retries = event.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "Event handling failed, retry scheduled"
                );
                Ok(EventStatus::Retrying)
            }
            Completion::Failed { error } => {
                if !self.store.mark_failed(event.id, &error).await? {
                    return self.lost_claim(event).await;
                }
                tracing::error!(
                    event_id = event.id,
                    event_type = %event.event_type,
                    retry_count = event.retry_count,
                    error = %error,
                    "Event retry budget exhausted, dead-lettered"
                );
                self.bus.publish(
                    EngineNotice::new(NOTICE_EVENT_DEAD_LETTERED)
                        .with_event(event.id)
                        .with_payload(serde_json::json!({
                            "event_type": event.event_type,
                            "retry_count": event.retry_count,
                            "error": error,
                        })),
                );
                Ok(EventStatus::Failed)
            }
        }
    }

    async fn lost_claim(&self, event: &MigrationEvent) -> Result<EventStatus, QueueError> {
        let current = self
            .store
            .find(event.id)
            .await?
            .map(|e| e.status())
            .unwrap_or(EventStatus::Failed);
        tracing::warn!(event_id = event.id, status = %current, "Event claim lost before its outcome was recorded");
        Ok(current)
    }

    /// Keep the claim on `event` alive while it is being handled.
    pub async fn renew_claim(&self, event: &MigrationEvent) -> Result<bool, QueueError> {
        let renewed = self.store.renew_claim(event.id).await?;
        if !renewed {
            tracing::warn!(event_id = event.id, "Claim renewal refused, event no longer processing");
        }
        Ok(renewed)
    }

    /// Settle events whose claim was not renewed within `timeout`. Each
    /// expired claim uses one attempt; events out of attempts are
    /// dead-lettered like any other exhausted event.
    pub async fn reclaim_stale(&self, timeout: Duration) -> Result<Reclaimed, QueueError> {
        let cutoff = Utc::now() - chrono::Duration::milliseconds(timeout.as_millis() as i64);
        let reclaimed = self.store.reclaim_stale(cutoff, CLAIM_EXPIRED).await?;
        if reclaimed.requeued > 0 {
            tracing::warn!(requeued = reclaimed.requeued, "Reclaimed stale events");
        }
        for event in &reclaimed.dead_lettered {
            tracing::error!(
                event_id = event.id,
                event_type = %event.event_type,
                retry_count = event.retry_count,
                "Stale event out of attempts, dead-lettered"
            );
            self.bus.publish(
                EngineNotice::new(NOTICE_EVENT_DEAD_LETTERED)
                    .with_event(event.id)
                    .with_payload(serde_json::json!({
                        "event_type": event.event_type,
                        "retry_count": event.retry_count,
                        "error": CLAIM_EXPIRED,
                    })),
            );
        }
        Ok(reclaimed)
    }

    /// Delete completed and failed events older than `retention`.
    pub async fn purge_expired(&self, retention: Duration) -> Result<u64, QueueError> {
        let cutoff = Utc::now() - chrono::Duration::milliseconds(retention.as_millis() as i64);
        self.store.purge_terminal(cutoff).await
    }

    pub async fn find(&self, id: DbId) -> Result<Option<MigrationEvent>, QueueError> {
        self.store.find(id).await
    }
}
