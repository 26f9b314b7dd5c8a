//! Queued migration event models.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use strata_core::migration_event::{EventPayload, EventPriority};
use strata_core::types::{DbId, Timestamp};

use super::status::{EventStatus, StatusId};

/// A row from the `migration_events` table.
#[derive(Debug, Clone, PartialEq, FromRow, Serialize)]
pub struct MigrationEvent {
    pub id: DbId,
    pub event_type: String,
    /// Lane rank, see [`EventPriority::rank`].
    pub priority: i16,
    pub status_id: StatusId,
    pub payload: serde_json::Value,
    pub retry_count: i32,
    pub max_retries: i32,
    pub scheduled_at: Timestamp,
    pub claimed_at: Option<Timestamp>,
    pub last_error: Option<String>,
    pub batch_id: Option<DbId>,
    pub completed_at: Option<Timestamp>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl MigrationEvent {
    pub fn status(&self) -> EventStatus {
        EventStatus::from_id(self.status_id).unwrap_or(EventStatus::Failed)
    }

    pub fn priority(&self) -> EventPriority {
        EventPriority::from_rank(self.priority).unwrap_or(EventPriority::Normal)
    }

    /// Decode the typed payload.
    pub fn decode_payload(&self) -> Result<EventPayload, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }

    pub fn has_retry_budget(&self) -> bool {
        self.retry_count < self.max_retries
    }
}

/// Input for enqueueing an event.
#[derive(Debug, Clone, Deserialize)]
pub struct NewEvent {
    pub payload: EventPayload,
    /// Defaults to the payload's lane.
    pub priority: Option<EventPriority>,
    pub max_retries: Option<i32>,
    /// Earliest dequeue time. Defaults to the payload's own deferral, or now.
    pub scheduled_at: Option<Timestamp>,
}

impl NewEvent {
    pub fn new(payload: EventPayload) -> Self {
        Self {
            payload,
            priority: None,
            max_retries: None,
            scheduled_at: None,
        }
    }

    pub fn with_priority(mut self, priority: EventPriority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_max_retries(mut self, max_retries: i32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn lane(&self) -> EventPriority {
        self.priority.unwrap_or_else(|| self.payload.default_priority())
    }

    pub fn not_before(&self) -> Option<Timestamp> {
        self.scheduled_at.or_else(|| self.payload.not_before())
    }
}
