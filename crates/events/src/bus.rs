//! In-process event bus backed by a `tokio::sync::broadcast` channel.
//!
//! [`EventBus`] fans out [`EngineNotice`]s (batch lifecycle, rollback
//! outcomes, dead-lettered events) to any number of subscribers. It is
//! shared via `Arc<EventBus>`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strata_core::types::DbId;
use tokio::sync::broadcast;

// ---------------------------------------------------------------------------
// Notice types
// ---------------------------------------------------------------------------

pub const NOTICE_BATCH_STARTED: &str = "batch.started";
pub const NOTICE_BATCH_COMPLETED: &str = "batch.completed";
pub const NOTICE_BATCH_FAILED: &str = "batch.failed";
pub const NOTICE_BATCH_CANCELLED: &str = "batch.cancelled";
pub const NOTICE_ROLLBACK_COMPLETED: &str = "rollback.completed";
pub const NOTICE_ROLLBACK_FAILED: &str = "rollback.failed";
pub const NOTICE_EVENT_DEAD_LETTERED: &str = "event.dead_lettered";

/// Notices that need an operator to look at something.
pub fn requires_attention(notice_type: &str) -> bool {
    matches!(
        notice_type,
        NOTICE_BATCH_FAILED | NOTICE_ROLLBACK_FAILED | NOTICE_EVENT_DEAD_LETTERED
    )
}

// ---------------------------------------------------------------------------
// EngineNotice
// ---------------------------------------------------------------------------

/// Something the engine did that other components may care about.
///
/// Built with [`EngineNotice::new`] and the `with_*` builder methods.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineNotice {
    /// Dot-separated notice name, e.g. `"batch.completed"`.
    pub notice_type: String,

    pub batch_id: Option<DbId>,

    /// Queue event id, for `event.*` notices.
    pub event_id: Option<DbId>,

    /// Free-form JSON payload carrying notice-specific data.
    pub payload: serde_json::Value,

    pub timestamp: DateTime<Utc>,
}

impl EngineNotice {
    pub fn new(notice_type: impl Into<String>) -> Self {
        Self {
            notice_type: notice_type.into(),
            batch_id: None,
            event_id: None,
            payload: serde_json::Value::Object(Default::default()),
            timestamp: Utc::now(),
        }
    }

    pub fn with_batch(mut self, batch_id: DbId) -> Self {
        self.batch_id = Some(batch_id);
        self
    }

    pub fn with_event(mut self, event_id: DbId) -> Self {
        self.event_id = Some(event_id);
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }
}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

/// Default buffer capacity for the broadcast channel.
const DEFAULT_CAPACITY: usize = 1024;

/// In-process fan-out bus. Every subscriber independently receives every
/// notice published after it subscribed.
pub struct EventBus {
    sender: broadcast::Sender<EngineNotice>,
}

impl EventBus {
    /// Create a bus with a specific channel capacity. Slow receivers that
    /// fall behind observe `RecvError::Lagged`.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish to all current subscribers. Dropped silently when nobody
    /// is listening.
    pub fn publish(&self, notice: EngineNotice) {
        let _ = self.sender.send(notice);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineNotice> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscriber_receives_enriched_notice() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();

        bus.publish(
            EngineNotice::new(NOTICE_BATCH_COMPLETED)
                .with_batch(42)
                .with_payload(serde_json::json!({"completed": 3})),
        );

        let received = rx.recv().await.expect("should receive the notice");
        assert_eq!(received.notice_type, NOTICE_BATCH_COMPLETED);
        assert_eq!(received.batch_id, Some(42));
        assert!(received.event_id.is_none());
        assert_eq!(received.payload["completed"], 3);
    }

    #[tokio::test]
    async fn every_subscriber_sees_each_notice() {
        let bus = EventBus::default();
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        bus.publish(EngineNotice::new(NOTICE_EVENT_DEAD_LETTERED).with_event(9));

        assert_eq!(rx1.recv().await.unwrap().event_id, Some(9));
        assert_eq!(rx2.recv().await.unwrap().event_id, Some(9));
    }

    #[test]
    fn publish_without_subscribers_is_fine() {
        EventBus::default().publish(EngineNotice::new(NOTICE_BATCH_STARTED));
    }

    #[test]
    fn attention_notices() {
        assert!(requires_attention(NOTICE_BATCH_FAILED));
        assert!(requires_attention(NOTICE_EVENT_DEAD_LETTERED));
        assert!(!requires_attention(NOTICE_BATCH_COMPLETED));
    }
}
