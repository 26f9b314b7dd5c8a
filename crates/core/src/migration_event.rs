//! Domain events that trigger migrations, their priority lanes, and the
//! retry backoff applied when handling one fails.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::scope::ScopeRequest;
use crate::types::Timestamp;

// ---------------------------------------------------------------------------
// Event type names
// ---------------------------------------------------------------------------

pub const EVENT_TARGET_CREATED: &str = "target-created";
pub const EVENT_MAINTENANCE_SCHEDULED: &str = "maintenance-scheduled";
pub const EVENT_MANUAL_REQUEST: &str = "manual-request";

/// Default handling attempts before an event is dead-lettered.
pub const DEFAULT_MAX_EVENT_RETRIES: i32 = 5;

/// Events stuck in `processing` longer than this are presumed orphaned.
pub const DEFAULT_RECLAIM_AFTER: Duration = Duration::from_secs(15 * 60);

/// Terminal events are purged after this retention window.
pub const DEFAULT_EVENT_RETENTION: Duration = Duration::from_secs(7 * 24 * 3600);

// ---------------------------------------------------------------------------
// Priority lanes
// ---------------------------------------------------------------------------

/// Queue lane. Lower rank is served first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventPriority {
    Critical,
    High,
    Normal,
    Low,
}

impl EventPriority {
    /// Lanes in the order `dequeue` checks them.
    pub const LANES: [EventPriority; 4] = [
        EventPriority::Critical,
        EventPriority::High,
        EventPriority::Normal,
        EventPriority::Low,
    ];

    /// Stored in `migration_events.priority`; ascending order is service order.
    pub fn rank(self) -> i16 {
        match self {
            Self::Critical => 0,
            Self::High => 1,
            Self::Normal => 2,
            Self::Low => 3,
        }
    }

    pub fn from_rank(rank: i16) -> Option<Self> {
        Self::LANES.into_iter().find(|p| p.rank() == rank)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::High => "high",
            Self::Normal => "normal",
            Self::Low => "low",
        }
    }
}

impl fmt::Display for EventPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventPriority {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::LANES
            .into_iter()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| CoreError::Validation(format!("Unknown event priority: \"{s}\"")))
    }
}

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

/// Closed set of event payloads, one variant per event type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum EventPayload {
    /// A database or tenant schema was provisioned and needs its schema.
    TargetCreated { target_id: String },
    /// A maintenance window opens for `scope` at `scheduled_for`.
    MaintenanceScheduled {
        scope: ScopeRequest,
        scheduled_for: Option<Timestamp>,
    },
    /// An operator asked for a migration through a programmatic channel.
    ManualRequest {
        scope: ScopeRequest,
        #[serde(default)]
        dry_run: bool,
        requested_by: String,
    },
}

impl EventPayload {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::TargetCreated { .. } => EVENT_TARGET_CREATED,
            Self::MaintenanceScheduled { .. } => EVENT_MAINTENANCE_SCHEDULED,
            Self::ManualRequest { .. } => EVENT_MANUAL_REQUEST,
        }
    }

    /// Lane used when the submitter does not pick one.
    pub fn default_priority(&self) -> EventPriority {
        match self {
            Self::TargetCreated { .. } => EventPriority::High,
            Self::MaintenanceScheduled { .. } => EventPriority::Low,
            Self::ManualRequest { .. } => EventPriority::Normal,
        }
    }

    /// Earliest time the event may be dequeued, if deferred.
    pub fn not_before(&self) -> Option<Timestamp> {
        match self {
            Self::MaintenanceScheduled { scheduled_for, .. } => *scheduled_for,
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Backoff
// ---------------------------------------------------------------------------

/// Exponential backoff for failed event handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventBackoff {
    pub base: Duration,
    pub max: Duration,
}

impl Default for EventBackoff {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(5),
            max: Duration::from_secs(600),
        }
    }
}

impl EventBackoff {
    /// Delay before retry number `retry_count` (1-based): `base * 2^(n-1)`,
    /// capped at `max`. Non-decreasing in `retry_count`.
    pub fn delay(&self, retry_count: i32) -> Duration {
        let exponent = retry_count.saturating_sub(1).clamp(0, 31) as u32;
        self.base
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max)
            .min(self.max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scope::Scope;

    #[test]
    fn lanes_ordered_by_rank() {
        let ranks: Vec<i16> = EventPriority::LANES.iter().map(|p| p.rank()).collect();
        assert_eq!(ranks, [0, 1, 2, 3]);
        assert_eq!(EventPriority::from_rank(1), Some(EventPriority::High));
        assert_eq!(EventPriority::from_rank(7), None);
    }

    #[test]
    fn payload_serializes_with_type_tag() {
        let payload = EventPayload::TargetCreated {
            target_id: "tenant-9".into(),
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["type"], EVENT_TARGET_CREATED);
        assert_eq!(json["target_id"], "tenant-9");
        let back: EventPayload = serde_json::from_value(json).unwrap();
        assert_eq!(back, payload);
    }

    #[test]
    fn manual_request_dry_run_defaults_false() {
        let json = serde_json::json!({
            "type": "manual-request",
            "scope": { "kind": "scope", "value": "tenant" },
            "requested_by": "ops@example.com",
        });
        let payload: EventPayload = serde_json::from_value(json).unwrap();
        assert_eq!(
            payload,
            EventPayload::ManualRequest {
                scope: ScopeRequest::Scope(Scope::Tenant),
                dry_run: false,
                requested_by: "ops@example.com".into(),
            }
        );
    }

    #[test]
    fn backoff_non_decreasing_and_capped() {
        let backoff = EventBackoff {
            base: Duration::from_secs(2),
            max: Duration::from_secs(60),
        };
        let delays: Vec<Duration> = (1..=40).map(|n| backoff.delay(n)).collect();
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
        assert!(delays.iter().all(|d| *d <= backoff.max));
        assert_eq!(delays[0], Duration::from_secs(2));
        assert_eq!(delays[3], Duration::from_secs(16));
        assert_eq!(*delays.last().unwrap(), Duration::from_secs(60));
    }

    #[test]
    fn default_lanes_per_type() {
        let created = EventPayload::TargetCreated {
            target_id: "t".into(),
        };
        assert_eq!(created.default_priority(), EventPriority::High);
        assert_eq!(created.event_type(), "target-created");
        assert!(created.not_before().is_none());
    }
}
