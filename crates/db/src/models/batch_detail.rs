//! Per-target batch detail models.

use serde::Serialize;
use sqlx::FromRow;
use strata_core::types::{DbId, SchemaVersion, Timestamp};

use super::status::{DetailStatus, StatusId};

/// A row from the `migration_batch_details` table.
#[derive(Debug, Clone, PartialEq, FromRow, Serialize)]
pub struct BatchDetail {
    pub id: DbId,
    pub batch_id: DbId,
    pub target_id: String,
    pub scope: String,
    pub region: Option<String>,
    pub wave_index: i32,
    pub status_id: StatusId,
    pub previous_version: Option<SchemaVersion>,
    pub target_version: Option<SchemaVersion>,
    pub attempt_count: i32,
    pub duration_ms: Option<i64>,
    pub error_message: Option<String>,
    pub started_at: Option<Timestamp>,
    pub completed_at: Option<Timestamp>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl BatchDetail {
    pub fn status(&self) -> DetailStatus {
        DetailStatus::from_id(self.status_id).unwrap_or(DetailStatus::Failed)
    }
}

/// Input for one detail row, created when the plan is materialised.
#[derive(Debug, Clone)]
pub struct CreateBatchDetail {
    pub target_id: String,
    pub scope: String,
    pub region: Option<String>,
    pub wave_index: i32,
    pub previous_version: Option<SchemaVersion>,
    pub target_version: Option<SchemaVersion>,
}

/// Terminal outcome written when a target finishes.
#[derive(Debug, Clone)]
pub struct FinishDetail {
    pub status: DetailStatus,
    /// Version actually reached, when it differs from the planned one.
    pub applied_version: Option<SchemaVersion>,
    pub duration_ms: Option<i64>,
    pub error_message: Option<String>,
}
