//! Rollback execution models.

use serde::Serialize;
use sqlx::FromRow;
use strata_core::rollback::RollbackStrategyKind;
use strata_core::types::{DbId, Timestamp};

use super::status::{RollbackStatus, StatusId};

/// A row from the `rollback_executions` table.
#[derive(Debug, Clone, PartialEq, FromRow, Serialize)]
pub struct RollbackExecution {
    pub id: DbId,
    pub batch_id: DbId,
    pub strategy: String,
    pub status_id: StatusId,
    pub dry_run: bool,
    pub initiated_by: String,
    pub error_message: Option<String>,
    pub started_at: Option<Timestamp>,
    pub completed_at: Option<Timestamp>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl RollbackExecution {
    pub fn status(&self) -> RollbackStatus {
        RollbackStatus::from_id(self.status_id).unwrap_or(RollbackStatus::Failed)
    }
}

/// Input for recording a rollback that is about to run.
#[derive(Debug, Clone)]
pub struct CreateRollback {
    pub batch_id: DbId,
    pub strategy: RollbackStrategyKind,
    pub dry_run: bool,
    pub initiated_by: String,
}
