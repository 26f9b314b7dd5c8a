//! Migration batch models and DTOs.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use strata_core::batch::BatchCounts;
use strata_core::scope::ScopeRequest;
use strata_core::types::{DbId, Timestamp};
use validator::{Validate, ValidationError};

use super::status::{BatchStatus, StatusId};

/// Largest serialized metadata object accepted on a new batch.
pub const MAX_METADATA_BYTES: usize = 16 * 1024;

/// A row from the `migration_batches` table.
#[derive(Debug, Clone, PartialEq, FromRow, Serialize)]
pub struct MigrationBatch {
    pub id: DbId,
    pub requested_scope: String,
    pub status_id: StatusId,
    pub dry_run: bool,
    pub total_targets: i32,
    pub completed_targets: i32,
    pub failed_targets: i32,
    pub skipped_targets: i32,
    pub initiated_by: String,
    pub metadata: serde_json::Value,
    pub error_summary: Option<String>,
    pub started_at: Option<Timestamp>,
    pub completed_at: Option<Timestamp>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl MigrationBatch {
    /// Typed status. Unknown ids (never written by this crate) read as failed.
    pub fn status(&self) -> BatchStatus {
        BatchStatus::from_id(self.status_id).unwrap_or(BatchStatus::Failed)
    }

    pub fn counts(&self) -> BatchCounts {
        BatchCounts {
            total: self.total_targets,
            completed: self.completed_targets,
            failed: self.failed_targets,
            skipped: self.skipped_targets,
        }
    }

    pub fn scope_request(&self) -> Result<ScopeRequest, strata_core::error::CoreError> {
        self.requested_scope.parse()
    }
}

fn validate_metadata(value: &serde_json::Value) -> Result<(), ValidationError> {
    if !value.is_object() {
        return Err(ValidationError::new("metadata_not_object"));
    }
    if value.to_string().len() > MAX_METADATA_BYTES {
        return Err(ValidationError::new("metadata_too_large"));
    }
    Ok(())
}

/// Input for creating a batch.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct CreateBatch {
    pub requested_scope: ScopeRequest,
    #[serde(default)]
    pub dry_run: bool,
    #[validate(length(min = 1, max = 255))]
    pub initiated_by: String,
    #[validate(custom(function = "validate_metadata"))]
    pub metadata: Option<serde_json::Value>,
}

/// Filter for listing batches.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BatchListQuery {
    pub status_id: Option<StatusId>,
    pub initiated_by: Option<String>,
    /// Maximum number of results. Defaults to 50, capped at 100.
    pub limit: Option<i64>,
    /// Number of results to skip. Defaults to 0.
    pub offset: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(initiated_by: &str, metadata: Option<serde_json::Value>) -> CreateBatch {
        CreateBatch {
            requested_scope: ScopeRequest::All,
            dry_run: false,
            initiated_by: initiated_by.to_string(),
            metadata,
        }
    }

    #[test]
    fn empty_initiator_rejected() {
        assert!(input("", None).validate().is_err());
        assert!(input("ops", None).validate().is_ok());
    }

    #[test]
    fn metadata_must_be_small_object() {
        assert!(input("ops", Some(serde_json::json!([1, 2]))).validate().is_err());
        let big = serde_json::json!({ "blob": "x".repeat(MAX_METADATA_BYTES) });
        assert!(input("ops", Some(big)).validate().is_err());
        assert!(input("ops", Some(serde_json::json!({"ticket": "OPS-1"}))).validate().is_ok());
    }
}
