//! Repository for the `rollback_executions` table.

use sqlx::PgPool;
use strata_core::types::DbId;

use crate::models::rollback::{CreateRollback, RollbackExecution};
use crate::models::status::RollbackStatus;

/// Column list for `rollback_executions` queries.
const COLUMNS: &str = "\
    id, batch_id, strategy, status_id, dry_run, initiated_by, error_message, \
    started_at, completed_at, created_at, updated_at";

pub struct RollbackRepo;

impl RollbackRepo {
    /// Record a rollback that starts running now.
    pub async fn create_running(pool: &PgPool, input: &CreateRollback) -> Result<RollbackExecution, sqlx::Error> {
        let query = format!(
            "INSERT INTO rollback_executions \
                 (batch_id, strategy, status_id, dry_run, initiated_by, started_at) \
             VALUES ($1, $2, $3, $4, $5, NOW()) \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, RollbackExecution>(&query)
            .bind(input.batch_id)
            .bind(input.strategy.as_str())
            .bind(RollbackStatus::Running.id())
            .bind(input.dry_run)
            .bind(&input.initiated_by)
            .fetch_one(pool)
            .await
    }

    /// Close a running execution as completed or failed.
    pub async fn finish(
        pool: &PgPool,
        id: DbId,
        status: RollbackStatus,
        error: Option<&str>,
    ) -> Result<Option<RollbackExecution>, sqlx::Error> {
        let query = format!(
            "UPDATE rollback_executions \
             SET status_id = $2, error_message = $3, completed_at = NOW(), updated_at = NOW() \
             WHERE id = $1 AND status_id = $4 \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, RollbackExecution>(&query)
            .bind(id)
            .bind(status.id())
            .bind(error)
            .bind(RollbackStatus::Running.id())
            .fetch_optional(pool)
            .await
    }

    pub async fn list_by_batch(pool: &PgPool, batch_id: DbId) -> Result<Vec<RollbackExecution>, sqlx::Error> {
        let query = format!(
            "SELECT {COLUMNS} FROM rollback_executions WHERE batch_id = $1 ORDER BY created_at DESC"
        );
        sqlx::query_as::<_, RollbackExecution>(&query)
            .bind(batch_id)
            .fetch_all(pool)
            .await
    }
}
