//! Repository for the `migration_batch_details` table.
//!
//! Detail transitions are monotonic: every update names the statuses it may
//! move from, so a terminal row is never rewritten.

use sqlx::{PgPool, Postgres, Transaction};
use strata_core::types::DbId;

use crate::models::batch_detail::{BatchDetail, CreateBatchDetail, FinishDetail};
use crate::models::status::DetailStatus;

/// Column list for `migration_batch_details` queries.
const COLUMNS: &str = "\
    id, batch_id, target_id, scope, region, wave_index, status_id, \
    previous_version, target_version, attempt_count, duration_ms, error_message, \
    started_at, completed_at, created_at, updated_at";

pub struct BatchDetailRepo;

impl BatchDetailRepo {
    /// Insert one pending row per planned target inside the caller's
    /// transaction.
    pub async fn create_many(
        tx: &mut Transaction<'_, Postgres>,
        batch_id: DbId,
        rows: &[CreateBatchDetail],
    ) -> Result<Vec<BatchDetail>, sqlx::Error> {
        let query = format!(
            "INSERT INTO migration_batch_details \
                 (batch_id, target_id, scope, region, wave_index, status_id, \
                  previous_version, target_version) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
             RETURNING {COLUMNS}"
        );

        let mut created = Vec::with_capacity(rows.len());
        for row in rows {
            let detail = sqlx::query_as::<_, BatchDetail>(&query)
                .bind(batch_id)
                .bind(&row.target_id)
                .bind(&row.scope)
                .bind(&row.region)
                .bind(row.wave_index)
                .bind(DetailStatus::Pending.id())
                .bind(row.previous_version)
                .bind(row.target_version)
                .fetch_one(&mut **tx)
                .await?;
            created.push(detail);
        }
        Ok(created)
    }

    /// All details of a batch in wave order, then target id.
    pub async fn list_by_batch(pool: &PgPool, batch_id: DbId) -> Result<Vec<BatchDetail>, sqlx::Error> {
        let query = format!(
            "SELECT {COLUMNS} FROM migration_batch_details \
             WHERE batch_id = $1 ORDER BY wave_index, target_id"
        );
        sqlx::query_as::<_, BatchDetail>(&query)
            .bind(batch_id)
            .fetch_all(pool)
            .await
    }

    /// Pending → running. Returns `false` if the row was not pending.
    pub async fn mark_running(pool: &PgPool, id: DbId) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE migration_batch_details \
             SET status_id = $2, started_at = NOW(), updated_at = NOW() \
             WHERE id = $1 AND status_id = $3",
        )
        .bind(id)
        .bind(DetailStatus::Running.id())
        .bind(DetailStatus::Pending.id())
        .execute(pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Record that attempt number `attempt` is starting.
    pub async fn record_attempt(pool: &PgPool, id: DbId, attempt: i32) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE migration_batch_details \
             SET attempt_count = GREATEST(attempt_count, $2), updated_at = NOW() \
             WHERE id = $1 AND status_id = $3",
        )
        .bind(id)
        .bind(attempt)
        .bind(DetailStatus::Running.id())
        .execute(pool)
        .await?;
        Ok(())
    }

    /// Move a pending or running row to its terminal status. Returns
    /// `false` if the row was already terminal.
    pub async fn finish(
        tx: &mut Transaction<'_, Postgres>,
        id: DbId,
        outcome: &FinishDetail,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE migration_batch_details \
             SET status_id = $2, \
                 target_version = COALESCE($3, target_version), \
                 duration_ms = $4, error_message = $5, \
                 completed_at = NOW(), updated_at = NOW() \
             WHERE id = $1 AND status_id IN ($6, $7)",
        )
        .bind(id)
        .bind(outcome.status.id())
        .bind(outcome.applied_version)
        .bind(outcome.duration_ms)
        .bind(&outcome.error_message)
        .bind(DetailStatus::Pending.id())
        .bind(DetailStatus::Running.id())
        .execute(&mut **tx)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}
