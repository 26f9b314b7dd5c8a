//! Repository for the `migration_batches` table.
//!
//! Status changes are guarded by the current status in the `WHERE` clause
//! so concurrent writers can never move a batch out of a terminal state.
//! Writes that must land together with detail rows take a transaction.

use sqlx::{PgPool, Postgres, Transaction};
use strata_core::types::DbId;

use crate::models::batch::{BatchListQuery, CreateBatch, MigrationBatch};
use crate::models::status::{BatchStatus, DetailStatus, StatusId};

/// Column list for `migration_batches` queries.
const COLUMNS: &str = "\
    id, requested_scope, status_id, dry_run, \
    total_targets, completed_targets, failed_targets, skipped_targets, \
    initiated_by, metadata, error_summary, \
    started_at, completed_at, created_at, updated_at";

/// Maximum page size for batch listing.
const MAX_LIMIT: i64 = 100;

/// Default page size for batch listing.
const DEFAULT_LIMIT: i64 = 50;

/// Terminal statuses: completed, failed, cancelled.
const TERMINAL_STATUSES: [StatusId; 3] = [
    BatchStatus::Completed as StatusId,
    BatchStatus::Failed as StatusId,
    BatchStatus::Cancelled as StatusId,
];

pub struct BatchRepo;

impl BatchRepo {
    /// Insert a pending batch covering `total_targets` targets.
    pub async fn create(
        tx: &mut Transaction<'_, Postgres>,
        input: &CreateBatch,
        total_targets: i32,
    ) -> Result<MigrationBatch, sqlx::Error> {
        let query = format!(
            "INSERT INTO migration_batches \
                 (requested_scope, status_id, dry_run, total_targets, initiated_by, metadata) \
             VALUES ($1, $2, $3, $4, $5, $6) \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, MigrationBatch>(&query)
            .bind(input.requested_scope.to_string())
            .bind(BatchStatus::Pending.id())
            .bind(input.dry_run)
            .bind(total_targets)
            .bind(&input.initiated_by)
            .bind(
                input
                    .metadata
                    .clone()
                    .unwrap_or_else(|| serde_json::json!({})),
            )
            .fetch_one(&mut **tx)
            .await
    }

    pub async fn find_by_id(pool: &PgPool, id: DbId) -> Result<Option<MigrationBatch>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM migration_batches WHERE id = $1");
        sqlx::query_as::<_, MigrationBatch>(&query)
            .bind(id)
            .fetch_optional(pool)
            .await
    }

    /// List batches, newest first, with optional status / initiator filters.
    pub async fn list(pool: &PgPool, params: &BatchListQuery) -> Result<Vec<MigrationBatch>, sqlx::Error> {
        let limit = params.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);
        let offset = params.offset.unwrap_or(0).max(0);

        // Build the WHERE clause and track the next bind parameter index.
        let mut conditions: Vec<String> = Vec::new();
        let mut bind_idx: u32 = 1;

        if params.status_id.is_some() {
            conditions.push(format!("status_id = ${bind_idx}"));
            bind_idx += 1;
        }
        if params.initiated_by.is_some() {
            conditions.push(format!("initiated_by = ${bind_idx}"));
            bind_idx += 1;
        }

        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };

        let query = format!(
            "SELECT {COLUMNS} FROM migration_batches \
             {where_clause} \
             ORDER BY created_at DESC, id DESC \
             LIMIT ${bind_idx} OFFSET ${}",
            bind_idx + 1,
        );

        let mut q = sqlx::query_as::<_, MigrationBatch>(&query);
        if let Some(sid) = params.status_id {
            q = q.bind(sid);
        }
        if let Some(by) = &params.initiated_by {
            q = q.bind(by);
        }
        q.bind(limit).bind(offset).fetch_all(pool).await
    }

    /// Move a batch from any of `from` to `to`. Returns `false` when the
    /// batch was not in one of the expected statuses.
    pub async fn transition(
        pool: &PgPool,
        id: DbId,
        from: &[BatchStatus],
        to: BatchStatus,
    ) -> Result<bool, sqlx::Error> {
        let from_ids: Vec<StatusId> = from.iter().map(|s| s.id()).collect();
        let result = sqlx::query(
            "UPDATE migration_batches \
             SET status_id = $2, \
                 started_at = CASE WHEN $2 = $4 THEN COALESCE(started_at, NOW()) ELSE started_at END, \
                 updated_at = NOW() \
             WHERE id = $1 AND status_id = ANY($3)",
        )
        .bind(id)
        .bind(to.id())
        .bind(&from_ids)
        .bind(BatchStatus::Running.id())
        .execute(pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Record the terminal status and summary of a batch. Only statuses the
    /// state machine allows to enter `status` qualify, so a paused batch
    /// must be resumed before it can complete. Returns `false` when the
    /// batch was not in such a status or `status` is not terminal.
    pub async fn finish(
        pool: &PgPool,
        id: DbId,
        status: BatchStatus,
        error_summary: Option<&str>,
    ) -> Result<bool, sqlx::Error> {
        if !status.is_terminal() {
            return Ok(false);
        }
        let from_ids: Vec<StatusId> = BatchStatus::sources(status).iter().map(|s| s.id()).collect();
        let result = sqlx::query(
            "UPDATE migration_batches \
             SET status_id = $2, error_summary = $3, completed_at = NOW(), updated_at = NOW() \
             WHERE id = $1 AND status_id = ANY($4)",
        )
        .bind(id)
        .bind(status.id())
        .bind(error_summary)
        .bind(&from_ids)
        .execute(pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Cancel a batch if it is not already in a terminal state.
    pub async fn cancel(pool: &PgPool, id: DbId) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE migration_batches \
             SET status_id = $2, completed_at = NOW(), updated_at = NOW() \
             WHERE id = $1 AND status_id NOT IN ($3, $4, $5)",
        )
        .bind(id)
        .bind(BatchStatus::Cancelled.id())
        .bind(TERMINAL_STATUSES[0])
        .bind(TERMINAL_STATUSES[1])
        .bind(TERMINAL_STATUSES[2])
        .execute(pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Bump the counter matching a detail's terminal status. The table's
    /// check constraint rejects any increment past `total_targets`.
    pub async fn increment_count(
        tx: &mut Transaction<'_, Postgres>,
        id: DbId,
        outcome: DetailStatus,
    ) -> Result<(), sqlx::Error> {
        let column = match outcome {
            DetailStatus::Completed => "completed_targets",
            DetailStatus::Failed => "failed_targets",
            DetailStatus::Skipped => "skipped_targets",
            DetailStatus::Pending | DetailStatus::Running => return Ok(()),
        };
        let query = format!(
            "UPDATE migration_batches SET {column} = {column} + 1, updated_at = NOW() WHERE id = $1"
        );
        sqlx::query(&query).bind(id).execute(&mut **tx).await?;
        Ok(())
    }

    /// Merge `patch` into the batch's metadata object.
    pub async fn merge_metadata(
        pool: &PgPool,
        id: DbId,
        patch: &serde_json::Value,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE migration_batches SET metadata = metadata || $2, updated_at = NOW() WHERE id = $1",
        )
        .bind(id)
        .bind(patch)
        .execute(pool)
        .await?;
        Ok(())
    }
}
