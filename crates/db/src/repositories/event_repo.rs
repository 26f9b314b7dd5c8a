//! Repository for the `migration_events` queue table.
//!
//! Claims use `SELECT FOR UPDATE SKIP LOCKED` so several consumers can
//! drain the queue without double-dispatch. Service order is lane rank
//! ascending, then insertion order.

use sqlx::PgPool;
use strata_core::types::{DbId, Timestamp};

use crate::models::event::MigrationEvent;
use crate::models::status::{EventStatus, StatusId};

/// Column list for `migration_events` queries.
const COLUMNS: &str = "\
    id, event_type, priority, status_id, payload, retry_count, max_retries, \
    scheduled_at, claimed_at, last_error, batch_id, completed_at, created_at, updated_at";

/// Terminal statuses: completed, failed.
const TERMINAL_STATUSES: [StatusId; 2] = [
    EventStatus::Completed as StatusId,
    EventStatus::Failed as StatusId,
];

pub struct EventRepo;

impl EventRepo {
    pub async fn insert(
        pool: &PgPool,
        event_type: &str,
        priority: i16,
        payload: &serde_json::Value,
        max_retries: i32,
        scheduled_at: Option<Timestamp>,
    ) -> Result<MigrationEvent, sqlx::Error> {
        let query = format!(
            "INSERT INTO migration_events \
                 (event_type, priority, status_id, payload, max_retries, scheduled_at) \
             VALUES ($1, $2, $3, $4, $5, COALESCE($6, NOW())) \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, MigrationEvent>(&query)
            .bind(event_type)
            .bind(priority)
            .bind(EventStatus::Pending.id())
            .bind(payload)
            .bind(max_retries)
            .bind(scheduled_at)
            .fetch_one(pool)
            .await
    }

    /// Atomically claim the oldest due event, optionally restricted to one
    /// lane, and mark it processing.
    pub async fn claim_next(pool: &PgPool, priority: Option<i16>) -> Result<Option<MigrationEvent>, sqlx::Error> {
        let query = format!(
            "UPDATE migration_events \
             SET status_id = $1, claimed_at = NOW(), updated_at = NOW() \
             WHERE id = ( \
                 SELECT id FROM migration_events \
                 WHERE status_id IN ($2, $3) \
                   AND scheduled_at <= NOW() \
                   AND ($4::SMALLINT IS NULL OR priority = $4) \
                 ORDER BY priority ASC, created_at ASC, id ASC \
                 LIMIT 1 \
                 FOR UPDATE SKIP LOCKED \
             ) \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, MigrationEvent>(&query)
            .bind(EventStatus::Processing.id())
            .bind(EventStatus::Pending.id())
            .bind(EventStatus::Retrying.id())
            .bind(priority)
            .fetch_optional(pool)
            .await
    }

    pub async fn mark_completed(pool: &PgPool, id: DbId, batch_id: Option<DbId>) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE migration_events \
             SET status_id = $2, batch_id = COALESCE($3, batch_id), \
                 completed_at = NOW(), updated_at = NOW() \
             WHERE id = $1 AND status_id = $4",
        )
        .bind(id)
        .bind(EventStatus::Completed.id())
        .bind(batch_id)
        .bind(EventStatus::Processing.id())
        .execute(pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Put a failed event into the delayed lane: retrying, due after
    /// `delay_ms`.
    pub async fn schedule_retry(
        pool: &PgPool,
        id: DbId,
        delay_ms: i64,
        error: &str,
    ) -> Result<Option<MigrationEvent>, sqlx::Error> {
        let query = format!(
            "UPDATE migration_events \
             SET status_id = $2, retry_count = retry_count + 1, last_error = $3, \
                 claimed_at = NULL, \
                 scheduled_at = NOW() + ($4 * INTERVAL '1 millisecond'), \
                 updated_at = NOW() \
             WHERE id = $1 AND status_id = $5 \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, MigrationEvent>(&query)
            .bind(id)
            .bind(EventStatus::Retrying.id())
            .bind(error)
            .bind(delay_ms as f64)
            .bind(EventStatus::Processing.id())
            .fetch_optional(pool)
            .await
    }

    /// Terminal failure once the retry budget is exhausted.
    pub async fn mark_failed(pool: &PgPool, id: DbId, error: &str) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE migration_events \
             SET status_id = $2, last_error = $3, completed_at = NOW(), updated_at = NOW() \
             WHERE id = $1 AND status_id = $4",
        )
        .bind(id)
        .bind(EventStatus::Failed.id())
        .bind(error)
        .bind(EventStatus::Processing.id())
        .execute(pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Push the claim time of a processing event forward so the stale
    /// sweep leaves it alone. `false` once the event left processing.
    pub async fn renew_claim(pool: &PgPool, id: DbId) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE migration_events SET claimed_at = NOW(), updated_at = NOW() \
             WHERE id = $1 AND status_id = $2",
        )
        .bind(id)
        .bind(EventStatus::Processing.id())
        .execute(pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Settle events stuck in processing since before `claimed_before`.
    /// An expired claim counts as a failed attempt: events with budget left
    /// are due again immediately in the retrying lane, the rest are marked
    /// failed and returned. Both updates commit together.
    pub async fn reclaim_stale(
        pool: &PgPool,
        claimed_before: Timestamp,
        error: &str,
    ) -> Result<(u64, Vec<MigrationEvent>), sqlx::Error> {
        let mut tx = pool.begin().await?;

        let query = format!(
            "UPDATE migration_events \
             SET status_id = $1, last_error = $2, completed_at = NOW(), updated_at = NOW() \
             WHERE status_id = $3 AND claimed_at < $4 AND retry_count >= max_retries \
             RETURNING {COLUMNS}"
        );
        let dead = sqlx::query_as::<_, MigrationEvent>(&query)
            .bind(EventStatus::Failed.id())
            .bind(error)
            .bind(EventStatus::Processing.id())
            .bind(claimed_before)
            .fetch_all(&mut *tx)
            .await?;

        let requeued = sqlx::query(
            "UPDATE migration_events \
             SET status_id = $1, retry_count = retry_count + 1, last_error = $2, \
                 claimed_at = NULL, scheduled_at = NOW(), updated_at = NOW() \
             WHERE status_id = $3 AND claimed_at < $4 AND retry_count < max_retries",
        )
        .bind(EventStatus::Retrying.id())
        .bind(error)
        .bind(EventStatus::Processing.id())
        .bind(claimed_before)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        tx.commit().await?;
        Ok((requeued, dead))
    }

    /// Delete terminal events finished before `cutoff`.
    pub async fn purge_terminal(pool: &PgPool, cutoff: Timestamp) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            "DELETE FROM migration_events \
             WHERE status_id IN ($1, $2) AND completed_at < $3",
        )
        .bind(TERMINAL_STATUSES[0])
        .bind(TERMINAL_STATUSES[1])
        .bind(cutoff)
        .execute(pool)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn find_by_id(pool: &PgPool, id: DbId) -> Result<Option<MigrationEvent>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM migration_events WHERE id = $1");
        sqlx::query_as::<_, MigrationEvent>(&query)
            .bind(id)
            .fetch_optional(pool)
            .await
    }
}
