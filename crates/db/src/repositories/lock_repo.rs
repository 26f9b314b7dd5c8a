//! Repository for the `migration_locks` table.
//!
//! Acquisition is one conditional upsert: a new key inserts, an expired key
//! is taken over, a live key held by someone else is left untouched. The
//! primary key on `resource_key` makes a second live holder impossible.

use sqlx::PgPool;

use crate::models::lock::ResourceLock;

/// Column list for `migration_locks` queries.
const COLUMNS: &str = "resource_key, holder_id, purpose, acquired_at, expires_at";

pub struct LockRepo;

impl LockRepo {
    /// Try to take `resource_key` for `ttl_ms` milliseconds.
    ///
    /// Returns `true` when the lock was inserted or an expired lease was
    /// taken over, or when `holder_id` already holds a live lease (no-op).
    pub async fn try_acquire(
        pool: &PgPool,
        resource_key: &str,
        holder_id: &str,
        purpose: &str,
        ttl_ms: i64,
    ) -> Result<bool, sqlx::Error> {
        let granted = sqlx::query_scalar::<_, String>(
            "INSERT INTO migration_locks (resource_key, holder_id, purpose, acquired_at, expires_at) \
             VALUES ($1, $2, $3, NOW(), NOW() + ($4 * INTERVAL '1 millisecond')) \
             ON CONFLICT (resource_key) DO UPDATE \
             SET holder_id = EXCLUDED.holder_id, purpose = EXCLUDED.purpose, \
                 acquired_at = EXCLUDED.acquired_at, expires_at = EXCLUDED.expires_at \
             WHERE migration_locks.expires_at <= NOW() \
             RETURNING resource_key",
        )
        .bind(resource_key)
        .bind(holder_id)
        .bind(purpose)
        .bind(ttl_ms as f64)
        .fetch_optional(pool)
        .await?;

        if granted.is_some() {
            return Ok(true);
        }

        let held_by_caller = sqlx::query_scalar::<_, i32>(
            "SELECT 1 FROM migration_locks \
             WHERE resource_key = $1 AND holder_id = $2 AND expires_at > NOW()",
        )
        .bind(resource_key)
        .bind(holder_id)
        .fetch_optional(pool)
        .await?;
        Ok(held_by_caller.is_some())
    }

    /// Release a lock held by `holder_id`. Returns `false` if the caller
    /// did not hold it.
    pub async fn release(pool: &PgPool, resource_key: &str, holder_id: &str) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("DELETE FROM migration_locks WHERE resource_key = $1 AND holder_id = $2")
            .bind(resource_key)
            .bind(holder_id)
            .execute(pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Delete every expired lease. Returns the number removed.
    pub async fn reap_expired(pool: &PgPool) -> Result<u64, sqlx::Error> {
        let result = sqlx::query("DELETE FROM migration_locks WHERE expires_at <= NOW()")
            .execute(pool)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn find(pool: &PgPool, resource_key: &str) -> Result<Option<ResourceLock>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM migration_locks WHERE resource_key = $1");
        sqlx::query_as::<_, ResourceLock>(&query)
            .bind(resource_key)
            .fetch_optional(pool)
            .await
    }
}
