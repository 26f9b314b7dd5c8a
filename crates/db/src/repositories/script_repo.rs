//! Read-only access to the `migration_scripts` catalog.

use sqlx::PgPool;
use strata_core::types::SchemaVersion;

use crate::models::script::ScriptRow;

pub struct ScriptRepo;

impl ScriptRepo {
    /// Highest published version for a scope.
    pub async fn latest_version(pool: &PgPool, scope: &str) -> Result<Option<SchemaVersion>, sqlx::Error> {
        sqlx::query_scalar::<_, Option<SchemaVersion>>(
            "SELECT MAX(version) FROM migration_scripts WHERE scope = $1",
        )
        .bind(scope)
        .fetch_one(pool)
        .await
    }

    /// Scripts with `after < version <= up_to`, ascending.
    pub async fn list_range(
        pool: &PgPool,
        scope: &str,
        after: Option<SchemaVersion>,
        up_to: SchemaVersion,
    ) -> Result<Vec<ScriptRow>, sqlx::Error> {
        sqlx::query_as::<_, ScriptRow>(
            "SELECT scope, version, has_undo FROM migration_scripts \
             WHERE scope = $1 AND version > COALESCE($2, 0) AND version <= $3 \
             ORDER BY version",
        )
        .bind(scope)
        .bind(after)
        .bind(up_to)
        .fetch_all(pool)
        .await
    }
}
