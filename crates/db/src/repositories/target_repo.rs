//! Read-only access to the externally owned `migration_targets` table.

use sqlx::PgPool;
use strata_core::target::TargetFilter;

use crate::models::target::TargetRow;

/// Column list for `migration_targets` queries.
const COLUMNS: &str = "\
    target_id, scope, region, schema_name, endpoint, current_version, last_good_version";

pub struct TargetRepo;

impl TargetRepo {
    /// Targets matching every field set on `filter`, ordered by id.
    pub async fn list(pool: &PgPool, filter: &TargetFilter) -> Result<Vec<TargetRow>, sqlx::Error> {
        let query = format!(
            "SELECT {COLUMNS} FROM migration_targets \
             WHERE ($1::TEXT IS NULL OR scope = $1) \
               AND ($2::TEXT IS NULL OR region = $2) \
               AND ($3::TEXT IS NULL OR target_id = $3) \
             ORDER BY target_id"
        );
        sqlx::query_as::<_, TargetRow>(&query)
            .bind(filter.scope.map(|s| s.as_str()))
            .bind(&filter.region)
            .bind(&filter.target_id)
            .fetch_all(pool)
            .await
    }
}
