//! Read model over the externally owned `migration_targets` table.

use sqlx::FromRow;
use strata_core::error::CoreError;
use strata_core::target::MigrationTarget;
use strata_core::types::SchemaVersion;

/// A row from the `migration_targets` table.
#[derive(Debug, Clone, FromRow)]
pub struct TargetRow {
    pub target_id: String,
    pub scope: String,
    pub region: Option<String>,
    pub schema_name: String,
    pub endpoint: String,
    pub current_version: Option<SchemaVersion>,
    pub last_good_version: Option<SchemaVersion>,
}

impl TryFrom<TargetRow> for MigrationTarget {
    type Error = CoreError;

    fn try_from(row: TargetRow) -> Result<Self, Self::Error> {
        Ok(MigrationTarget {
            scope: row.scope.parse()?,
            target_id: row.target_id,
            region: row.region,
            schema_name: row.schema_name,
            endpoint: row.endpoint,
            current_version: row.current_version,
            last_good_version: row.last_good_version,
        })
    }
}
