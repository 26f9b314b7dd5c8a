//! Read model over the externally owned `migration_scripts` catalog.

use sqlx::FromRow;
use strata_core::types::SchemaVersion;

/// A row from the `migration_scripts` table.
#[derive(Debug, Clone, FromRow)]
pub struct ScriptRow {
    pub scope: String,
    pub version: SchemaVersion,
    pub has_undo: bool,
}
