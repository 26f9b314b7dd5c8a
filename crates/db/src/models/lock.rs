//! Resource lock rows.

use serde::Serialize;
use sqlx::FromRow;
use strata_core::types::Timestamp;

/// A row from the `migration_locks` table.
#[derive(Debug, Clone, PartialEq, FromRow, Serialize)]
pub struct ResourceLock {
    pub resource_key: String,
    pub holder_id: String,
    pub purpose: String,
    pub acquired_at: Timestamp,
    pub expires_at: Timestamp,
}

impl ResourceLock {
    pub fn is_expired(&self, now: Timestamp) -> bool {
        self.expires_at <= now
    }
}
