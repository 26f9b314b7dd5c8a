use crate::types::DbId;

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: &'static str, id: DbId },

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    /// A requested scope depends on a prerequisite scope that has never
    /// completed a migration and is not part of the plan.
    #[error("Unresolvable scope: {scope} requires {missing} which has never completed a migration")]
    UnresolvableScope { scope: String, missing: String },

    /// A rollback (or other gated operation) was rejected up front.
    #[error("Not eligible: {}", reasons.join("; "))]
    Ineligible { reasons: Vec<String> },

    #[error("Internal error: {0}")]
    Internal(String),
}
