use strata_core::error::CoreError;
use strata_events::QueueError;

/// Error type for engine operations.
///
/// Wraps [`CoreError`] for domain failures (validation, unresolvable
/// scopes, ineligible rollbacks) and adds the infrastructure failures the
/// engine can hit on its way.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Queue(#[from] QueueError),

    /// The script runner could not be reached for a non-apply call.
    #[error("Script runner error: {0}")]
    Runner(String),
}

pub type EngineResult<T> = Result<T, EngineError>;

impl From<validator::ValidationErrors> for EngineError {
    fn from(errors: validator::ValidationErrors) -> Self {
        EngineError::Core(CoreError::Validation(errors.to_string()))
    }
}

impl EngineError {
    pub fn not_found(entity: &'static str, id: strata_core::types::DbId) -> Self {
        EngineError::Core(CoreError::NotFound { entity, id })
    }
}
