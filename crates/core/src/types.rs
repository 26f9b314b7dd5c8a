/// All database primary keys are PostgreSQL BIGSERIAL.
pub type DbId = i64;

/// All timestamps are UTC.
pub type Timestamp = chrono::DateTime<chrono::Utc>;

/// Ordinal schema version of a migration target. Versions increase by one
/// per applied change-script.
pub type SchemaVersion = i64;
