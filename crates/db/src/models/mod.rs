//! Row models and DTOs.
//!
//! Each submodule contains:
//! - A `FromRow` + `Serialize` entity struct matching the database row
//! - `Deserialize` input DTOs for inserts and list queries

pub mod batch;
pub mod batch_detail;
pub mod event;
pub mod lock;
pub mod rollback;
pub mod script;
pub mod status;
pub mod target;
