//! Status enums shared with `strata-core`, re-exported for repository callers.

pub use strata_core::status::{BatchStatus, DetailStatus, EventStatus, RollbackStatus, StatusId};
