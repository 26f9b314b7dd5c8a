//! Domain logic for the migration orchestration engine.
//!
//! Pure types and functions only: this crate has no internal dependencies
//! and performs no I/O, so every rule here is unit-testable in isolation.

pub mod batch;
pub mod circuit_breaker;
pub mod error;
pub mod lock;
pub mod migration_event;
pub mod progress;
pub mod resolver;
pub mod retry;
pub mod rollback;
pub mod scope;
pub mod status;
pub mod target;
pub mod types;
