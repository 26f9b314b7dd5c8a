//! Strata event infrastructure.
//!
//! - [`EventBus`]: in-process publish/subscribe hub for [`EngineNotice`]s,
//!   backed by `tokio::sync::broadcast`.
//! - [`EventQueue`]: durable, prioritised queue of migration trigger
//!   events with retry backoff and dead-lettering, over an [`EventStore`].

pub mod bus;
pub mod queue;
pub mod store;

pub use bus::{EngineNotice, EventBus};
pub use queue::{Completion, EventQueue, QueueError};
pub use store::{EventStore, MemoryEventStore, PgEventStore, Reclaimed};
