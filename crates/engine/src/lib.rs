//! Migration orchestration engine: drives resolved plans across the
//! target fleet under resource locks, retries and circuit breaking, keeps
//! live progress, coordinates rollbacks and turns queued events into
//! batches.
//!
//! Everything is wired through explicit constructor injection; the
//! persistence and collaborator seams are the traits in [`store`] and
//! [`external`].

pub mod config;
pub mod error;
pub mod external;
pub mod handlers;
pub mod lock_manager;
pub mod orchestrator;
pub mod progress;
pub mod retry;
pub mod rollback;
pub mod store;

pub use config::EngineConfig;
pub use error::{EngineError, EngineResult};
pub use handlers::EventHandler;
pub use lock_manager::LockManager;
pub use orchestrator::Orchestrator;
pub use progress::ProgressTracker;
pub use retry::RetryLayer;
pub use rollback::RollbackService;
