//! Static repository structs, one per table. Every method takes the pool
//! explicitly and returns `sqlx::Error` unchanged.

pub mod batch_detail_repo;
pub mod batch_repo;
pub mod event_repo;
pub mod lock_repo;
pub mod rollback_repo;
pub mod script_repo;
pub mod target_repo;

pub use batch_detail_repo::BatchDetailRepo;
pub use batch_repo::BatchRepo;
pub use event_repo::EventRepo;
pub use lock_repo::LockRepo;
pub use rollback_repo::RollbackRepo;
pub use script_repo::ScriptRepo;
pub use target_repo::TargetRepo;
