//! Background tasks run by the worker.
//!
//! Each submodule provides a long-running async function intended to be
//! spawned via `tokio::spawn`. All tasks accept a [`CancellationToken`]
//! for graceful shutdown.
//!
//! [`CancellationToken`]: tokio_util::sync::CancellationToken

pub mod event_consumer;
pub mod event_reclaimer;
pub mod event_retention;
pub mod lock_reaper;
pub mod notice_logger;
