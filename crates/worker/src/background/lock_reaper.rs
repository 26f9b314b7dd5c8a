//! Periodic removal of expired resource locks.
//!
//! Acquisition already reaps before every attempt; this sweep keeps the
//! table small while no batch is running.

use std::time::Duration;

use strata_engine::LockManager;
use tokio_util::sync::CancellationToken;

pub async fn run(locks: LockManager, interval: Duration, cancel: CancellationToken) {
    tracing::info!(interval_secs = interval.as_secs(), "Lock reaper started");

    let mut ticker = tokio::time::interval(interval);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("Lock reaper stopping");
                break;
            }
            _ = ticker.tick() => {
                if let Err(e) = locks.reap_expired().await {
                    tracing::error!(error = %e, "Lock reaper: sweep failed");
                }
            }
        }
    }
}
