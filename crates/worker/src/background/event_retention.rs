//! Periodic cleanup of terminal events.
//!
//! Deletes completed and dead-lettered events whose completion is older
//! than the retention window.

use std::sync::Arc;
use std::time::Duration;

use strata_events::EventQueue;
use tokio_util::sync::CancellationToken;

pub async fn run(queue: Arc<EventQueue>, retention: Duration, interval: Duration, cancel: CancellationToken) {
    tracing::info!(
        retention_hours = retention.as_secs() / 3600,
        interval_secs = interval.as_secs(),
        "Event retention job started"
    );

    let mut ticker = tokio::time::interval(interval);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("Event retention job stopping");
                break;
            }
            _ = ticker.tick() => {
                match queue.purge_expired(retention).await {
                    Ok(deleted) if deleted > 0 => {
                        tracing::info!(deleted, "Event retention: purged old events");
                    }
                    Ok(_) => tracing::debug!("Event retention: no events to purge"),
                    Err(e) => tracing::error!(error = %e, "Event retention: cleanup failed"),
                }
            }
        }
    }
}
