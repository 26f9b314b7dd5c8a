//! Settles events orphaned in `processing` by a crashed consumer: each
//! expired claim costs one attempt, and events out of attempts are
//! dead-lettered.

use std::sync::Arc;
use std::time::Duration;

use strata_events::EventQueue;
use tokio_util::sync::CancellationToken;

pub async fn run(
    queue: Arc<EventQueue>,
    reclaim_after: Duration,
    interval: Duration,
    cancel: CancellationToken,
) {
    tracing::info!(
        reclaim_after_secs = reclaim_after.as_secs(),
        interval_secs = interval.as_secs(),
        "Stale event reclaimer started"
    );

    let mut ticker = tokio::time::interval(interval);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("Stale event reclaimer stopping");
                break;
            }
            _ = ticker.tick() => {
                match queue.reclaim_stale(reclaim_after).await {
                    Ok(reclaimed) if reclaimed.is_empty() => {
                        tracing::debug!("Stale event reclaimer: nothing to reclaim")
                    }
                    Ok(reclaimed) => tracing::warn!(
                        requeued = reclaimed.requeued,
                        dead_lettered = reclaimed.dead_lettered.len(),
                        "Stale event reclaimer: expired claims settled"
                    ),
                    Err(e) => tracing::error!(error = %e, "Stale event reclaimer: sweep failed"),
                }
            }
        }
    }
}
