//! Event consumer loop.
//!
//! Claims due events in lane order and hands each to the
//! [`EventHandler`], which runs its batch to the end before the next
//! claim. An empty queue is polled again after `poll_interval`.

use std::sync::Arc;
use std::time::Duration;

use strata_engine::EventHandler;
use strata_events::EventQueue;
use tokio_util::sync::CancellationToken;

pub async fn run(
    consumer: usize,
    handler: EventHandler,
    queue: Arc<EventQueue>,
    poll_interval: Duration,
    cancel: CancellationToken,
) {
    tracing::info!(consumer, poll_interval_ms = poll_interval.as_millis() as u64, "Event consumer started");

    loop {
        if cancel.is_cancelled() {
            break;
        }

        let idle = match handler.process_next(&queue, None).await {
            Ok(Some((event, status))) => {
                tracing::debug!(consumer, event_id = event.id, status = %status, "Event settled");
                false
            }
            Ok(None) => true,
            Err(e) => {
                tracing::error!(consumer, error = %e, "Event consumer: processing failed");
                true
            }
        };

        if idle {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(poll_interval) => {}
            }
        }
    }

    tracing::info!(consumer, "Event consumer stopping");
}
