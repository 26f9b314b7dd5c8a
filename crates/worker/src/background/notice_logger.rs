//! Logs engine notices from the bus so operators see them in the
//! worker's output. Failures and dead letters are logged as errors.

use strata_events::bus::requires_attention;
use strata_events::EngineNotice;
use tokio::sync::broadcast;

pub async fn run(mut receiver: broadcast::Receiver<EngineNotice>) {
    loop {
        match receiver.recv().await {
            Ok(notice) => log_notice(&notice),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "Notice logger lagged, notices dropped");
            }
            Err(broadcast::error::RecvError::Closed) => {
                tracing::info!("Event bus closed, notice logger stopping");
                break;
            }
        }
    }
}

fn log_notice(notice: &EngineNotice) {
    if requires_attention(&notice.notice_type) {
        tracing::error!(
            notice = %notice.notice_type,
            batch_id = notice.batch_id,
            event_id = notice.event_id,
            payload = %notice.payload,
            "Engine notice requires attention"
        );
    } else {
        tracing::info!(
            notice = %notice.notice_type,
            batch_id = notice.batch_id,
            event_id = notice.event_id,
            "Engine notice"
        );
    }
}
