//! Turns claimed migration events into batches.

use std::time::Duration;

use strata_core::migration_event::{EventPayload, EventPriority};
use strata_core::scope::ScopeRequest;
use strata_db::models::batch::CreateBatch;
use strata_db::models::event::MigrationEvent;
use strata_db::models::status::{BatchStatus, EventStatus};
use strata_events::{Completion, EventQueue};

use crate::error::EngineResult;
use crate::orchestrator::Orchestrator;

const INITIATOR_TARGET_CREATED: &str = "event:target-created";
const INITIATOR_MAINTENANCE: &str = "event:maintenance-scheduled";

/// Default interval between claim renewals while a batch runs.
pub const DEFAULT_CLAIM_HEARTBEAT: Duration = Duration::from_secs(60);

/// Handles one event at a time by running its batch to the end.
#[derive(Clone)]
pub struct EventHandler {
    orchestrator: Orchestrator,
    heartbeat: Duration,
}

impl EventHandler {
    pub fn new(orchestrator: Orchestrator) -> Self {
        Self {
            orchestrator,
            heartbeat: DEFAULT_CLAIM_HEARTBEAT,
        }
    }

    /// How often the claim on an in-flight event is renewed. Must stay
    /// well under the stale-claim timeout.
    pub fn with_heartbeat(mut self, heartbeat: Duration) -> Self {
        self.heartbeat = heartbeat.max(Duration::from_millis(1));
        self
    }

    /// The batch request an event stands for.
    pub fn batch_request(event: &MigrationEvent, payload: EventPayload) -> CreateBatch {
        let metadata = serde_json::json!({ "event_id": event.id, "event_type": event.event_type });
        match payload {
            EventPayload::TargetCreated { target_id } => CreateBatch {
                requested_scope: ScopeRequest::Target(target_id),
                dry_run: false,
                initiated_by: INITIATOR_TARGET_CREATED.to_string(),
                metadata: Some(metadata),
            },
            EventPayload::MaintenanceScheduled { scope, .. } => CreateBatch {
                requested_scope: scope,
                dry_run: false,
                initiated_by: INITIATOR_MAINTENANCE.to_string(),
                metadata: Some(metadata),
            },
            EventPayload::ManualRequest {
                scope,
                dry_run,
                requested_by,
            } => CreateBatch {
                requested_scope: scope,
                dry_run,
                initiated_by: requested_by,
                metadata: Some(metadata),
            },
        }
    }

    /// Run the batch for `event`. Succeeds only when the batch completed.
    pub async fn handle(&self, event: &MigrationEvent) -> Completion {
        let payload = match event.decode_payload() {
            Ok(payload) => payload,
            Err(e) => {
                return Completion::Failed {
                    error: format!("Malformed {} payload: {e}", event.event_type),
                }
            }
        };

        let request = Self::batch_request(event, payload);
        match self.orchestrator.run_batch(request).await {
            Ok(batch) if batch.status() == BatchStatus::Completed => Completion::Succeeded {
                batch_id: Some(batch.id),
            },
            Ok(batch) => Completion::Failed {
                error: format!(
                    "Batch {} ended {}: {}",
                    batch.id,
                    batch.status(),
                    batch.error_summary.as_deref().unwrap_or("no summary")
                ),
            },
            Err(e) => Completion::Failed { error: e.to_string() },
        }
    }

    /// Claim, handle and settle the next due event. `None` when the queue
    /// had nothing due. The claim is renewed every heartbeat while the
    /// batch runs, so long and paused batches are not reclaimed.
    pub async fn process_next(
        &self,
        queue: &EventQueue,
        lane: Option<EventPriority>,
    ) -> EngineResult<Option<(MigrationEvent, EventStatus)>> {
        let Some(event) = queue.dequeue(lane).await? else {
            return Ok(None);
        };
        tracing::info!(
            event_id = event.id,
            event_type = %event.event_type,
            retry_count = event.retry_count,
            "Handling event"
        );
        let completion = {
            let handling = self.handle(&event);
            tokio::pin!(handling);
            let mut heartbeat = tokio::time::interval(self.heartbeat);
            heartbeat.tick().await;
            loop {
                tokio::select! {
                    completion = &mut handling => break completion,
                    _ = heartbeat.tick() => {
                        if let Err(e) = queue.renew_claim(&event).await {
                            tracing::warn!(event_id = event.id, error = %e, "Failed to renew event claim");
                        }
                    }
                }
            }
        };
        let status = queue.complete(&event, completion).await?;
        Ok(Some((event, status)))
    }
}
