//! Rollback eligibility rules and strategy selection.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::status::BatchStatus;
use crate::types::Timestamp;

/// Default period after completion during which a batch may be reversed.
pub const DEFAULT_ROLLBACK_WINDOW: Duration = Duration::from_secs(24 * 3600);

/// Batch metadata key set once a rollback has succeeded.
pub const METADATA_ROLLED_BACK: &str = "rolled_back";

/// Reversal strategies, in the order they are preferred.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RollbackStrategyKind {
    /// Run the down-scripts of every applied version.
    UndoScripts,
    /// Restore the pre-migration snapshot of each target.
    SnapshotRestore,
}

impl RollbackStrategyKind {
    pub const PRIORITY: [RollbackStrategyKind; 2] = [
        RollbackStrategyKind::UndoScripts,
        RollbackStrategyKind::SnapshotRestore,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::UndoScripts => "undo_scripts",
            Self::SnapshotRestore => "snapshot_restore",
        }
    }
}

impl fmt::Display for RollbackStrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RollbackStrategyKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::PRIORITY
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| CoreError::Validation(format!("Unknown rollback strategy: \"{s}\"")))
    }
}

/// Whether one strategy could reverse a batch, and why not if it can't.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StrategyAvailability {
    pub strategy: RollbackStrategyKind,
    pub available: bool,
    pub reason: Option<String>,
}

/// Answer to "may this batch be rolled back?".
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EligibilityReport {
    pub eligible: bool,
    pub reasons: Vec<String>,
    pub strategies: Vec<StrategyAvailability>,
}

/// Batch-level facts the eligibility rules look at.
#[derive(Debug, Clone, Copy)]
pub struct BatchFacts<'a> {
    pub status: BatchStatus,
    pub completed_at: Option<Timestamp>,
    pub dry_run: bool,
    pub metadata: &'a serde_json::Value,
}

/// Reasons a batch may not be rolled back. Empty means eligible as far as
/// the batch itself is concerned.
pub fn ineligibility_reasons(facts: BatchFacts<'_>, now: Timestamp, window: Duration) -> Vec<String> {
    let mut reasons = Vec::new();

    if facts.status != BatchStatus::Completed {
        reasons.push(format!(
            "Batch status is {}; only completed batches can be rolled back",
            facts.status
        ));
    }

    if facts.dry_run {
        reasons.push("Dry-run batches made no changes to roll back".to_string());
    }

    if facts.metadata.get(METADATA_ROLLED_BACK).and_then(|v| v.as_bool()) == Some(true) {
        reasons.push("Batch has already been rolled back".to_string());
    }

    match facts.completed_at {
        Some(completed_at) => {
            let window_ms = window.as_millis() as i64;
            if now - completed_at > chrono::Duration::milliseconds(window_ms) {
                reasons.push(format!(
                    "Rollback window of {}h elapsed (completed at {})",
                    window.as_secs() / 3600,
                    completed_at.to_rfc3339()
                ));
            }
        }
        None if facts.status == BatchStatus::Completed => {
            reasons.push("Batch has no completion time".to_string());
        }
        None => {}
    }

    reasons
}

/// Pick the strategy to run. An explicit request must be available; without
/// one, the first available strategy in priority order wins.
pub fn select_strategy(
    requested: Option<RollbackStrategyKind>,
    availability: &[StrategyAvailability],
) -> Result<RollbackStrategyKind, CoreError> {
    let is_available = |kind: RollbackStrategyKind| {
        availability
            .iter()
            .any(|a| a.strategy == kind && a.available)
    };

    if let Some(kind) = requested {
        return if is_available(kind) {
            Ok(kind)
        } else {
            Err(CoreError::Ineligible {
                reasons: vec![format!("Requested strategy {kind} is not available")],
            })
        };
    }

    RollbackStrategyKind::PRIORITY
        .into_iter()
        .find(|k| is_available(*k))
        .ok_or_else(|| CoreError::Ineligible {
            reasons: vec!["No rollback strategy is available".to_string()],
        })
}
