//! Batch-level aggregation: count invariants, the continue/abort rule after
//! each wave, final status, and the operator-facing failure summary.

use serde::{Deserialize, Serialize};

use crate::scope::Scope;
use crate::status::BatchStatus;

/// Error messages included in a batch summary.
pub const SUMMARY_MAX_ERRORS: usize = 5;

/// Longest single error message kept in a summary.
pub const SUMMARY_MAX_ERROR_LEN: usize = 200;

/// Per-batch target counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchCounts {
    pub total: i32,
    pub completed: i32,
    pub failed: i32,
    pub skipped: i32,
}

impl BatchCounts {
    pub fn finished(&self) -> i32 {
        self.completed + self.failed + self.skipped
    }

    /// `completed + failed + skipped <= total`, all non-negative.
    pub fn is_consistent(&self) -> bool {
        self.total >= 0
            && self.completed >= 0
            && self.failed >= 0
            && self.skipped >= 0
            && self.finished() <= self.total
    }
}

/// A failed target's scope that blocks a scope still waiting to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockedDependency {
    pub failed: Scope,
    pub blocked: Scope,
}

/// Decide whether the batch must stop after a wave. Returns the first
/// failed scope that is a hard prerequisite of a scope still to run.
pub fn blocking_failure(failed_scopes: &[Scope], remaining_scopes: &[Scope]) -> Option<BlockedDependency> {
    failed_scopes.iter().find_map(|failed| {
        remaining_scopes
            .iter()
            .find(|blocked| failed.is_hard_prerequisite_of(**blocked))
            .map(|blocked| BlockedDependency {
                failed: *failed,
                blocked: *blocked,
            })
    })
}

/// Status of a batch whose waves all ran. Partial failures still complete
/// the batch; only a batch where every target failed is failed.
pub fn final_status(counts: &BatchCounts) -> BatchStatus {
    if counts.total > 0 && counts.failed == counts.total {
        BatchStatus::Failed
    } else {
        BatchStatus::Completed
    }
}

fn truncate(msg: &str) -> String {
    if msg.chars().count() <= SUMMARY_MAX_ERROR_LEN {
        return msg.to_string();
    }
    let cut: String = msg.chars().take(SUMMARY_MAX_ERROR_LEN).collect();
    format!("{cut}…")
}

/// Aggregated, operator-facing summary: counts plus the first few errors.
pub fn summarize(counts: &BatchCounts, errors: &[(String, String)]) -> String {
    let mut summary = format!(
        "{} of {} targets completed, {} failed, {} skipped",
        counts.completed, counts.total, counts.failed, counts.skipped
    );
    if !errors.is_empty() {
        let listed: Vec<String> = errors
            .iter()
            .take(SUMMARY_MAX_ERRORS)
            .map(|(target, msg)| format!("{target}: {}", truncate(msg)))
            .collect();
        summary.push_str("; errors: ");
        summary.push_str(&listed.join(" | "));
        if errors.len() > SUMMARY_MAX_ERRORS {
            summary.push_str(&format!(" (+{} more)", errors.len() - SUMMARY_MAX_ERRORS));
        }
    }
    summary
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn consistency_check() {
        let ok = BatchCounts {
            total: 5,
            completed: 2,
            failed: 1,
            skipped: 2,
        };
        assert!(ok.is_consistent());
        let over = BatchCounts {
            skipped: 3,
            ..ok
        };
        assert!(!over.is_consistent());
    }

    #[test]
    fn failure_in_prerequisite_blocks() {
        let blocked = blocking_failure(&[Scope::RegionalShared], &[Scope::TenantTemplate, Scope::Tenant]);
        assert_eq!(
            blocked,
            Some(BlockedDependency {
                failed: Scope::RegionalShared,
                blocked: Scope::TenantTemplate
            })
        );
    }

    #[test]
    fn failure_in_leaf_scope_does_not_block() {
        assert_eq!(blocking_failure(&[Scope::Tenant], &[]), None);
        assert_eq!(
            blocking_failure(&[Scope::RegionalAnalytics], &[Scope::TenantTemplate, Scope::Tenant]),
            None
        );
    }

    #[test]
    fn final_status_tolerates_partial_failure() {
        let partial = BatchCounts {
            total: 3,
            completed: 2,
            failed: 1,
            skipped: 0,
        };
        assert_eq!(final_status(&partial), BatchStatus::Completed);
        let all_failed = BatchCounts {
            total: 2,
            completed: 0,
            failed: 2,
            skipped: 0,
        };
        assert_eq!(final_status(&all_failed), BatchStatus::Failed);
    }

    #[test]
    fn summary_lists_first_errors_truncated() {
        let counts = BatchCounts {
            total: 10,
            completed: 3,
            failed: 7,
            skipped: 0,
        };
        let errors: Vec<(String, String)> = (0..7)
            .map(|i| (format!("tenant-{i}"), "x".repeat(500)))
            .collect();
        let summary = summarize(&counts, &errors);
        assert!(summary.starts_with("3 of 10 targets completed, 7 failed, 0 skipped"));
        assert!(summary.contains("tenant-4"));
        assert!(!summary.contains("tenant-5:"));
        assert!(summary.ends_with("(+2 more)"));
        assert!(!summary.contains(&"x".repeat(201)));
    }
}
