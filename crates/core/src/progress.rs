//! Live progress snapshots and completion-time estimation.

use std::collections::VecDeque;

use serde::Serialize;

use crate::status::BatchStatus;
use crate::types::{DbId, Timestamp};

/// Number of recent per-target durations averaged for the estimate.
pub const ROLLING_WINDOW: usize = 20;

/// Derived view of one batch. Best effort; rebuilt from persisted rows.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressSnapshot {
    pub batch_id: DbId,
    pub status: BatchStatus,
    /// Zero-based index of the wave currently executing.
    pub wave_index: usize,
    pub wave_count: usize,
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
    /// Target ids with an apply in flight.
    pub in_flight: Vec<String>,
    pub estimated_remaining_ms: Option<i64>,
    pub estimated_completion: Option<Timestamp>,
    pub updated_at: Timestamp,
}

impl ProgressSnapshot {
    pub fn new(batch_id: DbId, total: usize, wave_count: usize, now: Timestamp) -> Self {
        Self {
            batch_id,
            status: BatchStatus::Pending,
            wave_index: 0,
            wave_count,
            total,
            completed: 0,
            failed: 0,
            skipped: 0,
            in_flight: Vec::new(),
            estimated_remaining_ms: None,
            estimated_completion: None,
            updated_at: now,
        }
    }

    /// Targets that reached any terminal status.
    pub fn finished(&self) -> usize {
        self.completed + self.failed + self.skipped
    }

    pub fn remaining(&self) -> usize {
        self.total.saturating_sub(self.finished())
    }

    pub fn percent(&self) -> f64 {
        if self.total == 0 {
            return 100.0;
        }
        self.finished() as f64 * 100.0 / self.total as f64
    }
}

/// Rolling average of observed per-target durations.
#[derive(Debug, Clone)]
pub struct ThroughputEstimator {
    samples: VecDeque<i64>,
    capacity: usize,
}

impl Default for ThroughputEstimator {
    fn default() -> Self {
        Self::new(ROLLING_WINDOW)
    }
}

impl ThroughputEstimator {
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    pub fn record(&mut self, duration_ms: i64) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(duration_ms.max(0));
    }

    pub fn average_ms(&self) -> Option<f64> {
        if self.samples.is_empty() {
            return None;
        }
        Some(self.samples.iter().sum::<i64>() as f64 / self.samples.len() as f64)
    }

    /// Rolling average duration times the number of targets left.
    pub fn estimate_remaining_ms(&self, remaining: usize) -> Option<i64> {
        self.average_ms().map(|avg| (avg * remaining as f64).round() as i64)
    }
}
