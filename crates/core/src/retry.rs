//! Retry policy and apply-outcome classification.
//!
//! The apply primitive reports faults as values ([`ApplyOutcome`]); the
//! retry layer branches on [`FaultKind`] instead of catching errors.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::types::SchemaVersion;

// ---------------------------------------------------------------------------
// Apply outcome
// ---------------------------------------------------------------------------

/// Successful apply of a script set to one target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Applied {
    pub new_version: SchemaVersion,
    pub duration_ms: i64,
}

/// Result of one call to the apply primitive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied(Applied),
    /// Connectivity loss, timeout, lock wait on the target database.
    Retryable(String),
    /// Malformed script, constraint violation. Never retried.
    Fatal(String),
}

/// How a failed attempt should be treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    Retryable,
    Fatal,
}

impl ApplyOutcome {
    pub fn fault_kind(&self) -> Option<FaultKind> {
        match self {
            ApplyOutcome::Applied(_) => None,
            ApplyOutcome::Retryable(_) => Some(FaultKind::Retryable),
            ApplyOutcome::Fatal(_) => Some(FaultKind::Fatal),
        }
    }

    pub fn error_message(&self) -> Option<&str> {
        match self {
            ApplyOutcome::Applied(_) => None,
            ApplyOutcome::Retryable(msg) | ApplyOutcome::Fatal(msg) => Some(msg),
        }
    }
}

// ---------------------------------------------------------------------------
// Policy
// ---------------------------------------------------------------------------

/// Delay growth between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    Immediate,
    Fixed,
    Linear,
    Exponential,
}

impl FromStr for BackoffStrategy {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "immediate" => Ok(Self::Immediate),
            "fixed" => Ok(Self::Fixed),
            "linear" => Ok(Self::Linear),
            "exponential" => Ok(Self::Exponential),
            other => Err(CoreError::Validation(format!(
                "Unknown backoff strategy: \"{other}\""
            ))),
        }
    }
}

/// Bounded retry policy for a single-target apply.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub strategy: BackoffStrategy,
    pub base_delay: Duration,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
    /// Growth factor for [`BackoffStrategy::Exponential`].
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            strategy: BackoffStrategy::Exponential,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.max_attempts == 0 {
            return Err(CoreError::Validation(
                "Retry policy needs at least one attempt".to_string(),
            ));
        }
        if self.multiplier < 1.0 {
            return Err(CoreError::Validation(format!(
                "Backoff multiplier must be >= 1.0, got {}",
                self.multiplier
            )));
        }
        Ok(())
    }

    /// Delay to wait after attempt number `failed_attempt` (1-based) failed.
    pub fn delay_after(&self, failed_attempt: u32) -> Duration {
        let n = failed_attempt.max(1);
        let delay = match self.strategy {
            BackoffStrategy::Immediate => Duration::ZERO,
            BackoffStrategy::Fixed => self.base_delay,
            BackoffStrategy::Linear => self.base_delay.saturating_mul(n),
            BackoffStrategy::Exponential => {
                let factor = self.multiplier.powi(n as i32 - 1);
                let ms = self.base_delay.as_millis() as f64 * factor;
                if ms.is_finite() && ms < self.max_delay.as_millis() as f64 {
                    Duration::from_millis(ms as u64)
                } else {
                    self.max_delay
                }
            }
        };
        delay.min(self.max_delay)
    }

    /// Whether another attempt should follow a failure of kind `fault` on
    /// attempt `attempt`.
    pub fn should_retry(&self, attempt: u32, fault: FaultKind) -> bool {
        fault == FaultKind::Retryable && attempt < self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(strategy: BackoffStrategy) -> RetryPolicy {
        RetryPolicy {
            max_attempts: 5,
            strategy,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1000),
            multiplier: 2.0,
        }
    }

    #[test]
    fn immediate_never_waits() {
        let p = policy(BackoffStrategy::Immediate);
        assert_eq!(p.delay_after(1), Duration::ZERO);
        assert_eq!(p.delay_after(4), Duration::ZERO);
    }

    #[test]
    fn fixed_is_constant() {
        let p = policy(BackoffStrategy::Fixed);
        assert_eq!(p.delay_after(1), Duration::from_millis(100));
        assert_eq!(p.delay_after(3), Duration::from_millis(100));
    }

    #[test]
    fn linear_grows_by_base() {
        let p = policy(BackoffStrategy::Linear);
        assert_eq!(p.delay_after(1), Duration::from_millis(100));
        assert_eq!(p.delay_after(3), Duration::from_millis(300));
        assert_eq!(p.delay_after(50), Duration::from_millis(1000));
    }

    #[test]
    fn exponential_full_sequence_caps() {
        let p = policy(BackoffStrategy::Exponential);
        let expected = [100, 200, 400, 800, 1000, 1000];
        for (i, ms) in expected.iter().enumerate() {
            assert_eq!(p.delay_after(i as u32 + 1), Duration::from_millis(*ms));
        }
        assert_eq!(p.delay_after(500), Duration::from_millis(1000));
    }

    #[test]
    fn fatal_faults_never_retry() {
        let p = policy(BackoffStrategy::Fixed);
        assert!(!p.should_retry(1, FaultKind::Fatal));
        assert!(p.should_retry(1, FaultKind::Retryable));
        assert!(!p.should_retry(5, FaultKind::Retryable));
    }

    #[test]
    fn outcome_classification() {
        let ok = ApplyOutcome::Applied(Applied {
            new_version: 3,
            duration_ms: 12,
        });
        assert_eq!(ok.fault_kind(), None);
        assert_eq!(
            ApplyOutcome::Retryable("timeout".into()).fault_kind(),
            Some(FaultKind::Retryable)
        );
        assert_eq!(
            ApplyOutcome::Fatal("syntax error".into()).error_message(),
            Some("syntax error")
        );
    }

    #[test]
    fn validate_rejects_zero_attempts() {
        let p = RetryPolicy {
            max_attempts: 0,
            ..Default::default()
        };
        assert!(p.validate().is_err());
        assert!(RetryPolicy::default().validate().is_ok());
    }

    #[test]
    fn strategy_parses() {
        assert_eq!("linear".parse::<BackoffStrategy>().unwrap(), BackoffStrategy::Linear);
        assert!("random".parse::<BackoffStrategy>().is_err());
    }
}
