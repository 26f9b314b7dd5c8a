//! Per-target circuit breaker state machine.
//!
//! - **Closed**: calls pass; each failure increments a counter, a success
//!   resets it.
//! - **Open**: reached after `failure_threshold` consecutive failures. Every
//!   call is rejected without touching the target until `cooldown` elapses.
//! - **HalfOpen**: after the cooldown exactly one trial call is admitted.
//!   Success closes the circuit, failure reopens it with a fresh cooldown.
//!
//! Time is passed in explicitly so the transitions can be driven from tests.

use std::time::Duration;

use serde::Serialize;

use crate::types::Timestamp;

/// Default consecutive failures before the circuit opens.
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 5;

/// Default time the circuit stays open before a trial call.
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            cooldown: DEFAULT_COOLDOWN,
        }
    }
}

/// Verdict for one prospective call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Circuit closed, call normally.
    Allowed,
    /// The single half-open trial.
    Trial,
    /// Do not call the target.
    Rejected { retry_after: Timestamp },
}

impl Admission {
    pub fn is_admitted(&self) -> bool {
        !matches!(self, Admission::Rejected { .. })
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Timestamp>,
    trial_in_flight: bool,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            state: CircuitState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            trial_in_flight: false,
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    fn reopen_at(&self) -> Option<Timestamp> {
        self.opened_at
            .map(|at| at + chrono::Duration::milliseconds(self.config.cooldown.as_millis() as i64))
    }

    /// Decide whether a call may proceed at `now`.
    pub fn admit(&mut self, now: Timestamp) -> Admission {
        match self.state {
            CircuitState::Closed => Admission::Allowed,
            CircuitState::Open => match self.reopen_at() {
                Some(reopen) if now < reopen => Admission::Rejected { retry_after: reopen },
                _ => {
                    self.state = CircuitState::HalfOpen;
                    self.trial_in_flight = true;
                    Admission::Trial
                }
            },
            CircuitState::HalfOpen => {
                if self.trial_in_flight {
                    Admission::Rejected {
                        retry_after: self.reopen_at().unwrap_or(now),
                    }
                } else {
                    self.trial_in_flight = true;
                    Admission::Trial
                }
            }
        }
    }

    /// The target answered. Closes the circuit and resets the counter.
    pub fn record_success(&mut self) {
        self.state = CircuitState::Closed;
        self.consecutive_failures = 0;
        self.opened_at = None;
        self.trial_in_flight = false;
    }

    /// The target could not be reached (or timed out) at `now`.
    pub fn record_failure(&mut self, now: Timestamp) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        match self.state {
            CircuitState::HalfOpen => {
                self.state = CircuitState::Open;
                self.opened_at = Some(now);
                self.trial_in_flight = false;
            }
            CircuitState::Closed => {
                if self.consecutive_failures >= self.config.failure_threshold {
                    self.state = CircuitState::Open;
                    self.opened_at = Some(now);
                }
            }
            CircuitState::Open => {}
        }
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::*;

    fn t0() -> Timestamp {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    fn secs(n: i64) -> chrono::Duration {
        chrono::Duration::seconds(n)
    }

    fn breaker(threshold: u32) -> CircuitBreaker {
        CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: threshold,
            cooldown: Duration::from_secs(60),
        })
    }

    #[test]
    fn success_resets_counter() {
        let mut cb = breaker(3);
        cb.record_failure(t0());
        cb.record_failure(t0());
        cb.record_success();
        assert_eq!(cb.consecutive_failures(), 0);
        cb.record_failure(t0());
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn opens_after_threshold_and_rejects() {
        let mut cb = breaker(3);
        for _ in 0..3 {
            assert_eq!(cb.admit(t0()), Admission::Allowed);
            cb.record_failure(t0());
        }
        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(
            cb.admit(t0() + secs(59)),
            Admission::Rejected {
                retry_after: t0() + secs(60)
            }
        );
    }

    #[test]
    fn exactly_one_trial_after_cooldown() {
        let mut cb = breaker(1);
        cb.record_failure(t0());
        let later = t0() + secs(60);
        assert_eq!(cb.admit(later), Admission::Trial);
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert!(!cb.admit(later).is_admitted());
    }

    #[test]
    fn trial_success_closes() {
        let mut cb = breaker(1);
        cb.record_failure(t0());
        assert_eq!(cb.admit(t0() + secs(61)), Admission::Trial);
        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.admit(t0() + secs(62)), Admission::Allowed);
    }

    #[test]
    fn trial_failure_reopens_with_fresh_cooldown() {
        let mut cb = breaker(1);
        cb.record_failure(t0());
        let trial_at = t0() + secs(70);
        assert_eq!(cb.admit(trial_at), Admission::Trial);
        cb.record_failure(trial_at);
        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(
            cb.admit(trial_at + secs(30)),
            Admission::Rejected {
                retry_after: trial_at + secs(60)
            }
        );
        assert_eq!(cb.admit(trial_at + secs(60)), Admission::Trial);
    }
}
