//! Retry and circuit-breaking around per-target applies.
//!
//! Each call is bounded by the apply timeout (a timeout is a retryable
//! fault), retried per the [`RetryPolicy`] on retryable faults only, and
//! gated by a per-target [`CircuitBreaker`]. Only unreachable-target
//! faults count against the breaker; a fatal reply means the target
//! answered.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use chrono::Utc;
use strata_core::circuit_breaker::{Admission, CircuitBreaker, CircuitBreakerConfig, CircuitState};
use strata_core::retry::{Applied, ApplyOutcome, FaultKind, RetryPolicy};
use strata_core::types::Timestamp;
use tokio::sync::Mutex;

/// Final result of a retried apply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryOutcome {
    Applied { applied: Applied, attempts: u32 },
    Failed { fault: FaultKind, error: String, attempts: u32 },
    /// The breaker is open; the target was not called on the last try.
    CircuitOpen { retry_after: Timestamp, attempts: u32 },
}

impl RetryOutcome {
    pub fn attempts(&self) -> u32 {
        match self {
            RetryOutcome::Applied { attempts, .. }
            | RetryOutcome::Failed { attempts, .. }
            | RetryOutcome::CircuitOpen { attempts, .. } => *attempts,
        }
    }
}

pub struct RetryLayer {
    policy: RetryPolicy,
    breaker_config: CircuitBreakerConfig,
    timeout: Duration,
    breakers: Mutex<HashMap<String, CircuitBreaker>>,
}

impl RetryLayer {
    pub fn new(policy: RetryPolicy, breaker_config: CircuitBreakerConfig, timeout: Duration) -> Self {
        Self {
            policy,
            breaker_config,
            timeout,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    pub async fn circuit_state(&self, target_id: &str) -> CircuitState {
        self.breakers
            .lock()
            .await
            .get(target_id)
            .map(|b| b.state())
            .unwrap_or(CircuitState::Closed)
    }

    async fn admit(&self, target_id: &str) -> Admission {
        let mut breakers = self.breakers.lock().await;
        breakers
            .entry(target_id.to_string())
            .or_insert_with(|| CircuitBreaker::new(self.breaker_config))
            .admit(Utc::now())
    }

    async fn record(&self, target_id: &str, outcome: &ApplyOutcome) {
        let mut breakers = self.breakers.lock().await;
        let Some(breaker) = breakers.get_mut(target_id) else {
            return;
        };
        let before = breaker.state();
        match outcome.fault_kind() {
            Some(FaultKind::Retryable) => breaker.record_failure(Utc::now()),
            None | Some(FaultKind::Fatal) => breaker.record_success(),
        }
        let after = breaker.state();
        if before != after {
            tracing::warn!(
                target_id,
                from = ?before,
                to = ?after,
                consecutive_failures = breaker.consecutive_failures(),
                "Circuit breaker state changed"
            );
        }
    }

    /// Run `op` for `target_id` until it applies, fails fatally, runs out
    /// of attempts, or the breaker refuses. `op` receives the 1-based
    /// attempt number.
    pub async fn execute<F, Fut>(&self, target_id: &str, mut op: F) -> RetryOutcome
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = ApplyOutcome>,
    {
        let mut attempt: u32 = 0;
        loop {
            if let Admission::Rejected { retry_after } = self.admit(target_id).await {
                tracing::warn!(target_id, attempts = attempt, %retry_after, "Circuit open, apply not attempted");
                return RetryOutcome::CircuitOpen {
                    retry_after,
                    attempts: attempt,
                };
            }

            attempt += 1;
            let outcome = match tokio::time::timeout(self.timeout, op(attempt)).await {
                Ok(outcome) => outcome,
                Err(_) => ApplyOutcome::Retryable(format!(
                    "Apply timed out after {} ms",
                    self.timeout.as_millis()
                )),
            };
            self.record(target_id, &outcome).await;

            match outcome {
                ApplyOutcome::Applied(applied) => {
                    return RetryOutcome::Applied {
                        applied,
                        attempts: attempt,
                    };
                }
                ApplyOutcome::Fatal(error) => {
                    tracing::error!(target_id, attempt, error = %error, "Apply failed fatally");
                    return RetryOutcome::Failed {
                        fault: FaultKind::Fatal,
                        error,
                        attempts: attempt,
                    };
                }
                ApplyOutcome::Retryable(error) => {
                    if !self.policy.should_retry(attempt, FaultKind::Retryable) {
                        tracing::error!(target_id, attempt, error = %error, "Apply failed, retries exhausted");
                        return RetryOutcome::Failed {
                            fault: FaultKind::Retryable,
                            error,
                            attempts: attempt,
                        };
                    }
                    let delay = self.policy.delay_after(attempt);
                    tracing::warn!(
                        target_id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "Apply failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use assert_matches::assert_matches;
    use strata_core::retry::BackoffStrategy;

    use super::*;

    fn layer(max_attempts: u32, threshold: u32, cooldown: Duration) -> RetryLayer {
        RetryLayer::new(
            RetryPolicy {
                max_attempts,
                strategy: BackoffStrategy::Immediate,
                base_delay: Duration::ZERO,
                max_delay: Duration::ZERO,
                multiplier: 1.0,
            },
            CircuitBreakerConfig {
                failure_threshold: threshold,
                cooldown,
            },
            Duration::from_millis(200),
        )
    }

    fn applied(version: i64) -> ApplyOutcome {
        ApplyOutcome::Applied(Applied {
            new_version: version,
            duration_ms: 5,
        })
    }

    #[tokio::test]
    async fn transient_twice_then_success_takes_three_attempts() {
        let retry = layer(3, 10, Duration::from_secs(60));
        let outcome = retry
            .execute("t1", |attempt| async move {
                if attempt < 3 {
                    ApplyOutcome::Retryable("connection reset".into())
                } else {
                    applied(4)
                }
            })
            .await;
        assert_matches!(outcome, RetryOutcome::Applied { attempts: 3, applied } if applied.new_version == 4);
        assert_eq!(retry.circuit_state("t1").await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn fatal_short_circuits() {
        let retry = layer(5, 10, Duration::from_secs(60));
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let outcome = retry
            .execute("t1", move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { ApplyOutcome::Fatal("syntax error at line 3".into()) }
            })
            .await;
        assert_matches!(outcome, RetryOutcome::Failed { fault: FaultKind::Fatal, attempts: 1, .. });
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn timeout_is_retryable() {
        let retry = layer(2, 10, Duration::from_secs(60));
        let outcome = retry
            .execute("t1", |_| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                applied(1)
            })
            .await;
        assert_matches!(
            outcome,
            RetryOutcome::Failed { fault: FaultKind::Retryable, attempts: 2, ref error } if error.contains("timed out")
        );
    }

    #[tokio::test]
    async fn open_breaker_rejects_without_calling() {
        let retry = layer(1, 2, Duration::from_secs(60));
        for _ in 0..2 {
            retry
                .execute("t1", |_| async { ApplyOutcome::Retryable("down".into()) })
                .await;
        }
        assert_eq!(retry.circuit_state("t1").await, CircuitState::Open);

        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let outcome = retry
            .execute("t1", move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { applied(1) }
            })
            .await;
        assert_matches!(outcome, RetryOutcome::CircuitOpen { attempts: 0, .. });
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        // Other targets keep their own breaker.
        assert_matches!(
            retry.execute("t2", |_| async { applied(1) }).await,
            RetryOutcome::Applied { .. }
        );
    }

    #[tokio::test]
    async fn half_open_trial_success_closes() {
        let retry = layer(1, 1, Duration::from_millis(20));
        retry
            .execute("t1", |_| async { ApplyOutcome::Retryable("down".into()) })
            .await;
        assert_eq!(retry.circuit_state("t1").await, CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_matches!(
            retry.execute("t1", |_| async { applied(2) }).await,
            RetryOutcome::Applied { attempts: 1, .. }
        );
        assert_eq!(retry.circuit_state("t1").await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn fatal_reply_does_not_trip_breaker() {
        let retry = layer(1, 1, Duration::from_secs(60));
        retry
            .execute("t1", |_| async { ApplyOutcome::Fatal("constraint violation".into()) })
            .await;
        assert_eq!(retry.circuit_state("t1").await, CircuitState::Closed);
    }
}
