use std::str::FromStr;
use std::time::Duration;

use strata_core::circuit_breaker::CircuitBreakerConfig;
use strata_core::error::CoreError;
use strata_core::lock::bounded_ttl;
use strata_core::retry::{BackoffStrategy, RetryPolicy};
use strata_core::rollback::DEFAULT_ROLLBACK_WINDOW;

/// Engine tuning loaded from environment variables.
///
/// Defaults suit a single-region deployment; every field can be
/// overridden.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Identifies this engine instance as a lock holder.
    pub instance_id: String,
    /// Concurrent target applies within one wave.
    pub parallelism: usize,
    /// Lease length for target and rollback locks, clamped to [1 s, 1 h].
    pub lock_ttl: Duration,
    pub retry: RetryPolicy,
    pub breaker: CircuitBreakerConfig,
    /// Upper bound on a single apply call; exceeding it is a retryable fault.
    pub apply_timeout: Duration,
    pub rollback_window: Duration,
    /// How often a paused batch re-reads its status.
    pub pause_poll_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            instance_id: format!("strata-{}", uuid::Uuid::new_v4()),
            parallelism: 8,
            lock_ttl: Duration::from_secs(900),
            retry: RetryPolicy::default(),
            breaker: CircuitBreakerConfig::default(),
            apply_timeout: Duration::from_secs(300),
            rollback_window: DEFAULT_ROLLBACK_WINDOW,
            pause_poll_interval: Duration::from_secs(1),
        }
    }
}

/// Parse `name` from the environment, falling back to `default` when unset.
pub fn env_or<T>(name: &str, default: T) -> Result<T, CoreError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e| CoreError::Validation(format!("{name} is invalid ({raw:?}): {e}"))),
        Err(_) => Ok(default),
    }
}

impl EngineConfig {
    /// Load configuration from environment variables.
    ///
    /// | Env Var                     | Default        |
    /// |-----------------------------|----------------|
    /// | `ENGINE_INSTANCE_ID`        | `strata-<uuid>`|
    /// | `ENGINE_PARALLELISM`        | `8`            |
    /// | `LOCK_TTL_SECS`             | `900`          |
    /// | `RETRY_MAX_ATTEMPTS`        | `3`            |
    /// | `RETRY_STRATEGY`            | `exponential`  |
    /// | `RETRY_BASE_DELAY_MS`       | `1000`         |
    /// | `RETRY_MAX_DELAY_MS`        | `30000`        |
    /// | `RETRY_MULTIPLIER`          | `2.0`          |
    /// | `BREAKER_FAILURE_THRESHOLD` | `5`            |
    /// | `BREAKER_COOLDOWN_SECS`     | `300`          |
    /// | `APPLY_TIMEOUT_SECS`        | `300`          |
    /// | `ROLLBACK_WINDOW_HOURS`     | `24`           |
    /// | `PAUSE_POLL_INTERVAL_MS`    | `1000`         |
    pub fn from_env() -> Result<Self, CoreError> {
        let defaults = Self::default();

        let instance_id = std::env::var("ENGINE_INSTANCE_ID").unwrap_or(defaults.instance_id);
        let parallelism: usize = env_or("ENGINE_PARALLELISM", defaults.parallelism)?;
        if parallelism == 0 {
            return Err(CoreError::Validation(
                "ENGINE_PARALLELISM must be at least 1".to_string(),
            ));
        }

        let retry = RetryPolicy {
            max_attempts: env_or("RETRY_MAX_ATTEMPTS", defaults.retry.max_attempts)?,
            strategy: env_or::<String>("RETRY_STRATEGY", "exponential".into())?
                .parse::<BackoffStrategy>()?,
            base_delay: Duration::from_millis(env_or("RETRY_BASE_DELAY_MS", 1000)?),
            max_delay: Duration::from_millis(env_or("RETRY_MAX_DELAY_MS", 30_000)?),
            multiplier: env_or("RETRY_MULTIPLIER", defaults.retry.multiplier)?,
        };
        retry.validate()?;

        let breaker = CircuitBreakerConfig {
            failure_threshold: env_or("BREAKER_FAILURE_THRESHOLD", defaults.breaker.failure_threshold)?,
            cooldown: Duration::from_secs(env_or("BREAKER_COOLDOWN_SECS", 300)?),
        };
        if breaker.failure_threshold == 0 {
            return Err(CoreError::Validation(
                "BREAKER_FAILURE_THRESHOLD must be at least 1".to_string(),
            ));
        }

        Ok(Self {
            instance_id,
            parallelism,
            lock_ttl: bounded_ttl(Duration::from_secs(env_or("LOCK_TTL_SECS", 900)?)),
            retry,
            breaker,
            apply_timeout: Duration::from_secs(env_or("APPLY_TIMEOUT_SECS", 300)?),
            rollback_window: Duration::from_secs(env_or::<u64>("ROLLBACK_WINDOW_HOURS", 24)? * 3600),
            pause_poll_interval: Duration::from_millis(env_or("PAUSE_POLL_INTERVAL_MS", 1000)?),
        })
    }
}
