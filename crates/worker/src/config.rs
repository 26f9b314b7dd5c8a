use std::time::Duration;

use strata_core::error::CoreError;
use strata_core::migration_event::{
    EventBackoff, DEFAULT_EVENT_RETENTION, DEFAULT_MAX_EVENT_RETRIES, DEFAULT_RECLAIM_AFTER,
};
use strata_engine::config::env_or;
use strata_engine::handlers::DEFAULT_CLAIM_HEARTBEAT;
use strata_engine::EngineConfig;

/// Worker process configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub database_url: String,
    pub db_max_connections: u32,
    /// Base URL of the script-runner service.
    pub runner_url: String,
    pub engine: EngineConfig,
    /// Concurrent event consumers. Each runs one batch at a time.
    pub consumers: usize,
    /// Idle wait between polls of an empty queue.
    pub consumer_poll_interval: Duration,
    pub max_event_retries: i32,
    pub event_backoff: EventBackoff,
    pub lock_reap_interval: Duration,
    /// Events whose claim was not renewed for this long are reclaimed.
    pub reclaim_after: Duration,
    /// Claim renewal interval while a consumer runs a batch.
    pub claim_heartbeat: Duration,
    pub reclaim_interval: Duration,
    pub event_retention: Duration,
    pub retention_interval: Duration,
}

impl WorkerConfig {
    /// Load configuration from environment variables. Engine settings are
    /// read by [`EngineConfig::from_env`].
    ///
    /// | Env Var                     | Default                  |
    /// |-----------------------------|--------------------------|
    /// | `DATABASE_URL`              | required                 |
    /// | `DB_MAX_CONNECTIONS`        | `20`                     |
    /// | `SCRIPT_RUNNER_URL`         | `http://localhost:8700`  |
    /// | `EVENT_CONSUMERS`           | `2`                      |
    /// | `EVENT_POLL_INTERVAL_MS`    | `1000`                   |
    /// | `EVENT_MAX_RETRIES`         | `5`                      |
    /// | `EVENT_BACKOFF_BASE_SECS`   | `5`                      |
    /// | `EVENT_BACKOFF_MAX_SECS`    | `600`                    |
    /// | `LOCK_REAP_INTERVAL_SECS`   | `30`                     |
    /// | `EVENT_RECLAIM_AFTER_SECS`  | `900`                    |
    /// | `EVENT_RECLAIM_INTERVAL_SECS` | `60`                   |
    /// | `EVENT_CLAIM_HEARTBEAT_SECS` | `60`                    |
    /// | `EVENT_RETENTION_HOURS`     | `168`                    |
    /// | `EVENT_RETENTION_INTERVAL_SECS` | `3600`               |
    pub fn from_env() -> Result<Self, CoreError> {
        let database_url = std::env::var("DATABASE_URL")
            .map_err(|_| CoreError::Validation("DATABASE_URL must be set".to_string()))?;

        let consumers: usize = env_or("EVENT_CONSUMERS", 2)?;
        if consumers == 0 {
            return Err(CoreError::Validation(
                "EVENT_CONSUMERS must be at least 1".to_string(),
            ));
        }

        let max_event_retries: i32 = env_or("EVENT_MAX_RETRIES", DEFAULT_MAX_EVENT_RETRIES)?;
        if max_event_retries < 0 {
            return Err(CoreError::Validation(
                "EVENT_MAX_RETRIES must be non-negative".to_string(),
            ));
        }

        let defaults = EventBackoff::default();
        let event_backoff = EventBackoff {
            base: Duration::from_secs(env_or("EVENT_BACKOFF_BASE_SECS", defaults.base.as_secs())?),
            max: Duration::from_secs(env_or("EVENT_BACKOFF_MAX_SECS", defaults.max.as_secs())?),
        };
        if event_backoff.base > event_backoff.max {
            return Err(CoreError::Validation(
                "EVENT_BACKOFF_BASE_SECS must not exceed EVENT_BACKOFF_MAX_SECS".to_string(),
            ));
        }

        let reclaim_after = Duration::from_secs(env_or(
            "EVENT_RECLAIM_AFTER_SECS",
            DEFAULT_RECLAIM_AFTER.as_secs(),
        )?);
        let claim_heartbeat = Duration::from_secs(env_or(
            "EVENT_CLAIM_HEARTBEAT_SECS",
            DEFAULT_CLAIM_HEARTBEAT.as_secs(),
        )?);
        if claim_heartbeat.is_zero() || claim_heartbeat >= reclaim_after {
            return Err(CoreError::Validation(
                "EVENT_CLAIM_HEARTBEAT_SECS must be positive and below EVENT_RECLAIM_AFTER_SECS".to_string(),
            ));
        }

        Ok(Self {
            database_url,
            db_max_connections: env_or("DB_MAX_CONNECTIONS", 20)?,
            runner_url: env_or("SCRIPT_RUNNER_URL", "http://localhost:8700".to_string())?,
            engine: EngineConfig::from_env()?,
            consumers,
            consumer_poll_interval: Duration::from_millis(env_or("EVENT_POLL_INTERVAL_MS", 1000)?),
            max_event_retries,
            event_backoff,
            lock_reap_interval: Duration::from_secs(env_or("LOCK_REAP_INTERVAL_SECS", 30)?),
            reclaim_after,
            claim_heartbeat,
            reclaim_interval: Duration::from_secs(env_or("EVENT_RECLAIM_INTERVAL_SECS", 60)?),
            event_retention: Duration::from_secs(
                env_or::<u64>("EVENT_RETENTION_HOURS", DEFAULT_EVENT_RETENTION.as_secs() / 3600)? * 3600,
            ),
            retention_interval: Duration::from_secs(env_or("EVENT_RETENTION_INTERVAL_SECS", 3600)?),
        })
    }
}
