//! Mutual-exclusion leases over the shared lock store.
//!
//! No blocking waits: a key that is held elsewhere is reported as not
//! granted and the caller decides what to do (the orchestrator skips the
//! target, the rollback service rejects the request).

use std::sync::Arc;
use std::time::Duration;

use strata_core::lock::bounded_ttl;

use crate::error::EngineResult;
use crate::store::LockStore;

#[derive(Clone)]
pub struct LockManager {
    store: Arc<dyn LockStore>,
}

impl LockManager {
    pub fn new(store: Arc<dyn LockStore>) -> Self {
        Self { store }
    }

    /// Try to take `resource_key` for `ttl` (clamped to [1 s, 1 h]).
    ///
    /// Expired leases are reaped first. Re-acquiring a live lease you
    /// already hold succeeds without extending it; anything else held is
    /// contention and returns `false`.
    pub async fn acquire(
        &self,
        resource_key: &str,
        holder_id: &str,
        ttl: Duration,
        purpose: &str,
    ) -> EngineResult<bool> {
        self.reap_expired().await?;
        let ttl = bounded_ttl(ttl);
        let granted = self.store.try_acquire(resource_key, holder_id, purpose, ttl).await?;
        if granted {
            tracing::debug!(resource_key, holder_id, purpose, ttl_ms = ttl.as_millis() as u64, "Lock acquired");
        } else {
            tracing::debug!(resource_key, holder_id, purpose, "Lock held elsewhere");
        }
        Ok(granted)
    }

    /// Release a lease. `false` when `holder_id` did not hold it.
    pub async fn release(&self, resource_key: &str, holder_id: &str) -> EngineResult<bool> {
        let released = self.store.release(resource_key, holder_id).await?;
        if !released {
            tracing::warn!(resource_key, holder_id, "Release of a lock not held");
        }
        Ok(released)
    }

    /// Who holds `resource_key`, as last written. Called right after a
    /// refused [`acquire`](Self::acquire), whose reap leaves only live leases.
    pub async fn holder_of(&self, resource_key: &str) -> EngineResult<Option<String>> {
        Ok(self
            .store
            .current_lock(resource_key)
            .await?
            .map(|lock| lock.holder_id))
    }

    pub async fn reap_expired(&self) -> EngineResult<u64> {
        let reaped = self.store.reap_expired().await?;
        if reaped > 0 {
            tracing::info!(reaped, "Reaped expired locks");
        }
        Ok(reaped)
    }
}
