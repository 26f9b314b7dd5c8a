#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use strata_core::circuit_breaker::CircuitBreakerConfig;
use strata_core::retry::{Applied, ApplyOutcome, BackoffStrategy, RetryPolicy};
use strata_core::scope::{Scope, ScopeRequest};
use strata_core::target::{MigrationTarget, TargetFilter};
use strata_core::types::{DbId, SchemaVersion};
use strata_db::models::batch::CreateBatch;
use strata_engine::external::{
    Direction, InMemoryCatalog, InMemoryDirectory, ScriptApplier, ScriptSet, SnapshotProvider,
    TargetDirectory,
};
use strata_engine::orchestrator::OrchestratorParts;
use strata_engine::rollback::RollbackParts;
use strata_engine::store::MemoryStore;
use strata_engine::{EngineConfig, EngineResult, LockManager, Orchestrator, ProgressTracker, RollbackService};
use strata_events::EventBus;

// ---------------------------------------------------------------------------
// Fakes
// ---------------------------------------------------------------------------

/// One recorded call to the applier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyCall {
    pub target_id: String,
    pub direction: Direction,
    pub to: SchemaVersion,
}

/// Applier replaying scripted outcomes per target. Targets without a
/// script (or whose script ran out) apply cleanly.
#[derive(Default)]
pub struct ScriptedApplier {
    scripts: Mutex<HashMap<String, VecDeque<ApplyOutcome>>>,
    calls: Mutex<Vec<ApplyCall>>,
    delay: Option<Duration>,
}

impl ScriptedApplier {
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Default::default()
        }
    }

    pub fn script(&self, target_id: &str, outcomes: Vec<ApplyOutcome>) {
        self.scripts
            .lock()
            .unwrap()
            .insert(target_id.to_string(), outcomes.into());
    }

    pub fn calls(&self) -> Vec<ApplyCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_for(&self, target_id: &str) -> usize {
        self.calls().iter().filter(|c| c.target_id == target_id).count()
    }
}

#[async_trait]
impl ScriptApplier for ScriptedApplier {
    async fn apply(&self, target: &MigrationTarget, scripts: &ScriptSet, _dry_run: bool) -> ApplyOutcome {
        self.calls.lock().unwrap().push(ApplyCall {
            target_id: target.target_id.clone(),
            direction: scripts.direction,
            to: scripts.to,
        });
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let scripted = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(&target.target_id)
            .and_then(|queue| queue.pop_front());
        scripted.unwrap_or(ApplyOutcome::Applied(Applied {
            new_version: scripts.to,
            duration_ms: 5,
        }))
    }
}

/// Snapshot store holding snapshots for a fixed set of targets.
#[derive(Default)]
pub struct FakeSnapshots {
    available: Mutex<HashSet<String>>,
    restored: Mutex<Vec<String>>,
}

impl FakeSnapshots {
    pub fn add(&self, target_id: &str) {
        self.available.lock().unwrap().insert(target_id.to_string());
    }

    pub fn restored(&self) -> Vec<String> {
        self.restored.lock().unwrap().clone()
    }
}

#[async_trait]
impl SnapshotProvider for FakeSnapshots {
    async fn has_snapshot(&self, _batch_id: DbId, target_id: &str) -> EngineResult<bool> {
        Ok(self.available.lock().unwrap().contains(target_id))
    }

    async fn restore(&self, _batch_id: DbId, target: &MigrationTarget) -> ApplyOutcome {
        self.restored.lock().unwrap().push(target.target_id.clone());
        ApplyOutcome::Applied(Applied {
            new_version: target.last_good_version.unwrap_or(0),
            duration_ms: 3,
        })
    }
}

/// Directory that records every filter it is asked to list.
pub struct RecordingDirectory {
    inner: Arc<InMemoryDirectory>,
    filters: Mutex<Vec<TargetFilter>>,
}

impl RecordingDirectory {
    pub fn new(inner: Arc<InMemoryDirectory>) -> Self {
        Self {
            inner,
            filters: Mutex::new(Vec::new()),
        }
    }

    pub fn filters(&self) -> Vec<TargetFilter> {
        self.filters.lock().unwrap().clone()
    }
}

#[async_trait]
impl TargetDirectory for RecordingDirectory {
    async fn list_targets(&self, filter: &TargetFilter) -> EngineResult<Vec<MigrationTarget>> {
        self.filters.lock().unwrap().push(filter.clone());
        self.inner.list_targets(filter).await
    }
}

// ---------------------------------------------------------------------------
// Fleet
// ---------------------------------------------------------------------------

pub fn target(
    id: &str,
    scope: Scope,
    region: Option<&str>,
    current: Option<SchemaVersion>,
    good: Option<SchemaVersion>,
) -> MigrationTarget {
    MigrationTarget {
        target_id: id.to_string(),
        scope,
        region: region.map(str::to_string),
        schema_name: id.replace('-', "_"),
        endpoint: format!("postgres://{}/{id}", region.unwrap_or("global")),
        current_version: current,
        last_good_version: good,
    }
}

/// One target per scope in region `eu` plus two tenants, all at version 1.
pub fn healthy_fleet() -> Vec<MigrationTarget> {
    vec![
        target("platform", Scope::PlatformCommon, None, Some(1), Some(1)),
        target("admin", Scope::Admin, None, Some(1), Some(1)),
        target("shared-eu", Scope::RegionalShared, Some("eu"), Some(1), Some(1)),
        target("analytics-eu", Scope::RegionalAnalytics, Some("eu"), Some(1), Some(1)),
        target("template-eu", Scope::TenantTemplate, Some("eu"), Some(1), Some(1)),
        target("tenant-a", Scope::Tenant, Some("eu"), Some(1), Some(1)),
        target("tenant-b", Scope::Tenant, Some("eu"), Some(1), Some(1)),
    ]
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

pub fn test_config() -> EngineConfig {
    EngineConfig {
        instance_id: "test-engine".to_string(),
        parallelism: 4,
        lock_ttl: Duration::from_secs(60),
        retry: RetryPolicy {
            max_attempts: 3,
            strategy: BackoffStrategy::Immediate,
            base_delay: Duration::ZERO,
            max_delay: Duration::from_millis(10),
            multiplier: 2.0,
        },
        breaker: CircuitBreakerConfig {
            failure_threshold: 5,
            cooldown: Duration::from_secs(60),
        },
        apply_timeout: Duration::from_secs(5),
        rollback_window: Duration::from_secs(24 * 3600),
        pause_poll_interval: Duration::from_millis(10),
    }
}

/// Engine wired over in-memory collaborators.
pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub directory: Arc<InMemoryDirectory>,
    pub listings: Arc<RecordingDirectory>,
    pub catalog: Arc<InMemoryCatalog>,
    pub config: EngineConfig,
    pub applier: Arc<ScriptedApplier>,
    pub snapshots: Arc<FakeSnapshots>,
    pub bus: Arc<EventBus>,
    pub locks: LockManager,
    pub orchestrator: Orchestrator,
    pub rollback: RollbackService,
}

impl Harness {
    pub fn new(fleet: Vec<MigrationTarget>, catalog: InMemoryCatalog) -> Self {
        Self::build(fleet, catalog, ScriptedApplier::default(), test_config())
    }

    pub fn build(
        fleet: Vec<MigrationTarget>,
        catalog: InMemoryCatalog,
        applier: ScriptedApplier,
        config: EngineConfig,
    ) -> Self {
        let store = Arc::new(MemoryStore::new());
        let directory = Arc::new(InMemoryDirectory::new(fleet));
        let listings = Arc::new(RecordingDirectory::new(directory.clone()));
        let catalog = Arc::new(catalog);
        let applier = Arc::new(applier);
        let snapshots = Arc::new(FakeSnapshots::default());
        let bus = Arc::new(EventBus::default());
        let locks = LockManager::new(store.clone());

        let orchestrator = Orchestrator::new(
            config.clone(),
            OrchestratorParts {
                store: store.clone(),
                locks: locks.clone(),
                directory: listings.clone(),
                catalog: catalog.clone(),
                applier: applier.clone(),
                progress: Arc::new(ProgressTracker::new()),
                bus: bus.clone(),
            },
        );
        let rollback = RollbackService::new(
            &config,
            RollbackParts {
                batches: store.clone(),
                rollbacks: store.clone(),
                locks: locks.clone(),
                directory: directory.clone(),
                catalog: catalog.clone(),
                applier: applier.clone(),
                snapshots: snapshots.clone(),
                bus: bus.clone(),
            },
        );

        Self {
            store,
            directory,
            listings,
            catalog,
            config,
            applier,
            snapshots,
            bus,
            locks,
            orchestrator,
            rollback,
        }
    }
}

impl Harness {
    /// Another engine instance over the same store and collaborators, with
    /// its own progress tracker.
    pub fn peer(&self, instance_id: &str) -> Orchestrator {
        let mut config = self.config.clone();
        config.instance_id = instance_id.to_string();
        Orchestrator::new(
            config,
            OrchestratorParts {
                store: self.store.clone(),
                locks: self.locks.clone(),
                directory: self.directory.clone(),
                catalog: self.catalog.clone(),
                applier: self.applier.clone(),
                progress: Arc::new(ProgressTracker::new()),
                bus: self.bus.clone(),
            },
        )
    }
}

pub fn request(scope: ScopeRequest) -> CreateBatch {
    CreateBatch {
        requested_scope: scope,
        dry_run: false,
        initiated_by: "ops@example.com".to_string(),
        metadata: None,
    }
}
