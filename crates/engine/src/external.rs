//! Collaborators the engine consumes but does not own: the target
//! directory, the script catalog, the apply primitive and the snapshot
//! provider.
//!
//! Postgres-backed implementations read the externally owned
//! `migration_targets` / `migration_scripts` tables; [`RunnerClient`]
//! talks to the script-runner service over HTTP. The `InMemory*` types
//! serve local dry runs and tests.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use strata_core::retry::{Applied, ApplyOutcome};
use strata_core::scope::Scope;
use strata_core::target::{MigrationTarget, TargetFilter};
use strata_core::types::{DbId, SchemaVersion};
use strata_db::repositories::{ScriptRepo, TargetRepo};
use strata_db::DbPool;
use tokio::sync::RwLock;

use crate::error::{EngineError, EngineResult};

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// Read-only view of the fleet. Each listed target carries its
/// last-known-good version.
#[async_trait]
pub trait TargetDirectory: Send + Sync {
    async fn list_targets(&self, filter: &TargetFilter) -> EngineResult<Vec<MigrationTarget>>;
}

#[async_trait]
pub trait ScriptCatalog: Send + Sync {
    /// Highest published version for `scope`, `None` if it has no scripts.
    async fn latest_version(&self, scope: Scope) -> EngineResult<Option<SchemaVersion>>;

    /// Whether every script in `(after, up_to]` ships an undo script.
    async fn has_undo(&self, scope: Scope, after: Option<SchemaVersion>, up_to: SchemaVersion) -> EngineResult<bool>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Up,
    Down,
}

/// The ordered scripts one apply call runs against a target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScriptSet {
    pub scope: Scope,
    /// Version the target is at before the call.
    pub from: Option<SchemaVersion>,
    /// Version the target ends at.
    pub to: SchemaVersion,
    pub direction: Direction,
}

/// Apply one versioned script set to one target. Faults are reported as
/// values so the retry layer can tell retryable from fatal.
#[async_trait]
pub trait ScriptApplier: Send + Sync {
    async fn apply(&self, target: &MigrationTarget, scripts: &ScriptSet, dry_run: bool) -> ApplyOutcome;
}

#[async_trait]
pub trait SnapshotProvider: Send + Sync {
    /// Whether a pre-migration snapshot of `target_id` was taken for `batch_id`.
    async fn has_snapshot(&self, batch_id: DbId, target_id: &str) -> EngineResult<bool>;

    async fn restore(&self, batch_id: DbId, target: &MigrationTarget) -> ApplyOutcome;
}

// ---------------------------------------------------------------------------
// Postgres-backed directory and catalog
// ---------------------------------------------------------------------------

pub struct PgTargetDirectory {
    pool: DbPool,
}

impl PgTargetDirectory {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TargetDirectory for PgTargetDirectory {
    async fn list_targets(&self, filter: &TargetFilter) -> EngineResult<Vec<MigrationTarget>> {
        let rows = TargetRepo::list(&self.pool, filter).await?;
        let mut targets = Vec::with_capacity(rows.len());
        for row in rows {
            targets.push(MigrationTarget::try_from(row)?);
        }
        Ok(targets)
    }
}

pub struct PgScriptCatalog {
    pool: DbPool,
}

impl PgScriptCatalog {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ScriptCatalog for PgScriptCatalog {
    async fn latest_version(&self, scope: Scope) -> EngineResult<Option<SchemaVersion>> {
        Ok(ScriptRepo::latest_version(&self.pool, scope.as_str()).await?)
    }

    async fn has_undo(&self, scope: Scope, after: Option<SchemaVersion>, up_to: SchemaVersion) -> EngineResult<bool> {
        let scripts = ScriptRepo::list_range(&self.pool, scope.as_str(), after, up_to).await?;
        Ok(!scripts.is_empty() && scripts.iter().all(|s| s.has_undo))
    }
}

// ---------------------------------------------------------------------------
// Script runner over HTTP
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct ApplyRequest<'a> {
    target_id: &'a str,
    scope: Scope,
    schema_name: &'a str,
    endpoint: &'a str,
    from_version: Option<SchemaVersion>,
    to_version: SchemaVersion,
    direction: Direction,
    dry_run: bool,
}

#[derive(Debug, Deserialize)]
struct ApplyResponse {
    new_version: SchemaVersion,
    #[serde(default)]
    duration_ms: Option<i64>,
}

/// Map a runner reply onto an apply outcome. Throttling and server errors
/// are worth retrying; any other client error means the request itself
/// is wrong.
pub fn classify_response(status: u16, body: &str, elapsed_ms: i64) -> ApplyOutcome {
    match status {
        200..=299 => match serde_json::from_str::<ApplyResponse>(body) {
            Ok(reply) => ApplyOutcome::Applied(Applied {
                new_version: reply.new_version,
                duration_ms: reply.duration_ms.unwrap_or(elapsed_ms),
            }),
            Err(e) => ApplyOutcome::Fatal(format!("Malformed runner response: {e}")),
        },
        408 | 429 | 500..=599 => ApplyOutcome::Retryable(format!("Runner returned HTTP {status}: {body}")),
        _ => ApplyOutcome::Fatal(format!("Runner rejected request with HTTP {status}: {body}")),
    }
}

/// HTTP client for the script-runner service.
///
/// - `POST {base}/apply` runs a script set.
/// - `GET {base}/snapshots/{batch}/{target}` answers 200 or 404.
/// - `POST {base}/snapshots/{batch}/{target}/restore` restores one.
pub struct RunnerClient {
    client: reqwest::Client,
    base_url: String,
}

impl RunnerClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> EngineResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| EngineError::Runner(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn post(&self, url: &str, body: Option<&ApplyRequest<'_>>) -> ApplyOutcome {
        let started = Instant::now();
        let mut request = self.client.post(url);
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = match request.send().await {
            Ok(response) => response,
            Err(e) if e.is_builder() => return ApplyOutcome::Fatal(format!("Invalid runner request: {e}")),
            Err(e) => return ApplyOutcome::Retryable(format!("Runner unreachable: {e}")),
        };
        let status = response.status().as_u16();
        let body = match response.text().await {
            Ok(text) => text,
            Err(e) => return ApplyOutcome::Retryable(format!("Failed to read runner response: {e}")),
        };
        classify_response(status, &body, started.elapsed().as_millis() as i64)
    }
}

#[async_trait]
impl ScriptApplier for RunnerClient {
    async fn apply(&self, target: &MigrationTarget, scripts: &ScriptSet, dry_run: bool) -> ApplyOutcome {
        let body = ApplyRequest {
            target_id: &target.target_id,
            scope: scripts.scope,
            schema_name: &target.schema_name,
            endpoint: &target.endpoint,
            from_version: scripts.from,
            to_version: scripts.to,
            direction: scripts.direction,
            dry_run,
        };
        self.post(&format!("{}/apply", self.base_url), Some(&body)).await
    }
}

#[async_trait]
impl SnapshotProvider for RunnerClient {
    async fn has_snapshot(&self, batch_id: DbId, target_id: &str) -> EngineResult<bool> {
        let url = format!("{}/snapshots/{batch_id}/{target_id}", self.base_url);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| EngineError::Runner(e.to_string()))?;
        match response.status().as_u16() {
            200..=299 => Ok(true),
            404 => Ok(false),
            other => Err(EngineError::Runner(format!(
                "Snapshot lookup returned HTTP {other}"
            ))),
        }
    }

    async fn restore(&self, batch_id: DbId, target: &MigrationTarget) -> ApplyOutcome {
        let url = format!(
            "{}/snapshots/{batch_id}/{}/restore",
            self.base_url, target.target_id
        );
        self.post(&url, None).await
    }
}

// ---------------------------------------------------------------------------
// In-memory
// ---------------------------------------------------------------------------

/// Directory over a fixed, replaceable fleet.
#[derive(Default)]
pub struct InMemoryDirectory {
    targets: RwLock<Vec<MigrationTarget>>,
}

impl InMemoryDirectory {
    pub fn new(targets: Vec<MigrationTarget>) -> Self {
        Self {
            targets: RwLock::new(targets),
        }
    }

    /// Insert or replace a target by id.
    pub async fn upsert(&self, target: MigrationTarget) {
        let mut targets = self.targets.write().await;
        match targets.iter_mut().find(|t| t.target_id == target.target_id) {
            Some(existing) => *existing = target,
            None => targets.push(target),
        }
    }
}

#[async_trait]
impl TargetDirectory for InMemoryDirectory {
    async fn list_targets(&self, filter: &TargetFilter) -> EngineResult<Vec<MigrationTarget>> {
        let targets = self.targets.read().await;
        let mut matched: Vec<MigrationTarget> =
            targets.iter().filter(|t| filter.matches(t)).cloned().collect();
        matched.sort_by(|a, b| a.target_id.cmp(&b.target_id));
        Ok(matched)
    }
}

/// Catalog of `(version, has_undo)` entries per scope.
#[derive(Debug, Default)]
pub struct InMemoryCatalog {
    scripts: HashMap<Scope, Vec<(SchemaVersion, bool)>>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_script(mut self, scope: Scope, version: SchemaVersion, has_undo: bool) -> Self {
        let entries = self.scripts.entry(scope).or_default();
        entries.push((version, has_undo));
        entries.sort_by_key(|(v, _)| *v);
        self
    }

    /// Same script range for every scope.
    pub fn uniform(latest: SchemaVersion, has_undo: bool) -> Self {
        Scope::ALL.into_iter().fold(Self::new(), |catalog, scope| {
            (1..=latest).fold(catalog, |c, v| c.with_script(scope, v, has_undo))
        })
    }
}

#[async_trait]
impl ScriptCatalog for InMemoryCatalog {
    async fn latest_version(&self, scope: Scope) -> EngineResult<Option<SchemaVersion>> {
        Ok(self
            .scripts
            .get(&scope)
            .and_then(|entries| entries.last().map(|(v, _)| *v)))
    }

    async fn has_undo(&self, scope: Scope, after: Option<SchemaVersion>, up_to: SchemaVersion) -> EngineResult<bool> {
        let lower = after.unwrap_or(0);
        let in_range: Vec<bool> = self
            .scripts
            .get(&scope)
            .map(|entries| {
                entries
                    .iter()
                    .filter(|(v, _)| *v > lower && *v <= up_to)
                    .map(|(_, undo)| *undo)
                    .collect()
            })
            .unwrap_or_default();
        Ok(!in_range.is_empty() && in_range.iter().all(|undo| *undo))
    }
}
