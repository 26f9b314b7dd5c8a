//! Dependency resolution: turns a scope request plus a directory snapshot
//! into an ordered [`ExecutionPlan`].
//!
//! Each dependency level becomes one wave. Waves run strictly in order;
//! targets inside a wave are independent and sorted by id so plans are
//! deterministic.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::error::CoreError;
use crate::scope::{Scope, ScopeRequest};
use crate::target::MigrationTarget;

/// A set of targets that may be migrated concurrently.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Wave {
    pub index: usize,
    pub level: usize,
    pub targets: Vec<MigrationTarget>,
}

impl Wave {
    pub fn scopes(&self) -> impl Iterator<Item = Scope> + '_ {
        self.targets.iter().map(|t| t.scope)
    }
}

/// Ordered sequence of waves. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutionPlan {
    request: ScopeRequest,
    waves: Vec<Wave>,
}

impl ExecutionPlan {
    pub fn request(&self) -> &ScopeRequest {
        &self.request
    }

    pub fn waves(&self) -> &[Wave] {
        &self.waves
    }

    pub fn total_targets(&self) -> usize {
        self.waves.iter().map(|w| w.targets.len()).sum()
    }

    /// Scopes present in waves strictly after `wave_index`.
    pub fn scopes_after(&self, wave_index: usize) -> Vec<Scope> {
        let mut scopes: Vec<Scope> = self
            .waves
            .iter()
            .skip(wave_index + 1)
            .flat_map(|w| w.scopes())
            .collect();
        scopes.sort();
        scopes.dedup();
        scopes
    }

    /// Check that no wave contains a scope whose prerequisite appears in a
    /// later wave.
    pub fn is_topologically_ordered(&self) -> bool {
        self.waves.iter().enumerate().all(|(i, wave)| {
            let later = self.scopes_after(i);
            wave.scopes().all(|scope| {
                scope
                    .all_prerequisites()
                    .iter()
                    .all(|prereq| !later.contains(prereq))
            })
        })
    }
}

/// Select the targets a request covers.
fn select<'a>(
    request: &ScopeRequest,
    fleet: &'a [MigrationTarget],
) -> Result<Vec<&'a MigrationTarget>, CoreError> {
    let selected: Vec<&MigrationTarget> = match request {
        ScopeRequest::All => fleet.iter().collect(),
        ScopeRequest::Scope(scope) => fleet.iter().filter(|t| t.scope == *scope).collect(),
        ScopeRequest::Region(region) => fleet
            .iter()
            .filter(|t| t.region.as_deref() == Some(region.as_str()))
            .collect(),
        ScopeRequest::Target(id) => {
            let target = fleet
                .iter()
                .find(|t| &t.target_id == id)
                .ok_or_else(|| CoreError::Validation(format!("Unknown target: \"{id}\"")))?;
            vec![target]
        }
    };

    if selected.is_empty() {
        return Err(CoreError::Validation(format!(
            "Scope request \"{request}\" matched no targets"
        )));
    }
    Ok(selected)
}

/// Resolve `request` against the full `fleet` snapshot.
///
/// Fails with [`CoreError::UnresolvableScope`] when a selected target needs
/// a prerequisite scope that is neither part of the plan nor has any target
/// with a last-known-good version.
pub fn resolve_plan(
    request: &ScopeRequest,
    fleet: &[MigrationTarget],
) -> Result<ExecutionPlan, CoreError> {
    let selected = select(request, fleet)?;

    for target in &selected {
        for prereq in target.scope.all_prerequisites() {
            let planned = selected.iter().any(|s| s.satisfies(prereq, target));
            let proven = fleet
                .iter()
                .any(|f| f.has_succeeded() && f.satisfies(prereq, target));
            if !planned && !proven {
                return Err(CoreError::UnresolvableScope {
                    scope: format!("{} ({})", target.scope, target.target_id),
                    missing: prereq.to_string(),
                });
            }
        }
    }

    let mut levels: BTreeMap<usize, Vec<MigrationTarget>> = BTreeMap::new();
    for target in selected {
        levels
            .entry(target.scope.level())
            .or_default()
            .push(target.clone());
    }

    let waves = levels
        .into_iter()
        .enumerate()
        .map(|(index, (level, mut targets))| {
            targets.sort_by(|a, b| a.target_id.cmp(&b.target_id));
            Wave {
                index,
                level,
                targets,
            }
        })
        .collect();

    Ok(ExecutionPlan {
        request: request.clone(),
        waves,
    })
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::target::fixtures::target;

    fn fleet() -> Vec<MigrationTarget> {
        vec![
            target("platform", Scope::PlatformCommon, None, Some(10)),
            target("admin", Scope::Admin, None, Some(4)),
            target("shared-eu", Scope::RegionalShared, Some("eu"), Some(7)),
            target("analytics-eu", Scope::RegionalAnalytics, Some("eu"), Some(2)),
            target("template-eu", Scope::TenantTemplate, Some("eu"), Some(5)),
            target("tenant-b", Scope::Tenant, Some("eu"), Some(5)),
            target("tenant-a", Scope::Tenant, Some("eu"), Some(5)),
        ]
    }

    #[test]
    fn all_scope_produces_one_wave_per_level() {
        let plan = resolve_plan(&ScopeRequest::All, &fleet()).unwrap();
        assert_eq!(plan.waves().len(), 5);
        assert_eq!(plan.total_targets(), 7);
        assert_eq!(plan.waves()[2].targets.len(), 2);
        assert!(plan.is_topologically_ordered());
    }

    #[test]
    fn targets_within_wave_sorted_by_id() {
        let plan = resolve_plan(&ScopeRequest::Scope(Scope::Tenant), &fleet()).unwrap();
        let ids: Vec<&str> = plan.waves()[0]
            .targets
            .iter()
            .map(|t| t.target_id.as_str())
            .collect();
        assert_eq!(ids, ["tenant-a", "tenant-b"]);
    }

    #[test]
    fn region_request_skips_fleet_wide_targets() {
        let plan = resolve_plan(&ScopeRequest::Region("eu".into()), &fleet()).unwrap();
        assert_eq!(plan.total_targets(), 5);
        assert_eq!(plan.waves()[0].level, 2);
        assert_eq!(plan.waves()[0].index, 0);
    }

    #[test]
    fn new_tenant_without_proven_regional_shared_is_unresolvable() {
        let fleet = vec![
            target("platform", Scope::PlatformCommon, None, Some(10)),
            target("admin", Scope::Admin, None, Some(4)),
            target("shared-us", Scope::RegionalShared, Some("us"), None),
            target("template-us", Scope::TenantTemplate, Some("us"), Some(1)),
            target("tenant-new", Scope::Tenant, Some("us"), None),
        ];
        let err = resolve_plan(&ScopeRequest::Target("tenant-new".into()), &fleet).unwrap_err();
        assert_matches!(err, CoreError::UnresolvableScope { ref missing, .. } if missing == "regional-shared");
    }

    #[test]
    fn prerequisite_in_plan_satisfies_dependency() {
        let fleet = vec![
            target("platform", Scope::PlatformCommon, None, None),
            target("admin", Scope::Admin, None, None),
        ];
        let plan = resolve_plan(&ScopeRequest::All, &fleet).unwrap();
        assert_eq!(plan.waves().len(), 2);
        assert_eq!(plan.scopes_after(0), vec![Scope::Admin]);
    }

    #[test]
    fn unknown_target_rejected() {
        let err = resolve_plan(&ScopeRequest::Target("nope".into()), &fleet()).unwrap_err();
        assert_matches!(err, CoreError::Validation(_));
    }

    #[test]
    fn empty_selection_rejected() {
        let err = resolve_plan(&ScopeRequest::Region("ap".into()), &fleet()).unwrap_err();
        assert_matches!(err, CoreError::Validation(_));
    }

    /// Generated fleets always resolve to a topological order.
    #[test]
    fn generated_fleets_resolve_topologically() {
        let mut seed: u64 = 0x9e37_79b9_7f4a_7c15;
        let mut next = || {
            seed ^= seed << 13;
            seed ^= seed >> 7;
            seed ^= seed << 17;
            seed
        };

        for round in 0..200 {
            let mut fleet = vec![
                target("platform", Scope::PlatformCommon, None, Some(1)),
                target("admin", Scope::Admin, None, Some(1)),
            ];
            let count = 1 + (next() % 12) as usize;
            for i in 0..count {
                let scope = Scope::ALL[(next() % 6) as usize];
                let region = if scope.level() >= 2 { Some("eu") } else { None };
                fleet.push(target(&format!("t{round}-{i}"), scope, region, Some(1)));
            }
            fleet.push(target("shared-eu", Scope::RegionalShared, Some("eu"), Some(1)));
            fleet.push(target("template-eu", Scope::TenantTemplate, Some("eu"), Some(1)));

            let plan = resolve_plan(&ScopeRequest::All, &fleet).unwrap();
            assert!(plan.is_topologically_ordered());
            assert_eq!(plan.total_targets(), fleet.len());
            let levels: Vec<usize> = plan.waves().iter().map(|w| w.level).collect();
            assert!(levels.windows(2).all(|w| w[0] < w[1]));
        }
    }
}
