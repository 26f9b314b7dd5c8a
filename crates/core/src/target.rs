//! Migration targets as supplied by the external target directory.

use serde::{Deserialize, Serialize};

use crate::lock::resource_key;
use crate::scope::Scope;
use crate::types::SchemaVersion;

/// One schema-bearing endpoint subject to migration.
///
/// Owned by the target directory; the orchestrator only reads it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationTarget {
    pub target_id: String,
    pub scope: Scope,
    /// `None` for fleet-wide targets (platform-common, admin).
    pub region: Option<String>,
    pub schema_name: String,
    /// Connection reference handed to the script runner.
    pub endpoint: String,
    /// Currently applied version; `None` for a freshly provisioned target.
    pub current_version: Option<SchemaVersion>,
    /// Last version known to have applied cleanly.
    pub last_good_version: Option<SchemaVersion>,
}

impl MigrationTarget {
    /// Lock key guarding this target (`scope:target-id`).
    pub fn resource_key(&self) -> String {
        resource_key(self.scope, &self.target_id)
    }

    /// Whether this target has ever completed a migration.
    pub fn has_succeeded(&self) -> bool {
        self.last_good_version.is_some()
    }

    /// Whether this target can stand in for `prerequisite` when `dependent`
    /// is resolved. Regional prerequisites must come from the dependent's
    /// own region when it has one.
    pub fn satisfies(&self, prerequisite: Scope, dependent: &MigrationTarget) -> bool {
        if self.scope != prerequisite {
            return false;
        }
        if prerequisite.is_regional() {
            if let Some(region) = &dependent.region {
                return self.region.as_ref() == Some(region);
            }
        }
        true
    }
}

/// Filter passed to the target directory.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetFilter {
    pub scope: Option<Scope>,
    pub region: Option<String>,
    pub target_id: Option<String>,
}

impl TargetFilter {
    pub fn matches(&self, target: &MigrationTarget) -> bool {
        self.scope.is_none_or(|s| s == target.scope)
            && self
                .region
                .as_ref()
                .is_none_or(|r| target.region.as_ref() == Some(r))
            && self
                .target_id
                .as_ref()
                .is_none_or(|id| &target.target_id == id)
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    pub fn target(id: &str, scope: Scope, region: Option<&str>, good: Option<i64>) -> MigrationTarget {
        MigrationTarget {
            target_id: id.to_string(),
            scope,
            region: region.map(str::to_string),
            schema_name: id.replace('-', "_"),
            endpoint: format!("postgres://db/{id}"),
            current_version: good,
            last_good_version: good,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::target;
    use super::*;

    #[test]
    fn resource_key_is_scope_colon_id() {
        let t = target("tenant-42", Scope::Tenant, Some("eu"), None);
        assert_eq!(t.resource_key(), "tenant:tenant-42");
    }

    #[test]
    fn regional_prerequisite_must_match_region() {
        let tenant = target("tenant-1", Scope::Tenant, Some("eu"), None);
        let eu = target("shared-eu", Scope::RegionalShared, Some("eu"), Some(3));
        let us = target("shared-us", Scope::RegionalShared, Some("us"), Some(3));
        assert!(eu.satisfies(Scope::RegionalShared, &tenant));
        assert!(!us.satisfies(Scope::RegionalShared, &tenant));
    }

    #[test]
    fn fleet_wide_prerequisite_ignores_region() {
        let tenant = target("tenant-1", Scope::Tenant, Some("eu"), None);
        let admin = target("admin", Scope::Admin, None, Some(1));
        assert!(admin.satisfies(Scope::Admin, &tenant));
    }

    #[test]
    fn filter_matches_on_all_set_fields() {
        let t = target("tenant-7", Scope::Tenant, Some("us"), None);
        let filter = TargetFilter {
            scope: Some(Scope::Tenant),
            region: Some("us".into()),
            target_id: None,
        };
        assert!(filter.matches(&t));
        assert!(TargetFilter::default().matches(&t));
        let other_region = TargetFilter {
            region: Some("eu".into()),
            ..Default::default()
        };
        assert!(!other_region.matches(&t));
    }
}
