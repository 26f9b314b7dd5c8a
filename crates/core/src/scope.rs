//! Migration scopes and their fixed dependency partial order.
//!
//! ```text
//! platform-common -> admin -> { regional-shared, regional-analytics }
//!                 -> tenant-template -> tenant
//! ```
//!
//! Only `regional-shared` is a hard prerequisite of `tenant-template`;
//! `regional-analytics` shares its dependency level but nothing downstream
//! needs it to succeed.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// A category of targets sharing a dependency level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Scope {
    PlatformCommon,
    Admin,
    RegionalShared,
    RegionalAnalytics,
    TenantTemplate,
    Tenant,
}

impl Scope {
    /// Every scope, in dependency order.
    pub const ALL: [Scope; 6] = [
        Scope::PlatformCommon,
        Scope::Admin,
        Scope::RegionalShared,
        Scope::RegionalAnalytics,
        Scope::TenantTemplate,
        Scope::Tenant,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Scope::PlatformCommon => "platform-common",
            Scope::Admin => "admin",
            Scope::RegionalShared => "regional-shared",
            Scope::RegionalAnalytics => "regional-analytics",
            Scope::TenantTemplate => "tenant-template",
            Scope::Tenant => "tenant",
        }
    }

    /// Dependency level; scopes on the same level share a wave.
    pub fn level(self) -> usize {
        match self {
            Scope::PlatformCommon => 0,
            Scope::Admin => 1,
            Scope::RegionalShared | Scope::RegionalAnalytics => 2,
            Scope::TenantTemplate => 3,
            Scope::Tenant => 4,
        }
    }

    /// Scopes that must have succeeded before this one may run.
    pub fn direct_prerequisites(self) -> &'static [Scope] {
        match self {
            Scope::PlatformCommon => &[],
            Scope::Admin => &[Scope::PlatformCommon],
            Scope::RegionalShared | Scope::RegionalAnalytics => &[Scope::Admin],
            Scope::TenantTemplate => &[Scope::RegionalShared],
            Scope::Tenant => &[Scope::TenantTemplate],
        }
    }

    /// Transitive closure of [`direct_prerequisites`](Self::direct_prerequisites),
    /// nearest first.
    pub fn all_prerequisites(self) -> Vec<Scope> {
        let mut out = Vec::new();
        let mut frontier: Vec<Scope> = self.direct_prerequisites().to_vec();
        while let Some(scope) = frontier.pop() {
            if !out.contains(&scope) {
                out.push(scope);
                frontier.extend_from_slice(scope.direct_prerequisites());
            }
        }
        out
    }

    /// Whether a failure in `self` must stop `downstream` from running.
    pub fn is_hard_prerequisite_of(self, downstream: Scope) -> bool {
        downstream.all_prerequisites().contains(&self)
    }

    /// Regional scopes are satisfied per region rather than fleet-wide.
    pub fn is_regional(self) -> bool {
        matches!(self, Scope::RegionalShared | Scope::RegionalAnalytics)
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Scope {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Scope::ALL
            .into_iter()
            .find(|scope| scope.as_str() == s)
            .ok_or_else(|| CoreError::Validation(format!("Unknown scope: \"{s}\"")))
    }
}

// ---------------------------------------------------------------------------
// ScopeRequest
// ---------------------------------------------------------------------------

/// What a caller asked to migrate.
///
/// Persisted on the batch row in its textual form (`all`, `scope:tenant`,
/// `region:eu-west`, `target:tenant-42`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ScopeRequest {
    All,
    Scope(Scope),
    Region(String),
    Target(String),
}

impl fmt::Display for ScopeRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScopeRequest::All => f.write_str("all"),
            ScopeRequest::Scope(scope) => write!(f, "scope:{scope}"),
            ScopeRequest::Region(region) => write!(f, "region:{region}"),
            ScopeRequest::Target(target) => write!(f, "target:{target}"),
        }
    }
}

impl FromStr for ScopeRequest {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "all" {
            return Ok(ScopeRequest::All);
        }
        let (kind, value) = s
            .split_once(':')
            .ok_or_else(|| CoreError::Validation(format!("Malformed scope request: \"{s}\"")))?;
        if value.is_empty() {
            return Err(CoreError::Validation(format!(
                "Scope request \"{s}\" has an empty value"
            )));
        }
        match kind {
            "scope" => Ok(ScopeRequest::Scope(value.parse()?)),
            "region" => Ok(ScopeRequest::Region(value.to_string())),
            "target" => Ok(ScopeRequest::Target(value.to_string())),
            other => Err(CoreError::Validation(format!(
                "Unknown scope request kind: \"{other}\""
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn levels_follow_dependency_order() {
        for scope in Scope::ALL {
            for prereq in scope.all_prerequisites() {
                assert!(prereq.level() < scope.level(), "{prereq} before {scope}");
            }
        }
    }

    #[test]
    fn tenant_transitively_requires_regional_shared() {
        let prereqs = Scope::Tenant.all_prerequisites();
        assert_eq!(prereqs[0], Scope::TenantTemplate);
        assert!(prereqs.contains(&Scope::RegionalShared));
        assert!(prereqs.contains(&Scope::PlatformCommon));
        assert!(!prereqs.contains(&Scope::RegionalAnalytics));
    }

    #[test]
    fn analytics_is_not_hard_prerequisite_of_tenants() {
        assert!(!Scope::RegionalAnalytics.is_hard_prerequisite_of(Scope::TenantTemplate));
        assert!(Scope::RegionalShared.is_hard_prerequisite_of(Scope::Tenant));
        assert!(!Scope::Tenant.is_hard_prerequisite_of(Scope::Tenant));
    }

    #[test]
    fn scope_parses_from_kebab_case() {
        assert_eq!("regional-analytics".parse::<Scope>().unwrap(), Scope::RegionalAnalytics);
        assert!("tenants".parse::<Scope>().is_err());
    }

    #[test]
    fn scope_request_text_form_round_trips() {
        let requests = [
            ScopeRequest::All,
            ScopeRequest::Scope(Scope::TenantTemplate),
            ScopeRequest::Region("eu-west".into()),
            ScopeRequest::Target("tenant-42".into()),
        ];
        for request in requests {
            let parsed: ScopeRequest = request.to_string().parse().unwrap();
            assert_eq!(parsed, request);
        }
    }

    #[test]
    fn scope_request_rejects_garbage() {
        assert!("everything".parse::<ScopeRequest>().is_err());
        assert!("target:".parse::<ScopeRequest>().is_err());
        assert!("zone:eu".parse::<ScopeRequest>().is_err());
    }
}
