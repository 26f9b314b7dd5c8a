//! Resource-lock keys and lease bounds.

use std::time::Duration;

use crate::scope::Scope;
use crate::types::{DbId, Timestamp};

/// Longest lease a holder may request. A crashed holder's lock heals itself
/// within this window.
pub const MAX_LOCK_TTL: Duration = Duration::from_secs(3600);

/// Shortest lease accepted.
pub const MIN_LOCK_TTL: Duration = Duration::from_secs(1);

/// Purpose recorded on per-target migration locks.
pub const PURPOSE_MIGRATION: &str = "migration";

/// Purpose recorded on rollback locks.
pub const PURPOSE_ROLLBACK: &str = "rollback";

/// Lock key for one migration target: `scope:target-id`.
pub fn resource_key(scope: Scope, target_id: &str) -> String {
    format!("{}:{target_id}", scope.as_str())
}

/// Lock key preventing two rollbacks of the same batch: `rollback:<batch-id>`.
pub fn rollback_key(batch_id: DbId) -> String {
    format!("rollback:{batch_id}")
}

/// Clamp a requested TTL into `[MIN_LOCK_TTL, MAX_LOCK_TTL]`.
pub fn bounded_ttl(requested: Duration) -> Duration {
    requested.clamp(MIN_LOCK_TTL, MAX_LOCK_TTL)
}

/// Expiry instant for a lease of `ttl` acquired at `now`.
pub fn expires_at(now: Timestamp, ttl: Duration) -> Timestamp {
    let ttl = bounded_ttl(ttl);
    now + chrono::Duration::milliseconds(ttl.as_millis() as i64)
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn keys_have_expected_shape() {
        assert_eq!(resource_key(Scope::Tenant, "target-42"), "tenant:target-42");
        assert_eq!(resource_key(Scope::PlatformCommon, "p"), "platform-common:p");
        assert_eq!(rollback_key(17), "rollback:17");
    }

    #[test]
    fn ttl_is_clamped() {
        assert_eq!(bounded_ttl(Duration::from_secs(7200)), MAX_LOCK_TTL);
        assert_eq!(bounded_ttl(Duration::ZERO), MIN_LOCK_TTL);
        assert_eq!(bounded_ttl(Duration::from_secs(90)), Duration::from_secs(90));
    }

    #[test]
    fn expiry_uses_bounded_ttl() {
        let now = chrono::Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let exp = expires_at(now, Duration::from_secs(10 * 3600));
        assert_eq!(exp - now, chrono::Duration::hours(1));
    }
}
