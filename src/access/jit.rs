//! Just-in-time access grants.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::expiry::{bounded_seconds, sweep, Expirable};
use crate::ids::prefix;
use crate::impl_entity;
use crate::store::{newest_first, EntityStore};
use crate::text::{normalize_key, require};

/// Default grant lifetime.
pub const DEFAULT_TTL_SECONDS: i64 = 900;
/// Minimum grant lifetime.
pub const MIN_TTL_SECONDS: i64 = 60;
/// Maximum grant lifetime.
pub const MAX_TTL_SECONDS: i64 = 3_600;

/// Grant lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JitStatus {
    /// In force.
    Active,
    /// Withdrawn early.
    Revoked,
    /// Lifetime elapsed.
    Expired,
}

/// Temporary elevation of `subject` on `resource`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JitGrant {
    /// Store-assigned id.
    pub id: String,
    /// Lowercased subject.
    pub subject: String,
    /// Lowercased resource.
    pub resource: String,
    /// Granted role.
    pub role: String,
    /// Justification.
    pub reason: String,
    /// Granting principal.
    pub granted_by: String,
    /// Status.
    pub status: JitStatus,
    /// Lifetime.
    pub ttl_seconds: i64,
    /// Grant time.
    pub created_at: DateTime<Utc>,
    /// Last mutation time.
    pub updated_at: DateTime<Utc>,
    /// Deadline.
    pub expires_at: DateTime<Utc>,
}

impl_entity!(JitGrant, prefix::JIT_GRANT);

impl Expirable for JitGrant {
    fn expires_at(&self) -> Option<DateTime<Utc>> {
        Some(self.expires_at)
    }

    fn is_expirable(&self) -> bool {
        self.status == JitStatus::Active
    }

    fn expire(&mut self, now: DateTime<Utc>) {
        tracing::info!(grant_id = %self.id, subject = %self.subject, "jit grant expired");
        self.status = JitStatus::Expired;
        self.updated_at = now;
    }
}

/// Grant request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JitGrantInput {
    /// Principal receiving access.
    pub subject: String,
    /// Resource accessed.
    pub resource: String,
    /// Role; defaults to `operator`.
    #[serde(default)]
    pub role: String,
    /// Justification.
    pub reason: String,
    /// Granting principal.
    pub granted_by: String,
    /// 0 means the default.
    #[serde(default)]
    pub ttl_seconds: i64,
}

/// JIT grant store.
#[derive(Debug)]
pub struct JitAccessStore {
    grants: EntityStore<JitGrant>,
    clock: Arc<dyn Clock>,
}

impl JitAccessStore {
    /// Create an empty store.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            grants: EntityStore::new(),
            clock,
        }
    }

    /// Open a grant.
    pub fn grant(&self, input: JitGrantInput) -> Result<JitGrant> {
        let subject = normalize_key(&require(&input.subject, "subject")?);
        let resource = normalize_key(&require(&input.resource, "resource")?);
        let reason = require(&input.reason, "reason")?;
        let granted_by = require(&input.granted_by, "granted_by")?;
        let role = match normalize_key(&input.role) {
            r if r.is_empty() => "operator".to_string(),
            r => r,
        };
        let ttl_seconds = bounded_seconds(
            input.ttl_seconds,
            DEFAULT_TTL_SECONDS,
            MIN_TTL_SECONDS,
            MAX_TTL_SECONDS,
            "ttl_seconds",
        )?;

        let now = self.clock.now();
        let grant = self.grants.create(JitGrant {
            id: String::new(),
            subject,
            resource,
            role,
            reason,
            granted_by,
            status: JitStatus::Active,
            ttl_seconds,
            created_at: now,
            updated_at: now,
            expires_at: now + Duration::seconds(ttl_seconds),
        });
        tracing::info!(
            grant_id = %grant.id,
            subject = %grant.subject,
            resource = %grant.resource,
            ttl_seconds,
            "jit grant opened"
        );
        Ok(grant)
    }

    /// Withdraw an active grant.
    pub fn revoke(&self, id: &str) -> Result<JitGrant> {
        let now = self.clock.now();
        self.grants.write(|table| {
            sweep(table.values_mut(), now);
            let grant = table
                .get_mut(id)
                .ok_or_else(|| Error::not_found(format!("jit grant \"{}\" not found", id.trim())))?;
            if grant.status != JitStatus::Active {
                return Err(Error::conflict("jit grant is not active"));
            }
            grant.status = JitStatus::Revoked;
            grant.updated_at = now;
            tracing::info!(grant_id = %grant.id, "jit grant revoked");
            Ok(grant.clone())
        })
    }

    /// Whether an active grant covers `subject` on `resource`.
    pub fn is_authorized(&self, subject: &str, resource: &str) -> bool {
        let (subject, resource) = (normalize_key(subject), normalize_key(resource));
        let now = self.clock.now();
        self.grants.write(|table| {
            sweep(table.values_mut(), now);
            table
                .find(|g| g.status == JitStatus::Active && g.subject == subject && g.resource == resource)
                .is_some()
        })
    }

    /// Look up after an expiry sweep.
    pub fn get(&self, id: &str) -> Option<JitGrant> {
        let now = self.clock.now();
        self.grants.write(|table| {
            sweep(table.values_mut(), now);
            table.get(id).cloned()
        })
    }

    /// All grants, newest first, after an expiry sweep.
    pub fn list(&self) -> Vec<JitGrant> {
        let now = self.clock.now();
        let mut items: Vec<JitGrant> = self.grants.write(|table| {
            sweep(table.values_mut(), now);
            table.values().cloned().collect()
        });
        items.sort_by(newest_first);
        items
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::TimeZone;

    fn setup() -> (JitAccessStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap()));
        (JitAccessStore::new(clock.clone()), clock)
    }

    fn input(ttl: i64) -> JitGrantInput {
        JitGrantInput {
            subject: "Alice".to_string(),
            resource: "db/prod".to_string(),
            role: String::new(),
            reason: "incident 42".to_string(),
            granted_by: "oncall-lead".to_string(),
            ttl_seconds: ttl,
        }
    }

    #[test]
    fn test_ttl_bounds() {
        let (store, _) = setup();
        assert_eq!(store.grant(input(0)).unwrap().ttl_seconds, 900);
        assert!(store.grant(input(60)).is_ok());
        assert!(store.grant(input(3600)).is_ok());
        assert_eq!(store.grant(input(59)).unwrap_err().to_string(), "ttl_seconds must be >= 60");
        assert_eq!(store.grant(input(3601)).unwrap_err().to_string(), "ttl_seconds must be <= 3600");
    }

    #[test]
    fn test_authorization_window() {
        let (store, clock) = setup();
        let g = store.grant(input(120)).unwrap();
        assert_eq!(g.role, "operator");
        assert!(store.is_authorized("alice", "DB/prod"));
        assert!(!store.is_authorized("bob", "db/prod"));

        clock.advance_secs(120);
        assert!(!store.is_authorized("alice", "db/prod"));
        assert_eq!(store.get(&g.id).unwrap().status, JitStatus::Expired);
    }

    #[test]
    fn test_revoke() {
        let (store, _) = setup();
        let g = store.grant(input(0)).unwrap();
        assert_eq!(store.revoke(&g.id).unwrap().status, JitStatus::Revoked);
        assert!(!store.is_authorized("alice", "db/prod"));
        assert!(store.revoke(&g.id).is_err());
        assert!(store.revoke("jit-grant-77").is_err());
        assert_eq!(store.list().len(), 1);
    }

    #[test]
    fn test_required_fields() {
        let (store, _) = setup();
        let mut i = input(0);
        i.reason = " ".to_string();
        assert_eq!(store.grant(i).unwrap_err().to_string(), "reason is required");
    }
}
