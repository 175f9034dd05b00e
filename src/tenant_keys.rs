//! Per-tenant key records and the tenant boundary check.
//!
//! Keys carry no material. A record names the tenant, a version, and a
//! fingerprint derived from `tenant|version|created_at`; rotation retires the
//! active record and issues `version + 1`.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::canonical::{format_rfc3339_nano, prefixed_sha256};
use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::ids::prefix;
use crate::impl_entity;
use crate::store::{newest_first, EntityStore, Table};
use crate::text::normalize_key;

/// Key lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyStatus {
    /// Current key for the tenant.
    Active,
    /// Superseded by rotation.
    Retired,
}

/// A versioned key record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TenantKey {
    /// Store-assigned id.
    pub id: String,
    /// Lowercased tenant.
    pub tenant: String,
    /// 1-based version.
    pub version: u32,
    /// Status.
    pub status: KeyStatus,
    /// `sha256:` over `tenant|version|created_at`.
    pub fingerprint: String,
    /// Issue time.
    pub created_at: DateTime<Utc>,
    /// Last mutation time.
    pub updated_at: DateTime<Utc>,
    /// Retirement time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retired_at: Option<DateTime<Utc>>,
}

impl_entity!(TenantKey, prefix::TENANT_KEY);

/// Why a boundary check allowed or denied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BoundaryReason {
    /// Every check passed.
    Ok,
    /// No key with the given id.
    KeyNotFound,
    /// Key belongs to a different tenant than the request.
    TenantMismatchRequest,
    /// Key belongs to a different tenant than the execution context.
    TenantMismatchContext,
    /// Key has been retired.
    KeyNotActive,
}

/// Boundary check input.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BoundaryCheck {
    /// Tenant named by the request.
    pub request_tenant: String,
    /// Key presented.
    pub key_id: String,
    /// Tenant of the execution context.
    pub context_tenant: String,
}

/// Boundary check outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundaryDecision {
    /// Whether the request may proceed.
    pub allowed: bool,
    /// Specific reason.
    pub reason: BoundaryReason,
}

impl BoundaryDecision {
    fn deny(reason: BoundaryReason) -> Self {
        Self { allowed: false, reason }
    }
}

fn fingerprint(tenant: &str, version: u32, created_at: &DateTime<Utc>) -> String {
    let material = format!("{tenant}|{version}|{}", format_rfc3339_nano(created_at));
    prefixed_sha256(material.as_bytes())
}

fn active_in<'a>(table: &'a Table<TenantKey>, tenant: &str) -> Option<&'a TenantKey> {
    table.find(|k| k.tenant == tenant && k.status == KeyStatus::Active)
}

/// Tenant key registry.
#[derive(Debug)]
pub struct TenantKeyStore {
    keys: EntityStore<TenantKey>,
    clock: Arc<dyn Clock>,
}

impl TenantKeyStore {
    /// Create an empty registry.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            keys: EntityStore::new(),
            clock,
        }
    }

    fn issue(table: &mut Table<TenantKey>, tenant: String, version: u32, now: DateTime<Utc>) -> TenantKey {
        table.insert_new(TenantKey {
            id: String::new(),
            fingerprint: fingerprint(&tenant, version, &now),
            tenant,
            version,
            status: KeyStatus::Active,
            created_at: now,
            updated_at: now,
            retired_at: None,
        })
    }

    /// Return the tenant's active key, issuing version 1 when none exists.
    pub fn ensure_key(&self, tenant: &str) -> Result<TenantKey> {
        let tenant = normalize_key(tenant);
        if tenant.is_empty() {
            return Err(Error::validation("tenant is required"));
        }
        let now = self.clock.now();
        Ok(self.keys.write(|table| {
            if let Some(key) = active_in(table, &tenant) {
                return key.clone();
            }
            let version = table
                .values()
                .filter(|k| k.tenant == tenant)
                .map(|k| k.version)
                .max()
                .unwrap_or(0)
                + 1;
            let key = Self::issue(table, tenant, version, now);
            tracing::info!(key_id = %key.id, tenant = %key.tenant, version, "tenant key issued");
            key
        }))
    }

    /// Retire the active key and issue the next version.
    pub fn rotate(&self, tenant: &str) -> Result<TenantKey> {
        let tenant = normalize_key(tenant);
        if tenant.is_empty() {
            return Err(Error::validation("tenant is required"));
        }
        let now = self.clock.now();
        self.keys.write(|table| {
            let current = active_in(table, &tenant)
                .map(|k| k.id.clone())
                .ok_or_else(|| Error::not_found(format!("no active key for tenant \"{tenant}\"")))?;
            let version = match table.get_mut(&current) {
                Some(old) => {
                    old.status = KeyStatus::Retired;
                    old.retired_at = Some(now);
                    old.updated_at = now;
                    old.version + 1
                }
                None => return Err(Error::not_found(format!("tenant key \"{current}\" not found"))),
            };
            let key = Self::issue(table, tenant, version, now);
            tracing::info!(key_id = %key.id, retired = %current, version, "tenant key rotated");
            Ok(key)
        })
    }

    /// The tenant's active key.
    pub fn active_key(&self, tenant: &str) -> Option<TenantKey> {
        let tenant = normalize_key(tenant);
        self.keys.read(|table| active_in(table, &tenant).cloned())
    }

    /// Look up by id.
    pub fn get(&self, id: &str) -> Option<TenantKey> {
        self.keys.get(id)
    }

    /// Keys newest first, optionally limited to one tenant.
    pub fn list(&self, tenant: Option<&str>) -> Vec<TenantKey> {
        let tenant = tenant.map(normalize_key).filter(|t| !t.is_empty());
        let mut items: Vec<TenantKey> = self.keys.read(|table| {
            table
                .values()
                .filter(|k| tenant.as_ref().map_or(true, |t| &k.tenant == t))
                .cloned()
                .collect()
        });
        items.sort_by(newest_first);
        items
    }

    /// Decide whether `key_id` may be used for `request_tenant` in
    /// `context_tenant`. An empty context tenant skips the context check.
    pub fn check_boundary(&self, check: &BoundaryCheck) -> BoundaryDecision {
        let Some(key) = self.keys.get(&check.key_id) else {
            return BoundaryDecision::deny(BoundaryReason::KeyNotFound);
        };
        let decision = if key.tenant != normalize_key(&check.request_tenant) {
            BoundaryDecision::deny(BoundaryReason::TenantMismatchRequest)
        } else if !check.context_tenant.trim().is_empty()
            && key.tenant != normalize_key(&check.context_tenant)
        {
            BoundaryDecision::deny(BoundaryReason::TenantMismatchContext)
        } else if key.status != KeyStatus::Active {
            BoundaryDecision::deny(BoundaryReason::KeyNotActive)
        } else {
            BoundaryDecision { allowed: true, reason: BoundaryReason::Ok }
        };
        if !decision.allowed {
            tracing::warn!(key_id = %key.id, reason = ?decision.reason, "tenant boundary denied");
        }
        decision
    }
}
