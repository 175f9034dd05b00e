//! Exclusive run leases.
//!
//! At most one active lease exists per run. Holders renew before the deadline
//! or lose the lease to the next lazy sweep.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::expiry::{bounded_seconds, sweep, Expirable};
use crate::ids::prefix;
use crate::impl_entity;
use crate::store::{newest_first, EntityStore, Table};
use crate::text::require;

/// Default lease lifetime.
pub const DEFAULT_TTL_SECONDS: i64 = 300;
/// Minimum lease lifetime.
pub const MIN_TTL_SECONDS: i64 = 15;
/// Maximum lease lifetime.
pub const MAX_TTL_SECONDS: i64 = 3_600;

/// Lease lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LeaseStatus {
    /// Held.
    Active,
    /// Given up by the holder.
    Released,
    /// Not renewed in time.
    Expired,
}

/// A lease on one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunLease {
    /// Store-assigned id.
    pub id: String,
    /// Leased run.
    pub run_id: String,
    /// Current holder.
    pub holder: String,
    /// Status.
    pub status: LeaseStatus,
    /// Lifetime granted on acquire and on every renew.
    pub ttl_seconds: i64,
    /// Number of renewals.
    pub renewals: u32,
    /// Acquire time.
    pub created_at: DateTime<Utc>,
    /// Last mutation time.
    pub updated_at: DateTime<Utc>,
    /// Deadline.
    pub expires_at: DateTime<Utc>,
}

impl_entity!(RunLease, prefix::LEASE);

impl Expirable for RunLease {
    fn expires_at(&self) -> Option<DateTime<Utc>> {
        Some(self.expires_at)
    }

    fn is_expirable(&self) -> bool {
        self.status == LeaseStatus::Active
    }

    fn expire(&mut self, now: DateTime<Utc>) {
        tracing::info!(lease_id = %self.id, run_id = %self.run_id, "lease expired");
        self.status = LeaseStatus::Expired;
        self.updated_at = now;
    }
}

/// Acquire request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LeaseInput {
    /// Run to lease.
    pub run_id: String,
    /// Acquiring holder.
    pub holder: String,
    /// 0 means the default.
    #[serde(default)]
    pub ttl_seconds: i64,
}

/// Run lease store.
#[derive(Debug)]
pub struct LeaseStore {
    leases: EntityStore<RunLease>,
    clock: Arc<dyn Clock>,
}

fn held_lease<'a>(table: &'a mut Table<RunLease>, id: &str, holder: &str) -> Result<&'a mut RunLease> {
    let lease = table
        .get_mut(id)
        .ok_or_else(|| Error::not_found(format!("lease \"{}\" not found", id.trim())))?;
    if lease.status != LeaseStatus::Active {
        return Err(Error::conflict("lease not active"));
    }
    if lease.holder != holder.trim() {
        return Err(Error::conflict("lease held by another holder"));
    }
    Ok(lease)
}

impl LeaseStore {
    /// Create an empty store.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            leases: EntityStore::new(),
            clock,
        }
    }

    /// Take the lease on a run.
    pub fn acquire(&self, input: LeaseInput) -> Result<RunLease> {
        let run_id = require(&input.run_id, "run_id")?;
        let holder = require(&input.holder, "holder")?;
        let ttl_seconds = bounded_seconds(
            input.ttl_seconds,
            DEFAULT_TTL_SECONDS,
            MIN_TTL_SECONDS,
            MAX_TTL_SECONDS,
            "ttl_seconds",
        )?;
        let now = self.clock.now();
        self.leases.write(|table| {
            sweep(table.values_mut(), now);
            if let Some(active) = table.find(|l| l.run_id == run_id && l.status == LeaseStatus::Active) {
                return Err(Error::conflict(format!(
                    "run \"{run_id}\" already leased by \"{}\"",
                    active.holder
                )));
            }
            let lease = table.insert_new(RunLease {
                id: String::new(),
                run_id,
                holder,
                status: LeaseStatus::Active,
                ttl_seconds,
                renewals: 0,
                created_at: now,
                updated_at: now,
                expires_at: now + Duration::seconds(ttl_seconds),
            });
            tracing::info!(lease_id = %lease.id, run_id = %lease.run_id, holder = %lease.holder, "lease acquired");
            Ok(lease)
        })
    }

    /// Extend the lease by its ttl from now.
    pub fn renew(&self, id: &str, holder: &str) -> Result<RunLease> {
        let now = self.clock.now();
        self.leases.write(|table| {
            sweep(table.values_mut(), now);
            let lease = held_lease(table, id, holder)?;
            lease.expires_at = now + Duration::seconds(lease.ttl_seconds);
            lease.renewals += 1;
            lease.updated_at = now;
            tracing::debug!(lease_id = %lease.id, renewals = lease.renewals, "lease renewed");
            Ok(lease.clone())
        })
    }

    /// Give up the lease.
    pub fn release(&self, id: &str, holder: &str) -> Result<RunLease> {
        let now = self.clock.now();
        self.leases.write(|table| {
            sweep(table.values_mut(), now);
            let lease = held_lease(table, id, holder)?;
            lease.status = LeaseStatus::Released;
            lease.updated_at = now;
            tracing::info!(lease_id = %lease.id, run_id = %lease.run_id, "lease released");
            Ok(lease.clone())
        })
    }

    /// Look up after an expiry sweep.
    pub fn get(&self, id: &str) -> Option<RunLease> {
        let now = self.clock.now();
        self.leases.write(|table| {
            sweep(table.values_mut(), now);
            table.get(id).cloned()
        })
    }

    /// All leases, newest first, after an expiry sweep.
    pub fn list(&self) -> Vec<RunLease> {
        let now = self.clock.now();
        let mut items: Vec<RunLease> = self.leases.write(|table| {
            sweep(table.values_mut(), now);
            table.values().cloned().collect()
        });
        items.sort_by(newest_first);
        items
    }
}
