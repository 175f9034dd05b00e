//! Scoped delegation tokens with optional use caps.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::expiry::{bounded_seconds, sweep, Expirable};
use crate::ids::prefix;
use crate::impl_entity;
use crate::store::{newest_first, EntityStore};
use crate::text::{dedup_preserve_order, normalize_key, require};

/// Default token lifetime.
pub const DEFAULT_TTL_SECONDS: i64 = 3_600;
/// Minimum token lifetime.
pub const MIN_TTL_SECONDS: i64 = 60;
/// Maximum token lifetime.
pub const MAX_TTL_SECONDS: i64 = 86_400;
/// Largest accepted `max_uses`.
pub const MAX_USES_CAP: i64 = 100;

/// Scope that matches any requested scope.
pub const ANY_SCOPE: &str = "*";

/// Token lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DelegationStatus {
    /// Usable.
    Active,
    /// Revoked by the grantor.
    Revoked,
    /// Lifetime elapsed.
    Expired,
    /// Use cap reached.
    Exhausted,
}

impl DelegationStatus {
    /// Wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Revoked => "revoked",
            Self::Expired => "expired",
            Self::Exhausted => "exhausted",
        }
    }
}

/// A delegation from `grantor` to `delegate`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DelegationToken {
    /// Store-assigned id.
    pub id: String,
    /// Delegating principal.
    pub grantor: String,
    /// Receiving principal.
    pub delegate: String,
    /// Delegated scopes, lowercased, deduplicated.
    pub scopes: Vec<String>,
    /// 0 means unlimited.
    pub max_uses: u32,
    /// Successful consumptions.
    pub uses: u32,
    /// Status.
    pub status: DelegationStatus,
    /// Lifetime.
    pub ttl_seconds: i64,
    /// Issue time.
    pub created_at: DateTime<Utc>,
    /// Last mutation time.
    pub updated_at: DateTime<Utc>,
    /// Deadline.
    pub expires_at: DateTime<Utc>,
}

impl_entity!(DelegationToken, prefix::DELEGATION);

impl DelegationToken {
    /// Whether `scope` is delegated.
    pub fn allows(&self, scope: &str) -> bool {
        self.scopes.iter().any(|s| s == ANY_SCOPE || s == scope)
    }
}

impl Expirable for DelegationToken {
    fn expires_at(&self) -> Option<DateTime<Utc>> {
        Some(self.expires_at)
    }

    fn is_expirable(&self) -> bool {
        self.status == DelegationStatus::Active
    }

    fn expire(&mut self, now: DateTime<Utc>) {
        tracing::info!(token_id = %self.id, "delegation token expired");
        self.status = DelegationStatus::Expired;
        self.updated_at = now;
    }
}

/// Issue request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DelegationInput {
    /// Delegating principal.
    pub grantor: String,
    /// Receiving principal.
    pub delegate: String,
    /// At least one scope.
    #[serde(default)]
    pub scopes: Vec<String>,
    /// 0 means the default.
    #[serde(default)]
    pub ttl_seconds: i64,
    /// 0 means unlimited.
    #[serde(default)]
    pub max_uses: i64,
}

/// Delegation token store.
#[derive(Debug)]
pub struct DelegationStore {
    tokens: EntityStore<DelegationToken>,
    clock: Arc<dyn Clock>,
}

impl DelegationStore {
    /// Create an empty store.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            tokens: EntityStore::new(),
            clock,
        }
    }

    /// Issue a token.
    pub fn issue(&self, input: DelegationInput) -> Result<DelegationToken> {
        let grantor = require(&input.grantor, "grantor")?;
        let delegate = require(&input.delegate, "delegate")?;
        if grantor.eq_ignore_ascii_case(&delegate) {
            return Err(Error::validation("delegate must differ from grantor"));
        }
        let scopes = dedup_preserve_order(input.scopes.iter().map(|s| normalize_key(s)));
        if scopes.is_empty() {
            return Err(Error::validation("at least one scope is required"));
        }
        let ttl_seconds = bounded_seconds(
            input.ttl_seconds,
            DEFAULT_TTL_SECONDS,
            MIN_TTL_SECONDS,
            MAX_TTL_SECONDS,
            "ttl_seconds",
        )?;
        if !(0..=MAX_USES_CAP).contains(&input.max_uses) {
            return Err(Error::validation(format!("max_uses must be between 0 and {MAX_USES_CAP}")));
        }

        let now = self.clock.now();
        let token = self.tokens.create(DelegationToken {
            id: String::new(),
            grantor,
            delegate,
            scopes,
            max_uses: input.max_uses as u32,
            uses: 0,
            status: DelegationStatus::Active,
            ttl_seconds,
            created_at: now,
            updated_at: now,
            expires_at: now + Duration::seconds(ttl_seconds),
        });
        tracing::info!(token_id = %token.id, delegate = %token.delegate, "delegation token issued");
        Ok(token)
    }

    /// Spend one use of the token for `scope`.
    pub fn consume(&self, id: &str, scope: &str) -> Result<DelegationToken> {
        let scope = normalize_key(scope);
        let now = self.clock.now();
        self.tokens.write(|table| {
            sweep(table.values_mut(), now);
            let token = table
                .get_mut(id)
                .ok_or_else(|| Error::not_found(format!("delegation token \"{}\" not found", id.trim())))?;
            if token.status != DelegationStatus::Active {
                return Err(Error::conflict(format!("delegation token is {}", token.status.as_str())));
            }
            if !token.allows(&scope) {
                return Err(Error::conflict(format!("scope \"{scope}\" is not delegated")));
            }
            token.uses += 1;
            token.updated_at = now;
            if token.max_uses > 0 && token.uses >= token.max_uses {
                token.status = DelegationStatus::Exhausted;
                tracing::info!(token_id = %token.id, uses = token.uses, "delegation token exhausted");
            }
            Ok(token.clone())
        })
    }

    /// Revoke an active token.
    pub fn revoke(&self, id: &str) -> Result<DelegationToken> {
        let now = self.clock.now();
        self.tokens.write(|table| {
            sweep(table.values_mut(), now);
            let token = table
                .get_mut(id)
                .ok_or_else(|| Error::not_found(format!("delegation token \"{}\" not found", id.trim())))?;
            if token.status != DelegationStatus::Active {
                return Err(Error::conflict(format!("delegation token is {}", token.status.as_str())));
            }
            token.status = DelegationStatus::Revoked;
            token.updated_at = now;
            tracing::info!(token_id = %token.id, "delegation token revoked");
            Ok(token.clone())
        })
    }

    /// Look up a token after an expiry sweep.
    pub fn get(&self, id: &str) -> Option<DelegationToken> {
        let now = self.clock.now();
        self.tokens.write(|table| {
            sweep(table.values_mut(), now);
            table.get(id).cloned()
        })
    }

    /// All tokens, newest first, after an expiry sweep.
    pub fn list(&self) -> Vec<DelegationToken> {
        let now = self.clock.now();
        let mut items: Vec<DelegationToken> = self.tokens.write(|table| {
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
    use crate::error::ErrorKind;
    use chrono::TimeZone;

    fn setup() -> (DelegationStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap()));
        (DelegationStore::new(clock.clone()), clock)
    }

    fn input(max_uses: i64) -> DelegationInput {
        DelegationInput {
            grantor: "alice".to_string(),
            delegate: "bob".to_string(),
            scopes: vec!["Deploy".to_string(), "deploy".to_string(), "read".to_string()],
            ttl_seconds: 0,
            max_uses,
        }
    }

    #[test]
    fn test_issue_normalizes() {
        let (store, _) = setup();
        let t = store.issue(input(0)).unwrap();
        assert_eq!(t.scopes, vec!["deploy", "read"]);
        assert_eq!(t.ttl_seconds, DEFAULT_TTL_SECONDS);
        assert_eq!(t.expires_at - t.created_at, Duration::seconds(3600));
        assert_eq!(t.id, "delegation-1");
    }

    #[test]
    fn test_bounds() {
        let (store, _) = setup();
        let mut i = input(101);
        assert_eq!(store.issue(i.clone()).unwrap_err().to_string(), "max_uses must be between 0 and 100");
        i.max_uses = 100;
        i.ttl_seconds = 59;
        assert_eq!(store.issue(i.clone()).unwrap_err().to_string(), "ttl_seconds must be >= 60");
        i.ttl_seconds = 86_401;
        assert!(store.issue(i.clone()).is_err());
        i.ttl_seconds = 86_400;
        assert!(store.issue(i).is_ok());

        let mut same = input(0);
        same.delegate = "ALICE".to_string();
        assert!(store.issue(same).is_err());
    }

    #[test]
    fn test_consume_until_exhausted() {
        let (store, _) = setup();
        let t = store.issue(input(2)).unwrap();
        assert_eq!(store.consume(&t.id, "deploy").unwrap().uses, 1);
        let last = store.consume(&t.id, "READ").unwrap();
        assert_eq!(last.status, DelegationStatus::Exhausted);

        let err = store.consume(&t.id, "deploy").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert_eq!(err.to_string(), "delegation token is exhausted");
    }

    #[test]
    fn test_scope_must_be_delegated() {
        let (store, _) = setup();
        let t = store.issue(input(0)).unwrap();
        assert_eq!(store.consume(&t.id, "admin").unwrap_err().kind(), ErrorKind::Conflict);
        assert_eq!(store.get(&t.id).unwrap().uses, 0);

        let mut wildcard = input(0);
        wildcard.scopes = vec!["*".to_string()];
        let w = store.issue(wildcard).unwrap();
        assert!(store.consume(&w.id, "anything").is_ok());
    }

    #[test]
    fn test_lazy_expiry_and_revoke() {
        let (store, clock) = setup();
        let a = store.issue(input(0)).unwrap();
        let b = store.issue(input(0)).unwrap();
        store.revoke(&b.id).unwrap();
        assert!(store.revoke(&b.id).is_err());

        clock.advance_secs(3600);
        assert_eq!(store.get(&a.id).unwrap().status, DelegationStatus::Expired);
        assert_eq!(store.consume(&a.id, "deploy").unwrap_err().to_string(), "delegation token is expired");
        assert_eq!(store.get(&b.id).unwrap().status, DelegationStatus::Revoked);
        assert_eq!(store.consume("delegation-9", "deploy").unwrap_err().kind(), ErrorKind::NotFound);
        assert_eq!(store.list()[0].id, b.id);
    }
}
