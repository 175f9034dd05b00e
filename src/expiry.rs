//! Lazy expiry for time-bounded entities.
//!
//! There is no background timer. Every store holding entities with an
//! `expires_at` calls [`sweep`] under its writer lock before it evaluates a
//! read or a mutation, so an entity past its deadline is observed as expired
//! by the very operation that first looks at it.

use chrono::{DateTime, Utc};

use crate::error::{Error, Result};

/// An entity that moves to a terminal state once its deadline passes.
pub trait Expirable {
    /// Deadline, if one is set.
    fn expires_at(&self) -> Option<DateTime<Utc>>;

    /// Whether the current state is one that expires (e.g. `active`, `pending`).
    fn is_expirable(&self) -> bool;

    /// Transition to the terminal expired state and stamp `updated_at`.
    fn expire(&mut self, now: DateTime<Utc>);

    /// Whether the entity should expire at `now`.
    fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.is_expirable() && self.expires_at().is_some_and(|at| at <= now)
    }
}

/// Expire every due entity. Returns how many transitioned.
pub fn sweep<'a, E, I>(items: I, now: DateTime<Utc>) -> usize
where
    E: Expirable + 'a,
    I: IntoIterator<Item = &'a mut E>,
{
    let mut expired = 0;
    for item in items {
        if item.is_due(now) {
            item.expire(now);
            expired += 1;
        }
    }
    expired
}

/// Apply a seconds-valued bound: 0 selects `default`, anything outside
/// `[min, max]` is a validation error naming `field`.
pub fn bounded_seconds(value: i64, default: i64, min: i64, max: i64, field: &str) -> Result<i64> {
    match value {
        0 => Ok(default),
        v if v < min => Err(Error::validation(format!("{field} must be >= {min}"))),
        v if v > max => Err(Error::validation(format!("{field} must be <= {max}"))),
        v => Ok(v),
    }
}
