//! Keyed-entity storage.
//!
//! Every domain store is a typed wrapper around [`EntityStore`]: one
//! reader/writer lock over a [`Table`] of entities keyed by generated id.
//!
//! ## Contract
//!
//! - `create`: validate, normalize, allocate id, insert, return a clone
//! - `upsert_by`: as `create`, but replace an entity sharing the natural key,
//!   keeping its `id` and `created_at`
//! - `get`: look up by trimmed id, return a clone
//! - `list`: clone everything, release the lock, then sort
//! - `delete`: remove and report whether anything was removed
//!
//! Values cross the boundary by value. Nested maps and vectors are owned, so a
//! returned clone shares nothing with stored state.

pub mod memory;

use std::cmp::Ordering;
use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use crate::ids::IdAllocator;

pub use memory::EntityStore;

/// An entity held by a keyed store.
///
/// Implementations must guarantee that `Clone` is a deep copy, which holds for
/// any type built from owned data.
pub trait Entity: Clone + Send + Sync + 'static {
    /// Identifier prefix, e.g. `"wh"` for `wh-1`.
    const PREFIX: &'static str;

    /// The store-assigned identifier.
    fn id(&self) -> &str;

    /// Assign the identifier (store-internal).
    fn set_id(&mut self, id: String);

    /// Creation timestamp.
    fn created_at(&self) -> DateTime<Utc>;

    /// Overwrite the creation timestamp (used by upsert to preserve it).
    fn set_created_at(&mut self, at: DateTime<Utc>);
}

/// Implement [`Entity`] for a struct with `id: String` and
/// `created_at: DateTime<Utc>` fields.
#[macro_export]
macro_rules! impl_entity {
    ($ty:ty, $prefix:expr) => {
        impl $crate::store::Entity for $ty {
            const PREFIX: &'static str = $prefix;

            fn id(&self) -> &str {
                &self.id
            }

            fn set_id(&mut self, id: String) {
                self.id = id;
            }

            fn created_at(&self) -> chrono::DateTime<chrono::Utc> {
                self.created_at
            }

            fn set_created_at(&mut self, at: chrono::DateTime<chrono::Utc>) {
                self.created_at = at;
            }
        }
    };
}

/// Numeric tail of an identifier such as `wh-12`, used as a tie-breaker.
pub fn id_sequence(id: &str) -> i64 {
    id.rsplit('-')
        .next()
        .and_then(|n| n.parse().ok())
        .unwrap_or(0)
}

/// Default list order: newest `created_at` first, then newest id first.
pub fn newest_first<E: Entity>(a: &E, b: &E) -> Ordering {
    b.created_at()
        .cmp(&a.created_at())
        .then_with(|| id_sequence(b.id()).cmp(&id_sequence(a.id())))
}

/// Entities plus their id allocator, guarded together by one lock.
#[derive(Debug, Clone)]
pub struct Table<E: Entity> {
    ids: IdAllocator,
    rows: BTreeMap<String, E>,
}

impl<E: Entity> Table<E> {
    /// Create an empty table.
    pub fn new() -> Self {
        Self {
            ids: IdAllocator::new(E::PREFIX),
            rows: BTreeMap::new(),
        }
    }

    /// Assign a fresh id and insert. Returns a clone of the stored entity.
    pub fn insert_new(&mut self, mut entity: E) -> E {
        let id = self.ids.next_id();
        entity.set_id(id.clone());
        self.rows.insert(id, entity.clone());
        entity
    }

    /// Insert or replace the entity whose natural key equals `key(&entity)`.
    ///
    /// Returns the stored clone and `true` when a new entity was created.
    pub fn upsert_by<K, F>(&mut self, mut entity: E, key: F) -> (E, bool)
    where
        K: PartialEq,
        F: Fn(&E) -> K,
    {
        let wanted = key(&entity);
        let existing = self
            .rows
            .values()
            .find(|e| key(e) == wanted)
            .map(|e| (e.id().to_string(), e.created_at()));

        match existing {
            Some((id, created_at)) => {
                entity.set_id(id.clone());
                entity.set_created_at(created_at);
                self.rows.insert(id, entity.clone());
                (entity, false)
            }
            None => (self.insert_new(entity), true),
        }
    }

    /// Look up by id.
    pub fn get(&self, id: &str) -> Option<&E> {
        self.rows.get(id.trim())
    }

    /// Mutable lookup by id.
    pub fn get_mut(&mut self, id: &str) -> Option<&mut E> {
        self.rows.get_mut(id.trim())
    }

    /// First entity matching `pred`, in id order.
    pub fn find<P: Fn(&E) -> bool>(&self, pred: P) -> Option<&E> {
        self.rows.values().find(|e| pred(e))
    }

    /// Remove by id.
    pub fn remove(&mut self, id: &str) -> Option<E> {
        self.rows.remove(id.trim())
    }

    /// Iterate entities in id order.
    pub fn values(&self) -> impl Iterator<Item = &E> {
        self.rows.values()
    }

    /// Mutable iteration in id order.
    pub fn values_mut(&mut self) -> impl Iterator<Item = &mut E> {
        self.rows.values_mut()
    }

    /// Number of entities.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

impl<E: Entity> Default for Table<E> {
    fn default() -> Self {
        Self::new()
    }
}
