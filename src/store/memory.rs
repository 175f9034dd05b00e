//! In-memory keyed-entity store.

use std::cmp::Ordering;

use parking_lot::RwLock;

use super::{newest_first, Entity, Table};

/// Thread-safe keyed store over a [`Table`].
///
/// One `parking_lot::RwLock` guards the whole table. Mutations hold the writer
/// lock for their full duration, so a failed closure that returns early before
/// touching the table leaves no partial state.
#[derive(Debug)]
pub struct EntityStore<E: Entity> {
    inner: RwLock<Table<E>>,
}

impl<E: Entity> EntityStore<E> {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Table::new()),
        }
    }

    /// Insert a new entity and return its stored clone.
    pub fn create(&self, entity: E) -> E {
        self.inner.write().insert_new(entity)
    }

    /// Natural-key upsert. Returns the stored clone and whether it was created.
    pub fn upsert_by<K, F>(&self, entity: E, key: F) -> (E, bool)
    where
        K: PartialEq,
        F: Fn(&E) -> K,
    {
        self.inner.write().upsert_by(entity, key)
    }

    /// Clone of the entity with this id.
    pub fn get(&self, id: &str) -> Option<E> {
        self.inner.read().get(id).cloned()
    }

    /// All entities, newest first.
    pub fn list(&self) -> Vec<E> {
        self.list_sorted_by(newest_first)
    }

    /// All entities sorted by `cmp`. Sorting happens after the lock is released.
    pub fn list_sorted_by<F>(&self, cmp: F) -> Vec<E>
    where
        F: FnMut(&E, &E) -> Ordering,
    {
        let mut items: Vec<E> = self.inner.read().values().cloned().collect();
        items.sort_by(cmp);
        items
    }

    /// Remove by id and report whether anything was removed.
    pub fn delete(&self, id: &str) -> bool {
        self.inner.write().remove(id).is_some()
    }

    /// Number of entities.
    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    /// Run `f` under the reader lock.
    pub fn read<R>(&self, f: impl FnOnce(&Table<E>) -> R) -> R {
        f(&self.inner.read())
    }

    /// Run `f` under the writer lock.
    pub fn write<R>(&self, f: impl FnOnce(&mut Table<E>) -> R) -> R {
        f(&mut self.inner.write())
    }
}

impl<E: Entity> Default for EntityStore<E> {
    fn default() -> Self {
        Self::new()
    }
}
