//! The hash-table registry primitive (spec §4.2).
//!
//! A thin, typed wrapper over [`dashmap::DashMap`] that gives every
//! registry in the object graph (sessions by id, ctf_trace by subpath,
//! relay_index by sequence number, viewer_stream by handle) the same four
//! operations the spec requires: read-protected lookup, unique insertion,
//! removal by handle, and tolerant iteration.
//!
//! `DashMap` shards its internal table into independently-locked buckets,
//! so a lookup or insert on one shard never blocks a concurrent operation
//! on another — the practical, dependency-backed equivalent of "reads
//! never take a blocking exclusive lock against writers" for the shard in
//! question. Per-shard locks are held only for the duration of the map
//! access, never across an entity's own `.lock`, so the ordering in spec
//! §5 is unaffected.

use std::hash::Hash;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::refcount::Refcounted;

pub struct Registry<K, V> {
    table: DashMap<K, Arc<Refcounted<V>>>,
}

impl<K, V> Default for Registry<K, V>
where
    K: Eq + Hash + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> Registry<K, V>
where
    K: Eq + Hash + Clone,
{
    pub fn new() -> Self {
        Self {
            table: DashMap::new(),
        }
    }

    /// Look up `key` under the read protection and attempt
    /// `get_unless_zero` on the returned entity. A `None` result covers
    /// both "absent" and "found but tearing down" — the spec treats both
    /// as "not found".
    pub fn lookup(&self, key: &K) -> Option<Arc<Refcounted<V>>> {
        let handle = self.table.get(key)?.clone();
        if handle.get_unless_zero() {
            Some(handle)
        } else {
            None
        }
    }

    /// Atomically insert `value` under `key` if no entry is present.
    /// On a concurrent-create race, returns the entry that won the race
    /// (without touching its refcount — callers must `get_unless_zero` it
    /// themselves, since the table's own reference doesn't speak for
    /// whether the caller's view of it is still live).
    pub fn insert_unique(
        &self,
        key: K,
        value: Arc<Refcounted<V>>,
    ) -> Result<Arc<Refcounted<V>>, Arc<Refcounted<V>>> {
        match self.table.entry(key) {
            Entry::Occupied(occupied) => Err(occupied.get().clone()),
            Entry::Vacant(vacant) => {
                vacant.insert(value.clone());
                Ok(value)
            }
        }
    }

    /// Remove `key`'s entry, but only if it still points at `handle`. This
    /// is the "removal by node handle, never by key" the spec requires: a
    /// release racing a fresh insert under the same key must not evict the
    /// new entry.
    pub fn remove_handle(&self, key: &K, handle: &Arc<Refcounted<V>>) {
        self.table.remove_if(key, |_, v| Arc::ptr_eq(v, handle));
    }

    /// Remove `key`'s entry if its logical refcount has already reached
    /// zero. For release paths that only have `&V` (no surviving `Arc` to
    /// compare by identity, e.g. a release callback running inside
    /// `Refcounted::put`): a dead entry can never become live again, so
    /// checking "is it dead" is as precise as `remove_handle`'s "is it
    /// this exact handle" without requiring the caller to keep a clone
    /// around past its own teardown.
    pub fn prune_dead(&self, key: &K) {
        self.table.remove_if(key, |_, v| v.current_count() == 0);
    }

    /// Safe iteration under the read protection. Tolerant of concurrent
    /// insertion and removal: the result is a stale-but-safe snapshot of
    /// whichever entries were visible shard-by-shard during the walk.
    pub fn iter(&self) -> impl Iterator<Item = Arc<Refcounted<V>>> + '_ {
        self.table.iter().map(|entry| entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_misses_when_absent() {
        let registry: Registry<u64, &'static str> = Registry::new();
        assert!(registry.lookup(&7).is_none());
    }

    #[test]
    fn insert_unique_reports_the_loser() {
        let registry: Registry<u64, u32> = Registry::new();
        let first = Refcounted::new(1);
        let second = Refcounted::new(2);

        assert!(registry.insert_unique(7, first.clone()).is_ok());
        let existing = registry
            .insert_unique(7, second)
            .expect_err("second insert under the same key must lose");
        assert!(Arc::ptr_eq(&existing, &first));
    }

    #[test]
    fn lookup_fails_once_entity_is_torn_down() {
        let registry: Registry<u64, u32> = Registry::new();
        let entity = Refcounted::new(1);
        registry.insert_unique(7, entity.clone()).unwrap();

        // Drop the table's own logical reference (simulating teardown
        // racing a concurrent reader).
        entity.put(|_| {});

        assert!(registry.lookup(&7).is_none());
    }

    #[test]
    fn remove_handle_does_not_evict_a_fresher_insert() {
        let registry: Registry<u64, u32> = Registry::new();
        let stale = Refcounted::new(1);
        registry.insert_unique(7, stale.clone()).unwrap();

        // Simulate: stale's release races a fresh create-or-get for the
        // same key. The fresh row wins the table slot first...
        registry.table.remove(&7);
        let fresh = Refcounted::new(2);
        registry.insert_unique(7, fresh.clone()).unwrap();

        // ...then the stale row's release callback runs and must not
        // touch the fresh entry.
        registry.remove_handle(&7, &stale);
        assert!(registry.lookup(&7).is_some());
    }

    #[test]
    fn iter_sees_inserted_entries() {
        let registry: Registry<u64, u32> = Registry::new();
        registry.insert_unique(1, Refcounted::new(10)).unwrap();
        registry.insert_unique(2, Refcounted::new(20)).unwrap();
        let total: u32 = registry.iter().map(|e| **e).sum();
        assert_eq!(total, 30);
    }
}
