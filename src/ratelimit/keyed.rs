//! Concurrent per-key entry map shared by the in-memory stores.
//!
//! Locking is two-level: a store-wide `RwLock` guards the map structure
//! (insert, remove, iterate) and every entry carries its own `Mutex` guarding
//! its fields. The store lock is always taken before an entry lock and an
//! entry lock is never held while asking for the store lock. Request paths
//! release the store lock before touching the entry, so unrelated keys never
//! serialize on each other.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

/// An entry plus the marker set when the sweep unlinks it from the map.
#[derive(Debug)]
struct Slot<E> {
    evicted: bool,
    value: E,
}

type SharedSlot<E> = Arc<Mutex<Slot<E>>>;

/// Map of key to lazily created, individually locked entry.
#[derive(Debug)]
pub(crate) struct KeyedMap<E> {
    entries: RwLock<HashMap<String, SharedSlot<E>>>,
}

impl<E> KeyedMap<E> {
    pub(crate) fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Get the entry for `key`, creating it with `make` on first observation.
    ///
    /// The read lock serves the common hit. On a miss the write lock is taken
    /// and the map checked again, so two callers racing on a new key end up
    /// sharing one entry.
    fn get_or_create(&self, key: &str, make: &mut impl FnMut() -> E) -> (SharedSlot<E>, bool) {
        {
            let entries = self.entries.read();
            if let Some(slot) = entries.get(key) {
                return (Arc::clone(slot), false);
            }
        }

        let mut entries = self.entries.write();
        if let Some(slot) = entries.get(key) {
            return (Arc::clone(slot), false);
        }

        let slot = Arc::new(Mutex::new(Slot {
            evicted: false,
            value: make(),
        }));
        entries.insert(key.to_string(), Arc::clone(&slot));
        (slot, true)
    }

    /// Run `update` on the entry for `key` under the entry's own lock.
    ///
    /// Returns the closure's result and whether the entry was created by this
    /// call. If the sweep unlinked the entry between lookup and lock, the
    /// lookup is retried so the update never lands on an orphan.
    pub(crate) fn update<R>(
        &self,
        key: &str,
        mut make: impl FnMut() -> E,
        update: impl FnOnce(&mut E) -> R,
    ) -> (R, bool) {
        loop {
            let (slot, created) = self.get_or_create(key, &mut make);
            let mut guard = slot.lock();
            if guard.evicted {
                continue;
            }
            return (update(&mut guard.value), created);
        }
    }

    /// Read the entry for `key` without creating it.
    pub(crate) fn inspect<R>(&self, key: &str, read: impl FnOnce(&E) -> R) -> Option<R> {
        let slot = {
            let entries = self.entries.read();
            Arc::clone(entries.get(key)?)
        };
        let guard = slot.lock();
        Some(read(&guard.value))
    }

    /// Remove every entry for which `is_stale` returns true.
    ///
    /// Holds the store write lock for the whole pass and each entry's lock
    /// while judging it, so an in-flight update either finishes first or sees
    /// the eviction marker and retries.
    pub(crate) fn evict(&self, mut is_stale: impl FnMut(&E) -> bool) -> usize {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, slot| {
            let mut guard = slot.lock();
            if is_stale(&guard.value) {
                guard.evicted = true;
                false
            } else {
                true
            }
        });
        before - entries.len()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub(crate) fn clear(&self) {
        let mut entries = self.entries.write();
        for slot in entries.values() {
            slot.lock().evicted = true;
        }
        entries.clear();
    }
}

impl<E> Default for KeyedMap<E> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[test]
    fn test_update_creates_once() {
        let map: KeyedMap<u32> = KeyedMap::new();

        let (value, created) = map.update("a", || 10, |v| {
            *v += 1;
            *v
        });
        assert_eq!(value, 11);
        assert!(created);

        let (value, created) = map.update("a", || 10, |v| {
            *v += 1;
            *v
        });
        assert_eq!(value, 12);
        assert!(!created);
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_concurrent_first_access_creates_single_entry() {
        let map: Arc<KeyedMap<u32>> = Arc::new(KeyedMap::new());
        let creations = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..32)
            .map(|_| {
                let map = Arc::clone(&map);
                let creations = Arc::clone(&creations);
                thread::spawn(move || {
                    map.update(
                        "shared",
                        || {
                            creations.fetch_add(1, Ordering::SeqCst);
                            0
                        },
                        |v| *v += 1,
                    );
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(creations.load(Ordering::SeqCst), 1);
        assert_eq!(map.len(), 1);
        assert_eq!(map.inspect("shared", |v| *v), Some(32));
    }

    #[test]
    fn test_evict_removes_only_stale() {
        let map: KeyedMap<u32> = KeyedMap::new();
        map.update("old", || 1, |_| ());
        map.update("fresh", || 5, |_| ());

        let removed = map.evict(|v| *v < 3);
        assert_eq!(removed, 1);
        assert!(map.inspect("old", |_| ()).is_none());
        assert_eq!(map.inspect("fresh", |v| *v), Some(5));
    }

    #[test]
    fn test_update_after_evict_starts_fresh() {
        let map: KeyedMap<u32> = KeyedMap::new();
        map.update("k", || 7, |v| *v = 100);
        map.evict(|_| true);

        let (value, created) = map.update("k", || 7, |v| *v);
        assert!(created);
        assert_eq!(value, 7);
    }

    #[test]
    fn test_clear() {
        let map: KeyedMap<u32> = KeyedMap::new();
        map.update("a", || 0, |_| ());
        map.update("b", || 0, |_| ());
        map.clear();
        assert_eq!(map.len(), 0);
    }
}
