// Copyright 2026 larder Project Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::{fmt::Debug, hash::Hash, sync::Arc};

use hashbrown::HashMap;
use parking_lot::{Condvar, Mutex};

enum Slot<T> {
    /// A loader is reading the value from the backing store.
    Loading(u64),
    Ready(Arc<T>),
}

struct Slots<K, T> {
    map: HashMap<K, Slot<T>>,
    tickets: u64,
}

/// Map from key to pinned cached value, loading on miss.
///
/// Concurrent misses on the same key wait for a single loader. If the key is unpinned while its load is in flight,
/// the loaded value is still handed to the caller but never inserted, so an invalidation is never undone by a
/// load that started before it.
///
/// The map lock is held only for map operations, never across a loader call.
pub struct BoundedCache<K, T> {
    slots: Mutex<Slots<K, T>>,
    loaded: Condvar,
}

impl<K, T> Debug for BoundedCache<K, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoundedCache").field("len", &self.len()).finish()
    }
}

impl<K, T> Default for BoundedCache<K, T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, T> BoundedCache<K, T> {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(Slots {
                map: HashMap::new(),
                tickets: 0,
            }),
            loaded: Condvar::new(),
        }
    }

    /// Number of pinned values, in-flight loads excluded.
    pub fn len(&self) -> usize {
        self.slots
            .lock()
            .map
            .values()
            .filter(|slot| matches!(slot, Slot::Ready(_)))
            .count()
    }

    /// Returns `true` if no value is pinned.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K, T> BoundedCache<K, T>
where
    K: Hash + Eq + Clone + Debug,
{
    /// Get the pinned value of the key, or load and pin it on miss.
    ///
    /// Returns `Ok(None)` if the loader finds nothing. Nothing is pinned in that case.
    pub fn pin<F, E>(&self, key: &K, loader: F) -> std::result::Result<Option<Arc<T>>, E>
    where
        F: FnOnce() -> std::result::Result<Option<T>, E>,
    {
        let ticket = {
            let mut slots = self.slots.lock();
            loop {
                match slots.map.get(key) {
                    Some(Slot::Ready(value)) => return Ok(Some(value.clone())),
                    Some(Slot::Loading(_)) => self.loaded.wait(&mut slots),
                    None => break,
                }
            }
            slots.tickets += 1;
            let ticket = slots.tickets;
            slots.map.insert(key.clone(), Slot::Loading(ticket));
            ticket
        };

        tracing::trace!("[cache]: load {key:?} on miss");
        let res = loader();

        let mut slots = self.slots.lock();
        let owned = matches!(slots.map.get(key), Some(Slot::Loading(t)) if *t == ticket);
        let res = match res {
            Ok(Some(value)) => {
                let value = Arc::new(value);
                if owned {
                    slots.map.insert(key.clone(), Slot::Ready(value.clone()));
                } else {
                    tracing::trace!("[cache]: {key:?} was unpinned while loading, skip insertion");
                }
                Ok(Some(value))
            }
            Ok(None) => {
                if owned {
                    slots.map.remove(key);
                }
                Ok(None)
            }
            Err(e) => {
                if owned {
                    slots.map.remove(key);
                }
                Err(e)
            }
        };
        drop(slots);
        self.loaded.notify_all();
        res
    }

    /// Remove the key and return its pinned value, if any.
    ///
    /// An in-flight load of the key is detached: its result will not be inserted.
    pub fn unpin(&self, key: &K) -> Option<Arc<T>> {
        let removed = self.slots.lock().map.remove(key);
        match removed {
            Some(Slot::Ready(value)) => Some(value),
            Some(Slot::Loading(_)) => {
                self.loaded.notify_all();
                None
            }
            None => None,
        }
    }

    /// Remove the key only if it still pins exactly the given value.
    pub fn unpin_exact(&self, key: &K, value: &Arc<T>) -> bool {
        let mut slots = self.slots.lock();
        match slots.map.get(key) {
            Some(Slot::Ready(v)) if Arc::ptr_eq(v, value) => {
                slots.map.remove(key);
                true
            }
            _ => false,
        }
    }

    /// Get the pinned value of the key without loading.
    pub fn get_if_pinned(&self, key: &K) -> Option<Arc<T>> {
        match self.slots.lock().map.get(key) {
            Some(Slot::Ready(value)) => Some(value.clone()),
            _ => None,
        }
    }

    /// Returns `true` if the key currently pins exactly the given value.
    pub fn is_pinned(&self, key: &K, value: &Arc<T>) -> bool {
        matches!(self.slots.lock().map.get(key), Some(Slot::Ready(v)) if Arc::ptr_eq(v, value))
    }

    /// Pin the value if the key is absent, waiting for an in-flight load of the key first.
    ///
    /// Returns the already pinned value if there is one, or `None` if the given value has been pinned.
    pub fn put_if_absent(&self, key: &K, value: Arc<T>) -> Option<Arc<T>> {
        let mut slots = self.slots.lock();
        loop {
            match slots.map.get(key) {
                Some(Slot::Ready(existing)) => return Some(existing.clone()),
                Some(Slot::Loading(_)) => self.loaded.wait(&mut slots),
                None => break,
            }
        }
        slots.map.insert(key.clone(), Slot::Ready(value));
        None
    }

    /// Unpin all values.
    pub fn clear(&self) -> Vec<Arc<T>> {
        let mut slots = self.slots.lock();
        let values = slots
            .map
            .drain()
            .filter_map(|(_, slot)| match slot {
                Slot::Ready(value) => Some(value),
                Slot::Loading(_) => None,
            })
            .collect();
        drop(slots);
        self.loaded.notify_all();
        values
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            Barrier,
        },
        thread,
        time::Duration,
    };

    use super::*;

    #[test]
    fn test_pin_unpin() {
        let cache = BoundedCache::<u64, String>::new();

        let v = cache.pin(&1, || Ok::<_, ()>(Some("one".to_string()))).unwrap().unwrap();
        assert_eq!(v.as_str(), "one");
        assert_eq!(cache.len(), 1);

        // Hit, the loader is not called.
        let hit = cache.pin(&1, || -> Result<Option<String>, ()> { unreachable!() }).unwrap().unwrap();
        assert!(Arc::ptr_eq(&v, &hit));
        assert!(cache.is_pinned(&1, &v));

        assert!(cache.pin(&2, || Ok::<_, ()>(None)).unwrap().is_none());
        assert!(cache.get_if_pinned(&2).is_none());

        assert_eq!(cache.pin(&3, || Err("boom")).unwrap_err(), "boom");
        assert_eq!(cache.len(), 1);

        let removed = cache.unpin(&1).unwrap();
        assert!(Arc::ptr_eq(&removed, &v));
        assert!(cache.unpin(&1).is_none());
        assert!(cache.is_empty());

        // A fresh value after unpin.
        let fresh = cache.pin(&1, || Ok::<_, ()>(Some("uno".to_string()))).unwrap().unwrap();
        assert!(!Arc::ptr_eq(&fresh, &v));
    }

    #[test]
    fn test_put_if_absent() {
        let cache = BoundedCache::<u64, u64>::new();
        assert!(cache.put_if_absent(&1, Arc::new(10)).is_none());
        let existing = cache.put_if_absent(&1, Arc::new(11)).unwrap();
        assert_eq!(*existing, 10);
        assert!(!cache.unpin_exact(&1, &Arc::new(10)));
        assert!(cache.unpin_exact(&1, &existing));
        assert!(cache.get_if_pinned(&1).is_none());
    }

    #[test]
    fn test_concurrent_miss_loads_once() {
        const THREADS: usize = 8;

        let cache = Arc::new(BoundedCache::<u64, u64>::new());
        let loads = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(THREADS));

        let handles = (0..THREADS)
            .map(|_| {
                let cache = cache.clone();
                let loads = loads.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    cache
                        .pin(&7, || {
                            loads.fetch_add(1, Ordering::SeqCst);
                            thread::sleep(Duration::from_millis(20));
                            Ok::<_, ()>(Some(49))
                        })
                        .unwrap()
                        .unwrap()
                })
            })
            .collect::<Vec<_>>();

        let values = handles.into_iter().map(|h| h.join().unwrap()).collect::<Vec<_>>();
        assert_eq!(loads.load(Ordering::SeqCst), 1);
        assert!(values.iter().all(|v| Arc::ptr_eq(v, &values[0])));
    }

    #[test]
    fn test_unpin_during_load_skips_insertion() {
        let cache = Arc::new(BoundedCache::<u64, u64>::new());
        let started = Arc::new(Barrier::new(2));
        let unpinned = Arc::new(Barrier::new(2));

        let handle = {
            let cache = cache.clone();
            let started = started.clone();
            let unpinned = unpinned.clone();
            thread::spawn(move || {
                cache
                    .pin(&1, || {
                        started.wait();
                        unpinned.wait();
                        Ok::<_, ()>(Some(1))
                    })
                    .unwrap()
                    .unwrap()
            })
        };

        started.wait();
        assert!(cache.unpin(&1).is_none());
        unpinned.wait();

        let stale = handle.join().unwrap();
        assert_eq!(*stale, 1);
        assert!(cache.get_if_pinned(&1).is_none());
        assert!(!cache.is_pinned(&1, &stale));
    }
}
