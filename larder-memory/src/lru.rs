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

use std::sync::Arc;

use larder_common::{strict_assert, Identity};

use crate::{element::Element, queue::EvictionQueue};

/// LRU over evictor elements, bounded by the evictor size.
///
/// An element is in the queue iff it is idle (no usage, no keep) and not stale. Elements in use are unlinked and
/// relinked at the most recently used end once they turn idle again.
///
/// All methods must be called with the evictor lock held.
#[derive(Debug)]
pub struct ElementLru<V> {
    queue: EvictionQueue<Arc<Element<V>>>,
    capacity: usize,
}

impl<V> ElementLru<V> {
    /// Create an empty LRU with the given capacity.
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: EvictionQueue::with_capacity(capacity),
            capacity,
        }
    }

    /// Target number of idle elements.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Update the capacity. Call [`ElementLru::evict`] afterwards to trim.
    pub fn set_capacity(&mut self, capacity: usize) {
        self.capacity = capacity;
    }

    /// Number of idle elements.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Returns `true` if no element is idle.
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Mark the element as used, unlinking it from the queue.
    pub fn acquire(&mut self, element: &Arc<Element<V>>) {
        let mut residency = element.residency();
        strict_assert!(!residency.stale);
        if let Some(token) = residency.position.take() {
            self.queue.remove(token);
        }
        residency.usage = residency.usage.max(0) + 1;
    }

    /// Drop one use of the element. Returns `true` if the element is idle afterwards.
    ///
    /// An idle element that is not stale is linked at the most recently used end.
    pub fn relinquish(&mut self, element: &Arc<Element<V>>) -> bool {
        let mut residency = element.residency();
        strict_assert!(residency.usage > 0);
        residency.usage -= 1;
        if !residency.is_idle() {
            return false;
        }
        if !residency.stale && residency.position.is_none() {
            residency.position = Some(self.queue.push_front(element.clone()));
        }
        true
    }

    /// Mark the element as recently used without taking a use.
    ///
    /// A freshly loaded element joins the queue. An idle element moves to the most recently used end.
    pub fn touch(&mut self, element: &Arc<Element<V>>) {
        let mut residency = element.residency();
        if residency.usage < 0 {
            residency.usage = 0;
        }
        if !residency.is_idle() || residency.stale {
            return;
        }
        match residency.position {
            Some(token) if self.queue.move_to_front(token) => {}
            _ => residency.position = Some(self.queue.push_front(element.clone())),
        }
    }

    /// Pin the element explicitly.
    pub fn keep(&mut self, element: &Arc<Element<V>>) {
        let mut residency = element.residency();
        strict_assert!(!residency.stale);
        if let Some(token) = residency.position.take() {
            self.queue.remove(token);
        }
        if residency.usage < 0 {
            residency.usage = 0;
        }
        residency.keep += 1;
    }

    /// Drop one explicit pin. Returns `false` if the element is not kept.
    ///
    /// The element is linked at the most recently used end once the last pin is dropped and it is idle.
    pub fn release(&mut self, element: &Arc<Element<V>>) -> bool {
        let mut residency = element.residency();
        if residency.keep == 0 {
            return false;
        }
        residency.keep -= 1;
        if residency.is_idle() && !residency.stale && residency.position.is_none() {
            residency.position = Some(self.queue.push_front(element.clone()));
        }
        true
    }

    /// Mark the element stale and unlink it.
    ///
    /// The element will never be linked again. The caller is responsible for unpinning it from its cache.
    pub fn purge(&mut self, element: &Arc<Element<V>>) {
        let mut residency = element.residency();
        residency.stale = true;
        if let Some(token) = residency.position.take() {
            self.queue.remove(token);
        }
    }

    /// Pop least recently used elements until the queue fits the capacity.
    ///
    /// The victims are marked stale. The caller is responsible for unpinning them from their caches.
    pub fn evict(&mut self) -> Vec<Arc<Element<V>>> {
        let mut victims = vec![];
        while self.queue.len() > self.capacity {
            let Some(victim) = self.queue.pop_back() else {
                break;
            };
            {
                let mut residency = victim.residency();
                strict_assert!(residency.is_idle());
                residency.stale = true;
                residency.position = None;
            }
            tracing::trace!("[evictor]: evict {}", victim.identity());
            victims.push(victim);
        }
        victims
    }

    /// Identities and facets of the idle elements, most recently used first.
    pub fn order(&self) -> Vec<(Arc<str>, Identity)> {
        self.queue
            .iter()
            .map(|e| (e.facet().clone(), e.identity().clone()))
            .collect()
    }

    /// Unlink all elements and mark them stale.
    pub fn clear(&mut self) -> Vec<Arc<Element<V>>> {
        let mut elements = vec![];
        while let Some(element) = self.queue.pop_front() {
            {
                let mut residency = element.residency();
                residency.stale = true;
                residency.position = None;
            }
            elements.push(element);
        }
        elements
    }
}

#[cfg(test)]
mod tests {
    use itertools::Itertools;

    use super::*;

    fn element(name: &str) -> Arc<Element<u64>> {
        Arc::new(Element::dead(Identity::new(name), Arc::from("")))
    }

    fn names(lru: &ElementLru<u64>) -> Vec<String> {
        lru.order().into_iter().map(|(_, id)| id.name).collect_vec()
    }

    #[test_log::test]
    fn test_use_and_park() {
        let mut lru = ElementLru::new(4);
        let es = ["a", "b", "c"].map(element);

        for e in es.iter() {
            lru.acquire(e);
            assert_eq!(e.residency().usage, 1);
            assert!(lru.is_empty());
        }
        for e in es.iter() {
            assert!(lru.relinquish(e));
        }
        assert_eq!(names(&lru), vec!["c", "b", "a"]);

        // Twice in use, once released.
        lru.acquire(&es[0]);
        lru.acquire(&es[0]);
        assert!(!lru.relinquish(&es[0]));
        assert_eq!(names(&lru), vec!["c", "b"]);
        assert!(lru.relinquish(&es[0]));
        assert_eq!(names(&lru), vec!["a", "c", "b"]);

        lru.touch(&es[2]);
        assert_eq!(names(&lru), vec!["c", "a", "b"]);
    }

    #[test_log::test]
    fn test_touch_fresh() {
        let mut lru = ElementLru::new(4);
        let e = element("a");
        assert_eq!(e.residency().usage, -1);
        lru.touch(&e);
        assert_eq!(e.residency().usage, 0);
        assert_eq!(lru.len(), 1);
        lru.touch(&e);
        assert_eq!(lru.len(), 1);
    }

    #[test_log::test]
    fn test_evict_lru_first() {
        let mut lru = ElementLru::new(2);
        let es = ["a", "b", "c", "d"].map(element);
        for e in es.iter() {
            lru.touch(e);
        }
        assert_eq!(lru.len(), 4);

        let victims = lru.evict();
        assert_eq!(victims.iter().map(|e| e.identity().name.clone()).collect_vec(), vec!["a", "b"]);
        assert!(victims.iter().all(|e| e.is_stale()));
        assert_eq!(names(&lru), vec!["d", "c"]);

        // Stale elements are never linked again.
        lru.touch(&es[0]);
        assert_eq!(lru.len(), 2);

        lru.set_capacity(0);
        assert_eq!(lru.evict().len(), 2);
        assert!(lru.is_empty());
    }

    #[test_log::test]
    fn test_keep_release() {
        let mut lru = ElementLru::new(8);
        let x = element("x");
        let y = element("y");
        lru.touch(&x);
        lru.touch(&y);
        assert_eq!(names(&lru), vec!["y", "x"]);

        lru.keep(&x);
        lru.keep(&x);
        assert_eq!(names(&lru), vec!["y"]);
        assert!(lru.release(&x));
        assert_eq!(names(&lru), vec!["y"]);
        assert!(lru.release(&x));
        assert_eq!(names(&lru), vec!["x", "y"]);
        assert!(!lru.release(&x));

        // Kept elements are not evicted.
        lru.keep(&y);
        lru.set_capacity(0);
        let victims = lru.evict();
        assert_eq!(victims.len(), 1);
        assert!(Arc::ptr_eq(&victims[0], &x));
        assert!(!y.is_stale());
    }

    #[test_log::test]
    fn test_purge() {
        let mut lru = ElementLru::new(8);
        let x = element("x");
        lru.touch(&x);
        lru.acquire(&x);
        lru.purge(&x);
        assert!(x.is_stale());
        assert!(lru.relinquish(&x));
        assert!(lru.is_empty());

        let y = element("y");
        lru.touch(&y);
        lru.purge(&y);
        assert!(lru.is_empty());

        let z = element("z");
        lru.touch(&z);
        let cleared = lru.clear();
        assert_eq!(cleared.len(), 1);
        assert!(z.is_stale());
    }

    #[test_log::test]
    fn test_idle_invariant() {
        let mut lru = ElementLru::new(3);
        let es = (0..6).map(|i| element(&i.to_string())).collect_vec();
        for (i, e) in es.iter().enumerate() {
            lru.acquire(e);
            if i % 2 == 0 {
                lru.keep(e);
            }
            lru.relinquish(e);
        }
        for v in lru.evict() {
            assert!(v.is_stale());
        }
        for e in es.iter() {
            let r = e.residency();
            assert_eq!(r.position.is_some(), r.is_idle() && !r.stale);
        }
        assert!(lru.len() <= lru.capacity());
    }
}
