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

//! Evictor that serves dispatches from memory and defers all writes to a dedicated saving thread.
//!
//! Locking order: deactivate gate, then the evictor lock ([`SaverState`]), then element and cache locks, then the
//! servant lock. The saving thread never takes the evictor lock while it holds an element or servant lock.

mod saver;

use std::{collections::VecDeque, sync::Arc, thread::JoinHandle};

use larder_common::{stats::now_millis, Error, ErrorKind, Identity, Result};
use larder_memory::{Element, ElementLru, ServantRef, Status};
use larder_storage::SharedEnvironment;
use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::{
    deactivate::DeactivateGuard,
    dispatch::{dispatch_with, Request, ServantLocator},
    evictor::EvictorCore,
    store::ObjectStore,
};

struct SaverState<V> {
    lru: ElementLru<V>,
    /// Elements waiting for the saving thread, in enqueue order. Each entry holds one use of its element.
    modified: VecDeque<Arc<Element<V>>>,
    /// Ticket of the latest save request.
    requested: u64,
    /// Every request up to this ticket is durable.
    completed: u64,
    shutdown: bool,
    dead: bool,
}

/// A pinned element with the evictor lock held.
type Pinned<'a, V> = (Arc<Element<V>>, MutexGuard<'a, SaverState<V>>);

struct BackgroundInner<V> {
    core: EvictorCore<V>,
    state: Mutex<SaverState<V>>,
    wakeup: Condvar,
    saved: Condvar,
}

impl<V> BackgroundInner<V>
where
    V: Send + 'static,
{
    /// Pin the element of the identity and take the evictor lock, skipping elements evicted meanwhile.
    ///
    /// With `or_dead`, a missing object is cached as a dead placeholder.
    fn pin(&self, store: &ObjectStore<V>, identity: &Identity, or_dead: bool) -> Result<Option<Pinned<'_, V>>> {
        loop {
            let element = match or_dead {
                true => store.pin_or_dead(identity)?,
                false => match store.load(identity)? {
                    Some(element) => element,
                    None => return Ok(None),
                },
            };
            let state = self.state.lock();
            if !element.is_stale() {
                return Ok(Some((element, state)));
            }
            tracing::trace!("[evictor]: {identity} was evicted while pinning, retry");
        }
    }

    /// Hand the element to the saving thread. The pending save holds one use of the element.
    fn enqueue(&self, state: &mut SaverState<V>, element: &Arc<Element<V>>) {
        state.lru.acquire(element);
        state.modified.push_back(element.clone());
        let trigger = self.core.config().save_size_trigger;
        if trigger > 0 && state.modified.len() >= trigger {
            self.wakeup.notify_one();
        }
    }

    /// Evict least recently used elements beyond the capacity.
    fn trim(&self, state: &mut SaverState<V>) {
        let victims = state.lru.evict();
        self.core.unpin_all(&victims);
    }

    /// Drop an idle dead element from the cache for good.
    fn release_dead(&self, state: &mut SaverState<V>, element: &Arc<Element<V>>) {
        let idle = element.residency().is_idle();
        if idle && element.status() == Status::Dead {
            state.lru.purge(element);
            self.core.unpin_all(std::slice::from_ref(element));
        }
    }

    /// Record an access to an element that is not handed out.
    fn settle(&self, state: &mut SaverState<V>, element: &Arc<Element<V>>) {
        state.lru.touch(element);
        self.release_dead(state, element);
        self.trim(state);
    }

    fn finish(&self, element: &Arc<Element<V>>, mutating: bool) {
        let mut state = self.state.lock();
        if mutating && element.lifecycle().mutated() {
            tracing::trace!("[evictor]: {} modified", element.identity());
            self.enqueue(&mut state, element);
        }
        if state.lru.relinquish(element) {
            self.release_dead(&mut state, element);
        }
        self.trim(&mut state);
    }

    /// Block until everything enqueued before the call is durable.
    ///
    /// Requests are admitted in ticket order: a request registered before the saving thread drains the queue is
    /// completed by that cycle, later requests by the next one.
    fn save_now(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.requested += 1;
        let ticket = state.requested;
        self.wakeup.notify_one();
        loop {
            if state.completed >= ticket {
                return Ok(());
            }
            if state.dead {
                return Err(Error::new(ErrorKind::Fatal, "saving thread is dead")
                    .with_context("evictor", self.core.filename()));
            }
            self.saved.wait(&mut state);
        }
    }
}

/// Opaque per-dispatch state of a [`BackgroundEvictor`].
///
/// Dropping a cookie without handing it back to [`ServantLocator::finished`] finishes the dispatch as read-only.
pub struct Cookie<V>
where
    V: Send + 'static,
{
    inner: Arc<BackgroundInner<V>>,
    element: Option<Arc<Element<V>>>,
    _guard: DeactivateGuard,
}

impl<V> Cookie<V>
where
    V: Send + 'static,
{
    fn complete(mut self, mutating: bool) {
        if let Some(element) = self.element.take() {
            self.inner.finish(&element, mutating);
        }
    }
}

impl<V> Drop for Cookie<V>
where
    V: Send + 'static,
{
    fn drop(&mut self) {
        if let Some(element) = self.element.take() {
            self.inner.finish(&element, false);
        }
    }
}

/// Evictor with write-behind persistence.
///
/// Dispatches run against the cached servants. Additions, removals and mutations are buffered and written by a
/// dedicated saving thread, either when [`crate::EvictorConfig::save_size_trigger`] objects are pending, when
/// [`crate::EvictorConfig::save_period`] elapses, or on [`BackgroundEvictor::save_now`].
///
/// A failure of the saving thread is reported through the fatal callback of the environment registry.
///
/// Dropping the evictor deactivates it.
pub struct BackgroundEvictor<V>
where
    V: Send + 'static,
{
    inner: Arc<BackgroundInner<V>>,
    saver: Mutex<Option<JoinHandle<()>>>,
}

impl<V> std::fmt::Debug for BackgroundEvictor<V>
where
    V: Send + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackgroundEvictor")
            .field("filename", &self.inner.core.filename())
            .field("env", self.inner.core.env())
            .finish()
    }
}

impl<V> Drop for BackgroundEvictor<V>
where
    V: Send + 'static,
{
    fn drop(&mut self) {
        self.deactivate();
    }
}

impl<V> BackgroundEvictor<V>
where
    V: Send + 'static,
{
    pub(crate) fn open(core: EvictorCore<V>) -> Result<Self> {
        let name = format!("larder-saver-{}", core.filename());
        let inner = Arc::new(BackgroundInner {
            state: Mutex::new(SaverState {
                lru: ElementLru::new(core.config().evictor_size),
                modified: VecDeque::new(),
                requested: 0,
                completed: 0,
                shutdown: false,
                dead: false,
            }),
            core,
            wakeup: Condvar::new(),
            saved: Condvar::new(),
        });
        let handle = std::thread::Builder::new().name(name).spawn({
            let inner = inner.clone();
            move || saver::run(inner)
        })?;
        Ok(Self {
            inner,
            saver: Mutex::new(Some(handle)),
        })
    }

    /// Name of the evictor.
    pub fn filename(&self) -> &str {
        self.inner.core.filename()
    }

    /// Environment of the evictor.
    pub fn env(&self) -> &SharedEnvironment {
        self.inner.core.env()
    }

    /// Register a new object in the default facet.
    pub fn add(&self, servant: V, identity: &Identity) -> Result<()> {
        self.add_facet(servant, identity, "")
    }

    /// Register a new object.
    ///
    /// Fails with [`ErrorKind::AlreadyRegistered`] if the object exists. The object is persisted by the next save.
    pub fn add_facet(&self, servant: V, identity: &Identity, facet: &str) -> Result<()> {
        let _guard = self.inner.core.enter(identity)?;
        let store = self.inner.core.open_store(facet, self.inner.core.config().create_db)?;

        let Some((element, mut state)) = self.inner.pin(&store, identity, true)? else {
            return Err(Error::new(ErrorKind::Storage, "placeholder element is not cached"));
        };
        let res = element.lifecycle().add(identity, servant, now_millis());
        match res {
            Ok(true) => {
                tracing::debug!("[evictor]: add {identity} to facet {facet:?}");
                self.inner.enqueue(&mut state, &element);
                self.inner.trim(&mut state);
                Ok(())
            }
            Ok(false) => {
                tracing::debug!("[evictor]: add {identity} to facet {facet:?} over a pending removal");
                self.inner.settle(&mut state, &element);
                Ok(())
            }
            Err(e) => {
                self.inner.settle(&mut state, &element);
                Err(e)
            }
        }
    }

    /// Unregister an object of the default facet.
    pub fn remove(&self, identity: &Identity) -> Result<ServantRef<V>> {
        self.remove_facet(identity, "")
    }

    /// Unregister an object and return its servant.
    ///
    /// Fails with [`ErrorKind::NotRegistered`] if the object does not exist. The deletion is persisted by the next
    /// save, unless the object was never saved.
    pub fn remove_facet(&self, identity: &Identity, facet: &str) -> Result<ServantRef<V>> {
        let _guard = self.inner.core.enter(identity)?;
        let Some(store) = self.inner.core.find_store(facet)? else {
            return Err(Error::not_registered("servant", identity));
        };
        let Some((element, mut state)) = self.inner.pin(&store, identity, false)? else {
            return Err(Error::not_registered("servant", identity));
        };
        let res = element.lifecycle().remove(identity);
        let res = res.map(|(servant, enqueue)| {
            tracing::debug!("[evictor]: remove {identity} from facet {facet:?}, enqueue: {enqueue}");
            if enqueue {
                self.inner.enqueue(&mut state, &element);
            }
            servant
        });
        self.inner.settle(&mut state, &element);
        res
    }

    /// Returns `true` if the object of the default facet exists.
    pub fn has_object(&self, identity: &Identity) -> Result<bool> {
        self.has_facet(identity, "")
    }

    /// Returns `true` if the object exists, in memory or on disk.
    pub fn has_facet(&self, identity: &Identity, facet: &str) -> Result<bool> {
        let _guard = self.inner.core.enter(identity)?;
        let Some(store) = self.inner.core.find_store(facet)? else {
            return Ok(false);
        };
        match store.cache().get_if_pinned(identity) {
            Some(element) => Ok(element.status().exists()),
            None => store.db_has_object(identity, None),
        }
    }

    /// Pin an object of the default facet in memory.
    pub fn keep(&self, identity: &Identity) -> Result<()> {
        self.keep_facet(identity, "")
    }

    /// Pin an object in memory until a matching [`BackgroundEvictor::release_facet`].
    pub fn keep_facet(&self, identity: &Identity, facet: &str) -> Result<()> {
        let _guard = self.inner.core.enter(identity)?;
        let Some(store) = self.inner.core.find_store(facet)? else {
            return Err(Error::not_registered("servant", identity));
        };
        let Some((element, mut state)) = self.inner.pin(&store, identity, false)? else {
            return Err(Error::not_registered("servant", identity));
        };
        if !element.status().exists() {
            self.inner.settle(&mut state, &element);
            return Err(Error::not_registered("servant", identity));
        }
        state.lru.keep(&element);
        self.inner.trim(&mut state);
        Ok(())
    }

    /// Drop one pin of an object of the default facet.
    pub fn release(&self, identity: &Identity) -> Result<()> {
        self.release_facet(identity, "")
    }

    /// Drop one pin taken by [`BackgroundEvictor::keep_facet`].
    ///
    /// The object becomes the most recently used one once its last pin is dropped. Fails with
    /// [`ErrorKind::NotRegistered`] if the object is not kept.
    pub fn release_facet(&self, identity: &Identity, facet: &str) -> Result<()> {
        let _guard = self.inner.core.enter(identity)?;
        let element = self
            .inner
            .core
            .loaded_store(facet)
            .and_then(|store| store.cache().get_if_pinned(identity))
            .ok_or_else(|| Error::not_registered("kept servant", identity))?;
        let mut state = self.inner.state.lock();
        if element.is_stale() || !state.lru.release(&element) {
            return Err(Error::not_registered("kept servant", identity));
        }
        self.inner.trim(&mut state);
        Ok(())
    }

    /// Block until every change made before the call is durable.
    ///
    /// Must not be called while holding a servant lock.
    pub fn save_now(&self) -> Result<()> {
        let _guard = self.inner.core.controller().lock()?;
        self.inner.save_now()
    }

    /// Identities of the persisted objects of the facet, after saving pending changes.
    pub fn identities(&self, facet: &str) -> Result<Vec<Identity>> {
        let _guard = self.inner.core.controller().lock()?;
        self.inner.save_now()?;
        match self.inner.core.find_store(facet)? {
            Some(store) => store.identities(None),
            None => Ok(vec![]),
        }
    }

    /// Identities of the objects whose secondary key in the index equals `key`, after saving pending changes.
    pub fn find(&self, index: &str, key: &[u8]) -> Result<Vec<Identity>> {
        let _guard = self.inner.core.controller().lock()?;
        self.inner.save_now()?;
        match self.inner.core.index_store(index)? {
            Some(store) => store.find(index, key, None),
            None => Ok(vec![]),
        }
    }

    /// Number of objects whose secondary key in the index equals `key`.
    pub fn count(&self, index: &str, key: &[u8]) -> Result<usize> {
        self.find(index, key).map(|ids| ids.len())
    }

    /// Facets with an open store.
    pub fn facets(&self) -> Vec<String> {
        self.inner.core.facets()
    }

    /// Change the number of idle servants kept in memory, evicting immediately if needed.
    pub fn set_size(&self, size: usize) -> Result<()> {
        let _guard = self.inner.core.controller().lock()?;
        let mut state = self.inner.state.lock();
        state.lru.set_capacity(size);
        self.inner.trim(&mut state);
        tracing::debug!("[evictor]: {} resize to {size}", self.inner.core.filename());
        Ok(())
    }

    /// Number of idle servants kept in memory.
    pub fn size(&self) -> usize {
        self.inner.state.lock().lru.capacity()
    }

    /// Facets and identities of the idle servants, most recently used first.
    pub fn resident_order(&self) -> Vec<(Arc<str>, Identity)> {
        self.inner.state.lock().lru.order()
    }

    /// Number of idle servants in the eviction queue.
    pub fn idle_count(&self) -> usize {
        self.inner.state.lock().lru.len()
    }

    /// Number of saves waiting for the saving thread.
    pub fn pending_saves(&self) -> usize {
        self.inner.state.lock().modified.len()
    }

    /// Run `f` on the servant of the request.
    pub fn dispatch<R, F>(&self, request: &Request, f: F) -> Result<R>
    where
        F: FnOnce(&mut V) -> Result<R>,
    {
        dispatch_with(self, request, f)
    }

    /// Returns `true` once deactivation is complete.
    pub fn is_deactivated(&self) -> bool {
        self.inner.core.controller().is_deactivated()
    }

    /// Save pending changes, stop the saving thread and drop all cached servants.
    ///
    /// Waits for in-flight operations first. Concurrent and repeated calls return once the first completes.
    pub fn deactivate(&self) {
        let controller = self.inner.core.controller();
        if !controller.deactivate() {
            return;
        }

        {
            let mut state = self.inner.state.lock();
            state.shutdown = true;
            self.inner.wakeup.notify_all();
        }
        if let Some(handle) = self.saver.lock().take() {
            if handle.join().is_err() {
                tracing::error!("[evictor]: {} saving thread panicked", self.inner.core.filename());
            }
        }

        {
            let mut state = self.inner.state.lock();
            if !state.modified.is_empty() {
                tracing::error!(
                    "[evictor]: {} deactivated with {} unsaved changes",
                    self.inner.core.filename(),
                    state.modified.len()
                );
                state.modified.clear();
            }
            state.lru.clear();
        }
        self.inner.core.clear_caches();
        controller.deactivation_complete();
    }
}

impl<V> ServantLocator<V> for BackgroundEvictor<V>
where
    V: Send + 'static,
{
    type Cookie = Cookie<V>;

    fn locate(&self, identity: &Identity, facet: &str) -> Result<Option<(ServantRef<V>, Cookie<V>)>> {
        let guard = self.inner.core.enter(identity)?;
        let Some(store) = self.inner.core.find_store(facet)? else {
            return Ok(None);
        };
        let Some((element, mut state)) = self.inner.pin(&store, identity, false)? else {
            return Ok(None);
        };
        let servant = element.lifecycle().servant().cloned();
        let Some(servant) = servant else {
            self.inner.settle(&mut state, &element);
            return Ok(None);
        };
        state.lru.acquire(&element);
        drop(state);

        Ok(Some((
            servant,
            Cookie {
                inner: self.inner.clone(),
                element: Some(element),
                _guard: guard,
            },
        )))
    }

    fn finished(&self, cookie: Cookie<V>, mutating: bool) -> Result<()> {
        cookie.complete(mutating);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use larder_storage::{EnvironmentConfig, Registry};

    use super::*;
    use crate::{builder::EvictorBuilder, dispatch::Request};

    fn evictor(registry: &Registry, size: usize) -> BackgroundEvictor<u64> {
        let env = registry
            .open("env", &EnvironmentConfig::default().with_checkpoint_period(Duration::ZERO))
            .unwrap();
        EvictorBuilder::new("counters")
            .with_evictor_size(size)
            .with_save_size_trigger(0)
            .with_save_period(Duration::ZERO)
            .background(&env)
            .unwrap()
    }

    #[test_log::test]
    fn test_add_remove() {
        let registry = Registry::new();
        let evictor = evictor(&registry, 4);
        let id = Identity::new("a");

        evictor.add(1, &id).unwrap();
        assert!(evictor.has_object(&id).unwrap());
        assert_eq!(evictor.add(2, &id).unwrap_err().kind(), ErrorKind::AlreadyRegistered);
        assert_eq!(evictor.pending_saves(), 1);

        let servant = evictor.remove(&id).unwrap();
        assert_eq!(*servant.lock(), 1);
        assert!(!evictor.has_object(&id).unwrap());
        assert_eq!(evictor.remove(&id).unwrap_err().kind(), ErrorKind::NotRegistered);

        // Re-add over a dead placeholder.
        evictor.add(3, &id).unwrap();
        evictor.save_now().unwrap();
        assert_eq!(evictor.identities("").unwrap(), vec![id.clone()]);
        assert_eq!(evictor.pending_saves(), 0);
    }

    #[test_log::test]
    fn test_dispatch_marks_modified() {
        let registry = Registry::new();
        let evictor = evictor(&registry, 4);
        let id = Identity::new("a");
        evictor.add(1, &id).unwrap();
        evictor.save_now().unwrap();
        assert_eq!(evictor.pending_saves(), 0);

        let value = evictor.dispatch(&Request::read(id.clone()), |v| Ok(*v)).unwrap();
        assert_eq!(value, 1);
        assert_eq!(evictor.pending_saves(), 0);

        evictor
            .dispatch(&Request::write(id.clone()), |v| {
                *v += 1;
                Ok(())
            })
            .unwrap();
        assert_eq!(evictor.pending_saves(), 1);

        let err = evictor.dispatch(&Request::read("missing"), |v| Ok(*v)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotRegistered);
    }

    #[test_log::test]
    fn test_dropped_cookie_finishes() {
        let registry = Registry::new();
        let evictor = evictor(&registry, 4);
        let id = Identity::new("a");
        evictor.add(1, &id).unwrap();
        evictor.save_now().unwrap();

        let (servant, cookie) = evictor.locate(&id, "").unwrap().unwrap();
        assert_eq!(*servant.lock(), 1);
        assert_eq!(evictor.idle_count(), 0);
        drop(cookie);
        assert_eq!(evictor.idle_count(), 1);
    }

    #[test_log::test]
    fn test_keep_release() {
        let registry = Registry::new();
        let evictor = evictor(&registry, 1);
        let a = Identity::new("a");
        let b = Identity::new("b");
        evictor.add(1, &a).unwrap();
        evictor.add(2, &b).unwrap();
        evictor.save_now().unwrap();

        assert_eq!(evictor.release(&a).unwrap_err().kind(), ErrorKind::NotRegistered);
        evictor.keep(&a).unwrap();
        evictor.keep(&a).unwrap();
        evictor.release(&a).unwrap();
        assert!(evictor.resident_order().iter().all(|(_, id)| id != &a));
        evictor.release(&a).unwrap();
        assert_eq!(evictor.resident_order()[0].1, a);
        assert_eq!(evictor.keep(&Identity::new("c")).unwrap_err().kind(), ErrorKind::NotRegistered);
    }

    #[test_log::test]
    fn test_deactivated() {
        let registry = Registry::new();
        let evictor = evictor(&registry, 4);
        let id = Identity::new("a");
        evictor.add(1, &id).unwrap();
        evictor.deactivate();
        evictor.deactivate();

        assert!(evictor.is_deactivated());
        assert_eq!(evictor.has_object(&id).unwrap_err().kind(), ErrorKind::Deactivated);
        assert_eq!(evictor.save_now().unwrap_err().kind(), ErrorKind::Deactivated);
        assert_eq!(evictor.idle_count(), 0);
    }

    #[test_log::test]
    fn test_invalid_identity() {
        let registry = Registry::new();
        let evictor = evictor(&registry, 4);
        let err = evictor.add(1, &Identity::default()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config);
    }
}
