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

//! Evictor whose mutations run within store transactions and are persisted on commit.

mod context;

use std::sync::Arc;

use larder_common::{stats::now_millis, Error, ErrorKind, Identity, Result, Statistics};
use larder_memory::{ElementLru, ServantRef};
use larder_storage::SharedEnvironment;
use parking_lot::Mutex;

pub use self::context::TransactionalContext;
use crate::{
    dispatch::{Request, TransactionMode},
    evictor::EvictorCore,
    store::ObjectStore,
};

struct TransactionalInner<V> {
    core: EvictorCore<V>,
    lru: Mutex<ElementLru<V>>,
}

impl<V> TransactionalInner<V>
where
    V: Send + 'static,
{
    fn trim(&self, lru: &mut ElementLru<V>) {
        let victims = lru.evict();
        self.core.unpin_all(&victims);
    }

    /// Drop the cached element of a committed change.
    fn invalidate(&self, store: &ObjectStore<V>, identity: &Identity) {
        let mut lru = self.lru.lock();
        if let Some(element) = store.cache().unpin(identity) {
            lru.purge(&element);
            tracing::trace!("[evictor]: invalidate {identity}");
        }
    }

    /// Run a read-only operation on the cached servant, outside of any transaction.
    fn dispatch_cached<R>(
        &self,
        store: &ObjectStore<V>,
        identity: &Identity,
        f: impl FnOnce(&ServantRef<V>) -> Result<R>,
    ) -> Result<R> {
        let element = loop {
            let Some(element) = store.load(identity)? else {
                return Err(Error::not_registered("servant", identity));
            };
            let mut lru = self.lru.lock();
            if element.is_stale() {
                continue;
            }
            lru.acquire(&element);
            break element;
        };

        let servant = element.lifecycle().servant().cloned();
        let res = match servant {
            Some(servant) => f(&servant),
            None => Err(Error::not_registered("servant", identity)),
        };

        let mut lru = self.lru.lock();
        lru.relinquish(&element);
        // Loaded while a commit invalidated the object, not cached.
        if !store.cache().is_pinned(identity, &element) {
            lru.purge(&element);
        }
        self.trim(&mut lru);
        res
    }
}

/// Evictor with synchronous transactional persistence.
///
/// Reads without a transaction are served from the cache. Every other dispatch runs within a
/// [`TransactionalContext`]: the caller's one, or one owned by the evictor that is committed on success and retried
/// transparently when the store reports a deadlock of it.
///
/// Dropping the evictor deactivates it.
pub struct TransactionalEvictor<V>
where
    V: Send + 'static,
{
    inner: Arc<TransactionalInner<V>>,
}

impl<V> std::fmt::Debug for TransactionalEvictor<V>
where
    V: Send + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionalEvictor")
            .field("filename", &self.inner.core.filename())
            .field("env", self.inner.core.env())
            .finish()
    }
}

impl<V> Drop for TransactionalEvictor<V>
where
    V: Send + 'static,
{
    fn drop(&mut self) {
        self.deactivate();
    }
}

impl<V> TransactionalEvictor<V>
where
    V: Send + 'static,
{
    pub(crate) fn open(core: EvictorCore<V>) -> Self {
        let lru = ElementLru::new(core.config().evictor_size);
        Self {
            inner: Arc::new(TransactionalInner {
                core,
                lru: Mutex::new(lru),
            }),
        }
    }

    /// Name of the evictor.
    pub fn filename(&self) -> &str {
        self.inner.core.filename()
    }

    /// Environment of the evictor.
    pub fn env(&self) -> &SharedEnvironment {
        self.inner.core.env()
    }

    /// Begin a transaction in the environment of the evictor.
    pub fn begin(&self) -> Result<TransactionalContext<V>> {
        let _guard = self.inner.core.controller().lock()?;
        TransactionalContext::begin(self.inner.core.env())
    }

    /// Run `f` within the ambient context, or within an evictor-owned context.
    ///
    /// An evictor-owned context is committed on success and on an [`ErrorKind::External`] error unless
    /// [`crate::EvictorConfig::rollback_on_user_exception`] is set. It is rolled back on any other error, and the
    /// whole operation is retried if the error is a deadlock of that context. A deadlock within an ambient context
    /// is returned to the caller, which owns the retry.
    fn run<T>(
        &self,
        ambient: Option<&TransactionalContext<V>>,
        what: &str,
        mut f: impl FnMut(&TransactionalContext<V>) -> Result<T>,
    ) -> Result<T> {
        if let Some(ctx) = ambient {
            self.inner.core.env().check_same(ctx.env())?;
            return f(ctx);
        }

        let rollback_on_user_exception = self.inner.core.config().rollback_on_user_exception;
        let mut attempts = 0usize;
        loop {
            let ctx = TransactionalContext::begin(self.inner.core.env())?;
            let id = ctx.id();
            match f(&ctx) {
                Ok(res) => {
                    ctx.commit()?;
                    return Ok(res);
                }
                Err(e) if e.is_deadlock_of(id) => {
                    ctx.rollback()?;
                    attempts += 1;
                    tracing::debug!("[txn]: {what} deadlocked in {id}, retry, attempts: {attempts}");
                }
                Err(e) if e.kind() == ErrorKind::External && !rollback_on_user_exception => {
                    ctx.commit()?;
                    return Err(e);
                }
                Err(e) => {
                    ctx.rollback()?;
                    return Err(e);
                }
            }
        }
    }

    fn dispatch_in<R, F>(
        &self,
        ctx: &TransactionalContext<V>,
        store: &Arc<ObjectStore<V>>,
        request: &Request,
        f: &mut F,
    ) -> Result<R>
    where
        F: FnMut(&ServantRef<V>, Option<&TransactionalContext<V>>) -> Result<R>,
    {
        let servant = ctx.enter(&self.inner, store, &request.identity, request.is_write())?;
        let res = f(&servant, Some(ctx));
        let keep = match &res {
            Ok(_) => true,
            Err(e) => e.kind() == ErrorKind::External && !self.inner.core.config().rollback_on_user_exception,
        };
        let left = ctx.leave(store, &request.identity, keep);
        let res = res?;
        left?;
        Ok(res)
    }

    /// Run `f` on the servant of the request.
    ///
    /// `f` receives the servant and the context it runs in, to pass on to nested dispatches. A read without
    /// `ambient` context runs on the cached servant without a transaction.
    ///
    /// Fails with [`ErrorKind::Transaction`] if the request is [`TransactionMode::Never`] with an ambient context,
    /// [`TransactionMode::Mandatory`] without one, or a [`TransactionMode::Never`] write.
    pub fn dispatch<R, F>(&self, ambient: Option<&TransactionalContext<V>>, request: &Request, mut f: F) -> Result<R>
    where
        F: FnMut(&ServantRef<V>, Option<&TransactionalContext<V>>) -> Result<R>,
    {
        let _guard = self.inner.core.enter(&request.identity)?;
        match (request.mode, ambient.is_some()) {
            (TransactionMode::Never, true) => {
                return Err(Error::new(ErrorKind::Transaction, "operation must run without a transaction")
                    .with_context("identity", &request.identity));
            }
            (TransactionMode::Never, false) if request.is_write() => {
                return Err(Error::new(ErrorKind::Transaction, "operation without a transaction cannot write")
                    .with_context("identity", &request.identity));
            }
            (TransactionMode::Mandatory, false) => {
                return Err(Error::new(ErrorKind::Transaction, "operation requires a transaction")
                    .with_context("identity", &request.identity));
            }
            _ => {}
        }

        let Some(store) = self.inner.core.find_store(&request.facet)? else {
            return Err(Error::not_registered("servant", &request.identity));
        };
        if !request.is_write() && ambient.is_none() {
            return self.inner.dispatch_cached(&store, &request.identity, |servant| f(servant, None));
        }
        self.run(ambient, "dispatch", |ctx| self.dispatch_in(ctx, &store, request, &mut f))
    }

    /// Register a new object in the default facet.
    pub fn add(&self, ambient: Option<&TransactionalContext<V>>, servant: V, identity: &Identity) -> Result<()> {
        self.add_facet(ambient, servant, identity, "")
    }

    /// Persist a new object within the ambient context, or within an own transaction.
    ///
    /// Fails with [`ErrorKind::AlreadyRegistered`] if the object exists.
    pub fn add_facet(
        &self,
        ambient: Option<&TransactionalContext<V>>,
        servant: V,
        identity: &Identity,
        facet: &str,
    ) -> Result<()> {
        let _guard = self.inner.core.enter(identity)?;
        let store = self.inner.core.open_store(facet, self.inner.core.config().create_db)?;
        let stats = Statistics::created(now_millis());
        self.run(ambient, "add", |ctx| {
            if !store.insert(identity, &servant, &stats, Some(ctx.transaction()))? {
                return Err(Error::already_registered("servant", identity));
            }
            ctx.invalidate_later(&self.inner, &store, identity);
            tracing::debug!("[evictor]: add {identity} to facet {facet:?} in {}", ctx.id());
            Ok(())
        })
    }

    /// Remove an object of the default facet.
    pub fn remove(&self, ambient: Option<&TransactionalContext<V>>, identity: &Identity) -> Result<ServantRef<V>> {
        self.remove_facet(ambient, identity, "")
    }

    /// Delete an object within the ambient context, or within an own transaction, and return its servant.
    ///
    /// Fails with [`ErrorKind::NotRegistered`] if the object does not exist.
    pub fn remove_facet(
        &self,
        ambient: Option<&TransactionalContext<V>>,
        identity: &Identity,
        facet: &str,
    ) -> Result<ServantRef<V>> {
        let _guard = self.inner.core.enter(identity)?;
        let Some(store) = self.inner.core.find_store(facet)? else {
            return Err(Error::not_registered("servant", identity));
        };
        self.run(ambient, "remove", |ctx| {
            let servant = match ctx.held(&store, identity) {
                Some((_, true)) => return Err(Error::not_registered("servant", identity)),
                Some((servant, false)) => servant,
                None => {
                    let record = store
                        .load_in(identity, ctx.transaction(), true)?
                        .ok_or_else(|| Error::not_registered("servant", identity))?;
                    Arc::new(Mutex::new(record.servant))
                }
            };
            if !store.remove(identity, Some(ctx.transaction()))? {
                return Err(Error::not_registered("servant", identity));
            }
            ctx.mark_removed(&store, identity);
            ctx.invalidate_later(&self.inner, &store, identity);
            tracing::debug!("[evictor]: remove {identity} from facet {facet:?} in {}", ctx.id());
            Ok(servant)
        })
    }

    /// Returns `true` if the object of the default facet exists.
    pub fn has_object(&self, ambient: Option<&TransactionalContext<V>>, identity: &Identity) -> Result<bool> {
        self.has_facet(ambient, identity, "")
    }

    /// Returns `true` if the object exists, as seen by the ambient context if any.
    pub fn has_facet(
        &self,
        ambient: Option<&TransactionalContext<V>>,
        identity: &Identity,
        facet: &str,
    ) -> Result<bool> {
        let _guard = self.inner.core.enter(identity)?;
        let Some(store) = self.inner.core.find_store(facet)? else {
            return Ok(false);
        };
        match ambient {
            Some(ctx) => {
                self.inner.core.env().check_same(ctx.env())?;
                match ctx.held(&store, identity) {
                    Some((_, removed)) => Ok(!removed),
                    None => store.db_has_object(identity, Some(ctx.transaction())),
                }
            }
            None => match store.cache().get_if_pinned(identity) {
                Some(element) => Ok(element.status().exists()),
                None => store.db_has_object(identity, None),
            },
        }
    }

    /// Identities of the persisted objects of the facet.
    pub fn identities(&self, ambient: Option<&TransactionalContext<V>>, facet: &str) -> Result<Vec<Identity>> {
        let _guard = self.inner.core.controller().lock()?;
        let Some(store) = self.inner.core.find_store(facet)? else {
            return Ok(vec![]);
        };
        match ambient {
            Some(ctx) => {
                self.inner.core.env().check_same(ctx.env())?;
                store.identities(Some(ctx.transaction()))
            }
            None => store.identities(None),
        }
    }

    /// Identities of the objects whose secondary key in the index equals `key`.
    pub fn find(&self, ambient: Option<&TransactionalContext<V>>, index: &str, key: &[u8]) -> Result<Vec<Identity>> {
        let _guard = self.inner.core.controller().lock()?;
        let Some(store) = self.inner.core.index_store(index)? else {
            return Ok(vec![]);
        };
        match ambient {
            Some(ctx) => {
                self.inner.core.env().check_same(ctx.env())?;
                store.find(index, key, Some(ctx.transaction()))
            }
            None => store.find(index, key, None),
        }
    }

    /// Number of objects whose secondary key in the index equals `key`.
    pub fn count(&self, ambient: Option<&TransactionalContext<V>>, index: &str, key: &[u8]) -> Result<usize> {
        self.find(ambient, index, key).map(|ids| ids.len())
    }

    /// Facets with an open store.
    pub fn facets(&self) -> Vec<String> {
        self.inner.core.facets()
    }

    /// Change the number of idle servants kept in memory, evicting immediately if needed.
    pub fn set_size(&self, size: usize) -> Result<()> {
        let _guard = self.inner.core.controller().lock()?;
        let mut lru = self.inner.lru.lock();
        lru.set_capacity(size);
        self.inner.trim(&mut lru);
        Ok(())
    }

    /// Number of idle servants kept in memory.
    pub fn size(&self) -> usize {
        self.inner.lru.lock().capacity()
    }

    /// Facets and identities of the idle servants, most recently used first.
    pub fn resident_order(&self) -> Vec<(Arc<str>, Identity)> {
        self.inner.lru.lock().order()
    }

    /// Number of idle servants in the eviction queue.
    pub fn idle_count(&self) -> usize {
        self.inner.lru.lock().len()
    }

    /// Returns `true` once deactivation is complete.
    pub fn is_deactivated(&self) -> bool {
        self.inner.core.controller().is_deactivated()
    }

    /// Drop all cached servants and refuse further operations.
    ///
    /// Waits for in-flight operations first. Open contexts stay usable for commit and rollback.
    pub fn deactivate(&self) {
        let controller = self.inner.core.controller();
        if !controller.deactivate() {
            return;
        }
        self.inner.lru.lock().clear();
        self.inner.core.clear_caches();
        controller.deactivation_complete();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;
    use larder_storage::{EnvironmentConfig, Registry};

    use super::*;
    use crate::{builder::EvictorBuilder, index::FnIndex};

    #[derive(Debug)]
    struct Overdrawn;

    impl std::fmt::Display for Overdrawn {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "overdrawn")
        }
    }

    impl std::error::Error for Overdrawn {}

    fn env(registry: &Registry) -> SharedEnvironment {
        registry
            .open("env", &EnvironmentConfig::default().with_checkpoint_period(Duration::ZERO))
            .unwrap()
    }

    fn evictor(registry: &Registry) -> TransactionalEvictor<i64> {
        EvictorBuilder::new("accounts").transactional(&env(registry)).unwrap()
    }

    fn balance(evictor: &TransactionalEvictor<i64>, id: &str) -> i64 {
        evictor
            .dispatch(None, &Request::read(id), |servant, _| Ok(*servant.lock()))
            .unwrap()
    }

    fn withdraw(amount: i64) -> impl FnMut(&ServantRef<i64>, Option<&TransactionalContext<i64>>) -> Result<()> {
        move |servant: &ServantRef<i64>, _: Option<&TransactionalContext<i64>>| {
            let mut balance = servant.lock();
            *balance -= amount;
            match *balance < 0 {
                true => Err(Error::external(Overdrawn)),
                false => Ok(()),
            }
        }
    }

    #[test_log::test]
    fn test_add_remove() {
        let registry = Registry::new();
        let evictor = evictor(&registry);
        let id = Identity::new("alice");

        evictor.add(None, 10, &id).unwrap();
        assert_eq!(evictor.add(None, 10, &id).unwrap_err().kind(), ErrorKind::AlreadyRegistered);
        assert!(evictor.has_object(None, &id).unwrap());
        assert_eq!(balance(&evictor, "alice"), 10);

        let servant = evictor.remove(None, &id).unwrap();
        assert_eq!(*servant.lock(), 10);
        assert!(!evictor.has_object(None, &id).unwrap());
        assert_eq!(evictor.remove(None, &id).unwrap_err().kind(), ErrorKind::NotRegistered);
        let err = evictor.dispatch(None, &Request::read("alice"), |s, _| Ok(*s.lock())).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotRegistered);
    }

    #[test_log::test]
    fn test_transaction_modes() {
        let registry = Registry::new();
        let evictor = evictor(&registry);
        evictor.add(None, 10, &Identity::new("alice")).unwrap();
        let ctx = evictor.begin().unwrap();

        let read = |mode| Request::read("alice").with_mode(mode);
        let write = |mode| Request::write("alice").with_mode(mode);
        let kind = |res: Result<i64>| res.unwrap_err().kind();

        assert_eq!(
            kind(evictor.dispatch(Some(&ctx), &read(TransactionMode::Never), |s, _| Ok(*s.lock()))),
            ErrorKind::Transaction
        );
        assert_eq!(
            kind(evictor.dispatch(None, &write(TransactionMode::Never), |s, _| Ok(*s.lock()))),
            ErrorKind::Transaction
        );
        assert_eq!(
            kind(evictor.dispatch(None, &read(TransactionMode::Mandatory), |s, _| Ok(*s.lock()))),
            ErrorKind::Transaction
        );

        let value = evictor.dispatch(None, &read(TransactionMode::Never), |s, _| Ok(*s.lock())).unwrap();
        assert_eq!(value, 10);
        let value = evictor
            .dispatch(Some(&ctx), &read(TransactionMode::Mandatory), |s, ctx| {
                assert!(ctx.is_some());
                Ok(*s.lock())
            })
            .unwrap();
        assert_eq!(value, 10);
        ctx.rollback().unwrap();

        // A write under `Supports` without context runs in an own transaction.
        evictor
            .dispatch(None, &write(TransactionMode::Supports), |s, ctx| {
                assert!(ctx.is_some());
                *s.lock() += 1;
                Ok(())
            })
            .unwrap();
        assert_eq!(balance(&evictor, "alice"), 11);
    }

    #[test_log::test]
    fn test_nested_dispatch_reuses_holder() {
        let registry = Registry::new();
        let evictor = evictor(&registry);
        evictor.add(None, 1, &Identity::new("alice")).unwrap();

        evictor
            .dispatch(None, &Request::write("alice"), |servant, ctx| {
                *servant.lock() += 1;
                let seen = evictor.dispatch(ctx, &Request::write("alice"), |nested, _| {
                    assert!(Arc::ptr_eq(servant, nested));
                    let mut value = nested.lock();
                    *value += 10;
                    Ok(*value)
                })?;
                assert_eq!(seen, 12);
                Ok(())
            })
            .unwrap();
        assert_eq!(balance(&evictor, "alice"), 12);
    }

    #[test_log::test]
    fn test_commit_and_rollback() {
        let registry = Registry::new();
        let evictor = evictor(&registry);
        let id = Identity::new("alice");
        evictor.add(None, 10, &id).unwrap();
        assert_eq!(balance(&evictor, "alice"), 10);

        let ctx = evictor.begin().unwrap();
        evictor.dispatch(Some(&ctx), &Request::write("alice"), withdraw(3)).unwrap();
        // Not visible before commit, the cached servant is untouched.
        assert_eq!(balance(&evictor, "alice"), 10);
        ctx.rollback().unwrap();
        assert_eq!(balance(&evictor, "alice"), 10);

        let ctx = evictor.begin().unwrap();
        evictor.dispatch(Some(&ctx), &Request::write("alice"), withdraw(3)).unwrap();
        evictor.add(Some(&ctx), 5, &Identity::new("bob")).unwrap();
        assert!(evictor.has_object(Some(&ctx), &Identity::new("bob")).unwrap());
        assert!(!evictor.has_object(None, &Identity::new("bob")).unwrap());
        ctx.commit().unwrap();
        assert_eq!(balance(&evictor, "alice"), 7);
        assert_eq!(balance(&evictor, "bob"), 5);

        // Dropped without commit.
        {
            let ctx = evictor.begin().unwrap();
            evictor.remove(Some(&ctx), &id).unwrap();
            assert!(!evictor.has_object(Some(&ctx), &id).unwrap());
        }
        assert!(evictor.has_object(None, &id).unwrap());
    }

    #[test_log::test]
    fn test_user_exception() {
        let registry = Registry::new();
        let env = env(&registry);
        let committing = EvictorBuilder::<i64>::new("committing").transactional(&env).unwrap();
        let rolling_back = EvictorBuilder::<i64>::new("rolling_back")
            .with_rollback_on_user_exception(true)
            .transactional(&env)
            .unwrap();

        for evictor in [&committing, &rolling_back] {
            evictor.add(None, 10, &Identity::new("alice")).unwrap();
            let err = evictor.dispatch(None, &Request::write("alice"), withdraw(15)).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::External);
            assert!(err.downcast_ref::<Overdrawn>().is_some());
        }
        assert_eq!(balance(&committing, "alice"), -5);
        assert_eq!(balance(&rolling_back, "alice"), 10);
    }

    #[test_log::test]
    fn test_foreign_context() {
        let registry = Registry::new();
        let evictor = evictor(&registry);
        evictor.add(None, 10, &Identity::new("alice")).unwrap();

        let other = registry
            .open("other", &EnvironmentConfig::default().with_checkpoint_period(Duration::ZERO))
            .unwrap();
        let ctx = TransactionalContext::<i64>::begin(&other).unwrap();
        let err = evictor
            .dispatch(Some(&ctx), &Request::write("alice"), withdraw(1))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transaction);
    }

    #[test_log::test]
    fn test_index_queries() {
        let registry = Registry::new();
        let sign = |v: &i64| Some(Bytes::from_static(if *v < 0 { b"negative" } else { b"positive" }));
        let evictor = EvictorBuilder::<i64>::new("accounts")
            .with_index(Arc::new(FnIndex::new("sign", sign)))
            .transactional(&env(&registry))
            .unwrap();

        evictor.add(None, 10, &Identity::new("alice")).unwrap();
        evictor.add(None, 3, &Identity::new("bob")).unwrap();
        assert_eq!(evictor.count(None, "sign", b"positive").unwrap(), 2);

        let ctx = evictor.begin().unwrap();
        evictor.dispatch(Some(&ctx), &Request::write("bob"), withdraw(5)).unwrap_err();
        evictor
            .dispatch(Some(&ctx), &Request::write("alice"), |s, _| {
                *s.lock() = -1;
                Ok(())
            })
            .unwrap();
        assert_eq!(
            evictor.find(Some(&ctx), "sign", b"negative").unwrap(),
            vec![Identity::new("alice"), Identity::new("bob")]
        );
        assert_eq!(evictor.count(None, "sign", b"negative").unwrap(), 0);
        ctx.commit().unwrap();
        assert_eq!(evictor.count(None, "sign", b"negative").unwrap(), 2);
        assert_eq!(evictor.find(None, "missing", b"negative").unwrap_err().kind(), ErrorKind::NotFound);
    }
}
