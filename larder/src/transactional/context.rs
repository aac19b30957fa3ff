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

use larder_common::{stats::now_millis, Error, Identity, Result, Statistics, TxnId};
use larder_memory::ServantRef;
use larder_storage::{SharedEnvironment, Transaction};
use parking_lot::Mutex;

use super::TransactionalInner;
use crate::store::ObjectStore;

/// The servant of one object loaded within a transaction.
///
/// Nested dispatches to the same object and store within one transaction share the holder.
struct Holder<V> {
    identity: Identity,
    store: Arc<ObjectStore<V>>,
    evictor: Arc<TransactionalInner<V>>,
    servant: ServantRef<V>,
    stats: Statistics,
    read_write: bool,
    removed: bool,
    depth: usize,
}

impl<V> Holder<V> {
    fn matches(&self, store: &Arc<ObjectStore<V>>, identity: &Identity) -> bool {
        self.identity == *identity && Arc::ptr_eq(&self.store, store)
    }
}

/// A cached object to drop once the transaction commits.
struct Invalidation<V> {
    identity: Identity,
    store: Arc<ObjectStore<V>>,
    evictor: Arc<TransactionalInner<V>>,
}

/// A logical transaction of the transactional evictor.
///
/// Pass the context to the evictor operations that must run within the transaction, and to nested dispatches from
/// servant code. Changes become visible to other threads and to the evictor caches only after
/// [`TransactionalContext::commit`]. Dropping an unfinished context rolls it back.
pub struct TransactionalContext<V> {
    env: SharedEnvironment,
    txn: Transaction,
    holders: Mutex<Vec<Holder<V>>>,
    invalidate: Mutex<Vec<Invalidation<V>>>,
}

impl<V> std::fmt::Debug for TransactionalContext<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionalContext")
            .field("env", &self.env.name())
            .field("txn", &self.txn.id())
            .field("holders", &self.holders.lock().len())
            .field("invalidate", &self.invalidate.lock().len())
            .finish()
    }
}

impl<V> TransactionalContext<V>
where
    V: Send + 'static,
{
    pub(crate) fn begin(env: &SharedEnvironment) -> Result<Self> {
        let txn = Transaction::begin(env.engine())?;
        Ok(Self {
            env: env.clone(),
            txn,
            holders: Mutex::new(vec![]),
            invalidate: Mutex::new(vec![]),
        })
    }

    /// Id of the underlying transaction.
    pub fn id(&self) -> TxnId {
        self.txn.id()
    }

    /// The underlying transaction.
    pub fn transaction(&self) -> &Transaction {
        &self.txn
    }

    /// Environment of the transaction.
    pub fn env(&self) -> &SharedEnvironment {
        &self.env
    }

    /// Commit the transaction, then drop the changed objects from the evictor caches.
    pub fn commit(self) -> Result<()> {
        let Self { txn, invalidate, .. } = self;
        let id = txn.id();
        txn.commit()?;

        let invalidate = invalidate.into_inner();
        for it in invalidate.iter() {
            it.evictor.invalidate(&it.store, &it.identity);
        }
        tracing::debug!("[txn]: {id} committed, invalidate {} cached objects", invalidate.len());
        Ok(())
    }

    /// Abort the transaction. The evictor caches keep their state.
    pub fn rollback(self) -> Result<()> {
        let id = self.txn.id();
        self.txn.abort()?;
        tracing::debug!("[txn]: {id} rolled back");
        Ok(())
    }

    /// Get the servant of the object for a dispatch, loading it within the transaction on first use.
    pub(super) fn enter(
        &self,
        evictor: &Arc<TransactionalInner<V>>,
        store: &Arc<ObjectStore<V>>,
        identity: &Identity,
        write: bool,
    ) -> Result<ServantRef<V>> {
        if let Some(holder) = self.holders.lock().iter_mut().rev().find(|h| h.matches(store, identity)) {
            if holder.removed {
                return Err(Error::not_registered("servant", identity));
            }
            holder.depth += 1;
            holder.read_write |= write;
            return Ok(holder.servant.clone());
        }

        let record = store
            .load_in(identity, &self.txn, write)?
            .ok_or_else(|| Error::not_registered("servant", identity))?;
        let servant = Arc::new(Mutex::new(record.servant));
        self.holders.lock().push(Holder {
            identity: identity.clone(),
            store: store.clone(),
            evictor: evictor.clone(),
            servant: servant.clone(),
            stats: record.stats,
            read_write: write,
            removed: false,
            depth: 1,
        });
        Ok(servant)
    }

    /// Leave a dispatch. The outermost dispatch of an object writes it back if it was mutated and `keep` is set.
    pub(super) fn leave(&self, store: &Arc<ObjectStore<V>>, identity: &Identity, keep: bool) -> Result<()> {
        let holder = {
            let mut holders = self.holders.lock();
            let Some(pos) = holders.iter().rposition(|h| h.matches(store, identity)) else {
                return Ok(());
            };
            holders[pos].depth -= 1;
            if holders[pos].depth > 0 {
                return Ok(());
            }
            holders.remove(pos)
        };
        if !keep {
            return Ok(());
        }

        if holder.read_write && !holder.removed {
            let mut stats = holder.stats;
            stats.record_save(now_millis());
            let servant = holder.servant.lock();
            store.update(identity, &servant, &stats, Some(&self.txn))?;
        }
        if holder.read_write || holder.removed {
            self.invalidate_later(&holder.evictor, store, identity);
        }
        Ok(())
    }

    /// Servant of an object loaded by an enclosing dispatch, and whether it has been removed since.
    pub(super) fn held(&self, store: &Arc<ObjectStore<V>>, identity: &Identity) -> Option<(ServantRef<V>, bool)> {
        self.holders
            .lock()
            .iter()
            .rev()
            .find(|h| h.matches(store, identity))
            .map(|h| (h.servant.clone(), h.removed))
    }

    pub(super) fn mark_removed(&self, store: &Arc<ObjectStore<V>>, identity: &Identity) {
        for holder in self.holders.lock().iter_mut().filter(|h| h.matches(store, identity)) {
            holder.removed = true;
        }
    }

    pub(super) fn invalidate_later(
        &self,
        evictor: &Arc<TransactionalInner<V>>,
        store: &Arc<ObjectStore<V>>,
        identity: &Identity,
    ) {
        self.invalidate.lock().push(Invalidation {
            identity: identity.clone(),
            store: store.clone(),
            evictor: evictor.clone(),
        });
    }
}
