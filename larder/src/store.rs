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

use std::{fmt::Debug, sync::Arc};

use bytes::Bytes;
use larder_common::{Error, ErrorKind, Identity, ObjectRecord, Result, Serializer, Statistics};
use larder_memory::{BoundedCache, Element};
use larder_storage::{retry_on_deadlock, with_transaction, CatalogData, SharedEnvironment, Table, Transaction};

use crate::{
    config::EvictorConfig,
    index::{entry_key, entry_prefix, object_key, IndexRef},
};

/// Table name suffix of the default facet.
pub const DEFAULT_FACET_TABLE: &str = "$default";

/// Table name of the objects of a facet.
pub fn table_name(filename: &str, facet: &str) -> String {
    match facet.is_empty() {
        true => format!("{filename}/{DEFAULT_FACET_TABLE}"),
        false => format!("{filename}/{facet}"),
    }
}

fn index_table_name(filename: &str, index: &str, facet: &str) -> String {
    table_name(&format!("{filename}.{index}"), facet)
}

/// Attach the transaction to a deadlock error, so that only the owner of the transaction retries.
fn tag<T>(txn: &Transaction, res: Result<T>) -> Result<T> {
    res.map_err(|e| match e.is_deadlock() {
        true => e.with_txn(txn.id()),
        false => e,
    })
}

struct IndexTable<V> {
    index: IndexRef<V>,
    table: Table,
}

/// A prepared write of the saving thread.
#[derive(Debug)]
pub enum StreamedOp {
    /// Write the serialized servant and its secondary keys.
    Write {
        /// Serialized object record.
        value: Bytes,
        /// Secondary key of each index of the store.
        secondary: Vec<Option<Bytes>>,
    },
    /// Delete the object.
    Delete,
}

/// One logical collection of servants, backed by one table, with its cache.
pub struct ObjectStore<V> {
    facet: Arc<str>,
    table: Table,
    serializer: Arc<dyn Serializer<V>>,
    keep_stats: bool,
    indices: Vec<IndexTable<V>>,
    cache: BoundedCache<Identity, Element<V>>,
}

impl<V: 'static> Debug for ObjectStore<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectStore")
            .field("facet", &self.facet)
            .field("table", &self.table.name())
            .field("keep_stats", &self.keep_stats)
            .field("indices", &self.indices.iter().map(|i| i.index.name()).collect::<Vec<_>>())
            .field("cache", &self.cache)
            .finish()
    }
}

impl<V> ObjectStore<V>
where
    V: Send + 'static,
{
    /// Open the store of a facet, registering it in the catalog.
    ///
    /// Fails with [`ErrorKind::NotFound`] if the table is missing and `create` is not set, or with
    /// [`ErrorKind::Mismatch`] if the catalog records another usage of the table.
    pub(crate) fn open(
        env: &SharedEnvironment,
        filename: &str,
        facet: &str,
        config: &EvictorConfig,
        serializer: Arc<dyn Serializer<V>>,
        indices: &[IndexRef<V>],
        create: bool,
    ) -> Result<Self> {
        let name = table_name(filename, facet);
        let table = Table::open(env.engine(), &name, create)?;
        env.catalog().register(
            &name,
            &CatalogData {
                evictor: true,
                key_type: std::any::type_name::<Identity>().to_string(),
                value_type: std::any::type_name::<V>().to_string(),
            },
        )?;

        let indices = indices
            .iter()
            .filter(|index| index.facet() == facet)
            .map(|index| {
                let table = Table::open(env.engine(), &index_table_name(filename, index.name(), facet), true)?;
                Ok(IndexTable {
                    index: index.clone(),
                    table,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let store = Self {
            facet: Arc::from(facet),
            table,
            serializer,
            keep_stats: config.keep_stats,
            indices,
            cache: BoundedCache::new(),
        };
        store.check_indices(config.populate_empty_indices)?;

        tracing::info!("[evictor]: open store {name}");
        Ok(store)
    }

    fn check_indices(&self, populate: bool) -> Result<()> {
        if self.indices.is_empty() || self.table.is_empty(None)? {
            return Ok(());
        }
        for it in self.indices.iter() {
            if !it.table.is_empty(None)? {
                continue;
            }
            if !populate {
                tracing::warn!(
                    "[evictor]: index {} of {} is empty while the store is not",
                    it.index.name(),
                    self.table.name()
                );
                continue;
            }
            let populated = with_transaction(self.table.engine(), "populate index", |txn| {
                let mut populated = 0;
                for (key, value) in self.table.scan_prefix(&[], Some(txn))? {
                    let record = self.decode(&value)?;
                    if let Some(secondary) = it.index.secondary_key(&record.servant) {
                        it.table.put(entry_key(&secondary, &key), Bytes::new(), Some(txn))?;
                        populated += 1;
                    }
                }
                Ok(populated)
            })?;
            tracing::info!(
                "[evictor]: populate index {} of {} with {populated} entries",
                it.index.name(),
                self.table.name()
            );
        }
        Ok(())
    }

    /// Facet of the store.
    pub fn facet(&self) -> &Arc<str> {
        &self.facet
    }

    /// Backing table.
    pub fn table(&self) -> &Table {
        &self.table
    }

    /// Cache of the store.
    pub fn cache(&self) -> &BoundedCache<Identity, Element<V>> {
        &self.cache
    }

    /// Encode the identity into its key.
    pub fn marshal_key(&self, identity: &Identity) -> Result<Bytes> {
        self.serializer.marshal_key(identity)
    }

    fn decode(&self, value: &[u8]) -> Result<ObjectRecord<V>> {
        self.serializer.unmarshal_value(value, self.keep_stats)
    }

    fn secondary(&self, servant: &V) -> Vec<Option<Bytes>> {
        self.indices.iter().map(|it| it.index.secondary_key(servant)).collect()
    }

    /// Secondary keys of the persisted version of the object, locking it within the transaction.
    fn persisted_secondary(&self, key: &[u8], txn: &Transaction) -> Result<Vec<Option<Bytes>>> {
        if self.indices.is_empty() {
            return Ok(vec![]);
        }
        let secondary = match self.table.get_for_update(key, txn)? {
            Some(value) => self.secondary(&self.decode(&value)?.servant),
            None => vec![None; self.indices.len()],
        };
        Ok(secondary)
    }

    fn reindex(&self, key: &[u8], old: &[Option<Bytes>], new: &[Option<Bytes>], txn: &Transaction) -> Result<()> {
        for ((it, old), new) in self.indices.iter().zip(old.iter()).zip(new.iter()) {
            if old == new {
                continue;
            }
            if let Some(old) = old {
                it.table.delete(&entry_key(old, key), Some(txn))?;
            }
            if let Some(new) = new {
                it.table.put(entry_key(new, key), Bytes::new(), Some(txn))?;
            }
        }
        Ok(())
    }

    /// Run `f` in the caller's transaction, or in an own transaction retried on deadlock.
    fn run<T>(
        &self,
        what: &str,
        txn: Option<&Transaction>,
        mut f: impl FnMut(&Transaction) -> Result<T>,
    ) -> Result<T> {
        match txn {
            Some(txn) => tag(txn, f(txn)),
            None => with_transaction(self.table.engine(), what, f),
        }
    }

    fn read(&self, key: &[u8]) -> Result<Option<Bytes>> {
        retry_on_deadlock("read", || self.table.get(key, None))
    }

    /// Get the cached element of the object, loading it from disk on miss.
    ///
    /// Returns `None` if the object is neither cached nor persisted.
    pub fn load(&self, identity: &Identity) -> Result<Option<Arc<Element<V>>>> {
        self.cache.pin(identity, || -> Result<_> {
            let key = self.marshal_key(identity)?;
            match self.read(&key)? {
                Some(value) => Ok(Some(Element::clean(identity.clone(), self.facet.clone(), self.decode(&value)?))),
                None => Ok(None),
            }
        })
    }

    /// Get the cached element of the object, loading it from disk, or caching a dead placeholder if it does not
    /// exist.
    pub fn pin_or_dead(&self, identity: &Identity) -> Result<Arc<Element<V>>> {
        let element = self.cache.pin(identity, || {
            let key = self.marshal_key(identity)?;
            let element = match self.read(&key)? {
                Some(value) => Element::clean(identity.clone(), self.facet.clone(), self.decode(&value)?),
                None => Element::dead(identity.clone(), self.facet.clone()),
            };
            Ok::<_, Error>(Some(element))
        })?;
        element.ok_or_else(|| {
            Error::new(ErrorKind::Storage, "placeholder element is not cached").with_context("identity", identity)
        })
    }

    /// Read the object within the transaction, bypassing the cache.
    pub fn load_in(
        &self,
        identity: &Identity,
        txn: &Transaction,
        for_update: bool,
    ) -> Result<Option<ObjectRecord<V>>> {
        let key = self.marshal_key(identity)?;
        let value = match for_update {
            true => self.table.get_for_update(&key, txn),
            false => self.table.get(&key, Some(txn)),
        };
        tag(txn, value)?.map(|value| self.decode(&value)).transpose()
    }

    /// Write the object.
    pub fn update(
        &self,
        identity: &Identity,
        servant: &V,
        stats: &Statistics,
        txn: Option<&Transaction>,
    ) -> Result<()> {
        let key = self.marshal_key(identity)?;
        let value = self.serializer.marshal_value(servant, stats, self.keep_stats)?;
        let new = self.secondary(servant);
        self.run("update", txn, |txn| {
            let old = self.persisted_secondary(&key, txn)?;
            self.table.put(key.clone(), value.clone(), Some(txn))?;
            self.reindex(&key, &old, &new, txn)
        })
    }

    /// Write the object only if it does not exist. Returns `false` if it exists.
    pub fn insert(
        &self,
        identity: &Identity,
        servant: &V,
        stats: &Statistics,
        txn: Option<&Transaction>,
    ) -> Result<bool> {
        let key = self.marshal_key(identity)?;
        let value = self.serializer.marshal_value(servant, stats, self.keep_stats)?;
        let new = self.secondary(servant);
        let none = vec![None; self.indices.len()];
        self.run("insert", txn, |txn| {
            if !self.table.put_no_overwrite(key.clone(), value.clone(), Some(txn))? {
                return Ok(false);
            }
            self.reindex(&key, &none, &new, txn)?;
            Ok(true)
        })
    }

    /// Delete the object. Returns `false` if it does not exist.
    pub fn remove(&self, identity: &Identity, txn: Option<&Transaction>) -> Result<bool> {
        let key = self.marshal_key(identity)?;
        let none = vec![None; self.indices.len()];
        self.run("remove", txn, |txn| {
            let old = self.persisted_secondary(&key, txn)?;
            if !self.table.delete(&key, Some(txn))? {
                return Ok(false);
            }
            self.reindex(&key, &old, &none, txn)?;
            Ok(true)
        })
    }

    /// Returns `true` if the object is persisted, as seen by the transaction if any.
    pub fn db_has_object(&self, identity: &Identity, txn: Option<&Transaction>) -> Result<bool> {
        let key = self.marshal_key(identity)?;
        let value = match txn {
            Some(txn) => tag(txn, self.table.get(&key, Some(txn)))?,
            None => self.read(&key)?,
        };
        Ok(value.is_some())
    }

    /// Serialize a servant for the saving thread. The caller holds the servant lock.
    pub fn stream(&self, servant: &V, stats: &Statistics) -> Result<StreamedOp> {
        Ok(StreamedOp::Write {
            value: self.serializer.marshal_value(servant, stats, self.keep_stats)?,
            secondary: self.secondary(servant),
        })
    }

    /// Apply a prepared write of the saving thread within the transaction.
    pub fn save(&self, key: &Bytes, op: &StreamedOp, txn: &Transaction) -> Result<()> {
        tag(txn, self.apply(key, op, txn))
    }

    fn apply(&self, key: &Bytes, op: &StreamedOp, txn: &Transaction) -> Result<()> {
        let old = self.persisted_secondary(key, txn)?;
        match op {
            StreamedOp::Write { value, secondary } => {
                self.table.put(key.clone(), value.clone(), Some(txn))?;
                self.reindex(key, &old, secondary, txn)
            }
            StreamedOp::Delete => {
                self.table.delete(key, Some(txn))?;
                self.reindex(key, &old, &vec![None; self.indices.len()], txn)
            }
        }
    }

    /// Identities of all persisted objects, sorted.
    pub fn identities(&self, txn: Option<&Transaction>) -> Result<Vec<Identity>> {
        let pairs = match txn {
            Some(txn) => tag(txn, self.table.scan_prefix(&[], Some(txn)))?,
            None => retry_on_deadlock("scan", || self.table.scan_prefix(&[], None))?,
        };
        let mut identities = pairs
            .into_iter()
            .map(|(key, _)| self.serializer.unmarshal_key(&key))
            .collect::<Result<Vec<_>>>()?;
        identities.sort();
        Ok(identities)
    }

    /// Returns `true` if the store maintains the index.
    pub fn has_index(&self, name: &str) -> bool {
        self.indices.iter().any(|it| it.index.name() == name)
    }

    /// Identities of the persisted objects whose secondary key in the index equals `secondary`, sorted.
    pub fn find(&self, index: &str, secondary: &[u8], txn: Option<&Transaction>) -> Result<Vec<Identity>> {
        let it = self
            .indices
            .iter()
            .find(|it| it.index.name() == index)
            .ok_or_else(|| Error::new(ErrorKind::NotFound, "index not found").with_context("index", index))?;
        let prefix = entry_prefix(secondary);
        let pairs = match txn {
            Some(txn) => tag(txn, it.table.scan_prefix(&prefix, Some(txn)))?,
            None => retry_on_deadlock("find", || it.table.scan_prefix(&prefix, None))?,
        };
        let mut identities = pairs
            .into_iter()
            .map(|(entry, _)| self.serializer.unmarshal_key(&object_key(&entry, prefix.len())))
            .collect::<Result<Vec<_>>>()?;
        identities.sort();
        Ok(identities)
    }
}

#[cfg(test)]
mod tests {
    use larder_common::BincodeSerializer;
    use larder_storage::{EnvironmentConfig, Registry};

    use super::*;
    use crate::index::FnIndex;

    fn open(env: &SharedEnvironment, indices: &[IndexRef<(String, u64)>]) -> ObjectStore<(String, u64)> {
        ObjectStore::open(
            env,
            "accounts",
            "",
            &EvictorConfig::default(),
            Arc::new(BincodeSerializer),
            indices,
            true,
        )
        .unwrap()
    }

    fn env(registry: &Registry) -> SharedEnvironment {
        registry
            .open("env", &EnvironmentConfig::default().with_checkpoint_period(std::time::Duration::ZERO))
            .unwrap()
    }

    #[test_log::test]
    fn test_crud() {
        let registry = Registry::new();
        let env = env(&registry);
        let store = open(&env, &[]);
        let id = Identity::new("alice");
        let stats = Statistics::created(1);

        assert!(store.insert(&id, &("alice".to_string(), 1), &stats, None).unwrap());
        assert!(!store.insert(&id, &("alice".to_string(), 2), &stats, None).unwrap());
        assert!(store.db_has_object(&id, None).unwrap());

        store.update(&id, &("alice".to_string(), 3), &stats, None).unwrap();
        let element = store.load(&id).unwrap().unwrap();
        assert_eq!(element.lifecycle().servant().unwrap().lock().1, 3);
        assert_eq!(element.lifecycle().stats(), &stats);

        assert_eq!(store.identities(None).unwrap(), vec![id.clone()]);
        assert!(store.remove(&id, None).unwrap());
        assert!(!store.remove(&id, None).unwrap());
        assert!(!store.db_has_object(&id, None).unwrap());
    }

    #[test_log::test]
    fn test_transactional_read_your_writes() {
        let registry = Registry::new();
        let env = env(&registry);
        let store = open(&env, &[]);
        let id = Identity::new("bob");

        let txn = Transaction::begin(env.engine()).unwrap();
        store.insert(&id, &("bob".to_string(), 7), &Statistics::created(1), Some(&txn)).unwrap();
        assert_eq!(store.load_in(&id, &txn, false).unwrap().unwrap().servant.1, 7);
        assert!(store.load(&id).unwrap().is_none());
        txn.abort().unwrap();

        assert!(!store.db_has_object(&id, None).unwrap());
    }

    #[test_log::test]
    fn test_pin_or_dead() {
        let registry = Registry::new();
        let env = env(&registry);
        let store = open(&env, &[]);
        let id = Identity::new("carol");

        let element = store.pin_or_dead(&id).unwrap();
        assert_eq!(element.status(), larder_memory::Status::Dead);
        assert!(Arc::ptr_eq(&element, &store.cache().get_if_pinned(&id).unwrap()));
    }

    #[test_log::test]
    fn test_index_maintenance() {
        let registry = Registry::new();
        let env = env(&registry);
        let index: IndexRef<(String, u64)> =
            Arc::new(FnIndex::new("by_owner", |v: &(String, u64)| Some(Bytes::from(v.0.clone()))));
        let store = open(&env, &[index]);
        let stats = Statistics::created(1);

        store.insert(&Identity::new("a1"), &("alice".to_string(), 1), &stats, None).unwrap();
        store.insert(&Identity::new("a2"), &("alice".to_string(), 2), &stats, None).unwrap();
        store.insert(&Identity::new("b1"), &("bob".to_string(), 3), &stats, None).unwrap();
        assert_eq!(
            store.find("by_owner", b"alice", None).unwrap(),
            vec![Identity::new("a1"), Identity::new("a2")]
        );

        store.update(&Identity::new("a2"), &("bob".to_string(), 2), &stats, None).unwrap();
        assert_eq!(store.find("by_owner", b"alice", None).unwrap(), vec![Identity::new("a1")]);
        assert_eq!(store.find("by_owner", b"bob", None).unwrap().len(), 2);

        store.remove(&Identity::new("b1"), None).unwrap();
        assert_eq!(store.find("by_owner", b"bob", None).unwrap(), vec![Identity::new("a2")]);

        let err = store.find("missing", b"bob", None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test_log::test]
    fn test_catalog_mismatch() {
        let registry = Registry::new();
        let env = env(&registry);
        let _store = open(&env, &[]);
        let err = ObjectStore::<u64>::open(
            &env,
            "accounts",
            "",
            &EvictorConfig::default(),
            Arc::new(BincodeSerializer),
            &[],
            true,
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Mismatch);
    }

    #[test_log::test]
    fn test_missing_table() {
        let registry = Registry::new();
        let env = env(&registry);
        let err = ObjectStore::<u64>::open(
            &env,
            "accounts",
            "",
            &EvictorConfig::default(),
            Arc::new(BincodeSerializer),
            &[],
            false,
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }
}
