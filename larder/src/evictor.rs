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

use hashbrown::HashMap;
use itertools::Itertools;
use larder_common::{Error, ErrorKind, Identity, Result, Serializer};
use larder_memory::Element;
use larder_storage::SharedEnvironment;
use parking_lot::RwLock;

use crate::{
    config::EvictorConfig,
    deactivate::{DeactivateController, DeactivateGuard},
    index::IndexRef,
    store::{ObjectStore, DEFAULT_FACET_TABLE},
};

/// State shared by both evictor variants: the environment, the object stores of the facets and the deactivate
/// controller.
pub(crate) struct EvictorCore<V> {
    filename: String,
    config: EvictorConfig,
    env: SharedEnvironment,
    serializer: Arc<dyn Serializer<V>>,
    indices: Vec<IndexRef<V>>,
    stores: RwLock<HashMap<Arc<str>, Arc<ObjectStore<V>>>>,
    controller: DeactivateController,
}

impl<V> EvictorCore<V>
where
    V: Send + 'static,
{
    /// Open the default store, the declared facets and every facet already recorded in the catalog.
    pub fn open(
        env: SharedEnvironment,
        filename: String,
        config: EvictorConfig,
        serializer: Arc<dyn Serializer<V>>,
        indices: Vec<IndexRef<V>>,
        facets: Vec<String>,
    ) -> Result<Self> {
        config.validate()?;
        if filename.is_empty() || filename.contains('/') {
            return Err(Error::new(ErrorKind::Config, "invalid evictor filename").with_context("filename", &filename));
        }

        let core = Self {
            controller: DeactivateController::new(&filename),
            filename,
            config,
            env,
            serializer,
            indices,
            stores: RwLock::new(HashMap::new()),
        };

        core.open_store("", core.config.create_db)?;
        for facet in facets.iter() {
            core.open_store(facet, core.config.create_db)?;
        }

        let prefix = format!("{}/", core.filename);
        let persisted = core
            .env
            .catalog()
            .list(&prefix)?
            .into_iter()
            .filter(|(_, data)| data.evictor)
            .filter_map(|(name, _)| name.strip_prefix(&prefix).map(|facet| facet.to_string()))
            .collect_vec();
        for facet in persisted {
            let facet = match facet.as_str() {
                DEFAULT_FACET_TABLE => continue,
                _ => facet,
            };
            core.open_store(&facet, false)?;
        }

        tracing::info!(
            "[evictor]: {} opened in environment {} with facets {:?}",
            core.filename,
            core.env.name(),
            core.facets()
        );
        Ok(core)
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn config(&self) -> &EvictorConfig {
        &self.config
    }

    pub fn env(&self) -> &SharedEnvironment {
        &self.env
    }

    pub fn controller(&self) -> &DeactivateController {
        &self.controller
    }

    /// Enter the deactivate gate and check the identity.
    pub fn enter(&self, identity: &Identity) -> Result<DeactivateGuard> {
        let guard = self.controller.lock()?;
        if !identity.is_valid() {
            return Err(Error::new(ErrorKind::Config, "invalid identity").with_context("identity", identity));
        }
        Ok(guard)
    }

    /// Get the store of the facet, opening it on first use.
    ///
    /// Fails with [`ErrorKind::NotFound`] if the backing table does not exist and `create` is not set.
    pub fn open_store(&self, facet: &str, create: bool) -> Result<Arc<ObjectStore<V>>> {
        if let Some(store) = self.stores.read().get(facet) {
            return Ok(store.clone());
        }

        let mut stores = self.stores.write();
        if let Some(store) = stores.get(facet) {
            return Ok(store.clone());
        }
        let store = Arc::new(ObjectStore::open(
            &self.env,
            &self.filename,
            facet,
            &self.config,
            self.serializer.clone(),
            &self.indices,
            create,
        )?);
        stores.insert(store.facet().clone(), store.clone());
        Ok(store)
    }

    /// Get the store of an existing facet, `None` if its backing table does not exist.
    pub fn find_store(&self, facet: &str) -> Result<Option<Arc<ObjectStore<V>>>> {
        match self.open_store(facet, false) {
            Ok(store) => Ok(Some(store)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Get the store of the facet if it is already open.
    pub fn loaded_store(&self, facet: &str) -> Option<Arc<ObjectStore<V>>> {
        self.stores.read().get(facet).cloned()
    }

    /// Get the store that maintains the index.
    pub fn index_store(&self, index: &str) -> Result<Option<Arc<ObjectStore<V>>>> {
        let facet = self
            .indices
            .iter()
            .find(|it| it.name() == index)
            .map(|it| it.facet().to_string())
            .ok_or_else(|| Error::new(ErrorKind::NotFound, "index not found").with_context("index", index))?;
        self.find_store(&facet)
    }

    /// Unpin elements that left the eviction queue for good.
    pub fn unpin_all(&self, elements: &[Arc<Element<V>>]) {
        for element in elements {
            if let Some(store) = self.loaded_store(element.facet()) {
                store.cache().unpin_exact(element.identity(), element);
            }
        }
    }

    /// Open stores.
    pub fn stores(&self) -> Vec<Arc<ObjectStore<V>>> {
        self.stores.read().values().cloned().collect()
    }

    /// Facets of the open stores, sorted.
    pub fn facets(&self) -> Vec<String> {
        self.stores.read().keys().map(|facet| facet.to_string()).sorted().collect()
    }

    /// Unpin every cached element of every store.
    pub fn clear_caches(&self) {
        for store in self.stores() {
            let cleared = store.cache().clear();
            tracing::debug!(
                "[evictor]: {} clear {} cached elements of facet {:?}",
                self.filename,
                cleared.len(),
                store.facet()
            );
        }
    }
}
