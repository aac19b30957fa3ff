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

use std::{sync::Arc, time::Duration};

use larder_common::{BincodeSerializer, Result, Serializer};
use larder_storage::SharedEnvironment;
use serde::{de::DeserializeOwned, Serialize};

use crate::{
    background::BackgroundEvictor, config::EvictorConfig, evictor::EvictorCore, index::IndexRef,
    transactional::TransactionalEvictor,
};

/// Evictor builder.
pub struct EvictorBuilder<V> {
    filename: String,
    config: EvictorConfig,
    serializer: Arc<dyn Serializer<V>>,
    indices: Vec<IndexRef<V>>,
    facets: Vec<String>,
}

impl<V: 'static> std::fmt::Debug for EvictorBuilder<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EvictorBuilder")
            .field("filename", &self.filename)
            .field("config", &self.config)
            .field("indices", &self.indices.iter().map(|index| index.name()).collect::<Vec<_>>())
            .field("facets", &self.facets)
            .finish()
    }
}

impl<V> EvictorBuilder<V>
where
    V: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Create an evictor builder that encodes servants with `bincode`.
    ///
    /// `filename` names the collection of the evictor within its environment.
    pub fn new(filename: impl Into<String>) -> Self {
        Self::new_with(filename, Arc::new(BincodeSerializer))
    }
}

impl<V> EvictorBuilder<V>
where
    V: Send + 'static,
{
    /// Create an evictor builder with a custom serializer.
    pub fn new_with(filename: impl Into<String>, serializer: Arc<dyn Serializer<V>>) -> Self {
        Self {
            filename: filename.into(),
            config: EvictorConfig::default(),
            serializer,
            indices: vec![],
            facets: vec![],
        }
    }

    /// Replace the whole config.
    pub fn with_config(mut self, config: EvictorConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the number of idle servants kept in memory.
    ///
    /// Default: `10`.
    pub fn with_evictor_size(mut self, size: usize) -> Self {
        self.config.evictor_size = size;
        self
    }

    /// Set the number of pending changes that wakes the saving thread. `0` disables the size trigger.
    ///
    /// Default: `10`.
    pub fn with_save_size_trigger(mut self, trigger: usize) -> Self {
        self.config.save_size_trigger = trigger;
        self
    }

    /// Set the interval between two background saves. [`Duration::ZERO`] disables the timer.
    ///
    /// Default: `60s`.
    pub fn with_save_period(mut self, period: Duration) -> Self {
        self.config.save_period = period;
        self
    }

    /// Set the maximum number of objects written in one save transaction.
    ///
    /// Default: ten times the save size trigger.
    pub fn with_max_tx_size(mut self, size: usize) -> Self {
        self.config.max_tx_size = Some(size);
        self
    }

    /// Set the maximum time the saving thread waits for a servant lock. Expiry is fatal.
    ///
    /// Default: no timeout.
    pub fn with_stream_timeout(mut self, timeout: Duration) -> Self {
        self.config.stream_timeout = Some(timeout);
        self
    }

    /// Rebuild empty indices from the existing objects on open.
    ///
    /// Default: `false`.
    pub fn with_populate_empty_indices(mut self, populate: bool) -> Self {
        self.config.populate_empty_indices = populate;
        self
    }

    /// Roll back an evictor-owned transaction when the servant returns an [`larder_common::ErrorKind::External`]
    /// error.
    ///
    /// Default: `false`.
    pub fn with_rollback_on_user_exception(mut self, rollback: bool) -> Self {
        self.config.rollback_on_user_exception = rollback;
        self
    }

    /// Persist object statistics along with the servants.
    ///
    /// Default: `true`.
    pub fn with_keep_stats(mut self, keep: bool) -> Self {
        self.config.keep_stats = keep;
        self
    }

    /// Create missing tables on open.
    ///
    /// Default: `true`.
    pub fn with_create_db(mut self, create: bool) -> Self {
        self.config.create_db = create;
        self
    }

    /// Maintain a secondary index.
    pub fn with_index(mut self, index: IndexRef<V>) -> Self {
        self.indices.push(index);
        self
    }

    /// Replace the serializer.
    pub fn with_serializer(mut self, serializer: Arc<dyn Serializer<V>>) -> Self {
        self.serializer = serializer;
        self
    }

    /// Open the store of a facet eagerly.
    pub fn with_facet(mut self, facet: impl Into<String>) -> Self {
        self.facets.push(facet.into());
        self
    }

    fn core(self, env: &SharedEnvironment) -> Result<EvictorCore<V>> {
        EvictorCore::open(env.clone(), self.filename, self.config, self.serializer, self.indices, self.facets)
    }

    /// Build an evictor with write-behind persistence and start its saving thread.
    pub fn background(self, env: &SharedEnvironment) -> Result<BackgroundEvictor<V>> {
        BackgroundEvictor::open(self.core(env)?)
    }

    /// Build an evictor with transactional persistence.
    pub fn transactional(self, env: &SharedEnvironment) -> Result<TransactionalEvictor<V>> {
        Ok(TransactionalEvictor::open(self.core(env)?))
    }
}
