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

use bytes::Bytes;
use larder_common::{Error, ErrorKind, Result};
use serde::{Deserialize, Serialize};

use crate::engine::{retry_on_deadlock, Engine, Table};

/// Name of the reserved catalog table.
pub const CATALOG_TABLE: &str = "__catalog";

/// Catalog record of one collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogData {
    /// Whether the collection is managed by an evictor.
    pub evictor: bool,
    /// Type name of the keys.
    pub key_type: String,
    /// Type name of the values.
    pub value_type: String,
}

/// Mismatch between a persisted catalog record and the requested usage.
#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    /// The collection exists but is not evictor-managed, or the other way around.
    #[error("collection {name} evictor flag is {found}, expected {expected}")]
    Evictor {
        /// Collection name.
        name: String,
        /// Persisted flag.
        found: bool,
        /// Requested flag.
        expected: bool,
    },
    /// The persisted key type differs.
    #[error("collection {name} key type is {found}, expected {expected}")]
    KeyType {
        /// Collection name.
        name: String,
        /// Persisted type.
        found: String,
        /// Requested type.
        expected: String,
    },
    /// The persisted value type differs.
    #[error("collection {name} value type is {found}, expected {expected}")]
    ValueType {
        /// Collection name.
        name: String,
        /// Persisted type.
        found: String,
        /// Requested type.
        expected: String,
    },
}

impl CatalogData {
    fn check(&self, name: &str, expected: &CatalogData) -> std::result::Result<(), CatalogError> {
        if self.evictor != expected.evictor {
            return Err(CatalogError::Evictor {
                name: name.to_string(),
                found: self.evictor,
                expected: expected.evictor,
            });
        }
        if self.key_type != expected.key_type {
            return Err(CatalogError::KeyType {
                name: name.to_string(),
                found: self.key_type.clone(),
                expected: expected.key_type.clone(),
            });
        }
        if self.value_type != expected.value_type {
            return Err(CatalogError::ValueType {
                name: name.to_string(),
                found: self.value_type.clone(),
                expected: expected.value_type.clone(),
            });
        }
        Ok(())
    }
}

/// Catalog of the collections of an environment.
#[derive(Debug, Clone)]
pub struct Catalog {
    table: Table,
}

impl Catalog {
    /// Open the catalog table of the engine, creating it if missing.
    pub fn open(engine: &Arc<dyn Engine>) -> Result<Self> {
        let table = Table::open(engine, CATALOG_TABLE, true)?;
        Ok(Self { table })
    }

    /// Catalog record of the collection.
    pub fn get(&self, name: &str) -> Result<Option<CatalogData>> {
        let value = retry_on_deadlock("catalog get", || self.table.get(name.as_bytes(), None))?;
        value.map(|v| bincode::deserialize(&v).map_err(Error::bincode_error)).transpose()
    }

    /// Register the collection, or check that its persisted record matches.
    ///
    /// Returns `true` if the collection is newly registered.
    pub fn register(&self, name: &str, data: &CatalogData) -> Result<bool> {
        let value: Bytes = bincode::serialize(data)?.into();
        loop {
            if let Some(existing) = self.get(name)? {
                existing
                    .check(name, data)
                    .map_err(|e| Error::new(ErrorKind::Mismatch, "catalog mismatch").with_source(e))?;
                return Ok(false);
            }
            let key = Bytes::copy_from_slice(name.as_bytes());
            if retry_on_deadlock("catalog register", || {
                self.table.put_no_overwrite(key.clone(), value.clone(), None)
            })? {
                tracing::info!("[registry]: register collection {name} in catalog");
                return Ok(true);
            }
            // Lost a race with a concurrent registration, check the winner.
        }
    }

    /// All collections whose name starts with the prefix.
    pub fn list(&self, prefix: &str) -> Result<Vec<(String, CatalogData)>> {
        let pairs = retry_on_deadlock("catalog list", || self.table.scan_prefix(prefix.as_bytes(), None))?;
        pairs
            .into_iter()
            .map(|(k, v)| {
                let name = String::from_utf8_lossy(&k).into_owned();
                let data = bincode::deserialize(&v).map_err(Error::bincode_error)?;
                Ok((name, data))
            })
            .collect()
    }
}
