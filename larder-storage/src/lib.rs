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

//! Transactional store abstraction and shared environments for larder.

/// Collection catalog.
pub mod catalog;
/// Transactional store abstraction.
pub mod engine;
/// Shared environment registry.
pub mod environment;
/// Key locks with deadlock detection.
pub mod lock;
/// In-memory reference engine.
pub mod memory;

pub use crate::{
    catalog::{Catalog, CatalogData, CatalogError, CATALOG_TABLE},
    engine::{retry_on_deadlock, with_transaction, Engine, Table, Transaction},
    environment::{EnvironmentConfig, FatalCallback, Registry, SharedEnvironment},
    memory::MemoryEngine,
};
