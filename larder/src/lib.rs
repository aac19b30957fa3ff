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

//! larder - evictors that cache persistent servants on top of a transactional store.
//!
//! Two evictor variants share the object stores, caches and eviction policy:
//!
//! - [`BackgroundEvictor`] serves dispatches from memory and persists changes with a dedicated saving thread.
//! - [`TransactionalEvictor`] persists every mutation synchronously within a store transaction.
//!
//! Both are built with [`EvictorBuilder`] on top of a [`SharedEnvironment`] opened from a [`Registry`].

mod background;
mod builder;
mod config;
mod deactivate;
mod dispatch;
mod evictor;
mod index;
mod store;
mod transactional;

/// Commonly used items.
pub mod prelude;

pub use larder_common::{
    BincodeSerializer, Error, ErrorKind, Identity, ObjectRecord, Result, Serializer, Statistics, TxnId,
};
pub use larder_memory::{ServantRef, Status};
pub use larder_storage::{Engine, EnvironmentConfig, MemoryEngine, Registry, SharedEnvironment, Transaction};

pub use crate::{
    background::{BackgroundEvictor, Cookie},
    builder::EvictorBuilder,
    config::EvictorConfig,
    deactivate::{DeactivateController, DeactivateGuard},
    dispatch::{dispatch_with, Access, Request, ServantLocator, TransactionMode},
    index::{FnIndex, Index, IndexRef},
    store::{table_name, ObjectStore, StreamedOp, DEFAULT_FACET_TABLE},
    transactional::{TransactionalContext, TransactionalEvictor},
};
