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

//! In-memory components of larder: the eviction queue, the bounded cache and the evictor element.

/// Bounded cache with pinning and in-flight load latch.
pub mod cache;
/// Evictor element and lifecycle state machine.
pub mod element;
/// LRU over evictor elements.
pub mod lru;
/// Eviction queue with stable position tokens.
pub mod queue;

pub use crate::{
    cache::BoundedCache,
    element::{Element, Flush, Lifecycle, Residency, ServantRef, Status},
    lru::ElementLru,
    queue::{EvictionQueue, Token},
};
