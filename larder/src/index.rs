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

use std::{fmt::Debug, marker::PhantomData, sync::Arc};

use bytes::{BufMut, Bytes, BytesMut};

/// A secondary index over the servants of one facet.
///
/// The index maps the secondary key of each servant to its identity. Servants without a secondary key are not
/// indexed.
pub trait Index<V>: Send + Sync + 'static {
    /// Index name, unique per evictor.
    fn name(&self) -> &str;

    /// Facet of the indexed servants.
    fn facet(&self) -> &str {
        ""
    }

    /// Secondary key of the servant.
    fn secondary_key(&self, servant: &V) -> Option<Bytes>;
}

/// [`Index`] implementation with a key function.
pub struct FnIndex<V, F> {
    name: String,
    facet: String,
    f: F,
    _marker: PhantomData<fn(&V)>,
}

impl<V, F> Debug for FnIndex<V, F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnIndex")
            .field("name", &self.name)
            .field("facet", &self.facet)
            .finish()
    }
}

impl<V, F> FnIndex<V, F>
where
    F: Fn(&V) -> Option<Bytes> + Send + Sync + 'static,
{
    /// Create an index on the default facet.
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            facet: String::new(),
            f,
            _marker: PhantomData,
        }
    }

    /// Index another facet.
    pub fn with_facet(mut self, facet: impl Into<String>) -> Self {
        self.facet = facet.into();
        self
    }
}

impl<V, F> Index<V> for FnIndex<V, F>
where
    V: 'static,
    F: Fn(&V) -> Option<Bytes> + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn facet(&self) -> &str {
        &self.facet
    }

    fn secondary_key(&self, servant: &V) -> Option<Bytes> {
        (self.f)(servant)
    }
}

/// Shared handle of an index.
pub type IndexRef<V> = Arc<dyn Index<V>>;

/// Key prefix of all entries of a secondary key.
pub(crate) fn entry_prefix(secondary: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(4 + secondary.len());
    buf.put_u32(secondary.len() as u32);
    buf.put_slice(secondary);
    buf.freeze()
}

/// Entry key of an indexed object: the length-prefixed secondary key followed by the object key.
pub(crate) fn entry_key(secondary: &[u8], object_key: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(4 + secondary.len() + object_key.len());
    buf.put_u32(secondary.len() as u32);
    buf.put_slice(secondary);
    buf.put_slice(object_key);
    buf.freeze()
}

/// Object key of an entry key with the given prefix.
pub(crate) fn object_key(entry: &Bytes, prefix_len: usize) -> Bytes {
    entry.slice(prefix_len..)
}
