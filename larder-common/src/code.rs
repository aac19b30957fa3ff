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

use bytes::Bytes;
use serde::{de::DeserializeOwned, Serialize};

use crate::{error::Result, identity::Identity, stats::Statistics};

/// The value half of a persisted key/value pair: the servant state and its statistics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectRecord<V> {
    /// Servant state.
    pub servant: V,
    /// Statistics, defaulted when the collection does not keep statistics.
    pub stats: Statistics,
}

/// Reversible binary encoding of identities and object records.
///
/// With `keep_stats` disabled, the compact format only contains the servant state.
pub trait Serializer<V>: Send + Sync + 'static {
    /// Encode an identity into the key bytes.
    fn marshal_key(&self, identity: &Identity) -> Result<Bytes>;

    /// Decode the key bytes into an identity.
    fn unmarshal_key(&self, bytes: &[u8]) -> Result<Identity>;

    /// Encode a servant and its statistics into the value bytes.
    fn marshal_value(&self, servant: &V, stats: &Statistics, keep_stats: bool) -> Result<Bytes>;

    /// Decode the value bytes into an object record.
    fn unmarshal_value(&self, bytes: &[u8], keep_stats: bool) -> Result<ObjectRecord<V>>;
}

/// [`Serializer`] implementation with `bincode` for any serde-compatible servant type.
#[derive(Debug, Clone, Copy, Default)]
pub struct BincodeSerializer;

impl<V> Serializer<V> for BincodeSerializer
where
    V: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn marshal_key(&self, identity: &Identity) -> Result<Bytes> {
        Ok(bincode::serialize(identity)?.into())
    }

    fn unmarshal_key(&self, bytes: &[u8]) -> Result<Identity> {
        Ok(bincode::deserialize(bytes)?)
    }

    fn marshal_value(&self, servant: &V, stats: &Statistics, keep_stats: bool) -> Result<Bytes> {
        let buf = match keep_stats {
            true => bincode::serialize(&(servant, stats))?,
            false => bincode::serialize(servant)?,
        };
        Ok(buf.into())
    }

    fn unmarshal_value(&self, bytes: &[u8], keep_stats: bool) -> Result<ObjectRecord<V>> {
        let record = match keep_stats {
            true => {
                let (servant, stats): (V, Statistics) = bincode::deserialize(bytes)?;
                ObjectRecord { servant, stats }
            }
            false => ObjectRecord {
                servant: bincode::deserialize(bytes)?,
                stats: Statistics::default(),
            },
        };
        Ok(record)
    }
}
