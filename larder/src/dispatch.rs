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

use larder_common::{Error, Identity, Result};
use larder_memory::ServantRef;

/// Whether an operation reads or mutates its servant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Access {
    /// The operation only reads the servant.
    #[default]
    Read,
    /// The operation mutates the servant.
    Write,
}

/// Transaction attribute of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TransactionMode {
    /// Must run without a transaction.
    Never,
    /// Runs with the caller's transaction if there is one.
    Supports,
    /// Requires a transaction supplied by the caller.
    Mandatory,
    /// Runs with the caller's transaction, or starts one.
    #[default]
    Required,
}

/// An incoming request for a servant.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Request {
    /// Identity of the target object.
    pub identity: Identity,
    /// Facet of the target object. The empty string is the default facet.
    pub facet: String,
    /// Whether the operation mutates the servant.
    pub access: Access,
    /// Transaction attribute of the operation.
    pub mode: TransactionMode,
}

impl Request {
    /// A read request for the default facet.
    pub fn read(identity: impl Into<Identity>) -> Self {
        Self {
            identity: identity.into(),
            facet: String::new(),
            access: Access::Read,
            mode: TransactionMode::default(),
        }
    }

    /// A write request for the default facet.
    pub fn write(identity: impl Into<Identity>) -> Self {
        Self {
            access: Access::Write,
            ..Self::read(identity)
        }
    }

    /// Target a facet.
    pub fn with_facet(mut self, facet: impl Into<String>) -> Self {
        self.facet = facet.into();
        self
    }

    /// Set the transaction attribute.
    pub fn with_mode(mut self, mode: TransactionMode) -> Self {
        self.mode = mode;
        self
    }

    /// Returns `true` if the operation mutates the servant.
    pub fn is_write(&self) -> bool {
        self.access == Access::Write
    }
}

/// Locates servants for a dispatcher.
///
/// The dispatcher calls [`ServantLocator::locate`] before invoking an operation and hands the cookie back to
/// [`ServantLocator::finished`] afterwards. The locator never calls into the dispatcher.
pub trait ServantLocator<V> {
    /// Opaque per-request state.
    type Cookie;

    /// Find the servant of the object. Returns `None` if the object does not exist.
    fn locate(&self, identity: &Identity, facet: &str) -> Result<Option<(ServantRef<V>, Self::Cookie)>>;

    /// Report the completion of an operation on a located servant.
    fn finished(&self, cookie: Self::Cookie, mutating: bool) -> Result<()>;
}

/// Dispatch a request through a [`ServantLocator`], running `f` with the servant locked.
pub fn dispatch_with<V, L, R, F>(locator: &L, request: &Request, f: F) -> Result<R>
where
    L: ServantLocator<V>,
    F: FnOnce(&mut V) -> Result<R>,
{
    let Some((servant, cookie)) = locator.locate(&request.identity, &request.facet)? else {
        return Err(Error::not_registered("servant", &request.identity));
    };
    let res = {
        let mut guard = servant.lock();
        f(&mut guard)
    };
    locator.finished(cookie, request.is_write())?;
    res
}
