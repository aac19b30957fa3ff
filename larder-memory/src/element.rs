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

//! Evictor element and its lifecycle state machine.
//!
//! An element is split into two parts that are protected separately:
//!
//! - [`Lifecycle`] holds the status and the servant. It is guarded by the element lock, which the saving thread
//!   takes to capture a point-in-time view of the element without holding the evictor lock.
//! - [`Residency`] holds the usage and keep counters, the stale flag and the eviction queue position. It is only
//!   read or written while the evictor lock is held.

use std::sync::Arc;

use larder_common::{Error, Identity, ObjectRecord, Result, Statistics};
use parking_lot::{Mutex, MutexGuard};

use crate::queue::Token;

/// Shared handle of a servant. Dispatch and the saving thread lock it independently.
pub type ServantRef<V> = Arc<Mutex<V>>;

/// Lifecycle status of an evictor element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    /// Loaded from disk, or saved since the last change.
    Clean,
    /// Added, never saved.
    Created,
    /// Changed since the last save.
    Modified,
    /// Removed, the deletion is not saved yet.
    Destroyed,
    /// Does not exist, neither in memory nor on disk.
    Dead,
}

impl Status {
    /// Returns `true` if the object exists from the point of view of the application.
    ///
    /// [`Status::Dead`] and [`Status::Destroyed`] both mean "not found".
    pub fn exists(self) -> bool {
        matches!(self, Status::Clean | Status::Created | Status::Modified)
    }
}

/// What the saving thread must write for an element.
#[derive(Debug)]
pub enum Flush<V> {
    /// Write the current servant state.
    Write {
        /// The servant to serialize.
        servant: ServantRef<V>,
        /// Statistics updated for this save.
        stats: Statistics,
    },
    /// Delete the persisted record.
    Delete,
}

/// Status and servant of an element.
#[derive(Debug)]
pub struct Lifecycle<V> {
    status: Status,
    servant: Option<ServantRef<V>>,
    stats: Statistics,
}

impl<V> Lifecycle<V> {
    /// Current status.
    pub fn status(&self) -> Status {
        self.status
    }

    /// The servant, absent for dead and destroyed elements.
    pub fn servant(&self) -> Option<&ServantRef<V>> {
        self.servant.as_ref()
    }

    /// Statistics of the object.
    pub fn stats(&self) -> &Statistics {
        &self.stats
    }

    /// Register a new servant.
    ///
    /// Returns `true` if the element must be enqueued for saving. A destroyed element is already enqueued and
    /// becomes modified instead.
    pub fn add(&mut self, identity: &Identity, servant: V, now: i64) -> Result<bool> {
        let enqueue = match self.status {
            Status::Clean | Status::Created | Status::Modified => {
                return Err(Error::already_registered("servant", identity));
            }
            Status::Destroyed => {
                self.status = Status::Modified;
                false
            }
            Status::Dead => {
                self.status = Status::Created;
                true
            }
        };
        self.servant = Some(Arc::new(Mutex::new(servant)));
        self.stats = Statistics::created(now);
        Ok(enqueue)
    }

    /// Unregister the servant and return it.
    ///
    /// The returned flag is `true` if the element must be enqueued for saving. A created element was never saved,
    /// so it turns dead without any disk write.
    pub fn remove(&mut self, identity: &Identity) -> Result<(ServantRef<V>, bool)> {
        let enqueue = match self.status {
            Status::Clean => {
                self.status = Status::Destroyed;
                true
            }
            Status::Created => {
                self.status = Status::Dead;
                false
            }
            Status::Modified => {
                self.status = Status::Destroyed;
                false
            }
            Status::Destroyed | Status::Dead => return Err(Error::not_registered("servant", identity)),
        };
        let servant = self.servant.take().ok_or_else(|| Error::not_registered("servant", identity))?;
        Ok((servant, enqueue))
    }

    /// A mutating dispatch has completed.
    ///
    /// Returns `true` if the element must be enqueued for saving.
    pub fn mutated(&mut self) -> bool {
        match self.status {
            Status::Clean => {
                self.status = Status::Modified;
                true
            }
            // Already enqueued, or removed while the dispatch was running.
            Status::Created | Status::Modified | Status::Destroyed | Status::Dead => false,
        }
    }

    /// Capture what the saving thread has to write and mark the element as saved.
    ///
    /// Returns `None` if there is nothing to write.
    pub fn stream(&mut self, now: i64) -> Option<Flush<V>> {
        match self.status {
            Status::Created | Status::Modified => {
                let servant = self.servant.clone()?;
                self.stats.record_save(now);
                self.status = Status::Clean;
                Some(Flush::Write {
                    servant,
                    stats: self.stats,
                })
            }
            Status::Destroyed => {
                self.status = Status::Dead;
                Some(Flush::Delete)
            }
            Status::Clean | Status::Dead => None,
        }
    }
}

/// Cache residency of an element. Only accessed with the evictor lock held.
#[derive(Debug)]
pub struct Residency {
    /// Number of in-flight uses (dispatches and pending saves). `-1` means freshly loaded and never queued.
    pub usage: i32,
    /// Explicit pin depth.
    pub keep: u32,
    /// Permanently evicted. Terminal.
    pub stale: bool,
    /// Position in the eviction queue, present iff the element is queued.
    pub position: Option<Token>,
}

impl Residency {
    /// Returns `true` if nothing holds the element.
    pub fn is_idle(&self) -> bool {
        self.usage <= 0 && self.keep == 0
    }
}

/// In-memory node for one identity within one object store.
#[derive(Debug)]
pub struct Element<V> {
    identity: Identity,
    facet: Arc<str>,
    lifecycle: Mutex<Lifecycle<V>>,
    residency: Mutex<Residency>,
}

impl<V> Element<V> {
    fn new(identity: Identity, facet: Arc<str>, lifecycle: Lifecycle<V>) -> Self {
        Self {
            identity,
            facet,
            lifecycle: Mutex::new(lifecycle),
            residency: Mutex::new(Residency {
                usage: -1,
                keep: 0,
                stale: false,
                position: None,
            }),
        }
    }

    /// Create a clean element populated from a persisted record.
    pub fn clean(identity: Identity, facet: Arc<str>, record: ObjectRecord<V>) -> Self {
        Self::new(
            identity,
            facet,
            Lifecycle {
                status: Status::Clean,
                servant: Some(Arc::new(Mutex::new(record.servant))),
                stats: record.stats,
            },
        )
    }

    /// Create a dead element, a placeholder about to be added.
    pub fn dead(identity: Identity, facet: Arc<str>) -> Self {
        Self::new(
            identity,
            facet,
            Lifecycle {
                status: Status::Dead,
                servant: None,
                stats: Statistics::default(),
            },
        )
    }

    /// Identity of the object.
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Facet of the owning object store.
    pub fn facet(&self) -> &Arc<str> {
        &self.facet
    }

    /// Lock the lifecycle.
    pub fn lifecycle(&self) -> MutexGuard<'_, Lifecycle<V>> {
        self.lifecycle.lock()
    }

    /// Lock the residency. The caller must hold the evictor lock.
    pub fn residency(&self) -> MutexGuard<'_, Residency> {
        self.residency.lock()
    }

    /// Current status.
    pub fn status(&self) -> Status {
        self.lifecycle.lock().status
    }

    /// Returns `true` if the element has been permanently evicted.
    pub fn is_stale(&self) -> bool {
        self.residency.lock().stale
    }
}

#[cfg(test)]
mod tests {
    use larder_common::ErrorKind;

    use super::*;

    fn element(status: Status) -> Element<u64> {
        let id = Identity::new("x");
        let facet: Arc<str> = Arc::from("");
        let e = Element::dead(id.clone(), facet);
        {
            let mut lc = e.lifecycle();
            match status {
                Status::Dead => {}
                Status::Created => {
                    lc.add(&id, 1, 0).unwrap();
                }
                Status::Clean => {
                    lc.add(&id, 1, 0).unwrap();
                    lc.stream(1).unwrap();
                }
                Status::Modified => {
                    lc.add(&id, 1, 0).unwrap();
                    lc.stream(1).unwrap();
                    assert!(lc.mutated());
                }
                Status::Destroyed => {
                    lc.add(&id, 1, 0).unwrap();
                    lc.stream(1).unwrap();
                    lc.remove(&id).unwrap();
                }
            }
        }
        assert_eq!(e.status(), status);
        e
    }

    #[test]
    fn test_add() {
        let id = Identity::new("x");
        for status in [Status::Clean, Status::Created, Status::Modified] {
            let e = element(status);
            let err = e.lifecycle().add(&id, 2, 0).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::AlreadyRegistered);
            assert_eq!(e.status(), status);
        }

        let e = element(Status::Dead);
        assert!(e.lifecycle().add(&id, 2, 0).unwrap());
        assert_eq!(e.status(), Status::Created);

        let e = element(Status::Destroyed);
        assert!(!e.lifecycle().add(&id, 2, 0).unwrap());
        assert_eq!(e.status(), Status::Modified);
        assert_eq!(*e.lifecycle().servant().unwrap().lock(), 2);
    }

    #[test]
    fn test_remove() {
        let id = Identity::new("x");
        let cases = [
            (Status::Clean, Status::Destroyed, true),
            (Status::Created, Status::Dead, false),
            (Status::Modified, Status::Destroyed, false),
        ];
        for (from, to, enqueue) in cases {
            let e = element(from);
            let (servant, enq) = e.lifecycle().remove(&id).unwrap();
            assert_eq!(*servant.lock(), 1);
            assert_eq!(enq, enqueue);
            assert_eq!(e.status(), to);
            assert!(e.lifecycle().servant().is_none());
        }

        for status in [Status::Destroyed, Status::Dead] {
            let e = element(status);
            let err = e.lifecycle().remove(&id).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::NotRegistered);
        }
    }

    #[test]
    fn test_mutated() {
        let e = element(Status::Clean);
        assert!(e.lifecycle().mutated());
        assert_eq!(e.status(), Status::Modified);
        assert!(!e.lifecycle().mutated());

        for status in [Status::Created, Status::Destroyed, Status::Dead] {
            let e = element(status);
            assert!(!e.lifecycle().mutated());
            assert_eq!(e.status(), status);
        }
    }

    #[test]
    fn test_stream() {
        let e = element(Status::Created);
        match e.lifecycle().stream(10) {
            Some(Flush::Write { servant, stats }) => {
                assert_eq!(*servant.lock(), 1);
                assert_eq!(stats.last_save_time, 10);
            }
            other => panic!("unexpected flush: {other:?}"),
        }
        assert_eq!(e.status(), Status::Clean);
        assert!(e.lifecycle().stream(11).is_none());

        let e = element(Status::Destroyed);
        assert!(matches!(e.lifecycle().stream(10), Some(Flush::Delete)));
        assert_eq!(e.status(), Status::Dead);
        assert!(e.lifecycle().stream(11).is_none());
    }

    #[test]
    fn test_exists() {
        assert!(Status::Clean.exists());
        assert!(Status::Created.exists());
        assert!(Status::Modified.exists());
        assert!(!Status::Destroyed.exists());
        assert!(!Status::Dead.exists());
    }
}
