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

use larder_common::{Error, Result};
use parking_lot::{Condvar, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Active,
    Deactivating,
    Deactivated,
}

#[derive(Debug)]
struct State {
    phase: Phase,
    guards: usize,
}

#[derive(Debug)]
struct Inner {
    name: String,
    state: Mutex<State>,
    changed: Condvar,
}

/// Gate that keeps public evictor operations from racing the shutdown sequence.
///
/// Every operation holds a [`DeactivateGuard`]. [`DeactivateController::deactivate`] closes the gate, waits for
/// all guards to drop, and elects exactly one caller to run the shutdown work.
#[derive(Debug, Clone)]
pub struct DeactivateController {
    inner: Arc<Inner>,
}

/// Proof that the evictor is active. Dropping it leaves the gate.
#[derive(Debug)]
pub struct DeactivateGuard {
    inner: Arc<Inner>,
}

impl Drop for DeactivateGuard {
    fn drop(&mut self) {
        let mut state = self.inner.state.lock();
        state.guards -= 1;
        if state.guards == 0 && state.phase == Phase::Deactivating {
            self.inner.changed.notify_all();
        }
    }
}

impl DeactivateController {
    /// Create an active controller for the named evictor.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                state: Mutex::new(State {
                    phase: Phase::Active,
                    guards: 0,
                }),
                changed: Condvar::new(),
            }),
        }
    }

    /// Enter the gate. Fails with [`larder_common::ErrorKind::Deactivated`] once deactivation has started.
    pub fn lock(&self) -> Result<DeactivateGuard> {
        let mut state = self.inner.state.lock();
        if state.phase != Phase::Active {
            return Err(Error::deactivated(&self.inner.name));
        }
        state.guards += 1;
        Ok(DeactivateGuard {
            inner: self.inner.clone(),
        })
    }

    /// Close the gate and wait until no guard is held.
    ///
    /// Returns `true` to exactly one caller, which must run the shutdown work and then call
    /// [`DeactivateController::deactivation_complete`]. Other callers wait for the shutdown to complete and get
    /// `false`.
    ///
    /// Calling it while holding a guard on the same thread never returns.
    pub fn deactivate(&self) -> bool {
        let mut state = self.inner.state.lock();
        match state.phase {
            Phase::Active => {
                state.phase = Phase::Deactivating;
                tracing::debug!("[evictor]: {} deactivating, wait for {} operations", self.inner.name, state.guards);
                while state.guards > 0 {
                    self.inner.changed.wait(&mut state);
                }
                true
            }
            Phase::Deactivating => {
                while state.phase != Phase::Deactivated {
                    self.inner.changed.wait(&mut state);
                }
                false
            }
            Phase::Deactivated => false,
        }
    }

    /// Mark the shutdown as complete and wake concurrent deactivators.
    pub fn deactivation_complete(&self) {
        let mut state = self.inner.state.lock();
        state.phase = Phase::Deactivated;
        tracing::info!("[evictor]: {} deactivated", self.inner.name);
        self.inner.changed.notify_all();
    }

    /// Returns `true` once the shutdown is complete. The gate is already closed while deactivating.
    pub fn is_deactivated(&self) -> bool {
        self.inner.state.lock().phase == Phase::Deactivated
    }
}
