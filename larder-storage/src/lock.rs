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

//! Key locks of the memory engine with wait-for graph deadlock detection.
//!
//! Transactions take shared locks on read and exclusive locks on write, and hold them until commit or abort.
//! A transaction that has to wait records `waiter -> holder` edges. The requester whose edges close a cycle
//! receives a deadlock error instead of waiting.

use bytes::Bytes;
use hashbrown::{HashMap, HashSet};
use larder_common::{Error, Result, TxnId};
use parking_lot::{Condvar, Mutex};

/// Lock mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// Read lock, compatible with other read locks.
    Shared,
    /// Write lock.
    Exclusive,
}

/// A locked key: table name and key.
pub type LockKey = (String, Bytes);

#[derive(Debug, Default)]
struct LockEntry {
    shared: HashSet<TxnId>,
    exclusive: Option<TxnId>,
}

impl LockEntry {
    fn blockers(&self, txn: TxnId, mode: LockMode) -> HashSet<TxnId> {
        let mut blockers = HashSet::new();
        if let Some(holder) = self.exclusive {
            if holder != txn {
                blockers.insert(holder);
            }
        }
        if mode == LockMode::Exclusive {
            blockers.extend(self.shared.iter().copied().filter(|&holder| holder != txn));
        }
        blockers
    }

    fn is_free(&self) -> bool {
        self.shared.is_empty() && self.exclusive.is_none()
    }
}

/// Wait-for graph: waiter to the set of holders it waits for.
#[derive(Debug, Default)]
struct WaitForGraph {
    edges: HashMap<TxnId, HashSet<TxnId>>,
}

impl WaitForGraph {
    fn set_waits(&mut self, waiter: TxnId, holders: HashSet<TxnId>) {
        self.edges.insert(waiter, holders);
    }

    fn remove_waiter(&mut self, waiter: TxnId) {
        self.edges.remove(&waiter);
    }

    fn remove_txn(&mut self, txn: TxnId) {
        self.edges.remove(&txn);
        for holders in self.edges.values_mut() {
            holders.remove(&txn);
        }
    }

    /// Returns `true` if a path leads from `txn` back to itself.
    fn closes_cycle(&self, txn: TxnId) -> bool {
        let mut visited = HashSet::new();
        let mut stack = self.edges.get(&txn).map(|h| h.iter().copied().collect::<Vec<_>>()).unwrap_or_default();
        while let Some(node) = stack.pop() {
            if node == txn {
                return true;
            }
            if !visited.insert(node) {
                continue;
            }
            if let Some(holders) = self.edges.get(&node) {
                stack.extend(holders.iter().copied());
            }
        }
        false
    }
}

#[derive(Debug, Default)]
struct LockTable {
    entries: HashMap<LockKey, LockEntry>,
    held: HashMap<TxnId, Vec<LockKey>>,
    graph: WaitForGraph,
}

impl LockTable {
    fn grant(&mut self, txn: TxnId, key: &LockKey, mode: LockMode) {
        let entry = self.entries.entry(key.clone()).or_default();
        let newly = match mode {
            LockMode::Shared => entry.exclusive != Some(txn) && entry.shared.insert(txn),
            LockMode::Exclusive => {
                let newly = entry.exclusive.is_none() && !entry.shared.contains(&txn);
                entry.shared.remove(&txn);
                entry.exclusive = Some(txn);
                newly
            }
        };
        if newly {
            self.held.entry(txn).or_default().push(key.clone());
        }
    }
}

/// Lock manager of the memory engine.
#[derive(Debug, Default)]
pub struct LockManager {
    table: Mutex<LockTable>,
    changed: Condvar,
}

impl LockManager {
    /// Acquire the lock for the transaction, blocking while incompatible locks are held.
    ///
    /// Fails with a deadlock error if waiting would close a cycle in the wait-for graph.
    pub fn acquire(&self, txn: TxnId, key: &LockKey, mode: LockMode) -> Result<()> {
        let mut table = self.table.lock();
        loop {
            let blockers = table
                .entries
                .get(key)
                .map(|entry| entry.blockers(txn, mode))
                .unwrap_or_default();

            if blockers.is_empty() {
                table.graph.remove_waiter(txn);
                table.grant(txn, key, mode);
                drop(table);
                // Waiters recompute their blockers, a grant may extend them.
                self.changed.notify_all();
                return Ok(());
            }

            table.graph.set_waits(txn, blockers);
            if table.graph.closes_cycle(txn) {
                table.graph.remove_waiter(txn);
                tracing::debug!("[txn]: {txn} closes a lock wait cycle on table {}", key.0);
                return Err(Error::deadlock("lock wait cycle detected").with_context("table", &key.0));
            }
            self.changed.wait(&mut table);
        }
    }

    /// Release all locks held by the transaction.
    pub fn release_all(&self, txn: TxnId) {
        let mut table = self.table.lock();
        table.graph.remove_txn(txn);
        if let Some(keys) = table.held.remove(&txn) {
            for key in keys {
                let free = match table.entries.get_mut(&key) {
                    Some(entry) => {
                        entry.shared.remove(&txn);
                        if entry.exclusive == Some(txn) {
                            entry.exclusive = None;
                        }
                        entry.is_free()
                    }
                    None => false,
                };
                if free {
                    table.entries.remove(&key);
                }
            }
        }
        drop(table);
        self.changed.notify_all();
    }

    /// Number of locked keys.
    pub fn locked(&self) -> usize {
        self.table.lock().entries.len()
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, thread, time::Duration};

    use larder_common::ErrorKind;

    use super::*;

    fn key(k: &'static str) -> LockKey {
        ("t".to_string(), Bytes::from_static(k.as_bytes()))
    }

    #[test_log::test]
    fn test_shared_compatible() {
        let lm = LockManager::default();
        lm.acquire(1, &key("a"), LockMode::Shared).unwrap();
        lm.acquire(2, &key("a"), LockMode::Shared).unwrap();
        // Reentrant.
        lm.acquire(1, &key("a"), LockMode::Shared).unwrap();
        lm.release_all(1);
        lm.release_all(2);
        assert_eq!(lm.locked(), 0);
    }

    #[test_log::test]
    fn test_exclusive_waits_for_release() {
        let lm = Arc::new(LockManager::default());
        lm.acquire(1, &key("a"), LockMode::Exclusive).unwrap();

        let handle = {
            let lm = lm.clone();
            thread::spawn(move || lm.acquire(2, &key("a"), LockMode::Shared))
        };
        thread::sleep(Duration::from_millis(50));
        assert!(!handle.is_finished());

        lm.release_all(1);
        handle.join().unwrap().unwrap();
        lm.release_all(2);
        assert_eq!(lm.locked(), 0);
    }

    #[test_log::test]
    fn test_upgrade_deadlock() {
        let lm = Arc::new(LockManager::default());
        lm.acquire(1, &key("a"), LockMode::Shared).unwrap();
        lm.acquire(2, &key("a"), LockMode::Shared).unwrap();

        let handle = {
            let lm = lm.clone();
            thread::spawn(move || lm.acquire(1, &key("a"), LockMode::Exclusive))
        };
        thread::sleep(Duration::from_millis(50));

        // Txn 2 closes the cycle and is the one told to back off.
        let err = lm.acquire(2, &key("a"), LockMode::Exclusive).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Deadlock);

        lm.release_all(2);
        handle.join().unwrap().unwrap();
        lm.release_all(1);
        assert_eq!(lm.locked(), 0);
    }

    #[test_log::test]
    fn test_cross_key_deadlock() {
        let lm = Arc::new(LockManager::default());
        lm.acquire(1, &key("a"), LockMode::Exclusive).unwrap();
        lm.acquire(2, &key("b"), LockMode::Exclusive).unwrap();

        let handle = {
            let lm = lm.clone();
            thread::spawn(move || lm.acquire(1, &key("b"), LockMode::Exclusive))
        };
        thread::sleep(Duration::from_millis(50));

        let err = lm.acquire(2, &key("a"), LockMode::Exclusive).unwrap_err();
        assert!(err.is_deadlock());
        lm.release_all(2);
        handle.join().unwrap().unwrap();
        lm.release_all(1);
    }
}
