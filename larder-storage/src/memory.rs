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

use std::{
    collections::BTreeMap,
    fs::File,
    io::{BufReader, BufWriter, Write},
    ops::Bound,
    path::{Path, PathBuf},
    sync::atomic::{AtomicU64, Ordering},
};

#[cfg(feature = "test_utils")]
use std::sync::atomic::AtomicUsize;

use bytes::Bytes;
use hashbrown::HashMap;
use larder_common::{Error, ErrorKind, Result, TxnId};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::{
    engine::{inactive_transaction, Engine},
    lock::{LockKey, LockManager, LockMode},
};

const SNAPSHOT_FILE: &str = "snapshot.bin";
const SNAPSHOT_TMP_FILE: &str = "snapshot.bin.tmp";

type Tree = BTreeMap<Bytes, Bytes>;

/// Buffered writes of a transaction, `None` for a deletion.
type WriteSet = BTreeMap<LockKey, Option<Bytes>>;

#[derive(Debug, Default, Serialize, Deserialize)]
struct Snapshot {
    tables: HashMap<String, Tree>,
}

/// Reference [`Engine`] keeping all tables in memory.
///
/// Transactions buffer their writes and apply them atomically on commit, so neither other transactions nor
/// non-transactional reads observe uncommitted data. Keys are locked with strict two-phase locking.
///
/// With a directory, [`Engine::checkpoint`] atomically replaces an on-disk snapshot of all committed tables, and
/// [`MemoryEngine::open`] restores the latest snapshot.
#[derive(Debug)]
pub struct MemoryEngine {
    dir: Option<PathBuf>,
    tables: RwLock<HashMap<String, Tree>>,
    txns: Mutex<HashMap<TxnId, WriteSet>>,
    next_txn: AtomicU64,
    locks: LockManager,

    #[cfg(feature = "test_utils")]
    injected_deadlocks: AtomicUsize,
}

impl Default for MemoryEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryEngine {
    /// Create an engine without persistence.
    pub fn new() -> Self {
        Self::with_snapshot(None, Snapshot::default())
    }

    /// Open an engine that checkpoints into `dir`, restoring its latest snapshot.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;

        let path = dir.join(SNAPSHOT_FILE);
        let snapshot = if path.exists() {
            let reader = BufReader::new(File::open(&path)?);
            let snapshot: Snapshot = bincode::deserialize_from(reader).map_err(Error::bincode_error)?;
            tracing::info!(
                "[checkpoint]: restore {} tables from {}",
                snapshot.tables.len(),
                path.display()
            );
            snapshot
        } else {
            Snapshot::default()
        };

        Ok(Self::with_snapshot(Some(dir), snapshot))
    }

    fn with_snapshot(dir: Option<PathBuf>, snapshot: Snapshot) -> Self {
        Self {
            dir,
            tables: RwLock::new(snapshot.tables),
            txns: Mutex::new(HashMap::new()),
            next_txn: AtomicU64::new(1),
            locks: LockManager::default(),
            #[cfg(feature = "test_utils")]
            injected_deadlocks: AtomicUsize::new(0),
        }
    }

    /// Make the next `n` lock acquisitions fail with a deadlock error.
    #[cfg(feature = "test_utils")]
    pub fn inject_deadlocks(&self, n: usize) {
        self.injected_deadlocks.store(n, Ordering::SeqCst);
    }

    /// Number of injected deadlocks not raised yet.
    #[cfg(feature = "test_utils")]
    pub fn pending_deadlocks(&self) -> usize {
        self.injected_deadlocks.load(Ordering::SeqCst)
    }

    /// Number of active transactions.
    pub fn active_transactions(&self) -> usize {
        self.txns.lock().len()
    }

    fn check_table(&self, table: &str) -> Result<()> {
        match self.tables.read().contains_key(table) {
            true => Ok(()),
            false => Err(Error::new(ErrorKind::NotFound, "table not found").with_context("table", table)),
        }
    }

    fn check_active(&self, txn: TxnId) -> Result<()> {
        match self.txns.lock().contains_key(&txn) {
            true => Ok(()),
            false => Err(inactive_transaction(txn)),
        }
    }

    fn lock(&self, txn: TxnId, key: &LockKey, mode: LockMode) -> Result<()> {
        self.check_active(txn)?;

        #[cfg(feature = "test_utils")]
        if self
            .injected_deadlocks
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            tracing::debug!("[txn]: inject deadlock into {txn}");
            return Err(Error::deadlock("injected deadlock").with_context("table", &key.0));
        }

        self.locks.acquire(txn, key, mode)
    }

    /// Value of the key as seen by the transaction: its own writes first, then committed data.
    fn visible(&self, table: &str, key: &[u8], txn: Option<TxnId>) -> Option<Bytes> {
        if let Some(txn) = txn {
            let txns = self.txns.lock();
            if let Some(write) = txns
                .get(&txn)
                .and_then(|ws| ws.get(&(table.to_string(), Bytes::copy_from_slice(key))))
            {
                return write.clone();
            }
        }
        self.tables.read().get(table).and_then(|tree| tree.get(key).cloned())
    }

    fn buffer(&self, txn: TxnId, key: LockKey, value: Option<Bytes>) -> Result<()> {
        let mut txns = self.txns.lock();
        let ws = txns.get_mut(&txn).ok_or_else(|| inactive_transaction(txn))?;
        ws.insert(key, value);
        Ok(())
    }

    /// Run a write in the caller's transaction, or in an auto-committed one.
    fn write<T>(&self, txn: Option<TxnId>, f: impl FnOnce(TxnId) -> Result<T>) -> Result<T> {
        match txn {
            Some(txn) => f(txn),
            None => {
                let txn = self.begin()?;
                match f(txn) {
                    Ok(res) => {
                        self.commit(txn)?;
                        Ok(res)
                    }
                    Err(e) => {
                        self.abort(txn)?;
                        Err(e)
                    }
                }
            }
        }
    }
}

impl Engine for MemoryEngine {
    fn open_table(&self, name: &str, create: bool) -> Result<()> {
        let mut tables = self.tables.write();
        if tables.contains_key(name) {
            return Ok(());
        }
        if !create {
            return Err(Error::new(ErrorKind::NotFound, "table not found").with_context("table", name));
        }
        tracing::debug!("[txn]: create table {name}");
        tables.insert(name.to_string(), Tree::new());
        Ok(())
    }

    fn table_names(&self) -> Vec<String> {
        let mut names = self.tables.read().keys().cloned().collect::<Vec<_>>();
        names.sort();
        names
    }

    fn begin(&self) -> Result<TxnId> {
        let txn = self.next_txn.fetch_add(1, Ordering::Relaxed);
        self.txns.lock().insert(txn, WriteSet::new());
        Ok(txn)
    }

    fn commit(&self, txn: TxnId) -> Result<()> {
        let ws = self.txns.lock().remove(&txn).ok_or_else(|| inactive_transaction(txn))?;
        {
            let mut tables = self.tables.write();
            for ((table, key), value) in ws {
                let Some(tree) = tables.get_mut(&table) else {
                    continue;
                };
                match value {
                    Some(value) => {
                        tree.insert(key, value);
                    }
                    None => {
                        tree.remove(&key);
                    }
                }
            }
        }
        self.locks.release_all(txn);
        Ok(())
    }

    fn abort(&self, txn: TxnId) -> Result<()> {
        let ws = self.txns.lock().remove(&txn);
        self.locks.release_all(txn);
        match ws {
            Some(_) => Ok(()),
            None => Err(inactive_transaction(txn)),
        }
    }

    fn get(&self, table: &str, key: &[u8], txn: Option<TxnId>, for_update: bool) -> Result<Option<Bytes>> {
        self.check_table(table)?;
        if let Some(txn) = txn {
            let mode = if for_update { LockMode::Exclusive } else { LockMode::Shared };
            self.lock(txn, &(table.to_string(), Bytes::copy_from_slice(key)), mode)?;
        }
        Ok(self.visible(table, key, txn))
    }

    fn put(&self, table: &str, key: Bytes, value: Bytes, txn: Option<TxnId>) -> Result<()> {
        self.check_table(table)?;
        self.write(txn, |txn| {
            let key = (table.to_string(), key);
            self.lock(txn, &key, LockMode::Exclusive)?;
            self.buffer(txn, key, Some(value))
        })
    }

    fn put_no_overwrite(&self, table: &str, key: Bytes, value: Bytes, txn: Option<TxnId>) -> Result<bool> {
        self.check_table(table)?;
        self.write(txn, |txn| {
            self.lock(txn, &(table.to_string(), key.clone()), LockMode::Exclusive)?;
            if self.visible(table, &key, Some(txn)).is_some() {
                return Ok(false);
            }
            self.buffer(txn, (table.to_string(), key), Some(value))?;
            Ok(true)
        })
    }

    fn delete(&self, table: &str, key: &[u8], txn: Option<TxnId>) -> Result<bool> {
        self.check_table(table)?;
        self.write(txn, |txn| {
            let key = (table.to_string(), Bytes::copy_from_slice(key));
            self.lock(txn, &key, LockMode::Exclusive)?;
            if self.visible(table, &key.1, Some(txn)).is_none() {
                return Ok(false);
            }
            self.buffer(txn, key, None)?;
            Ok(true)
        })
    }

    fn scan_prefix(&self, table: &str, prefix: &[u8], txn: Option<TxnId>) -> Result<Vec<(Bytes, Bytes)>> {
        self.check_table(table)?;

        let start = Bound::Included(Bytes::copy_from_slice(prefix));
        let mut pairs = {
            let tables = self.tables.read();
            let Some(tree) = tables.get(table) else {
                return Ok(vec![]);
            };
            tree.range((start, Bound::Unbounded))
                .take_while(|(k, _)| k.starts_with(prefix))
                .map(|(k, v)| (k.clone(), Some(v.clone())))
                .collect::<BTreeMap<_, _>>()
        };

        if let Some(txn) = txn {
            let txns = self.txns.lock();
            let ws = txns.get(&txn).ok_or_else(|| inactive_transaction(txn))?;
            let from = (table.to_string(), Bytes::copy_from_slice(prefix));
            for ((t, k), v) in ws.range(from..) {
                if t != table || !k.starts_with(prefix) {
                    break;
                }
                pairs.insert(k.clone(), v.clone());
            }
        }

        Ok(pairs.into_iter().filter_map(|(k, v)| v.map(|v| (k, v))).collect())
    }

    fn checkpoint(&self) -> Result<()> {
        let Some(dir) = self.dir.as_ref() else {
            return Ok(());
        };

        let snapshot = Snapshot {
            tables: self.tables.read().clone(),
        };

        let tmp = dir.join(SNAPSHOT_TMP_FILE);
        {
            let mut writer = BufWriter::new(File::create(&tmp)?);
            bincode::serialize_into(&mut writer, &snapshot).map_err(Error::bincode_error)?;
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        std::fs::rename(&tmp, dir.join(SNAPSHOT_FILE))?;

        tracing::debug!("[checkpoint]: write {} tables to {}", snapshot.tables.len(), dir.display());
        Ok(())
    }
}
