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

use std::{fmt::Debug, sync::Arc};

use bytes::Bytes;
use larder_common::{Error, ErrorKind, Result, TxnId};

/// Transactional key/value store with named tables, ACID transactions and deadlock detection.
///
/// Every data operation takes an optional transaction. Without one, reads observe committed data only and writes
/// are committed immediately as single-operation transactions.
///
/// Errors are [`ErrorKind::Storage`], [`ErrorKind::NotFound`] for a missing table, or [`ErrorKind::Deadlock`] for a
/// retryable conflict. A transaction that failed with a deadlock must be aborted by its owner.
pub trait Engine: Send + Sync + Debug + 'static {
    /// Open the table, creating it if it is missing and `create` is set.
    fn open_table(&self, name: &str, create: bool) -> Result<()>;

    /// Names of all tables.
    fn table_names(&self) -> Vec<String>;

    /// Begin a transaction.
    fn begin(&self) -> Result<TxnId>;

    /// Commit the transaction, releasing its locks.
    fn commit(&self, txn: TxnId) -> Result<()>;

    /// Abort the transaction, discarding its writes and releasing its locks.
    fn abort(&self, txn: TxnId) -> Result<()>;

    /// Read a key. With `for_update`, the transaction locks the key exclusively.
    fn get(&self, table: &str, key: &[u8], txn: Option<TxnId>, for_update: bool) -> Result<Option<Bytes>>;

    /// Write a key.
    fn put(&self, table: &str, key: Bytes, value: Bytes, txn: Option<TxnId>) -> Result<()>;

    /// Write a key only if it is absent. Returns `false` if the key exists.
    fn put_no_overwrite(&self, table: &str, key: Bytes, value: Bytes, txn: Option<TxnId>) -> Result<bool>;

    /// Delete a key. Returns `false` if the key is absent.
    fn delete(&self, table: &str, key: &[u8], txn: Option<TxnId>) -> Result<bool>;

    /// All pairs whose key starts with the prefix, in key order.
    fn scan_prefix(&self, table: &str, prefix: &[u8], txn: Option<TxnId>) -> Result<Vec<(Bytes, Bytes)>>;

    /// Make committed data durable.
    fn checkpoint(&self) -> Result<()>;
}

/// A transaction of an [`Engine`].
///
/// Dropping an unfinished transaction aborts it.
#[derive(Debug)]
pub struct Transaction {
    engine: Arc<dyn Engine>,
    id: TxnId,
    finished: bool,
}

impl Transaction {
    /// Begin a transaction.
    pub fn begin(engine: &Arc<dyn Engine>) -> Result<Self> {
        let id = engine.begin()?;
        tracing::trace!("[txn]: begin {id}");
        Ok(Self {
            engine: engine.clone(),
            id,
            finished: false,
        })
    }

    /// Transaction id.
    pub fn id(&self) -> TxnId {
        self.id
    }

    /// Commit the transaction.
    pub fn commit(mut self) -> Result<()> {
        self.finished = true;
        tracing::trace!("[txn]: commit {}", self.id);
        self.engine.commit(self.id)
    }

    /// Abort the transaction.
    pub fn abort(mut self) -> Result<()> {
        self.finished = true;
        tracing::trace!("[txn]: abort {}", self.id);
        self.engine.abort(self.id)
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if !self.finished {
            if let Err(e) = self.engine.abort(self.id) {
                tracing::warn!("[txn]: abort dropped transaction {} error: {e}", self.id);
            }
        }
    }
}

/// A named table of an [`Engine`].
#[derive(Debug, Clone)]
pub struct Table {
    engine: Arc<dyn Engine>,
    name: Arc<str>,
}

impl Table {
    /// Open the table, creating it if it is missing and `create` is set.
    pub fn open(engine: &Arc<dyn Engine>, name: &str, create: bool) -> Result<Self> {
        engine.open_table(name, create)?;
        Ok(Self {
            engine: engine.clone(),
            name: Arc::from(name),
        })
    }

    /// Table name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The engine of the table.
    pub fn engine(&self) -> &Arc<dyn Engine> {
        &self.engine
    }

    /// Read a key.
    pub fn get(&self, key: &[u8], txn: Option<&Transaction>) -> Result<Option<Bytes>> {
        self.engine.get(&self.name, key, txn.map(|t| t.id), false)
    }

    /// Read a key, locking it exclusively within the transaction.
    pub fn get_for_update(&self, key: &[u8], txn: &Transaction) -> Result<Option<Bytes>> {
        self.engine.get(&self.name, key, Some(txn.id), true)
    }

    /// Write a key.
    pub fn put(&self, key: Bytes, value: Bytes, txn: Option<&Transaction>) -> Result<()> {
        self.engine.put(&self.name, key, value, txn.map(|t| t.id))
    }

    /// Write a key only if it is absent. Returns `false` if the key exists.
    pub fn put_no_overwrite(&self, key: Bytes, value: Bytes, txn: Option<&Transaction>) -> Result<bool> {
        self.engine.put_no_overwrite(&self.name, key, value, txn.map(|t| t.id))
    }

    /// Delete a key. Returns `false` if the key is absent.
    pub fn delete(&self, key: &[u8], txn: Option<&Transaction>) -> Result<bool> {
        self.engine.delete(&self.name, key, txn.map(|t| t.id))
    }

    /// All pairs whose key starts with the prefix, in key order.
    pub fn scan_prefix(&self, prefix: &[u8], txn: Option<&Transaction>) -> Result<Vec<(Bytes, Bytes)>> {
        self.engine.scan_prefix(&self.name, prefix, txn.map(|t| t.id))
    }

    /// Returns `true` if the table holds no key.
    pub fn is_empty(&self, txn: Option<&Transaction>) -> Result<bool> {
        Ok(self.scan_prefix(&[], txn)?.is_empty())
    }
}

/// Run an operation that owns no caller transaction, retrying it on deadlock.
pub fn retry_on_deadlock<T>(what: &str, mut op: impl FnMut() -> Result<T>) -> Result<T> {
    let mut attempts = 0usize;
    loop {
        match op() {
            Err(e) if e.kind() == ErrorKind::Deadlock => {
                attempts += 1;
                tracing::debug!("[txn]: {what} deadlocked, retry, attempts: {attempts}");
                std::thread::yield_now();
            }
            res => return res,
        }
    }
}

/// Run `f` in a fresh transaction and commit it, retrying the whole transaction on deadlock.
pub fn with_transaction<T>(
    engine: &Arc<dyn Engine>,
    what: &str,
    mut f: impl FnMut(&Transaction) -> Result<T>,
) -> Result<T> {
    retry_on_deadlock(what, || {
        let txn = Transaction::begin(engine)?;
        match f(&txn) {
            Ok(res) => {
                txn.commit()?;
                Ok(res)
            }
            Err(e) => {
                if let Err(abort) = txn.abort() {
                    tracing::warn!("[txn]: abort after {what} error: {abort}");
                }
                Err(e)
            }
        }
    })
}

/// Error for an operation on a transaction that is not active.
pub(crate) fn inactive_transaction(txn: TxnId) -> Error {
    Error::new(ErrorKind::Transaction, "transaction is not active").with_txn(txn)
}
