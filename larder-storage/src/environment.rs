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

//! Process-wide registry of shared store environments.
//!
//! Evictors opened on the same environment name share one [`Engine`], one catalog and one checkpoint thread. The
//! registry is an explicit object: a process normally creates one and hands it to every component, while tests
//! create isolated registries.

use std::{fmt::Debug, path::PathBuf, sync::Arc, thread::JoinHandle, time::Duration};

use hashbrown::HashMap;
use larder_common::{Error, ErrorKind, Result};
use parking_lot::{Condvar, Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::{catalog::Catalog, engine::Engine, memory::MemoryEngine};

/// Config of a shared environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentConfig {
    /// Interval of the checkpoint thread. Zero disables the thread.
    pub checkpoint_period: Duration,
    /// Snapshot directory of the default memory engine. `None` keeps everything in memory.
    pub dir: Option<PathBuf>,
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        Self {
            checkpoint_period: Duration::from_secs(120),
            dir: None,
        }
    }
}

impl EnvironmentConfig {
    /// Set the interval of the checkpoint thread.
    pub fn with_checkpoint_period(mut self, period: Duration) -> Self {
        self.checkpoint_period = period;
        self
    }

    /// Set the snapshot directory of the default memory engine.
    pub fn with_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dir = Some(dir.into());
        self
    }
}

/// Callback invoked on an unrecoverable error of a background thread.
pub type FatalCallback = Arc<dyn Fn(&Error) + Send + Sync + 'static>;

struct Checkpointer {
    stop_tx: flume::Sender<()>,
    handle: JoinHandle<()>,
}

impl Checkpointer {
    fn spawn(name: &str, engine: Arc<dyn Engine>, period: Duration) -> Result<Self> {
        let (stop_tx, stop_rx) = flume::bounded::<()>(1);
        let env = name.to_string();
        let handle = std::thread::Builder::new()
            .name(format!("larder-checkpoint-{name}"))
            .spawn(move || loop {
                match stop_rx.recv_timeout(period) {
                    Err(flume::RecvTimeoutError::Timeout) => match engine.checkpoint() {
                        Ok(()) => tracing::trace!("[checkpoint]: environment {env} checkpointed"),
                        Err(e) => tracing::warn!("[checkpoint]: environment {env} checkpoint error: {e}"),
                    },
                    Ok(()) | Err(flume::RecvTimeoutError::Disconnected) => {
                        tracing::debug!("[checkpoint]: environment {env} checkpoint thread exit");
                        break;
                    }
                }
            })?;
        Ok(Self { stop_tx, handle })
    }

    fn stop(self) {
        let _ = self.stop_tx.send(());
        if self.handle.join().is_err() {
            tracing::error!("[checkpoint]: checkpoint thread panicked");
        }
    }
}

struct EnvironmentInner {
    name: String,
    engine: Arc<dyn Engine>,
    catalog: Catalog,
    checkpointer: Mutex<Option<Checkpointer>>,
}

impl EnvironmentInner {
    fn close(&self) {
        if let Some(checkpointer) = self.checkpointer.lock().take() {
            checkpointer.stop();
        }
        if let Err(e) = self.engine.checkpoint() {
            tracing::warn!("[checkpoint]: final checkpoint of environment {} error: {e}", self.name);
        }
        tracing::info!("[registry]: environment {} closed", self.name);
    }
}

struct Entry {
    env: Arc<EnvironmentInner>,
    refs: usize,
    /// Set while the last release tears the environment down. The name cannot be opened again until then.
    closing: bool,
}

#[derive(Default)]
struct RegistryInner {
    envs: Mutex<HashMap<String, Entry>>,
    closed: Condvar,
    fatal: RwLock<Option<FatalCallback>>,
}

/// Registry of shared environments and holder of the fatal error callback slot.
#[derive(Clone, Default)]
pub struct Registry {
    inner: Arc<RegistryInner>,
}

impl Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("environments", &self.environments())
            .finish()
    }
}

impl Registry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a shared environment backed by a [`MemoryEngine`].
    ///
    /// Opening a name that is already open returns a new reference to the same environment; `config` is ignored
    /// in that case.
    pub fn open(&self, name: &str, config: &EnvironmentConfig) -> Result<SharedEnvironment> {
        self.open_with(name, config, || {
            let engine: Arc<dyn Engine> = match config.dir.as_ref() {
                Some(dir) => Arc::new(MemoryEngine::open(dir)?),
                None => Arc::new(MemoryEngine::new()),
            };
            Ok(engine)
        })
    }

    /// Open a shared environment, creating its engine with `create` if the name is not open yet.
    pub fn open_with<F>(&self, name: &str, config: &EnvironmentConfig, create: F) -> Result<SharedEnvironment>
    where
        F: FnOnce() -> Result<Arc<dyn Engine>>,
    {
        let mut envs = self.inner.envs.lock();
        while envs.get(name).is_some_and(|entry| entry.closing) {
            tracing::debug!("[registry]: wait for environment {name} to close");
            self.inner.closed.wait(&mut envs);
        }

        if let Some(entry) = envs.get_mut(name) {
            entry.refs += 1;
            tracing::debug!("[registry]: reuse environment {name}, refs: {}", entry.refs);
            return Ok(SharedEnvironment {
                inner: entry.env.clone(),
                registry: self.clone(),
            });
        }

        let engine = create()?;
        let catalog = Catalog::open(&engine)?;
        let checkpointer = match config.checkpoint_period.is_zero() {
            true => None,
            false => Some(Checkpointer::spawn(name, engine.clone(), config.checkpoint_period)?),
        };
        let env = Arc::new(EnvironmentInner {
            name: name.to_string(),
            engine,
            catalog,
            checkpointer: Mutex::new(checkpointer),
        });
        envs.insert(
            name.to_string(),
            Entry {
                env: env.clone(),
                refs: 1,
                closing: false,
            },
        );
        tracing::info!("[registry]: environment {name} opened");

        Ok(SharedEnvironment {
            inner: env,
            registry: self.clone(),
        })
    }

    /// Names of the open environments.
    pub fn environments(&self) -> Vec<String> {
        let mut names = self
            .inner
            .envs
            .lock()
            .iter()
            .filter(|(_, entry)| !entry.closing)
            .map(|(name, _)| name.clone())
            .collect::<Vec<_>>();
        names.sort();
        names
    }

    /// Number of live references to the environment, `0` if it is not open.
    pub fn ref_count(&self, name: &str) -> usize {
        self.inner.envs.lock().get(name).map(|e| e.refs).unwrap_or_default()
    }

    /// Register the fatal error callback, returning the previous one. The last registration wins.
    pub fn set_fatal_callback<F>(&self, callback: F) -> Option<FatalCallback>
    where
        F: Fn(&Error) + Send + Sync + 'static,
    {
        self.inner.fatal.write().replace(Arc::new(callback))
    }

    /// Remove the fatal error callback, returning it.
    pub fn clear_fatal_callback(&self) -> Option<FatalCallback> {
        self.inner.fatal.write().take()
    }

    /// Report an unrecoverable error of a background thread.
    ///
    /// Without a registered callback, the process is aborted.
    pub fn report_fatal(&self, error: &Error) {
        let callback = self.inner.fatal.read().clone();
        match callback {
            Some(callback) => callback(error),
            None => {
                tracing::error!("[registry]: fatal error without callback, abort: {error}");
                std::process::abort();
            }
        }
    }

    fn acquire(&self, env: &Arc<EnvironmentInner>) {
        let mut envs = self.inner.envs.lock();
        match envs.get_mut(&env.name) {
            Some(entry) if Arc::ptr_eq(&entry.env, env) => entry.refs += 1,
            _ => unreachable!("environment {} is referenced but not registered", env.name),
        }
    }

    fn release(&self, env: &Arc<EnvironmentInner>) {
        {
            let mut envs = self.inner.envs.lock();
            match envs.get_mut(&env.name) {
                Some(entry) if Arc::ptr_eq(&entry.env, env) => {
                    entry.refs -= 1;
                    tracing::debug!("[registry]: release environment {}, refs: {}", env.name, entry.refs);
                    if entry.refs > 0 {
                        return;
                    }
                    entry.closing = true;
                }
                _ => return,
            }
        }

        // Tear down outside of the registry lock, openers of the name wait for the final checkpoint.
        env.close();

        let mut envs = self.inner.envs.lock();
        if envs.get(&env.name).is_some_and(|entry| Arc::ptr_eq(&entry.env, env)) {
            envs.remove(&env.name);
        }
        self.inner.closed.notify_all();
    }
}

/// Reference-counted handle of an open environment.
///
/// Cloning takes a new reference. The environment is closed when the last reference is dropped: its checkpoint
/// thread is stopped and a final checkpoint is taken.
pub struct SharedEnvironment {
    inner: Arc<EnvironmentInner>,
    registry: Registry,
}

impl Debug for SharedEnvironment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedEnvironment")
            .field("name", &self.inner.name)
            .field("engine", &self.inner.engine)
            .finish()
    }
}

impl Clone for SharedEnvironment {
    fn clone(&self) -> Self {
        self.registry.acquire(&self.inner);
        Self {
            inner: self.inner.clone(),
            registry: self.registry.clone(),
        }
    }
}

impl Drop for SharedEnvironment {
    fn drop(&mut self) {
        self.registry.release(&self.inner);
    }
}

impl SharedEnvironment {
    /// Environment name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The shared engine.
    pub fn engine(&self) -> &Arc<dyn Engine> {
        &self.inner.engine
    }

    /// The collection catalog.
    pub fn catalog(&self) -> &Catalog {
        &self.inner.catalog
    }

    /// The registry the environment belongs to.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Checkpoint the engine now.
    pub fn checkpoint(&self) -> Result<()> {
        self.inner.engine.checkpoint()
    }

    /// Returns `true` if both handles reference the same environment.
    pub fn same_as(&self, other: &SharedEnvironment) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Validate that a handle may be used with this environment.
    pub fn check_same(&self, other: &SharedEnvironment) -> Result<()> {
        match self.same_as(other) {
            true => Ok(()),
            false => Err(Error::new(ErrorKind::Transaction, "transaction belongs to another environment")
                .with_context("environment", other.name())
                .with_context("expected", self.name())),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use bytes::Bytes;
    use larder_common::TxnId;

    use super::*;

    #[test_log::test]
    fn test_ref_count() {
        let registry = Registry::new();
        let config = EnvironmentConfig::default().with_checkpoint_period(Duration::ZERO);

        let a = registry.open("env", &config).unwrap();
        let b = registry.open("env", &config).unwrap();
        assert!(a.same_as(&b));
        assert_eq!(registry.ref_count("env"), 2);

        let c = b.clone();
        assert_eq!(registry.ref_count("env"), 3);

        drop(a);
        drop(b);
        assert_eq!(registry.environments(), vec!["env".to_string()]);
        drop(c);
        assert_eq!(registry.ref_count("env"), 0);
        assert!(registry.environments().is_empty());

        // A fresh environment after the last release.
        let d = registry.open("env", &config).unwrap();
        assert_eq!(registry.ref_count("env"), 1);
        assert!(d.engine().table_names().contains(&crate::catalog::CATALOG_TABLE.to_string()));
    }

    #[test_log::test]
    fn test_isolated_registries() {
        let config = EnvironmentConfig::default().with_checkpoint_period(Duration::ZERO);
        let r1 = Registry::new();
        let r2 = Registry::new();
        let a = r1.open("env", &config).unwrap();
        let b = r2.open("env", &config).unwrap();
        assert!(!a.same_as(&b));
        assert_eq!(a.check_same(&b).unwrap_err().kind(), ErrorKind::Transaction);
    }

    #[test_log::test]
    fn test_checkpoint_thread() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::new();
        let config = EnvironmentConfig::default()
            .with_checkpoint_period(Duration::from_millis(10))
            .with_dir(dir.path());

        let env = registry.open("env", &config).unwrap();
        env.engine().open_table("t", true).unwrap();
        env.engine().put("t", "k".into(), "v".into(), None).unwrap();
        std::thread::sleep(Duration::from_millis(100));
        assert!(dir.path().join("snapshot.bin").exists());
        drop(env);

        let env = registry.open("env", &config).unwrap();
        assert_eq!(env.engine().get("t", b"k", None, false).unwrap(), Some(Bytes::from("v")));
    }

    /// Engine whose checkpoint takes a while.
    #[derive(Debug)]
    struct SlowCheckpoint {
        engine: MemoryEngine,
        delay: Duration,
    }

    impl Engine for SlowCheckpoint {
        fn open_table(&self, name: &str, create: bool) -> Result<()> {
            self.engine.open_table(name, create)
        }

        fn table_names(&self) -> Vec<String> {
            self.engine.table_names()
        }

        fn begin(&self) -> Result<TxnId> {
            self.engine.begin()
        }

        fn commit(&self, txn: TxnId) -> Result<()> {
            self.engine.commit(txn)
        }

        fn abort(&self, txn: TxnId) -> Result<()> {
            self.engine.abort(txn)
        }

        fn get(&self, table: &str, key: &[u8], txn: Option<TxnId>, for_update: bool) -> Result<Option<Bytes>> {
            self.engine.get(table, key, txn, for_update)
        }

        fn put(&self, table: &str, key: Bytes, value: Bytes, txn: Option<TxnId>) -> Result<()> {
            self.engine.put(table, key, value, txn)
        }

        fn put_no_overwrite(&self, table: &str, key: Bytes, value: Bytes, txn: Option<TxnId>) -> Result<bool> {
            self.engine.put_no_overwrite(table, key, value, txn)
        }

        fn delete(&self, table: &str, key: &[u8], txn: Option<TxnId>) -> Result<bool> {
            self.engine.delete(table, key, txn)
        }

        fn scan_prefix(&self, table: &str, prefix: &[u8], txn: Option<TxnId>) -> Result<Vec<(Bytes, Bytes)>> {
            self.engine.scan_prefix(table, prefix, txn)
        }

        fn checkpoint(&self) -> Result<()> {
            std::thread::sleep(self.delay);
            self.engine.checkpoint()
        }
    }

    #[test_log::test]
    fn test_reopen_waits_for_final_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::new();
        let config = EnvironmentConfig::default().with_checkpoint_period(Duration::ZERO);
        let open = || {
            registry
                .open_with("env", &config, || {
                    let engine = SlowCheckpoint {
                        engine: MemoryEngine::open(dir.path())?,
                        delay: Duration::from_millis(300),
                    };
                    Ok(Arc::new(engine) as Arc<dyn Engine>)
                })
                .unwrap()
        };

        let env = open();
        env.engine().open_table("t", true).unwrap();
        env.engine().put("t", "k".into(), "v".into(), None).unwrap();

        std::thread::scope(|s| {
            s.spawn(move || drop(env));
            std::thread::sleep(Duration::from_millis(50));
            let env = open();
            assert_eq!(env.engine().get("t", b"k", None, false).unwrap(), Some(Bytes::from("v")));
        });
    }

    #[test_log::test]
    fn test_fatal_callback_last_wins() {
        let registry = Registry::new();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        {
            let first = first.clone();
            assert!(registry
                .set_fatal_callback(move |_| {
                    first.fetch_add(1, Ordering::SeqCst);
                })
                .is_none());
        }
        {
            let second = second.clone();
            assert!(registry
                .set_fatal_callback(move |_| {
                    second.fetch_add(1, Ordering::SeqCst);
                })
                .is_some());
        }

        registry.report_fatal(&Error::new(ErrorKind::Fatal, "saving thread died"));
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
        assert!(registry.clear_fatal_callback().is_some());
    }
}
