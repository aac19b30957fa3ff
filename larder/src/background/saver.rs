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
    any::Any,
    panic::AssertUnwindSafe,
    sync::Arc,
    time::{Duration, Instant},
};

use bytes::Bytes;
use larder_common::{stats::now_millis, Error, ErrorKind, Result};
use larder_memory::{Element, Flush};
use larder_storage::Transaction;

use super::BackgroundInner;
use crate::store::{ObjectStore, StreamedOp};

/// Thread body of the saving thread.
///
/// An error or a panic kills the thread. Pending and future [`BackgroundInner::save_now`] calls fail, and the error
/// is reported through the fatal callback of the environment registry.
pub(super) fn run<V>(inner: Arc<BackgroundInner<V>>)
where
    V: Send + 'static,
{
    let name = inner.core.filename().to_string();
    tracing::info!("[saver]: {name} started");

    let saver = Saver { inner: inner.clone() };
    let err = match std::panic::catch_unwind(AssertUnwindSafe(|| saver.run())) {
        Ok(Ok(())) => {
            tracing::info!("[saver]: {name} stopped");
            return;
        }
        Ok(Err(e)) => e,
        Err(payload) => Error::new(ErrorKind::Fatal, "saving thread panicked")
            .with_context("panic", panic_message(payload.as_ref())),
    };

    tracing::error!("[saver]: {name} died: {err}");
    inner.state.lock().dead = true;
    inner.saved.notify_all();
    inner.core.env().registry().report_fatal(&err);
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown".to_string()
    }
}

/// A write prepared outside of any evictor lock.
struct Streamed<V> {
    store: Arc<ObjectStore<V>>,
    key: Bytes,
    op: StreamedOp,
}

struct Saver<V> {
    inner: Arc<BackgroundInner<V>>,
}

impl<V> Saver<V>
where
    V: Send + 'static,
{
    fn run(self) -> Result<()> {
        let config = self.inner.core.config();
        let trigger = config.save_size_trigger;
        let period = config.save_period;
        let next_deadline = || match period.is_zero() {
            true => None,
            false => Instant::now().checked_add(period),
        };
        let mut deadline = next_deadline();

        loop {
            let (batch, target, shutdown) = {
                let mut state = self.inner.state.lock();
                loop {
                    if state.shutdown
                        || state.requested > state.completed
                        || (trigger > 0 && state.modified.len() >= trigger)
                    {
                        break;
                    }
                    match deadline {
                        Some(deadline) => {
                            if self.inner.wakeup.wait_until(&mut state, deadline).timed_out() {
                                break;
                            }
                        }
                        None => self.inner.wakeup.wait(&mut state),
                    }
                }
                let batch = state.modified.drain(..).collect::<Vec<_>>();
                (batch, state.requested, state.shutdown)
            };

            if !batch.is_empty() {
                let start = Instant::now();
                let streamed = self.stream(&batch)?;
                self.write(&streamed)?;
                tracing::debug!(
                    "[saver]: {} saved {} of {} pending elements in {:?}",
                    self.inner.core.filename(),
                    streamed.len(),
                    batch.len(),
                    start.elapsed()
                );
            }
            deadline = next_deadline();

            {
                let mut state = self.inner.state.lock();
                for element in batch.iter() {
                    if state.lru.relinquish(element) {
                        self.inner.release_dead(&mut state, element);
                    }
                }
                self.inner.trim(&mut state);
                state.completed = state.completed.max(target);
                if shutdown && state.modified.is_empty() {
                    self.inner.saved.notify_all();
                    return Ok(());
                }
            }
            self.inner.saved.notify_all();
        }
    }

    /// Capture a point-in-time view of each element, then serialize its servant under the servant lock only.
    fn stream(&self, batch: &[Arc<Element<V>>]) -> Result<Vec<Streamed<V>>> {
        let timeout = self.inner.core.config().stream_timeout;
        let now = now_millis();

        let mut streamed = Vec::with_capacity(batch.len());
        for element in batch {
            let flush = element.lifecycle().stream(now);
            let Some(flush) = flush else {
                continue;
            };
            let store = self.inner.core.loaded_store(element.facet()).ok_or_else(|| {
                Error::new(ErrorKind::Fatal, "store of a pending element is closed")
                    .with_context("facet", element.facet())
            })?;
            let key = store.marshal_key(element.identity())?;
            let op = match flush {
                Flush::Write { servant, stats } => {
                    let servant = match timeout {
                        Some(timeout) => servant
                            .try_lock_for(timeout)
                            .ok_or_else(|| stream_timeout(element, timeout))?,
                        None => servant.lock(),
                    };
                    store.stream(&servant, &stats)?
                }
                Flush::Delete => StreamedOp::Delete,
            };
            streamed.push(Streamed { store, key, op });
        }
        Ok(streamed)
    }

    /// Write the prepared operations in transactions of bounded size, halving the size on deadlock.
    fn write(&self, streamed: &[Streamed<V>]) -> Result<()> {
        let engine = self.inner.core.env().engine();
        let mut tx_size = self.inner.core.config().max_tx_size();
        let mut rest = streamed;

        while !rest.is_empty() {
            let n = tx_size.min(rest.len());
            let chunk = &rest[..n];
            let res = Transaction::begin(engine).and_then(|txn| {
                for s in chunk {
                    s.store.save(&s.key, &s.op, &txn)?;
                }
                txn.commit()
            });
            match res {
                Ok(()) => rest = &rest[n..],
                Err(e) if e.is_deadlock() => {
                    tx_size = (n / 2).max(1);
                    tracing::warn!(
                        "[saver]: {} deadlocked writing {n} objects, retry with {tx_size}: {e}",
                        self.inner.core.filename()
                    );
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

fn stream_timeout<V>(element: &Element<V>, timeout: Duration) -> Error {
    Error::new(ErrorKind::Fatal, "timed out waiting for the servant lock")
        .with_context("identity", element.identity())
        .with_context("timeout", format!("{timeout:?}"))
}
