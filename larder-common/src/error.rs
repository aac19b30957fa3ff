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
    backtrace::Backtrace,
    fmt::{Debug, Display},
    sync::Arc,
};

use crate::TxnId;

/// ErrorKind is all kinds of Error of larder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// A collection or table that must already exist is missing.
    NotFound,
    /// The identity is already registered with the evictor.
    AlreadyRegistered,
    /// The identity is not registered with the evictor.
    NotRegistered,
    /// Transient lock contention reported by the transactional store.
    ///
    /// Retryable by the owner of the failed transaction only.
    Deadlock,
    /// The evictor is deactivating or has been deactivated.
    Deactivated,
    /// Generic storage failure.
    Storage,
    /// Transaction misuse, e.g. a mandatory transaction is missing or the transaction is already finished.
    Transaction,
    /// The persisted catalog does not match the requested usage.
    Mismatch,
    /// Encoding or decoding error.
    Coding,
    /// Config error.
    Config,
    /// Application error raised by servant code.
    External,
    /// Unrecoverable error, e.g. the background saving thread is dead.
    Fatal,
    /// I/O error.
    Io,
}

impl ErrorKind {
    /// Convert self into static str.
    pub fn into_static(self) -> &'static str {
        self.into()
    }
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.into_static())
    }
}

impl From<ErrorKind> for &'static str {
    fn from(v: ErrorKind) -> &'static str {
        match v {
            ErrorKind::NotFound => "Not found",
            ErrorKind::AlreadyRegistered => "Already registered",
            ErrorKind::NotRegistered => "Not registered",
            ErrorKind::Deadlock => "Deadlock",
            ErrorKind::Deactivated => "Evictor deactivated",
            ErrorKind::Storage => "Storage error",
            ErrorKind::Transaction => "Transaction error",
            ErrorKind::Mismatch => "Catalog mismatch",
            ErrorKind::Coding => "Coding error",
            ErrorKind::Config => "Config error",
            ErrorKind::External => "External error",
            ErrorKind::Fatal => "Fatal error",
            ErrorKind::Io => "I/O error",
        }
    }
}

/// Error is the error struct returned by all larder functions.
///
/// ## Display
///
/// - Via `Display`, the error is printed in a single line:
///
/// ```shell
/// Deadlock, context: { table: accounts/$default }, txn: 42 => lock wait cycle detected
/// ```
///
/// - Via `Debug`, the error is printed in multi lines with context, source and backtrace (if captured).
///
/// - Via `{:#?}`, the conventional struct-style representation is used.
pub struct Error {
    kind: ErrorKind,
    message: String,

    context: Vec<(&'static str, String)>,
    txn: Option<TxnId>,

    source: Option<Arc<anyhow::Error>>,
    backtrace: Option<Arc<Backtrace>>,
}

impl Debug for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // If alternate has been specified, we will print like Debug.
        if f.alternate() {
            let mut de = f.debug_struct("Error");
            de.field("kind", &self.kind);
            de.field("message", &self.message);
            de.field("context", &self.context);
            de.field("txn", &self.txn);
            de.field("source", &self.source);
            de.field("backtrace", &self.backtrace);
            return de.finish();
        }

        write!(f, "{}", self.kind)?;
        if !self.message.is_empty() {
            write!(f, " => {}", self.message)?;
        }
        writeln!(f)?;

        if !self.context.is_empty() || self.txn.is_some() {
            writeln!(f)?;
            writeln!(f, "Context:")?;
            for (k, v) in self.context.iter() {
                writeln!(f, "  {}: {}", k, v)?;
            }
            if let Some(txn) = self.txn {
                writeln!(f, "  txn: {txn}")?;
            }
        }

        if let Some(source) = &self.source {
            writeln!(f)?;
            writeln!(f, "Source:")?;
            writeln!(f, "  {source:#}")?;
        }

        if let Some(backtrace) = &self.backtrace {
            writeln!(f)?;
            writeln!(f, "Backtrace:")?;
            writeln!(f, "{backtrace}")?;
        }

        Ok(())
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.kind)?;

        if !self.context.is_empty() {
            write!(f, ", context: {{ ")?;
            let mut iter = self.context.iter().peekable();
            while let Some((k, v)) = iter.next() {
                write!(f, "{}: {}", k, v)?;
                if iter.peek().is_some() {
                    write!(f, ", ")?;
                }
            }
            write!(f, " }}")?;
        }

        if let Some(txn) = self.txn {
            write!(f, ", txn: {txn}")?;
        }

        if !self.message.is_empty() {
            write!(f, " => {}", self.message)?;
        }

        if let Some(source) = &self.source {
            write!(f, ", source: {source}")?;
        }

        Ok(())
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_ref().map(|v| v.as_ref().as_ref())
    }
}

/// Cloning an [`Error`] with large message and context can be expensive.
impl Clone for Error {
    fn clone(&self) -> Self {
        Self {
            kind: self.kind,
            message: self.message.clone(),
            context: self.context.clone(),
            txn: self.txn,
            source: self.source.clone(),
            backtrace: self.backtrace.clone(),
        }
    }
}

impl Error {
    /// Create a new error.
    ///
    /// If the error needs to carry a source error, please use `with_source` method.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            context: Vec::new(),
            txn: None,
            source: None,
            backtrace: Some(Arc::new(Backtrace::capture())),
        }
    }

    /// Add more context in error.
    pub fn with_context(mut self, key: &'static str, value: impl ToString) -> Self {
        self.context.push((key, value.to_string()));
        self
    }

    /// Set source for error.
    ///
    /// # Notes
    ///
    /// If the source has been set, we will raise a panic here.
    pub fn with_source(mut self, source: impl Into<anyhow::Error>) -> Self {
        debug_assert!(self.source.is_none(), "the source error has been set");
        self.source = Some(Arc::new(source.into()));
        self
    }

    /// Tag the error with the transaction that failed.
    pub fn with_txn(mut self, txn: TxnId) -> Self {
        self.txn = Some(txn);
        self
    }

    /// Get the error kind.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Get the error message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Get the error context.
    pub fn context(&self) -> &Vec<(&'static str, String)> {
        &self.context
    }

    /// Get the transaction the error is tagged with.
    pub fn txn(&self) -> Option<TxnId> {
        self.txn
    }

    /// Get the error backtrace.
    pub fn backtrace(&self) -> Option<&Backtrace> {
        self.backtrace.as_deref()
    }

    /// Get the error source.
    pub fn source(&self) -> Option<&anyhow::Error> {
        self.source.as_deref()
    }

    /// Downcast the reference of the source error to a specific error type reference.
    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.source.as_deref().and_then(|e| e.downcast_ref::<E>())
    }

    /// Returns `true` if the error is a deadlock signal.
    pub fn is_deadlock(&self) -> bool {
        self.kind == ErrorKind::Deadlock
    }

    /// Returns `true` if the error is a deadlock signal raised by the given transaction.
    pub fn is_deadlock_of(&self, txn: TxnId) -> bool {
        self.is_deadlock() && self.txn == Some(txn)
    }
}

/// Result type for larder.
pub type Result<T> = std::result::Result<T, Error>;

/// Helper methods for Error.
impl Error {
    /// Helper for creating an [`ErrorKind::Io`] error from [`std::io::Error`].
    pub fn io_error(source: std::io::Error) -> Self {
        Error::new(ErrorKind::Io, "I/O failure").with_source(source)
    }

    /// Helper for creating an [`ErrorKind::Coding`] error from [`bincode::Error`].
    ///
    /// Truncated input surfaces as an I/O error inside bincode, it is still a coding error here.
    pub fn bincode_error(source: bincode::Error) -> Self {
        Error::new(ErrorKind::Coding, "coding error").with_source(source)
    }

    /// Helper for creating a [`ErrorKind::Deadlock`] error.
    pub fn deadlock(message: impl Into<String>) -> Self {
        Error::new(ErrorKind::Deadlock, message)
    }

    /// Helper for creating a [`ErrorKind::AlreadyRegistered`] error.
    pub fn already_registered(kind: &'static str, id: impl ToString) -> Self {
        Error::new(ErrorKind::AlreadyRegistered, format!("{kind} is already registered")).with_context("id", id)
    }

    /// Helper for creating a [`ErrorKind::NotRegistered`] error.
    pub fn not_registered(kind: &'static str, id: impl ToString) -> Self {
        Error::new(ErrorKind::NotRegistered, format!("{kind} is not registered")).with_context("id", id)
    }

    /// Helper for creating a [`ErrorKind::Deactivated`] error.
    pub fn deactivated(name: impl ToString) -> Self {
        Error::new(ErrorKind::Deactivated, "evictor is deactivated").with_context("evictor", name)
    }

    /// Helper for wrapping an application error raised by servant code.
    pub fn external(source: impl Into<anyhow::Error>) -> Self {
        Error::new(ErrorKind::External, "").with_source(source)
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::io_error(e)
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Self::bincode_error(e)
    }
}
