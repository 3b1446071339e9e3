/*
 * This file is a part of leaflog.
 *
 * leaflog is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * leaflog is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with leaflog. If not, see <https://www.gnu.org/licenses/>.
 *
*/

//! Error kinds shared across the log, record and tree layers.
//!
//! Each layer gets its own enum (no blanket "one error to rule them
//! all") so a caller matching on `LogError` never has to think about
//! validation paths, and vice versa. Conversions between layers are
//! explicit `From` impls, not a shared trait object.

use core::fmt;
use std::io;

pub type LogResult<T> = Result<T, LogError>;
pub type StoreResult<T> = Result<T, StoreError>;
pub type TreeResult<T> = Result<T, TreeError>;

/// Errors raised by the append-only log (header, framing, locking, CAS).
#[derive(Debug)]
pub enum LogError {
    /// An I/O error bubbled up unchanged.
    Io(io::Error),
    /// The on-disk shape deviates from the documented format.
    CorruptedFormat(String),
    /// `set_current` observed a root different from the one it was given.
    Concurrency { expected: u64, observed: u64 },
    /// A precondition was violated (record contains a forbidden byte,
    /// nested lock acquisition, root-line width out of range, ...).
    Storage(String),
}

impl From<io::Error> for LogError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

impl fmt::Display for LogError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::CorruptedFormat(msg) => write!(f, "corrupted log: {msg}"),
            Self::Concurrency { expected, observed } => write!(
                f,
                "concurrent commit: expected root {expected}, found {observed}"
            ),
            Self::Storage(msg) => write!(f, "storage precondition failed: {msg}"),
        }
    }
}

impl std::error::Error for LogError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

/// Errors raised by the record store (node/leaf decode, attachment
/// discipline, root lifecycle).
#[derive(Debug)]
pub enum StoreError {
    Log(LogError),
    /// The root pointer is `0`: the file exists but holds no tree yet.
    NullEntryPoint,
    /// `commit` was called after `detach_root` without assigning a new root.
    DetachedRoot,
    /// A decoded record didn't match its discriminator's expected shape.
    Malformed(String),
    /// An item is already attached to a parent, or was asked to detach
    /// while already detached (I5 violation).
    Attachment(String),
}

impl From<LogError> for StoreError {
    fn from(e: LogError) -> Self {
        Self::Log(e)
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Log(e) => write!(f, "{e}"),
            Self::NullEntryPoint => write!(f, "store has no entry point (root is 0)"),
            Self::DetachedRoot => write!(f, "cannot commit: root is detached"),
            Self::Malformed(msg) => write!(f, "malformed record: {msg}"),
            Self::Attachment(msg) => write!(f, "attachment error: {msg}"),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Log(e) => Some(e),
            _ => None,
        }
    }
}

/// A schema validation failure, always anchored to a dotted path
/// (the empty path renders as `ROOT`).
#[derive(Debug, Clone)]
pub struct ValidationError {
    pub path: String,
    pub message: String,
}

impl ValidationError {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        let path = path.into();
        Self {
            path: if path.is_empty() { "ROOT".to_owned() } else { path },
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.path, self.message)
    }
}

impl std::error::Error for ValidationError {}

/// Errors raised by the tree facade: everything from `StoreError`,
/// plus validation failures and query-language mistakes.
#[derive(Debug)]
pub enum TreeError {
    Store(StoreError),
    Validation(ValidationError),
    /// The requested key does not exist and no default was given.
    NoSuchKey(String),
    /// A `set`/`del` programming error: moving a tree into its own
    /// descendant, re-attaching an attached item, acting on a key that
    /// isn't a tree, etc.
    Invalid(String),
    /// A malformed query expression, or a name collision between two
    /// kept-path results.
    Query(String),
}

impl From<StoreError> for TreeError {
    fn from(e: StoreError) -> Self {
        Self::Store(e)
    }
}

impl From<LogError> for TreeError {
    fn from(e: LogError) -> Self {
        Self::Store(e.into())
    }
}

impl From<ValidationError> for TreeError {
    fn from(e: ValidationError) -> Self {
        Self::Validation(e)
    }
}

impl fmt::Display for TreeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Store(e) => write!(f, "{e}"),
            Self::Validation(e) => write!(f, "{e}"),
            Self::NoSuchKey(key) => write!(f, "no such key: {key}"),
            Self::Invalid(msg) => write!(f, "{msg}"),
            Self::Query(msg) => write!(f, "invalid query: {msg}"),
        }
    }
}

impl std::error::Error for TreeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Store(e) => Some(e),
            Self::Validation(e) => Some(e),
            _ => None,
        }
    }
}
