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

//! A small, append-only, single-file configuration store with a
//! schema-validated hierarchical tree overlay.
//!
//! Four layers, bottom-up:
//!
//! - [`log`] — the byte-exact append log: a fixed header, a
//!   compare-and-swap root pointer, text-framed records, advisory
//!   file locking.
//! - [`record`] — a content-addressed node/leaf store over the log:
//!   lazy loading, copy-on-write mutation, a dirty-spine commit.
//! - [`tree`] — the mutable, path-addressed façade: navigation,
//!   queries, diffs, moves/copies.
//! - [`schema`] — the capability interface the tree façade consumes
//!   to validate keys and values.
//!
//! [`tree::Document`] is the entry point most callers want.

pub mod error;
mod flock;
pub mod log;
pub mod query;
pub mod record;
pub mod schema;
pub mod tree;

pub use error::{LogError, LogResult, StoreError, StoreResult, TreeError, TreeResult, ValidationError};
pub use log::Log;
pub use record::{DiffEvent, Store};
pub use schema::{DefaultSchema, Schema};
pub use tree::{Document, DumpOptions, Resolved, SetValue, Tree, Value};
