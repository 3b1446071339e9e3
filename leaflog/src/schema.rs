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

//! The schema capability interface consumed by [`crate::tree::Tree`].
//!
//! This module only specifies the contract the tree façade calls into
//! at each location of the store; authoring validation rules (pattern
//! matchers, typed value constraints, condition graphs) is out of
//! scope here, same as it was for the source this behavior was ported
//! from — a schema is just whatever implements this trait.

use crate::error::ValidationError;
use serde_json::Value as Json;
use std::collections::HashMap;
use std::rc::Rc;

/// A capability interface, not a base class: any type that can answer
/// these questions about a location in the tree can act as a schema
/// there. [`DefaultSchema`] answers all of them permissively.
pub trait Schema {
    /// The schema that applies to the child at `key`. Most
    /// implementations return a clone of `self` or a nested schema
    /// keyed by `key`; the default just stays put.
    fn descend(&self, _key: &str) -> Rc<dyn Schema> {
        Rc::new(DefaultSchema)
    }

    /// Validate a leaf value about to be stored at `key`.
    fn validate(&self, _key: &str, _value: &Json) -> Result<(), ValidationError> {
        Ok(())
    }

    /// Final invariants over the whole node (required-but-missing,
    /// forbidden keys present, cross-key conditions) checked just
    /// before commit. Receives the node's current key set.
    fn check(&self, _keys: &[String]) -> Result<(), ValidationError> {
        Ok(())
    }

    /// Called once, right after a brand-new node is created by the
    /// empty-placeholder `set()` shape or by realize-on-write. Names
    /// returned here are created as empty child nodes (which in turn
    /// invoke their own descended schema's `setup`), matching "create
    /// required empty subnodes".
    fn setup(&self) -> Vec<String> {
        Vec::new()
    }

    /// Synthetic keys computed at this level rather than stored. Each
    /// entry is a thunk so `extra()` is cheap to call even when most
    /// of the map is never read.
    fn extra(&self) -> HashMap<String, Rc<dyn Fn() -> Json>> {
        HashMap::new()
    }

    /// Reinterpret a leaf's value as a reference elsewhere in the
    /// tree (a dotted path from the document root). Returning `None`
    /// means the leaf is just a value, not a reference.
    fn pose(&self, _key: &str, _value: &Json) -> Option<String> {
        None
    }

    /// `Some(set)` for a closed key set (unknown keys become a
    /// validation error at `check` time); `None` for an open schema.
    fn choices(&self) -> Option<Vec<String>> {
        None
    }

    /// Keys this schema still requires that aren't present in `keys`.
    fn missing(&self, _keys: &[String]) -> Vec<String> {
        Vec::new()
    }

    fn help(&self, _key: &str) -> Option<String> {
        None
    }

    fn full_help(&self) -> Option<String> {
        None
    }

    /// A hint for pretty-printing a leaf's value (`dump`'s `--expand`).
    fn format(&self, _key: &str, value: &Json) -> String {
        value.to_string()
    }
}

/// The permissive, no-op schema: every node and leaf is accepted as
/// given, no keys are required, nothing is posed. Used when a caller
/// opens a tree without supplying a schema of their own.
pub struct DefaultSchema;

impl Schema for DefaultSchema {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_schema_accepts_everything() {
        let schema = DefaultSchema;
        assert!(schema.validate("anything", &Json::from(1)).is_ok());
        assert!(schema.check(&["a".to_owned(), "b".to_owned()]).is_ok());
        assert!(schema.choices().is_none());
        assert!(schema.missing(&[]).is_empty());
        assert!(schema.pose("k", &Json::from("x")).is_none());
    }
}
