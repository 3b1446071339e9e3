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

//! Typed records (nodes and leaves) layered over [`crate::log::Log`], and
//! the [`Store`] that lazy-loads, mutates and commits them.
//!
//! A node's children live behind one of three representations at any
//! moment — an unresolved on-disk offset, a strong in-memory reference,
//! or (in volatile mode) a weak one paired with the offset it can be
//! reloaded from. [`Child`] is that tri-state; resolving it through
//! [`Store::get_child`] is how lazy loading happens.

use crate::error::{StoreError, StoreResult};
use crate::log::Log;
use indexmap::IndexMap;
use serde_json::Value as Json;
use std::cell::RefCell;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

const KIND_NODE: u8 = b'@';
const KIND_LEAF: u8 = b'=';

/// Back-link recorded on every attached item (I5): which node, and
/// under which key, currently owns this item.
#[derive(Clone)]
pub struct Link {
    pub parent: Weak<RefCell<NodeData>>,
    pub key: String,
}

pub struct NodeData {
    pub offset: Option<u64>,
    pub link: Option<Link>,
    pub children: IndexMap<String, Child>,
}

pub struct LeafData {
    pub offset: Option<u64>,
    pub link: Option<Link>,
    pub value: Json,
}

/// A live node or leaf, reference-counted so façades and the store's
/// own child cache can share one.
#[derive(Clone)]
pub enum Item {
    Node(Rc<RefCell<NodeData>>),
    Leaf(Rc<RefCell<LeafData>>),
}

#[derive(Clone)]
pub enum WeakItem {
    Node(Weak<RefCell<NodeData>>),
    Leaf(Weak<RefCell<LeafData>>),
}

impl WeakItem {
    pub fn upgrade(&self) -> Option<Item> {
        match self {
            Self::Node(w) => w.upgrade().map(Item::Node),
            Self::Leaf(w) => w.upgrade().map(Item::Leaf),
        }
    }
}

impl Item {
    pub fn new_node() -> Self {
        Self::Node(Rc::new(RefCell::new(NodeData {
            offset: None,
            link: None,
            children: IndexMap::new(),
        })))
    }

    pub fn new_leaf(value: Json) -> Self {
        Self::Leaf(Rc::new(RefCell::new(LeafData {
            offset: None,
            link: None,
            value,
        })))
    }

    pub fn as_node(&self) -> Option<&Rc<RefCell<NodeData>>> {
        match self {
            Self::Node(n) => Some(n),
            Self::Leaf(_) => None,
        }
    }

    pub fn as_leaf(&self) -> Option<&Rc<RefCell<LeafData>>> {
        match self {
            Self::Leaf(l) => Some(l),
            Self::Node(_) => None,
        }
    }

    pub fn offset(&self) -> Option<u64> {
        match self {
            Self::Node(n) => n.borrow().offset,
            Self::Leaf(l) => l.borrow().offset,
        }
    }

    pub fn modified(&self) -> bool {
        self.offset().is_none()
    }

    pub fn link(&self) -> Option<Link> {
        match self {
            Self::Node(n) => n.borrow().link.clone(),
            Self::Leaf(l) => l.borrow().link.clone(),
        }
    }

    pub fn attached(&self) -> bool {
        self.link().is_some()
    }

    pub fn downgrade(&self) -> WeakItem {
        match self {
            Self::Node(n) => WeakItem::Node(Rc::downgrade(n)),
            Self::Leaf(l) => WeakItem::Leaf(Rc::downgrade(l)),
        }
    }

    pub fn ptr_eq(&self, other: &Item) -> bool {
        match (self, other) {
            (Self::Node(a), Self::Node(b)) => Rc::ptr_eq(a, b),
            (Self::Leaf(a), Self::Leaf(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }

    fn attach(&self, parent: Weak<RefCell<NodeData>>, key: String) -> StoreResult<()> {
        if self.attached() {
            return Err(StoreError::Attachment(format!(
                "item is already attached (attempted re-attach at key {key:?})"
            )));
        }
        let link = Some(Link { parent, key });
        match self {
            Self::Node(n) => n.borrow_mut().link = link,
            Self::Leaf(l) => l.borrow_mut().link = link,
        }
        Ok(())
    }

    fn detach(&self) -> StoreResult<Link> {
        let taken = match self {
            Self::Node(n) => n.borrow_mut().link.take(),
            Self::Leaf(l) => l.borrow_mut().link.take(),
        };
        taken.ok_or_else(|| StoreError::Attachment("item is not attached".to_owned()))
    }

    /// Deep clone: recursively clones nodes and leaves, discarding
    /// offsets and links. Used for tree-copy `set()` and for
    /// materializing query results.
    pub fn clone_detached(&self) -> Self {
        match self {
            Self::Leaf(l) => Self::new_leaf(l.borrow().value.clone()),
            Self::Node(n) => {
                let clone = Self::new_node();
                let clone_rc = clone.as_node().unwrap().clone();
                for (key, child) in n.borrow().children.iter() {
                    // Cloning only ever walks children this process already
                    // resolved; unresolved offsets are cloned structurally
                    // without forcing a load.
                    let cloned_child = match child {
                        Child::Offset(o) => Child::Offset(*o),
                        Child::Strong(item) => {
                            let c = item.clone_detached();
                            c.attach(Rc::downgrade(&clone_rc), key.clone()).unwrap();
                            Child::Strong(c)
                        }
                        Child::Weak(o, weak) => match weak.upgrade() {
                            Some(item) => {
                                let c = item.clone_detached();
                                c.attach(Rc::downgrade(&clone_rc), key.clone()).unwrap();
                                Child::Strong(c)
                            }
                            None => Child::Offset(*o),
                        },
                    };
                    clone_rc.borrow_mut().children.insert(key.clone(), cloned_child);
                }
                clone
            }
        }
    }
}

/// A node's representation of one child slot.
#[derive(Clone)]
pub enum Child {
    /// Not yet loaded; `u64` is the on-disk offset.
    Offset(u64),
    /// Loaded and strongly held.
    Strong(Item),
    /// Loaded, but only weakly held (volatile mode) — `u64` is the
    /// offset to reload from on a cache miss.
    Weak(u64, WeakItem),
}

fn encode_leaf(value: &Json) -> StoreResult<Vec<u8>> {
    let json = serde_json::to_vec(value)
        .map_err(|e| StoreError::Malformed(format!("failed to encode leaf: {e}")))?;
    let mut out = Vec::with_capacity(json.len() + 1);
    out.push(KIND_LEAF);
    out.extend(json);
    Ok(out)
}

fn encode_node(children: &serde_json::Map<String, Json>) -> StoreResult<Vec<u8>> {
    let json = serde_json::to_vec(&Json::Object(children.clone()))
        .map_err(|e| StoreError::Malformed(format!("failed to encode node: {e}")))?;
    let mut out = Vec::with_capacity(json.len() + 1);
    out.push(KIND_NODE);
    out.extend(json);
    Ok(out)
}

fn decode_record(offset: u64, bytes: &[u8]) -> StoreResult<Item> {
    let (&kind, body) = bytes
        .split_first()
        .ok_or_else(|| StoreError::Malformed(format!("empty record at offset {offset}")))?;
    match kind {
        KIND_LEAF => {
            let value: Json = serde_json::from_slice(body).map_err(|e| {
                StoreError::Malformed(format!("leaf at offset {offset} is not valid JSON: {e}"))
            })?;
            Ok(Item::Leaf(Rc::new(RefCell::new(LeafData {
                offset: Some(offset),
                link: None,
                value,
            }))))
        }
        KIND_NODE => {
            let value: Json = serde_json::from_slice(body).map_err(|e| {
                StoreError::Malformed(format!("node at offset {offset} is not valid JSON: {e}"))
            })?;
            let obj = value.as_object().ok_or_else(|| {
                StoreError::Malformed(format!("node at offset {offset} is not a JSON object"))
            })?;
            let mut children = IndexMap::with_capacity(obj.len());
            for (key, v) in obj {
                let child_offset = v.as_u64().ok_or_else(|| {
                    StoreError::Malformed(format!(
                        "node at offset {offset}: child {key:?} is not an integer offset"
                    ))
                })?;
                children.insert(key.clone(), Child::Offset(child_offset));
            }
            Ok(Item::Node(Rc::new(RefCell::new(NodeData {
                offset: Some(offset),
                link: None,
                children,
            }))))
        }
        other => Err(StoreError::Malformed(format!(
            "offset {offset}: unrecognized record discriminator {other:#x}"
        ))),
    }
}

/// Events yielded by [`Store::diff`]. `path` is the dotted sequence of
/// keys from the compared roots down to the event's location. `Enter`
/// and `Leave` carry the old and new side's materialized node, same as
/// `Changed`, so a consumer never has to re-walk the tree to see what
/// was entered or left.
#[derive(Debug, Clone, PartialEq)]
pub enum DiffEvent {
    Enter(Vec<String>, Json, Json),
    Leave(Vec<String>, Json, Json),
    Added(Vec<String>, Json),
    Removed(Vec<String>, Json),
    Changed(Vec<String>, Json, Json),
}

/// Materialize an item (and, for a node, its whole reachable subtree)
/// into a plain JSON value. Forces every unresolved child along the
/// way to load.
pub fn item_to_json(store: &Store, item: &Item) -> StoreResult<Json> {
    match item {
        Item::Leaf(l) => Ok(l.borrow().value.clone()),
        Item::Node(n) => {
            let keys: Vec<String> = n.borrow().children.keys().cloned().collect();
            let mut obj = serde_json::Map::new();
            for key in keys {
                if let Some(child) = store.get_child(n, &key)? {
                    obj.insert(key, item_to_json(store, &child)?);
                }
            }
            Ok(Json::Object(obj))
        }
    }
}

/// Lazy-loading, copy-on-write store of nodes and leaves over a
/// [`Log`]. One `Store` owns one in-memory root at a time; [`diff`]
/// is implemented by constructing a second, read-only `Store` pinned
/// at the old root via [`Store::at_offset`].
pub struct Store {
    log: Arc<Log>,
    volatile: bool,
    observed_root: AtomicU64,
    root: RefCell<Option<Item>>,
}

impl Store {
    /// Open a store view whose root is the log's current root at the
    /// moment of the call (`0` becomes `None` — see [`Store::root`]).
    pub fn open(log: Arc<Log>, volatile: bool) -> StoreResult<Self> {
        let observed = log.get_current()?;
        Self::at_offset(log, volatile, observed)
    }

    /// Open a store view pinned at a specific (already-committed) root
    /// offset, bypassing `Log::get_current`. Used internally to build
    /// the "old" side of a [`Store::diff`].
    pub fn at_offset(log: Arc<Log>, volatile: bool, offset: u64) -> StoreResult<Self> {
        let root = if offset == 0 {
            None
        } else {
            Some(decode_record(offset, &log.load(offset)?)?)
        };
        Ok(Self {
            log,
            volatile,
            observed_root: AtomicU64::new(offset),
            root: RefCell::new(root),
        })
    }

    pub fn log(&self) -> &Arc<Log> {
        &self.log
    }

    pub fn is_volatile(&self) -> bool {
        self.volatile
    }

    pub fn observed_root(&self) -> u64 {
        self.observed_root.load(Ordering::Acquire)
    }

    /// The current in-memory root. Raises `NullEntryPoint` if the
    /// store has none (fresh file, or root explicitly detached).
    pub fn root(&self) -> StoreResult<Item> {
        self.root.borrow().clone().ok_or(StoreError::NullEntryPoint)
    }

    pub fn root_opt(&self) -> Option<Item> {
        self.root.borrow().clone()
    }

    pub fn set_root(&self, item: Item) {
        *self.root.borrow_mut() = Some(item);
    }

    /// Clears the in-memory root; the next `commit()` raises
    /// `DetachedRoot` unless a new root is assigned first.
    pub fn detach_root(&self) {
        *self.root.borrow_mut() = None;
    }

    pub fn new_node(&self) -> Item {
        Item::new_node()
    }

    pub fn new_leaf(&self, value: Json) -> Item {
        Item::new_leaf(value)
    }

    fn load_item(&self, offset: u64) -> StoreResult<Item> {
        decode_record(offset, &self.log.load(offset)?)
    }

    /// Resolve `node`'s child at `key`, loading it if necessary and
    /// caching it per this store's volatility policy. Returns `None`
    /// if there is no such key.
    pub fn get_child(&self, node: &Rc<RefCell<NodeData>>, key: &str) -> StoreResult<Option<Item>> {
        let existing = node.borrow().children.get(key).cloned();
        let resolved = match existing {
            None => return Ok(None),
            Some(Child::Strong(item)) => item,
            Some(Child::Offset(offset)) => {
                let item = self.load_item(offset)?;
                item.attach(Rc::downgrade(node), key.to_owned())?;
                self.cache_child(node, key, offset, &item);
                item
            }
            Some(Child::Weak(offset, weak)) => match weak.upgrade() {
                Some(item) => item,
                None => {
                    let item = self.load_item(offset)?;
                    item.attach(Rc::downgrade(node), key.to_owned())?;
                    self.cache_child(node, key, offset, &item);
                    item
                }
            },
        };
        Ok(Some(resolved))
    }

    fn cache_child(&self, node: &Rc<RefCell<NodeData>>, key: &str, offset: u64, item: &Item) {
        let entry = if self.volatile {
            Child::Weak(offset, item.downgrade())
        } else {
            Child::Strong(item.clone())
        };
        node.borrow_mut().children.insert(key.to_owned(), entry);
    }

    /// Attach `item` to `parent` under `key`, replacing (and detaching)
    /// whatever child previously occupied that key, then propagate
    /// dirtiness up the spine (I4).
    pub fn set_child(&self, parent: &Rc<RefCell<NodeData>>, key: &str, item: Item) -> StoreResult<()> {
        if let Some(previous) = self.get_child(parent, key)? {
            if previous.attached() {
                previous.detach()?;
            }
        }
        item.attach(Rc::downgrade(parent), key.to_owned())?;
        parent
            .borrow_mut()
            .children
            .insert(key.to_owned(), Child::Strong(item));
        self.mark_dirty(parent);
        Ok(())
    }

    /// Remove and detach the child at `key`, if any.
    pub fn remove_child(&self, parent: &Rc<RefCell<NodeData>>, key: &str) -> StoreResult<Option<Item>> {
        let removed = self.get_child(parent, key)?;
        if let Some(item) = &removed {
            if item.attached() {
                item.detach()?;
            }
        }
        parent.borrow_mut().children.shift_remove(key);
        if removed.is_some() {
            self.mark_dirty(parent);
        }
        Ok(removed)
    }

    /// Attach a brand-new (already detached) child at `key` — used by
    /// `Tree::set`'s empty-placeholder and tree-copy shapes, which
    /// don't go through `set_child`'s "replace" bookkeeping because the
    /// realize path may be creating `parent` itself in the same call.
    pub fn attach_child(&self, parent: &Rc<RefCell<NodeData>>, key: &str, item: Item) -> StoreResult<()> {
        item.attach(Rc::downgrade(parent), key.to_owned())?;
        parent
            .borrow_mut()
            .children
            .insert(key.to_owned(), Child::Strong(item));
        self.mark_dirty(parent);
        Ok(())
    }

    /// Detach `item` from its current parent (if any) without
    /// attaching it anywhere else — the first half of a move.
    pub fn detach_item(&self, item: &Item) -> StoreResult<()> {
        let link = item.detach()?;
        if let Some(parent) = link.parent.upgrade() {
            parent.borrow_mut().children.shift_remove(&link.key);
            self.mark_dirty(&parent);
        }
        Ok(())
    }

    /// Mark `node` dirty and propagate upward, stopping as soon as an
    /// already-dirty ancestor is reached (I4).
    fn mark_dirty(&self, node: &Rc<RefCell<NodeData>>) {
        let mut current = node.clone();
        loop {
            let already_dirty = current.borrow().offset.is_none();
            if already_dirty {
                return;
            }
            current.borrow_mut().offset = None;
            let parent = match &current.borrow().link {
                Some(link) => link.parent.upgrade(),
                None => None,
            };
            match parent {
                Some(p) => current = p,
                None => return,
            }
        }
    }

    /// Walk the dirty spine from `item` down, persist bottom-up,
    /// return the offset `item` now has (existing offset if already
    /// clean).
    fn persist(&self, item: &Item) -> StoreResult<u64> {
        match item {
            Item::Leaf(leaf) => {
                if let Some(offset) = leaf.borrow().offset {
                    return Ok(offset);
                }
                let bytes = encode_leaf(&leaf.borrow().value)?;
                let offset = self.log.store(&bytes)?;
                leaf.borrow_mut().offset = Some(offset);
                Ok(offset)
            }
            Item::Node(node) => {
                if let Some(offset) = node.borrow().offset {
                    return Ok(offset);
                }
                let keys: Vec<String> = node.borrow().children.keys().cloned().collect();
                let mut obj = serde_json::Map::with_capacity(keys.len());
                for key in keys {
                    let child = node.borrow().children.get(&key).cloned();
                    let offset = match child {
                        Some(Child::Offset(o)) => o,
                        Some(Child::Strong(child_item)) => {
                            if let Some(o) = child_item.offset() {
                                o
                            } else {
                                let o = self.persist(&child_item)?;
                                self.finalize_persisted_child(node, &key, &child_item, o);
                                o
                            }
                        }
                        Some(Child::Weak(o, weak)) => match weak.upgrade() {
                            Some(child_item) if child_item.offset().is_none() => {
                                let o = self.persist(&child_item)?;
                                self.finalize_persisted_child(node, &key, &child_item, o);
                                o
                            }
                            _ => o,
                        },
                        None => continue,
                    };
                    obj.insert(key, Json::from(offset));
                }
                let bytes = encode_node(&obj)?;
                let offset = self.log.store(&bytes)?;
                node.borrow_mut().offset = Some(offset);
                Ok(offset)
            }
        }
    }

    fn finalize_persisted_child(&self, node: &Rc<RefCell<NodeData>>, key: &str, item: &Item, offset: u64) {
        let entry = if self.volatile {
            Child::Weak(offset, item.downgrade())
        } else {
            Child::Strong(item.clone())
        };
        node.borrow_mut().children.insert(key.to_owned(), entry);
    }

    /// Persist the dirty spine and CAS-advance the log's root (I7).
    /// Returns the new root offset.
    pub fn commit(&self) -> StoreResult<u64> {
        let root = self.root.borrow().clone().ok_or(StoreError::DetachedRoot)?;
        let expected = self.observed_root.load(Ordering::Acquire);
        let new_root = self.persist(&root)?;
        self.log.set_current(new_root, Some(expected))?;
        self.observed_root.store(new_root, Ordering::Release);
        Ok(new_root)
    }

    pub fn dump_storage(&self) -> StoreResult<String> {
        Ok(self.log.dump()?)
    }

    /// Compare `old` against `self`'s current root, both readable
    /// through `self`'s log (`old` is typically a [`Store::at_offset`]
    /// view of the same file at an earlier root).
    pub fn diff(&self, old: &Store) -> StoreResult<Vec<DiffEvent>> {
        let mut events = Vec::new();
        match (old.root_opt(), self.root_opt()) {
            (None, None) => {}
            (None, Some(new)) => events.push(DiffEvent::Added(Vec::new(), item_to_json(self, &new)?)),
            (Some(old_item), None) => {
                events.push(DiffEvent::Removed(Vec::new(), item_to_json(old, &old_item)?))
            }
            (Some(old_item), Some(new_item)) => {
                Self::diff_items(old, &old_item, self, &new_item, &mut Vec::new(), &mut events)?;
            }
        }
        Ok(events)
    }

    fn diff_items(
        old_store: &Store,
        old_item: &Item,
        new_store: &Store,
        new_item: &Item,
        path: &mut Vec<String>,
        events: &mut Vec<DiffEvent>,
    ) -> StoreResult<()> {
        match (old_item, new_item) {
            (Item::Leaf(old_leaf), Item::Leaf(new_leaf)) => {
                if old_leaf.borrow().value != new_leaf.borrow().value {
                    events.push(DiffEvent::Changed(
                        path.clone(),
                        old_leaf.borrow().value.clone(),
                        new_leaf.borrow().value.clone(),
                    ));
                }
            }
            (Item::Node(old_node), Item::Node(new_node)) => {
                let old_json = item_to_json(old_store, old_item)?;
                let new_json = item_to_json(new_store, new_item)?;
                events.push(DiffEvent::Enter(path.clone(), old_json.clone(), new_json.clone()));
                let mut keys: Vec<String> = old_node
                    .borrow()
                    .children
                    .keys()
                    .chain(new_node.borrow().children.keys())
                    .cloned()
                    .collect();
                keys.sort();
                keys.dedup();
                for key in keys {
                    let old_child = old_store.get_child(old_node, &key)?;
                    let new_child = new_store.get_child(new_node, &key)?;
                    path.push(key.clone());
                    match (old_child, new_child) {
                        (None, None) => {}
                        (None, Some(n)) => {
                            events.push(DiffEvent::Added(path.clone(), item_to_json(new_store, &n)?))
                        }
                        (Some(o), None) => {
                            events.push(DiffEvent::Removed(path.clone(), item_to_json(old_store, &o)?))
                        }
                        (Some(o), Some(n)) => {
                            Self::diff_items(old_store, &o, new_store, &n, path, events)?
                        }
                    }
                    path.pop();
                }
                events.push(DiffEvent::Leave(path.clone(), old_json, new_json));
            }
            // shape mismatch — counts as changed (node vs leaf)
            _ => {
                events.push(DiffEvent::Changed(
                    path.clone(),
                    item_to_json(old_store, old_item)?,
                    item_to_json(new_store, new_item)?,
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc as StdArc;

    fn store() -> Store {
        let log = StdArc::new(Log::open_in_memory().unwrap());
        Store::open(log, false).unwrap()
    }

    #[test]
    fn fresh_store_has_no_root() {
        let s = store();
        assert!(matches!(s.root().unwrap_err(), StoreError::NullEntryPoint));
    }

    #[test]
    fn attach_twice_is_rejected() {
        let s = store();
        let root = s.new_node();
        s.set_root(root.clone());
        let root_node = root.as_node().unwrap().clone();
        let leaf = s.new_leaf(Json::from(1));
        s.set_child(&root_node, "a", leaf.clone()).unwrap();
        assert!(leaf.attach(Rc::downgrade(&root_node), "b".to_owned()).is_err());
    }

    #[test]
    fn commit_persists_dirty_spine_and_advances_root() {
        let s = store();
        let root = s.new_node();
        s.set_root(root.clone());
        let root_node = root.as_node().unwrap().clone();
        s.set_child(&root_node, "a", s.new_leaf(Json::from(1))).unwrap();
        let new_root = s.commit().unwrap();
        assert_ne!(new_root, 0);
        assert_eq!(s.log.get_current().unwrap(), new_root);
        assert_eq!(root.offset(), Some(new_root));
    }

    // P8: canonical JSON means equal leaves encode identically.
    #[test]
    fn equal_leaves_encode_to_identical_bytes() {
        let a = encode_leaf(&Json::from(serde_json::json!({"z": 1, "a": 2}))).unwrap();
        let b = encode_leaf(&Json::from(serde_json::json!({"a": 2, "z": 1}))).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn mark_dirty_stops_at_already_dirty_ancestor() {
        let s = store();
        let root = s.new_node();
        s.set_root(root.clone());
        let root_node = root.as_node().unwrap().clone();
        let child = s.new_node();
        s.set_child(&root_node, "a", child.clone()).unwrap();
        s.commit().unwrap();
        assert!(root.offset().is_some());
        let child_node = child.as_node().unwrap().clone();
        s.set_child(&child_node, "b", s.new_leaf(Json::from(true))).unwrap();
        assert!(child.offset().is_none());
        assert!(root.offset().is_none());
    }
}
