//! # Staging Table
//!
//! A tree of versioned overlays. The root node is the base view of an
//! [`MvccDb`](super::MvccDb) and reads through to storage lazily; every
//! other node is a prepared transaction hanging off some parent tid.
//!
//! ## Versions
//!
//! Each [`ValueItem`] remembers the parent's version it was read at
//! (`old_ver`). A merge succeeds only if the parent still has that version,
//! and every merged write bumps the parent's version by one. That is the
//! whole optimistic concurrency scheme: two siblings that wrote the same
//! key cannot both merge.
//!
//! ## Locking
//!
//! Each node has a `RwLock<()>` next to its item map. Single-key reads and
//! writes take it shared (the map is concurrent on its own); a merge takes
//! the parent's lock exclusively, then the child's. A fetch never holds its
//! own lock while it walks up to the parent, so the lock order is always
//! parent before child.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};

use super::{MvccError, MvccResult};
use crate::crypto::hash::Hash;
use crate::storage::kv::{get_opt, Storage};

/// Transaction id. Any byte string; block execution uses tx hashes.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Tid(Vec<u8>);

impl Tid {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<&str> for Tid {
    fn from(s: &str) -> Self {
        Self(s.as_bytes().to_vec())
    }
}

impl From<Hash> for Tid {
    fn from(h: Hash) -> Self {
        Self(h.to_vec())
    }
}

impl From<u64> for Tid {
    fn from(n: u64) -> Self {
        Self(n.to_be_bytes().to_vec())
    }
}

impl fmt::Display for Tid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match std::str::from_utf8(&self.0) {
            Ok(s) if s.chars().all(|c| c.is_ascii_graphic()) => f.write_str(s),
            _ => f.write_str(&hex::encode(&self.0)),
        }
    }
}

impl fmt::Debug for Tid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Tid({self})")
    }
}

/// One key as seen by one staging node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValueItem {
    /// `None` when the key does not exist (never stored, or deleted).
    pub value: Option<Vec<u8>>,
    pub old_ver: u64,
    pub new_ver: u64,
    pub deleted: bool,
    pub dirty: bool,
    /// Loaded from storage and never written since.
    pub default: bool,
    /// The tid whose write produced this item.
    pub tid: Tid,
}

impl ValueItem {
    fn from_storage(value: Option<Vec<u8>>, tid: Tid) -> Self {
        Self {
            value,
            old_ver: 0,
            new_ver: 1,
            deleted: false,
            dirty: false,
            default: true,
            tid,
        }
    }

    /// The view a child takes of its parent's item. The writer tid is kept
    /// so a later merge can tell whose write the child depended on.
    fn child_copy(&self) -> Self {
        Self {
            value: self.value.clone(),
            old_ver: self.old_ver,
            new_ver: self.old_ver + 1,
            deleted: self.deleted,
            dirty: false,
            default: self.default,
            tid: self.tid.clone(),
        }
    }

    /// The live value, hiding deletions.
    pub fn visible(&self) -> Option<&[u8]> {
        if self.deleted {
            None
        } else {
            self.value.as_deref()
        }
    }
}

struct StagingNode {
    tid: Tid,
    parent: Option<Arc<StagingNode>>,
    lock: RwLock<()>,
    items: DashMap<Vec<u8>, ValueItem>,
    children: Mutex<HashSet<Tid>>,
}

impl StagingNode {
    fn new(tid: Tid, parent: Option<Arc<StagingNode>>) -> Self {
        Self {
            tid,
            parent,
            lock: RwLock::new(()),
            items: DashMap::new(),
            children: Mutex::new(HashSet::new()),
        }
    }
}

/// All staging nodes of one MVCC transaction, addressed by tid.
pub struct StagingTable {
    storage: Arc<dyn Storage>,
    root: Arc<StagingNode>,
    nodes: DashMap<Tid, Arc<StagingNode>>,
}

impl fmt::Debug for StagingTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StagingTable")
            .field("root", &self.root.tid)
            .field("nodes", &self.nodes.len())
            .finish()
    }
}

impl StagingTable {
    pub fn new(storage: Arc<dyn Storage>, root_tid: Tid) -> Self {
        let root = Arc::new(StagingNode::new(root_tid.clone(), None));
        let nodes = DashMap::new();
        nodes.insert(root_tid, root.clone());
        Self {
            storage,
            root,
            nodes,
        }
    }

    pub fn root_tid(&self) -> &Tid {
        &self.root.tid
    }

    pub fn contains(&self, tid: &Tid) -> bool {
        self.nodes.contains_key(tid)
    }

    fn node(&self, tid: &Tid) -> MvccResult<Arc<StagingNode>> {
        self.nodes
            .get(tid)
            .map(|n| n.value().clone())
            .ok_or_else(|| MvccError::TidNotFound(tid.clone()))
    }

    /// Open a child of `parent` named `tid`.
    pub fn prepare(&self, parent: &Tid, tid: Tid) -> MvccResult<()> {
        let parent_node = self.node(parent)?;
        match self.nodes.entry(tid.clone()) {
            Entry::Occupied(_) => Err(MvccError::TidExists(tid)),
            Entry::Vacant(slot) => {
                slot.insert(Arc::new(StagingNode::new(tid.clone(), Some(parent_node.clone()))));
                parent_node.children.lock().insert(tid);
                Ok(())
            }
        }
    }

    // -- Reads and writes ---------------------------------------------------

    fn fetch(&self, node: &StagingNode, key: &[u8]) -> MvccResult<ValueItem> {
        {
            let _shared = node.lock.read();
            if let Some(item) = node.items.get(key) {
                return Ok(item.clone());
            }
        }
        let loaded = match &node.parent {
            Some(parent) => self.fetch(parent, key)?.child_copy(),
            None => ValueItem::from_storage(get_opt(&*self.storage, key)?, node.tid.clone()),
        };
        let _shared = node.lock.read();
        let item = node.items.entry(key.to_vec()).or_insert(loaded).clone();
        Ok(item)
    }

    pub fn get(&self, tid: &Tid, key: &[u8]) -> MvccResult<ValueItem> {
        let node = self.node(tid)?;
        self.fetch(&node, key)
    }

    pub fn put(&self, tid: &Tid, key: &[u8], value: &[u8]) -> MvccResult<()> {
        let node = self.node(tid)?;
        self.fetch(&node, key)?;
        let _shared = node.lock.read();
        if let Some(mut item) = node.items.get_mut(key) {
            if item.deleted || item.value.as_deref() != Some(value) {
                item.dirty = true;
                item.default = false;
            }
            item.value = Some(value.to_vec());
            item.deleted = false;
        }
        Ok(())
    }

    /// Overwrite an item's value and flags without comparing.
    pub fn set(
        &self,
        tid: &Tid,
        key: &[u8],
        value: Option<Vec<u8>>,
        deleted: bool,
        dirty: bool,
    ) -> MvccResult<()> {
        let node = self.node(tid)?;
        self.fetch(&node, key)?;
        let _shared = node.lock.read();
        if let Some(mut item) = node.items.get_mut(key) {
            item.value = value;
            item.deleted = deleted;
            item.dirty = dirty;
            if dirty {
                item.default = false;
            }
        }
        Ok(())
    }

    pub fn del(&self, tid: &Tid, key: &[u8]) -> MvccResult<()> {
        self.set(tid, key, None, true, true)
    }

    // -- Structure ----------------------------------------------------------

    /// Drop `tid` and every node below it. The root cannot be purged.
    pub fn purge(&self, tid: &Tid) -> MvccResult<()> {
        if *tid == self.root.tid {
            return Err(MvccError::CannotMergeRoot);
        }
        let node = self.node(tid)?;
        if let Some(parent) = &node.parent {
            parent.children.lock().remove(tid);
        }
        let mut pending = vec![tid.clone()];
        while let Some(t) = pending.pop() {
            if let Some((_, n)) = self.nodes.remove(&t) {
                pending.extend(n.children.lock().drain());
            }
        }
        Ok(())
    }

    /// Fold the node's reads and writes into its parent.
    ///
    /// On success returns the tids this node read writes from, in key order
    /// without repeats. On conflict nothing is copied and the node stays in
    /// the table so the caller can reset it.
    pub fn merge_to_parent(&self, tid: &Tid) -> MvccResult<Vec<Tid>> {
        let node = self.node(tid)?;
        let parent = node.parent.clone().ok_or(MvccError::CannotMergeRoot)?;

        let _parent_guard = parent.lock.write();
        let _node_guard = node.lock.write();

        let mut keys: Vec<Vec<u8>> = node.items.iter().map(|e| e.key().clone()).collect();
        keys.sort();

        let mut conflicts = Vec::new();
        let mut deps: Vec<Tid> = Vec::new();
        for key in &keys {
            let Some(item) = node.items.get(key).map(|i| i.clone()) else {
                continue;
            };
            let current = parent.items.get(key).map(|i| i.clone());
            let parent_ver = current.as_ref().map_or(0, |p| p.old_ver);
            if item.old_ver != parent_ver {
                conflicts.push(key.clone());
                continue;
            }
            let Some(current) = current else { continue };
            if current.default && !current.dirty {
                continue;
            }
            if current.tid == parent.tid {
                continue;
            }
            if !deps.contains(&current.tid) {
                deps.push(current.tid);
            }
        }
        if !conflicts.is_empty() {
            return Err(MvccError::KeyConflict(conflicts));
        }

        for key in keys {
            let Some(item) = node.items.get(&key).map(|i| i.clone()) else {
                continue;
            };
            if !item.dirty {
                continue;
            }
            let old_ver = item.old_ver + 1;
            parent.items.insert(
                key,
                ValueItem {
                    value: item.value,
                    old_ver,
                    new_ver: old_ver + 1,
                    deleted: item.deleted,
                    dirty: true,
                    default: false,
                    tid: node.tid.clone(),
                },
            );
        }
        Ok(deps)
    }

    /// Every dirty item of `tid`, sorted by key.
    pub fn dirty_items(&self, tid: &Tid) -> MvccResult<Vec<(Vec<u8>, ValueItem)>> {
        let node = self.node(tid)?;
        let _shared = node.lock.read();
        let mut out: Vec<(Vec<u8>, ValueItem)> = node
            .items
            .iter()
            .filter(|e| e.value().dirty)
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(out)
    }
}
