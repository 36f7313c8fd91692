//! # Merkle Patricia Trie
//!
//! A content-addressed prefix tree. Keys are hashed with BLAKE3 and the
//! trie routes on the nibbles of that hash, so every path is 64 nibbles long
//! and paths stay balanced whatever keys callers use. Nodes are
//! bincode-encoded and stored in [`Storage`] under the BLAKE3 hash of their
//! encoding, so a root hash pins the entire contents and any historical root
//! can be reopened as long as its nodes are still in storage.
//!
//! ## Node kinds
//!
//! | Node        | Holds                                          |
//! |-------------|------------------------------------------------|
//! | `Branch`    | 16 optional children                           |
//! | `Extension` | a shared nibble path and one child             |
//! | `Leaf`      | the remaining nibble path, the key, the value  |
//!
//! Leaves keep the unhashed key so iteration can hand it back.
//!
//! ## Canonical shape
//!
//! Insert and delete always leave the trie in the same shape for the same
//! set of keys: a branch with a single child is collapsed, extensions merge
//! with extensions and leaves below them. That is what makes the root hash
//! independent of the order in which keys were written.
//!
//! Old nodes are never deleted; a rollback only needs to restore the root.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::kv::{Storage, StorageError};
use crate::crypto::hash::{blake3_hash, Hash};

#[derive(Debug, thiserror::Error)]
pub enum TrieError {
    #[error("key not found in trie")]
    NotFound,
    #[error("trie node {0} missing from storage")]
    MissingNode(Hash),
    #[error("trie node codec: {0}")]
    Codec(String),
    #[error("trie is already in batch mode")]
    AlreadyInBatch,
    #[error("trie is not in batch mode")]
    NotInBatch,
    #[error(transparent)]
    Storage(#[from] StorageError),
}

pub type TrieResult<T> = Result<T, TrieError>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
enum Node {
    Branch {
        children: [Option<Hash>; 16],
    },
    Extension {
        path: Vec<u8>,
        child: Hash,
    },
    Leaf {
        path: Vec<u8>,
        key: Vec<u8>,
        value: Vec<u8>,
    },
}

/// Nibble path of `key`.
fn key_path(key: &[u8]) -> Vec<u8> {
    blake3_hash(key)
        .as_bytes()
        .iter()
        .flat_map(|b| [b >> 4, b & 0x0f])
        .collect()
}

fn common_prefix(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b).take_while(|(x, y)| x == y).count()
}

fn concat(a: &[u8], b: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(a.len() + b.len());
    out.extend_from_slice(a);
    out.extend_from_slice(b);
    out
}

/// Every path has the same length, so a walk never runs out of nibbles
/// above a leaf. If it does, the stored nodes are corrupt.
fn split_path(path: &[u8]) -> TrieResult<(usize, &[u8])> {
    path.split_first()
        .map(|(first, rest)| (*first as usize, rest))
        .ok_or_else(|| TrieError::Codec("key path ends inside the trie".into()))
}

/// A handle on one version of the trie. Cloning is cheap and yields an
/// independent handle over the same storage.
#[derive(Clone)]
pub struct Trie {
    storage: Arc<dyn Storage>,
    root: Hash,
    batch_snapshot: Option<Hash>,
}

impl std::fmt::Debug for Trie {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Trie")
            .field("root", &self.root)
            .field("in_batch", &self.batch_snapshot.is_some())
            .finish()
    }
}

impl Trie {
    /// An empty trie. Its root is [`Hash::ZERO`].
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self {
            storage,
            root: Hash::ZERO,
            batch_snapshot: None,
        }
    }

    /// Reopen the trie at `root`, checking the root node is present.
    pub fn open(storage: Arc<dyn Storage>, root: Hash) -> TrieResult<Self> {
        let trie = Self {
            storage,
            root,
            batch_snapshot: None,
        };
        if !root.is_zero() {
            trie.load(&root)?;
        }
        Ok(trie)
    }

    pub fn root_hash(&self) -> Hash {
        self.root
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_zero()
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    // -- Node I/O ----------------------------------------------------------

    fn load(&self, hash: &Hash) -> TrieResult<Node> {
        let bytes = self.storage.get(hash.as_bytes()).map_err(|e| match e {
            StorageError::NotFound => TrieError::MissingNode(*hash),
            other => TrieError::Storage(other),
        })?;
        bincode::deserialize(&bytes).map_err(|e| TrieError::Codec(e.to_string()))
    }

    fn store(&self, node: &Node) -> TrieResult<Hash> {
        let bytes = bincode::serialize(node).map_err(|e| TrieError::Codec(e.to_string()))?;
        let hash = blake3_hash(&bytes);
        self.storage.put(hash.as_bytes(), &bytes)?;
        Ok(hash)
    }

    // -- Get ---------------------------------------------------------------

    /// `None` when the key is absent.
    pub fn get(&self, key: &[u8]) -> TrieResult<Option<Vec<u8>>> {
        if self.root.is_zero() {
            return Ok(None);
        }
        let nibbles = key_path(key);
        let mut path: &[u8] = &nibbles;
        let mut current = self.root;
        loop {
            match self.load(&current)? {
                Node::Leaf { path: lpath, value, .. } => {
                    return Ok((lpath == path).then_some(value));
                }
                Node::Extension { path: epath, child } => {
                    if !path.starts_with(&epath) {
                        return Ok(None);
                    }
                    path = &path[epath.len()..];
                    current = child;
                }
                Node::Branch { children } => {
                    let (idx, rest) = split_path(path)?;
                    match children[idx] {
                        Some(child) => {
                            path = rest;
                            current = child;
                        }
                        None => return Ok(None),
                    }
                }
            }
        }
    }

    // -- Put ---------------------------------------------------------------

    /// Insert or overwrite `key`, returning the new root.
    pub fn put(&mut self, key: &[u8], value: &[u8]) -> TrieResult<Hash> {
        let root = (!self.root.is_zero()).then_some(self.root);
        self.root = self.insert(root, &key_path(key), key, value)?;
        Ok(self.root)
    }

    fn insert(&self, node: Option<Hash>, path: &[u8], key: &[u8], value: &[u8]) -> TrieResult<Hash> {
        let Some(hash) = node else {
            return self.store(&Node::Leaf {
                path: path.to_vec(),
                key: key.to_vec(),
                value: value.to_vec(),
            });
        };

        match self.load(&hash)? {
            Node::Leaf {
                path: lpath,
                key: lkey,
                value: lvalue,
            } => {
                if lpath == path {
                    return self.store(&Node::Leaf {
                        path: lpath,
                        key: key.to_vec(),
                        value: value.to_vec(),
                    });
                }
                let c = common_prefix(&lpath, path);
                let mut children: [Option<Hash>; 16] = Default::default();
                self.place(&mut children, &lpath[c..], &lkey, &lvalue)?;
                self.place(&mut children, &path[c..], key, value)?;
                let branch = self.store(&Node::Branch { children })?;
                self.wrap_extension(&path[..c], branch)
            }
            Node::Extension { path: epath, child } => {
                let c = common_prefix(&epath, path);
                if c == epath.len() {
                    let new_child = self.insert(Some(child), &path[c..], key, value)?;
                    return self.store(&Node::Extension {
                        path: epath,
                        child: new_child,
                    });
                }
                // Split the extension at the first differing nibble.
                let mut children: [Option<Hash>; 16] = Default::default();
                let ext_rest = &epath[c + 1..];
                children[epath[c] as usize] = Some(if ext_rest.is_empty() {
                    child
                } else {
                    self.store(&Node::Extension {
                        path: ext_rest.to_vec(),
                        child,
                    })?
                });
                self.place(&mut children, &path[c..], key, value)?;
                let branch = self.store(&Node::Branch { children })?;
                self.wrap_extension(&path[..c], branch)
            }
            Node::Branch { mut children } => {
                let (idx, rest) = split_path(path)?;
                children[idx] = Some(self.insert(children[idx], rest, key, value)?);
                self.store(&Node::Branch { children })
            }
        }
    }

    /// Hang a leaf for `key` at `rest` below a fresh branch.
    fn place(&self, children: &mut [Option<Hash>; 16], rest: &[u8], key: &[u8], value: &[u8]) -> TrieResult<()> {
        let (idx, tail) = split_path(rest)?;
        children[idx] = Some(self.store(&Node::Leaf {
            path: tail.to_vec(),
            key: key.to_vec(),
            value: value.to_vec(),
        })?);
        Ok(())
    }

    fn wrap_extension(&self, path: &[u8], child: Hash) -> TrieResult<Hash> {
        if path.is_empty() {
            Ok(child)
        } else {
            self.store(&Node::Extension {
                path: path.to_vec(),
                child,
            })
        }
    }

    // -- Del ---------------------------------------------------------------

    /// Remove `key`. Fails with [`TrieError::NotFound`] when it is absent.
    pub fn del(&mut self, key: &[u8]) -> TrieResult<Hash> {
        if self.root.is_zero() {
            return Err(TrieError::NotFound);
        }
        self.root = self
            .remove(self.root, &key_path(key))?
            .unwrap_or(Hash::ZERO);
        Ok(self.root)
    }

    /// Returns the new subtree root, or `None` if the subtree is now empty.
    fn remove(&self, hash: Hash, path: &[u8]) -> TrieResult<Option<Hash>> {
        match self.load(&hash)? {
            Node::Leaf { path: lpath, .. } => {
                if lpath == path {
                    Ok(None)
                } else {
                    Err(TrieError::NotFound)
                }
            }
            Node::Extension { path: epath, child } => {
                if !path.starts_with(&epath) {
                    return Err(TrieError::NotFound);
                }
                match self.remove(child, &path[epath.len()..])? {
                    None => Ok(None),
                    Some(new_child) => self.prefix_node(&epath, new_child).map(Some),
                }
            }
            Node::Branch { mut children } => {
                let (idx, rest) = split_path(path)?;
                let child = children[idx].ok_or(TrieError::NotFound)?;
                children[idx] = self.remove(child, rest)?;
                self.normalize_branch(children)
            }
        }
    }

    /// Collapse a branch left with fewer than two children.
    fn normalize_branch(&self, children: [Option<Hash>; 16]) -> TrieResult<Option<Hash>> {
        let occupied: Vec<usize> = (0..16).filter(|i| children[*i].is_some()).collect();
        match occupied.as_slice() {
            [] => Ok(None),
            [only] => {
                let child = children[*only].ok_or(TrieError::NotFound)?;
                self.prefix_node(&[*only as u8], child).map(Some)
            }
            _ => self.store(&Node::Branch { children }).map(Some),
        }
    }

    /// Put `prefix` in front of the node at `child`, merging paths where the
    /// child is itself a leaf or an extension.
    fn prefix_node(&self, prefix: &[u8], child: Hash) -> TrieResult<Hash> {
        match self.load(&child)? {
            Node::Leaf { path, key, value } => self.store(&Node::Leaf {
                path: concat(prefix, &path),
                key,
                value,
            }),
            Node::Extension { path, child: inner } => self.store(&Node::Extension {
                path: concat(prefix, &path),
                child: inner,
            }),
            Node::Branch { .. } => self.store(&Node::Extension {
                path: prefix.to_vec(),
                child,
            }),
        }
    }

    // -- Batch -------------------------------------------------------------

    /// Remember the current root so a later [`rollback`](Self::rollback)
    /// can return to it.
    pub fn begin_batch(&mut self) -> TrieResult<()> {
        if self.batch_snapshot.is_some() {
            return Err(TrieError::AlreadyInBatch);
        }
        self.batch_snapshot = Some(self.root);
        Ok(())
    }

    pub fn commit(&mut self) -> TrieResult<()> {
        self.batch_snapshot.take().ok_or(TrieError::NotInBatch)?;
        Ok(())
    }

    pub fn rollback(&mut self) -> TrieResult<()> {
        self.root = self.batch_snapshot.take().ok_or(TrieError::NotInBatch)?;
        Ok(())
    }

    pub fn in_batch(&self) -> bool {
        self.batch_snapshot.is_some()
    }

    // -- Iteration ---------------------------------------------------------

    /// Entries whose key starts with `prefix`. Paths are hashed, so a prefix
    /// cannot prune the walk; every leaf is visited and filtered.
    pub fn iter_prefix(&self, prefix: &[u8]) -> TrieIterator {
        let mut stack = Vec::new();
        if !self.root.is_zero() {
            stack.push(self.root);
        }
        TrieIterator {
            trie: self.clone(),
            stack,
            prefix: prefix.to_vec(),
        }
    }

    /// Every entry, in ascending order of hashed key.
    pub fn iter(&self) -> TrieIterator {
        self.iter_prefix(&[])
    }
}

/// Lazy in-order walk. Nodes are loaded from storage as the walk reaches
/// them, so a storage failure surfaces as an `Err` item.
pub struct TrieIterator {
    trie: Trie,
    stack: Vec<Hash>,
    prefix: Vec<u8>,
}

impl Iterator for TrieIterator {
    type Item = TrieResult<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        while let Some(hash) = self.stack.pop() {
            let node = match self.trie.load(&hash) {
                Ok(n) => n,
                Err(e) => {
                    self.stack.clear();
                    return Some(Err(e));
                }
            };
            match node {
                Node::Leaf { key, value, .. } => {
                    if key.starts_with(&self.prefix) {
                        return Some(Ok((key, value)));
                    }
                }
                Node::Extension { child, .. } => self.stack.push(child),
                Node::Branch { children } => {
                    self.stack.extend(children.iter().rev().flatten().copied());
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::kv::MemoryStorage;

    fn new_trie() -> Trie {
        Trie::new(Arc::new(MemoryStorage::new()))
    }

    #[test]
    fn empty_trie_has_zero_root() {
        let trie = new_trie();
        assert!(trie.is_empty());
        assert_eq!(trie.get(b"anything").unwrap(), None);
    }

    #[test]
    fn put_get_overwrite() {
        let mut trie = new_trie();
        trie.put(b"dog", b"puppy").unwrap();
        trie.put(b"doge", b"coin").unwrap();
        trie.put(b"do", b"verb").unwrap();
        trie.put(b"horse", b"stallion").unwrap();

        assert_eq!(trie.get(b"dog").unwrap().unwrap(), b"puppy");
        assert_eq!(trie.get(b"doge").unwrap().unwrap(), b"coin");
        assert_eq!(trie.get(b"do").unwrap().unwrap(), b"verb");
        assert_eq!(trie.get(b"d").unwrap(), None);
        assert_eq!(trie.get(b"dogs").unwrap(), None);

        let before = trie.root_hash();
        trie.put(b"dog", b"hound").unwrap();
        assert_ne!(trie.root_hash(), before);
        assert_eq!(trie.get(b"dog").unwrap().unwrap(), b"hound");
    }

    #[test]
    fn root_is_independent_of_insertion_order() {
        let keys: Vec<Vec<u8>> = (0u32..64)
            .map(|i| blake3_hash(&i.to_be_bytes()).as_bytes()[..6].to_vec())
            .collect();

        let mut forward = new_trie();
        for k in &keys {
            forward.put(k, k).unwrap();
        }
        let mut backward = new_trie();
        for k in keys.iter().rev() {
            backward.put(k, k).unwrap();
        }
        assert_eq!(forward.root_hash(), backward.root_hash());
    }

    #[test]
    fn delete_restores_the_previous_root() {
        let mut trie = new_trie();
        trie.put(b"alpha", b"1").unwrap();
        trie.put(b"alps", b"2").unwrap();
        let two_keys = trie.root_hash();

        trie.put(b"alpine", b"3").unwrap();
        trie.put(b"al", b"4").unwrap();
        trie.del(b"alpine").unwrap();
        trie.del(b"al").unwrap();
        assert_eq!(trie.root_hash(), two_keys);

        trie.del(b"alpha").unwrap();
        trie.del(b"alps").unwrap();
        assert!(trie.is_empty());
    }

    #[test]
    fn delete_missing_key_is_not_found() {
        let mut trie = new_trie();
        assert!(matches!(trie.del(b"x"), Err(TrieError::NotFound)));
        trie.put(b"abc", b"1").unwrap();
        assert!(matches!(trie.del(b"abd"), Err(TrieError::NotFound)));
        assert!(matches!(trie.del(b"ab"), Err(TrieError::NotFound)));
        assert_eq!(trie.get(b"abc").unwrap().unwrap(), b"1");
    }

    #[test]
    fn reopen_at_historic_root() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let mut trie = Trie::new(storage.clone());
        trie.put(b"k", b"v1").unwrap();
        let old_root = trie.root_hash();
        trie.put(b"k", b"v2").unwrap();

        let old = Trie::open(storage.clone(), old_root).unwrap();
        assert_eq!(old.get(b"k").unwrap().unwrap(), b"v1");
        assert!(matches!(
            Trie::open(storage, blake3_hash(b"nope")),
            Err(TrieError::MissingNode(_))
        ));
    }

    #[test]
    fn batch_commit_and_rollback() {
        let mut trie = new_trie();
        trie.put(b"a", b"1").unwrap();
        let root = trie.root_hash();

        trie.begin_batch().unwrap();
        assert!(matches!(trie.begin_batch(), Err(TrieError::AlreadyInBatch)));
        trie.put(b"b", b"2").unwrap();
        trie.rollback().unwrap();
        assert_eq!(trie.root_hash(), root);
        assert_eq!(trie.get(b"b").unwrap(), None);

        trie.begin_batch().unwrap();
        trie.put(b"b", b"2").unwrap();
        trie.commit().unwrap();
        assert_eq!(trie.get(b"b").unwrap().unwrap(), b"2");
        assert!(matches!(trie.commit(), Err(TrieError::NotInBatch)));
    }

    #[test]
    fn iterator_walks_in_hashed_order_and_filters_by_prefix() {
        let mut trie = new_trie();
        let keys = ["b1", "a2", "a1", "c", "a", "ab"];
        for k in keys {
            trie.put(k.as_bytes(), k.as_bytes()).unwrap();
        }
        let all: Vec<String> = trie
            .iter()
            .map(|e| String::from_utf8(e.unwrap().0).unwrap())
            .collect();
        let mut expected: Vec<&str> = keys.to_vec();
        expected.sort_by_key(|k| *blake3_hash(k.as_bytes()).as_bytes());
        assert_eq!(all, expected);

        let mut under_a: Vec<String> = trie
            .iter_prefix(b"a")
            .map(|e| String::from_utf8(e.unwrap().0).unwrap())
            .collect();
        under_a.sort();
        assert_eq!(under_a, vec!["a", "a1", "a2", "ab"]);

        assert_eq!(trie.iter_prefix(b"zz").count(), 0);
    }

    #[test]
    fn paths_are_routed_on_hashed_keys() {
        let mut trie = new_trie();
        trie.put(b"only", b"v").unwrap();
        match trie.load(&trie.root_hash()).unwrap() {
            Node::Leaf { path, key, value } => {
                assert_eq!(path, key_path(b"only"));
                assert_eq!(path.len(), 64);
                assert_eq!(key, b"only");
                assert_eq!(value, b"v");
            }
            other => panic!("expected a leaf, got {other:?}"),
        }

        // Keys sharing a long raw prefix still split near the root.
        trie.put(b"only-and-more", b"w").unwrap();
        let c = common_prefix(&key_path(b"only"), &key_path(b"only-and-more"));
        assert!(c < 8);
        assert_eq!(trie.get(b"only-and-more").unwrap().unwrap(), b"w");
    }

    #[test]
    fn clone_is_an_independent_handle() {
        let mut trie = new_trie();
        trie.put(b"x", b"1").unwrap();
        let snapshot = trie.clone();
        trie.put(b"y", b"2").unwrap();
        assert_eq!(snapshot.get(b"y").unwrap(), None);
        assert_eq!(trie.get(b"y").unwrap().unwrap(), b"2");
    }
}
