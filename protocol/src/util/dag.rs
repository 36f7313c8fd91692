//! Directed acyclic graph of execution dependencies.
//!
//! Nodes live in a `Vec` and refer to each other by index, so there are no
//! ownership cycles and the wire form is just the node list. An edge
//! `A -> B` means "A must finish before B starts". Index order is insertion
//! order and doubles as the tie-break among nodes that become ready at the
//! same time.
//!
//! A block carries the DAG its proposer observed while executing
//! transactions in parallel; validators replay it with the dispatcher in
//! [`super::dispatcher`].

use std::collections::HashMap;
use std::hash::Hash as StdHash;

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DagError {
    #[error("dag key not found")]
    NotFound,
    #[error("dag key already exists")]
    KeyExists,
    #[error("dag edge already exists")]
    Exists,
    #[error("malformed dag: {0}")]
    Malformed(String),
}

pub type DagResult<T> = Result<T, DagError>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DagNode<K> {
    pub key: K,
    pub index: usize,
    pub children: Vec<usize>,
    pub parent_count: usize,
}

/// Serialised form: just the nodes. The key index is rebuilt (and the whole
/// structure checked) on the way in.
#[derive(Serialize, Deserialize)]
struct DagRepr<K> {
    nodes: Vec<DagNode<K>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(
    try_from = "DagRepr<K>",
    into = "DagRepr<K>",
    bound(
        serialize = "K: Serialize + Clone + Eq + StdHash",
        deserialize = "K: Deserialize<'de> + Clone + Eq + StdHash"
    )
)]
pub struct Dag<K: Clone + Eq + StdHash> {
    nodes: Vec<DagNode<K>>,
    index: HashMap<K, usize>,
}

impl<K: Clone + Eq + StdHash> Default for Dag<K> {
    fn default() -> Self {
        Self {
            nodes: Vec::new(),
            index: HashMap::new(),
        }
    }
}

impl<K: Clone + Eq + StdHash> PartialEq for Dag<K> {
    fn eq(&self, other: &Self) -> bool {
        self.nodes == other.nodes
    }
}

impl<K: Clone + Eq + StdHash> Eq for Dag<K> {}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Colour {
    White,
    Grey,
    Black,
}

impl<K: Clone + Eq + StdHash> Dag<K> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Append a node and return its index.
    pub fn add_node(&mut self, key: K) -> DagResult<usize> {
        if self.index.contains_key(&key) {
            return Err(DagError::KeyExists);
        }
        let index = self.nodes.len();
        self.index.insert(key.clone(), index);
        self.nodes.push(DagNode {
            key,
            index,
            children: Vec::new(),
            parent_count: 0,
        });
        Ok(index)
    }

    pub fn add_edge(&mut self, from: &K, to: &K) -> DagResult<()> {
        let from = *self.index.get(from).ok_or(DagError::NotFound)?;
        let to = *self.index.get(to).ok_or(DagError::NotFound)?;
        if self.nodes[from].children.contains(&to) {
            return Err(DagError::Exists);
        }
        self.nodes[from].children.push(to);
        self.nodes[to].parent_count += 1;
        Ok(())
    }

    pub fn contains(&self, key: &K) -> bool {
        self.index.contains_key(key)
    }

    pub fn index_of(&self, key: &K) -> Option<usize> {
        self.index.get(key).copied()
    }

    pub fn get_node(&self, key: &K) -> Option<&DagNode<K>> {
        self.index.get(key).map(|i| &self.nodes[*i])
    }

    pub fn node(&self, index: usize) -> Option<&DagNode<K>> {
        self.nodes.get(index)
    }

    pub fn nodes(&self) -> &[DagNode<K>] {
        &self.nodes
    }

    /// Nodes with no parents, in index order.
    pub fn roots(&self) -> impl Iterator<Item = &DagNode<K>> {
        self.nodes.iter().filter(|n| n.parent_count == 0)
    }

    /// Parent lists, the reverse of each node's `children`.
    pub fn parents(&self) -> Vec<Vec<usize>> {
        let mut parents = vec![Vec::new(); self.nodes.len()];
        for node in &self.nodes {
            for &child in &node.children {
                parents[child].push(node.index);
            }
        }
        parents
    }

    /// Every node that must finish before `index` may start.
    pub fn ancestors(&self, index: usize) -> Vec<usize> {
        let parents = self.parents();
        let mut seen = vec![false; self.nodes.len()];
        let mut stack: Vec<usize> = parents.get(index).cloned().unwrap_or_default();
        let mut out = Vec::new();
        while let Some(i) = stack.pop() {
            if std::mem::replace(&mut seen[i], true) {
                continue;
            }
            out.push(i);
            stack.extend(parents[i].iter().copied());
        }
        out.sort_unstable();
        out
    }

    /// Colour DFS from every root. A grey-to-grey edge is a cycle, and so
    /// is any node still white afterwards: it is only reachable through a
    /// cycle, because it has a parent but no path from a root.
    pub fn is_cyclic(&self) -> bool {
        let mut colour = vec![Colour::White; self.nodes.len()];

        for root in self.roots() {
            // (node, next child position)
            let mut stack = vec![(root.index, 0usize)];
            colour[root.index] = Colour::Grey;
            while let Some((node, pos)) = stack.pop() {
                let children = &self.nodes[node].children;
                if pos < children.len() {
                    stack.push((node, pos + 1));
                    let child = children[pos];
                    match colour[child] {
                        Colour::Grey => return true,
                        Colour::White => {
                            colour[child] = Colour::Grey;
                            stack.push((child, 0));
                        }
                        Colour::Black => {}
                    }
                } else {
                    colour[node] = Colour::Black;
                }
            }
        }

        colour.iter().any(|c| *c == Colour::White)
    }
}

impl<K: Clone + Eq + StdHash> From<Dag<K>> for DagRepr<K> {
    fn from(dag: Dag<K>) -> Self {
        DagRepr { nodes: dag.nodes }
    }
}

impl<K: Clone + Eq + StdHash> TryFrom<DagRepr<K>> for Dag<K> {
    type Error = DagError;

    fn try_from(repr: DagRepr<K>) -> Result<Self, Self::Error> {
        let len = repr.nodes.len();
        let mut index = HashMap::with_capacity(len);
        let mut parent_counts = vec![0usize; len];
        for (pos, node) in repr.nodes.iter().enumerate() {
            if node.index != pos {
                return Err(DagError::Malformed(format!(
                    "node at {pos} claims index {}",
                    node.index
                )));
            }
            if index.insert(node.key.clone(), pos).is_some() {
                return Err(DagError::KeyExists);
            }
            for &child in &node.children {
                if child >= len {
                    return Err(DagError::Malformed(format!("child {child} out of range")));
                }
                parent_counts[child] += 1;
            }
        }
        for (node, expected) in repr.nodes.iter().zip(parent_counts) {
            if node.parent_count != expected {
                return Err(DagError::Malformed(format!(
                    "node {} parent count {} != {}",
                    node.index, node.parent_count, expected
                )));
            }
        }
        Ok(Dag {
            nodes: repr.nodes,
            index,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain_dag() -> Dag<u32> {
        let mut dag = Dag::new();
        for k in 1..=7 {
            dag.add_node(k).unwrap();
        }
        for (a, b) in [(1, 2), (1, 3), (2, 4), (3, 5), (5, 6), (6, 7)] {
            dag.add_edge(&a, &b).unwrap();
        }
        dag
    }

    #[test]
    fn builder_errors() {
        let mut dag = Dag::new();
        dag.add_node("a").unwrap();
        dag.add_node("b").unwrap();
        assert_eq!(dag.add_node("a"), Err(DagError::KeyExists));
        assert_eq!(dag.add_edge(&"a", &"zz"), Err(DagError::NotFound));
        dag.add_edge(&"a", &"b").unwrap();
        assert_eq!(dag.add_edge(&"a", &"b"), Err(DagError::Exists));
        assert_eq!(dag.get_node(&"b").unwrap().parent_count, 1);
    }

    #[test]
    fn indices_follow_insertion_order() {
        let dag = chain_dag();
        for (i, node) in dag.nodes().iter().enumerate() {
            assert_eq!(node.index, i);
            assert_eq!(node.key, i as u32 + 1);
        }
        let roots: Vec<u32> = dag.roots().map(|n| n.key).collect();
        assert_eq!(roots, vec![1]);
    }

    #[test]
    fn acyclic_graph_is_not_cyclic() {
        assert!(!chain_dag().is_cyclic());
        assert!(!Dag::<u8>::new().is_cyclic());
    }

    #[test]
    fn back_edge_is_a_cycle() {
        let mut dag = chain_dag();
        dag.add_edge(&7, &3).unwrap();
        assert!(dag.is_cyclic());
    }

    #[test]
    fn unreachable_component_is_a_cycle() {
        let mut dag = chain_dag();
        dag.add_node(8).unwrap();
        dag.add_node(9).unwrap();
        dag.add_edge(&8, &9).unwrap();
        dag.add_edge(&9, &8).unwrap();
        // 8 and 9 have parents, so no root reaches them.
        assert!(dag.is_cyclic());
    }

    #[test]
    fn ancestors_are_transitive() {
        let dag = chain_dag();
        let idx7 = dag.index_of(&7).unwrap();
        let keys: Vec<u32> = dag
            .ancestors(idx7)
            .into_iter()
            .map(|i| dag.node(i).unwrap().key)
            .collect();
        assert_eq!(keys, vec![1, 3, 5, 6]);
        assert!(dag.ancestors(0).is_empty());
    }

    #[test]
    fn bincode_roundtrip_rebuilds_the_index() {
        let dag = chain_dag();
        let bytes = bincode::serialize(&dag).unwrap();
        let back: Dag<u32> = bincode::deserialize(&bytes).unwrap();
        assert_eq!(back, dag);
        assert_eq!(back.index_of(&5), Some(4));
    }

    #[test]
    fn malformed_wire_form_is_rejected() {
        let repr = DagRepr {
            nodes: vec![DagNode {
                key: 1u32,
                index: 0,
                children: vec![3],
                parent_count: 0,
            }],
        };
        let bytes = bincode::serialize(&repr).unwrap();
        assert!(bincode::deserialize::<Dag<u32>>(&bytes).is_err());
    }
}
