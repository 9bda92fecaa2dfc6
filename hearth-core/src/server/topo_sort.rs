//! # Topological Sort
//!
//! Plugins declare which other plugins must run before them; this holds
//! that dependency graph and, assuming it is acyclic, produces the list
//! of plugins in execution order.
use std::{
    collections::HashMap,
    fmt::Debug,
    hash::Hash,
};

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SortError {
    /// the dependency graph has a cycle (or names a missing node)
    #[error("dependency graph is cyclic or references an unknown node")]
    Cyclic,
}

#[derive(Debug)]
struct Node<V> {
    value: V,
    /// nodes that must be evaluated before this one
    deps: Vec<usize>,
}

/// a dependency graph over keyed values
#[derive(Debug)]
pub struct DependencyTree<K, V> {
    nodes: Vec<Node<V>>,
    index: HashMap<K, usize>,
    /// dependencies recorded before their target was added
    pending: Vec<(usize, K)>,
}

impl<K, V> Default for DependencyTree<K, V> {
    fn default() -> Self {
        DependencyTree {
            nodes: Vec::new(),
            index: HashMap::new(),
            pending: Vec::new(),
        }
    }
}

impl<K, V> DependencyTree<K, V>
where
    K: Eq + Hash + Clone + Debug,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// add a node and the keys it depends on. Dependencies may be added
    /// before or after their targets.
    pub fn add(&mut self, key: K, value: V, deps: &[K]) {
        let idx = self.nodes.len();
        self.nodes.push(Node {
            value,
            deps: Vec::new(),
        });
        self.index.insert(key, idx);
        for dep in deps {
            match self.index.get(dep) {
                Some(&dep_idx) => self.nodes[idx].deps.push(dep_idx),
                None => self.pending.push((idx, dep.clone())),
            }
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// consume the tree and return values in dependency order. Ties keep
    /// insertion order, so an unconstrained graph runs in registration
    /// order.
    pub fn topological_sort(mut self) -> Result<Vec<V>, SortError> {
        for (idx, key) in std::mem::take(&mut self.pending) {
            let dep_idx = *self.index.get(&key).ok_or(SortError::Cyclic)?;
            self.nodes[idx].deps.push(dep_idx);
        }

        let n = self.nodes.len();
        let mut visited = vec![0u8; n]; // 0 new, 1 in progress, 2 done
        let mut order = Vec::with_capacity(n);

        fn visit<V>(
            idx: usize,
            nodes: &[Node<V>],
            visited: &mut [u8],
            order: &mut Vec<usize>,
        ) -> Result<(), SortError> {
            match visited[idx] {
                2 => return Ok(()),
                1 => return Err(SortError::Cyclic),
                _ => {}
            }
            visited[idx] = 1;
            for &dep in &nodes[idx].deps {
                visit(dep, nodes, visited, order)?;
            }
            visited[idx] = 2;
            order.push(idx);
            Ok(())
        }

        for idx in 0..n {
            visit(idx, &self.nodes, &mut visited, &mut order)?;
        }

        // pull values out in sorted order
        let mut slots: Vec<Option<V>> = self.nodes.into_iter().map(|node| Some(node.value)).collect();
        Ok(order
            .into_iter()
            .map(|idx| slots[idx].take().expect("each node visited once"))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registration_order_without_deps() {
        let mut tree = DependencyTree::new();
        tree.add("a", 1, &[]);
        tree.add("b", 2, &[]);
        tree.add("c", 3, &[]);
        assert_eq!(tree.topological_sort().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn dependencies_run_first() {
        let mut tree = DependencyTree::new();
        // d depends on b and c, which depend on a; e registered before
        // its dependency exists
        tree.add("e", 5, &["c"]);
        tree.add("a", 1, &[]);
        tree.add("b", 2, &["a"]);
        tree.add("c", 3, &["a"]);
        tree.add("d", 4, &["b", "c", "e"]);
        let order = tree.topological_sort().unwrap();

        let pos = |v: i32| order.iter().position(|&x| x == v).unwrap();
        assert!(pos(1) < pos(2));
        assert!(pos(1) < pos(3));
        assert!(pos(3) < pos(5));
        assert!(pos(2) < pos(4));
        assert!(pos(5) < pos(4));
    }

    #[test]
    fn cycles_are_detected() {
        let mut tree = DependencyTree::new();
        tree.add("a", 1, &["b"]);
        tree.add("b", 2, &["a"]);
        assert_eq!(tree.topological_sort().unwrap_err(), SortError::Cyclic);
    }
}
