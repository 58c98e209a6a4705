//! The in-memory ordered set of keys.
//!
//! [`KeyTree`] is an AVL tree whose nodes live in one vector and whose key
//! bytes live in another, so that inserting a key costs at most two
//! amortized allocations and clearing the tree keeps its capacity for the
//! next run.

use std::{cmp::Ordering, mem::size_of};

use crate::error::UniqueError;

const NIL: u32 = u32::MAX;

#[derive(Clone, Debug)]
struct Node {
    key_offset: usize,
    key_len: u32,
    left: u32,
    right: u32,
    height: u8,
    count: u64,
}

/// Per-key overhead of the tree, in bytes, on top of the key itself.
pub const TREE_ELEMENT_SIZE: usize = size_of::<Node>();

/// Outcome of [`KeyTree::insert`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum Inserted {
    /// The key was not in the tree and has been added with count 1.
    New,
    /// The key was already in the tree and its count was incremented.
    Duplicate,
    /// The tree only accepts duplicates and the key was not in it.
    Ignored,
}

/// A balanced binary search tree of byte-string keys, each with an occurrence
/// count.
///
/// The tree does not know how keys are ordered: every operation that needs to
/// compare keys takes the comparator as an argument, and callers must always
/// pass the same one.
#[derive(Debug)]
pub(crate) struct KeyTree {
    nodes: Vec<Node>,
    keys: Vec<u8>,
    root: u32,
    only_dups: bool,
    path: Vec<u32>,
}

impl KeyTree {
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            keys: Vec::new(),
            root: NIL,
            only_dups: false,
            path: Vec::new(),
        }
    }

    /// Returns the number of distinct keys in the tree.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Removes every key.  Allocated capacity is kept.
    pub fn clear(&mut self) {
        self.nodes.clear();
        self.keys.clear();
        self.root = NIL;
    }

    /// In duplicates-only mode, keys already in the tree have their count
    /// incremented and other keys are ignored.
    pub fn set_only_dups(&mut self, only_dups: bool) {
        self.only_dups = only_dups;
    }

    pub fn only_dups(&self) -> bool {
        self.only_dups
    }

    fn key(&self, node: u32) -> &[u8] {
        let node = &self.nodes[node as usize];
        &self.keys[node.key_offset..node.key_offset + node.key_len as usize]
    }

    fn height(&self, node: u32) -> u8 {
        if node == NIL {
            0
        } else {
            self.nodes[node as usize].height
        }
    }

    fn update_height(&mut self, node: u32) {
        let n = &self.nodes[node as usize];
        let height = self.height(n.left).max(self.height(n.right)) + 1;
        self.nodes[node as usize].height = height;
    }

    fn balance_factor(&self, node: u32) -> i16 {
        let n = &self.nodes[node as usize];
        self.height(n.left) as i16 - self.height(n.right) as i16
    }

    fn rotate_right(&mut self, node: u32) -> u32 {
        let pivot = self.nodes[node as usize].left;
        self.nodes[node as usize].left = self.nodes[pivot as usize].right;
        self.nodes[pivot as usize].right = node;
        self.update_height(node);
        self.update_height(pivot);
        pivot
    }

    fn rotate_left(&mut self, node: u32) -> u32 {
        let pivot = self.nodes[node as usize].right;
        self.nodes[node as usize].right = self.nodes[pivot as usize].left;
        self.nodes[pivot as usize].left = node;
        self.update_height(node);
        self.update_height(pivot);
        pivot
    }

    /// Restores the AVL invariant at `node`, whose subtrees are balanced, and
    /// returns the new root of the subtree.
    fn rebalance(&mut self, node: u32) -> u32 {
        self.update_height(node);
        let balance = self.balance_factor(node);
        if balance > 1 {
            let left = self.nodes[node as usize].left;
            if self.balance_factor(left) < 0 {
                self.nodes[node as usize].left = self.rotate_left(left);
            }
            self.rotate_right(node)
        } else if balance < -1 {
            let right = self.nodes[node as usize].right;
            if self.balance_factor(right) > 0 {
                self.nodes[node as usize].right = self.rotate_right(right);
            }
            self.rotate_left(node)
        } else {
            node
        }
    }

    /// Looks up `key`, recording the path from the root in `self.path`.
    /// Returns the matching node, or `NIL` together with the ordering of `key`
    /// relative to the last node on the path.
    fn search<C>(&mut self, key: &[u8], compare: &C) -> (u32, Ordering)
    where
        C: Fn(&[u8], &[u8]) -> Ordering,
    {
        self.path.clear();
        let mut node = self.root;
        let mut last = Ordering::Equal;
        while node != NIL {
            match compare(key, self.key(node)) {
                Ordering::Equal => return (node, Ordering::Equal),
                ordering => {
                    self.path.push(node);
                    last = ordering;
                    let n = &self.nodes[node as usize];
                    node = if ordering == Ordering::Less {
                        n.left
                    } else {
                        n.right
                    };
                }
            }
        }
        (NIL, last)
    }

    /// Inserts `key`, or increments its count if an equal key is present.
    ///
    /// Fails without modifying the tree if memory for the new node or its key
    /// cannot be allocated.
    pub fn insert<C>(&mut self, key: &[u8], compare: C) -> Result<Inserted, UniqueError>
    where
        C: Fn(&[u8], &[u8]) -> Ordering,
    {
        let (found, ordering) = self.search(key, &compare);
        if found != NIL {
            self.nodes[found as usize].count += 1;
            return Ok(Inserted::Duplicate);
        }
        if self.only_dups {
            return Ok(Inserted::Ignored);
        }

        self.nodes
            .try_reserve(1)
            .map_err(UniqueError::out_of_memory(TREE_ELEMENT_SIZE))?;
        self.keys
            .try_reserve(key.len())
            .map_err(UniqueError::out_of_memory(key.len()))?;

        let new = self.nodes.len() as u32;
        self.nodes.push(Node {
            key_offset: self.keys.len(),
            key_len: key.len() as u32,
            left: NIL,
            right: NIL,
            height: 1,
            count: 1,
        });
        self.keys.extend_from_slice(key);

        // Link the new leaf and rebalance every ancestor, bottom up.
        let path = std::mem::take(&mut self.path);
        let mut child = new;
        let mut child_ordering = ordering;
        for (depth, &parent) in path.iter().enumerate().rev() {
            if child_ordering == Ordering::Less {
                self.nodes[parent as usize].left = child;
            } else {
                self.nodes[parent as usize].right = child;
            }
            child = self.rebalance(parent);
            if depth > 0 {
                let grandparent = &self.nodes[path[depth - 1] as usize];
                child_ordering = if grandparent.left == parent {
                    Ordering::Less
                } else {
                    Ordering::Greater
                };
            }
        }
        self.root = child;
        self.path = path;

        Ok(Inserted::New)
    }

    /// Returns the occurrence count of `key`, if it is in the tree.
    #[cfg(test)]
    pub fn count<C>(&mut self, key: &[u8], compare: C) -> Option<u64>
    where
        C: Fn(&[u8], &[u8]) -> Ordering,
    {
        match self.search(key, &compare) {
            (NIL, _) => None,
            (node, _) => Some(self.nodes[node as usize].count),
        }
    }

    /// Iterates over the keys in ascending order, with their counts.
    pub fn iter(&self) -> Iter<'_> {
        let mut iter = Iter {
            tree: self,
            stack: Vec::with_capacity(self.height(self.root) as usize),
        };
        iter.push_left(self.root);
        iter
    }
}

/// In-order iterator over a [`KeyTree`].
pub(crate) struct Iter<'a> {
    tree: &'a KeyTree,
    stack: Vec<u32>,
}

impl Iter<'_> {
    fn push_left(&mut self, mut node: u32) {
        while node != NIL {
            self.stack.push(node);
            node = self.tree.nodes[node as usize].left;
        }
    }
}

impl<'a> Iterator for Iter<'a> {
    type Item = (&'a [u8], u64);

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.stack.pop()?;
        let tree = self.tree;
        self.push_left(tree.nodes[node as usize].right);
        Some((tree.key(node), tree.nodes[node as usize].count))
    }
}
