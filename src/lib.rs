//! # cow-avl
//!
//! An in-memory ordered index built on a height-balanced (AVL) search tree
//! that supports *speculative, copy-on-write inserts*: a caller can probe
//! what a future insert would do (observing the ordered sequence of ancestor
//! keys the search path touches) without mutating the committed tree, then
//! either commit the speculative branch or discard it.
//!
//! ## Example
//!
//! ```rust
//! use cow_avl::AvlTree;
//!
//! let mut tree: AvlTree<i64> = AvlTree::new();
//! for key in [4, 3, 8, 2, 7, 10] {
//!     tree.insert(key);
//! }
//!
//! // Probe where 5 would land; the committed tree is untouched.
//! assert_eq!(tree.detach_insert(5), vec![4, 8, 7]);
//! assert!(!tree.contains(&5));
//!
//! // Discard the probe...
//! tree.reset();
//! assert!(!tree.contains(&5));
//!
//! // ...or commit it.
//! tree.detach_insert(5);
//! tree.attach();
//! assert!(tree.contains(&5));
//! ```

use std::fmt::{self, Write};
use std::mem;

use tracing::{debug, trace};

// =============================================================================
// Comparator
// =============================================================================

/// Strict-weak ordering used to arrange keys.
///
/// Two keys are considered equal when neither orders before the other
/// (`!less(a, b) && !less(b, a)`).
pub trait Comparator<K> {
    /// Returns `true` when `a` orders strictly before `b`.
    fn less(&self, a: &K, b: &K) -> bool;
}

/// Natural `Ord`-based ordering; the default comparator.
#[derive(Clone, Copy, Debug, Default)]
pub struct NaturalOrder;

impl<K: Ord> Comparator<K> for NaturalOrder {
    #[inline]
    fn less(&self, a: &K, b: &K) -> bool {
        a < b
    }
}

// =============================================================================
// Node references
// =============================================================================

/// Tagged handle to a node in one of the two arenas.
///
/// The committed tree is closed over `Main` handles. `Branch` handles appear
/// only inside a pending speculative branch, whose copies may in turn point
/// at shared `Main` subtrees; the reverse direction never occurs.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum NodeRef {
    /// Index into the committed arena.
    Main(u32),
    /// Index into the branch arena.
    Branch(u32),
}

/// Which overlay a mutating walk operates on: the committed tree rooted at
/// the tree's own root, or the pending branch rooted at its overlay root.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Scope {
    Committed,
    Branch,
}

// =============================================================================
// Node and arena storage
// =============================================================================

#[derive(Clone, Debug)]
struct Node<K> {
    key: K,
    /// 1 for a leaf; 1 + max(child heights) otherwise.
    height: u32,
    /// Node count of the left subtree, not counting self.
    size_left: u32,
    /// Node count of the right subtree, not counting self.
    size_right: u32,
    /// Back-reference for upward walks only; never ownership.
    parent: Option<NodeRef>,
    left: Option<NodeRef>,
    right: Option<NodeRef>,
}

impl<K> Node<K> {
    fn new(key: K) -> Self {
        Self {
            key,
            height: 1,
            size_left: 0,
            size_right: 0,
            parent: None,
            left: None,
            right: None,
        }
    }
}

/// Append-only node storage. Handles stay stable as the arena grows;
/// individual nodes are never deallocated, only the whole arena is cleared
/// (branch arena) or dropped (committed arena).
#[derive(Clone, Debug)]
struct Arena<K> {
    nodes: Vec<Node<K>>,
}

impl<K> Arena<K> {
    fn new() -> Self {
        Self { nodes: Vec::new() }
    }

    fn alloc(&mut self, node: Node<K>) -> u32 {
        debug_assert!(self.nodes.len() < u32::MAX as usize);
        let index = self.nodes.len() as u32;
        self.nodes.push(node);
        index
    }

    #[inline]
    fn get(&self, index: u32) -> &Node<K> {
        &self.nodes[index as usize]
    }

    #[inline]
    fn get_mut(&mut self, index: u32) -> &mut Node<K> {
        &mut self.nodes[index as usize]
    }

    fn clear(&mut self) {
        self.nodes.clear();
    }

    fn capacity(&self) -> usize {
        self.nodes.capacity()
    }
}

// =============================================================================
// Branch state
// =============================================================================

/// Resolution state of the speculative branch. Every mutating entry point
/// matches on this first: a pending branch is attached before any other
/// mutation proceeds.
#[derive(Clone, Debug)]
enum BranchState<K> {
    Clean,
    Pending {
        /// The probed key, kept for the eventual attach.
        key: K,
        /// Root of the copy-on-write overlay, in the branch arena.
        new_root: u32,
    },
}

// =============================================================================
// AvlTree
// =============================================================================

/// A height-balanced ordered index with speculative copy-on-write inserts.
///
/// Features:
/// - Arena-based node storage with stable `u32` handles
/// - Classical AVL insert with iterative descent and ascending rebalance
/// - `detach_insert`: probe an insert by path-copying into a second arena,
///   sharing all untouched subtrees with the committed tree
/// - `attach` / `reset`: commit or discard the single pending branch
pub struct AvlTree<K, C = NaturalOrder> {
    /// Committed nodes.
    nodes: Arena<K>,
    /// Copy-on-write duplicates of the nodes along one probed search path.
    branch: Arena<K>,
    /// Root of the committed tree, always in the committed arena.
    root: Option<u32>,
    state: BranchState<K>,
    cmp: C,
}

impl<K: Clone, C: Clone> Clone for AvlTree<K, C> {
    fn clone(&self) -> Self {
        Self {
            nodes: self.nodes.clone(),
            branch: self.branch.clone(),
            root: self.root,
            state: self.state.clone(),
            cmp: self.cmp.clone(),
        }
    }
}

impl<K, C> fmt::Debug for AvlTree<K, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AvlTree")
            .field("len", &self.len())
            .field("pending", &self.is_pending())
            .finish()
    }
}

impl<K> AvlTree<K> {
    /// An empty tree ordered by `K`'s natural ordering.
    pub fn new() -> Self {
        Self::with_comparator(NaturalOrder)
    }
}

impl<K, C: Comparator<K> + Default> Default for AvlTree<K, C> {
    fn default() -> Self {
        Self::with_comparator(C::default())
    }
}

// =============================================================================
// Structural plumbing (comparator not involved)
// =============================================================================

impl<K, C> AvlTree<K, C> {
    /// An empty tree using `cmp` to order keys.
    pub fn with_comparator(cmp: C) -> Self {
        Self {
            nodes: Arena::new(),
            branch: Arena::new(),
            root: None,
            state: BranchState::Clean,
            cmp,
        }
    }

    /// Number of keys in the committed tree. A pending speculative key does
    /// not count until it is attached.
    pub fn len(&self) -> usize {
        self.root.map_or(0, |root| {
            let node = self.nodes.get(root);
            (node.size_left + node.size_right + 1) as usize
        })
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    /// `true` while a speculative branch awaits `attach` or `reset`.
    pub fn is_pending(&self) -> bool {
        matches!(self.state, BranchState::Pending { .. })
    }

    /// Bytes held by the two node arenas.
    pub fn memory_usage(&self) -> usize {
        (self.nodes.capacity() + self.branch.capacity()) * mem::size_of::<Node<K>>()
    }

    /// In-order iterator over the committed keys.
    pub fn iter(&self) -> Iter<'_, K, C> {
        let mut iter = Iter {
            tree: self,
            stack: Vec::new(),
        };
        iter.push_left_spine(self.root.map(NodeRef::Main));
        iter
    }

    #[inline]
    fn node(&self, at: NodeRef) -> &Node<K> {
        match at {
            NodeRef::Main(index) => self.nodes.get(index),
            NodeRef::Branch(index) => self.branch.get(index),
        }
    }

    #[inline]
    fn node_mut(&mut self, at: NodeRef) -> &mut Node<K> {
        match at {
            NodeRef::Main(index) => self.nodes.get_mut(index),
            NodeRef::Branch(index) => self.branch.get_mut(index),
        }
    }

    #[inline]
    fn height_of(&self, at: Option<NodeRef>) -> u32 {
        at.map_or(0, |at| self.node(at).height)
    }

    #[inline]
    fn size_of(&self, at: Option<NodeRef>) -> u32 {
        at.map_or(0, |at| {
            let node = self.node(at);
            node.size_left + node.size_right + 1
        })
    }

    fn scope_root(&self, scope: Scope) -> Option<NodeRef> {
        match scope {
            Scope::Committed => self.root.map(NodeRef::Main),
            Scope::Branch => match &self.state {
                BranchState::Pending { new_root, .. } => Some(NodeRef::Branch(*new_root)),
                BranchState::Clean => None,
            },
        }
    }

    fn set_scope_root(&mut self, scope: Scope, at: NodeRef) {
        match (scope, at) {
            (Scope::Committed, NodeRef::Main(index)) => self.root = Some(index),
            (Scope::Branch, NodeRef::Branch(index)) => {
                if let BranchState::Pending { new_root, .. } = &mut self.state {
                    *new_root = index;
                }
            }
            _ => debug_assert!(false, "overlay root replacement crossed arenas"),
        }
    }

    /// Re-link a child's parent back-reference after a rotation.
    ///
    /// A committed node hanging off a branch copy is shared, read-only data:
    /// its parent link keeps describing the committed tree and is left
    /// untouched.
    fn relink_parent(&mut self, child: NodeRef, parent: NodeRef) {
        if matches!(child, NodeRef::Main(_)) && matches!(parent, NodeRef::Branch(_)) {
            return;
        }
        self.node_mut(child).parent = Some(parent);
    }

    /// Recompute `height` from `from` up to the overlay root.
    fn update_heights(&mut self, from: NodeRef) {
        let mut cur = Some(from);
        while let Some(at) = cur {
            let (left, right) = {
                let node = self.node(at);
                (node.left, node.right)
            };
            let height = 1 + self.height_of(left).max(self.height_of(right));
            let node = self.node_mut(at);
            node.height = height;
            cur = node.parent;
        }
    }

    /// Recompute `size_left`/`size_right` from `from` up to the overlay root.
    fn update_sizes(&mut self, from: NodeRef) {
        let mut cur = Some(from);
        while let Some(at) = cur {
            let (left, right) = {
                let node = self.node(at);
                (node.left, node.right)
            };
            let size_left = self.size_of(left);
            let size_right = self.size_of(right);
            let node = self.node_mut(at);
            node.size_left = size_left;
            node.size_right = size_right;
            cur = node.parent;
        }
    }

    fn rotate_right(&mut self, at: NodeRef, scope: Scope) {
        let Some(pivot) = self.node(at).left else {
            return;
        };
        let moved = self.node(pivot).right;
        let parent = self.node(at).parent;

        self.node_mut(at).left = moved;
        self.node_mut(pivot).right = Some(at);

        if self.scope_root(scope) == Some(at) {
            self.set_scope_root(scope, pivot);
        } else if let Some(parent) = parent {
            let node = self.node_mut(parent);
            if node.left == Some(at) {
                node.left = Some(pivot);
            } else {
                node.right = Some(pivot);
            }
        }

        self.node_mut(pivot).parent = parent;
        if let Some(moved) = moved {
            self.relink_parent(moved, at);
        }
        self.node_mut(at).parent = Some(pivot);

        self.update_heights(at);
        self.update_sizes(at);
    }

    fn rotate_left(&mut self, at: NodeRef, scope: Scope) {
        let Some(pivot) = self.node(at).right else {
            return;
        };
        let moved = self.node(pivot).left;
        let parent = self.node(at).parent;

        self.node_mut(at).right = moved;
        self.node_mut(pivot).left = Some(at);

        if self.scope_root(scope) == Some(at) {
            self.set_scope_root(scope, pivot);
        } else if let Some(parent) = parent {
            let node = self.node_mut(parent);
            if node.left == Some(at) {
                node.left = Some(pivot);
            } else {
                node.right = Some(pivot);
            }
        }

        self.node_mut(pivot).parent = parent;
        if let Some(moved) = moved {
            self.relink_parent(moved, at);
        }
        self.node_mut(at).parent = Some(pivot);

        self.update_heights(at);
        self.update_sizes(at);
    }

    /// Restore the AVL invariant at one node, if violated. Double-rotation
    /// cases straighten the heavy child first.
    fn rebalance_at(&mut self, at: NodeRef, scope: Scope) {
        let (left, right) = {
            let node = self.node(at);
            (node.left, node.right)
        };
        let balance = self.height_of(left) as i64 - self.height_of(right) as i64;

        if balance > 1 {
            let Some(heavy) = left else {
                return;
            };
            let (inner_left, inner_right) = {
                let node = self.node(heavy);
                (node.left, node.right)
            };
            if self.height_of(inner_left) < self.height_of(inner_right) {
                self.rotate_left(heavy, scope);
            }
            self.rotate_right(at, scope);
        } else if balance < -1 {
            let Some(heavy) = right else {
                return;
            };
            let (inner_left, inner_right) = {
                let node = self.node(heavy);
                (node.left, node.right)
            };
            if self.height_of(inner_left) > self.height_of(inner_right) {
                self.rotate_right(heavy, scope);
            }
            self.rotate_left(at, scope);
        }
    }

    /// Rebalance every node from `from` up to the overlay root. After a
    /// rotation the demoted node's parent link points at the promoted pivot,
    /// so the walk re-enters the rotated subtree's new root and continues
    /// upward from there.
    fn rebalance_ascending(&mut self, from: NodeRef, scope: Scope) {
        let mut walk = Some(from);
        while let Some(at) = walk {
            self.rebalance_at(at, scope);
            walk = self.node(at).parent;
        }
    }
}

// =============================================================================
// Ordered operations
// =============================================================================

impl<K, C: Comparator<K>> AvlTree<K, C> {
    /// Inserts `key` into the committed tree, attaching any pending branch
    /// first. Duplicates are a no-op; the returned reference is the canonical
    /// stored key either way.
    pub fn insert(&mut self, key: K) -> &K {
        self.attach();

        let Some(root) = self.root else {
            let at = self.nodes.alloc(Node::new(key));
            self.root = Some(at);
            trace!("insert into empty tree");
            return &self.nodes.get(at).key;
        };

        let mut cur = NodeRef::Main(root);
        let dest = loop {
            if self.cmp.less(&key, &self.node(cur).key) {
                match self.node(cur).left {
                    Some(next) => cur = next,
                    None => {
                        let fresh = NodeRef::Main(self.nodes.alloc(Node::new(key)));
                        self.node_mut(fresh).parent = Some(cur);
                        self.node_mut(cur).left = Some(fresh);
                        break fresh;
                    }
                }
            } else if self.cmp.less(&self.node(cur).key, &key) {
                match self.node(cur).right {
                    Some(next) => cur = next,
                    None => {
                        let fresh = NodeRef::Main(self.nodes.alloc(Node::new(key)));
                        self.node_mut(fresh).parent = Some(cur);
                        self.node_mut(cur).right = Some(fresh);
                        break fresh;
                    }
                }
            } else {
                trace!("insert: key already present");
                return &self.node(cur).key;
            }
        };

        self.update_heights(dest);
        self.update_sizes(dest);
        self.rebalance_ascending(dest, Scope::Committed);
        trace!(len = self.len(), "committed insert");

        // Re-derive the canonical node by key; rotations may have moved it
        // to a different tree position.
        let canonical = self.find(&self.node(dest).key).unwrap_or(dest);
        &self.node(canonical).key
    }

    /// Probes the insert of `key` without touching the committed tree.
    ///
    /// Any pending branch is attached first. Returns the keys of the nodes
    /// the search path visits, in root-to-leaf order. On an empty tree the
    /// probe returns an empty path and creates no branch; on a duplicate the
    /// path stops at the existing key and the branch is still left pending.
    ///
    /// Every node along the probed path is copied into the branch arena; the
    /// copies point at the same unmodified committed subtrees the originals
    /// pointed at. Rebalancing then runs entirely inside the branch, rooted
    /// at its own overlay root.
    pub fn detach_insert(&mut self, key: K) -> Vec<K>
    where
        K: Clone,
    {
        self.attach();

        let Some(root) = self.root else {
            trace!("detach_insert on empty tree: nothing to probe");
            return Vec::new();
        };

        let new_root = {
            let copy = self.nodes.get(root).clone();
            self.branch.alloc(copy)
        };
        self.state = BranchState::Pending {
            key: key.clone(),
            new_root,
        };

        let mut path = Vec::new();
        let mut cur = NodeRef::Branch(new_root);
        let linked = loop {
            let descend_left = self.cmp.less(&key, &self.node(cur).key);
            let descend_right = self.cmp.less(&self.node(cur).key, &key);
            if !descend_left && !descend_right {
                // Already present: the probe stops at the duplicate.
                break None;
            }
            path.push(self.node(cur).key.clone());

            let child = if descend_left {
                self.node(cur).left
            } else {
                self.node(cur).right
            };
            match child {
                Some(shared) => {
                    // Copy-on-write before descending through the child; the
                    // copy inherits the shared grandchildren as-is.
                    let copy = {
                        let node = self.node(shared).clone();
                        NodeRef::Branch(self.branch.alloc(node))
                    };
                    self.node_mut(copy).parent = Some(cur);
                    if descend_left {
                        self.node_mut(cur).left = Some(copy);
                    } else {
                        self.node_mut(cur).right = Some(copy);
                    }
                    cur = copy;
                }
                None => {
                    let fresh = NodeRef::Branch(self.branch.alloc(Node::new(key)));
                    self.node_mut(fresh).parent = Some(cur);
                    if descend_left {
                        self.node_mut(cur).left = Some(fresh);
                    } else {
                        self.node_mut(cur).right = Some(fresh);
                    }
                    break Some(fresh);
                }
            }
        };

        if let Some(fresh) = linked {
            self.update_heights(fresh);
            self.update_sizes(fresh);
            self.rebalance_ascending(fresh, Scope::Branch);
        }

        debug!(path_len = path.len(), "speculative insert probed");
        path
    }

    /// Commits the pending branch, if any, by re-performing the probed
    /// insert against the committed tree. The committed tree cannot have
    /// changed since the probe (every mutator attaches first), so this
    /// reproduces the probed result.
    pub fn attach(&mut self) {
        let BranchState::Pending { key, .. } = mem::replace(&mut self.state, BranchState::Clean)
        else {
            return;
        };
        debug!("attaching pending branch");
        self.branch.clear();
        self.insert(key);
    }

    /// Discards the pending branch without touching the committed tree.
    /// No-op when nothing is pending.
    pub fn reset(&mut self) {
        if self.is_pending() {
            debug!("discarding pending branch");
        }
        self.state = BranchState::Clean;
        self.branch.clear();
    }

    /// `true` when `key` is in the committed tree. Read-only: does not
    /// resolve a pending branch.
    pub fn contains(&self, key: &K) -> bool {
        match self.find(key) {
            Some(at) => {
                let stored = &self.node(at).key;
                !self.cmp.less(key, stored) && !self.cmp.less(stored, key)
            }
            None => false,
        }
    }

    /// Iterative descent over the committed tree: the node holding `key` if
    /// present, otherwise the last node visited before falling off the tree.
    /// `None` only when the tree is empty.
    fn find(&self, key: &K) -> Option<NodeRef> {
        let mut cur = NodeRef::Main(self.root?);
        loop {
            if self.cmp.less(key, &self.node(cur).key) {
                match self.node(cur).left {
                    Some(next) => cur = next,
                    None => return Some(cur),
                }
            } else if self.cmp.less(&self.node(cur).key, key) {
                match self.node(cur).right {
                    Some(next) => cur = next,
                    None => return Some(cur),
                }
            } else {
                return Some(cur);
            }
        }
    }
}

// =============================================================================
// Diagnostic dump
// =============================================================================

impl<K: fmt::Display, C> AvlTree<K, C> {
    /// Renders the committed tree and the pending branch, if any, one node
    /// per line as `key (left, right, parent, size_left, size_right, height)`
    /// in in-order traversal. Debugging aid only.
    pub fn dump(&self) -> String {
        let mut out = String::new();
        match self.root {
            Some(root) => {
                let _ = writeln!(out, "committed tree, root = {}:", self.nodes.get(root).key);
                self.dump_subtree(&mut out, NodeRef::Main(root));
            }
            None => out.push_str("committed tree: empty\n"),
        }
        match &self.state {
            BranchState::Pending { key, new_root } => {
                let _ = writeln!(
                    out,
                    "pending branch for {key}, root = {}:",
                    self.branch.get(*new_root).key
                );
                self.dump_subtree(&mut out, NodeRef::Branch(*new_root));
            }
            BranchState::Clean => out.push_str("pending branch: none\n"),
        }
        out
    }

    fn dump_subtree(&self, out: &mut String, at: NodeRef) {
        let node = self.node(at);
        if let Some(left) = node.left {
            self.dump_subtree(out, left);
        }
        let _ = writeln!(
            out,
            "{} ({}, {}, {}, {}, {}, {})",
            node.key,
            self.key_or_none(node.left),
            self.key_or_none(node.right),
            self.key_or_none(node.parent),
            node.size_left,
            node.size_right,
            node.height,
        );
        if let Some(right) = node.right {
            self.dump_subtree(out, right);
        }
    }

    fn key_or_none(&self, at: Option<NodeRef>) -> String {
        at.map_or_else(|| "none".to_owned(), |at| self.node(at).key.to_string())
    }
}

// =============================================================================
// Iteration
// =============================================================================

/// Borrowed in-order iterator over the committed keys.
pub struct Iter<'a, K, C> {
    tree: &'a AvlTree<K, C>,
    stack: Vec<NodeRef>,
}

impl<'a, K, C> Iter<'a, K, C> {
    fn push_left_spine(&mut self, from: Option<NodeRef>) {
        let tree = self.tree;
        let mut cur = from;
        while let Some(at) = cur {
            self.stack.push(at);
            cur = tree.node(at).left;
        }
    }
}

impl<'a, K, C> Iterator for Iter<'a, K, C> {
    type Item = &'a K;

    fn next(&mut self) -> Option<&'a K> {
        let at = self.stack.pop()?;
        let tree = self.tree;
        let node = tree.node(at);
        self.push_left_spine(node.right);
        Some(&node.key)
    }
}

impl<'a, K, C> IntoIterator for &'a AvlTree<K, C> {
    type Item = &'a K;
    type IntoIter = Iter<'a, K, C>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}


#[cfg(test)]
mod proptests;
