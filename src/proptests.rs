use super::*;

use proptest::prelude::*;
use std::collections::BTreeSet;

/// Walks every node reachable from the committed root and, when a branch is
/// pending, from the overlay root, asserting BST order, the AVL balance
/// invariant, stored heights/sizes, parent back-references, and the arena
/// discipline (committed nodes never reference branch nodes).
pub(crate) fn validate_tree<C>(t: &AvlTree<i64, C>) {
    if let Some(root) = t.root {
        assert!(
            t.nodes.get(root).parent.is_none(),
            "committed root must have no parent"
        );
        check_subtree(t, NodeRef::Main(root), None, None);
    }
    match &t.state {
        BranchState::Pending { new_root, .. } => {
            assert!(
                t.branch.get(*new_root).parent.is_none(),
                "branch root must have no parent"
            );
            check_subtree(t, NodeRef::Branch(*new_root), None, None);
        }
        BranchState::Clean => {
            assert!(
                t.branch.nodes.is_empty(),
                "clean state must not retain branch nodes"
            );
        }
    }
}

/// Returns (height, size) of the subtree while checking its invariants.
fn check_subtree<C>(
    t: &AvlTree<i64, C>,
    at: NodeRef,
    lower: Option<i64>,
    upper: Option<i64>,
) -> (u32, u32) {
    let node = t.node(at);
    if let Some(lower) = lower {
        assert!(lower < node.key, "BST order violated at {}", node.key);
    }
    if let Some(upper) = upper {
        assert!(node.key < upper, "BST order violated at {}", node.key);
    }

    let (left_height, left_size) = match node.left {
        Some(child) => {
            check_link(t, at, child);
            check_subtree(t, child, lower, Some(node.key))
        }
        None => (0, 0),
    };
    let (right_height, right_size) = match node.right {
        Some(child) => {
            check_link(t, at, child);
            check_subtree(t, child, Some(node.key), upper)
        }
        None => (0, 0),
    };

    assert_eq!(
        node.height,
        1 + left_height.max(right_height),
        "stored height out of date at {}",
        node.key
    );
    assert!(
        left_height.abs_diff(right_height) <= 1,
        "AVL balance violated at {}",
        node.key
    );
    assert_eq!(node.size_left, left_size, "size_left out of date at {}", node.key);
    assert_eq!(
        node.size_right, right_size,
        "size_right out of date at {}",
        node.key
    );

    (node.height, left_size + right_size + 1)
}

fn check_link<C>(t: &AvlTree<i64, C>, parent: NodeRef, child: NodeRef) {
    match (parent, child) {
        (NodeRef::Main(_), NodeRef::Branch(_)) => {
            panic!("committed node references a branch node")
        }
        (NodeRef::Branch(_), NodeRef::Main(_)) => {
            // Shared committed subtree: its parent link still describes the
            // committed tree, so it is not checked against the overlay.
        }
        _ => assert_eq!(
            t.node(child).parent,
            Some(parent),
            "parent back-reference out of sync"
        ),
    }
}

/// In-order (key, height, size_left, size_right) snapshot of the committed
/// tree; equal snapshots mean structurally identical trees.
pub(crate) fn shape<C>(t: &AvlTree<i64, C>) -> Vec<(i64, u32, u32, u32)> {
    fn collect<C>(t: &AvlTree<i64, C>, at: Option<NodeRef>, out: &mut Vec<(i64, u32, u32, u32)>) {
        let Some(at) = at else {
            return;
        };
        let node = t.node(at);
        collect(t, node.left, out);
        out.push((node.key, node.height, node.size_left, node.size_right));
        collect(t, node.right, out);
    }

    let mut out = Vec::new();
    collect(t, t.root.map(NodeRef::Main), &mut out);
    out
}

/// The ancestor keys an insert of `key` would visit in the committed tree,
/// recomputed independently of `detach_insert`.
fn search_path(t: &AvlTree<i64>, key: i64) -> Vec<i64> {
    let mut path = Vec::new();
    let Some(root) = t.root else {
        return path;
    };
    let mut cur = NodeRef::Main(root);
    loop {
        let node = t.node(cur);
        if key == node.key {
            break;
        }
        path.push(node.key);
        let child = if key < node.key { node.left } else { node.right };
        match child {
            Some(next) => cur = next,
            None => break,
        }
    }
    path
}

#[derive(Clone, Debug)]
enum Op {
    Insert(i64),
    DetachInsert(i64),
    Attach,
    Reset,
    Contains(i64),
}

fn ops_strategy() -> impl Strategy<Value = Vec<Op>> {
    // A narrow key range provokes duplicates, duplicate probes, and repeated
    // attach/reset of the same keys.
    let key = -24i64..=24;
    let op = prop_oneof![
        5 => key.clone().prop_map(Op::Insert),
        4 => key.clone().prop_map(Op::DetachInsert),
        2 => Just(Op::Attach),
        2 => Just(Op::Reset),
        3 => key.prop_map(Op::Contains),
    ];
    prop::collection::vec(op, 0..=400)
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 256,
        .. ProptestConfig::default()
    })]

    /// Random op sequences against a `BTreeSet` plus an explicit model of
    /// the single pending key.
    #[test]
    fn prop_model_equivalence(ops in ops_strategy()) {
        let mut t: AvlTree<i64> = AvlTree::new();
        let mut model: BTreeSet<i64> = BTreeSet::new();
        let mut pending: Option<i64> = None;

        for op in ops {
            match op {
                Op::Insert(key) => {
                    if let Some(p) = pending.take() {
                        model.insert(p);
                    }
                    let stored = *t.insert(key);
                    prop_assert_eq!(stored, key);
                    model.insert(key);
                }
                Op::DetachInsert(key) => {
                    if let Some(p) = pending.take() {
                        model.insert(p);
                    }
                    let path = t.detach_insert(key);
                    // The committed tree is unchanged by the probe, so the
                    // expected path can be recomputed after the fact.
                    prop_assert_eq!(&path, &search_path(&t, key));
                    pending = if model.is_empty() { None } else { Some(key) };
                    prop_assert_eq!(t.is_pending(), pending.is_some());
                }
                Op::Attach => {
                    t.attach();
                    if let Some(p) = pending.take() {
                        model.insert(p);
                    }
                }
                Op::Reset => {
                    t.reset();
                    pending = None;
                }
                Op::Contains(key) => {
                    prop_assert_eq!(t.contains(&key), model.contains(&key));
                }
            }

            validate_tree(&t);
            prop_assert_eq!(t.len(), model.len());
        }

        let keys: Vec<i64> = t.iter().copied().collect();
        let expected: Vec<i64> = model.iter().copied().collect();
        prop_assert_eq!(keys, expected);
    }

    /// Probing then attaching must produce exactly the tree a direct insert
    /// produces, shape included.
    #[test]
    fn prop_detach_attach_matches_insert(
        keys in prop::collection::vec(-64i64..=64, 0..=64),
        probe in -64i64..=64,
    ) {
        let mut probed: AvlTree<i64> = AvlTree::new();
        let mut direct: AvlTree<i64> = AvlTree::new();
        for &key in &keys {
            probed.insert(key);
            direct.insert(key);
        }

        probed.detach_insert(probe);
        probed.attach();
        direct.insert(probe);

        prop_assert_eq!(shape(&probed), shape(&direct));
        validate_tree(&probed);
        validate_tree(&direct);
    }

    /// A probe never disturbs the committed tree, and a reset leaves no
    /// trace of it.
    #[test]
    fn prop_reset_restores_shape(
        keys in prop::collection::vec(-64i64..=64, 0..=64),
        probe in -64i64..=64,
    ) {
        let mut t: AvlTree<i64> = AvlTree::new();
        for &key in &keys {
            t.insert(key);
        }
        let before = shape(&t);

        t.detach_insert(probe);
        validate_tree(&t);
        prop_assert_eq!(shape(&t), before.clone());

        t.reset();
        prop_assert!(!t.is_pending());
        prop_assert_eq!(shape(&t), before);
        validate_tree(&t);
    }
}

fn for_each_permutation(items: &[i64], f: &mut impl FnMut(&[i64])) {
    fn rec(items: &[i64], used: &mut [bool], out: &mut Vec<i64>, f: &mut impl FnMut(&[i64])) {
        if out.len() == items.len() {
            f(out);
            return;
        }
        for i in 0..items.len() {
            if used[i] {
                continue;
            }
            used[i] = true;
            out.push(items[i]);
            rec(items, used, out, f);
            out.pop();
            used[i] = false;
        }
    }

    let mut used = vec![false; items.len()];
    let mut out = Vec::with_capacity(items.len());
    rec(items, &mut used, &mut out, f);
}

#[test]
fn exhaustive_insert_order_small_set() {
    let keys = [4i64, 3, 8, 2, 7, 10];

    for_each_permutation(&keys, &mut |perm| {
        let mut t: AvlTree<i64> = AvlTree::new();
        for &key in perm {
            t.insert(key);
            validate_tree(&t);
        }

        let mut sorted: Vec<i64> = perm.to_vec();
        sorted.sort_unstable();
        let got: Vec<i64> = t.iter().copied().collect();
        assert_eq!(got, sorted);
    });
}

#[test]
fn exhaustive_probe_attach_small_set() {
    let keys = [4i64, 3, 8, 2, 7, 10];

    for_each_permutation(&keys, &mut |perm| {
        let mut probed: AvlTree<i64> = AvlTree::new();
        for &key in perm {
            probed.insert(key);
        }
        let mut direct = probed.clone();

        probed.detach_insert(5);
        validate_tree(&probed);
        probed.attach();
        direct.insert(5);

        assert_eq!(shape(&probed), shape(&direct));
        validate_tree(&probed);
    });
}
