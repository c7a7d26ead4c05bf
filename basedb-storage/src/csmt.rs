//! # Content-addressed Merkle tree
//!
//! Unbalanced binary tree over block keys. Leaves hold a block's content
//! hash; internal nodes hold `H(left || right)` and the largest key below
//! them.
//!
//! ```text
//!                 (k=9, H(a||b))
//!                /              \
//!        (k=4, H(c||d))        [9: b]
//!         /        \
//!     [1: c]     [4: d]
//! ```
//!
//! A new key descends into the child whose max key is nearest to it and
//! splits the leaf it lands on. The shape therefore depends on insertion
//! order; [`Csmt::from_leaves`] inserts in ascending key order, which is
//! the canonical shape persisted trees are rebuilt into.

use std::collections::BTreeMap;
use std::sync::Arc;

use basedb_core::hash::{Blake3Hasher, ContentHasher, Hash, EMPTY_HASH};
use basedb_core::{Error, Result};

#[derive(Debug, Clone)]
struct Node {
    key: u64,
    hash: Hash,
    left: Option<Box<Node>>,
    right: Option<Box<Node>>,
}

impl Node {
    fn leaf(key: u64, hash: Hash) -> Box<Self> {
        Box::new(Self {
            key,
            hash,
            left: None,
            right: None,
        })
    }

    fn is_leaf(&self) -> bool {
        self.left.is_none() && self.right.is_none()
    }

    /// Internal node over two subtrees, smaller key on the left.
    fn join(a: Box<Node>, b: Box<Node>, hasher: &dyn ContentHasher) -> Box<Self> {
        let (left, right) = if a.key <= b.key { (a, b) } else { (b, a) };
        let mut node = Box::new(Self {
            key: 0,
            hash: EMPTY_HASH,
            left: Some(left),
            right: Some(right),
        });
        node.refresh(hasher);
        node
    }

    /// Recompute key and hash from the children. The hash stays stale
    /// while a child is missing.
    fn refresh(&mut self, hasher: &dyn ContentHasher) {
        match (&self.left, &self.right) {
            (Some(l), Some(r)) => {
                self.key = l.key.max(r.key);
                self.hash = hasher.hash_pair(&l.hash, &r.hash);
            }
            (Some(only), None) | (None, Some(only)) => self.key = only.key,
            (None, None) => {}
        }
    }

    fn min_key(&self) -> u64 {
        match (&self.left, &self.right) {
            (Some(l), _) => l.min_key(),
            (None, Some(r)) => r.min_key(),
            (None, None) => self.key,
        }
    }

    fn collect(&self, out: &mut BTreeMap<u64, Hash>) {
        if self.is_leaf() {
            out.insert(self.key, self.hash);
            return;
        }
        for child in [&self.left, &self.right].into_iter().flatten() {
            child.collect(out);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Left,
    Right,
}

impl Side {
    fn other(self) -> Self {
        match self {
            Side::Left => Side::Right,
            Side::Right => Side::Left,
        }
    }
}

/// Child of `node` a search for `key` tries first.
fn nearest(node: &Node, key: u64) -> Side {
    let (Some(l), Some(r)) = (&node.left, &node.right) else {
        return if node.left.is_some() { Side::Left } else { Side::Right };
    };
    let dl = l.key.abs_diff(key);
    let dr = r.key.abs_diff(key);
    if dl < dr {
        Side::Left
    } else if dr < dl {
        Side::Right
    } else if key < l.min_key().min(r.min_key()) {
        Side::Left
    } else {
        Side::Right
    }
}

fn child_mut(node: &mut Node, side: Side) -> &mut Option<Box<Node>> {
    match side {
        Side::Left => &mut node.left,
        Side::Right => &mut node.right,
    }
}

fn child(node: &Node, side: Side) -> Option<&Node> {
    match side {
        Side::Left => node.left.as_deref(),
        Side::Right => node.right.as_deref(),
    }
}

/// One step of a membership proof, leaf to root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProofStep {
    pub sibling: Hash,
    /// The sibling is the left operand of the parent hash.
    pub sibling_left: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MembershipProof {
    pub key: u64,
    pub hash: Hash,
    pub path: Vec<ProofStep>,
}

impl MembershipProof {
    /// Whether the proof hashes up to `root`.
    pub fn verify(&self, root: &Hash, hasher: &dyn ContentHasher) -> bool {
        let acc = self.path.iter().fold(self.hash, |acc, step| {
            if step.sibling_left {
                hasher.hash_pair(&step.sibling, &acc)
            } else {
                hasher.hash_pair(&acc, &step.sibling)
            }
        });
        acc == *root
    }
}

/// Leaves only in the left tree and only in the right tree.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TreeDiff {
    pub left: Vec<(u64, Hash)>,
    pub right: Vec<(u64, Hash)>,
}

impl TreeDiff {
    pub fn is_empty(&self) -> bool {
        self.left.is_empty() && self.right.is_empty()
    }
}

#[derive(Clone)]
pub struct Csmt {
    root: Option<Box<Node>>,
    len: usize,
    hasher: Arc<dyn ContentHasher>,
}

impl std::fmt::Debug for Csmt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Csmt")
            .field("len", &self.len)
            .field("root", &basedb_core::hash::to_hex(&self.root_hash()))
            .finish()
    }
}

impl Default for Csmt {
    fn default() -> Self {
        Self::new()
    }
}

impl Csmt {
    pub fn new() -> Self {
        Self::with_hasher(Arc::new(Blake3Hasher))
    }

    pub fn with_hasher(hasher: Arc<dyn ContentHasher>) -> Self {
        Self {
            root: None,
            len: 0,
            hasher,
        }
    }

    /// Canonical tree over `leaves`, inserted in ascending key order.
    pub fn from_leaves(leaves: impl IntoIterator<Item = (u64, Hash)>) -> Result<Self> {
        let mut sorted: Vec<(u64, Hash)> = leaves.into_iter().collect();
        sorted.sort_by_key(|(k, _)| *k);
        let mut tree = Self::new();
        for (key, hash) in sorted {
            tree.insert(key, hash)?;
        }
        Ok(tree)
    }

    pub fn root_hash(&self) -> Hash {
        self.root.as_ref().map_or(EMPTY_HASH, |r| r.hash)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    /// Largest leaf key.
    pub fn max_key(&self) -> Option<u64> {
        self.root.as_ref().map(|r| r.key)
    }

    pub fn leaves(&self) -> BTreeMap<u64, Hash> {
        let mut out = BTreeMap::new();
        if let Some(root) = &self.root {
            root.collect(&mut out);
        }
        out
    }

    pub fn get(&self, key: u64) -> Option<Hash> {
        fn find(node: &Node, key: u64) -> Option<Hash> {
            if node.is_leaf() {
                return (node.key == key).then_some(node.hash);
            }
            if key > node.key {
                return None;
            }
            let first = nearest(node, key);
            [first, first.other()]
                .into_iter()
                .filter_map(|side| child(node, side))
                .find_map(|c| find(c, key))
        }
        self.root.as_deref().and_then(|r| find(r, key))
    }

    pub fn contains(&self, key: u64) -> bool {
        self.get(key).is_some()
    }

    pub fn insert(&mut self, key: u64, hash: Hash) -> Result<()> {
        if self.contains(key) {
            return Err(Error::KeyExists { key });
        }
        let hasher = self.hasher.clone();
        match self.root.take() {
            None => self.root = Some(Node::leaf(key, hash)),
            Some(root) => self.root = Some(insert_at(root, key, hash, hasher.as_ref())),
        }
        self.len += 1;
        Ok(())
    }

    /// Replace the hash of an existing leaf, keeping the shape.
    pub fn update(&mut self, key: u64, hash: Hash) -> Result<()> {
        fn update_in(node: &mut Node, key: u64, hash: Hash, hasher: &dyn ContentHasher) -> bool {
            if node.is_leaf() {
                if node.key == key {
                    node.hash = hash;
                    return true;
                }
                return false;
            }
            if key > node.key {
                return false;
            }
            let first = nearest(node, key);
            for side in [first, first.other()] {
                let found = match child_mut(node, side) {
                    Some(c) => update_in(c, key, hash, hasher),
                    None => false,
                };
                if found {
                    node.refresh(hasher);
                    return true;
                }
            }
            false
        }

        let hasher = self.hasher.clone();
        let root = self.root.as_deref_mut().ok_or(Error::EmptyTree)?;
        if update_in(root, key, hash, hasher.as_ref()) {
            Ok(())
        } else {
            Err(Error::KeyNotFound { key })
        }
    }

    pub fn delete(&mut self, key: u64) -> Result<()> {
        if self.root.is_none() {
            return Err(Error::EmptyTree);
        }
        let hasher = self.hasher.clone();
        if delete_in(&mut self.root, key, hasher.as_ref())? {
            self.len -= 1;
            Ok(())
        } else {
            Err(Error::KeyNotFound { key })
        }
    }

    pub fn membership_proof(&self, key: u64) -> Result<MembershipProof> {
        fn walk(node: &Node, key: u64, path: &mut Vec<ProofStep>) -> Option<Hash> {
            if node.is_leaf() {
                return (node.key == key).then_some(node.hash);
            }
            if key > node.key {
                return None;
            }
            let first = nearest(node, key);
            for side in [first, first.other()] {
                let (Some(c), Some(sibling)) = (child(node, side), child(node, side.other())) else {
                    continue;
                };
                if let Some(hash) = walk(c, key, path) {
                    path.push(ProofStep {
                        sibling: sibling.hash,
                        sibling_left: side == Side::Right,
                    });
                    return Some(hash);
                }
            }
            None
        }

        let root = self.root.as_deref().ok_or(Error::EmptyTree)?;
        let mut path = Vec::new();
        let hash = walk(root, key, &mut path).ok_or(Error::KeyNotFound { key })?;
        Ok(MembershipProof { key, hash, path })
    }

    pub fn verify_proof(&self, proof: &MembershipProof) -> bool {
        proof.verify(&self.root_hash(), self.hasher.as_ref())
    }

    /// Leaves that differ between `self` (left) and `other` (right).
    pub fn diff(&self, other: &Csmt) -> TreeDiff {
        let mut left = BTreeMap::new();
        let mut right = BTreeMap::new();
        match (&self.root, &other.root) {
            (Some(a), Some(b)) => diff_nodes(a, b, &mut left, &mut right),
            (Some(a), None) => a.collect(&mut left),
            (None, Some(b)) => b.collect(&mut right),
            (None, None) => {}
        }
        // Leaves found on both sides cancel out.
        let same: Vec<u64> = left
            .iter()
            .filter(|(k, h)| right.get(*k) == Some(*h))
            .map(|(k, _)| *k)
            .collect();
        for k in same {
            left.remove(&k);
            right.remove(&k);
        }
        TreeDiff {
            left: left.into_iter().collect(),
            right: right.into_iter().collect(),
        }
    }
}

fn insert_at(mut node: Box<Node>, key: u64, hash: Hash, hasher: &dyn ContentHasher) -> Box<Node> {
    if node.is_leaf() {
        return Node::join(node, Node::leaf(key, hash), hasher);
    }
    let side = nearest(&node, key);
    let slot = child_mut(&mut node, side);
    *slot = Some(match slot.take() {
        Some(c) => insert_at(c, key, hash, hasher),
        None => Node::leaf(key, hash),
    });
    node.refresh(hasher);
    node
}

/// Remove `key` below `slot`; a removed leaf's sibling takes its parent's
/// place.
fn delete_in(slot: &mut Option<Box<Node>>, key: u64, hasher: &dyn ContentHasher) -> Result<bool> {
    let Some(node) = slot.as_deref_mut() else {
        return Ok(false);
    };
    if node.is_leaf() {
        if node.key == key {
            *slot = None;
            return Ok(true);
        }
        return Ok(false);
    }
    if node.left.is_none() || node.right.is_none() {
        return Err(Error::TreeBroken);
    }
    if key > node.key {
        return Ok(false);
    }

    let first = nearest(node, key);
    let mut emptied = None;
    for side in [first, first.other()] {
        if delete_in(child_mut(node, side), key, hasher)? {
            if child_mut(node, side).is_none() {
                emptied = Some(side);
            } else {
                node.refresh(hasher);
            }
            if emptied.is_none() {
                return Ok(true);
            }
            break;
        }
    }
    match emptied {
        Some(side) => {
            let sibling = slot.as_mut().and_then(|n| child_mut(n, side.other()).take());
            *slot = sibling;
            Ok(true)
        }
        None => Ok(false),
    }
}

fn diff_nodes(a: &Node, b: &Node, left: &mut BTreeMap<u64, Hash>, right: &mut BTreeMap<u64, Hash>) {
    if a.key == b.key && a.hash == b.hash {
        return;
    }
    match (a.is_leaf(), b.is_leaf()) {
        (false, false) => {
            for side in [Side::Left, Side::Right] {
                match (child(a, side), child(b, side)) {
                    (Some(ca), Some(cb)) => diff_nodes(ca, cb, left, right),
                    (Some(ca), None) => ca.collect(left),
                    (None, Some(cb)) => cb.collect(right),
                    (None, None) => {}
                }
            }
        }
        _ => {
            a.collect(left);
            b.collect(right);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn h(n: u64) -> Hash {
        Blake3Hasher.hash(&n.to_le_bytes())
    }

    fn tree(keys: &[u64]) -> Csmt {
        let mut t = Csmt::new();
        for k in keys {
            t.insert(*k, h(*k)).unwrap();
        }
        t
    }

    #[test]
    fn test_insert_and_errors() {
        let mut t = Csmt::new();
        assert_eq!(t.root_hash(), EMPTY_HASH);
        assert!(matches!(t.delete(1), Err(Error::EmptyTree)));

        t.insert(1, h(1)).unwrap();
        assert_eq!(t.root_hash(), h(1));
        t.insert(9, h(9)).unwrap();
        assert_eq!(t.root_hash(), Blake3Hasher.hash_pair(&h(1), &h(9)));
        assert!(matches!(t.insert(9, h(0)), Err(Error::KeyExists { key: 9 })));
        assert!(matches!(t.delete(5), Err(Error::KeyNotFound { key: 5 })));
        assert_eq!(t.max_key(), Some(9));
    }

    #[test]
    fn test_delete_promotes_sibling() {
        let mut t = tree(&[1, 4, 9]);
        t.delete(4).unwrap();
        assert_eq!(t.root_hash(), Blake3Hasher.hash_pair(&h(1), &h(9)));
        t.delete(1).unwrap();
        assert_eq!(t.root_hash(), h(9));
        t.delete(9).unwrap();
        assert!(t.is_empty());
        assert_eq!(t.len(), 0);
    }

    #[test]
    fn test_update_keeps_shape() {
        let mut t = tree(&[1, 4, 9, 16]);
        let before = t.root_hash();
        t.update(4, [1u8; 32]).unwrap();
        assert_ne!(t.root_hash(), before);
        t.update(4, h(4)).unwrap();
        assert_eq!(t.root_hash(), before);
        assert!(t.update(5, h(5)).is_err());
    }

    #[test]
    fn test_proofs() {
        let t = tree(&[1, 2, 3, 100, 4_294_967_297, 4_294_967_298]);
        for key in t.leaves().keys() {
            let proof = t.membership_proof(*key).unwrap();
            assert!(t.verify_proof(&proof));
            let mut forged = proof.clone();
            forged.hash = [9u8; 32];
            assert!(!t.verify_proof(&forged));
        }
        assert!(t.membership_proof(55).is_err());
    }

    #[test]
    fn test_diff() {
        let a = tree(&[1, 2, 3]);
        let mut b = tree(&[1, 2, 3]);
        assert!(a.diff(&b).is_empty());
        b.update(2, [5u8; 32]).unwrap();
        b.insert(7, h(7)).unwrap();
        let d = a.diff(&b);
        assert_eq!(d.left, vec![(2, h(2))]);
        assert_eq!(d.right, vec![(2, [5u8; 32]), (7, h(7))]);
    }

    #[test]
    fn test_broken_tree_is_detected() {
        let mut t = tree(&[1, 4]);
        if let Some(root) = t.root.as_mut() {
            root.right = None;
        }
        assert!(matches!(t.delete(1), Err(Error::TreeBroken)));
    }

    proptest! {
        #[test]
        fn prop_root_changes_iff_leaves_change(keys in prop::collection::btree_set(1u64..1_000_000, 1..40), extra in 1_000_000u64..2_000_000) {
            let keys: Vec<u64> = keys.into_iter().collect();
            let mut t = tree(&keys);
            let before = t.root_hash();
            prop_assert_eq!(t.len(), keys.len());

            t.insert(extra, h(extra)).unwrap();
            prop_assert_ne!(t.root_hash(), before);
            t.delete(extra).unwrap();
            prop_assert_eq!(t.leaves(), tree(&keys).leaves());

            t.update(keys[0], h(keys[0] + 1)).unwrap();
            prop_assert_ne!(t.root_hash(), tree(&keys).root_hash());
        }

        #[test]
        fn prop_delete_keeps_untouched_sibling(keys in prop::collection::btree_set(1u64..1_000_000, 2..40), pick in any::<prop::sample::Index>()) {
            let keys: Vec<u64> = keys.into_iter().collect();
            let mut t = tree(&keys);
            let victim = keys[pick.index(keys.len())];
            t.delete(victim).unwrap();
            prop_assert!(!t.contains(victim));
            prop_assert_eq!(t.len(), keys.len() - 1);
            for k in keys.iter().filter(|k| **k != victim) {
                prop_assert_eq!(t.get(*k), Some(h(*k)));
                let proof = t.membership_proof(*k).unwrap();
                prop_assert!(t.verify_proof(&proof));
            }
        }

        #[test]
        fn prop_diff_is_antisymmetric(a in prop::collection::btree_set(1u64..500, 0..30), b in prop::collection::btree_set(1u64..500, 0..30)) {
            let ta = Csmt::from_leaves(a.iter().map(|k| (*k, h(*k)))).unwrap();
            let tb = Csmt::from_leaves(b.iter().map(|k| (*k, h(*k)))).unwrap();
            prop_assert!(ta.diff(&ta).is_empty());
            let ab = ta.diff(&tb);
            let ba = tb.diff(&ta);
            prop_assert_eq!(&ab.left, &ba.right);
            prop_assert_eq!(&ab.right, &ba.left);
            let only_a: Vec<u64> = a.difference(&b).copied().collect();
            prop_assert_eq!(ab.left.iter().map(|(k, _)| *k).collect::<Vec<_>>(), only_a);
        }

        #[test]
        fn prop_canonical_rebuild_is_stable(keys in prop::collection::btree_set(1u64..1_000_000, 0..40)) {
            let a = Csmt::from_leaves(keys.iter().map(|k| (*k, h(*k)))).unwrap();
            let b = Csmt::from_leaves(keys.iter().rev().map(|k| (*k, h(*k)))).unwrap();
            prop_assert_eq!(a.root_hash(), b.root_hash());
        }
    }
}
