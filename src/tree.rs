//! The sparse Merkle tree engine.
//!
//! Coordinates root tracking, shared-read / exclusive-write access, and the
//! top-down recursion for inserts and proof generation. All storage
//! mutations of an insert are buffered in a single transaction; the
//! in-memory root advances only after the commit succeeds, so readers
//! observe either the pre-write or post-write root, never an intermediate.
//!
//! The tree's shape is deterministic: a leaf settles at the shallowest
//! depth at which its index path is unique among inserted indices. Interior
//! nodes are written descendants-first, with the root reference updated
//! last inside the transaction.

use std::sync::Arc;

use parking_lot::RwLock;

use crate::node::{Index, Node, NodeHasher, NodeRef};
use crate::proof::Proof;
use crate::storage::{Storage, StorageError, StorageTx};

/// Maximum number of levels of the tree, determined by the number of bits
/// in a leaf index.
pub const MAX_TREE_HEIGHT: usize = 256;

/// Errors from tree operations.
#[derive(Clone, Debug, thiserror::Error)]
pub enum TreeError {
    #[error("max levels must be between 1 and {MAX_TREE_HEIGHT}")]
    MaxLevelsNotInRange,
    #[error("a leaf with this index already exists in the tree")]
    NodeIndexAlreadyExists,
    #[error("reached the maximum level of the tree without finding a unique path")]
    ReachedMaxLevel,
    #[error("invalid node found")]
    InvalidNodeFound,
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// A content-addressed sparse Merkle tree over a transactional storage
/// backend.
///
/// Reads (`root`, `get_node`, `generate_proofs`) take shared access; writes
/// (`add_leaf`) take exclusive access. Nodes are created by inserts, never
/// mutated or deleted; superseded nodes simply stop being reachable from
/// the current root.
pub struct MerkleTree {
    storage: Arc<dyn Storage>,
    hasher: Arc<dyn NodeHasher>,
    root: RwLock<NodeRef>,
    max_levels: usize,
}

impl MerkleTree {
    /// Open a tree over the given storage, reading the persisted root
    /// reference. A missing root record initializes an empty tree and
    /// persists the ZERO root; any other storage error propagates.
    pub fn open(
        storage: Arc<dyn Storage>,
        hasher: Arc<dyn NodeHasher>,
        max_levels: usize,
    ) -> Result<Self, TreeError> {
        if max_levels < 1 || max_levels > MAX_TREE_HEIGHT {
            return Err(TreeError::MaxLevelsNotInRange);
        }
        let root = match storage.get_root_ref() {
            Ok(root) => root,
            Err(StorageError::NotFound) => {
                storage.upsert_root_ref(&NodeRef::ZERO)?;
                NodeRef::ZERO
            }
            Err(e) => return Err(e.into()),
        };
        Ok(MerkleTree {
            storage,
            hasher,
            root: RwLock::new(root),
            max_levels,
        })
    }

    pub fn max_levels(&self) -> usize {
        self.max_levels
    }

    /// The current root reference.
    pub fn root(&self) -> NodeRef {
        *self.root.read()
    }

    /// Load a node by reference. A ZERO reference yields the empty node
    /// without touching storage.
    pub fn get_node(&self, r: &NodeRef) -> Result<Node, TreeError> {
        let _guard = self.root.read();
        self.node_at(r)
    }

    /// Insert a new leaf node, starting from the root.
    ///
    /// The descent finds the shallowest level that accommodates the leaf's
    /// index: it does not necessarily use all the bits of the index's path.
    /// As soon as a unique path is found, the leaf is added there; one or
    /// more branch nodes may be created above it. All writes go through a
    /// single storage transaction, and the in-memory root is updated only
    /// after the commit succeeds.
    pub fn add_leaf(&self, leaf: Node) -> Result<(), TreeError> {
        let index = match &leaf {
            Node::Leaf { index, .. } => *index,
            _ => return Err(TreeError::InvalidNodeFound),
        };
        let mut root = self.root.write();
        let path = index.to_path(self.max_levels);

        let mut tx = self.storage.begin_tx()?;
        let new_root = match self.add_leaf_rec(tx.as_mut(), &leaf, &root, 0, &path) {
            Ok(r) => r,
            Err(e) => return Err(Self::abort(tx, &leaf, e)),
        };
        if let Err(e) = tx.upsert_root_ref(&new_root) {
            return Err(Self::abort(tx, &leaf, e.into()));
        }

        tracing::debug!(root = %new_root.hex(), leaf = %leaf.node_ref().hex(), "committing leaf insert");
        tx.commit()?;
        *root = new_root;
        Ok(())
    }

    /// Generate proofs of existence (or non-existence) for the given
    /// indexes, preserving input order, along with the value found for each.
    /// If `root_ref` is `None`, the current root is used.
    pub fn generate_proofs(
        &self,
        keys: &[Index],
        root_ref: Option<NodeRef>,
    ) -> Result<(Vec<Proof>, Vec<Index>), TreeError> {
        let guard = self.root.read();
        let root = root_ref.unwrap_or(*guard);

        let mut proofs = Vec::with_capacity(keys.len());
        let mut values = Vec::with_capacity(keys.len());
        for key in keys {
            let (proof, value) = self.generate_proof(key, &root)?;
            proofs.push(proof);
            values.push(value);
        }
        Ok((proofs, values))
    }

    /// Descend from `root` toward `key`, recording traversed siblings.
    fn generate_proof(&self, key: &Index, root: &NodeRef) -> Result<(Proof, Index), TreeError> {
        let path = key.to_path(self.max_levels);
        let mut proof = Proof::default();
        let mut next = *root;

        for depth in 0..self.max_levels {
            proof.depth = depth as u32;
            match self.node_at(&next)? {
                Node::Empty => {
                    // non-existence along an empty branch
                    return Ok((proof, Index::ZERO));
                }
                leaf @ Node::Leaf { .. } => {
                    let index = leaf.index().ok_or(TreeError::InvalidNodeFound)?;
                    let value = leaf.value().ok_or(TreeError::InvalidNodeFound)?;
                    if index == *key {
                        proof.existence = true;
                        return Ok((proof, value));
                    }
                    // a different leaf occupies the shared prefix:
                    // non-existence by collision, with the occupant as witness
                    proof.existing_node = Some(leaf);
                    return Ok((proof, value));
                }
                Node::Branch { left, right, .. } => {
                    if left.is_zero() && right.is_zero() {
                        // the insert algorithm never creates such a branch
                        return Err(TreeError::InvalidNodeFound);
                    }
                    let sibling = if path[depth] {
                        next = right;
                        left
                    } else {
                        next = left;
                        right
                    };
                    if !sibling.is_zero() {
                        proof.mark_non_empty_sibling(depth);
                        proof.siblings.push(sibling);
                    }
                }
            }
        }
        Err(TreeError::ReachedMaxLevel)
    }

    /// Load a node without taking the lock; callers hold the appropriate guard.
    fn node_at(&self, r: &NodeRef) -> Result<Node, TreeError> {
        if r.is_zero() {
            return Ok(Node::Empty);
        }
        Ok(self.storage.get_node(r)?)
    }

    /// Recursive insert step. Dispatches on the node at `current_ref`:
    /// - Empty: the new leaf is added at this position.
    /// - Leaf: an existing leaf shares the index prefix; the path of both
    ///   nodes is extended with more index bits until they diverge.
    /// - Branch: descend along the next path bit and rebuild the branch
    ///   with the updated child.
    fn add_leaf_rec(
        &self,
        tx: &mut dyn StorageTx,
        new_leaf: &Node,
        current_ref: &NodeRef,
        level: usize,
        path: &[bool],
    ) -> Result<NodeRef, TreeError> {
        if level + 1 > self.max_levels {
            // all levels exhausted without finding a unique path: the two
            // indexes agree on their low max_levels bits
            return Err(TreeError::ReachedMaxLevel);
        }

        let current = self.node_at(current_ref)?;
        match &current {
            Node::Empty => {
                tracing::debug!(level, leaf = %new_leaf.node_ref().hex(), "empty slot, inserting leaf");
                Self::add_node(tx, new_leaf)
            }
            Node::Leaf { index, .. } => {
                if new_leaf.index() == Some(*index) {
                    return Err(TreeError::NodeIndexAlreadyExists);
                }
                let path_old = index.to_path(self.max_levels);
                tracing::debug!(level, "occupied slot, extending path");
                self.extend_path(tx, new_leaf, &current, level, path, &path_old)
            }
            Node::Branch { left, right, .. } => {
                let new_branch = if path[level] {
                    tracing::debug!(level, "branch node, descending right");
                    let child = self.add_leaf_rec(tx, new_leaf, right, level + 1, path)?;
                    Node::branch(*left, child, self.hasher.as_ref())
                } else {
                    tracing::debug!(level, "branch node, descending left");
                    let child = self.add_leaf_rec(tx, new_leaf, left, level + 1, path)?;
                    Node::branch(child, *right, self.hasher.as_ref())
                };
                Self::add_node(tx, &new_branch)
            }
        }
    }

    /// Extend the paths of two leaves sharing an index prefix, creating
    /// ancestor branch nodes until the paths diverge.
    ///
    /// Branches created along the shared stretch have one ZERO child: they
    /// are tunnels toward the eventual divergence, and verifiers accept
    /// them through the proof bitmap.
    fn extend_path(
        &self,
        tx: &mut dyn StorageTx,
        new_leaf: &Node,
        old_leaf: &Node,
        level: usize,
        path_new: &[bool],
        path_old: &[bool],
    ) -> Result<NodeRef, TreeError> {
        if level + 2 > self.max_levels {
            // two leaves exhausting the full index space cannot be told apart
            return Err(TreeError::ReachedMaxLevel);
        }

        if path_new[level] == path_old[level] {
            let child = self.extend_path(tx, new_leaf, old_leaf, level + 1, path_new, path_old)?;
            let branch = if path_new[level] {
                Node::branch(NodeRef::ZERO, child, self.hasher.as_ref())
            } else {
                Node::branch(child, NodeRef::ZERO, self.hasher.as_ref())
            };
            tracing::debug!(level, branch = %branch.node_ref().hex(), "shared path bit, tunneling");
            return Self::add_node(tx, &branch);
        }

        // the paths diverge at this level: both leaves become children of a
        // new branch, sides dictated by their path bits
        let branch = if path_new[level] {
            Node::branch(old_leaf.node_ref(), new_leaf.node_ref(), self.hasher.as_ref())
        } else {
            Node::branch(new_leaf.node_ref(), old_leaf.node_ref(), self.hasher.as_ref())
        };
        // the old leaf is already in storage; only the new leaf needs a write
        Self::add_node(tx, new_leaf)?;
        tracing::debug!(level, branch = %branch.node_ref().hex(), "paths diverged, creating branch");
        Self::add_node(tx, &branch)
    }

    /// Buffer a node write and return its reference. Empty nodes are not
    /// stored: they are all the same and assumed to always exist.
    fn add_node(tx: &mut dyn StorageTx, node: &Node) -> Result<NodeRef, TreeError> {
        if let Node::Empty = node {
            return Ok(NodeRef::ZERO);
        }
        tx.insert_node(node)?;
        Ok(node.node_ref())
    }

    /// Roll the transaction back and surface the original error. A rollback
    /// failure is logged without masking it.
    fn abort(tx: Box<dyn StorageTx + '_>, leaf: &Node, err: TreeError) -> TreeError {
        tracing::error!(leaf = %leaf.node_ref().hex(), error = %err, "error adding leaf node, rolling back");
        if let Err(rollback_err) = tx.rollback() {
            tracing::error!(error = %rollback_err, "error rolling back leaf insert");
        }
        err
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::Blake3NodeHasher;
    use crate::storage::MemoryStorage;

    fn memory_tree(max_levels: usize) -> MerkleTree {
        MerkleTree::open(
            Arc::new(MemoryStorage::new()),
            Arc::new(Blake3NodeHasher),
            max_levels,
        )
        .unwrap()
    }

    fn leaf(i: u64) -> Node {
        Node::leaf(Index::from_u64(i), None, &Blake3NodeHasher)
    }

    #[test]
    fn open_rejects_out_of_range_levels() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        for levels in [0, MAX_TREE_HEIGHT + 1] {
            let result = MerkleTree::open(storage.clone(), Arc::new(Blake3NodeHasher), levels);
            assert!(matches!(result, Err(TreeError::MaxLevelsNotInRange)));
        }
    }

    #[test]
    fn open_initializes_and_persists_zero_root() {
        let storage = Arc::new(MemoryStorage::new());
        let tree = MerkleTree::open(storage.clone(), Arc::new(Blake3NodeHasher), 4).unwrap();
        assert!(tree.root().is_zero());
        assert_eq!(storage.get_root_ref().unwrap(), NodeRef::ZERO);
    }

    #[test]
    fn single_leaf_becomes_the_root() {
        let tree = memory_tree(4);
        let l = leaf(0b0001);
        tree.add_leaf(l.clone()).unwrap();
        // single-leaf tree: the root is the leaf's own reference
        assert_eq!(tree.root(), l.node_ref());
    }

    #[test]
    fn two_leaves_diverging_at_bit_one() {
        let tree = memory_tree(4);
        let l1 = leaf(0b0001); // path [1,0,0,0]
        let l3 = leaf(0b0011); // path [1,1,0,0]
        tree.add_leaf(l1.clone()).unwrap();
        tree.add_leaf(l3.clone()).unwrap();

        // root branch: left ZERO, right is the depth-1 branch
        let root = tree.get_node(&tree.root()).unwrap();
        let (left, right) = root.children().unwrap();
        assert!(left.is_zero());

        let inner = tree.get_node(&right).unwrap();
        let (inner_left, inner_right) = inner.children().unwrap();
        assert_eq!(inner_left, l1.node_ref());
        assert_eq!(inner_right, l3.node_ref());
    }

    #[test]
    fn existence_proof_records_only_non_empty_siblings() {
        let tree = memory_tree(4);
        let l1 = leaf(0b0001);
        let l3 = leaf(0b0011);
        tree.add_leaf(l1).unwrap();
        tree.add_leaf(l3.clone()).unwrap();

        let key = Index::from_u64(0b0001);
        let (proofs, values) = tree.generate_proofs(&[key], None).unwrap();
        let p = &proofs[0];

        assert!(p.existence());
        assert_eq!(p.depth(), 2);
        assert_eq!(p.siblings(), &[l3.node_ref()]);
        assert!(!p.is_non_empty_sibling(0));
        assert!(p.is_non_empty_sibling(1));
        assert_eq!(values[0], key);
        assert!(p.verify(&Blake3NodeHasher, &tree.root(), &key, &values[0]));
    }

    #[test]
    fn collision_yields_non_existence_with_witness() {
        let tree = memory_tree(4);
        let l1 = leaf(0b0001);
        tree.add_leaf(l1.clone()).unwrap();
        tree.add_leaf(leaf(0b0011)).unwrap();

        // path [1,0,1,0] descends right then left, into leaf(0b0001)
        let key = Index::from_u64(0b0101);
        let (proofs, values) = tree.generate_proofs(&[key], None).unwrap();
        let p = &proofs[0];

        assert!(!p.existence());
        let witness = p.existing_node().unwrap();
        assert_eq!(witness.index(), Some(Index::from_u64(0b0001)));
        assert_eq!(values[0], Index::from_u64(0b0001));
        assert!(p.verify(&Blake3NodeHasher, &tree.root(), &key, &values[0]));
    }

    #[test]
    fn empty_descent_yields_non_existence() {
        let tree = memory_tree(4);
        tree.add_leaf(leaf(0b0001)).unwrap();
        tree.add_leaf(leaf(0b0011)).unwrap();

        // path [0,0,0,0] descends left at bit 0 into ZERO
        let key = Index::from_u64(0b0000);
        let (proofs, values) = tree.generate_proofs(&[key], None).unwrap();
        let p = &proofs[0];

        assert!(!p.existence());
        assert!(p.existing_node().is_none());
        assert_eq!(p.depth(), 1);
        assert_eq!(p.siblings().len(), 1);
        assert!(p.is_non_empty_sibling(0));
        assert_eq!(values[0], Index::ZERO);
        assert!(p.verify(&Blake3NodeHasher, &tree.root(), &key, &values[0]));
    }

    #[test]
    fn empty_tree_proof() {
        let tree = memory_tree(4);
        let key = Index::from_u64(9);
        let (proofs, values) = tree.generate_proofs(&[key], None).unwrap();
        let p = &proofs[0];

        assert!(!p.existence());
        assert_eq!(p.depth(), 0);
        assert!(p.siblings().is_empty());
        assert_eq!(values[0], Index::ZERO);
        assert!(p.verify(&Blake3NodeHasher, &NodeRef::ZERO, &key, &values[0]));
    }

    #[test]
    fn duplicate_index_is_rejected() {
        let tree = memory_tree(8);
        tree.add_leaf(leaf(42)).unwrap();
        let root = tree.root();

        let result = tree.add_leaf(leaf(42));
        assert!(matches!(result, Err(TreeError::NodeIndexAlreadyExists)));
        assert_eq!(tree.root(), root);

        // same index with a different value is still a duplicate
        let other = Node::leaf(
            Index::from_u64(42),
            Some(Index::from_u64(7)),
            &Blake3NodeHasher,
        );
        let result = tree.add_leaf(other);
        assert!(matches!(result, Err(TreeError::NodeIndexAlreadyExists)));
        assert_eq!(tree.root(), root);
    }

    #[test]
    fn shared_low_bits_exhaust_levels() {
        let tree = memory_tree(2);
        tree.add_leaf(leaf(0b00)).unwrap();
        let root = tree.root();

        // 0b100 has the same low two bits as 0b00
        let result = tree.add_leaf(leaf(0b100));
        assert!(matches!(result, Err(TreeError::ReachedMaxLevel)));
        assert_eq!(tree.root(), root);
    }

    #[test]
    fn add_leaf_rejects_non_leaf_nodes() {
        let tree = memory_tree(4);
        assert!(matches!(
            tree.add_leaf(Node::empty()),
            Err(TreeError::InvalidNodeFound)
        ));
        let branch = Node::branch(NodeRef::ZERO, leaf(1).node_ref(), &Blake3NodeHasher);
        assert!(matches!(
            tree.add_leaf(branch),
            Err(TreeError::InvalidNodeFound)
        ));
    }

    #[test]
    fn get_node_synthesizes_empty_for_zero() {
        let tree = memory_tree(4);
        assert_eq!(tree.get_node(&NodeRef::ZERO).unwrap(), Node::Empty);
    }

    #[test]
    fn get_node_loads_persisted_leaves() {
        let tree = memory_tree(4);
        let l = leaf(3);
        tree.add_leaf(l.clone()).unwrap();
        assert_eq!(tree.get_node(&l.node_ref()).unwrap(), l);
    }

    #[test]
    fn reopen_restores_root() {
        let storage = Arc::new(MemoryStorage::new());
        let tree = MerkleTree::open(storage.clone(), Arc::new(Blake3NodeHasher), 8).unwrap();
        tree.add_leaf(leaf(5)).unwrap();
        tree.add_leaf(leaf(6)).unwrap();
        let root = tree.root();
        drop(tree);

        let reopened = MerkleTree::open(storage, Arc::new(Blake3NodeHasher), 8).unwrap();
        assert_eq!(reopened.root(), root);
        let (proofs, values) = reopened
            .generate_proofs(&[Index::from_u64(5)], None)
            .unwrap();
        assert!(proofs[0].existence());
        assert_eq!(values[0], Index::from_u64(5));
    }

    #[test]
    fn proofs_against_historical_root() {
        let tree = memory_tree(8);
        tree.add_leaf(leaf(1)).unwrap();
        let old_root = tree.root();
        tree.add_leaf(leaf(2)).unwrap();

        // the old root's nodes are still in storage
        let key = Index::from_u64(1);
        let (proofs, _) = tree.generate_proofs(&[key], Some(old_root)).unwrap();
        assert!(proofs[0].existence());
        assert!(proofs[0].verify(&Blake3NodeHasher, &old_root, &key, &key));
    }

    #[test]
    fn tampered_branch_with_two_zero_children_is_invalid() {
        let storage = Arc::new(MemoryStorage::new());
        let hasher = Blake3NodeHasher;
        let bogus = Node::branch(NodeRef::ZERO, NodeRef::ZERO, &hasher);
        let mut tx = storage.begin_tx().unwrap();
        tx.insert_node(&bogus).unwrap();
        tx.upsert_root_ref(&bogus.node_ref()).unwrap();
        tx.commit().unwrap();

        let tree = MerkleTree::open(storage, Arc::new(Blake3NodeHasher), 4).unwrap();
        let result = tree.generate_proofs(&[Index::from_u64(1)], None);
        assert!(matches!(result, Err(TreeError::InvalidNodeFound)));
    }
}
