//! Merkle proofs of existence and non-existence.
//!
//! A proof records the descent from the root toward a queried index:
//! `depth` levels were traversed, and for each traversed level the sibling
//! reference is kept only when non-empty, with a bitmap telling verifiers
//! which levels contributed one. Non-existence comes in two shapes: the
//! descent ran into an empty subtree, or it ran into a different leaf that
//! occupies a shared index prefix (recorded as `existing_node`).
//!
//! Verification reconstructs the root by hashing from the terminal
//! reference upward, substituting ZERO at levels whose bitmap bit is unset.
//! Tunnel branches with a single non-empty child are therefore accepted
//! naturally: their level simply carries no sibling.

use serde::{Deserialize, Serialize};

use crate::node::{Index, Node, NodeHasher, NodeRef};

/// A witness for the (non-)membership of an index under a given root.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Proof {
    pub(crate) existence: bool,
    pub(crate) depth: u32,
    pub(crate) siblings: Vec<NodeRef>,
    pub(crate) non_empty_siblings: [u8; 32],
    pub(crate) existing_node: Option<Node>,
}

impl Proof {
    /// Whether the queried index was found in the tree.
    pub fn existence(&self) -> bool {
        self.existence
    }

    /// Descent depth at which the traversal terminated.
    pub fn depth(&self) -> u32 {
        self.depth
    }

    /// Non-empty sibling references, shortest-path (shallowest level) first.
    pub fn siblings(&self) -> &[NodeRef] {
        &self.siblings
    }

    /// For non-existence-by-collision proofs: the leaf occupying the slot.
    pub fn existing_node(&self) -> Option<&Node> {
        self.existing_node.as_ref()
    }

    /// Whether level `depth` contributed a sibling to [`Proof::siblings`].
    pub fn is_non_empty_sibling(&self, depth: usize) -> bool {
        self.non_empty_siblings[depth / 8] & (1 << (depth % 8)) != 0
    }

    pub(crate) fn mark_non_empty_sibling(&mut self, depth: usize) {
        self.non_empty_siblings[depth / 8] |= 1 << (depth % 8);
    }

    /// Reconstruct the root implied by this proof for the queried `index`.
    ///
    /// The terminal reference is the queried leaf's hash for existence
    /// proofs, the recomputed hash of [`Proof::existing_node`] for
    /// non-existence-by-collision, and ZERO for non-existence-by-empty.
    /// From there each traversed level hashes the running reference with the
    /// recorded sibling (or ZERO), ordered by the index's path bit.
    ///
    /// `value` is the leaf value the proof was generated against; it only
    /// participates in existence proofs.
    pub fn root(&self, hasher: &dyn NodeHasher, index: &Index, value: &Index) -> NodeRef {
        let mut current = if self.existence {
            hasher.hash_leaf(index, value)
        } else if let Some(other) = &self.existing_node {
            match (other.index(), other.value()) {
                (Some(i), Some(v)) => hasher.hash_leaf(&i, &v),
                // a malformed witness cannot reconstruct anything
                _ => return NodeRef::ZERO,
            }
        } else {
            NodeRef::ZERO
        };

        let mut siblings = self.siblings.iter().rev();
        for level in (0..self.depth as usize).rev() {
            let sibling = if self.is_non_empty_sibling(level) {
                match siblings.next() {
                    Some(s) => *s,
                    None => return NodeRef::ZERO,
                }
            } else {
                NodeRef::ZERO
            };
            current = if index.bit(level) {
                hasher.hash_branch(&sibling, &current)
            } else {
                hasher.hash_branch(&current, &sibling)
            };
        }
        current
    }

    /// Check this proof against a claimed root.
    pub fn verify(&self, hasher: &dyn NodeHasher, root: &NodeRef, index: &Index, value: &Index) -> bool {
        self.root(hasher, index, value) == *root
    }
}
