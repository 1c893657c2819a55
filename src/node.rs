//! Node model for the sparse Merkle tree.
//!
//! A node is one of three shapes:
//! - **Empty** — implied wherever a reference equals [`NodeRef::ZERO`]; never persisted
//! - **Leaf** — carries an index and an optional value (absent value means the
//!   value is the index itself); ref = `H(leaf-domain, index, value)`
//! - **Branch** — carries two child references; ref = `H(branch-domain, left, right)`
//!
//! Nodes are small immutable values: the reference is computed once at
//! construction and cached. The hash itself is supplied through the
//! [`NodeHasher`] seam so the tree core stays agnostic of the digest choice
//! (a circuit-friendly hash plugs in the same way as the default BLAKE3).

use serde::{Deserialize, Serialize};

/// Domain string for leaf node hashing.
const LEAF_DOMAIN: &str = "canopy.node.leaf";
/// Domain string for branch node hashing.
const BRANCH_DOMAIN: &str = "canopy.node.branch";

/// A leaf index: a non-negative integer below 2^256, stored as 32
/// little-endian bytes.
///
/// Bit `i` of the index is bit `i` of the leaf's path: `false` descends left,
/// `true` descends right.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Index(pub [u8; 32]);

impl Index {
    /// The zero index.
    pub const ZERO: Index = Index([0u8; 32]);

    /// Build an index from a small integer (little-endian into the low bytes).
    pub fn from_u64(v: u64) -> Self {
        let mut bytes = [0u8; 32];
        bytes[..8].copy_from_slice(&v.to_le_bytes());
        Index(bytes)
    }

    /// Build an index from raw little-endian bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Index(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }

    /// Bit `i` of the index, least-significant-bit first.
    pub fn bit(&self, i: usize) -> bool {
        (self.0[i / 8] >> (i % 8)) & 1 == 1
    }

    /// Derive the descent path: `max_levels` booleans, LSB first.
    pub fn to_path(&self, max_levels: usize) -> Vec<bool> {
        (0..max_levels).map(|i| self.bit(i)).collect()
    }

    pub fn hex(&self) -> String {
        hex::encode(self.0)
    }
}

/// A content-addressed node reference: the digest of the node's contents.
///
/// The distinguished [`NodeRef::ZERO`] denotes an empty subtree. Equality is
/// structural and implies byte-for-byte equality of the referenced node.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeRef(pub [u8; 32]);

impl NodeRef {
    /// The zero reference, denoting absence.
    pub const ZERO: NodeRef = NodeRef([0u8; 32]);

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        NodeRef(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }

    pub fn hex(&self) -> String {
        hex::encode(self.0)
    }
}

/// The hashing seam: computes node references from node contents.
///
/// Implementations must be deterministic and domain-separate leaf hashing
/// from branch hashing. The tree holds one hasher and uses it for every
/// interior node it creates; callers must build their leaves with the same
/// hasher or references will not line up.
pub trait NodeHasher: Send + Sync {
    /// Reference of a leaf carrying `index` and the *effective* value
    /// (the explicit value, or the index itself when absent).
    fn hash_leaf(&self, index: &Index, value: &Index) -> NodeRef;

    /// Reference of a branch with the given child references.
    fn hash_branch(&self, left: &NodeRef, right: &NodeRef) -> NodeRef;
}

/// Default node hasher: domain-separated BLAKE3.
///
/// Uses `derive_key` mode with ASCII domain strings, so leaf and branch
/// digests live in disjoint spaces.
#[derive(Clone, Copy, Debug, Default)]
pub struct Blake3NodeHasher;

impl NodeHasher for Blake3NodeHasher {
    fn hash_leaf(&self, index: &Index, value: &Index) -> NodeRef {
        let mut hasher = blake3::Hasher::new_derive_key(LEAF_DOMAIN);
        hasher.update(index.as_bytes());
        hasher.update(value.as_bytes());
        NodeRef(*hasher.finalize().as_bytes())
    }

    fn hash_branch(&self, left: &NodeRef, right: &NodeRef) -> NodeRef {
        let mut hasher = blake3::Hasher::new_derive_key(BRANCH_DOMAIN);
        hasher.update(left.as_bytes());
        hasher.update(right.as_bytes());
        NodeRef(*hasher.finalize().as_bytes())
    }
}

/// A tree node. Immutable once constructed; the `hash` field caches the
/// content-addressed reference.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Node {
    /// The empty node. Its reference is [`NodeRef::ZERO`]; it is never persisted.
    Empty,
    /// A terminal node carrying an index and an optional value.
    Leaf {
        hash: NodeRef,
        index: Index,
        value: Option<Index>,
    },
    /// An interior node with two child references.
    Branch {
        hash: NodeRef,
        left: NodeRef,
        right: NodeRef,
    },
}

impl Node {
    pub fn empty() -> Node {
        Node::Empty
    }

    /// Build a leaf node. An absent value defaults to the index for hashing.
    pub fn leaf(index: Index, value: Option<Index>, hasher: &dyn NodeHasher) -> Node {
        let effective = value.unwrap_or(index);
        let hash = hasher.hash_leaf(&index, &effective);
        Node::Leaf { hash, index, value }
    }

    /// Build a branch node over two child references.
    pub fn branch(left: NodeRef, right: NodeRef, hasher: &dyn NodeHasher) -> Node {
        let hash = hasher.hash_branch(&left, &right);
        Node::Branch { hash, left, right }
    }

    /// The node's content-addressed reference. ZERO for the empty node.
    pub fn node_ref(&self) -> NodeRef {
        match self {
            Node::Empty => NodeRef::ZERO,
            Node::Leaf { hash, .. } | Node::Branch { hash, .. } => *hash,
        }
    }

    /// The leaf index, if this is a leaf.
    pub fn index(&self) -> Option<Index> {
        match self {
            Node::Leaf { index, .. } => Some(*index),
            _ => None,
        }
    }

    /// The effective leaf value (explicit value, else the index), if this is a leaf.
    pub fn value(&self) -> Option<Index> {
        match self {
            Node::Leaf { index, value, .. } => Some(value.unwrap_or(*index)),
            _ => None,
        }
    }

    /// Child references, if this is a branch.
    pub fn children(&self) -> Option<(NodeRef, NodeRef)> {
        match self {
            Node::Branch { left, right, .. } => Some((*left, *right)),
            _ => None,
        }
    }
}
