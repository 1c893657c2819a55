//! # Canopy
//!
//! A content-addressed sparse Merkle tree engine for zero-knowledge-friendly
//! membership commitments:
//! - **Content-addressed node graph** — every node is identified by the
//!   cryptographic hash of its contents, so any alteration propagates to the root
//! - **Sparse 256-bit index space** — leaves settle at the shallowest depth at
//!   which their index path is unique among inserted indices
//! - **Existence and non-existence proofs** — compact witnesses carrying only
//!   non-empty siblings plus a level bitmap, reconstructible by external verifiers
//! - **Transactional persistence** — each insert is buffered in a storage batch
//!   and committed atomically; a failed insert leaves the tree untouched
//! - **Single-writer / multi-reader** — readers observe either the pre-write or
//!   post-write root, never an intermediate state
//!
//! The hash function is a pluggable collaborator (see [`node::NodeHasher`]);
//! the tree never inspects digest structure beyond equality and zero-checks.

pub mod node;
pub mod proof;
pub mod storage;
pub mod tree;
