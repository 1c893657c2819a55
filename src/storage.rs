//! Persistent storage for tree nodes.
//!
//! Provides the `Storage` / `StorageTx` contracts the tree is written
//! against, plus two backends: a sled-backed implementation for durable
//! deployments and an in-memory implementation for tests and embedding.
//!
//! The layout is content-addressed: one record per non-empty node keyed by
//! its reference, plus one dedicated record holding the current root
//! reference. Empty nodes are never persisted. Inserting a node whose
//! reference already exists is an idempotent overwrite with identical
//! contents.

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::node::{Index, Node, NodeRef};

/// Errors from storage operations.
#[derive(Clone, Debug, thiserror::Error)]
pub enum StorageError {
    #[error("not found")]
    NotFound,
    #[error("storage I/O error: {0}")]
    Io(String),
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Trait for persistent node storage backends.
pub trait Storage: Send + Sync {
    /// Load a node by its reference. `NotFound` if no record exists.
    fn get_node(&self, r: &NodeRef) -> Result<Node, StorageError>;

    /// Read the persisted root reference. `NotFound` if never written.
    fn get_root_ref(&self) -> Result<NodeRef, StorageError>;

    /// Persist the root reference directly, outside any transaction.
    fn upsert_root_ref(&self, r: &NodeRef) -> Result<(), StorageError>;

    /// Open a write transaction. Writes are buffered and become visible
    /// atomically at commit. The backend serializes its own transactions;
    /// callers must not hold more than one open at a time.
    fn begin_tx(&self) -> Result<Box<dyn StorageTx + '_>, StorageError>;
}

/// A buffered write transaction against a [`Storage`] backend.
///
/// `commit` and `rollback` are terminal, enforced by consuming the
/// transaction. A failed commit discards the buffered writes; nothing
/// becomes visible.
pub trait StorageTx {
    /// Buffer a node insert. Rejects the empty node.
    fn insert_node(&mut self, n: &Node) -> Result<(), StorageError>;

    /// Buffer a root reference update, applied after all node inserts.
    fn upsert_root_ref(&mut self, r: &NodeRef) -> Result<(), StorageError>;

    /// Apply all buffered writes atomically.
    fn commit(self: Box<Self>) -> Result<(), StorageError>;

    /// Discard all buffered writes.
    fn rollback(self: Box<Self>) -> Result<(), StorageError>;
}

/// Compact persisted form of a non-empty node. The reference is the storage
/// key and is re-attached on load, so it is not part of the record.
#[derive(Serialize, Deserialize)]
enum NodeRecord {
    Leaf { index: Index, value: Option<Index> },
    Branch { left: NodeRef, right: NodeRef },
}

fn encode_node(n: &Node) -> Result<Vec<u8>, StorageError> {
    let record = match n {
        Node::Leaf { index, value, .. } => NodeRecord::Leaf {
            index: *index,
            value: *value,
        },
        Node::Branch { left, right, .. } => NodeRecord::Branch {
            left: *left,
            right: *right,
        },
        Node::Empty => {
            return Err(StorageError::Serialization(
                "empty nodes are never persisted".into(),
            ))
        }
    };
    bincode::serialize(&record).map_err(|e| StorageError::Serialization(e.to_string()))
}

fn decode_node(hash: NodeRef, bytes: &[u8]) -> Result<Node, StorageError> {
    let record: NodeRecord =
        bincode::deserialize(bytes).map_err(|e| StorageError::Serialization(e.to_string()))?;
    Ok(match record {
        NodeRecord::Leaf { index, value } => Node::Leaf { hash, index, value },
        NodeRecord::Branch { left, right } => Node::Branch { hash, left, right },
    })
}

fn decode_root(bytes: &[u8]) -> Result<NodeRef, StorageError> {
    let bytes: [u8; 32] = bytes
        .try_into()
        .map_err(|_| StorageError::Serialization("invalid root reference length".into()))?;
    Ok(NodeRef::from_bytes(bytes))
}

/// Storage key of the root reference record.
const ROOT_KEY: &[u8] = b"root";

/// Sled-backed storage implementation.
pub struct SledStorage {
    db: sled::Db,
    nodes: sled::Tree,
    meta: sled::Tree,
}

impl SledStorage {
    /// Open or create a sled database at the given path.
    pub fn open(path: &std::path::Path) -> Result<Self, StorageError> {
        let db = sled::open(path).map_err(|e| StorageError::Io(e.to_string()))?;
        Self::from_db(db)
    }

    /// Open a temporary in-memory sled database (for testing).
    pub fn open_temporary() -> Result<Self, StorageError> {
        let config = sled::Config::new().temporary(true);
        let db = config.open().map_err(|e| StorageError::Io(e.to_string()))?;
        Self::from_db(db)
    }

    fn from_db(db: sled::Db) -> Result<Self, StorageError> {
        let nodes = db
            .open_tree("nodes")
            .map_err(|e| StorageError::Io(e.to_string()))?;
        let meta = db
            .open_tree("meta")
            .map_err(|e| StorageError::Io(e.to_string()))?;
        Ok(SledStorage { db, nodes, meta })
    }
}

impl Storage for SledStorage {
    fn get_node(&self, r: &NodeRef) -> Result<Node, StorageError> {
        match self
            .nodes
            .get(r.as_bytes())
            .map_err(|e| StorageError::Io(e.to_string()))?
        {
            Some(bytes) => decode_node(*r, &bytes),
            None => Err(StorageError::NotFound),
        }
    }

    fn get_root_ref(&self) -> Result<NodeRef, StorageError> {
        match self
            .meta
            .get(ROOT_KEY)
            .map_err(|e| StorageError::Io(e.to_string()))?
        {
            Some(bytes) => decode_root(&bytes),
            None => Err(StorageError::NotFound),
        }
    }

    fn upsert_root_ref(&self, r: &NodeRef) -> Result<(), StorageError> {
        self.meta
            .insert(ROOT_KEY, &r.0)
            .map_err(|e| StorageError::Io(e.to_string()))?;
        Ok(())
    }

    fn begin_tx(&self) -> Result<Box<dyn StorageTx + '_>, StorageError> {
        Ok(Box::new(SledTx {
            storage: self,
            nodes: sled::Batch::default(),
            root: None,
        }))
    }
}

/// Buffered transaction over a [`SledStorage`]. Node inserts accumulate in a
/// `sled::Batch`; the root update is applied after the batch at commit.
struct SledTx<'a> {
    storage: &'a SledStorage,
    nodes: sled::Batch,
    root: Option<NodeRef>,
}

impl StorageTx for SledTx<'_> {
    fn insert_node(&mut self, n: &Node) -> Result<(), StorageError> {
        let bytes = encode_node(n)?;
        self.nodes.insert(&n.node_ref().0, bytes);
        Ok(())
    }

    fn upsert_root_ref(&mut self, r: &NodeRef) -> Result<(), StorageError> {
        self.root = Some(*r);
        Ok(())
    }

    fn commit(self: Box<Self>) -> Result<(), StorageError> {
        let SledTx {
            storage,
            nodes,
            root,
        } = *self;
        storage
            .nodes
            .apply_batch(nodes)
            .map_err(|e| StorageError::Io(e.to_string()))?;
        if let Some(root) = root {
            storage
                .meta
                .insert(ROOT_KEY, &root.0)
                .map_err(|e| StorageError::Io(e.to_string()))?;
        }
        storage
            .db
            .flush()
            .map_err(|e| StorageError::Io(e.to_string()))?;
        Ok(())
    }

    fn rollback(self: Box<Self>) -> Result<(), StorageError> {
        Ok(())
    }
}

/// In-memory storage implementation, for tests and ephemeral embeddings.
#[derive(Default)]
pub struct MemoryStorage {
    nodes: RwLock<HashMap<NodeRef, Vec<u8>>>,
    root: RwLock<Option<NodeRef>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of persisted node records.
    pub fn node_count(&self) -> usize {
        self.nodes.read().len()
    }
}

impl Storage for MemoryStorage {
    fn get_node(&self, r: &NodeRef) -> Result<Node, StorageError> {
        match self.nodes.read().get(r) {
            Some(bytes) => decode_node(*r, bytes),
            None => Err(StorageError::NotFound),
        }
    }

    fn get_root_ref(&self) -> Result<NodeRef, StorageError> {
        self.root.read().ok_or(StorageError::NotFound)
    }

    fn upsert_root_ref(&self, r: &NodeRef) -> Result<(), StorageError> {
        *self.root.write() = Some(*r);
        Ok(())
    }

    fn begin_tx(&self) -> Result<Box<dyn StorageTx + '_>, StorageError> {
        Ok(Box::new(MemoryTx {
            storage: self,
            nodes: Vec::new(),
            root: None,
        }))
    }
}

struct MemoryTx<'a> {
    storage: &'a MemoryStorage,
    nodes: Vec<(NodeRef, Vec<u8>)>,
    root: Option<NodeRef>,
}

impl StorageTx for MemoryTx<'_> {
    fn insert_node(&mut self, n: &Node) -> Result<(), StorageError> {
        let bytes = encode_node(n)?;
        self.nodes.push((n.node_ref(), bytes));
        Ok(())
    }

    fn upsert_root_ref(&mut self, r: &NodeRef) -> Result<(), StorageError> {
        self.root = Some(*r);
        Ok(())
    }

    fn commit(self: Box<Self>) -> Result<(), StorageError> {
        let MemoryTx {
            storage,
            nodes,
            root,
        } = *self;
        let mut node_map = storage.nodes.write();
        for (r, bytes) in nodes {
            node_map.insert(r, bytes);
        }
        drop(node_map);
        if let Some(root) = root {
            *storage.root.write() = Some(root);
        }
        Ok(())
    }

    fn rollback(self: Box<Self>) -> Result<(), StorageError> {
        Ok(())
    }
}
