//! Node store abstraction.
//!
//! The indexes own no data; they hold references to current node versions
//! materialized from a [`NodeStore`]. Implementations provide keyed
//! persistence with a uniform contract and may be in-memory
//! ([`MemoryNodeStore`]) or disk-backed
//! ([`AofNodeStore`](crate::persistence::AofNodeStore)).

use crate::error::StoreError;
use crate::node::Node;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;

/// Trait for node store implementations.
///
/// Every operation is atomic under the implementation's internal lock, so
/// stores are shared freely as `Arc<dyn NodeStore>`. `all()` returns a
/// snapshot taken under the lock; it never observes partial writes.
pub trait NodeStore: Send + Sync {
    /// Fetch a node by id.
    fn get(&self, id: &str) -> Result<Option<Node>, StoreError>;

    /// Insert or replace the node stored under its id.
    fn put(&self, node: &Node) -> Result<(), StoreError>;

    /// Delete a node, reporting whether it existed.
    fn delete(&self, id: &str) -> Result<bool, StoreError>;

    /// Snapshot of every stored node, sorted by id.
    fn all(&self) -> Result<Vec<Node>, StoreError>;

    /// Number of stored nodes.
    fn len(&self) -> Result<usize, StoreError>;

    /// Whether the store holds no nodes.
    fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.len()? == 0)
    }

    /// Flush and reject further operations.
    fn close(&self) -> Result<(), StoreError>;

    /// Store statistics.
    fn stats(&self) -> Result<StoreStats, StoreError>;
}

/// Node store statistics.
#[derive(Debug, Clone, Default)]
pub struct StoreStats {
    /// Number of stored nodes
    pub node_count: usize,
    /// Total operations performed
    pub operations_count: u64,
}

struct MemoryInner {
    nodes: FxHashMap<String, Node>,
    operations: u64,
    closed: bool,
}

/// In-memory node store backed by a hash table under a readers-writer lock.
pub struct MemoryNodeStore {
    inner: RwLock<MemoryInner>,
}

impl MemoryNodeStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(MemoryInner {
                nodes: FxHashMap::default(),
                operations: 0,
                closed: false,
            }),
        }
    }
}

impl Default for MemoryNodeStore {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeStore for MemoryNodeStore {
    fn get(&self, id: &str) -> Result<Option<Node>, StoreError> {
        let inner = self.inner.read();
        if inner.closed {
            return Err(StoreError::Closed);
        }
        Ok(inner.nodes.get(id).cloned())
    }

    fn put(&self, node: &Node) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        if inner.closed {
            return Err(StoreError::Closed);
        }
        inner.nodes.insert(node.id.clone(), node.clone());
        inner.operations += 1;
        Ok(())
    }

    fn delete(&self, id: &str) -> Result<bool, StoreError> {
        let mut inner = self.inner.write();
        if inner.closed {
            return Err(StoreError::Closed);
        }
        let removed = inner.nodes.remove(id).is_some();
        inner.operations += 1;
        Ok(removed)
    }

    fn all(&self) -> Result<Vec<Node>, StoreError> {
        let inner = self.inner.read();
        if inner.closed {
            return Err(StoreError::Closed);
        }
        let mut nodes: Vec<Node> = inner.nodes.values().cloned().collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(nodes)
    }

    fn len(&self) -> Result<usize, StoreError> {
        let inner = self.inner.read();
        if inner.closed {
            return Err(StoreError::Closed);
        }
        Ok(inner.nodes.len())
    }

    fn close(&self) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        if inner.closed {
            return Err(StoreError::Closed);
        }
        inner.closed = true;
        Ok(())
    }

    fn stats(&self) -> Result<StoreStats, StoreError> {
        let inner = self.inner.read();
        if inner.closed {
            return Err(StoreError::Closed);
        }
        Ok(StoreStats {
            node_count: inner.nodes.len(),
            operations_count: inner.operations,
        })
    }
}
