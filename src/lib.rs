//! Embedded temporal-spatial storage and indexing engine with versioned
//! records.
//!
//! ```rust
//! use std::sync::Arc;
//! use chronotope::prelude::*;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let engine = QueryEngine::new(Arc::new(MemoryNodeStore::new()), TemporalSpatialIndex::new());
//!
//! let node = Node::new(
//!     Coordinates::spatial(SpatialPoint::from([1.0, 2.0, 3.0])),
//!     serde_json::json!({"name": "landmark"}),
//! );
//! let id = node.id.clone();
//! engine.insert(node)?;
//!
//! let nearby = SpatialCriteria::nearest(SpatialPoint::from([1.0, 2.0, 3.0]), 10.0)?;
//! let result = engine.execute(&Query::spatial(nearby))?;
//! assert_eq!(result.items[0].id, id);
//! # Ok(())
//! # }
//! ```

pub mod combined_index;
pub mod config;
pub mod coords;
pub mod delta;
pub mod error;
pub mod node;
pub mod persistence;
pub mod query;
pub mod spatial_index;
pub mod store;
pub mod temporal_index;

pub use error::{
    CoreError, DeltaError, QueryError, Result, SpatialIndexError, StoreError, TemporalIndexError,
};

pub use coords::{Coordinates, DistanceMetric, SpatialPoint, TemporalInstant, TemporalPrecision};

pub use node::{Node, NodeMetadata};

pub use config::{EngineConfig, IndexConfig};

pub use store::{MemoryNodeStore, NodeStore, StoreStats};

pub use persistence::AofNodeStore;

pub use spatial_index::{Shape, SpatialIndex, SpatialIndexStats};

pub use temporal_index::{TemporalIndex, TemporalIndexStats};

pub use combined_index::{
    CombinedIndexStats, SpatialCriteria, TemporalCriteria, TemporalSpatialIndex,
};

pub use delta::{
    Delta, DeltaStore, DeltaStoreStats, OptimizeReport, apply_delta, compress_delta,
    compute_delta, decompress_delta,
};

pub use query::{
    EngineStats, Query, QueryEngine, QueryKind, QueryOptions, QueryResult, SortBy, SortOrder,
};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Common imports
pub mod prelude {

    pub use crate::error::{CoreError, Result};

    pub use crate::coords::{
        Coordinates, DistanceMetric, SpatialPoint, TemporalInstant, TemporalPrecision,
    };

    pub use crate::node::Node;

    pub use crate::config::{EngineConfig, IndexConfig};

    pub use crate::store::{MemoryNodeStore, NodeStore};

    pub use crate::persistence::AofNodeStore;

    pub use crate::combined_index::{SpatialCriteria, TemporalCriteria, TemporalSpatialIndex};

    pub use crate::delta::DeltaStore;

    pub use crate::query::{Query, QueryEngine, QueryOptions, SortBy, SortOrder};
}
