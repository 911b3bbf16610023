//! The immutable [`Node`] record.
//!
//! Each node carries a stable id, coordinates in space and/or time, an
//! opaque JSON content payload, versioned metadata, and a set of directed
//! references to other node ids. Nodes never mutate in place; every change
//! produces a new value with the same id, which keeps reads lock-free once
//! a reference has been obtained.

use crate::coords::{Coordinates, SpatialPoint, TemporalInstant};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

/// Versioning and housekeeping metadata attached to every node.
///
/// `extra` holds caller-defined entries; the named fields are housekeeping
/// and are excluded from delta computation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeMetadata {
    /// Monotonic version counter, starting at 1 and strictly increasing on
    /// each accepted update for the same id.
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_by: Option<String>,
    /// Caller-defined metadata entries.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, Value>,
}

impl NodeMetadata {
    fn initial(at: DateTime<Utc>) -> Self {
        Self {
            version: 1,
            created_at: at,
            updated_at: at,
            updated_by: None,
            extra: BTreeMap::new(),
        }
    }
}

/// An immutable versioned record located in space and/or time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Opaque globally-unique id, stable across all versions.
    pub id: String,
    pub coordinates: Coordinates,
    /// Opaque JSON-like payload.
    pub content: Value,
    pub metadata: NodeMetadata,
    /// Ids of other nodes this node references. Edge semantics are
    /// caller-defined; resolution is always by id lookup, so cycles are
    /// harmless.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub references: BTreeSet<String>,
}

impl Node {
    /// Create a version-1 node with a generated v4 uuid id.
    pub fn new(coordinates: Coordinates, content: Value) -> Self {
        Self::with_id(Uuid::new_v4().to_string(), coordinates, content)
    }

    /// Create a version-1 node with an explicit id.
    pub fn with_id(id: impl Into<String>, coordinates: Coordinates, content: Value) -> Self {
        Self {
            id: id.into(),
            coordinates,
            content,
            metadata: NodeMetadata::initial(Utc::now()),
            references: BTreeSet::new(),
        }
    }

    /// Current version number.
    pub fn version(&self) -> u64 {
        self.metadata.version
    }

    /// Spatial component, if any.
    pub fn spatial(&self) -> Option<&SpatialPoint> {
        self.coordinates.spatial.as_ref()
    }

    /// Temporal component, if any.
    pub fn temporal(&self) -> Option<&TemporalInstant> {
        self.coordinates.temporal.as_ref()
    }

    /// Hybrid coordinate distance to another node.
    pub fn distance_to(&self, other: &Node) -> f64 {
        self.coordinates.distance_to(&other.coordinates)
    }

    /// Copy with replaced content.
    pub fn with_content(mut self, content: Value) -> Self {
        self.content = content;
        self
    }

    /// Copy with replaced coordinates.
    pub fn with_coordinates(mut self, coordinates: Coordinates) -> Self {
        self.coordinates = coordinates;
        self
    }

    /// Copy with an additional reference.
    pub fn with_reference(mut self, id: impl Into<String>) -> Self {
        self.references.insert(id.into());
        self
    }

    /// Copy with a reference removed; a no-op when absent.
    pub fn without_reference(mut self, id: &str) -> Self {
        self.references.remove(id);
        self
    }

    /// Copy with a caller-defined metadata entry set.
    pub fn with_metadata_entry(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.extra.insert(key.into(), value);
        self
    }

    /// Copy with a caller-defined metadata entry removed.
    pub fn without_metadata_entry(mut self, key: &str) -> Self {
        self.metadata.extra.remove(key);
        self
    }

    /// Copy attributing the next update.
    pub fn with_updated_by(mut self, actor: impl Into<String>) -> Self {
        self.metadata.updated_by = Some(actor.into());
        self
    }

    /// Copy stamped as an explicit version at an explicit update time. Used
    /// by the write path when synthesizing the next version of a node.
    pub fn into_version(mut self, version: u64, at: DateTime<Utc>) -> Self {
        self.metadata.version = version;
        self.metadata.updated_at = at;
        self
    }
}
