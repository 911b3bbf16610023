//! Combined temporal-spatial index.
//!
//! [`TemporalSpatialIndex`] presents a single façade over the spatial and
//! temporal indexes, keeps its own id-to-node table so queries return full
//! objects without a store round-trip, and coordinates bucket tuning and
//! rebuilds. Handles are cheap clones sharing one inner state behind a
//! readers-writer lock; rebuilds construct fresh children off to the side
//! and swap them in under a brief write section, so concurrent readers
//! observe either the old or the new index, never a partial state.

use crate::config::IndexConfig;
use crate::coords::SpatialPoint;
use crate::error::{CoreError, QueryError, Result};
use crate::node::Node;
use crate::spatial_index::{Shape, SpatialIndex, SpatialIndexStats};
use crate::temporal_index::{TemporalIndex, TemporalIndexStats};
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use parking_lot::RwLock;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Cap on nearest-neighbor candidates when the caller gives no limit.
const NN_LIMIT_CAP: usize = 1000;

/// Smallest bucket size auto-tuning will shrink to.
const MIN_BUCKET_MINUTES: u32 = 1;

/// Spatial side of a combined query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpatialCriteria {
    /// Nodes within `max_distance` of `point`, nearest first
    Nearest {
        point: SpatialPoint,
        max_distance: f64,
    },
    /// Nodes inside the axis-aligned region, ordered by id
    Region {
        lower: SpatialPoint,
        upper: SpatialPoint,
    },
}

impl SpatialCriteria {
    /// Nearest-neighbor criteria; rejects non-finite points and negative
    /// or non-finite distances.
    pub fn nearest(point: SpatialPoint, max_distance: f64) -> Result<Self, QueryError> {
        if !point.is_finite() {
            return Err(QueryError::InvalidQuery(
                "nearest criteria point must be finite".into(),
            ));
        }
        if !max_distance.is_finite() || max_distance < 0.0 {
            return Err(QueryError::InvalidQuery(format!(
                "nearest criteria distance must be a non-negative finite number, got {max_distance}"
            )));
        }
        Ok(Self::Nearest {
            point,
            max_distance,
        })
    }

    /// Region criteria; rejects non-finite bounds.
    pub fn region(lower: SpatialPoint, upper: SpatialPoint) -> Result<Self, QueryError> {
        if !lower.is_finite() || !upper.is_finite() {
            return Err(QueryError::InvalidQuery(
                "region criteria bounds must be finite".into(),
            ));
        }
        Ok(Self::Region { lower, upper })
    }
}

/// Temporal side of a combined query: an inclusive time range. Bounds
/// given in the wrong order are swapped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemporalCriteria {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TemporalCriteria {
    pub fn range(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        if start <= end {
            Self { start, end }
        } else {
            Self {
                start: end,
                end: start,
            }
        }
    }

    fn epoch_bounds(&self) -> (f64, f64) {
        let to_epoch = |t: &DateTime<Utc>| {
            t.timestamp() as f64 + t.timestamp_subsec_nanos() as f64 * 1e-9
        };
        (to_epoch(&self.start), to_epoch(&self.end))
    }
}

struct CombinedInner {
    config: IndexConfig,
    spatial: SpatialIndex,
    temporal: TemporalIndex,
    nodes: FxHashMap<String, Node>,
    /// Bumped on every write; lets `rebuild` detect interleaved writers.
    revision: u64,
}

impl CombinedInner {
    fn new(config: IndexConfig) -> Self {
        let spatial = SpatialIndex::with_metric(config.spatial_dimension, config.distance_metric);
        let temporal = TemporalIndex::new(config.temporal_bucket_minutes);
        Self {
            config,
            spatial,
            temporal,
            nodes: FxHashMap::default(),
            revision: 0,
        }
    }
}

#[derive(Default)]
struct Counters {
    inserts: AtomicU64,
    removes: AtomicU64,
    updates: AtomicU64,
    queries: AtomicU64,
    spatial_queries: AtomicU64,
    temporal_queries: AtomicU64,
    combined_queries: AtomicU64,
}

/// Snapshot of combined index statistics.
#[derive(Debug, Clone, Default)]
pub struct CombinedIndexStats {
    pub inserts: u64,
    pub removes: u64,
    pub updates: u64,
    pub queries: u64,
    pub spatial_queries: u64,
    pub temporal_queries: u64,
    pub combined_queries: u64,
    pub spatial_node_count: usize,
    pub temporal_node_count: usize,
    pub total_node_count: usize,
    pub bucket_minutes: u32,
    pub spatial: SpatialIndexStats,
    pub temporal: TemporalIndexStats,
}

/// Combined index façade over the spatial and temporal indexes.
///
/// # Examples
///
/// ```rust
/// use chronotope::combined_index::{SpatialCriteria, TemporalSpatialIndex};
/// use chronotope::{Coordinates, Node, SpatialPoint};
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let index = TemporalSpatialIndex::new();
/// index.insert(Node::with_id(
///     "a",
///     Coordinates::spatial(SpatialPoint::from([1.0, 2.0, 3.0])),
///     serde_json::json!({}),
/// ))?;
///
/// let criteria = SpatialCriteria::nearest(SpatialPoint::from([1.0, 2.0, 3.0]), 10.0)?;
/// let hits = index.query(Some(&criteria), None, None)?;
/// assert_eq!(hits.len(), 1);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct TemporalSpatialIndex {
    inner: Arc<RwLock<CombinedInner>>,
    counters: Arc<Counters>,
}

impl Default for TemporalSpatialIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl TemporalSpatialIndex {
    /// Create an index with the default configuration.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(CombinedInner::new(IndexConfig::default()))),
            counters: Arc::new(Counters::default()),
        }
    }

    /// Create an index from a validated configuration.
    pub fn with_config(config: IndexConfig) -> Result<Self> {
        config.validate().map_err(CoreError::InvalidInput)?;
        info!(
            "created combined index with bucket_size={} minutes, dimension={}",
            config.temporal_bucket_minutes, config.spatial_dimension
        );
        Ok(Self {
            inner: Arc::new(RwLock::new(CombinedInner::new(config))),
            counters: Arc::new(Counters::default()),
        })
    }

    /// Insert a node into every child index its coordinates qualify it
    /// for. Replaces any previous entry with the same id.
    pub fn insert(&self, node: Node) -> Result<()> {
        let mut inner = self.inner.write();
        insert_locked(&mut inner, node)?;
        self.counters.inserts.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Load many nodes at once. Observationally equivalent to iterated
    /// insert; per-node problems are logged and skipped rather than
    /// aborting the batch.
    pub fn bulk_load(&self, nodes: Vec<Node>) {
        let count = nodes.len() as u64;
        let mut inner = self.inner.write();

        let spatial_nodes: Vec<Node> = nodes
            .iter()
            .filter(|n| n.spatial().is_some())
            .cloned()
            .collect();
        inner.spatial.bulk_load(&spatial_nodes);

        for node in &nodes {
            if let Some(instant) = node.temporal() {
                let epoch = instant.epoch_seconds();
                inner.temporal.insert(&node.id, epoch);
            }
        }
        for node in nodes {
            inner.nodes.insert(node.id.clone(), node);
        }
        inner.revision += 1;

        self.counters.inserts.fetch_add(count, Ordering::Relaxed);
        info!("bulk loaded {count} nodes into combined index");
    }

    /// Remove a node from both children and the node table.
    pub fn remove(&self, id: &str) -> bool {
        let mut inner = self.inner.write();
        if !inner.nodes.contains_key(id) {
            return false;
        }
        inner.spatial.remove(id);
        inner.temporal.remove(id);
        inner.nodes.remove(id);
        inner.revision += 1;
        self.counters.removes.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Replace a node's entries, equivalent to remove-then-insert.
    pub fn update(&self, node: Node) -> Result<()> {
        let mut inner = self.inner.write();
        // Validate before touching anything so a rejected node leaves the
        // index unchanged.
        if let Some(point) = node.spatial() {
            if !point.is_finite() {
                return Err(crate::error::SpatialIndexError::NonFiniteCoordinate(
                    node.id.clone(),
                )
                .into());
            }
        }
        let id = node.id.clone();
        inner.spatial.remove(&id);
        inner.temporal.remove(&id);
        inner.nodes.remove(&id);
        insert_locked(&mut inner, node)?;
        self.counters.updates.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Fetch a node by id from the in-memory table.
    pub fn get(&self, id: &str) -> Option<Node> {
        self.inner.read().nodes.get(id).cloned()
    }

    /// Number of nodes in the table.
    pub fn len(&self) -> usize {
        self.inner.read().nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().nodes.is_empty()
    }

    /// Drop every node from the table and both children.
    pub fn clear(&self) {
        let mut inner = self.inner.write();
        inner.spatial.clear();
        inner.temporal.clear();
        inner.nodes.clear();
        inner.revision += 1;
    }

    /// Current temporal bucket granularity in minutes.
    pub fn bucket_minutes(&self) -> u32 {
        self.inner.read().config.temporal_bucket_minutes
    }

    /// Query with optional spatial and temporal criteria.
    ///
    /// With both sides present the result is the intersection of the two
    /// id sets; ordering follows the spatial side when present (distance
    /// for nearest, id for region), otherwise ascending timestamp. `limit`
    /// truncates after the intersection.
    pub fn query(
        &self,
        spatial: Option<&SpatialCriteria>,
        temporal: Option<&TemporalCriteria>,
        limit: Option<usize>,
    ) -> Result<Vec<Node>> {
        self.counters.queries.fetch_add(1, Ordering::Relaxed);
        match (spatial.is_some(), temporal.is_some()) {
            (true, true) => self.counters.combined_queries.fetch_add(1, Ordering::Relaxed),
            (true, false) => self.counters.spatial_queries.fetch_add(1, Ordering::Relaxed),
            (false, true) => self.counters.temporal_queries.fetch_add(1, Ordering::Relaxed),
            (false, false) => 0,
        };

        let result = {
            let inner = self.inner.read();

            let spatial_ids = match spatial {
                Some(criteria) => Some(spatial_ids_locked(&inner, criteria, limit)),
                None => None,
            };
            let temporal_ids = match temporal {
                Some(criteria) => Some(temporal_ids_locked(&inner, criteria)),
                None => None,
            };

            let ordered_ids = match (spatial_ids, temporal_ids) {
                (Some(spatial), Some(temporal)) => {
                    let allowed: FxHashSet<&String> = temporal.iter().collect();
                    spatial
                        .iter()
                        .filter(|id| allowed.contains(id))
                        .cloned()
                        .collect()
                }
                (Some(spatial), None) => spatial,
                (None, Some(temporal)) => temporal,
                (None, None) => Vec::new(),
            };

            let mut nodes: Vec<Node> = ordered_ids
                .into_iter()
                .filter_map(|id| inner.nodes.get(&id).cloned())
                .collect();
            if let Some(limit) = limit {
                nodes.truncate(limit);
            }
            nodes
        };

        debug!("combined query returned {} nodes", result.len());
        self.maybe_tune();
        Ok(result)
    }

    /// Time-series query: group nodes in `[start, end]` into
    /// `interval_seconds`-wide slots, optionally keeping only ids that
    /// also satisfy a spatial query. Nodes in each slot are ordered by
    /// timestamp, then id.
    pub fn query_time_series(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        interval_seconds: f64,
        spatial: Option<&SpatialCriteria>,
    ) -> Result<BTreeMap<i64, Vec<Node>>> {
        self.counters.queries.fetch_add(1, Ordering::Relaxed);

        let range = TemporalCriteria::range(start, end);
        let (start_epoch, end_epoch) = range.epoch_bounds();

        let result = {
            let inner = self.inner.read();
            let mut slots = inner
                .temporal
                .query_time_series(start_epoch, end_epoch, interval_seconds)
                .map_err(CoreError::from)?;

            if let Some(criteria) = spatial {
                let allowed: FxHashSet<String> =
                    spatial_ids_locked(&inner, criteria, None).into_iter().collect();
                slots.retain(|_, ids| {
                    ids.retain(|id| allowed.contains(id));
                    !ids.is_empty()
                });
            }

            let mut materialized = BTreeMap::new();
            for (slot, ids) in slots {
                let mut nodes: Vec<Node> = ids
                    .into_iter()
                    .filter_map(|id| inner.nodes.get(&id).cloned())
                    .collect();
                nodes.sort_by(|a, b| {
                    let ta = a.temporal().map(|t| t.epoch_seconds()).unwrap_or(0.0);
                    let tb = b.temporal().map(|t| t.epoch_seconds()).unwrap_or(0.0);
                    ta.partial_cmp(&tb)
                        .unwrap_or(std::cmp::Ordering::Equal)
                        .then_with(|| a.id.cmp(&b.id))
                });
                if !nodes.is_empty() {
                    materialized.insert(slot, nodes);
                }
            }
            materialized
        };

        self.maybe_tune();
        Ok(result)
    }

    /// Nearest-neighbor pass-through to the spatial child.
    pub fn nearest(&self, point: &SpatialPoint, k: usize, max_distance: Option<f64>) -> Vec<Node> {
        self.inner.read().spatial.nearest(point, k, max_distance)
    }

    /// Range pass-through to the spatial child.
    pub fn range_query(&self, lower: &SpatialPoint, upper: &SpatialPoint) -> Vec<Node> {
        self.inner.read().spatial.range_query(lower, upper)
    }

    /// Shape pass-through to the spatial child.
    pub fn shape_query(&self, shape: &Shape) -> Result<Vec<Node>> {
        Ok(self.inner.read().spatial.shape_query(shape)?)
    }

    /// Path pass-through to the spatial child.
    pub fn path_query(&self, path: &[SpatialPoint], radius: f64) -> Vec<Node> {
        self.inner.read().spatial.path_query(path, radius)
    }

    /// Inspect the temporal bucket distribution and shrink the bucket size
    /// when it has degraded. Returns whether a rebucket happened.
    pub fn tune(&self) -> Result<bool> {
        let mut inner = self.inner.write();

        let distribution = inner.temporal.bucket_distribution();
        if distribution.is_empty() {
            return Ok(false);
        }

        let counts: Vec<usize> = distribution.values().copied().collect();
        let avg = counts.iter().sum::<usize>() as f64 / counts.len() as f64;
        let max = counts.iter().copied().max().unwrap_or(0) as f64;

        let imbalanced =
            max > inner.config.tune_imbalance_ratio * avg || avg > inner.config.tune_avg_threshold;
        if !imbalanced {
            return Ok(false);
        }

        let current = inner.config.temporal_bucket_minutes;
        if current <= MIN_BUCKET_MINUTES {
            return Ok(false);
        }
        let next = (current / 2).max(MIN_BUCKET_MINUTES);
        info!("tuning temporal bucket size from {current} to {next} minutes");

        let old_count = inner.temporal.count();
        let mut replacement = TemporalIndex::new(next);
        for (id, ts) in inner.temporal.entries() {
            replacement.insert(id, ts);
        }
        if replacement.count() != old_count {
            return Err(CoreError::IndexInconsistent(format!(
                "temporal rebucket lost entries: {} -> {}",
                old_count,
                replacement.count()
            )));
        }

        inner.temporal = replacement;
        inner.config.temporal_bucket_minutes = next;
        Ok(true)
    }

    /// Rebuild both children from the node table.
    ///
    /// The new children are constructed from a read-locked snapshot off to
    /// the side and swapped in under a brief write section; a write that
    /// lands in between is detected via the table revision and the rebuild
    /// redone against the current table before swapping.
    pub fn rebuild(&self) -> Result<()> {
        let (snapshot, config, revision) = {
            let inner = self.inner.read();
            (
                inner.nodes.values().cloned().collect::<Vec<Node>>(),
                inner.config.clone(),
                inner.revision,
            )
        };

        let (mut spatial, mut temporal) = build_children(&snapshot, &config);

        let mut inner = self.inner.write();
        if inner.revision != revision {
            // A writer slipped in while we were building; redo from the
            // current table under the write lock.
            let current: Vec<Node> = inner.nodes.values().cloned().collect();
            (spatial, temporal) = build_children(&current, &inner.config);
        }

        // Matches the bulk-load admission rule: non-finite points never
        // enter the spatial child.
        let expected_spatial = inner
            .nodes
            .values()
            .filter(|n| n.spatial().is_some_and(|p| p.is_finite()))
            .count();
        let expected_temporal = inner
            .nodes
            .values()
            .filter(|n| n.temporal().is_some())
            .count();
        if spatial.count() != expected_spatial || temporal.count() != expected_temporal {
            return Err(CoreError::IndexInconsistent(format!(
                "rebuild produced {}/{} spatial and {}/{} temporal entries",
                spatial.count(),
                expected_spatial,
                temporal.count(),
                expected_temporal
            )));
        }

        inner.spatial = spatial;
        inner.temporal = temporal;
        info!("rebuilt combined index with {} nodes", inner.nodes.len());
        Ok(())
    }

    /// Snapshot of combined statistics including both children.
    pub fn get_statistics(&self) -> CombinedIndexStats {
        let inner = self.inner.read();
        CombinedIndexStats {
            inserts: self.counters.inserts.load(Ordering::Relaxed),
            removes: self.counters.removes.load(Ordering::Relaxed),
            updates: self.counters.updates.load(Ordering::Relaxed),
            queries: self.counters.queries.load(Ordering::Relaxed),
            spatial_queries: self.counters.spatial_queries.load(Ordering::Relaxed),
            temporal_queries: self.counters.temporal_queries.load(Ordering::Relaxed),
            combined_queries: self.counters.combined_queries.load(Ordering::Relaxed),
            spatial_node_count: inner.spatial.count(),
            temporal_node_count: inner.temporal.count(),
            total_node_count: inner.nodes.len(),
            bucket_minutes: inner.config.temporal_bucket_minutes,
            spatial: inner.spatial.get_statistics(),
            temporal: inner.temporal.get_statistics(),
        }
    }

    fn maybe_tune(&self) {
        let inner = self.inner.read();
        if !inner.config.auto_tuning {
            return;
        }
        let interval = inner.config.tune_check_interval;
        drop(inner);

        let total = self.counters.queries.load(Ordering::Relaxed);
        if total == 0 || total % interval != 0 {
            return;
        }
        if let Err(e) = self.tune() {
            warn!("auto-tuning failed: {e}");
        }
    }
}

fn insert_locked(inner: &mut CombinedInner, node: Node) -> Result<()> {
    if node.spatial().is_some() {
        inner.spatial.insert(&node)?;
    }
    if let Some(instant) = node.temporal() {
        let epoch = instant.epoch_seconds();
        inner.temporal.insert(&node.id, epoch);
    }
    inner.nodes.insert(node.id.clone(), node);
    inner.revision += 1;
    Ok(())
}

/// Ids matching a spatial criteria, in the criteria's natural order.
fn spatial_ids_locked(
    inner: &CombinedInner,
    criteria: &SpatialCriteria,
    limit: Option<usize>,
) -> Vec<String> {
    match criteria {
        SpatialCriteria::Nearest {
            point,
            max_distance,
        } => {
            let k = limit.unwrap_or(NN_LIMIT_CAP);
            inner
                .spatial
                .nearest(point, k, Some(*max_distance))
                .into_iter()
                .map(|n| n.id)
                .collect()
        }
        SpatialCriteria::Region { lower, upper } => inner
            .spatial
            .range_query(lower, upper)
            .into_iter()
            .map(|n| n.id)
            .collect(),
    }
}

/// Ids within a temporal range, ordered by timestamp then id.
fn temporal_ids_locked(inner: &CombinedInner, criteria: &TemporalCriteria) -> Vec<String> {
    let (start, end) = criteria.epoch_bounds();
    let mut ids: Vec<String> = inner.temporal.query_range(start, end).into_iter().collect();
    ids.sort_by(|a, b| {
        let ta = inner.temporal.timestamp_of(a).unwrap_or(0.0);
        let tb = inner.temporal.timestamp_of(b).unwrap_or(0.0);
        ta.partial_cmp(&tb)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.cmp(b))
    });
    ids
}

fn build_children(nodes: &[Node], config: &IndexConfig) -> (SpatialIndex, TemporalIndex) {
    let mut spatial = SpatialIndex::with_metric(config.spatial_dimension, config.distance_metric);
    let spatial_nodes: Vec<Node> = nodes.iter().filter(|n| n.spatial().is_some()).cloned().collect();
    spatial.bulk_load(&spatial_nodes);

    let mut temporal = TemporalIndex::new(config.temporal_bucket_minutes);
    for node in nodes {
        if let Some(instant) = node.temporal() {
            temporal.insert(&node.id, instant.epoch_seconds());
        }
    }
    (spatial, temporal)
}
