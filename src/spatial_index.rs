//! Spatial index over node coordinates.
//!
//! The authoritative structure is an id-keyed entry map holding each
//! node's point resized to the index dimension. A planar R*-tree over the
//! first two dimensions serves as a candidate generator for range, circle,
//! polygon, and path queries; every candidate is re-checked against the
//! full-dimension point, so answers are identical to an exhaustive scan.
//!
//! Nearest-neighbor results for small `k` are kept in a bounded LRU cache
//! keyed by the query point and `k`; any write clears the entire cache so
//! stale hits are impossible.

use crate::coords::{DistanceMetric, SpatialPoint};
use crate::error::SpatialIndexError;
use crate::node::Node;
use geo::{BoundingRect, Contains, LineString, Polygon};
use log::{debug, info, warn};
use parking_lot::Mutex;
use rstar::{AABB, Point as RstarPoint, RTree};
use rustc_hash::{FxHashMap, FxHashSet};
use smallvec::SmallVec;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

/// Maximum number of cached nearest-neighbor result lists.
const NN_CACHE_CAPACITY: usize = 128;

/// Queries with `k` above this are never cached.
const NN_CACHEABLE_K: usize = 10;

/// A point in the planar accelerator tree. Carries the node id so tree
/// hits resolve back to the authoritative entry map.
#[derive(Debug, Clone, PartialEq)]
struct PlanarEntry {
    x: f64,
    y: f64,
    id: String,
}

impl RstarPoint for PlanarEntry {
    type Scalar = f64;
    const DIMENSIONS: usize = 2;

    fn generate(mut generator: impl FnMut(usize) -> Self::Scalar) -> Self {
        Self {
            x: generator(0),
            y: generator(1),
            id: String::new(),
        }
    }

    fn nth(&self, index: usize) -> Self::Scalar {
        match index {
            0 => self.x,
            1 => self.y,
            _ => unreachable!(),
        }
    }

    fn nth_mut(&mut self, index: usize) -> &mut Self::Scalar {
        match index {
            0 => &mut self.x,
            1 => &mut self.y,
            _ => unreachable!(),
        }
    }
}

/// A geometric query shape.
///
/// Rectangle and circle operate in the full index dimensionality; polygon
/// inclusion is tested on the first two dimensions.
#[derive(Debug, Clone, PartialEq)]
pub enum Shape {
    /// Axis-aligned rectangle, equivalent to a range query
    Rectangle {
        lower: SpatialPoint,
        upper: SpatialPoint,
    },
    /// All points within `radius` of `center` under the index metric
    Circle { center: SpatialPoint, radius: f64 },
    /// Planar polygon over the first two dimensions; at least 3 vertices
    Polygon { vertices: Vec<(f64, f64)> },
}

struct SpatialEntry {
    point: SpatialPoint,
    node: Node,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    bits: SmallVec<[u64; 4]>,
    k: usize,
}

impl CacheKey {
    fn new(point: &SpatialPoint, k: usize) -> Self {
        Self {
            bits: point.dimensions().iter().map(|d| d.to_bits()).collect(),
            k,
        }
    }
}

/// Bounded LRU map of nearest-neighbor results.
struct NnCache {
    map: FxHashMap<CacheKey, Vec<(f64, Node)>>,
    order: VecDeque<CacheKey>,
}

impl NnCache {
    fn new() -> Self {
        Self {
            map: FxHashMap::default(),
            order: VecDeque::new(),
        }
    }

    fn get(&mut self, key: &CacheKey) -> Option<Vec<(f64, Node)>> {
        let hit = self.map.get(key).cloned();
        if hit.is_some() {
            self.order.retain(|k| k != key);
            self.order.push_back(key.clone());
        }
        hit
    }

    fn insert(&mut self, key: CacheKey, value: Vec<(f64, Node)>) {
        if self.map.insert(key.clone(), value).is_none() {
            self.order.push_back(key);
        }
        while self.map.len() > NN_CACHE_CAPACITY {
            if let Some(oldest) = self.order.pop_front() {
                self.map.remove(&oldest);
            } else {
                break;
            }
        }
    }

    fn clear(&mut self) {
        self.map.clear();
        self.order.clear();
    }

    fn len(&self) -> usize {
        self.map.len()
    }
}

#[derive(Default)]
struct Counters {
    inserts: AtomicU64,
    deletes: AtomicU64,
    updates: AtomicU64,
    queries: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
}

/// Snapshot of spatial index statistics.
#[derive(Debug, Clone, Default)]
pub struct SpatialIndexStats {
    pub inserts: u64,
    pub deletes: u64,
    pub updates: u64,
    pub queries: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub node_count: usize,
    pub dimension: usize,
    pub cache_size: usize,
}

/// Point index over node spatial coordinates, keyed by node id.
///
/// # Examples
///
/// ```rust
/// use chronotope::spatial_index::SpatialIndex;
/// use chronotope::{Coordinates, Node, SpatialPoint};
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let mut index = SpatialIndex::new(3);
///
/// let node = Node::with_id(
///     "a",
///     Coordinates::spatial(SpatialPoint::from([1.0, 2.0, 3.0])),
///     serde_json::json!({}),
/// );
/// index.insert(&node)?;
///
/// let nearest = index.nearest(&SpatialPoint::from([1.0, 2.0, 3.0]), 1, None);
/// assert_eq!(nearest[0].id, "a");
/// # Ok(())
/// # }
/// ```
pub struct SpatialIndex {
    dimension: usize,
    metric: DistanceMetric,
    entries: FxHashMap<String, SpatialEntry>,
    planar: RTree<PlanarEntry>,
    cache: Mutex<NnCache>,
    counters: Counters,
}

impl SpatialIndex {
    /// Create an index of the given dimensionality with the Euclidean
    /// metric.
    ///
    /// # Panics
    ///
    /// Panics if `dimension` is zero.
    pub fn new(dimension: usize) -> Self {
        Self::with_metric(dimension, DistanceMetric::default())
    }

    /// Create an index with an explicit distance metric.
    pub fn with_metric(dimension: usize, metric: DistanceMetric) -> Self {
        assert!(dimension >= 1, "Spatial dimension must be at least 1");
        info!("created spatial index with dimension={dimension}, metric={metric:?}");
        Self {
            dimension,
            metric,
            entries: FxHashMap::default(),
            planar: RTree::new(),
            cache: Mutex::new(NnCache::new()),
            counters: Counters::default(),
        }
    }

    /// Index dimensionality.
    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Configured distance metric.
    pub fn metric(&self) -> DistanceMetric {
        self.metric
    }

    /// Insert a node, replacing any previous entry for the same id.
    pub fn insert(&mut self, node: &Node) -> Result<(), SpatialIndexError> {
        let Some(point) = node.spatial() else {
            return Err(SpatialIndexError::MissingSpatialCoordinate(node.id.clone()));
        };
        if !point.is_finite() {
            return Err(SpatialIndexError::NonFiniteCoordinate(node.id.clone()));
        }

        let point = point.resized(self.dimension);
        if let Some(old) = self.entries.remove(&node.id) {
            self.planar.remove(&planar_entry(&node.id, &old.point));
        }
        self.planar.insert(planar_entry(&node.id, &point));
        self.entries.insert(
            node.id.clone(),
            SpatialEntry {
                point,
                node: node.clone(),
            },
        );

        self.counters.inserts.fetch_add(1, Ordering::Relaxed);
        self.cache.lock().clear();
        Ok(())
    }

    /// Load many nodes at once. Nodes without spatial coordinates or with
    /// non-finite coordinates are skipped with a warning; the batch is
    /// never aborted. The planar tree is rebuilt in one bulk pass.
    pub fn bulk_load(&mut self, nodes: &[Node]) {
        if nodes.is_empty() {
            return;
        }

        let mut accepted = 0u64;
        for node in nodes {
            let Some(point) = node.spatial() else {
                warn!("skipping node {} without spatial coordinates", node.id);
                continue;
            };
            if !point.is_finite() {
                warn!("skipping node {} with non-finite coordinates", node.id);
                continue;
            }
            self.entries.insert(
                node.id.clone(),
                SpatialEntry {
                    point: point.resized(self.dimension),
                    node: node.clone(),
                },
            );
            accepted += 1;
        }

        let planar_entries: Vec<PlanarEntry> = self
            .entries
            .iter()
            .map(|(id, entry)| planar_entry(id, &entry.point))
            .collect();
        self.planar = RTree::bulk_load(planar_entries);

        self.counters.inserts.fetch_add(accepted, Ordering::Relaxed);
        self.cache.lock().clear();
        info!("bulk loaded {accepted} nodes into the spatial index");
    }

    /// Remove a node, reporting whether it was present.
    pub fn remove(&mut self, id: &str) -> bool {
        let Some(entry) = self.entries.remove(id) else {
            return false;
        };
        self.planar.remove(&planar_entry(id, &entry.point));
        self.counters.deletes.fetch_add(1, Ordering::Relaxed);
        self.cache.lock().clear();
        true
    }

    /// Replace a node's entry, equivalent to remove-then-insert.
    pub fn update(&mut self, node: &Node) -> Result<(), SpatialIndexError> {
        self.remove(&node.id);
        self.insert(node)?;
        self.counters.updates.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Drop every entry and reset the statistics.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.planar = RTree::new();
        self.cache.lock().clear();
        self.counters = Counters::default();
        info!("cleared spatial index");
    }

    /// Number of indexed nodes.
    pub fn count(&self) -> usize {
        self.entries.len()
    }

    /// All indexed nodes, sorted by id.
    pub fn get_all(&self) -> Vec<Node> {
        let mut nodes: Vec<Node> = self.entries.values().map(|e| e.node.clone()).collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        nodes
    }

    /// Up to `k` nodes sorted ascending by distance to `point`, ties broken
    /// by id. With `max_distance`, candidates beyond it are excluded.
    pub fn nearest(&self, point: &SpatialPoint, k: usize, max_distance: Option<f64>) -> Vec<Node> {
        self.counters.queries.fetch_add(1, Ordering::Relaxed);

        let query = point.resized(self.dimension);
        let cacheable = k <= NN_CACHEABLE_K && max_distance.is_none();
        let key = CacheKey::new(&query, k);

        if cacheable {
            if let Some(cached) = self.cache.lock().get(&key) {
                self.counters.cache_hits.fetch_add(1, Ordering::Relaxed);
                return cached.into_iter().map(|(_, node)| node).collect();
            }
            self.counters.cache_misses.fetch_add(1, Ordering::Relaxed);
        }

        let mut candidates = self.distances_to(&query, max_distance);
        sort_by_distance_then_id(&mut candidates);
        candidates.truncate(k);

        let result: Vec<Node> = candidates.iter().map(|(_, node)| node.clone()).collect();
        if cacheable {
            self.cache.lock().insert(key, candidates);
        }
        result
    }

    /// Lazy nearest-neighbor traversal yielding `(distance, node)` in
    /// non-decreasing distance order. The candidate set is snapshotted up
    /// front, so no index lock is held while the caller iterates.
    pub fn incremental_nearest(
        &self,
        point: &SpatialPoint,
        max_results: Option<usize>,
        max_distance: Option<f64>,
    ) -> std::vec::IntoIter<(f64, Node)> {
        self.counters.queries.fetch_add(1, Ordering::Relaxed);

        let query = point.resized(self.dimension);
        let mut candidates = self.distances_to(&query, max_distance);
        sort_by_distance_then_id(&mut candidates);
        if let Some(limit) = max_results {
            candidates.truncate(limit);
        }
        candidates.into_iter()
    }

    /// All nodes whose coordinates satisfy `lower[i] <= dim[i] <= upper[i]`
    /// in every dimension, sorted by id. Bounds are resized to the index
    /// dimension like query points.
    pub fn range_query(&self, lower: &SpatialPoint, upper: &SpatialPoint) -> Vec<Node> {
        self.counters.queries.fetch_add(1, Ordering::Relaxed);

        let lower = lower.resized(self.dimension);
        let upper = upper.resized(self.dimension);
        if (0..self.dimension).any(|i| lower.get(i) > upper.get(i)) {
            return Vec::new();
        }

        let envelope = AABB::from_corners(
            PlanarEntry {
                x: lower.get(0),
                y: lower.get(1),
                id: String::new(),
            },
            PlanarEntry {
                x: upper.get(0),
                y: upper.get(1),
                id: String::new(),
            },
        );

        let mut result: Vec<Node> = self
            .planar
            .locate_in_envelope(&envelope)
            .filter_map(|hit| {
                let entry = self.entries.get(&hit.id)?;
                let inside = (2..self.dimension)
                    .all(|i| lower.get(i) <= entry.point.get(i) && entry.point.get(i) <= upper.get(i));
                inside.then(|| entry.node.clone())
            })
            .collect();

        result.sort_by(|a, b| a.id.cmp(&b.id));
        debug!("range query returned {} nodes", result.len());
        result
    }

    /// All nodes within or on a query shape, sorted by id.
    pub fn shape_query(&self, shape: &Shape) -> Result<Vec<Node>, SpatialIndexError> {
        match shape {
            Shape::Rectangle { lower, upper } => Ok(self.range_query(lower, upper)),
            Shape::Circle { center, radius } => Ok(self.circle_query(center, *radius)),
            Shape::Polygon { vertices } => self.polygon_query(vertices),
        }
    }

    /// All nodes whose first two dimensions lie within `radius` of any
    /// segment of the polyline, sorted by id. A path with fewer than two
    /// points has no segments and yields nothing.
    pub fn path_query(&self, path: &[SpatialPoint], radius: f64) -> Vec<Node> {
        self.counters.queries.fetch_add(1, Ordering::Relaxed);

        if path.len() < 2 || !radius.is_finite() || radius < 0.0 {
            return Vec::new();
        }

        let mut matched: FxHashSet<&str> = FxHashSet::default();
        for segment in path.windows(2) {
            let (v, w) = (
                (segment[0].get(0), segment[0].get(1)),
                (segment[1].get(0), segment[1].get(1)),
            );
            let envelope = AABB::from_corners(
                PlanarEntry {
                    x: v.0.min(w.0) - radius,
                    y: v.1.min(w.1) - radius,
                    id: String::new(),
                },
                PlanarEntry {
                    x: v.0.max(w.0) + radius,
                    y: v.1.max(w.1) + radius,
                    id: String::new(),
                },
            );

            for hit in self.planar.locate_in_envelope(&envelope) {
                if matched.contains(hit.id.as_str()) {
                    continue;
                }
                if point_to_segment_distance((hit.x, hit.y), v, w) <= radius {
                    if let Some((id, _)) = self.entries.get_key_value(&hit.id) {
                        matched.insert(id.as_str());
                    }
                }
            }
        }

        let mut result: Vec<Node> = matched
            .into_iter()
            .filter_map(|id| self.entries.get(id).map(|e| e.node.clone()))
            .collect();
        result.sort_by(|a, b| a.id.cmp(&b.id));
        result
    }

    /// Snapshot of index statistics.
    pub fn get_statistics(&self) -> SpatialIndexStats {
        SpatialIndexStats {
            inserts: self.counters.inserts.load(Ordering::Relaxed),
            deletes: self.counters.deletes.load(Ordering::Relaxed),
            updates: self.counters.updates.load(Ordering::Relaxed),
            queries: self.counters.queries.load(Ordering::Relaxed),
            cache_hits: self.counters.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.counters.cache_misses.load(Ordering::Relaxed),
            node_count: self.entries.len(),
            dimension: self.dimension,
            cache_size: self.cache.lock().len(),
        }
    }

    fn circle_query(&self, center: &SpatialPoint, radius: f64) -> Vec<Node> {
        self.counters.queries.fetch_add(1, Ordering::Relaxed);

        if !radius.is_finite() || radius < 0.0 {
            return Vec::new();
        }

        let center = center.resized(self.dimension);
        let mut result: Vec<Node> = self
            .candidates_within(&center, radius)
            .into_iter()
            .filter_map(|id| {
                let entry = self.entries.get(id)?;
                let distance = self
                    .metric
                    .distance(center.dimensions(), entry.point.dimensions());
                (distance <= radius).then(|| entry.node.clone())
            })
            .collect();

        result.sort_by(|a, b| a.id.cmp(&b.id));
        result
    }

    fn polygon_query(&self, vertices: &[(f64, f64)]) -> Result<Vec<Node>, SpatialIndexError> {
        self.counters.queries.fetch_add(1, Ordering::Relaxed);

        if vertices.len() < 3 {
            return Err(SpatialIndexError::InvalidShape(format!(
                "polygon requires at least 3 vertices, got {}",
                vertices.len()
            )));
        }

        let polygon = Polygon::new(LineString::from(vertices.to_vec()), vec![]);
        let Some(bbox) = polygon.bounding_rect() else {
            return Ok(Vec::new());
        };

        let envelope = AABB::from_corners(
            PlanarEntry {
                x: bbox.min().x,
                y: bbox.min().y,
                id: String::new(),
            },
            PlanarEntry {
                x: bbox.max().x,
                y: bbox.max().y,
                id: String::new(),
            },
        );

        let mut result: Vec<Node> = self
            .planar
            .locate_in_envelope(&envelope)
            .filter_map(|hit| {
                let entry = self.entries.get(&hit.id)?;
                polygon
                    .contains(&geo::Point::new(hit.x, hit.y))
                    .then(|| entry.node.clone())
            })
            .collect();

        result.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(result)
    }

    /// Distances from `query` to every entry, optionally bounded. With a
    /// bound, the planar tree prunes candidates first; each dimension of a
    /// within-distance point differs by at most the bound under all three
    /// metrics, so the envelope never excludes a true match.
    fn distances_to(&self, query: &SpatialPoint, max_distance: Option<f64>) -> Vec<(f64, Node)> {
        match max_distance {
            Some(bound) if bound.is_finite() && bound >= 0.0 => self
                .candidates_within(query, bound)
                .into_iter()
                .filter_map(|id| {
                    let entry = self.entries.get(id)?;
                    let distance = self
                        .metric
                        .distance(query.dimensions(), entry.point.dimensions());
                    (distance <= bound).then(|| (distance, entry.node.clone()))
                })
                .collect(),
            Some(_) => Vec::new(),
            None => self
                .entries
                .values()
                .map(|entry| {
                    let distance = self
                        .metric
                        .distance(query.dimensions(), entry.point.dimensions());
                    (distance, entry.node.clone())
                })
                .collect(),
        }
    }

    fn candidates_within(&self, center: &SpatialPoint, radius: f64) -> Vec<&String> {
        let envelope = AABB::from_corners(
            PlanarEntry {
                x: center.get(0) - radius,
                y: center.get(1) - radius,
                id: String::new(),
            },
            PlanarEntry {
                x: center.get(0) + radius,
                y: center.get(1) + radius,
                id: String::new(),
            },
        );
        self.planar
            .locate_in_envelope(&envelope)
            .filter_map(|hit| self.entries.get_key_value(&hit.id).map(|(id, _)| id))
            .collect()
    }
}

fn planar_entry(id: &str, point: &SpatialPoint) -> PlanarEntry {
    PlanarEntry {
        x: point.get(0),
        y: point.get(1),
        id: id.to_string(),
    }
}

fn sort_by_distance_then_id(candidates: &mut [(f64, Node)]) {
    candidates.sort_by(|a, b| {
        a.0.partial_cmp(&b.0)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.1.id.cmp(&b.1.id))
    });
}

/// Distance from a point to a line segment in the plane.
fn point_to_segment_distance(p: (f64, f64), v: (f64, f64), w: (f64, f64)) -> f64 {
    let length_sq = (v.0 - w.0).powi(2) + (v.1 - w.1).powi(2);
    if length_sq == 0.0 {
        return ((p.0 - v.0).powi(2) + (p.1 - v.1).powi(2)).sqrt();
    }

    let t = (((p.0 - v.0) * (w.0 - v.0) + (p.1 - v.1) * (w.1 - v.1)) / length_sq).clamp(0.0, 1.0);
    let projection = (v.0 + t * (w.0 - v.0), v.1 + t * (w.1 - v.1));
    ((p.0 - projection.0).powi(2) + (p.1 - projection.1).powi(2)).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coords::Coordinates;
    use serde_json::json;

    fn node(id: &str, dims: &[f64]) -> Node {
        Node::with_id(
            id,
            Coordinates::spatial(SpatialPoint::from(dims)),
            json!({}),
        )
    }

    fn grid_index() -> SpatialIndex {
        // 5x5 integer grid at z=0
        let mut index = SpatialIndex::new(3);
        for x in 0..5 {
            for y in 0..5 {
                index
                    .insert(&node(&format!("n{x}{y}"), &[x as f64, y as f64, 0.0]))
                    .unwrap();
            }
        }
        index
    }

    #[test]
    fn insert_requires_spatial_coordinates() {
        let mut index = SpatialIndex::new(3);
        let temporal_only = Node::with_id(
            "t",
            Coordinates::temporal(crate::coords::TemporalInstant::from_epoch_seconds(0.0)),
            json!({}),
        );
        assert!(matches!(
            index.insert(&temporal_only),
            Err(SpatialIndexError::MissingSpatialCoordinate(_))
        ));
    }

    #[test]
    fn insert_rejects_non_finite_coordinates() {
        let mut index = SpatialIndex::new(2);
        assert!(matches!(
            index.insert(&node("bad", &[1.0, f64::NAN])),
            Err(SpatialIndexError::NonFiniteCoordinate(_))
        ));
        assert_eq!(index.count(), 0);
    }

    #[test]
    fn reinsert_replaces_prior_point() {
        let mut index = SpatialIndex::new(2);
        index.insert(&node("a", &[0.0, 0.0])).unwrap();
        index.insert(&node("a", &[10.0, 10.0])).unwrap();

        assert_eq!(index.count(), 1);
        let nearest = index.nearest(&SpatialPoint::from([10.0, 10.0]), 1, None);
        assert_eq!(nearest[0].spatial().unwrap().get(0), 10.0);
    }

    #[test]
    fn nearest_on_grid() {
        let index = grid_index();
        let result = index.nearest(&SpatialPoint::from([2.5, 2.5, 0.0]), 4, None);

        let mut ids: Vec<&str> = result.iter().map(|n| n.id.as_str()).collect();
        ids.sort();
        assert_eq!(ids, vec!["n22", "n23", "n32", "n33"]);
    }

    #[test]
    fn nearest_ties_break_by_id() {
        let mut index = SpatialIndex::new(2);
        index.insert(&node("b", &[1.0, 0.0])).unwrap();
        index.insert(&node("a", &[-1.0, 0.0])).unwrap();

        let result = index.nearest(&SpatialPoint::from([0.0, 0.0]), 2, None);
        assert_eq!(result[0].id, "a");
        assert_eq!(result[1].id, "b");
    }

    #[test]
    fn nearest_k_exceeding_population_returns_everything_sorted() {
        let index = grid_index();
        let result = index.nearest(&SpatialPoint::from([0.0, 0.0, 0.0]), 100, None);
        assert_eq!(result.len(), 25);
        assert_eq!(result[0].id, "n00");
    }

    #[test]
    fn nearest_zero_max_distance_matches_coincident_only() {
        let index = grid_index();
        let result = index.nearest(&SpatialPoint::from([2.0, 2.0, 0.0]), 10, Some(0.0));
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].id, "n22");
    }

    #[test]
    fn nearest_cache_hits_and_write_invalidation() {
        let mut index = grid_index();
        let query = SpatialPoint::from([1.0, 1.0, 0.0]);

        let first = index.nearest(&query, 3, None);
        let second = index.nearest(&query, 3, None);
        assert_eq!(first.len(), second.len());

        let stats = index.get_statistics();
        assert_eq!(stats.cache_hits, 1);
        assert_eq!(stats.cache_misses, 1);

        index.insert(&node("fresh", &[1.0, 1.0, 0.0])).unwrap();
        let third = index.nearest(&query, 3, None);
        assert_eq!(third[0].id, "fresh");
        assert_eq!(index.get_statistics().cache_misses, 2);
    }

    #[test]
    fn large_k_queries_bypass_cache() {
        let index = grid_index();
        let query = SpatialPoint::from([1.0, 1.0, 0.0]);
        index.nearest(&query, 20, None);
        index.nearest(&query, 20, None);

        let stats = index.get_statistics();
        assert_eq!(stats.cache_hits, 0);
        assert_eq!(stats.cache_misses, 0);
    }

    #[test]
    fn incremental_nearest_is_ordered_and_bounded() {
        let index = grid_index();
        let results: Vec<(f64, Node)> = index
            .incremental_nearest(&SpatialPoint::from([0.0, 0.0, 0.0]), Some(5), None)
            .collect();

        assert_eq!(results.len(), 5);
        for pair in results.windows(2) {
            assert!(pair[0].0 <= pair[1].0);
        }

        let bounded: Vec<(f64, Node)> = index
            .incremental_nearest(&SpatialPoint::from([0.0, 0.0, 0.0]), None, Some(1.0))
            .collect();
        assert_eq!(bounded.len(), 3); // (0,0), (0,1), (1,0)
    }

    #[test]
    fn range_query_on_grid() {
        let index = grid_index();
        let result = index.range_query(
            &SpatialPoint::from([1.0, 1.0, 0.0]),
            &SpatialPoint::from([3.0, 3.0, 0.0]),
        );
        assert_eq!(result.len(), 9);
        assert!(result.iter().all(|n| {
            let p = n.spatial().unwrap();
            (1.0..=3.0).contains(&p.get(0)) && (1.0..=3.0).contains(&p.get(1))
        }));
    }

    #[test]
    fn range_query_bounds_resized_to_dimension() {
        let index = grid_index();
        // 2-dimensional bounds against a 3-dimensional index: z clamps to 0
        let result = index.range_query(&SpatialPoint::from([0.0, 0.0]), &SpatialPoint::from([4.0, 4.0]));
        assert_eq!(result.len(), 25);
    }

    #[test]
    fn inverted_range_is_empty() {
        let index = grid_index();
        let result = index.range_query(
            &SpatialPoint::from([3.0, 3.0, 0.0]),
            &SpatialPoint::from([1.0, 1.0, 0.0]),
        );
        assert!(result.is_empty());
    }

    #[test]
    fn circle_query_respects_metric() {
        let mut index = SpatialIndex::with_metric(2, DistanceMetric::Manhattan);
        index.insert(&node("near", &[1.0, 1.0])).unwrap();
        index.insert(&node("far", &[2.0, 2.0])).unwrap();

        let result = index
            .shape_query(&Shape::Circle {
                center: SpatialPoint::from([0.0, 0.0]),
                radius: 2.5,
            })
            .unwrap();
        // Manhattan: |1|+|1| = 2 in, |2|+|2| = 4 out
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].id, "near");
    }

    #[test]
    fn rectangle_shape_delegates_to_range() {
        let index = grid_index();
        let result = index
            .shape_query(&Shape::Rectangle {
                lower: SpatialPoint::from([1.0, 1.0, 0.0]),
                upper: SpatialPoint::from([3.0, 3.0, 0.0]),
            })
            .unwrap();
        assert_eq!(result.len(), 9);
    }

    #[test]
    fn polygon_orientation_does_not_matter() {
        let index = grid_index();

        let ccw = vec![(0.5, 0.5), (3.5, 0.5), (3.5, 3.5), (0.5, 3.5)];
        let cw: Vec<(f64, f64)> = ccw.iter().rev().copied().collect();

        let from_ccw = index
            .shape_query(&Shape::Polygon { vertices: ccw })
            .unwrap();
        let from_cw = index.shape_query(&Shape::Polygon { vertices: cw }).unwrap();

        assert_eq!(from_ccw.len(), 9);
        let ccw_ids: Vec<&str> = from_ccw.iter().map(|n| n.id.as_str()).collect();
        let cw_ids: Vec<&str> = from_cw.iter().map(|n| n.id.as_str()).collect();
        assert_eq!(ccw_ids, cw_ids);
    }

    #[test]
    fn degenerate_polygon_is_rejected() {
        let index = grid_index();
        let result = index.shape_query(&Shape::Polygon {
            vertices: vec![(0.0, 0.0), (1.0, 1.0)],
        });
        assert!(matches!(result, Err(SpatialIndexError::InvalidShape(_))));
    }

    #[test]
    fn path_query_follows_segments() {
        let index = grid_index();
        // Diagonal from corner to corner, tight radius
        let path = vec![
            SpatialPoint::from([0.0, 0.0, 0.0]),
            SpatialPoint::from([4.0, 4.0, 0.0]),
        ];
        let result = index.path_query(&path, 0.1);
        let ids: Vec<&str> = result.iter().map(|n| n.id.as_str()).collect();
        assert_eq!(ids, vec!["n00", "n11", "n22", "n33", "n44"]);
    }

    #[test]
    fn path_query_without_segments_is_empty() {
        let index = grid_index();
        assert!(index.path_query(&[], 5.0).is_empty());
        assert!(
            index
                .path_query(&[SpatialPoint::from([2.0, 2.0, 0.0])], 5.0)
                .is_empty()
        );
    }

    #[test]
    fn bulk_load_matches_iterated_insert() {
        let nodes: Vec<Node> = (0..10)
            .map(|i| node(&format!("n{i}"), &[i as f64, 0.0, 0.0]))
            .collect();

        let mut bulk = SpatialIndex::new(3);
        bulk.bulk_load(&nodes);

        let mut single = SpatialIndex::new(3);
        for n in &nodes {
            single.insert(n).unwrap();
        }

        let query = SpatialPoint::from([4.2, 0.0, 0.0]);
        let from_bulk: Vec<String> = bulk
            .nearest(&query, 4, None)
            .into_iter()
            .map(|n| n.id)
            .collect();
        let from_single: Vec<String> = single
            .nearest(&query, 4, None)
            .into_iter()
            .map(|n| n.id)
            .collect();
        assert_eq!(from_bulk, from_single);

        let range_bulk = bulk.range_query(&SpatialPoint::from([2.0, 0.0]), &SpatialPoint::from([5.0, 0.0]));
        let range_single =
            single.range_query(&SpatialPoint::from([2.0, 0.0]), &SpatialPoint::from([5.0, 0.0]));
        assert_eq!(range_bulk.len(), range_single.len());
    }

    #[test]
    fn bulk_load_skips_nodes_without_spatial_coordinates() {
        let mut index = SpatialIndex::new(2);
        let nodes = vec![
            node("ok", &[1.0, 1.0]),
            Node::with_id(
                "skipped",
                Coordinates::temporal(crate::coords::TemporalInstant::from_epoch_seconds(0.0)),
                json!({}),
            ),
        ];
        index.bulk_load(&nodes);
        assert_eq!(index.count(), 1);
    }

    #[test]
    fn remove_and_clear() {
        let mut index = grid_index();
        assert!(index.remove("n00"));
        assert!(!index.remove("n00"));
        assert_eq!(index.count(), 24);

        index.clear();
        assert_eq!(index.count(), 0);
        assert!(index.get_all().is_empty());
        assert!(
            index
                .nearest(&SpatialPoint::from([0.0, 0.0, 0.0]), 5, None)
                .is_empty()
        );
    }

    #[test]
    fn update_moves_a_node() {
        let mut index = SpatialIndex::new(2);
        index.insert(&node("a", &[0.0, 0.0])).unwrap();
        index.update(&node("a", &[5.0, 5.0])).unwrap();

        let result = index.range_query(&SpatialPoint::from([4.0, 4.0]), &SpatialPoint::from([6.0, 6.0]));
        assert_eq!(result.len(), 1);
        assert_eq!(index.count(), 1);
        assert_eq!(index.get_statistics().updates, 1);
    }

    #[test]
    fn statistics_reflect_operations() {
        let mut index = SpatialIndex::new(2);
        index.insert(&node("a", &[0.0, 0.0])).unwrap();
        index.nearest(&SpatialPoint::from([0.0, 0.0]), 1, None);
        index.range_query(&SpatialPoint::from([0.0, 0.0]), &SpatialPoint::from([1.0, 1.0]));
        index.remove("a");

        let stats = index.get_statistics();
        assert_eq!(stats.inserts, 1);
        assert_eq!(stats.deletes, 1);
        assert_eq!(stats.queries, 2);
        assert_eq!(stats.node_count, 0);
        assert_eq!(stats.dimension, 2);
    }
}
