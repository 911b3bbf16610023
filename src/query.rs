//! Declarative queries and the engine that executes them.
//!
//! A [`Query`] pairs a tagged kind (basic scan, spatial, temporal, or
//! combined) with post-processing options (sort, pagination, caching).
//! The [`QueryEngine`] routes each kind to the right index, applies the
//! post-filters, and memoizes hot results in a bounded LRU cache. The
//! engine is also the write façade: every write that goes through it keeps
//! the store, the indexes, and the delta history in step and flushes the
//! result cache so no stale entry can be observed.

use crate::combined_index::{SpatialCriteria, TemporalCriteria, TemporalSpatialIndex};
use crate::config::EngineConfig;
use crate::coords::SpatialPoint;
use crate::delta::DeltaStore;
use crate::error::{CoreError, QueryError, Result};
use crate::node::Node;
use crate::store::NodeStore;
use chrono::Utc;
use log::debug;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Sort key applied to query results.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SortBy {
    /// Node timestamp, nodes without one sort as zero
    Temporal,
    /// Distance from the query point, when the query has one
    Distance,
    /// Numeric interpretation of a metadata entry, zero fallback
    Metadata(String),
}

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

/// Post-processing options attached to a query.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryOptions {
    /// Whether this query may be served from / stored into the cache
    pub use_cache: bool,
    pub limit: Option<usize>,
    pub offset: usize,
    pub sort_by: Option<SortBy>,
    pub sort_order: SortOrder,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            use_cache: true,
            limit: None,
            offset: 0,
            sort_by: None,
            sort_order: SortOrder::default(),
        }
    }
}

impl QueryOptions {
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    pub fn with_sort(mut self, sort_by: SortBy, order: SortOrder) -> Self {
        self.sort_by = Some(sort_by);
        self.sort_order = order;
        self
    }

    pub fn without_cache(mut self) -> Self {
        self.use_cache = false;
        self
    }
}

/// The tagged query variants.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryKind {
    /// Full scan of the node store
    Basic,
    Spatial(SpatialCriteria),
    Temporal(TemporalCriteria),
    Combined {
        spatial: Option<SpatialCriteria>,
        temporal: Option<TemporalCriteria>,
    },
}

/// A declarative query object.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub kind: QueryKind,
    pub options: QueryOptions,
}

impl Query {
    /// Full scan of the node store.
    pub fn basic() -> Self {
        Self {
            kind: QueryKind::Basic,
            options: QueryOptions::default(),
        }
    }

    pub fn spatial(criteria: SpatialCriteria) -> Self {
        Self {
            kind: QueryKind::Spatial(criteria),
            options: QueryOptions::default(),
        }
    }

    pub fn temporal(criteria: TemporalCriteria) -> Self {
        Self {
            kind: QueryKind::Temporal(criteria),
            options: QueryOptions::default(),
        }
    }

    /// Combined query; at least one side must be present.
    pub fn combined(
        spatial: Option<SpatialCriteria>,
        temporal: Option<TemporalCriteria>,
    ) -> Result<Self, QueryError> {
        if spatial.is_none() && temporal.is_none() {
            return Err(QueryError::InvalidQuery(
                "combined query requires at least one of spatial or temporal criteria".into(),
            ));
        }
        Ok(Self {
            kind: QueryKind::Combined { spatial, temporal },
            options: QueryOptions::default(),
        })
    }

    pub fn with_options(mut self, options: QueryOptions) -> Self {
        self.options = options;
        self
    }

    /// The spatial point this query measures distances from, if any.
    fn query_point(&self) -> Option<&SpatialPoint> {
        let criteria = match &self.kind {
            QueryKind::Spatial(criteria) => Some(criteria),
            QueryKind::Combined {
                spatial: Some(criteria),
                ..
            } => Some(criteria),
            _ => None,
        };
        match criteria {
            Some(SpatialCriteria::Nearest { point, .. }) => Some(point),
            _ => None,
        }
    }
}

/// Result of an executed query.
#[derive(Debug, Clone)]
pub struct QueryResult {
    pub items: Vec<Node>,
    /// Size of the result set before offset/limit were applied
    pub total_before_pagination: usize,
    pub execution_time: Duration,
}

/// Fields of a query that affect its result set; `use_cache` is excluded.
#[derive(Serialize)]
struct CacheKeyRepr<'a> {
    kind: &'a QueryKind,
    limit: Option<usize>,
    offset: usize,
    sort_by: &'a Option<SortBy>,
    sort_order: SortOrder,
}

struct ResultCache {
    map: FxHashMap<String, QueryResult>,
    order: VecDeque<String>,
    capacity: usize,
}

impl ResultCache {
    fn new(capacity: usize) -> Self {
        Self {
            map: FxHashMap::default(),
            order: VecDeque::new(),
            capacity,
        }
    }

    fn get(&mut self, key: &str) -> Option<QueryResult> {
        let hit = self.map.get(key).cloned();
        if hit.is_some() {
            self.order.retain(|k| k != key);
            self.order.push_back(key.to_string());
        }
        hit
    }

    fn insert(&mut self, key: String, value: QueryResult) {
        if self.map.insert(key.clone(), value).is_none() {
            self.order.push_back(key);
        }
        while self.map.len() > self.capacity {
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
}

#[derive(Default)]
struct Counters {
    queries: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    writes: AtomicU64,
    invalidations: AtomicU64,
}

/// Snapshot of engine statistics.
#[derive(Debug, Clone, Default)]
pub struct EngineStats {
    pub queries: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub writes: u64,
    pub invalidations: u64,
}

/// Planner/executor over the node store and the combined index.
///
/// # Examples
///
/// ```rust
/// use std::sync::Arc;
/// use chronotope::combined_index::TemporalSpatialIndex;
/// use chronotope::query::{Query, QueryEngine};
/// use chronotope::store::MemoryNodeStore;
/// use chronotope::{Coordinates, Node, SpatialPoint};
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let engine = QueryEngine::new(Arc::new(MemoryNodeStore::new()), TemporalSpatialIndex::new());
///
/// engine.insert(Node::with_id(
///     "a",
///     Coordinates::spatial(SpatialPoint::from([1.0, 2.0, 3.0])),
///     serde_json::json!({}),
/// ))?;
///
/// let result = engine.execute(&Query::basic())?;
/// assert_eq!(result.items.len(), 1);
/// # Ok(())
/// # }
/// ```
pub struct QueryEngine {
    store: Arc<dyn NodeStore>,
    index: TemporalSpatialIndex,
    deltas: Option<DeltaStore>,
    cache: Mutex<ResultCache>,
    /// Serializes write paths so read-modify-write updates are
    /// linearizable per id.
    write_serial: Mutex<()>,
    counters: Counters,
}

impl QueryEngine {
    /// Create an engine with the default configuration.
    pub fn new(store: Arc<dyn NodeStore>, index: TemporalSpatialIndex) -> Self {
        Self::with_config(store, index, EngineConfig::default())
    }

    /// Create an engine with an explicit configuration.
    pub fn with_config(
        store: Arc<dyn NodeStore>,
        index: TemporalSpatialIndex,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            index,
            deltas: None,
            cache: Mutex::new(ResultCache::new(config.cache_capacity.max(1))),
            write_serial: Mutex::new(()),
            counters: Counters::default(),
        }
    }

    /// Attach a delta store; subsequent updates record version deltas.
    pub fn with_delta_store(mut self, deltas: DeltaStore) -> Self {
        self.deltas = Some(deltas);
        self
    }

    /// The combined index this engine routes to.
    pub fn index(&self) -> &TemporalSpatialIndex {
        &self.index
    }

    /// The node store this engine writes through.
    pub fn store(&self) -> &Arc<dyn NodeStore> {
        &self.store
    }

    /// The attached delta store, if any.
    pub fn delta_store(&self) -> Option<&DeltaStore> {
        self.deltas.as_ref()
    }

    /// Insert a new node into the store and the indexes.
    pub fn insert(&self, node: Node) -> Result<()> {
        if let Some(point) = node.spatial() {
            if !point.is_finite() {
                return Err(crate::error::SpatialIndexError::NonFiniteCoordinate(
                    node.id.clone(),
                )
                .into());
            }
        }
        let _serial = self.write_serial.lock();
        self.store.put(&node)?;
        self.index.insert(node)?;
        self.record_write();
        Ok(())
    }

    /// Accept an update for an existing node.
    ///
    /// The given node carries the caller's changes; the engine stamps it
    /// as the next version, records a delta against the stored version
    /// when a delta store is attached, and replaces the node everywhere.
    /// Returns the stored new version.
    pub fn update(&self, node: Node) -> Result<Node> {
        if let Some(point) = node.spatial() {
            if !point.is_finite() {
                return Err(crate::error::SpatialIndexError::NonFiniteCoordinate(
                    node.id.clone(),
                )
                .into());
            }
        }

        let _serial = self.write_serial.lock();
        let old = self
            .store
            .get(&node.id)?
            .ok_or_else(|| crate::error::StoreError::NotFound(node.id.clone()))?;

        let next = node.into_version(old.metadata.version + 1, Utc::now());
        if let Some(deltas) = &self.deltas {
            deltas.record(&old, &next)?;
        }
        self.store.put(&next)?;
        self.index.update(next.clone())?;
        self.record_write();
        Ok(next)
    }

    /// Remove a node from the store and the indexes. Recorded delta
    /// history is retained; pruning it is a caller policy decision.
    pub fn remove(&self, id: &str) -> Result<bool> {
        let _serial = self.write_serial.lock();
        let removed = self.store.delete(id)?;
        self.index.remove(id);
        self.record_write();
        Ok(removed)
    }

    /// Fetch a node by id.
    pub fn get(&self, id: &str) -> Result<Option<Node>> {
        Ok(self.store.get(id)?)
    }

    /// Execute a query and return its post-processed result.
    pub fn execute(&self, query: &Query) -> Result<QueryResult> {
        let started = Instant::now();
        self.counters.queries.fetch_add(1, Ordering::Relaxed);

        let cache_key = cache_key(query)?;
        if query.options.use_cache {
            if let Some(mut cached) = self.cache.lock().get(&cache_key) {
                self.counters.cache_hits.fetch_add(1, Ordering::Relaxed);
                cached.execution_time = started.elapsed();
                return Ok(cached);
            }
            self.counters.cache_misses.fetch_add(1, Ordering::Relaxed);
        }

        let mut nodes = self.candidates(query)?;
        if let Some(sort_by) = &query.options.sort_by {
            sort_nodes(
                &mut nodes,
                sort_by,
                query.options.sort_order,
                query.query_point(),
            );
        }

        let total = nodes.len();
        let items: Vec<Node> = nodes
            .into_iter()
            .skip(query.options.offset)
            .take(query.options.limit.unwrap_or(usize::MAX))
            .collect();

        let result = QueryResult {
            items,
            total_before_pagination: total,
            execution_time: started.elapsed(),
        };

        if query.options.use_cache {
            self.cache.lock().insert(cache_key, result.clone());
        }
        debug!(
            "query returned {} of {} nodes in {:?}",
            result.items.len(),
            total,
            result.execution_time
        );
        Ok(result)
    }

    /// Drop every cached result. Called automatically on writes through
    /// the engine; exposed for callers that write to the index or store
    /// directly.
    pub fn invalidate_cache(&self) {
        self.cache.lock().clear();
        self.counters.invalidations.fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshot of engine statistics.
    pub fn statistics(&self) -> EngineStats {
        EngineStats {
            queries: self.counters.queries.load(Ordering::Relaxed),
            cache_hits: self.counters.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.counters.cache_misses.load(Ordering::Relaxed),
            writes: self.counters.writes.load(Ordering::Relaxed),
            invalidations: self.counters.invalidations.load(Ordering::Relaxed),
        }
    }

    fn candidates(&self, query: &Query) -> Result<Vec<Node>> {
        let routed = match &query.kind {
            QueryKind::Basic => self.store.all().map_err(CoreError::from),
            QueryKind::Spatial(criteria) => self.index.query(Some(criteria), None, None),
            QueryKind::Temporal(criteria) => self.index.query(None, Some(criteria), None),
            QueryKind::Combined { spatial, temporal } => {
                self.index.query(spatial.as_ref(), temporal.as_ref(), None)
            }
        };
        routed.map_err(|cause| QueryError::Index(Box::new(cause)).into())
    }

    fn record_write(&self) {
        self.counters.writes.fetch_add(1, Ordering::Relaxed);
        self.invalidate_cache();
    }
}

/// Deterministic cache key: canonical JSON of the kind plus the
/// result-affecting options.
fn cache_key(query: &Query) -> Result<String> {
    let repr = CacheKeyRepr {
        kind: &query.kind,
        limit: query.options.limit,
        offset: query.options.offset,
        sort_by: &query.options.sort_by,
        sort_order: query.options.sort_order,
    };
    let value = serde_json::to_value(&repr)
        .map_err(|e| QueryError::InvalidQuery(format!("criteria not serializable: {e}")))?;
    Ok(value.to_string())
}

fn sort_nodes(
    nodes: &mut [Node],
    sort_by: &SortBy,
    order: SortOrder,
    query_point: Option<&SpatialPoint>,
) {
    // Distance sorting needs a reference point; without one the routed
    // order stands.
    if matches!(sort_by, SortBy::Distance) && query_point.is_none() {
        return;
    }

    let key = |node: &Node| -> f64 {
        match sort_by {
            SortBy::Temporal => node.temporal().map(|t| t.epoch_seconds()).unwrap_or(0.0),
            SortBy::Distance => query_point
                .and_then(|point| node.spatial().map(|p| point.distance_to(p)))
                .unwrap_or(0.0),
            SortBy::Metadata(field) => node
                .metadata
                .extra
                .get(field)
                .and_then(|v| v.as_f64())
                .unwrap_or(0.0),
        }
    };

    nodes.sort_by(|a, b| {
        let ordering = key(a)
            .partial_cmp(&key(b))
            .unwrap_or(std::cmp::Ordering::Equal);
        let ordering = match order {
            SortOrder::Asc => ordering,
            SortOrder::Desc => ordering.reverse(),
        };
        ordering.then_with(|| a.id.cmp(&b.id))
    });
}
