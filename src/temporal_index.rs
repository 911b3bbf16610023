//! Bucketed temporal index.
//!
//! Timestamps (fractional unix epoch seconds) are grouped into
//! fixed-width buckets; a range query touches only the buckets its bounds
//! reach and filters members by precise timestamp. Within a bucket ids are
//! an unordered set; callers needing ordered output sort by the looked-up
//! timestamp.

use crate::error::TemporalIndexError;
use log::{debug, info};
use rustc_hash::{FxHashMap, FxHashSet};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Default)]
struct Counters {
    inserts: AtomicU64,
    removes: AtomicU64,
    queries: AtomicU64,
}

/// Snapshot of temporal index statistics.
#[derive(Debug, Clone, Default)]
pub struct TemporalIndexStats {
    pub inserts: u64,
    pub removes: u64,
    pub queries: u64,
    pub node_count: usize,
    pub bucket_count: usize,
    pub bucket_seconds: f64,
}

/// Time-bucketed index mapping bucket keys to id sets, with a reverse map
/// from id to its precise timestamp.
pub struct TemporalIndex {
    bucket_seconds: f64,
    buckets: FxHashMap<i64, FxHashSet<String>>,
    timestamps: FxHashMap<String, f64>,
    counters: Counters,
}

impl TemporalIndex {
    /// Create an index with the given bucket granularity in minutes.
    ///
    /// # Panics
    ///
    /// Panics if `bucket_minutes` is zero.
    pub fn new(bucket_minutes: u32) -> Self {
        assert!(bucket_minutes >= 1, "Temporal bucket size must be at least 1 minute");
        info!("created temporal index with bucket_size={bucket_minutes} minutes");
        Self {
            bucket_seconds: f64::from(bucket_minutes) * 60.0,
            buckets: FxHashMap::default(),
            timestamps: FxHashMap::default(),
            counters: Counters::default(),
        }
    }

    /// Bucket width in seconds.
    pub fn bucket_seconds(&self) -> f64 {
        self.bucket_seconds
    }

    fn bucket_key(&self, timestamp: f64) -> i64 {
        (timestamp / self.bucket_seconds).floor() as i64
    }

    /// Insert or re-bucket an id at a timestamp. An id already present is
    /// removed from its old bucket first.
    pub fn insert(&mut self, id: &str, timestamp: f64) {
        if let Some(old_timestamp) = self.timestamps.get(id) {
            let old_key = self.bucket_key(*old_timestamp);
            if let Some(bucket) = self.buckets.get_mut(&old_key) {
                bucket.remove(id);
                if bucket.is_empty() {
                    self.buckets.remove(&old_key);
                }
            }
        }

        let key = self.bucket_key(timestamp);
        self.buckets.entry(key).or_default().insert(id.to_string());
        self.timestamps.insert(id.to_string(), timestamp);
        self.counters.inserts.fetch_add(1, Ordering::Relaxed);
        debug!("inserted {id} into temporal bucket {key}");
    }

    /// Remove an id, reporting whether it was present.
    pub fn remove(&mut self, id: &str) -> bool {
        let Some(timestamp) = self.timestamps.remove(id) else {
            return false;
        };
        let key = self.bucket_key(timestamp);
        if let Some(bucket) = self.buckets.get_mut(&key) {
            bucket.remove(id);
            if bucket.is_empty() {
                self.buckets.remove(&key);
            }
        }
        self.counters.removes.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Precise timestamp of an indexed id.
    pub fn timestamp_of(&self, id: &str) -> Option<f64> {
        self.timestamps.get(id).copied()
    }

    /// Ids whose timestamps fall within `[start, end]`, both ends
    /// inclusive.
    pub fn query_range(&self, start: f64, end: f64) -> FxHashSet<String> {
        self.counters.queries.fetch_add(1, Ordering::Relaxed);

        if start > end {
            return FxHashSet::default();
        }

        let start_key = self.bucket_key(start);
        let end_key = self.bucket_key(end);

        let mut result = FxHashSet::default();
        for (key, ids) in &self.buckets {
            if *key < start_key || *key > end_key {
                continue;
            }
            for id in ids {
                if let Some(ts) = self.timestamps.get(id) {
                    if start <= *ts && *ts <= end {
                        result.insert(id.clone());
                    }
                }
            }
        }

        debug!(
            "temporal range query [{start}-{end}] returned {} ids",
            result.len()
        );
        result
    }

    /// Up to `k` ids closest in time to `target`, ordered by temporal
    /// distance (ties by id). With `max_distance_seconds`, ids further
    /// away are excluded.
    pub fn nearest(
        &self,
        target: f64,
        k: usize,
        max_distance_seconds: Option<f64>,
    ) -> Vec<(f64, String)> {
        self.counters.queries.fetch_add(1, Ordering::Relaxed);

        let mut candidates: Vec<(f64, String)> = self
            .timestamps
            .iter()
            .filter_map(|(id, ts)| {
                let distance = (ts - target).abs();
                match max_distance_seconds {
                    Some(bound) if distance > bound => None,
                    _ => Some((distance, id.clone())),
                }
            })
            .collect();

        candidates.sort_by(|a, b| {
            a.0.partial_cmp(&b.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.1.cmp(&b.1))
        });
        candidates.truncate(k);
        candidates
    }

    /// Group ids in `[start, end]` by `floor((ts - start) / interval)`.
    /// The interval granularity is independent of the bucket size.
    pub fn query_time_series(
        &self,
        start: f64,
        end: f64,
        interval: f64,
    ) -> Result<BTreeMap<i64, FxHashSet<String>>, TemporalIndexError> {
        if !interval.is_finite() || interval <= 0.0 {
            return Err(TemporalIndexError::InvalidInterval(interval));
        }

        let ids = self.query_range(start, end);
        let mut result: BTreeMap<i64, FxHashSet<String>> = BTreeMap::new();
        for id in ids {
            if let Some(ts) = self.timestamps.get(&id) {
                let slot = ((ts - start) / interval).floor() as i64;
                result.entry(slot).or_default().insert(id);
            }
        }
        Ok(result)
    }

    /// Number of indexed ids.
    pub fn count(&self) -> usize {
        self.timestamps.len()
    }

    /// Drop every entry.
    pub fn clear(&mut self) {
        self.buckets.clear();
        self.timestamps.clear();
    }

    /// `(id, timestamp)` pairs for every indexed id. Used to carry entries
    /// into a replacement index when the bucket size changes.
    pub fn entries(&self) -> impl Iterator<Item = (&str, f64)> {
        self.timestamps.iter().map(|(id, ts)| (id.as_str(), *ts))
    }

    /// Per-bucket member counts for non-empty buckets, in key order. This
    /// is what the combined index's auto-tuner inspects.
    pub fn bucket_distribution(&self) -> BTreeMap<i64, usize> {
        self.buckets
            .iter()
            .filter(|(_, ids)| !ids.is_empty())
            .map(|(key, ids)| (*key, ids.len()))
            .collect()
    }

    /// Snapshot of index statistics.
    pub fn get_statistics(&self) -> TemporalIndexStats {
        TemporalIndexStats {
            inserts: self.counters.inserts.load(Ordering::Relaxed),
            removes: self.counters.removes.load(Ordering::Relaxed),
            queries: self.counters.queries.load(Ordering::Relaxed),
            node_count: self.timestamps.len(),
            bucket_count: self.buckets.len(),
            bucket_seconds: self.bucket_seconds,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const T: f64 = 1_700_000_000.0;

    #[test]
    fn range_query_filters_by_precise_timestamp() {
        // Three nodes at T, T+600, T+1200 with 10-minute buckets
        let mut index = TemporalIndex::new(10);
        index.insert("a", T);
        index.insert("b", T + 600.0);
        index.insert("c", T + 1200.0);

        let result = index.query_range(T, T + 1199.0);
        assert_eq!(result.len(), 2);
        assert!(result.contains("a"));
        assert!(result.contains("b"));
    }

    #[test]
    fn range_is_inclusive_at_both_ends() {
        let mut index = TemporalIndex::new(60);
        index.insert("a", T);

        assert!(index.query_range(T, T).contains("a"));
        assert!(index.query_range(T - 100.0, T).contains("a"));
        assert!(index.query_range(T, T + 100.0).contains("a"));
        assert!(index.query_range(T + 1.0, T + 100.0).is_empty());
    }

    #[test]
    fn inverted_range_is_empty() {
        let mut index = TemporalIndex::new(60);
        index.insert("a", T);
        assert!(index.query_range(T + 100.0, T).is_empty());
    }

    #[test]
    fn reinsert_moves_between_buckets() {
        let mut index = TemporalIndex::new(1);
        index.insert("a", T);
        index.insert("a", T + 3600.0);

        assert_eq!(index.count(), 1);
        assert!(index.query_range(T - 30.0, T + 30.0).is_empty());
        assert!(index.query_range(T + 3570.0, T + 3630.0).contains("a"));
        // only the new bucket remains populated
        assert_eq!(index.bucket_distribution().len(), 1);
    }

    #[test]
    fn remove_reports_presence() {
        let mut index = TemporalIndex::new(60);
        index.insert("a", T);

        assert!(index.remove("a"));
        assert!(!index.remove("a"));
        assert_eq!(index.count(), 0);
        assert!(index.query_range(T - 10.0, T + 10.0).is_empty());
    }

    #[test]
    fn nearest_orders_by_temporal_distance() {
        let mut index = TemporalIndex::new(60);
        index.insert("a", T);
        index.insert("b", T + 100.0);
        index.insert("c", T + 400.0);

        let result = index.nearest(T + 90.0, 2, None);
        assert_eq!(result.len(), 2);
        assert_eq!(result[0].1, "b");
        assert_eq!(result[1].1, "a");

        let bounded = index.nearest(T + 90.0, 10, Some(95.0));
        assert_eq!(bounded.len(), 2); // c is 310s away

        let ties = {
            let mut index = TemporalIndex::new(60);
            index.insert("z", T + 10.0);
            index.insert("y", T - 10.0);
            index.nearest(T, 2, None)
        };
        assert_eq!(ties[0].1, "y");
        assert_eq!(ties[1].1, "z");
    }

    #[test]
    fn time_series_slots_are_independent_of_bucket_size() {
        let mut index = TemporalIndex::new(60);
        index.insert("a", T);
        index.insert("b", T + 90.0);
        index.insert("c", T + 250.0);

        // 2-minute slots inside a single one-hour bucket
        let series = index.query_time_series(T, T + 300.0, 120.0).unwrap();
        assert_eq!(series.len(), 2);
        assert!(series[&0].contains("a"));
        assert!(series[&0].contains("b"));
        assert!(series[&2].contains("c"));
    }

    #[test]
    fn time_series_rejects_bad_interval() {
        let index = TemporalIndex::new(60);
        assert!(matches!(
            index.query_time_series(T, T + 100.0, 0.0),
            Err(TemporalIndexError::InvalidInterval(_))
        ));
        assert!(index.query_time_series(T, T + 100.0, f64::NAN).is_err());
    }

    #[test]
    fn negative_timestamps_bucket_correctly() {
        let mut index = TemporalIndex::new(1);
        index.insert("a", -30.0);
        index.insert("b", 30.0);

        assert!(index.query_range(-60.0, 0.0).contains("a"));
        assert!(!index.query_range(-60.0, 0.0).contains("b"));
    }

    #[test]
    fn distribution_reports_only_populated_buckets() {
        let mut index = TemporalIndex::new(10);
        index.insert("a", T);
        index.insert("b", T + 10.0);
        index.insert("c", T + 600.0);

        let distribution = index.bucket_distribution();
        assert_eq!(distribution.len(), 2);
        let counts: Vec<usize> = distribution.values().copied().collect();
        assert_eq!(counts, vec![2, 1]);
    }

    #[test]
    fn entries_expose_every_pair() {
        let mut index = TemporalIndex::new(10);
        index.insert("a", T);
        index.insert("b", T + 600.0);

        let mut pairs: Vec<(String, f64)> = index
            .entries()
            .map(|(id, ts)| (id.to_string(), ts))
            .collect();
        pairs.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(pairs, vec![("a".to_string(), T), ("b".to_string(), T + 600.0)]);
    }

    #[test]
    fn statistics_reflect_operations() {
        let mut index = TemporalIndex::new(30);
        index.insert("a", T);
        index.insert("b", T + 1.0);
        index.remove("a");
        index.query_range(T, T + 10.0);

        let stats = index.get_statistics();
        assert_eq!(stats.inserts, 2);
        assert_eq!(stats.removes, 1);
        assert_eq!(stats.queries, 1);
        assert_eq!(stats.node_count, 1);
        assert_eq!(stats.bucket_seconds, 1800.0);
    }
}
