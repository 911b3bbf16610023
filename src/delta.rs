//! Field-level deltas between node versions, and their compressed store.
//!
//! A [`Delta`] records the minimal set of changes from `version - 1` to
//! `version` of one node: content, spatial, temporal, and caller-defined
//! metadata entries. Applying a delta overwrites fields rather than
//! accumulating, so application is idempotent. The [`DeltaStore`] keeps
//! each delta as a zlib-compressed canonical-JSON file next to an
//! `index.json` mapping node ids to their version chains, and reconstructs
//! any historical version by folding a contiguous chain onto a base node.

use crate::coords::{Coordinates, SpatialPoint, TemporalInstant};
use crate::error::DeltaError;
use crate::node::Node;
use chrono::{DateTime, Utc};
use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use log::{info, warn};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

/// An old/new pair for one changed field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldChange<T> {
    pub old: T,
    pub new: T,
}

/// Additions, changes, and removals among caller-defined metadata entries.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MetadataChanges {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub added: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub changed: BTreeMap<String, FieldChange<Value>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub removed: Vec<String>,
}

impl MetadataChanges {
    fn is_empty(&self) -> bool {
        self.added.is_empty() && self.changed.is_empty() && self.removed.is_empty()
    }
}

/// The changed fields between two consecutive versions.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DeltaChanges {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<FieldChange<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spatial: Option<FieldChange<Option<SpatialPoint>>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temporal: Option<FieldChange<Option<TemporalInstant>>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<MetadataChanges>,
}

/// A minimal diff carrying a node from `prev_version` to `version`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Delta {
    pub node_id: String,
    pub version: u64,
    pub prev_version: u64,
    pub timestamp: DateTime<Utc>,
    pub changes: DeltaChanges,
}

/// Compute the delta between two versions of the same node.
///
/// Housekeeping metadata (version and the created/updated stamps) lives
/// outside the diffed entries; the metadata section is omitted entirely
/// when no caller-defined entry changed.
pub fn compute_delta(old: &Node, new: &Node) -> Delta {
    let mut changes = DeltaChanges::default();

    if old.content != new.content {
        changes.content = Some(FieldChange {
            old: old.content.clone(),
            new: new.content.clone(),
        });
    }

    if old.coordinates.spatial != new.coordinates.spatial {
        changes.spatial = Some(FieldChange {
            old: old.coordinates.spatial.clone(),
            new: new.coordinates.spatial.clone(),
        });
    }

    if old.coordinates.temporal != new.coordinates.temporal {
        changes.temporal = Some(FieldChange {
            old: old.coordinates.temporal.clone(),
            new: new.coordinates.temporal.clone(),
        });
    }

    let mut metadata = MetadataChanges::default();
    for (key, value) in &new.metadata.extra {
        match old.metadata.extra.get(key) {
            None => {
                metadata.added.insert(key.clone(), value.clone());
            }
            Some(old_value) if old_value != value => {
                metadata.changed.insert(
                    key.clone(),
                    FieldChange {
                        old: old_value.clone(),
                        new: value.clone(),
                    },
                );
            }
            Some(_) => {}
        }
    }
    for key in old.metadata.extra.keys() {
        if !new.metadata.extra.contains_key(key) {
            metadata.removed.push(key.clone());
        }
    }
    if !metadata.is_empty() {
        changes.metadata = Some(metadata);
    }

    Delta {
        node_id: new.id.clone(),
        version: new.metadata.version,
        prev_version: old.metadata.version,
        timestamp: new.metadata.updated_at,
        changes,
    }
}

/// Apply a delta to a node, producing the next version.
///
/// Every recorded change overwrites the corresponding field; unrelated
/// fields are preserved. The result carries `version = delta.version` and
/// `updated_at = delta.timestamp`, so applying a delta twice yields the
/// same node as applying it once.
pub fn apply_delta(node: &Node, delta: &Delta) -> Node {
    let mut content = node.content.clone();
    let mut spatial = node.coordinates.spatial.clone();
    let mut temporal = node.coordinates.temporal.clone();
    let mut metadata = node.metadata.clone();

    if let Some(change) = &delta.changes.content {
        content = change.new.clone();
    }
    if let Some(change) = &delta.changes.spatial {
        spatial = change.new.clone();
    }
    if let Some(change) = &delta.changes.temporal {
        temporal = change.new.clone();
    }

    metadata.version = delta.version;
    metadata.updated_at = delta.timestamp;

    if let Some(changes) = &delta.changes.metadata {
        for (key, value) in &changes.added {
            metadata.extra.insert(key.clone(), value.clone());
        }
        for (key, change) in &changes.changed {
            metadata.extra.insert(key.clone(), change.new.clone());
        }
        for key in &changes.removed {
            metadata.extra.remove(key);
        }
    }

    Node {
        id: node.id.clone(),
        coordinates: Coordinates { spatial, temporal },
        content,
        metadata,
        references: node.references.clone(),
    }
}

/// Serialize a delta to canonical JSON (sorted keys) and zlib-compress it.
pub fn compress_delta(delta: &Delta) -> Result<Vec<u8>, DeltaError> {
    let canonical = serde_json::to_vec(&serde_json::to_value(delta)?)?;
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::new(9));
    encoder.write_all(&canonical)?;
    Ok(encoder.finish()?)
}

/// Decompress and deserialize a delta produced by [`compress_delta`].
pub fn decompress_delta(bytes: &[u8]) -> Result<Delta, DeltaError> {
    let mut decoder = ZlibDecoder::new(bytes);
    let mut json = Vec::new();
    decoder.read_to_end(&mut json)?;
    Ok(serde_json::from_slice(&json)?)
}

/// `(version, unix timestamp, filename)` as stored in `index.json`.
type IndexEntry = (u64, i64, String);

struct StoreInner {
    index: BTreeMap<String, Vec<IndexEntry>>,
    cache: FxHashMap<(String, u64), Delta>,
}

#[derive(Default)]
struct Counters {
    stored: AtomicU64,
    pruned: AtomicU64,
    merged: AtomicU64,
}

/// Outcome of a [`DeltaStore::optimize`] pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OptimizeReport {
    pub pruned: usize,
    pub merged: usize,
}

/// Snapshot of delta store statistics.
#[derive(Debug, Clone, Default)]
pub struct DeltaStoreStats {
    pub total_deltas: usize,
    pub stored: u64,
    pub pruned: u64,
    pub merged: u64,
    /// Uncompressed serialized bytes over on-disk bytes; 0.0 when empty.
    pub compression_ratio: f64,
}

/// Directory-backed store of compressed deltas.
///
/// Delta files are immutable once written; only the index file mutates, so
/// a single mutex around the index is enough and reads of existing deltas
/// run lock-free past the index lookup.
pub struct DeltaStore {
    dir: PathBuf,
    inner: Mutex<StoreInner>,
    counters: Counters,
}

impl DeltaStore {
    /// Open (or create) a delta store rooted at `dir`, loading its index.
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self, DeltaError> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;

        let index_path = dir.join("index.json");
        let index = if index_path.exists() {
            let raw = std::fs::read(&index_path)?;
            serde_json::from_slice(&raw)?
        } else {
            BTreeMap::new()
        };

        Ok(Self {
            dir,
            inner: Mutex::new(StoreInner {
                index,
                cache: FxHashMap::default(),
            }),
            counters: Counters::default(),
        })
    }

    /// Compute and store the delta between two versions of a node.
    pub fn record(&self, old: &Node, new: &Node) -> Result<Delta, DeltaError> {
        let delta = compute_delta(old, new);
        self.store(&delta)?;
        Ok(delta)
    }

    /// Store a delta, replacing any existing delta at the same version.
    pub fn store(&self, delta: &Delta) -> Result<(), DeltaError> {
        let compressed = compress_delta(delta)?;
        let filename = format!(
            "{}_{}_{}.delta",
            delta.node_id,
            delta.version,
            delta.timestamp.timestamp()
        );
        std::fs::write(self.dir.join(&filename), &compressed)?;

        let mut inner = self.inner.lock();
        let entries = inner.index.entry(delta.node_id.clone()).or_default();
        if let Some(pos) = entries.iter().position(|(v, _, _)| *v == delta.version) {
            let (_, _, old_file) = entries.remove(pos);
            if old_file != filename {
                remove_file_logged(&self.dir.join(&old_file));
            }
        }
        entries.push((delta.version, delta.timestamp.timestamp(), filename));
        entries.sort_by_key(|(v, _, _)| *v);
        self.save_index(&inner)?;
        inner
            .cache
            .insert((delta.node_id.clone(), delta.version), delta.clone());

        self.counters.stored.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Fetch one delta by `(node_id, version)`.
    pub fn get(&self, node_id: &str, version: u64) -> Result<Delta, DeltaError> {
        let filename = {
            let inner = self.inner.lock();
            if let Some(delta) = inner.cache.get(&(node_id.to_string(), version)) {
                return Ok(delta.clone());
            }
            inner
                .index
                .get(node_id)
                .and_then(|entries| entries.iter().find(|(v, _, _)| *v == version))
                .map(|(_, _, filename)| filename.clone())
                .ok_or_else(|| DeltaError::NotFound {
                    node_id: node_id.to_string(),
                    version,
                })?
        };

        // Delta files are immutable; no lock needed for the read itself.
        let compressed = std::fs::read(self.dir.join(&filename))?;
        let delta = decompress_delta(&compressed)?;
        self.inner
            .lock()
            .cache
            .insert((node_id.to_string(), version), delta.clone());
        Ok(delta)
    }

    /// The contiguous chain `[start ..= end]`, failing on any gap.
    pub fn chain(&self, node_id: &str, start: u64, end: u64) -> Result<Vec<Delta>, DeltaError> {
        let mut deltas = Vec::new();
        for version in start..=end {
            match self.get(node_id, version) {
                Ok(delta) => deltas.push(delta),
                Err(DeltaError::NotFound { .. }) => {
                    return Err(DeltaError::BrokenChain {
                        node_id: node_id.to_string(),
                        version,
                    });
                }
                Err(e) => return Err(e),
            }
        }
        Ok(deltas)
    }

    /// Versions recorded for a node, ascending.
    pub fn versions(&self, node_id: &str) -> Vec<u64> {
        self.inner
            .lock()
            .index
            .get(node_id)
            .map(|entries| entries.iter().map(|(v, _, _)| *v).collect())
            .unwrap_or_default()
    }

    /// Newest recorded version for a node.
    pub fn latest_version(&self, node_id: &str) -> Option<u64> {
        self.versions(node_id).last().copied()
    }

    /// Reconstruct a node at `target_version` (default: newest recorded)
    /// by folding the delta chain onto `base`.
    ///
    /// Returns the base unchanged when no deltas are recorded or the base
    /// is already at the target.
    pub fn reconstruct(
        &self,
        node_id: &str,
        base: &Node,
        target_version: Option<u64>,
    ) -> Result<Node, DeltaError> {
        let Some(latest) = self.latest_version(node_id) else {
            return Ok(base.clone());
        };
        let target = target_version.unwrap_or(latest);
        let base_version = base.metadata.version;

        if base_version > target {
            return Err(DeltaError::BaseNewerThanTarget {
                base: base_version,
                target,
            });
        }
        if base_version == target {
            return Ok(base.clone());
        }

        let chain = self.chain(node_id, base_version + 1, target)?;
        Ok(chain
            .iter()
            .fold(base.clone(), |node, delta| apply_delta(&node, delta)))
    }

    /// Remove the oldest deltas so at most `keep_versions` remain.
    /// Returns how many were removed.
    pub fn prune(&self, node_id: &str, keep_versions: usize) -> Result<usize, DeltaError> {
        let mut inner = self.inner.lock();
        let Some(entries) = inner.index.get_mut(node_id) else {
            return Ok(0);
        };
        if entries.len() <= keep_versions {
            return Ok(0);
        }

        let victims: Vec<IndexEntry> = entries
            .drain(..entries.len() - keep_versions)
            .collect();
        for (version, _, filename) in &victims {
            remove_file_logged(&self.dir.join(filename));
            inner.cache.remove(&(node_id.to_string(), *version));
        }
        self.save_index(&inner)?;

        let count = victims.len();
        self.counters.pruned.fetch_add(count as u64, Ordering::Relaxed);
        info!("pruned {count} deltas for node {node_id}");
        Ok(count)
    }

    /// Collapse the deltas in `[start ..= end]` into one direct delta.
    ///
    /// The state at `start - 1` and at `end` are both reconstructed from
    /// `base`, diffed, and the resulting delta replaces the range. Fails
    /// if fewer than two deltas lie in the range or the endpoint states
    /// cannot be reconstructed.
    pub fn merge(
        &self,
        node_id: &str,
        base: &Node,
        start: u64,
        end: u64,
    ) -> Result<(), DeltaError> {
        if start < 2 || end <= start {
            return Err(DeltaError::InvalidRange { start, end });
        }

        let in_range = self
            .versions(node_id)
            .into_iter()
            .filter(|v| (start..=end).contains(v))
            .count();
        if in_range < 2 {
            return Err(DeltaError::MergeRangeTooSmall {
                node_id: node_id.to_string(),
                start,
                end,
            });
        }

        let initial = self.reconstruct(node_id, base, Some(start - 1))?;
        let merged_count = end - start + 1;
        let last = self.reconstruct(node_id, &initial, Some(end))?;

        let merged = compute_delta(&initial, &last);
        self.store(&merged)?;

        // Drop the superseded deltas; the merged one sits at `end`.
        let mut inner = self.inner.lock();
        if let Some(entries) = inner.index.get_mut(node_id) {
            let victims: Vec<IndexEntry> = entries
                .iter()
                .filter(|(v, _, _)| (start..end).contains(v))
                .cloned()
                .collect();
            entries.retain(|(v, _, _)| !(start..end).contains(v));
            for (version, _, filename) in victims {
                remove_file_logged(&self.dir.join(&filename));
                inner.cache.remove(&(node_id.to_string(), version));
            }
        }
        self.save_index(&inner)?;

        self.counters.merged.fetch_add(merged_count, Ordering::Relaxed);
        info!("merged deltas {start}..={end} for node {node_id}");
        Ok(())
    }

    /// Run the standard maintenance pass over one node's history:
    /// collapse the oldest five deltas into one when they are consecutive
    /// and reachable from `base`, then prune down to `keep_versions`.
    ///
    /// Merging runs first so the chain between `base` and the merge range
    /// is still intact.
    pub fn optimize(
        &self,
        node_id: &str,
        base: &Node,
        keep_versions: usize,
    ) -> Result<OptimizeReport, DeltaError> {
        let versions = self.versions(node_id);
        let mut merged = 0;
        if versions.len() >= 5 {
            let start = versions[0];
            let end = versions[4];
            if end - start == 4 && start >= 2 && base.metadata.version <= start - 1 {
                self.merge(node_id, base, start, end)?;
                merged = 5;
            }
        }

        let pruned = self.prune(node_id, keep_versions)?;
        Ok(OptimizeReport { pruned, merged })
    }

    /// Snapshot of store statistics, including the on-disk compression
    /// ratio.
    pub fn statistics(&self) -> Result<DeltaStoreStats, DeltaError> {
        let entries: Vec<IndexEntry> = {
            let inner = self.inner.lock();
            inner.index.values().flatten().cloned().collect()
        };

        let mut uncompressed = 0u64;
        let mut compressed = 0u64;
        for (_, _, filename) in &entries {
            let path = self.dir.join(filename);
            let Ok(meta) = std::fs::metadata(&path) else {
                continue;
            };
            let Ok(raw) = std::fs::read(&path) else {
                continue;
            };
            let mut decoder = ZlibDecoder::new(raw.as_slice());
            let mut json = Vec::new();
            if decoder.read_to_end(&mut json).is_err() {
                continue;
            }
            compressed += meta.len();
            uncompressed += json.len() as u64;
        }

        Ok(DeltaStoreStats {
            total_deltas: entries.len(),
            stored: self.counters.stored.load(Ordering::Relaxed),
            pruned: self.counters.pruned.load(Ordering::Relaxed),
            merged: self.counters.merged.load(Ordering::Relaxed),
            compression_ratio: if compressed == 0 {
                0.0
            } else {
                uncompressed as f64 / compressed as f64
            },
        })
    }

    fn save_index(&self, inner: &StoreInner) -> Result<(), DeltaError> {
        let json = serde_json::to_vec_pretty(&inner.index)?;
        std::fs::write(self.dir.join("index.json"), json)?;
        Ok(())
    }
}

fn remove_file_logged(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        warn!("failed to remove delta file {}: {e}", path.display());
    }
}
