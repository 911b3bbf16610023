//! Disk-backed node store using an append-only log.
//!
//! Every `put`/`delete` appends a length-framed record; opening the store
//! replays the log to rebuild the in-memory table, so a reopened store
//! answers exactly what the closed one did. Node payloads are stored as
//! their JSON encoding, which round-trips every field including references
//! and metadata. [`AofNodeStore::compact`] rewrites the log down to the
//! live records and swaps it into place atomically.

use crate::error::StoreError;
use crate::node::Node;
use crate::store::{NodeStore, StoreStats};
use bytes::{BufMut, BytesMut};
use log::warn;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};

/// A single log record.
#[derive(Debug, Serialize, Deserialize)]
enum LogRecord {
    Put { id: String, node_json: Vec<u8> },
    Delete { id: String },
}

struct AofInner {
    nodes: FxHashMap<String, Node>,
    writer: BufWriter<File>,
    operations: u64,
    closed: bool,
}

/// Append-only-log node store.
///
/// # Examples
///
/// ```no_run
/// use chronotope::persistence::AofNodeStore;
/// use chronotope::store::NodeStore;
/// use chronotope::{Coordinates, Node, SpatialPoint};
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let store = AofNodeStore::open("nodes.log")?;
/// let node = Node::new(
///     Coordinates::spatial(SpatialPoint::from([1.0, 2.0, 3.0])),
///     serde_json::json!({"name": "landmark"}),
/// );
/// store.put(&node)?;
/// store.sync()?;
/// # Ok(())
/// # }
/// ```
pub struct AofNodeStore {
    path: PathBuf,
    inner: RwLock<AofInner>,
}

impl AofNodeStore {
    /// Open the log at `path`, creating it if absent, and replay it.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(&path)?;

        let nodes = replay(&mut file, &path)?;
        let writer = BufWriter::new(file.try_clone()?);

        Ok(Self {
            path,
            inner: RwLock::new(AofInner {
                nodes,
                writer,
                operations: 0,
                closed: false,
            }),
        })
    }

    /// Force all buffered writes down to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        if inner.closed {
            return Err(StoreError::Closed);
        }
        inner.writer.flush()?;
        inner.writer.get_ref().sync_all()?;
        Ok(())
    }

    /// Rewrite the log so it contains exactly one `Put` per live node.
    ///
    /// The replacement is written to a sibling temp file, synced, and
    /// renamed over the original, so a crash mid-compaction leaves either
    /// the old or the new log intact. Returns the compacted size in bytes.
    pub fn compact(&self) -> Result<u64, StoreError> {
        let mut inner = self.inner.write();
        if inner.closed {
            return Err(StoreError::Closed);
        }
        inner.writer.flush()?;

        let tmp_path = self.path.with_extension("compact");
        let mut size = 0u64;
        {
            let tmp = File::create(&tmp_path)?;
            let mut tmp_writer = BufWriter::new(tmp);

            let mut ids: Vec<String> = inner.nodes.keys().cloned().collect();
            ids.sort();
            for id in &ids {
                let node = &inner.nodes[id];
                let framed = frame_record(&LogRecord::Put {
                    id: id.clone(),
                    node_json: serde_json::to_vec(node)?,
                })?;
                tmp_writer.write_all(&framed)?;
                size += framed.len() as u64;
            }

            tmp_writer.flush()?;
            tmp_writer.get_ref().sync_all()?;
        }

        std::fs::rename(&tmp_path, &self.path)?;

        let file = OpenOptions::new().append(true).read(true).open(&self.path)?;
        inner.writer = BufWriter::new(file);
        Ok(size)
    }
}

fn append(inner: &mut AofInner, record: &LogRecord) -> Result<(), StoreError> {
    let framed = frame_record(record)?;
    inner.writer.write_all(&framed)?;
    inner.writer.flush()?;
    Ok(())
}

fn frame_record(record: &LogRecord) -> Result<BytesMut, StoreError> {
    let payload = bincode::serialize(record)
        .map_err(|e| StoreError::Corrupt(format!("record encoding failed: {e}")))?;
    let mut framed = BytesMut::with_capacity(4 + payload.len());
    framed.put_u32_le(payload.len() as u32);
    framed.put_slice(&payload);
    Ok(framed)
}

/// Replay the log into a node table.
///
/// A torn record at the tail (interrupted final write) is truncated away
/// with a warning; an undecodable record anywhere before the tail is
/// reported as corruption.
fn replay(file: &mut File, path: &Path) -> Result<FxHashMap<String, Node>, StoreError> {
    let mut data = Vec::new();
    file.read_to_end(&mut data)?;

    let mut nodes: FxHashMap<String, Node> = FxHashMap::default();
    let mut offset = 0usize;

    while offset < data.len() {
        if offset + 4 > data.len() {
            warn!(
                "truncating torn record header at byte {} of {}",
                offset,
                path.display()
            );
            file.set_len(offset as u64)?;
            break;
        }
        let len = u32::from_le_bytes([
            data[offset],
            data[offset + 1],
            data[offset + 2],
            data[offset + 3],
        ]) as usize;
        let start = offset + 4;
        if start + len > data.len() {
            warn!(
                "truncating torn record body at byte {} of {}",
                offset,
                path.display()
            );
            file.set_len(offset as u64)?;
            break;
        }

        let record: LogRecord = bincode::deserialize(&data[start..start + len])
            .map_err(|e| StoreError::Corrupt(format!("record at byte {offset}: {e}")))?;
        match record {
            LogRecord::Put { id, node_json } => {
                let node: Node = serde_json::from_slice(&node_json)?;
                nodes.insert(id, node);
            }
            LogRecord::Delete { id } => {
                nodes.remove(&id);
            }
        }
        offset = start + len;
    }

    Ok(nodes)
}

impl NodeStore for AofNodeStore {
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
        let record = LogRecord::Put {
            id: node.id.clone(),
            node_json: serde_json::to_vec(node)?,
        };
        append(&mut inner, &record)?;
        inner.nodes.insert(node.id.clone(), node.clone());
        inner.operations += 1;
        Ok(())
    }

    fn delete(&self, id: &str) -> Result<bool, StoreError> {
        let mut inner = self.inner.write();
        if inner.closed {
            return Err(StoreError::Closed);
        }
        if !inner.nodes.contains_key(id) {
            return Ok(false);
        }
        let record = LogRecord::Delete { id: id.to_string() };
        append(&mut inner, &record)?;
        inner.nodes.remove(id);
        inner.operations += 1;
        Ok(true)
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
        inner.writer.flush()?;
        inner.writer.get_ref().sync_all()?;
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

impl Drop for AofNodeStore {
    fn drop(&mut self) {
        // Best-effort flush; errors on teardown are not recoverable.
        let mut inner = self.inner.write();
        if !inner.closed {
            let _ = inner.writer.flush();
            let _ = inner.writer.get_ref().sync_all();
        }
    }
}
