//! Error types for the chronotope core.
//!
//! Every fallible operation returns a typed error from the hierarchy below.
//! Component-level enums (`SpatialIndexError`, `TemporalIndexError`,
//! `StoreError`, `DeltaError`, `QueryError`) wrap low-level causes and are
//! aggregated under the root [`CoreError`].

use thiserror::Error;

/// Convenience result alias used throughout the crate.
pub type Result<T, E = CoreError> = std::result::Result<T, E>;

/// Root error type for the chronotope core.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Spatial index failure
    #[error(transparent)]
    Spatial(#[from] SpatialIndexError),

    /// Temporal index failure
    #[error(transparent)]
    Temporal(#[from] TemporalIndexError),

    /// Node store failure
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Delta encoder/store failure
    #[error(transparent)]
    Delta(#[from] DeltaError),

    /// Query engine failure
    #[error(transparent)]
    Query(#[from] QueryError),

    /// Malformed input outside any single component (e.g. coordinates with
    /// neither a spatial nor a temporal part)
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// An index invariant was violated during rebuild or tuning. Should be
    /// impossible; surfaced for diagnostics rather than recovery.
    #[error("index inconsistency detected: {0}")]
    IndexInconsistent(String),
}

/// Errors raised by the spatial index.
#[derive(Debug, Error)]
pub enum SpatialIndexError {
    /// Insert of a node that carries no spatial component
    #[error("cannot insert node {0} without spatial coordinates")]
    MissingSpatialCoordinate(String),

    /// NaN or infinite coordinate rejected at insert
    #[error("node {0} has a non-finite spatial coordinate")]
    NonFiniteCoordinate(String),

    /// Degenerate shape, e.g. a polygon with fewer than three vertices
    #[error("invalid shape: {0}")]
    InvalidShape(String),
}

/// Errors raised by the temporal index.
#[derive(Debug, Error)]
pub enum TemporalIndexError {
    /// Insert of a node that carries no temporal component
    #[error("cannot insert node {0} without temporal coordinates")]
    MissingTemporalCoordinate(String),

    /// Time-series interval must be a positive number of seconds
    #[error("invalid time-series interval: {0}")]
    InvalidInterval(f64),
}

/// Errors raised by node store implementations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Lookup of an id that is not present
    #[error("node {0} not found")]
    NotFound(String),

    /// Operation on a closed store
    #[error("node store is closed")]
    Closed,

    /// Underlying file I/O failure
    #[error("storage I/O failure: {0}")]
    Io(#[from] std::io::Error),

    /// Node record could not be (de)serialized
    #[error("node serialization failure: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A log record was readable but structurally invalid
    #[error("corrupt record in append log: {0}")]
    Corrupt(String),
}

/// Errors raised by the delta encoder and store.
#[derive(Debug, Error)]
pub enum DeltaError {
    /// No delta recorded for the requested `(node_id, version)`
    #[error("no delta recorded for node {node_id} at version {version}")]
    NotFound { node_id: String, version: u64 },

    /// A version is missing from the middle of a reconstruction chain
    #[error("delta chain for node {node_id} is missing version {version}")]
    BrokenChain { node_id: String, version: u64 },

    /// Reconstruction asked to go backwards in time
    #[error("base version {base} is newer than target version {target}")]
    BaseNewerThanTarget { base: u64, target: u64 },

    /// Merge over a range that does not contain at least two deltas
    #[error("merge range {start}..={end} for node {node_id} holds fewer than two deltas")]
    MergeRangeTooSmall {
        node_id: String,
        start: u64,
        end: u64,
    },

    /// Merge range bounds are not a valid version interval
    #[error("invalid merge range {start}..={end}")]
    InvalidRange { start: u64, end: u64 },

    /// Underlying file I/O failure
    #[error("delta store I/O failure: {0}")]
    Io(#[from] std::io::Error),

    /// Delta could not be (de)serialized
    #[error("delta serialization failure: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors raised by the query engine.
#[derive(Debug, Error)]
pub enum QueryError {
    /// Malformed query or criteria rejected at construction
    #[error("invalid query: {0}")]
    InvalidQuery(String),

    /// An index failed while executing the query; the cause is preserved
    #[error("index failure while executing query: {0}")]
    Index(#[source] Box<CoreError>),
}
