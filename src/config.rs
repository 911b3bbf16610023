//! Configuration for the combined index and the query engine.
//!
//! Both structs are serializable, validated, and built up with `with_*`
//! methods.
//!
//! # Example
//!
//! ```rust
//! use chronotope::config::IndexConfig;
//!
//! let json = r#"{
//!     "spatial_dimension": 2,
//!     "temporal_bucket_minutes": 10,
//!     "auto_tuning": true
//! }"#;
//! let config = IndexConfig::from_json(json).unwrap();
//! assert_eq!(config.temporal_bucket_minutes, 10);
//! ```

use crate::coords::DistanceMetric;
use serde::de::Error;
use serde::{Deserialize, Serialize};

/// Configuration for [`TemporalSpatialIndex`](crate::TemporalSpatialIndex).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexConfig {
    /// Dimensionality of the spatial index; query and node points are
    /// zero-padded or truncated to fit.
    #[serde(default = "IndexConfig::default_spatial_dimension")]
    pub spatial_dimension: usize,

    /// Distance metric used for nearest-neighbor queries.
    #[serde(default)]
    pub distance_metric: DistanceMetric,

    /// Temporal bucket granularity in minutes.
    #[serde(default = "IndexConfig::default_bucket_minutes")]
    pub temporal_bucket_minutes: u32,

    /// Whether the index periodically inspects the temporal bucket
    /// distribution and shrinks the bucket size when it degrades.
    #[serde(default)]
    pub auto_tuning: bool,

    /// Number of queries between auto-tuning checks.
    #[serde(default = "IndexConfig::default_tune_check_interval")]
    pub tune_check_interval: u64,

    /// Rebucket when the largest bucket exceeds this multiple of the
    /// average bucket size.
    #[serde(default = "IndexConfig::default_tune_imbalance_ratio")]
    pub tune_imbalance_ratio: f64,

    /// Rebucket when the average bucket size exceeds this many entries.
    #[serde(default = "IndexConfig::default_tune_avg_threshold")]
    pub tune_avg_threshold: f64,
}

impl IndexConfig {
    const fn default_spatial_dimension() -> usize {
        3
    }

    const fn default_bucket_minutes() -> u32 {
        60
    }

    const fn default_tune_check_interval() -> u64 {
        100
    }

    const fn default_tune_imbalance_ratio() -> f64 {
        5.0
    }

    const fn default_tune_avg_threshold() -> f64 {
        500.0
    }

    pub fn with_spatial_dimension(mut self, dimension: usize) -> Self {
        assert!(dimension >= 1, "Spatial dimension must be at least 1");
        self.spatial_dimension = dimension;
        self
    }

    pub fn with_distance_metric(mut self, metric: DistanceMetric) -> Self {
        self.distance_metric = metric;
        self
    }

    pub fn with_temporal_bucket_minutes(mut self, minutes: u32) -> Self {
        assert!(minutes >= 1, "Temporal bucket size must be at least 1 minute");
        self.temporal_bucket_minutes = minutes;
        self
    }

    pub fn with_auto_tuning(mut self, enabled: bool) -> Self {
        self.auto_tuning = enabled;
        self
    }

    pub fn with_tune_check_interval(mut self, queries: u64) -> Self {
        assert!(queries >= 1, "Tune check interval must be at least 1");
        self.tune_check_interval = queries;
        self
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), String> {
        if self.spatial_dimension == 0 {
            return Err("Spatial dimension must be at least 1".to_string());
        }
        if self.temporal_bucket_minutes == 0 {
            return Err("Temporal bucket size must be at least 1 minute".to_string());
        }
        if self.tune_check_interval == 0 {
            return Err("Tune check interval must be at least 1".to_string());
        }
        if !self.tune_imbalance_ratio.is_finite() || self.tune_imbalance_ratio <= 1.0 {
            return Err("Tune imbalance ratio must be a finite value above 1".to_string());
        }
        if !self.tune_avg_threshold.is_finite() || self.tune_avg_threshold <= 0.0 {
            return Err("Tune average threshold must be a finite positive value".to_string());
        }
        Ok(())
    }

    /// Load configuration from a JSON string.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        let config: IndexConfig = serde_json::from_str(json)?;
        if let Err(e) = config.validate() {
            return Err(Error::custom(e));
        }
        Ok(config)
    }

    /// Save configuration as a JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            spatial_dimension: Self::default_spatial_dimension(),
            distance_metric: DistanceMetric::default(),
            temporal_bucket_minutes: Self::default_bucket_minutes(),
            auto_tuning: false,
            tune_check_interval: Self::default_tune_check_interval(),
            tune_imbalance_ratio: Self::default_tune_imbalance_ratio(),
            tune_avg_threshold: Self::default_tune_avg_threshold(),
        }
    }
}

/// Configuration for [`QueryEngine`](crate::QueryEngine).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Maximum number of cached query results.
    #[serde(default = "EngineConfig::default_cache_capacity")]
    pub cache_capacity: usize,
}

impl EngineConfig {
    const fn default_cache_capacity() -> usize {
        128
    }

    pub fn with_cache_capacity(mut self, capacity: usize) -> Self {
        assert!(capacity >= 1, "Cache capacity must be at least 1");
        self.cache_capacity = capacity;
        self
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.cache_capacity == 0 {
            return Err("Cache capacity must be at least 1".to_string());
        }
        Ok(())
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        let config: EngineConfig = serde_json::from_str(json)?;
        if let Err(e) = config.validate() {
            return Err(Error::custom(e));
        }
        Ok(config)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cache_capacity: Self::default_cache_capacity(),
        }
    }
}
