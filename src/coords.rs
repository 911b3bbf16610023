//! Coordinate value types: spatial points, temporal instants, and the
//! combined [`Coordinates`] every node carries.
//!
//! All coordinate types are immutable values. A node enters the spatial
//! index iff its spatial component is present and the temporal index iff
//! its temporal component is present; [`Coordinates::new`] guarantees at
//! least one of the two exists.

use crate::error::{CoreError, Result};
use chrono::{DateTime, Datelike, Timelike, Utc};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

/// Seconds per day, used to normalize temporal distance when combining it
/// with spatial distance into a single scalar.
const SECONDS_PER_DAY: f64 = 86_400.0;

/// Distance metrics for spatial queries.
///
/// Configured once per index instance and used uniformly for
/// nearest-neighbor queries and cache-key equivalence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistanceMetric {
    /// Euclidean distance (L2 norm)
    #[default]
    Euclidean,
    /// Manhattan distance (L1 norm)
    Manhattan,
    /// Chebyshev distance (L-infinity norm)
    Chebyshev,
}

impl DistanceMetric {
    /// Distance between two dimension slices. Slices of unequal length are
    /// compared over their common prefix; callers that need zero-padding
    /// resize the points first.
    pub fn distance(&self, a: &[f64], b: &[f64]) -> f64 {
        let pairs = a.iter().zip(b.iter());
        match self {
            DistanceMetric::Euclidean => pairs
                .map(|(x, y)| (x - y) * (x - y))
                .sum::<f64>()
                .sqrt(),
            DistanceMetric::Manhattan => pairs.map(|(x, y)| (x - y).abs()).sum(),
            DistanceMetric::Chebyshev => pairs.map(|(x, y)| (x - y).abs()).fold(0.0, f64::max),
        }
    }
}

/// A point in n-dimensional space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpatialPoint {
    dimensions: SmallVec<[f64; 4]>,
}

impl SpatialPoint {
    /// Create a point from its dimension values.
    pub fn new(dimensions: impl IntoIterator<Item = f64>) -> Self {
        Self {
            dimensions: dimensions.into_iter().collect(),
        }
    }

    /// The dimension values.
    pub fn dimensions(&self) -> &[f64] {
        &self.dimensions
    }

    /// Number of dimensions.
    pub fn dimensionality(&self) -> usize {
        self.dimensions.len()
    }

    /// Value of dimension `i`, zero beyond the stored dimensionality.
    pub fn get(&self, i: usize) -> f64 {
        self.dimensions.get(i).copied().unwrap_or(0.0)
    }

    /// Copy of this point zero-padded or truncated to `dimension` values.
    /// Dimensionality mismatches are always resolved this way, silently.
    pub fn resized(&self, dimension: usize) -> SpatialPoint {
        let mut dims: SmallVec<[f64; 4]> = SmallVec::with_capacity(dimension);
        for i in 0..dimension {
            dims.push(self.get(i));
        }
        SpatialPoint { dimensions: dims }
    }

    /// Whether every dimension is a finite number.
    pub fn is_finite(&self) -> bool {
        self.dimensions.iter().all(|d| d.is_finite())
    }

    /// Euclidean distance to another point; the shorter point is
    /// zero-padded to the longer dimensionality.
    pub fn distance_to(&self, other: &SpatialPoint) -> f64 {
        let max_dim = self.dimensionality().max(other.dimensionality());
        (0..max_dim)
            .map(|i| {
                let d = self.get(i) - other.get(i);
                d * d
            })
            .sum::<f64>()
            .sqrt()
    }
}

impl From<&[f64]> for SpatialPoint {
    fn from(dims: &[f64]) -> Self {
        SpatialPoint::new(dims.iter().copied())
    }
}

impl<const N: usize> From<[f64; N]> for SpatialPoint {
    fn from(dims: [f64; N]) -> Self {
        SpatialPoint::new(dims)
    }
}

/// Calendar precision of a temporal instant, coarsest first.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum TemporalPrecision {
    Year,
    Month,
    Day,
    Hour,
    Minute,
    #[default]
    Second,
    Microsecond,
}

/// A point in time at a stated precision.
///
/// Equality at a given precision ignores finer calendar fields; distance
/// is measured in absolute seconds regardless of precision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemporalInstant {
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub precision: TemporalPrecision,
}

impl TemporalInstant {
    /// Create an instant at the default (second) precision.
    pub fn new(timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            precision: TemporalPrecision::default(),
        }
    }

    /// Create an instant with an explicit precision.
    pub fn with_precision(timestamp: DateTime<Utc>, precision: TemporalPrecision) -> Self {
        Self {
            timestamp,
            precision,
        }
    }

    /// Create an instant from fractional unix epoch seconds. Values outside
    /// the representable datetime range clamp to the unix epoch.
    pub fn from_epoch_seconds(seconds: f64) -> Self {
        let secs = seconds.floor();
        let nanos = ((seconds - secs) * 1e9).round() as u32;
        let timestamp = DateTime::from_timestamp(secs as i64, nanos.min(999_999_999))
            .unwrap_or(DateTime::UNIX_EPOCH);
        Self::new(timestamp)
    }

    /// Fractional unix epoch seconds.
    pub fn epoch_seconds(&self) -> f64 {
        self.timestamp.timestamp() as f64 + self.timestamp.timestamp_subsec_nanos() as f64 * 1e-9
    }

    /// Absolute distance to another instant, in seconds.
    pub fn distance_to(&self, other: &TemporalInstant) -> f64 {
        let delta = self.timestamp.signed_duration_since(other.timestamp);
        (delta.num_seconds() as f64 + delta.subsec_nanos() as f64 * 1e-9).abs()
    }

    /// Whether this instant is strictly earlier than `other`.
    pub fn precedes(&self, other: &TemporalInstant) -> bool {
        self.timestamp < other.timestamp
    }

    /// Equality down to the coarser of the two stated precisions.
    ///
    /// With `Day` precision, for example, only year, month, and day take
    /// part in the comparison.
    pub fn equals_at_precision(&self, other: &TemporalInstant) -> bool {
        let precision = self.precision.min(other.precision);
        let (a, b) = (&self.timestamp, &other.timestamp);

        let fields = [
            a.year() == b.year(),
            a.month() == b.month(),
            a.day() == b.day(),
            a.hour() == b.hour(),
            a.minute() == b.minute(),
            a.second() == b.second(),
            a.timestamp_subsec_micros() == b.timestamp_subsec_micros(),
        ];

        let depth = precision as usize + 1;
        fields.iter().take(depth).all(|eq| *eq)
    }
}

/// Combined spatial and temporal coordinates; at least one component is
/// always present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spatial: Option<SpatialPoint>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temporal: Option<TemporalInstant>,
}

impl Coordinates {
    /// Build coordinates from optional components. Fails when both are
    /// absent.
    pub fn new(spatial: Option<SpatialPoint>, temporal: Option<TemporalInstant>) -> Result<Self> {
        if spatial.is_none() && temporal.is_none() {
            return Err(CoreError::InvalidInput(
                "coordinates require at least one of a spatial or temporal component".into(),
            ));
        }
        Ok(Self { spatial, temporal })
    }

    /// Purely spatial coordinates.
    pub fn spatial(point: SpatialPoint) -> Self {
        Self {
            spatial: Some(point),
            temporal: None,
        }
    }

    /// Purely temporal coordinates.
    pub fn temporal(instant: TemporalInstant) -> Self {
        Self {
            spatial: None,
            temporal: Some(instant),
        }
    }

    /// Coordinates with both components.
    pub fn spatio_temporal(point: SpatialPoint, instant: TemporalInstant) -> Self {
        Self {
            spatial: Some(point),
            temporal: Some(instant),
        }
    }

    /// Hybrid distance to another set of coordinates.
    ///
    /// Euclidean spatial distance and day-normalized temporal distance are
    /// combined into a single scalar; when either side is missing a
    /// component the remaining dimension alone decides.
    pub fn distance_to(&self, other: &Coordinates) -> f64 {
        let spatial_dist = match (&self.spatial, &other.spatial) {
            (Some(a), Some(b)) => a.distance_to(b),
            _ => 0.0,
        };
        let temporal_dist = match (&self.temporal, &other.temporal) {
            (Some(a), Some(b)) => a.distance_to(b) / SECONDS_PER_DAY,
            _ => 0.0,
        };

        if self.spatial.is_none() || other.spatial.is_none() {
            return temporal_dist;
        }
        if self.temporal.is_none() || other.temporal.is_none() {
            return spatial_dist;
        }

        (spatial_dist * spatial_dist + temporal_dist * temporal_dist).sqrt()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    #[test]
    fn metric_distances() {
        let a = [0.0, 0.0, 0.0];
        let b = [3.0, 4.0, 0.0];

        assert_eq!(DistanceMetric::Euclidean.distance(&a, &b), 5.0);
        assert_eq!(DistanceMetric::Manhattan.distance(&a, &b), 7.0);
        assert_eq!(DistanceMetric::Chebyshev.distance(&a, &b), 4.0);
    }

    #[test]
    fn point_resize_pads_and_truncates() {
        let p = SpatialPoint::from([1.0, 2.0]);

        let padded = p.resized(4);
        assert_eq!(padded.dimensions(), &[1.0, 2.0, 0.0, 0.0]);

        let truncated = SpatialPoint::from([1.0, 2.0, 3.0]).resized(2);
        assert_eq!(truncated.dimensions(), &[1.0, 2.0]);
    }

    #[test]
    fn point_distance_pads_shorter_side() {
        let a = SpatialPoint::from([3.0, 4.0]);
        let b = SpatialPoint::from([0.0, 0.0, 0.0]);
        assert_eq!(a.distance_to(&b), 5.0);
    }

    #[test]
    fn point_finite_check() {
        assert!(SpatialPoint::from([1.0, 2.0]).is_finite());
        assert!(!SpatialPoint::from([1.0, f64::NAN]).is_finite());
        assert!(!SpatialPoint::from([f64::INFINITY]).is_finite());
    }

    #[test]
    fn instant_distance_in_seconds() {
        let a = TemporalInstant::new(utc(2024, 1, 1, 0, 0, 0));
        let b = TemporalInstant::new(utc(2024, 1, 1, 0, 10, 0));
        assert_eq!(a.distance_to(&b), 600.0);
        assert_eq!(b.distance_to(&a), 600.0);
        assert!(a.precedes(&b));
    }

    #[test]
    fn instant_epoch_round_trip() {
        let a = TemporalInstant::from_epoch_seconds(1_700_000_000.25);
        assert!((a.epoch_seconds() - 1_700_000_000.25).abs() < 1e-6);
    }

    #[test]
    fn precision_equality_ignores_finer_fields() {
        let morning = TemporalInstant::with_precision(
            utc(2024, 5, 17, 9, 15, 0),
            TemporalPrecision::Day,
        );
        let evening = TemporalInstant::with_precision(
            utc(2024, 5, 17, 21, 45, 30),
            TemporalPrecision::Day,
        );
        let next_day = TemporalInstant::with_precision(
            utc(2024, 5, 18, 9, 15, 0),
            TemporalPrecision::Day,
        );

        assert!(morning.equals_at_precision(&evening));
        assert!(!morning.equals_at_precision(&next_day));
    }

    #[test]
    fn precision_comparison_uses_coarser_side() {
        let fine = TemporalInstant::with_precision(
            utc(2024, 5, 17, 9, 15, 0),
            TemporalPrecision::Second,
        );
        let coarse = TemporalInstant::with_precision(
            utc(2024, 5, 17, 23, 0, 0),
            TemporalPrecision::Day,
        );
        assert!(fine.equals_at_precision(&coarse));
    }

    #[test]
    fn coordinates_require_a_component() {
        assert!(Coordinates::new(None, None).is_err());
        assert!(Coordinates::new(Some(SpatialPoint::from([1.0])), None).is_ok());
        assert!(
            Coordinates::new(None, Some(TemporalInstant::new(utc(2024, 1, 1, 0, 0, 0)))).is_ok()
        );
    }

    #[test]
    fn hybrid_distance_normalizes_temporal_to_days() {
        let t0 = TemporalInstant::new(utc(2024, 1, 1, 0, 0, 0));
        let t1 = TemporalInstant::new(utc(2024, 1, 2, 0, 0, 0));

        let a = Coordinates::spatio_temporal(SpatialPoint::from([0.0, 0.0]), t0.clone());
        let b = Coordinates::spatio_temporal(SpatialPoint::from([3.0, 4.0]), t1.clone());

        // 5.0 spatial, 1.0 day temporal
        let expected = (25.0f64 + 1.0).sqrt();
        assert!((a.distance_to(&b) - expected).abs() < 1e-9);

        // Single-sided cases fall back to the present dimension
        let only_spatial = Coordinates::spatial(SpatialPoint::from([3.0, 4.0]));
        assert_eq!(a.distance_to(&only_spatial), 5.0);

        let only_temporal = Coordinates::temporal(t1);
        assert_eq!(a.distance_to(&only_temporal), 1.0);
    }

    #[test]
    fn serde_round_trip() {
        let coords = Coordinates::spatio_temporal(
            SpatialPoint::from([1.5, -2.5, 3.0]),
            TemporalInstant::with_precision(utc(2024, 3, 1, 12, 0, 0), TemporalPrecision::Minute),
        );
        let json = serde_json::to_string(&coords).unwrap();
        let back: Coordinates = serde_json::from_str(&json).unwrap();
        assert_eq!(coords, back);
    }
}
