//! Approximate k-means (Lloyd's algorithm) over record centroids.
//!
//! Distances are squared Euclidean in (lat, lon) degree space rather than
//! geodesic, which is adequate at the zoom levels clusters are drawn at.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::Serialize;
use serde_json::json;
use tracing::{debug, trace};

use crate::config::DEFAULT_CLUSTER_ITERATIONS;
use crate::errors::{AppError, AppResult};
use crate::geometry::GeoPoint;
use crate::model::{Feature, FeatureId};

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ClusterCentroid {
    pub lat: f64,
    pub lon: f64,
    pub count: usize,
}

impl ClusterCentroid {
    fn seeded(point: GeoPoint) -> Self {
        Self {
            lat: point.lat,
            lon: point.lon,
            count: 0,
        }
    }

    fn distance_sq(&self, point: &GeoPoint) -> f64 {
        (self.lat - point.lat).powi(2) + (self.lon - point.lon).powi(2)
    }

    pub fn to_feature(&self, index: usize) -> Feature {
        Feature::new(
            FeatureId::Key(format!("cluster:{index}")),
            serde_json::Map::new(),
            json!({ "type": "Point", "coordinates": [self.lon, self.lat] }),
        )
        .with_property("count", self.count)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClusterOptions {
    iterations: usize,
    tolerance: Option<f64>,
}

impl ClusterOptions {
    /// `tolerance` enables an early exit once no centroid moves further than
    /// it (in degrees); without it exactly `iterations` passes run.
    pub fn new(iterations: usize, tolerance: Option<f64>) -> AppResult<Self> {
        if iterations == 0 {
            return Err(AppError::invalid("cluster iterations must be at least 1"));
        }
        if let Some(value) = tolerance {
            if !value.is_finite() || value < 0.0 {
                return Err(AppError::invalid("cluster tolerance must be non-negative"));
            }
        }
        Ok(Self {
            iterations,
            tolerance,
        })
    }

    pub fn iterations(&self) -> usize {
        self.iterations
    }
}

impl Default for ClusterOptions {
    fn default() -> Self {
        Self {
            iterations: DEFAULT_CLUSTER_ITERATIONS,
            tolerance: None,
        }
    }
}

pub struct ClusterEngine {
    options: ClusterOptions,
    rng: Arc<Mutex<StdRng>>,
}

impl ClusterEngine {
    pub fn new(options: ClusterOptions) -> Self {
        Self::with_rng(options, StdRng::from_entropy())
    }

    pub fn with_rng(options: ClusterOptions, rng: StdRng) -> Self {
        Self {
            options,
            rng: Arc::new(Mutex::new(rng)),
        }
    }

    pub fn options(&self) -> ClusterOptions {
        self.options
    }

    /// Groups `points` into at most `k` clusters.
    ///
    /// `k` shrinks to the number of distinct points when there are fewer.
    pub fn cluster(&self, k: usize, points: &[GeoPoint]) -> AppResult<Vec<ClusterCentroid>> {
        if k == 0 {
            return Err(AppError::invalid("cluster count must be at least 1"));
        }
        if points.is_empty() {
            return Ok(Vec::new());
        }
        let effective_k = k.min(distinct_points(points));

        let initial: Vec<ClusterCentroid> = {
            let mut rng = self.rng.lock();
            (0..effective_k)
                .map(|_| ClusterCentroid::seeded(points[rng.gen_range(0..points.len())]))
                .collect()
        };
        debug!(
            requested = k,
            effective_k,
            points = points.len(),
            "clustering record centroids"
        );
        Ok(refine(initial, points, self.options))
    }
}

fn distinct_points(points: &[GeoPoint]) -> usize {
    points
        .iter()
        .map(|p| (p.lat.to_bits(), p.lon.to_bits()))
        .collect::<HashSet<_>>()
        .len()
}

fn nearest_centroid(centroids: &[ClusterCentroid], point: &GeoPoint) -> usize {
    let mut best = 0;
    let mut best_dist = f64::INFINITY;
    for (idx, centroid) in centroids.iter().enumerate() {
        let dist = centroid.distance_sq(point);
        if dist < best_dist {
            best_dist = dist;
            best = idx;
        }
    }
    best
}

pub(crate) fn refine(
    mut centroids: Vec<ClusterCentroid>,
    points: &[GeoPoint],
    options: ClusterOptions,
) -> Vec<ClusterCentroid> {
    for iteration in 0..options.iterations {
        let mut sums = vec![(0.0_f64, 0.0_f64); centroids.len()];
        let mut counts = vec![0_usize; centroids.len()];
        for point in points {
            let idx = nearest_centroid(&centroids, point);
            sums[idx].0 += point.lat;
            sums[idx].1 += point.lon;
            counts[idx] += 1;
        }

        let mut max_shift = 0.0_f64;
        for (idx, centroid) in centroids.iter_mut().enumerate() {
            centroid.count = counts[idx];
            if counts[idx] == 0 {
                continue;
            }
            let n = counts[idx] as f64;
            let lat = sums[idx].0 / n;
            let lon = sums[idx].1 / n;
            let shift = ((centroid.lat - lat).powi(2) + (centroid.lon - lon).powi(2)).sqrt();
            max_shift = max_shift.max(shift);
            centroid.lat = lat;
            centroid.lon = lon;
        }

        trace!(iteration, max_shift, "k-means iteration complete");
        if let Some(tolerance) = options.tolerance {
            if max_shift <= tolerance {
                break;
            }
        }
    }
    centroids
}
