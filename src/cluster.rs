// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

//! Groups local maxima into spatial clusters by flat-kernel mean shift and
//! keeps the clusters that are both large and bright. Diffuse multi-pixel
//! depositions (beam spots, diffraction spots) show up as dense groups of
//! maxima; isolated single-electron hits do not.
//!
//! The kernel bandwidth comes from a [BandwidthEstimator]. The default,
//! [QuantileBandwidth], is the mean distance from each point to its k-th
//! nearest neighbor, k being a quantile of the (capped) sample size. Both it
//! and the mean shift itself are deterministic for a given input.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::time::Instant;

use log::{debug, info};

use crate::error::{HitError, Result};
use crate::frame::CorrectedImage;
use crate::peak_finder::Centroid;

/// A location in frame coordinates.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Point {
    pub row: f64,
    pub col: f64,
}

impl Point {
    pub fn new(row: f64, col: f64) -> Point {
        Point{row, col}
    }

    fn distance(&self, other: &Point) -> f64 {
        (self.row - other.row).hypot(self.col - other.col)
    }
}

/// Supplies the mean shift kernel bandwidth for a set of points.
pub trait BandwidthEstimator {
    /// Returns the bandwidth, in pixels. A result that is not positive means
    /// the points carry no usable scale; each point then forms its own
    /// cluster.
    fn estimate(&self, points: &[Point]) -> f64;
}

/// Mean over the sampled points of the distance to their k-th nearest
/// neighbor (the point itself counting as the first), where
/// k = max(1, floor(quantile * sample size)).
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct QuantileBandwidth {
    pub quantile: f64,

    /// At most this many points are used. Larger inputs are subsampled at an
    /// even stride.
    pub sample_cap: usize,
}

impl BandwidthEstimator for QuantileBandwidth {
    fn estimate(&self, points: &[Point]) -> f64 {
        if points.is_empty() || self.sample_cap == 0 {
            return 0.0;
        }
        let sample: Vec<Point> = if points.len() > self.sample_cap {
            (0..self.sample_cap).map(|i| points[i * points.len() / self.sample_cap]).collect()
        } else {
            points.to_vec()
        };
        let k = usize::max(1, (sample.len() as f64 * self.quantile) as usize);
        let k = usize::min(k, sample.len());
        let mut distances = Vec::<f64>::with_capacity(sample.len());
        let mut total = 0.0;
        for p in &sample {
            distances.clear();
            distances.extend(sample.iter().map(|q| p.distance(q)));
            let (_, kth, _) = distances.select_nth_unstable_by(k - 1, |a, b| a.total_cmp(b));
            total += *kth;
        }
        total / sample.len() as f64
    }
}

/// Always returns the same bandwidth. Useful when the spatial scale of the
/// clusters is known in advance.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FixedBandwidth(pub f64);

impl BandwidthEstimator for FixedBandwidth {
    fn estimate(&self, _points: &[Point]) -> f64 {
        self.0
    }
}

/// Tunables for [validate_clusters()].
#[derive(Clone, Debug, PartialEq)]
pub struct ClusterConfig {
    /// Quantile for the default bandwidth estimator. Lower values resolve
    /// fainter, smaller clusters.
    pub quantile: f64,

    /// Sample cap for the default bandwidth estimator.
    pub sample_cap: usize,

    /// A cluster is kept only if the summed corrected value of its members
    /// exceeds this.
    pub integral_threshold: f32,

    /// ... and if it has more members than this.
    pub size_threshold: u32,

    /// Per-seed iteration limit for the mean shift.
    pub max_iterations: u32,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        ClusterConfig{
            quantile: 0.4,
            sample_cap: 500,
            integral_threshold: 1.0e4,
            size_threshold: 100,
            max_iterations: 300,
        }
    }
}

impl ClusterConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.quantile > 0.0 && self.quantile <= 1.0) {
            return Err(HitError::Configuration(format!(
                "cluster quantile must be in (0, 1], got {}", self.quantile)));
        }
        if self.sample_cap == 0 {
            return Err(HitError::Configuration(
                "cluster sample cap must be at least 1".to_string()));
        }
        if !self.integral_threshold.is_finite() {
            return Err(HitError::Configuration(format!(
                "cluster integral threshold must be finite, got {}",
                self.integral_threshold)));
        }
        if self.max_iterations == 0 {
            return Err(HitError::Configuration(
                "cluster max_iterations must be at least 1".to_string()));
        }
        Ok(())
    }

    /// The estimator described by `quantile` and `sample_cap`.
    pub fn bandwidth_estimator(&self) -> QuantileBandwidth {
        QuantileBandwidth{quantile: self.quantile, sample_cap: self.sample_cap}
    }
}

/// One mean shift cluster.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Cluster {
    /// The cluster's mode.
    pub row: f32,
    pub col: f32,

    pub member_count: u32,

    /// Sum of the corrected values at the members' pixels.
    pub integral: f32,
}

/// Result of [validate_clusters()] for one frame.
#[derive(Clone, Debug, Default)]
pub struct ClusterReport {
    pub bandwidth: f64,

    /// Number of clusters found, retained or not.
    pub cluster_count: usize,

    /// Clusters passing both the integral and size thresholds.
    pub retained: Vec<Cluster>,
}

/// Flat-kernel mean shift with bin seeding.
/// Returns the cluster modes (most populated first) and, for each input
/// point, the index of its nearest mode.
pub fn mean_shift(points: &[Point], bandwidth: f64, max_iterations: u32)
                  -> (Vec<Point>, Vec<usize>) {
    if points.is_empty() {
        return (Vec::new(), Vec::new());
    }
    if !(bandwidth > 0.0 && bandwidth.is_finite()) {
        debug!("Degenerate bandwidth {}; every point is its own cluster", bandwidth);
        return (points.to_vec(), (0..points.len()).collect());
    }
    let stop_distance = 1.0e-3 * bandwidth;

    // Seed from the occupied cells of a grid with bandwidth spacing. If every
    // point lands in its own cell, seeding from the points is equivalent and
    // exact.
    let mut bins = BTreeMap::<(i64, i64), u32>::new();
    for p in points {
        let key = ((p.row / bandwidth).round() as i64, (p.col / bandwidth).round() as i64);
        *bins.entry(key).or_insert(0) += 1;
    }
    let seeds: Vec<Point> = if bins.len() == points.len() {
        points.to_vec()
    } else {
        bins.keys().map(|&(r, c)| Point::new(r as f64 * bandwidth,
                                              c as f64 * bandwidth)).collect()
    };

    // (mode, number of points within bandwidth of the mode)
    let mut modes = Vec::<(Point, usize)>::new();
    for seed in seeds {
        let mut mean = seed;
        let mut within_count = 0;
        for _ in 0..max_iterations {
            let mut sum_row = 0.0;
            let mut sum_col = 0.0;
            let mut count = 0;
            for p in points {
                if p.distance(&mean) <= bandwidth {
                    sum_row += p.row;
                    sum_col += p.col;
                    count += 1;
                }
            }
            if count == 0 {
                break;
            }
            let old_mean = mean;
            mean = Point::new(sum_row / count as f64, sum_col / count as f64);
            within_count = count;
            if mean.distance(&old_mean) <= stop_distance {
                break;
            }
        }
        if within_count > 0 {
            modes.push((mean, within_count));
        }
    }
    modes.sort_by(|a, b| {
        b.1.cmp(&a.1)
            .then(b.0.row.total_cmp(&a.0.row))
            .then(b.0.col.total_cmp(&a.0.col))
    });

    // Suppress modes within bandwidth of a more populated one.
    let mut centers = Vec::<Point>::new();
    for (mode, _count) in modes {
        if centers.iter().all(|c| c.distance(&mode) > bandwidth) {
            centers.push(mode);
        }
    }

    let labels = points.iter().map(|p| {
        centers.iter().enumerate()
            .min_by(|(_, a), (_, b)| {
                p.distance(a).partial_cmp(&p.distance(b)).unwrap_or(Ordering::Equal)
            })
            .map(|(i, _)| i)
            .unwrap_or(0)
    }).collect();
    (centers, labels)
}

/// Clusters the local maxima of one frame and keeps the clusters whose
/// integral and member count both exceed the configured thresholds.
///
/// # Arguments
///   `image` - The corrected frame the maxima were found in; supplies the
///   values summed into each cluster's integral.
///
///   `maxima` - Centroids of all local maxima, before any edge or noise cut.
///
///   `config` - Thresholds; see [ClusterConfig].
///
///   `estimator` - Source of the mean shift bandwidth. Typically
///   `config.bandwidth_estimator()`.
pub fn validate_clusters(image: &CorrectedImage, maxima: &[Centroid],
                         config: &ClusterConfig,
                         estimator: &dyn BandwidthEstimator) -> Result<ClusterReport> {
    config.validate()?;
    if maxima.is_empty() {
        return Ok(ClusterReport::default());
    }
    let cluster_start = Instant::now();
    let (width, height) = image.dimensions();
    let points: Vec<Point> = maxima.iter()
        .map(|m| Point::new(m.row as f64, m.col as f64))
        .collect();
    let bandwidth = estimator.estimate(&points);
    let (centers, labels) = mean_shift(&points, bandwidth, config.max_iterations);

    let mut clusters: Vec<Cluster> = centers.iter().map(|c| Cluster{
        row: c.row as f32, col: c.col as f32, member_count: 0, integral: 0.0,
    }).collect();
    for (maximum, &label) in maxima.iter().zip(labels.iter()) {
        let (row, col) = maximum.pixel();
        if row >= height || col >= width {
            continue;
        }
        let cluster = &mut clusters[label];
        cluster.member_count += 1;
        cluster.integral += image.get_pixel(col, row).0[0];
    }

    let cluster_count = clusters.len();
    let mut retained = Vec::<Cluster>::new();
    for (index, cluster) in clusters.into_iter().enumerate() {
        let keep = cluster.integral > config.integral_threshold &&
            cluster.member_count > config.size_threshold;
        debug!("Cluster {} at ({:.1}, {:.1}): integral {} in {} maxima; {}",
               index, cluster.row, cluster.col, cluster.integral, cluster.member_count,
               if keep { "kept" } else { "discarded" });
        if keep {
            retained.push(cluster);
        }
    }
    info!("Bandwidth {:.2}: {} of {} clusters passed cuts in {:?}",
          bandwidth, retained.len(), cluster_count, cluster_start.elapsed());
    Ok(ClusterReport{bandwidth, cluster_count, retained})
}

// mod tests.
