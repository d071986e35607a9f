//! Locates point-like energy depositions in a dark-corrected frame and
//! computes their Sum(1), Sum(9) and Sum(25) aggregates.
//!
//! The scan proceeds in stages:
//!
//! 1. A (2R+1)x(2R+1) maximum filter is run over the frame, clamping the
//!    window at the grid edges. With the default R = 1 every pixel brighter
//!    than its 8 neighbors is a maximum, regardless of brighter pixels
//!    further away.
//! 2. Pixels equal to their neighborhood maximum and above the threshold T
//!    are local-maximum candidates.
//! 3. 8-connected candidates are grouped, and each group is reduced to its
//!    intensity-weighted centroid. This collapses plateaus of equal value
//!    into a single hit.
//! 4. Centroids too close to the frame edge are rejected.
//! 5. Centroids that coincide with a bright pixel at the same position in
//!    another ADC channel's column stripe are rejected as readout noise.
//! 6. Surviving centroids have their aggregates computed. The 3x3 and 5x5
//!    sums are only recorded when at least one pixel of the window exceeds
//!    that window's gate threshold; otherwise the sum is zero.

use std::cmp;
use std::time::Instant;

use image::{GrayImage, Luma};
use imageproc::rect::Rect;
use imageproc::region_labelling::{connected_components, Connectivity};
use log::{debug, info};

use crate::error::{HitError, Result};
use crate::frame::CorrectedImage;

// Half widths of the Sum(9) and Sum(25) windows.
const SUM9_HALF_WIDTH: u32 = 1;
const SUM25_HALF_WIDTH: u32 = 2;

/// Tunables for [find_peaks()].
#[derive(Clone, Debug, PartialEq)]
pub struct PeakFinderConfig {
    /// Local maximum threshold T, in corrected ADC counts.
    pub threshold: f32,

    /// Gate threshold for Sum(9). The 3x3 window is only summed if one of
    /// its pixels exceeds this value.
    pub gate_threshold_9: f32,

    /// Gate threshold for Sum(25), applied to the 5x5 window.
    pub gate_threshold_25: f32,

    /// Radius R of the maximum filter used for local maximum detection. A
    /// strict maximum within R of a brighter pixel is not detected, so radii
    /// above 1 trade missed close pairs for fewer candidates.
    pub max_filter_radius: u32,

    /// Centroids within this many pixels of any frame edge are discarded.
    pub edge_boundary: u32,

    /// Number of ADC channels. Each channel reads out a vertical stripe of
    /// width/adc_channels columns.
    pub adc_channels: u32,

    /// A centroid is discarded as readout noise if the pixel at the same
    /// stripe offset in another channel exceeds noise_fraction * threshold.
    pub noise_fraction: f32,
}

impl Default for PeakFinderConfig {
    fn default() -> Self {
        PeakFinderConfig{
            threshold: 80.0,
            gate_threshold_9: 40.0,
            gate_threshold_25: 40.0,
            max_filter_radius: 1,
            edge_boundary: 2,
            adc_channels: 16,
            noise_fraction: 0.5,
        }
    }
}

impl PeakFinderConfig {
    pub fn validate(&self) -> Result<()> {
        if !self.threshold.is_finite() || !self.gate_threshold_9.is_finite() ||
            !self.gate_threshold_25.is_finite() {
            return Err(HitError::Configuration(format!(
                "thresholds must be finite, got T={} gates {} and {}",
                self.threshold, self.gate_threshold_9, self.gate_threshold_25)));
        }
        if self.adc_channels == 0 {
            return Err(HitError::Configuration(
                "adc_channels must be at least 1".to_string()));
        }
        if !self.noise_fraction.is_finite() || self.noise_fraction < 0.0 {
            return Err(HitError::Configuration(format!(
                "noise_fraction must be finite and non-negative, got {}",
                self.noise_fraction)));
        }
        if self.min_grid_size().is_none() {
            return Err(HitError::Configuration(format!(
                "edge boundary {} with radius {} exceeds any frame size",
                self.edge_boundary, self.max_filter_radius)));
        }
        Ok(())
    }

    /// Smallest width/height a frame must have so that at least one pixel
    /// clears the edge boundary with its full maximum filter and Sum(25)
    /// windows. None if that size does not fit in a u32.
    pub fn min_grid_size(&self) -> Option<u32> {
        let half_width = cmp::max(self.max_filter_radius, SUM25_HALF_WIDTH);
        self.edge_boundary.checked_mul(2)?
            .checked_add(half_width.checked_mul(2)?)?
            .checked_add(1)
    }
}

/// A hit that survived every cut, with its aggregates.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PeakCoordinate {
    /// Intensity-weighted centroid, in pixel units. (0.0, 0.0) is the
    /// center of the upper left pixel.
    pub row: f32,
    pub col: f32,

    /// Corrected value of the pixel containing the centroid.
    pub sum1: f32,

    /// Sum over the 3x3 window around that pixel, or 0 if the gate was not
    /// passed.
    pub sum9: f32,

    /// Sum over the 5x5 window, gated the same way.
    pub sum25: f32,
}

impl PeakCoordinate {
    /// The (row, col) of the pixel containing the centroid.
    pub fn pixel(&self) -> (u32, u32) {
        (self.row as u32, self.col as u32)
    }
}

/// A connected group of local maximum candidates reduced to one point.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Centroid {
    pub row: f32,
    pub col: f32,

    /// Sum of the corrected values of the group's pixels.
    pub weight: f32,

    /// Number of candidate pixels in the group.
    pub pixel_count: u32,
}

impl Centroid {
    pub fn pixel(&self) -> (u32, u32) {
        (self.row as u32, self.col as u32)
    }
}

/// Everything [find_peaks()] learned about one frame.
#[derive(Clone, Debug, Default)]
pub struct PeakSearch {
    /// Surviving hits, in raster order of their candidate groups.
    pub peaks: Vec<PeakCoordinate>,

    /// Every centroid before the edge cut. Consumed by the cluster
    /// validator.
    pub raw_maxima: Vec<Centroid>,

    /// Centroids discarded for being too close to an edge.
    pub edge_cut_count: u32,

    /// Centroids discarded as cross-channel readout noise.
    pub noise_cut_count: u32,

    /// Centroids whose containing pixel did not exceed the threshold.
    pub below_threshold_count: u32,
}

// An iterator over the pixels of a region of interest. Yields pixels in raster
// scan order.
struct EnumeratePixels<'a> {
    image: &'a CorrectedImage,
    roi: &'a Rect,

    // Identifies the next pixel to be yielded. If cur_y is beyond the ROI's
    // bottom, the iteration is finished.
    cur_x: i32,
    cur_y: i32,
}

impl<'a> EnumeratePixels<'a> {
    fn new(image: &'a CorrectedImage, roi: &'a Rect) -> EnumeratePixels<'a> {
        let (width, height) = image.dimensions();
        assert!(roi.left() >= 0);
        assert!(roi.top() >= 0);
        assert!(roi.right() < width as i32);
        assert!(roi.bottom() < height as i32);
        EnumeratePixels{image, roi, cur_x: roi.left(), cur_y: roi.top()}
    }
}

impl<'a> Iterator for EnumeratePixels<'a> {
    type Item = (i32, i32, f32);  // x, y, pixel value.

    fn next(&mut self) -> Option<Self::Item> {
        if self.cur_y > self.roi.bottom() {
            return None;
        }
        let item: Self::Item = (self.cur_x, self.cur_y,
                                self.image.get_pixel(
                                    self.cur_x as u32, self.cur_y as u32).0[0]);
        if self.cur_x == self.roi.right() {
            self.cur_x = self.roi.left();
            self.cur_y += 1;
        } else {
            self.cur_x += 1;
        }
        Some(item)
    }
}

// Square window of the given half width centered on (row, col).
fn window(row: u32, col: u32, half_width: u32) -> Rect {
    Rect::at(col as i32 - half_width as i32, row as i32 - half_width as i32)
        .of_size(2 * half_width + 1, 2 * half_width + 1)
}

/// Returns an image whose value at each pixel is the maximum over the
/// (2*radius+1)x(2*radius+1) window centered there. The window is clamped to
/// the image.
pub fn neighborhood_max(image: &CorrectedImage, radius: u32) -> CorrectedImage {
    let (width, height) = image.dimensions();
    let (w, h) = (width as usize, height as usize);
    let r = radius as usize;
    let pixels = image.as_raw();
    // The filter is separable: rows first, then columns.
    // TODO: shard the rows across threads; each output pixel is independent.
    let mut row_max = vec![f32::NEG_INFINITY; w * h];
    for y in 0..h {
        let row_pixels = &pixels[y * w..(y + 1) * w];
        for x in 0..w {
            let lo = x.saturating_sub(r);
            let hi = cmp::min(x + r, w - 1);
            row_max[y * w + x] =
                row_pixels[lo..=hi].iter().copied().fold(f32::NEG_INFINITY, f32::max);
        }
    }
    CorrectedImage::from_fn(width, height, |x, y| {
        let (x, y) = (x as usize, y as usize);
        let lo = y.saturating_sub(r);
        let hi = cmp::min(y + r, h - 1);
        let column_max = (lo..=hi).map(|yy| row_max[yy * w + x])
            .fold(f32::NEG_INFINITY, f32::max);
        Luma([column_max])
    })
}

// Marks pixels that equal their neighborhood maximum and exceed `threshold`.
fn candidate_mask(image: &CorrectedImage, maxima: &CorrectedImage, threshold: f32)
                  -> (GrayImage, u32) {
    let (width, height) = image.dimensions();
    let mut candidate_count = 0_u32;
    let mut mask = GrayImage::new(width, height);
    for ((mask_pixel, value), max) in mask.iter_mut()
        .zip(image.as_raw().iter())
        .zip(maxima.as_raw().iter())
    {
        if *value == *max && *value > threshold {
            *mask_pixel = 255;
            candidate_count += 1;
        }
    }
    (mask, candidate_count)
}

/// Groups 8-connected local maximum candidates and reduces each group to its
/// intensity-weighted centroid. Centroids are returned in raster order of
/// the groups' labels.
pub fn find_local_maxima(image: &CorrectedImage, radius: u32, threshold: f32)
                         -> Vec<Centroid> {
    let scan_start = Instant::now();
    let maxima = neighborhood_max(image, radius);
    let (mask, candidate_count) = candidate_mask(image, &maxima, threshold);
    if candidate_count == 0 {
        debug!("No local maximum candidates above {}", threshold);
        return Vec::new();
    }
    let labels = connected_components(&mask, Connectivity::Eight, Luma([0_u8]));

    #[derive(Clone, Default)]
    struct Moments {
        count: u32,
        m0: f64,
        m1_row: f64,
        m1_col: f64,
        sum_row: f64,
        sum_col: f64,
    }
    let mut moments = Vec::<Moments>::new();
    for (x, y, label) in labels.enumerate_pixels() {
        let label = label.0[0] as usize;
        if label == 0 {
            continue;
        }
        if label >= moments.len() {
            moments.resize(label + 1, Moments::default());
        }
        let value = image.get_pixel(x, y).0[0] as f64;
        let m = &mut moments[label];
        m.count += 1;
        m.m0 += value;
        m.m1_row += y as f64 * value;
        m.m1_col += x as f64 * value;
        m.sum_row += y as f64;
        m.sum_col += x as f64;
    }
    let centroids: Vec<Centroid> = moments.iter().filter(|m| m.count > 0).map(|m| {
        // Weights are all above threshold; only a non-positive threshold can
        // leave a zero total, in which case fall back to the plain mean.
        let (row, col) = if m.m0 > 0.0 {
            (m.m1_row / m.m0, m.m1_col / m.m0)
        } else {
            (m.sum_row / m.count as f64, m.sum_col / m.count as f64)
        };
        Centroid{row: row as f32, col: col as f32,
                 weight: m.m0 as f32, pixel_count: m.count}
    }).collect();
    info!("Peak scan found {} candidates in {} groups in {:?}",
          candidate_count, centroids.len(), scan_start.elapsed());
    centroids
}

// True if the pixel at (row, col) is within `edge_boundary` of a frame edge or
// its Sum(25) window would leave the frame.
fn is_edge_hit(row: u32, col: u32, width: u32, height: u32, edge_boundary: u32) -> bool {
    let margin = cmp::max(edge_boundary, SUM25_HALF_WIDTH);
    row < margin || row >= height.saturating_sub(margin) ||
        col < margin || col >= width.saturating_sub(margin)
}

// True if any other ADC channel shows a pixel above `limit` at the same
// position within its stripe.
fn is_channel_noise(image: &CorrectedImage, row: u32, col: u32,
                    adc_channels: u32, limit: f32) -> bool {
    let width = image.width();
    let stripe_width = width / adc_channels;
    if adc_channels <= 1 || stripe_width == 0 {
        return false;
    }
    for k in 1..adc_channels {
        let check_col = (col + k * stripe_width) % width;
        let value = image.get_pixel(check_col, row).0[0];
        if value > limit {
            debug!("Noise coincidence for hit at ({}, {}): column {} has {}",
                   row, col, check_col, value);
            return true;
        }
    }
    false
}

// Sum of the window if any of its pixels exceeds `gate`, else zero.
fn gated_window_sum(image: &CorrectedImage, row: u32, col: u32,
                    half_width: u32, gate: f32) -> f32 {
    let roi = window(row, col, half_width);
    let mut sum = 0.0_f32;
    let mut passes_gate = false;
    for (_x, _y, value) in EnumeratePixels::new(image, &roi) {
        sum += value;
        passes_gate |= value > gate;
    }
    if passes_gate { sum } else { 0.0 }
}

/// Runs the hit extraction on one dark-corrected frame.
///
/// # Arguments
///   `image` - The corrected frame. Both dimensions must be at least
///   [PeakFinderConfig::min_grid_size()].
///
///   `config` - Thresholds and geometry; see [PeakFinderConfig].
///
/// # Returns
/// [PeakSearch] with the surviving hits and the cut counters. A frame with no
/// hits yields empty lists; this is not an error.
pub fn find_peaks(image: &CorrectedImage, config: &PeakFinderConfig) -> Result<PeakSearch> {
    config.validate()?;
    let (width, height) = image.dimensions();
    let min_size = config.min_grid_size().ok_or_else(|| HitError::Configuration(
        format!("edge boundary {} is too large", config.edge_boundary)))?;
    if width < min_size || height < min_size {
        return Err(HitError::InvalidInput(format!(
            "frame is {}x{} but radius {} with edge boundary {} needs at least {}x{}",
            width, height, config.max_filter_radius, config.edge_boundary,
            min_size, min_size)));
    }
    let find_start = Instant::now();
    let raw_maxima = find_local_maxima(image, config.max_filter_radius, config.threshold);
    let noise_limit = config.noise_fraction * config.threshold;

    let mut search = PeakSearch::default();
    for centroid in &raw_maxima {
        let (row, col) = centroid.pixel();
        if is_edge_hit(row, col, width, height, config.edge_boundary) {
            debug!("Edge cut for hit at ({}, {})", centroid.row, centroid.col);
            search.edge_cut_count += 1;
            continue;
        }
        if is_channel_noise(image, row, col, config.adc_channels, noise_limit) {
            search.noise_cut_count += 1;
            continue;
        }
        let sum1 = image.get_pixel(col, row).0[0];
        if sum1 <= config.threshold {
            debug!("Hit at ({}, {}) has containing pixel value {} at or below threshold",
                   centroid.row, centroid.col, sum1);
            search.below_threshold_count += 1;
            continue;
        }
        search.peaks.push(PeakCoordinate{
            row: centroid.row,
            col: centroid.col,
            sum1,
            sum9: gated_window_sum(image, row, col, SUM9_HALF_WIDTH, config.gate_threshold_9),
            sum25: gated_window_sum(image, row, col, SUM25_HALF_WIDTH,
                                    config.gate_threshold_25),
        });
    }
    search.raw_maxima = raw_maxima;
    info!("Found {} hits ({} edge cut, {} noise cut) in {:?}",
          search.peaks.len(), search.edge_cut_count, search.noise_cut_count,
          find_start.elapsed());
    Ok(search)
}

// mod tests.
