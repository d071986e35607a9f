// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::time::Instant;

use log::{debug, info};

use crate::error::{HitError, Result};
use crate::frame::{Batch, CorrectedFrame, CorrectedImage, Frame};

/// Selects how the background is estimated for a batch.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DarkPolicyKind {
    /// The detector free-runs; the per-pixel median over all frames is the
    /// dark level.
    Median,
    /// The detector is triggered; even frames are pre-trigger darks for the
    /// odd frame that follows.
    Paired,
}

/// Estimated background, same dimensions as the frames it came from.
#[derive(Clone, Debug)]
pub struct DarkMap {
    image: CorrectedImage,
}

impl DarkMap {
    pub fn image(&self) -> &CorrectedImage {
        &self.image
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.image.dimensions()
    }
}

/// A dark policy bound to one batch. Built once via [DarkPolicy::prepare()];
/// downstream stages only see the resulting [CorrectedFrame]s.
#[derive(Clone, Debug)]
pub enum DarkPolicy {
    Median(DarkMap),
    Paired,
}

impl DarkPolicy {
    /// Does whatever up-front work `kind` needs for `batch`. For the median
    /// policy this builds the dark map, reporting percent complete through
    /// `progress`. For the paired policy the batch parity is checked.
    pub fn prepare(kind: DarkPolicyKind, batch: &Batch,
                   progress: &mut dyn FnMut(u32)) -> Result<DarkPolicy> {
        match kind {
            DarkPolicyKind::Median => {
                Ok(DarkPolicy::Median(estimate_median_dark(batch.frames(), progress)?))
            },
            DarkPolicyKind::Paired => {
                check_paired(batch)?;
                progress(100);
                Ok(DarkPolicy::Paired)
            },
        }
    }

    pub fn kind(&self) -> DarkPolicyKind {
        match self {
            DarkPolicy::Median(_) => DarkPolicyKind::Median,
            DarkPolicy::Paired => DarkPolicyKind::Paired,
        }
    }
}

fn check_paired(batch: &Batch) -> Result<()> {
    if batch.len() % 2 != 0 {
        return Err(HitError::InvalidInput(format!(
            "paired dark correction needs an even number of frames, got {}",
            batch.len())));
    }
    Ok(())
}

/// Builds a dark map whose value at each pixel is the median of that pixel
/// across `frames`. For an even frame count the two middle values are
/// averaged.
/// `progress` is called with the percentage of rows completed; it is called
/// at most once per percent and always ends with 100.
pub fn estimate_median_dark(frames: &[Frame], progress: &mut dyn FnMut(u32))
                            -> Result<DarkMap> {
    let dark_start = Instant::now();
    let Some(first) = frames.first() else {
        return Err(HitError::InvalidInput(
            "cannot estimate dark from zero frames".to_string()));
    };
    let (width, height) = first.dimensions();
    for frame in frames {
        if frame.dimensions() != (width, height) {
            let (w, h) = frame.dimensions();
            return Err(HitError::InvalidInput(format!(
                "frame {} is {}x{} but frame {} is {}x{}",
                frame.index(), w, h, first.index(), width, height)));
        }
    }
    let sources: Vec<&[u16]> = frames.iter().map(|f| f.image().as_raw().as_slice()).collect();
    let mut dark_pixels = Vec::<f32>::with_capacity((width * height) as usize);
    let mut column_values = Vec::<u16>::with_capacity(frames.len());
    let mut last_percent = 0;
    for rownum in 0..height {
        let row_start = (rownum * width) as usize;
        for offset in row_start..row_start + width as usize {
            column_values.clear();
            column_values.extend(sources.iter().map(|s| s[offset]));
            dark_pixels.push(median_of(&mut column_values));
        }
        let percent = (rownum + 1) * 100 / height;
        if percent != last_percent {
            progress(percent);
            last_percent = percent;
        }
    }
    if height == 0 {
        progress(100);
    }
    let image = CorrectedImage::from_raw(width, height, dark_pixels).ok_or_else(|| {
        HitError::InvalidInput(format!("cannot form {}x{} dark map", width, height))
    })?;
    info!("Median dark from {} frames of {}x{} built in {:?}",
          frames.len(), width, height, dark_start.elapsed());
    Ok(DarkMap{image})
}

// `values` must be non-empty. Reorders `values`.
fn median_of(values: &mut [u16]) -> f32 {
    let count = values.len();
    let mid = count / 2;
    let (lower, upper_median, _) = values.select_nth_unstable(mid);
    let upper_median = *upper_median as f32;
    if count % 2 == 1 {
        return upper_median;
    }
    let lower_median = *lower.iter().max().unwrap_or(&0) as f32;
    (lower_median + upper_median) / 2.0
}

/// Returns `frame` minus `dark`, without clamping.
pub fn subtract_dark(frame: &Frame, dark: &DarkMap) -> Result<CorrectedImage> {
    if frame.dimensions() != dark.dimensions() {
        let (fw, fh) = frame.dimensions();
        let (dw, dh) = dark.dimensions();
        return Err(HitError::InvalidInput(format!(
            "frame {} is {}x{} but dark map is {}x{}", frame.index(), fw, fh, dw, dh)));
    }
    let (width, height) = frame.dimensions();
    let pixels: Vec<f32> = frame.image().as_raw().iter()
        .zip(dark.image().as_raw().iter())
        .map(|(&raw, &dark)| raw as f32 - dark)
        .collect();
    CorrectedImage::from_raw(width, height, pixels).ok_or_else(|| {
        HitError::InvalidInput(format!("cannot form {}x{} corrected frame", width, height))
    })
}

/// Returns `post` minus `pre`, without clamping.
pub fn subtract_pair(pre: &Frame, post: &Frame) -> Result<CorrectedImage> {
    if pre.dimensions() != post.dimensions() {
        let (w0, h0) = pre.dimensions();
        let (w1, h1) = post.dimensions();
        return Err(HitError::InvalidInput(format!(
            "pre-trigger frame {} is {}x{} but post-trigger frame {} is {}x{}",
            pre.index(), w0, h0, post.index(), w1, h1)));
    }
    let (width, height) = post.dimensions();
    let pixels: Vec<f32> = post.image().as_raw().iter()
        .zip(pre.image().as_raw().iter())
        .map(|(&signal, &dark)| signal as f32 - dark as f32)
        .collect();
    CorrectedImage::from_raw(width, height, pixels).ok_or_else(|| {
        HitError::InvalidInput(format!("cannot form {}x{} corrected frame", width, height))
    })
}

/// Applies `policy` to every applicable frame of `batch`, preserving frame
/// order and timestamps. The median policy yields one corrected frame per raw
/// frame; the paired policy yields one per (even, odd) pair.
pub fn correct_batch(batch: &Batch, policy: &DarkPolicy) -> Result<Vec<CorrectedFrame>> {
    let correct_start = Instant::now();
    let corrected = match policy {
        DarkPolicy::Median(dark) => {
            let mut corrected = Vec::with_capacity(batch.len());
            for frame in batch.frames() {
                debug!("Dark-correcting frame {} of {}", frame.index() + 1, batch.len());
                corrected.push(CorrectedFrame{
                    index: frame.index(),
                    source_index: frame.index(),
                    timestamp: frame.timestamp(),
                    image: subtract_dark(frame, dark)?,
                });
            }
            corrected
        },
        DarkPolicy::Paired => {
            check_paired(batch)?;
            let mut corrected = Vec::with_capacity(batch.len() / 2);
            for (index, pair) in batch.frames().chunks_exact(2).enumerate() {
                let (pre, post) = (&pair[0], &pair[1]);
                debug!("Dark-correcting exposure {} of {}", index + 1, batch.len() / 2);
                corrected.push(CorrectedFrame{
                    index,
                    source_index: post.index(),
                    timestamp: pre.timestamp(),
                    image: subtract_pair(pre, post)?,
                });
            }
            corrected
        },
    };
    info!("Dark-corrected {} frames in {:?}", corrected.len(), correct_start.elapsed());
    Ok(corrected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use image::Luma;
    use crate::frame::RawImage;

    fn frame_from_fn(index: usize, width: u32, height: u32,
                     f: impl Fn(u32, u32) -> u16) -> Frame {
        Frame::new(index, RawImage::from_fn(width, height, |x, y| Luma([f(x, y)])))
    }

    fn batch_of(values: &[u16]) -> Batch {
        let images = values.iter()
            .map(|&v| RawImage::from_pixel(3, 2, Luma([v])))
            .collect();
        Batch::new(images).unwrap()
    }

    #[test]
    fn test_median_of() {
        assert_eq!(median_of(&mut [5]), 5.0);
        assert_eq!(median_of(&mut [9, 1, 5]), 5.0);
        assert_eq!(median_of(&mut [9, 1, 4, 6]), 5.0);
        assert_eq!(median_of(&mut [2, 3]), 2.5);
    }

    #[test]
    fn test_median_dark_odd_and_even_counts() {
        let batch = batch_of(&[10, 30, 20]);
        let dark = estimate_median_dark(batch.frames(), &mut |_| ()).unwrap();
        assert_eq!(dark.dimensions(), (3, 2));
        assert_eq!(dark.image().get_pixel(2, 1).0[0], 20.0);

        let batch = batch_of(&[10, 30, 20, 11]);
        let dark = estimate_median_dark(batch.frames(), &mut |_| ()).unwrap();
        assert_abs_diff_eq!(dark.image().get_pixel(0, 0).0[0], 15.5);
    }

    #[test]
    fn test_median_dark_within_pixel_range() {
        let frames: Vec<Frame> = (0..7_u32).map(|i| {
            frame_from_fn(i as usize, 8, 5, |x, y| ((x * 31 + y * 17 + i * 97) % 211) as u16)
        }).collect();
        let dark = estimate_median_dark(&frames, &mut |_| ()).unwrap();
        assert_eq!(dark.dimensions(), frames[0].dimensions());
        for y in 0..5 {
            for x in 0..8 {
                let values: Vec<u16> = frames.iter()
                    .map(|f| f.image().get_pixel(x, y).0[0]).collect();
                let lo = *values.iter().min().unwrap() as f32;
                let hi = *values.iter().max().unwrap() as f32;
                let d = dark.image().get_pixel(x, y).0[0];
                assert!(lo <= d && d <= hi, "pixel ({}, {}) dark {} outside [{}, {}]",
                        x, y, d, lo, hi);
            }
        }
    }

    #[test]
    fn test_median_dark_rejects_empty_and_mismatched() {
        match estimate_median_dark(&[], &mut |_| ()) {
            Err(HitError::InvalidInput(_)) => (),
            other => panic!("Expected InvalidInput, got {:?}", other),
        }
        let frames = vec![frame_from_fn(0, 4, 4, |_, _| 0),
                          frame_from_fn(1, 5, 4, |_, _| 0)];
        match estimate_median_dark(&frames, &mut |_| ()) {
            Err(HitError::InvalidInput(msg)) => assert!(msg.contains("5x4")),
            other => panic!("Expected InvalidInput, got {:?}", other),
        }
    }

    #[test]
    fn test_progress_reports() {
        let frames: Vec<Frame> = (0..3).map(|i| frame_from_fn(i, 4, 300, |_, _| 0)).collect();
        let mut reported = Vec::<u32>::new();
        estimate_median_dark(&frames, &mut |p| reported.push(p)).unwrap();
        assert_eq!(*reported.last().unwrap(), 100);
        assert!(reported.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(reported.len(), 100);
    }

    #[test]
    fn test_median_correction_allows_negative() {
        let batch = batch_of(&[10, 30, 20]);
        let policy = DarkPolicy::prepare(DarkPolicyKind::Median, &batch, &mut |_| ()).unwrap();
        assert_eq!(policy.kind(), DarkPolicyKind::Median);
        let corrected = correct_batch(&batch, &policy).unwrap();
        assert_eq!(corrected.len(), 3);
        assert_eq!(corrected[0].image.get_pixel(1, 1).0[0], -10.0);
        assert_eq!(corrected[1].image.get_pixel(1, 1).0[0], 10.0);
        assert_eq!(corrected[2].image.get_pixel(1, 1).0[0], 0.0);
        assert_eq!(corrected[2].source_index, 2);
        // Pixel (1, 0) holds the timestamp word.
        assert_eq!(corrected[1].timestamp, Some(30));
    }

    #[test]
    fn test_paired_correction() {
        let batch = batch_of(&[100, 150, 90, 80]);
        let policy = DarkPolicy::prepare(DarkPolicyKind::Paired, &batch, &mut |_| ()).unwrap();
        let corrected = correct_batch(&batch, &policy).unwrap();
        assert_eq!(corrected.len(), 2);
        assert_eq!(corrected[0].image.get_pixel(0, 0).0[0], 50.0);
        assert_eq!(corrected[1].image.get_pixel(0, 0).0[0], -10.0);
        assert_eq!(corrected[1].index, 1);
        assert_eq!(corrected[1].source_index, 3);
        // Timestamp comes from the pre-trigger frame.
        assert_eq!(corrected[1].timestamp, Some(90));
    }

    #[test]
    fn test_paired_rejects_odd_batch() {
        let batch = batch_of(&[1, 2, 3]);
        match DarkPolicy::prepare(DarkPolicyKind::Paired, &batch, &mut |_| ()) {
            Err(HitError::InvalidInput(msg)) => assert!(msg.contains("3")),
            other => panic!("Expected InvalidInput, got {:?}", other),
        }
        match correct_batch(&batch, &DarkPolicy::Paired) {
            Err(HitError::InvalidInput(_)) => (),
            other => panic!("Expected InvalidInput, got {:?}", other),
        }
    }

    #[test]
    fn test_subtract_dark_dimension_mismatch() {
        let batch = batch_of(&[1, 2, 3]);
        let dark = estimate_median_dark(batch.frames(), &mut |_| ()).unwrap();
        let other = frame_from_fn(0, 2, 2, |_, _| 0);
        match subtract_dark(&other, &dark) {
            Err(HitError::InvalidInput(_)) => (),
            other => panic!("Expected InvalidInput, got {:?}", other),
        }
    }
}  // mod tests.
