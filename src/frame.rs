// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use image::{ImageBuffer, Luma};

use crate::error::{HitError, Result};

/// Raw detector readout: one unsigned 16 bit ADC value per pixel.
pub type RawImage = ImageBuffer<Luma<u16>, Vec<u16>>;

/// Background-subtracted grid. Values may be negative.
pub type CorrectedImage = ImageBuffer<Luma<f32>, Vec<f32>>;

// The readout electronics overwrite one pixel of every frame with a running
// timestamp.
pub const TIMESTAMP_ROW: u32 = 0;
pub const TIMESTAMP_COL: u32 = 1;

/// One raw exposure. Immutable once read.
#[derive(Clone, Debug)]
pub struct Frame {
    index: usize,
    image: RawImage,
}

impl Frame {
    pub fn new(index: usize, image: RawImage) -> Frame {
        Frame{index, image}
    }

    /// Position of this frame within its batch.
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn image(&self) -> &RawImage {
        &self.image
    }

    /// (width, height)
    pub fn dimensions(&self) -> (u32, u32) {
        self.image.dimensions()
    }

    /// The embedded timestamp word, or None if the grid is too small to
    /// contain it.
    pub fn timestamp(&self) -> Option<u16> {
        self.image.get_pixel_checked(TIMESTAMP_COL, TIMESTAMP_ROW).map(|p| p.0[0])
    }
}

/// The ordered frames read from one acquisition file. All frames share the
/// same dimensions and the batch is never empty.
#[derive(Clone, Debug)]
pub struct Batch {
    frames: Vec<Frame>,
    width: u32,
    height: u32,
}

impl Batch {
    /// Takes ownership of `images`, assigning frame indices in order.
    pub fn new(images: Vec<RawImage>) -> Result<Batch> {
        let Some(first) = images.first() else {
            return Err(HitError::InvalidInput("batch contains no frames".to_string()));
        };
        let (width, height) = first.dimensions();
        for (index, image) in images.iter().enumerate() {
            if image.dimensions() != (width, height) {
                return Err(HitError::InvalidInput(format!(
                    "frame {} is {}x{} but frame 0 is {}x{}",
                    index, image.width(), image.height(), width, height)));
            }
        }
        let frames = images.into_iter().enumerate()
            .map(|(index, image)| Frame::new(index, image))
            .collect();
        Ok(Batch{frames, width, height})
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// (width, height) shared by every frame.
    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    pub fn frame(&self, index: usize) -> Option<&Frame> {
        self.frames.get(index)
    }
}

/// A frame after dark subtraction.
#[derive(Clone, Debug)]
pub struct CorrectedFrame {
    /// Position within the list of corrected frames of the batch.
    pub index: usize,

    /// Index of the raw frame that carried the signal. Equal to `index` for
    /// the median policy, 2*index+1 for the paired policy.
    pub source_index: usize,

    /// Timestamp reported for this exposure. For the paired policy this is
    /// the timestamp of the pre-trigger frame.
    pub timestamp: Option<u16>,

    pub image: CorrectedImage,
}

impl CorrectedFrame {
    /// Wraps an already corrected grid, e.g. one produced by an external
    /// correction step or a synthetic test pattern.
    pub fn from_image(index: usize, image: CorrectedImage) -> CorrectedFrame {
        CorrectedFrame{index, source_index: index, timestamp: None, image}
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.image.dimensions()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uniform(width: u32, height: u32, value: u16) -> RawImage {
        RawImage::from_pixel(width, height, Luma([value]))
    }

    #[test]
    fn test_batch_assigns_indices() {
        let batch = Batch::new(vec![uniform(4, 3, 1), uniform(4, 3, 2)]).unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch.dimensions(), (4, 3));
        assert_eq!(batch.frames()[1].index(), 1);
        assert_eq!(batch.frame(1).unwrap().image().get_pixel(0, 0).0[0], 2);
        assert!(batch.frame(2).is_none());
    }

    #[test]
    fn test_batch_rejects_empty() {
        match Batch::new(Vec::new()) {
            Err(HitError::InvalidInput(_)) => (),
            other => panic!("Expected InvalidInput, got {:?}", other),
        }
    }

    #[test]
    fn test_batch_rejects_mismatched_dimensions() {
        match Batch::new(vec![uniform(4, 4, 0), uniform(4, 5, 0)]) {
            Err(HitError::InvalidInput(msg)) => {
                assert!(msg.contains("4x5"));
                assert!(msg.contains("4x4"));
            },
            other => panic!("Expected InvalidInput, got {:?}", other),
        }
    }

    #[test]
    fn test_timestamp() {
        let mut image = uniform(4, 4, 0);
        image.put_pixel(TIMESTAMP_COL, TIMESTAMP_ROW, Luma([1234]));
        assert_eq!(Frame::new(0, image).timestamp(), Some(1234));
        // Single column grid has no timestamp word.
        assert_eq!(Frame::new(0, uniform(1, 4, 0)).timestamp(), None);
    }
}  // mod tests.
