// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

//! Reader for the detector's raw acquisition files. Each file holds a fixed
//! header followed by a fixed number of frames:
//!
//! * 9 little-endian 32 bit header words. The first is unsigned, the rest are
//!   signed.
//! * `frames_per_file` frames of `width` x `height` little-endian 16 bit
//!   pixels in row-major order.

use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::Path;
use std::time::Instant;

use log::{info, warn};

use crate::error::{HitError, Result};
use crate::frame::{Batch, RawImage};

pub const HEADER_WORDS: usize = 9;
const HEADER_WORD_BYTES: usize = 4;
const PIXEL_BYTES: usize = 2;

/// Geometry of an acquisition file.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FileLayout {
    pub frames_per_file: usize,
    pub width: u32,
    pub height: u32,
}

impl Default for FileLayout {
    fn default() -> Self {
        FileLayout{frames_per_file: 32, width: 1024, height: 1024}
    }
}

impl FileLayout {
    pub fn header_bytes(&self) -> usize {
        HEADER_WORDS * HEADER_WORD_BYTES
    }

    pub fn frame_bytes(&self) -> usize {
        self.width as usize * self.height as usize * PIXEL_BYTES
    }

    /// Expected size of a complete file.
    pub fn file_bytes(&self) -> usize {
        self.header_bytes() + self.frames_per_file * self.frame_bytes()
    }
}

/// The header words. Their meaning is not interpreted.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FileHeader {
    pub first_word: u32,
    pub words: [i32; HEADER_WORDS - 1],
}

/// Reads the acquisition file at `path` into a [Batch].
pub fn read_batch(path: &Path, layout: &FileLayout) -> Result<(FileHeader, Batch)> {
    let file = File::open(path)?;
    read_batch_from(BufReader::new(file), layout)
}

/// As [read_batch()], reading from any byte source.
pub fn read_batch_from<R: Read>(mut reader: R, layout: &FileLayout)
                                -> Result<(FileHeader, Batch)> {
    let read_start = Instant::now();
    if layout.frames_per_file == 0 || layout.width == 0 || layout.height == 0 {
        return Err(HitError::Configuration(format!(
            "file layout must be non-empty, got {:?}", layout)));
    }
    let mut word = [0_u8; HEADER_WORD_BYTES];
    read_section(&mut reader, &mut word, "header")?;
    let first_word = u32::from_le_bytes(word);
    let mut words = [0_i32; HEADER_WORDS - 1];
    for w in words.iter_mut() {
        read_section(&mut reader, &mut word, "header")?;
        *w = i32::from_le_bytes(word);
    }

    let mut frame_bytes = vec![0_u8; layout.frame_bytes()];
    let mut images = Vec::with_capacity(layout.frames_per_file);
    for frame_index in 0..layout.frames_per_file {
        read_section(&mut reader, &mut frame_bytes, &format!("frame {}", frame_index))?;
        let pixels: Vec<u16> = frame_bytes.chunks_exact(PIXEL_BYTES)
            .map(|b| u16::from_le_bytes([b[0], b[1]]))
            .collect();
        let image = RawImage::from_raw(layout.width, layout.height, pixels)
            .ok_or_else(|| HitError::Format(format!(
                "frame {} does not fill {}x{}", frame_index, layout.width, layout.height)))?;
        images.push(image);
    }

    let mut probe = [0_u8; 1];
    if reader.read(&mut probe)? > 0 {
        warn!("Ignoring data past the last of {} frames", layout.frames_per_file);
    }
    info!("Read {} frames of {}x{} in {:?}",
          images.len(), layout.width, layout.height, read_start.elapsed());
    Ok((FileHeader{first_word, words}, Batch::new(images)?))
}

fn read_section<R: Read>(reader: &mut R, buf: &mut [u8], what: &str) -> Result<()> {
    reader.read_exact(buf).map_err(|e| match e.kind() {
        io::ErrorKind::UnexpectedEof => HitError::Format(format!("file truncated in {}", what)),
        _ => HitError::Io(e),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(first_word: u32, frames: &[Vec<u16>]) -> Vec<u8> {
        let mut bytes = first_word.to_le_bytes().to_vec();
        for w in 1..HEADER_WORDS as i32 {
            bytes.extend_from_slice(&(-w).to_le_bytes());
        }
        for frame in frames {
            for pixel in frame {
                bytes.extend_from_slice(&pixel.to_le_bytes());
            }
        }
        bytes
    }

    fn small_layout() -> FileLayout {
        FileLayout{frames_per_file: 2, width: 3, height: 2}
    }

    #[test]
    fn test_layout_sizes() {
        let layout = FileLayout::default();
        assert_eq!(layout.header_bytes(), 36);
        assert_eq!(layout.file_bytes(), 36 + 32 * 2 * 1024 * 1024);
    }

    #[test]
    fn test_read_batch() {
        let bytes = encode(0xfeedbeef, &[vec![1, 2, 3, 4, 5, 6],
                                         vec![7, 65535, 9, 10, 11, 12]]);
        assert_eq!(bytes.len(), small_layout().file_bytes());
        let (header, batch) = read_batch_from(bytes.as_slice(), &small_layout()).unwrap();
        assert_eq!(header.first_word, 0xfeedbeef);
        assert_eq!(header.words, [-1, -2, -3, -4, -5, -6, -7, -8]);
        assert_eq!(batch.len(), 2);
        assert_eq!(batch.dimensions(), (3, 2));
        // Row-major: pixel (x=2, y=1) is the sixth value.
        assert_eq!(batch.frames()[0].image().get_pixel(2, 1).0[0], 6);
        assert_eq!(batch.frames()[1].timestamp(), Some(65535));
    }

    #[test]
    fn test_truncated() {
        let bytes = encode(1, &[vec![1, 2, 3, 4, 5, 6], vec![7, 8, 9]]);
        match read_batch_from(bytes.as_slice(), &small_layout()) {
            Err(HitError::Format(msg)) => assert!(msg.contains("frame 1")),
            other => panic!("Expected Format, got {:?}", other),
        }
        match read_batch_from(&bytes[..10], &small_layout()) {
            Err(HitError::Format(msg)) => assert!(msg.contains("header")),
            other => panic!("Expected Format, got {:?}", other),
        }
    }

    #[test]
    fn test_trailing_data_ignored() {
        let mut bytes = encode(1, &[vec![0; 6], vec![0; 6]]);
        bytes.extend_from_slice(&[1, 2, 3]);
        let (_, batch) = read_batch_from(bytes.as_slice(), &small_layout()).unwrap();
        assert_eq!(batch.len(), 2);
    }

    #[test]
    fn test_missing_file() {
        match read_batch(Path::new("/nonexistent/run_0001.dat"), &small_layout()) {
            Err(HitError::Io(_)) => (),
            other => panic!("Expected Io, got {:?}", other),
        }
    }
}  // mod tests.
