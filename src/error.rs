// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::io;

/// Failures that abort processing of a batch. "No hits" is not an error; it
/// is represented by empty collections.
#[derive(Debug, thiserror::Error)]
pub enum HitError {
    /// Frames or grids that cannot be processed as given: empty batch,
    /// mismatched dimensions, odd batch size in paired mode, grid too small
    /// for the configured neighborhood and edge.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Parameters that make the computation degenerate, e.g. a histogram
    /// axis with step <= 0.
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// Raw acquisition file does not match the expected layout.
    #[error("malformed acquisition file: {0}")]
    Format(String),
}

pub type Result<T> = std::result::Result<T, HitError>;
