//! TeamHits extracts particle hits from batches of raw pixel-detector frames
//! and builds the energy spectra of those hits.
//!
//! Given the frames of one acquisition, TeamHits removes the per-pixel dark
//! level, locates isolated local maxima that stand out above the corrected
//! background, and for every accepted hit computes three aggregate
//! intensities:
//!
//! * Sum1: the value of the hit pixel.
//! * Sum9: the 3x3 window around the hit pixel.
//! * Sum25: the 5x5 window around the hit pixel.
//!
//! Sum9 and Sum25 are reported as zero unless some pixel of their window
//! exceeds a second, lower gate threshold.
//!
//! # Dark correction
//!
//! Two acquisition modes are supported, see [dark::DarkPolicyKind]:
//!
//! * Median: most frames of a batch carry no hit at any given pixel, so the
//!   per-pixel median across the batch is used as the dark level and
//!   subtracted from every frame.
//! * Paired: frames alternate between a pre-trigger (dark) exposure and a
//!   post-trigger (signal) exposure; each signal frame has its own dark frame
//!   subtracted. The batch must have an even number of frames.
//!
//! # Hit rejection
//!
//! Hits close to the grid border are discarded, as their windows would be
//! truncated. Hits whose intensity is echoed at the same offset within other
//! readout channels are discarded as cross-channel pickup. See
//! [peak_finder::find_peaks()].
//!
//! Optionally, [cluster::validate_clusters()] groups the maxima of a frame by
//! mean shift and reports groups that are both bright and populous, which
//! flags frames dominated by extended showers rather than isolated hits.
//!
//! # Spectra
//!
//! [spectrum::SpectrumAccumulator] bins the aggregates of every frame, and
//! also of the whole batch. [pipeline::GlobalSpectra] adds up the batch
//! spectra of many acquisitions.
//!
//! [pipeline::process_batch()] runs all of the above for one batch.

pub mod cluster;
pub mod dark;
pub mod error;
pub mod frame;
pub mod peak_finder;
pub mod pipeline;
pub mod spectrum;
pub mod team_file;

pub use error::{HitError, Result};
pub use pipeline::{process_batch, BatchReport, FrameReport, GlobalSpectra, PipelineConfig};
