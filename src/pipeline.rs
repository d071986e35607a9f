// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::time::Instant;

use log::{debug, info};

use crate::cluster::{validate_clusters, Cluster, ClusterConfig};
use crate::dark::{correct_batch, DarkPolicy, DarkPolicyKind};
use crate::error::{HitError, Result};
use crate::frame::Batch;
use crate::peak_finder::{find_peaks, PeakCoordinate, PeakFinderConfig};
use crate::spectrum::{SpectrumAccumulator, SpectrumAxis, SpectrumSet};

/// Everything needed to process one batch.
#[derive(Clone, Debug)]
pub struct PipelineConfig {
    pub dark_policy_kind: DarkPolicyKind,
    pub peak_finder: PeakFinderConfig,
    pub cluster: ClusterConfig,
    pub axis: SpectrumAxis,

    /// Run cluster validation on every corrected frame. Off by default; the
    /// mean shift is much slower than the peak scan.
    pub validate_clusters: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig{
            dark_policy_kind: DarkPolicyKind::Median,
            peak_finder: PeakFinderConfig::default(),
            cluster: ClusterConfig::default(),
            axis: SpectrumAxis::default(),
            validate_clusters: false,
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<()> {
        self.peak_finder.validate()?;
        self.axis.validate()?;
        if self.validate_clusters {
            self.cluster.validate()?;
        }
        Ok(())
    }
}

/// Results for one corrected frame.
#[derive(Clone, Debug)]
pub struct FrameReport {
    pub index: usize,
    pub source_index: usize,
    pub timestamp: Option<u16>,
    pub peaks: Vec<PeakCoordinate>,
    pub edge_cut_count: u32,
    pub noise_cut_count: u32,

    /// Clusters passing the integral and size thresholds. Empty when cluster
    /// validation is disabled.
    pub clusters: Vec<Cluster>,

    pub spectra: SpectrumSet,
}

/// Results for one batch.
#[derive(Clone, Debug)]
pub struct BatchReport {
    pub dark_policy_kind: DarkPolicyKind,
    pub frames: Vec<FrameReport>,

    /// Spectra of all hits of the batch.
    pub summed: SpectrumSet,
}

impl BatchReport {
    pub fn hit_count(&self) -> usize {
        self.frames.iter().map(|f| f.peaks.len()).sum()
    }
}

/// Runs dark estimation, dark correction, peak finding, optional cluster
/// validation and spectrum accumulation over `batch`.
///
/// # Arguments
///   `batch` - The raw frames of one acquisition.
///
///   `config` - See [PipelineConfig].
///
///   `progress` - Called with percent complete while the dark map is built.
///
/// # Returns
/// A [BatchReport], or the first error encountered. Errors abort the batch;
/// a frame without hits is not an error.
pub fn process_batch(batch: &Batch, config: &PipelineConfig,
                     progress: &mut dyn FnMut(u32)) -> Result<BatchReport> {
    config.validate()?;
    let batch_start = Instant::now();
    let policy = DarkPolicy::prepare(config.dark_policy_kind, batch, progress)?;
    let corrected = correct_batch(batch, &policy)?;

    let estimator = config.cluster.bandwidth_estimator();
    let mut accumulator = SpectrumAccumulator::new(config.axis)?;
    let mut frames = Vec::with_capacity(corrected.len());
    for corrected_frame in corrected {
        let search = find_peaks(&corrected_frame.image, &config.peak_finder)?;
        let clusters = if config.validate_clusters {
            validate_clusters(&corrected_frame.image, &search.raw_maxima,
                              &config.cluster, &estimator)?.retained
        } else {
            Vec::new()
        };
        let spectra = accumulator.accumulate(&search.peaks);
        debug!("Frame {} (source {}, timestamp {:?}): {} hits, {} edge cut, {} noise cut, {} clusters",
               corrected_frame.index, corrected_frame.source_index, corrected_frame.timestamp,
               search.peaks.len(), search.edge_cut_count, search.noise_cut_count,
               clusters.len());
        frames.push(FrameReport{
            index: corrected_frame.index,
            source_index: corrected_frame.source_index,
            timestamp: corrected_frame.timestamp,
            peaks: search.peaks,
            edge_cut_count: search.edge_cut_count,
            noise_cut_count: search.noise_cut_count,
            clusters,
            spectra,
        });
    }
    let report = BatchReport{
        dark_policy_kind: policy.kind(),
        frames,
        summed: accumulator.finish(),
    };
    info!("Processed {} frames with {} hits in {:?}",
          report.frames.len(), report.hit_count(), batch_start.elapsed());
    Ok(report)
}

/// Summed spectra folded across many batches.
#[derive(Clone, Debug)]
pub struct GlobalSpectra {
    spectra: SpectrumSet,
    batch_count: usize,
}

impl GlobalSpectra {
    pub fn new(axis: SpectrumAxis) -> Result<GlobalSpectra> {
        Ok(GlobalSpectra{spectra: SpectrumSet::new(axis)?, batch_count: 0})
    }

    /// Adds the summed spectra of `report`. The report must have been built
    /// with the same axis.
    pub fn add(&mut self, report: &BatchReport) -> Result<()> {
        if report.summed.axis() != self.spectra.axis() {
            return Err(HitError::Configuration(format!(
                "batch axis {:?} differs from global axis {:?}",
                report.summed.axis(), self.spectra.axis())));
        }
        self.spectra.merge(&report.summed)?;
        self.batch_count += 1;
        Ok(())
    }

    pub fn batch_count(&self) -> usize {
        self.batch_count
    }

    pub fn spectra(&self) -> &SpectrumSet {
        &self.spectra
    }
}

// mod tests.
