// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use log::debug;

use crate::error::{HitError, Result};
use crate::peak_finder::PeakCoordinate;

// Guards against an axis whose bins would not fit in memory.
const MAX_BIN_COUNT: usize = 1 << 24;

/// Histogram range and bin width, in corrected ADC counts.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SpectrumAxis {
    pub lo: f64,
    pub hi: f64,
    pub step: f64,
}

impl Default for SpectrumAxis {
    fn default() -> Self {
        SpectrumAxis{lo: -500.0, hi: 3950.0, step: 10.0}
    }
}

impl SpectrumAxis {
    pub fn new(lo: f64, hi: f64, step: f64) -> Result<SpectrumAxis> {
        let axis = SpectrumAxis{lo, hi, step};
        axis.validate()?;
        Ok(axis)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.lo.is_finite() || !self.hi.is_finite() || !self.step.is_finite() {
            return Err(HitError::Configuration(format!(
                "axis parameters must be finite, got lo={} hi={} step={}",
                self.lo, self.hi, self.step)));
        }
        if self.step <= 0.0 {
            return Err(HitError::Configuration(format!(
                "axis step must be positive, got {}", self.step)));
        }
        if self.hi <= self.lo {
            return Err(HitError::Configuration(format!(
                "axis hi ({}) must exceed lo ({})", self.hi, self.lo)));
        }
        if (self.hi - self.lo) / self.step > MAX_BIN_COUNT as f64 {
            return Err(HitError::Configuration(format!(
                "axis [{}, {}] with step {} has too many bins", self.lo, self.hi, self.step)));
        }
        Ok(())
    }

    /// Number of bins of width `step` needed to cover [lo, hi]. A range that
    /// is a whole number of steps (up to rounding error) gets exactly that
    /// many bins.
    pub fn bin_count(&self) -> usize {
        let steps = (self.hi - self.lo) / self.step;
        let rounded = steps.round();
        let count = if (steps - rounded).abs() <= 1e-9 * f64::max(1.0, steps) {
            rounded
        } else {
            steps.ceil()
        };
        usize::max(count as usize, 1)
    }

    /// Bin holding `value`. Bins are closed-open except the last, which also
    /// holds `hi`. Values outside [lo, hi] have no bin.
    pub fn bin_index(&self, value: f64) -> Option<usize> {
        if !value.is_finite() || value < self.lo || value > self.hi {
            return None;
        }
        let index = ((value - self.lo) / self.step).floor() as usize;
        Some(usize::min(index, self.bin_count() - 1))
    }

    pub fn bin_center(&self, index: usize) -> f64 {
        self.lo + (index as f64 + 0.5) * self.step
    }
}

/// The three aggregate kinds produced for every hit.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum SumKind {
    Sum1,
    Sum9,
    Sum25,
}

impl SumKind {
    pub const ALL: [SumKind; 3] = [SumKind::Sum1, SumKind::Sum9, SumKind::Sum25];

    pub fn label(&self) -> &'static str {
        match self {
            SumKind::Sum1 => "Sum(1)",
            SumKind::Sum9 => "Sum(9)",
            SumKind::Sum25 => "Sum(25)",
        }
    }

    pub fn value_of(&self, peak: &PeakCoordinate) -> f32 {
        match self {
            SumKind::Sum1 => peak.sum1,
            SumKind::Sum9 => peak.sum9,
            SumKind::Sum25 => peak.sum25,
        }
    }
}

#[derive(Debug, PartialEq)]
pub struct SpectrumStats {
    pub mean: f64,
    /// Center of the bin holding the median entry.
    pub median: f64,
    pub stddev: f64,
}

/// Counts of values per bin over a fixed axis.
#[derive(Clone, Debug, PartialEq)]
pub struct Spectrum {
    axis: SpectrumAxis,
    counts: Vec<u32>,
    dropped: u64,
}

impl Spectrum {
    pub fn new(axis: SpectrumAxis) -> Result<Spectrum> {
        axis.validate()?;
        Ok(Spectrum::empty(axis))
    }

    fn empty(axis: SpectrumAxis) -> Spectrum {
        Spectrum{axis, counts: vec![0; axis.bin_count()], dropped: 0}
    }

    pub fn from_values(axis: SpectrumAxis, values: impl IntoIterator<Item = f64>)
                       -> Result<Spectrum> {
        let mut spectrum = Spectrum::new(axis)?;
        spectrum.fill_all(values);
        Ok(spectrum)
    }

    /// Counts `value` in its bin. Out of range values are dropped silently;
    /// returns whether the value was counted.
    pub fn fill(&mut self, value: f64) -> bool {
        match self.axis.bin_index(value) {
            Some(index) => {
                self.counts[index] += 1;
                true
            },
            None => {
                self.dropped += 1;
                false
            },
        }
    }

    pub fn fill_all(&mut self, values: impl IntoIterator<Item = f64>) {
        for value in values {
            self.fill(value);
        }
    }

    /// Adds the bin counts of `other`, which must share this spectrum's axis.
    pub fn merge(&mut self, other: &Spectrum) -> Result<()> {
        if other.axis != self.axis {
            return Err(HitError::Configuration(format!(
                "cannot merge spectrum with axis {:?} into axis {:?}",
                other.axis, self.axis)));
        }
        for (count, other_count) in self.counts.iter_mut().zip(other.counts.iter()) {
            *count += other_count;
        }
        self.dropped += other.dropped;
        Ok(())
    }

    pub fn axis(&self) -> &SpectrumAxis {
        &self.axis
    }

    pub fn counts(&self) -> &[u32] {
        &self.counts
    }

    /// (bin center, count) pairs in axis order.
    pub fn bins(&self) -> impl Iterator<Item = (f64, u32)> + '_ {
        self.counts.iter().enumerate()
            .map(|(index, &count)| (self.axis.bin_center(index), count))
    }

    /// Number of values counted.
    pub fn entries(&self) -> u64 {
        self.counts.iter().map(|&c| c as u64).sum()
    }

    /// Number of values that fell outside the axis.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Mean, median and standard deviation of the counted values, taking
    /// each value to sit at its bin center.
    pub fn stats(&self) -> SpectrumStats {
        let count = self.entries();
        if count == 0 {
            return SpectrumStats{mean: 0.0, median: 0.0, stddev: 0.0};
        }
        let mut first_moment = 0.0;
        for (center, bin_count) in self.bins() {
            first_moment += bin_count as f64 * center;
        }
        let mean = first_moment / count as f64;
        let mut second_moment = 0.0;
        let mut sub_count = 0_u64;
        let mut median = self.axis.bin_center(0);
        let mut median_found = false;
        for (center, bin_count) in self.bins() {
            second_moment += bin_count as f64 * (center - mean) * (center - mean);
            if !median_found {
                sub_count += bin_count as u64;
                if 2 * sub_count >= count {
                    median = center;
                    median_found = true;
                }
            }
        }
        let stddev = (second_moment / count as f64).sqrt();
        SpectrumStats{mean, median, stddev}
    }
}

/// One spectrum per [SumKind], sharing an axis.
#[derive(Clone, Debug, PartialEq)]
pub struct SpectrumSet {
    pub sum1: Spectrum,
    pub sum9: Spectrum,
    pub sum25: Spectrum,
}

impl SpectrumSet {
    pub fn new(axis: SpectrumAxis) -> Result<SpectrumSet> {
        Ok(SpectrumSet{
            sum1: Spectrum::new(axis)?,
            sum9: Spectrum::new(axis)?,
            sum25: Spectrum::new(axis)?,
        })
    }

    pub fn get(&self, kind: SumKind) -> &Spectrum {
        match kind {
            SumKind::Sum1 => &self.sum1,
            SumKind::Sum9 => &self.sum9,
            SumKind::Sum25 => &self.sum25,
        }
    }

    fn get_mut(&mut self, kind: SumKind) -> &mut Spectrum {
        match kind {
            SumKind::Sum1 => &mut self.sum1,
            SumKind::Sum9 => &mut self.sum9,
            SumKind::Sum25 => &mut self.sum25,
        }
    }

    pub fn axis(&self) -> &SpectrumAxis {
        self.sum1.axis()
    }

    /// Fills each kind's spectrum with that kind's value from every peak.
    pub fn fill_peaks(&mut self, peaks: &[PeakCoordinate]) {
        for kind in SumKind::ALL {
            let spectrum = self.get_mut(kind);
            spectrum.fill_all(peaks.iter().map(|p| kind.value_of(p) as f64));
        }
    }

    /// Bin-wise addition of `other`.
    pub fn merge(&mut self, other: &SpectrumSet) -> Result<()> {
        for kind in SumKind::ALL {
            self.get_mut(kind).merge(other.get(kind))?;
        }
        Ok(())
    }
}

/// Builds per-frame spectra and the batch-summed spectra. Pass one
/// accumulator through every frame of a batch, then call [finish()] to
/// obtain the summed spectra.
///
/// [finish()]: SpectrumAccumulator::finish
#[derive(Debug)]
pub struct SpectrumAccumulator {
    axis: SpectrumAxis,
    summed: SpectrumSet,
    frame_count: usize,
}

impl SpectrumAccumulator {
    pub fn new(axis: SpectrumAxis) -> Result<SpectrumAccumulator> {
        Ok(SpectrumAccumulator{axis, summed: SpectrumSet::new(axis)?, frame_count: 0})
    }

    /// Bins the aggregates of one frame's peaks, returning that frame's
    /// spectra. The same raw values are added to the summed spectra, so the
    /// summed spectra equal histograms of the concatenated per-frame values.
    /// An empty `peaks` yields empty spectra.
    pub fn accumulate(&mut self, peaks: &[PeakCoordinate]) -> SpectrumSet {
        // Axis was validated in new().
        let mut frame_spectra = SpectrumSet{
            sum1: Spectrum::empty(self.axis),
            sum9: Spectrum::empty(self.axis),
            sum25: Spectrum::empty(self.axis),
        };
        frame_spectra.fill_peaks(peaks);
        self.summed.fill_peaks(peaks);
        self.frame_count += 1;
        debug!("Accumulated {} hits from frame {}", peaks.len(), self.frame_count);
        frame_spectra
    }

    pub fn frame_count(&self) -> usize {
        self.frame_count
    }

    pub fn summed(&self) -> &SpectrumSet {
        &self.summed
    }

    pub fn finish(self) -> SpectrumSet {
        self.summed
    }
}

// mod tests.
