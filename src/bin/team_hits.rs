// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use clap::{Parser, ValueEnum};
use env_logger;
use image::{ImageBuffer, Luma, Rgb};
use imageproc::drawing;
use log::{debug, info, warn};

use team_hits::HitError;
use team_hits::cluster::ClusterConfig;
use team_hits::dark::{correct_batch, DarkPolicy, DarkPolicyKind};
use team_hits::frame::CorrectedImage;
use team_hits::peak_finder::PeakFinderConfig;
use team_hits::pipeline::{process_batch, BatchReport, GlobalSpectra, PipelineConfig};
use team_hits::spectrum::{SpectrumAxis, SpectrumSet, SumKind};
use team_hits::team_file::{read_batch, FileLayout};

const GLOBAL_SUM_FILE: &str = "GlobalSumHistograms.txt";

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Mode {
    /// Per-pixel median of the batch is the dark level.
    Median,
    /// Even frames are darks for the following odd frame.
    Paired,
}

/// Extracts hits from TEAM detector acquisition file(s) and writes their
/// Sum1/Sum9/Sum25 spectra.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about=None)]
struct Args {
    /// Path of the file or directory to process.
    #[arg(short, long)]
    input: String,

    /// Directory where output file(s) are written.
    #[arg(short, long)]
    output: String,

    /// Dark correction mode.
    #[arg(short, long, value_enum, default_value_t = Mode::Median)]
    mode: Mode,

    /// Minimum corrected value of a hit pixel, in ADC counts.
    #[arg(short, long, default_value_t = 80.0)]
    threshold: f32,

    /// Sum9/Sum25 are zero unless some window pixel exceeds this.
    #[arg(short, long, default_value_t = 40.0)]
    gate_threshold: f32,

    /// Overrides --gate-threshold for the Sum9 window.
    #[arg(long)]
    gate_threshold_9: Option<f32>,

    /// Overrides --gate-threshold for the Sum25 window.
    #[arg(long)]
    gate_threshold_25: Option<f32>,

    /// Radius of the local maximum filter. 2 also drops maxima within two
    /// pixels of a brighter one.
    #[arg(long, default_value_t = 1)]
    filter_radius: u32,

    /// Hits closer than this to the grid border are discarded.
    #[arg(short, long, default_value_t = 2)]
    edge_boundary: u32,

    /// Number of readout channels across the grid width. 1 disables the
    /// cross-channel noise cut.
    #[arg(long, default_value_t = 16)]
    adc_channels: u32,

    /// Lower edge of the spectra, in ADC counts.
    #[arg(long, default_value_t = -500.0, allow_negative_numbers = true)]
    lo: f64,

    /// Upper edge of the spectra, in ADC counts.
    #[arg(long, default_value_t = 3950.0)]
    hi: f64,

    /// Bin width of the spectra, in ADC counts.
    #[arg(long, default_value_t = 10.0)]
    step: f64,

    /// Frames per acquisition file.
    #[arg(long, default_value_t = 32)]
    frames_per_file: usize,

    /// Run cluster validation on every frame.
    #[arg(short, long, default_value_t = false)]
    clusters: std::primitive::bool,

    /// Write a PNG of each corrected frame with the hits circled.
    #[arg(short, long, default_value_t = false)]
    annotate: std::primitive::bool,

    /// Also write the spectra of every frame.
    #[arg(short, long, default_value_t = false)]
    per_frame: std::primitive::bool,
}

impl Args {
    fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig{
            dark_policy_kind: match self.mode {
                Mode::Median => DarkPolicyKind::Median,
                Mode::Paired => DarkPolicyKind::Paired,
            },
            peak_finder: PeakFinderConfig{
                threshold: self.threshold,
                gate_threshold_9: self.gate_threshold_9.unwrap_or(self.gate_threshold),
                gate_threshold_25: self.gate_threshold_25.unwrap_or(self.gate_threshold),
                max_filter_radius: self.filter_radius,
                edge_boundary: self.edge_boundary,
                adc_channels: self.adc_channels,
                ..Default::default()
            },
            cluster: ClusterConfig::default(),
            axis: SpectrumAxis{lo: self.lo, hi: self.hi, step: self.step},
            validate_clusters: self.clusters,
        }
    }
}

fn main() {
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let config = args.pipeline_config();
    if let Err(e) = config.validate() {
        panic!("Invalid arguments: {}", e);
    }
    let layout = FileLayout{frames_per_file: args.frames_per_file, ..Default::default()};
    let input_metadata = fs::metadata(&args.input).unwrap_or_else(|e| {
        panic!("Input file/dir '{}' does not exist? {:?}", args.input, e);
    });
    let output_metadata = fs::metadata(&args.output).unwrap_or_else(|e| {
        panic!("Output dir '{}' does not exist? {:?}", args.output, e);
    });
    assert!(output_metadata.is_dir(),
            "Output '{}' must be a directory", args.output);

    let mut inputs = Vec::<PathBuf>::new();
    if input_metadata.is_dir() {
        // Enumerate all of the files in the directory, in name order.
        let entries = fs::read_dir(&args.input).unwrap_or_else(|e| {
            panic!("Cannot list '{}': {:?}", args.input, e);
        });
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_file() {
                inputs.push(path);
            }
        }
        inputs.sort();
    } else {
        inputs.push(PathBuf::from(&args.input));
    }

    let mut global = GlobalSpectra::new(config.axis).unwrap_or_else(|e| {
        panic!("Invalid axis: {}", e);
    });
    for path in &inputs {
        match process_file(path, &args, &config, &layout) {
            Ok(report) => {
                if let Err(e) = global.add(&report) {
                    warn!("Not adding {:?} to global sum: {}", path, e);
                }
            },
            Err(e) => warn!("Skipping {:?} due to: {}", path, e),
        }
    }

    let mut global_path = PathBuf::from(&args.output);
    global_path.push(GLOBAL_SUM_FILE);
    if let Err(e) = fs::write(&global_path, spectra_table(global.spectra())) {
        warn!("Could not write {:?}: {:?}", global_path, e);
    }
    info!("Summed {} of {} files into {:?}", global.batch_count(), inputs.len(), global_path);
    for kind in SumKind::ALL {
        let spectrum = global.spectra().get(kind);
        let stats = spectrum.stats();
        info!("{}: {} entries, mean {:.1} median {:.1} stddev {:.1}",
              kind.label(), spectrum.entries(), stats.mean, stats.median, stats.stddev);
    }
}

fn process_file(path: &Path, args: &Args, config: &PipelineConfig, layout: &FileLayout)
                -> Result<BatchReport, HitError> {
    info!("Processing {:?}", path);
    let file_start = Instant::now();
    let (header, batch) = read_batch(path, layout)?;
    debug!("Header {:?}", header);
    let report = process_batch(&batch, config, &mut |percent| {
        if percent % 25 == 0 {
            debug!("Dark estimation {}% done", percent);
        }
    })?;
    let edge_cut: u32 = report.frames.iter().map(|f| f.edge_cut_count).sum();
    let noise_cut: u32 = report.frames.iter().map(|f| f.noise_cut_count).sum();
    let clusters: usize = report.frames.iter().map(|f| f.clusters.len()).sum();
    info!("{} hits ({} edge cut, {} noise cut), {} clusters in {:?}",
          report.hit_count(), edge_cut, noise_cut, clusters, file_start.elapsed());

    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("batch");
    let mut table = spectra_table(&report.summed);
    if args.per_frame {
        for frame in &report.frames {
            let _ = write!(table, "\n# Frame {} (source frame {}, timestamp {})\n",
                           frame.index, frame.source_index,
                           frame.timestamp.map_or("none".to_string(), |t| t.to_string()));
            table.push_str(&spectra_table(&frame.spectra));
        }
    }
    let mut spectra_path = PathBuf::from(&args.output);
    spectra_path.push(format!("{}.spectra.txt", stem));
    fs::write(&spectra_path, table)?;

    if args.annotate {
        // Redo the correction; the report does not keep the corrected grids.
        let policy = DarkPolicy::prepare(config.dark_policy_kind, &batch, &mut |_| ())?;
        let corrected = correct_batch(&batch, &policy)?;
        for (frame, frame_report) in corrected.iter().zip(report.frames.iter()) {
            let mut annotated_path = PathBuf::from(&args.output);
            annotated_path.push(format!("{}_frame{:02}.png", stem, frame.index));
            let points: Vec<(i32, i32)> = frame_report.peaks.iter()
                .map(|p| (p.col as i32, p.row as i32)).collect();
            if let Err(e) = annotate(&frame.image, &points, args.threshold)
                .save(&annotated_path) {
                warn!("Could not write {:?}: {:?}", annotated_path, e);
            }
        }
    }
    Ok(report)
}

/// Tab separated bin centers and counts of each sum kind.
fn spectra_table(spectra: &SpectrumSet) -> String {
    let mut table = String::new();
    table.push_str("Bin");
    for kind in SumKind::ALL {
        table.push('\t');
        table.push_str(kind.label());
    }
    table.push('\n');
    let bins = spectra.sum1.bins()
        .zip(spectra.sum9.counts().iter())
        .zip(spectra.sum25.counts().iter());
    for (((center, sum1), sum9), sum25) in bins {
        let _ = writeln!(table, "{:.2}\t{}\t{}\t{}", center, sum1, sum9, sum25);
    }
    table
}

// Maps [0, 4*threshold] onto the 8 bit range and circles the hits.
fn annotate(image: &CorrectedImage, points: &[(i32, i32)], threshold: f32)
            -> ImageBuffer<Rgb<u8>, Vec<u8>> {
    let scale = 255.0 / f32::max(4.0 * threshold, 1.0);
    let gray = ImageBuffer::from_fn(image.width(), image.height(), |x, y| {
        let value = image.get_pixel(x, y).0[0] * scale;
        Luma([value.clamp(0.0, 255.0) as u8])
    });
    let mut img_color = image::DynamicImage::ImageLuma8(gray).into_rgb8();
    for &center in points {
        drawing::draw_hollow_circle_mut(&mut img_color, center, 4, Rgb::<u8>([255, 0, 0]));
    }
    img_color
}
