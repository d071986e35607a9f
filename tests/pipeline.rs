use approx::assert_abs_diff_eq;
use image::Luma;

use team_hits::dark::DarkPolicyKind;
use team_hits::frame::{Batch, RawImage};
use team_hits::peak_finder::PeakFinderConfig;
use team_hits::spectrum::{SpectrumAxis, SumKind};
use team_hits::team_file::{read_batch_from, FileLayout, HEADER_WORDS};
use team_hits::{process_batch, GlobalSpectra, HitError, PipelineConfig};

const WIDTH: u32 = 32;
const HEIGHT: u32 = 24;

// Dark level that differs per pixel, like a real sensor.
fn pedestal(x: u32, y: u32) -> u16 {
    (900 + 7 * x + 3 * y) as u16
}

fn dark_frame() -> RawImage {
    RawImage::from_fn(WIDTH, HEIGHT, |x, y| Luma([pedestal(x, y)]))
}

// Adds a hit with a one pixel halo at (x, y).
fn add_hit(image: &mut RawImage, x: u32, y: u32, value: u16, halo: u16) {
    for dy in -1_i32..=1 {
        for dx in -1_i32..=1 {
            let px = (x as i32 + dx) as u32;
            let py = (y as i32 + dy) as u32;
            let add = if dx == 0 && dy == 0 { value } else { halo };
            let current = image.get_pixel(px, py).0[0];
            image.put_pixel(px, py, Luma([current + add]));
        }
    }
}

fn config(kind: DarkPolicyKind) -> PipelineConfig {
    PipelineConfig{
        dark_policy_kind: kind,
        peak_finder: PeakFinderConfig{adc_channels: 4, ..Default::default()},
        axis: SpectrumAxis{lo: -500.0, hi: 2000.0, step: 10.0},
        ..Default::default()
    }
}

#[test]
fn test_median_end_to_end() {
    let mut images: Vec<RawImage> = (0..7).map(|_| dark_frame()).collect();
    add_hit(&mut images[2], 10, 12, 600, 50);
    add_hit(&mut images[5], 20, 5, 300, 10);
    // Border hit is cut.
    add_hit(&mut images[5], 1, 10, 900, 0);
    let batch = Batch::new(images).unwrap();

    let report = process_batch(&batch, &config(DarkPolicyKind::Median), &mut |_| ()).unwrap();
    assert_eq!(report.frames.len(), 7);
    assert_eq!(report.hit_count(), 2);

    let hit = &report.frames[2].peaks[0];
    assert_abs_diff_eq!(hit.row, 12.0);
    assert_abs_diff_eq!(hit.col, 10.0);
    assert_abs_diff_eq!(hit.sum1, 600.0);
    assert_abs_diff_eq!(hit.sum9, 1000.0);
    assert_abs_diff_eq!(hit.sum25, 1000.0);

    // The window sums include the whole halo once the hit pixel opens the gate.
    let faint = &report.frames[5].peaks[0];
    assert_abs_diff_eq!(faint.sum1, 300.0);
    assert_abs_diff_eq!(faint.sum9, 380.0);
    assert_abs_diff_eq!(faint.sum25, 380.0);
    assert_eq!(report.frames[5].edge_cut_count, 1);

    let axis = report.summed.axis();
    assert_eq!(report.summed.sum1.counts()[axis.bin_index(600.0).unwrap()], 1);
    assert_eq!(report.summed.sum9.counts()[axis.bin_index(1000.0).unwrap()], 1);
    assert_eq!(report.summed.sum1.entries(), 2);
}

#[test]
fn test_paired_end_to_end() {
    let mut images = Vec::new();
    for pair in 0..3 {
        let mut pre = dark_frame();
        pre.put_pixel(1, 0, Luma([100 + pair]));
        let mut post = dark_frame();
        post.put_pixel(1, 0, Luma([200 + pair]));
        if pair == 1 {
            add_hit(&mut post, 15, 15, 450, 0);
        }
        images.push(pre);
        images.push(post);
    }
    let batch = Batch::new(images).unwrap();
    let report = process_batch(&batch, &config(DarkPolicyKind::Paired), &mut |_| ()).unwrap();
    assert_eq!(report.frames.len(), 3);
    for (pair, frame) in report.frames.iter().enumerate() {
        assert_eq!(frame.index, pair);
        assert_eq!(frame.source_index, 2 * pair + 1);
        assert_eq!(frame.timestamp, Some(100 + pair as u16));
    }
    assert_eq!(report.hit_count(), 1);
    assert_abs_diff_eq!(report.frames[1].peaks[0].sum1, 450.0);
    assert_eq!(report.frames[0].spectra.sum1.entries(), 0);
    assert_eq!(report.frames[1].spectra.sum1.entries(), 1);

    let odd = Batch::new((0..5).map(|_| dark_frame()).collect()).unwrap();
    match process_batch(&odd, &config(DarkPolicyKind::Paired), &mut |_| ()) {
        Err(HitError::InvalidInput(_)) => (),
        other => panic!("Expected InvalidInput, got {:?}", other),
    }
}

#[test]
fn test_file_to_global_spectra() {
    let layout = FileLayout{frames_per_file: 5, width: WIDTH, height: HEIGHT};
    let mut images: Vec<RawImage> = (0..5).map(|_| dark_frame()).collect();
    add_hit(&mut images[3], 16, 8, 700, 0);

    let mut bytes = Vec::new();
    bytes.extend_from_slice(&42_u32.to_le_bytes());
    for _ in 1..HEADER_WORDS {
        bytes.extend_from_slice(&0_i32.to_le_bytes());
    }
    for image in &images {
        for pixel in image.as_raw() {
            bytes.extend_from_slice(&pixel.to_le_bytes());
        }
    }

    let (header, batch) = read_batch_from(bytes.as_slice(), &layout).unwrap();
    assert_eq!(header.first_word, 42);
    assert_eq!(batch.len(), 5);

    let config = config(DarkPolicyKind::Median);
    let report = process_batch(&batch, &config, &mut |_| ()).unwrap();
    let mut global = GlobalSpectra::new(config.axis).unwrap();
    for _ in 0..3 {
        global.add(&report).unwrap();
    }
    let sum1 = global.spectra().get(SumKind::Sum1);
    assert_eq!(sum1.entries(), 3);
    assert_eq!(sum1.counts()[config.axis.bin_index(700.0).unwrap()], 3);
    assert_abs_diff_eq!(sum1.stats().mean, 705.0);
}
