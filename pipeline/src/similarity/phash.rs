use image::imageops::{self, FilterType};
use image::{GrayImage, RgbImage};
use rustdct::{Dct2, DctPlanner};
use score_capture_common::frame::luma_bt601;

/// Side of the grayscale thumbnail fed to the DCT.
const DCT_SIZE: usize = 32;
/// Side of the low-frequency block kept from the DCT (8x8 = 64 bits).
const LOW_FREQ: usize = 8;

/// 64-bit DCT perceptual hash.
///
/// Algorithm:
/// 1. Convert to grayscale, resize to 32x32 (Lanczos)
/// 2. 2-D DCT-II (rows, then columns)
/// 3. Keep the top-left 8x8 low-frequency coefficients
/// 4. Bit i is set when coefficient i is above the median of the block
///
/// Minor rendering noise moves few coefficients across the median, so the
/// Hamming distance between hashes of the same page stays small.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PerceptualHash(pub u64);

impl PerceptualHash {
    pub const BITS: u32 = (LOW_FREQ * LOW_FREQ) as u32;

    pub fn of_rgb(image: &RgbImage) -> Self {
        Self::of_gray(&luma_bt601(image))
    }

    pub fn of_gray(gray: &GrayImage) -> Self {
        let thumb = imageops::resize(
            gray,
            DCT_SIZE as u32,
            DCT_SIZE as u32,
            FilterType::Lanczos3,
        );
        let mut plane: Vec<f32> = thumb.as_raw().iter().map(|&v| v as f32).collect();
        dct_2d(&mut plane, DCT_SIZE);

        let low: Vec<f32> = (0..LOW_FREQ)
            .flat_map(|row| plane[row * DCT_SIZE..row * DCT_SIZE + LOW_FREQ].to_vec())
            .collect();
        let median = median(&low);

        let bits = low
            .iter()
            .enumerate()
            .filter(|&(_, &c)| c > median)
            .fold(0u64, |acc, (i, _)| acc | (1 << i));
        Self(bits)
    }

    /// Number of differing bits.
    pub fn distance(&self, other: &PerceptualHash) -> u32 {
        hamming(self.0, other.0)
    }
}

/// Compute the hamming distance between two 64-bit hashes.
pub fn hamming(a: u64, b: u64) -> u32 {
    (a ^ b).count_ones()
}

fn dct_2d(plane: &mut [f32], size: usize) {
    let mut planner = DctPlanner::<f32>::new();
    let dct = planner.plan_dct2(size);

    for row in plane.chunks_exact_mut(size) {
        dct.process_dct2(row);
    }

    let mut column = vec![0.0f32; size];
    for x in 0..size {
        for (y, c) in column.iter_mut().enumerate() {
            *c = plane[y * size + x];
        }
        dct.process_dct2(&mut column);
        for (y, c) in column.iter().enumerate() {
            plane[y * size + x] = *c;
        }
    }
}

fn median(values: &[f32]) -> f32 {
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}
