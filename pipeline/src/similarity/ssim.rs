use image::GrayImage;
use rayon::prelude::*;

use super::SimilarityError;

/// Gaussian window side used when the image is large enough.
pub const WINDOW_SIZE: usize = 11;
pub const SIGMA: f64 = 1.5;
/// (0.01 * 255)^2
pub const C1: f64 = 6.5025;
/// (0.03 * 255)^2
pub const C2: f64 = 58.5225;

/// Mean structural similarity of two equally sized grayscale images.
///
/// Local statistics are Gaussian-weighted (11x11, sigma 1.5, shrunk to the
/// largest odd size that fits), borders are mirrored, and the per-pixel SSIM
/// map is averaged over every pixel. Identical inputs score exactly 1.0.
pub fn structural_similarity(a: &GrayImage, b: &GrayImage) -> Result<f64, SimilarityError> {
    if a.dimensions() != b.dimensions() {
        return Err(SimilarityError::ShapeMismatch {
            a_width: a.width(),
            a_height: a.height(),
            b_width: b.width(),
            b_height: b.height(),
        });
    }

    let (w, h) = (a.width() as usize, a.height() as usize);
    if w == 0 || h == 0 {
        return Ok(1.0);
    }

    let kernel = gaussian_kernel(window_size(w, h), SIGMA);

    let x: Vec<f64> = a.as_raw().iter().map(|&v| v as f64).collect();
    let y: Vec<f64> = b.as_raw().iter().map(|&v| v as f64).collect();
    let xx: Vec<f64> = x.iter().map(|v| v * v).collect();
    let yy: Vec<f64> = y.iter().map(|v| v * v).collect();
    let xy: Vec<f64> = x.iter().zip(&y).map(|(p, q)| p * q).collect();

    let mu_x = blur(&x, w, h, &kernel);
    let mu_y = blur(&y, w, h, &kernel);
    let e_xx = blur(&xx, w, h, &kernel);
    let e_yy = blur(&yy, w, h, &kernel);
    let e_xy = blur(&xy, w, h, &kernel);

    // Row sums are collected in order so the result does not depend on scheduling.
    let row_sums: Vec<f64> = (0..h)
        .into_par_iter()
        .map(|row| {
            (row * w..(row + 1) * w)
                .map(|i| {
                    let (mx, my) = (mu_x[i], mu_y[i]);
                    let var_x = e_xx[i] - mx * mx;
                    let var_y = e_yy[i] - my * my;
                    let cov = e_xy[i] - mx * my;
                    let num = (2.0 * mx * my + C1) * (2.0 * cov + C2);
                    let den = (mx * mx + my * my + C1) * (var_x + var_y + C2);
                    num / den
                })
                .sum::<f64>()
        })
        .collect();

    Ok(row_sums.iter().sum::<f64>() / (w * h) as f64)
}

/// Largest odd window not exceeding `WINDOW_SIZE` or the smaller image side.
fn window_size(w: usize, h: usize) -> usize {
    let side = WINDOW_SIZE.min(w.min(h));
    if side % 2 == 0 {
        side - 1
    } else {
        side
    }
}

fn gaussian_kernel(size: usize, sigma: f64) -> Vec<f64> {
    let radius = (size / 2) as f64;
    let mut kernel: Vec<f64> = (0..size)
        .map(|i| {
            let d = i as f64 - radius;
            (-(d * d) / (2.0 * sigma * sigma)).exp()
        })
        .collect();
    let sum: f64 = kernel.iter().sum();
    kernel.iter_mut().for_each(|k| *k /= sum);
    kernel
}

/// Mirror an out-of-range index back into `0..n` (`d c b a | a b c d | d c b a`).
fn reflect(i: isize, n: usize) -> usize {
    let n = n as isize;
    let r = if i < 0 {
        -i - 1
    } else if i >= n {
        2 * n - i - 1
    } else {
        i
    };
    r.clamp(0, n - 1) as usize
}

/// Separable convolution of a row-major `w x h` plane.
fn blur(src: &[f64], w: usize, h: usize, kernel: &[f64]) -> Vec<f64> {
    let radius = (kernel.len() / 2) as isize;

    let mut horizontal = vec![0.0; w * h];
    horizontal
        .par_chunks_mut(w)
        .enumerate()
        .for_each(|(y, row)| {
            let line = &src[y * w..(y + 1) * w];
            for (x, out) in row.iter_mut().enumerate() {
                *out = kernel
                    .iter()
                    .enumerate()
                    .map(|(k, weight)| weight * line[reflect(x as isize + k as isize - radius, w)])
                    .sum();
            }
        });

    let mut out = vec![0.0; w * h];
    out.par_chunks_mut(w).enumerate().for_each(|(y, row)| {
        for (k, weight) in kernel.iter().enumerate() {
            let sy = reflect(y as isize + k as isize - radius, h);
            let line = &horizontal[sy * w..(sy + 1) * w];
            for (o, v) in row.iter_mut().zip(line) {
                *o += weight * v;
            }
        }
    });
    out
}
