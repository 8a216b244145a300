use image::GrayImage;
use rayon::prelude::*;
use score_capture_common::config::StitchConfig;
use score_capture_common::frame::Frame;
use tracing::{debug, info};

/// Growing horizontal panorama, kept as the chunks that were appended.
///
/// The full image is only assembled on `panorama()`; matching needs no more
/// than the trailing template columns, rebuilt from the most recent chunks.
#[derive(Debug, Default)]
pub struct ScrollBuffer {
    chunks: Vec<Frame>,
    total_width: u32,
}

impl ScrollBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn total_width(&self) -> u32 {
        self.total_width
    }

    pub fn height(&self) -> Option<u32> {
        self.chunks.first().map(Frame::height)
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Append columns on the right. Zero-width chunks are ignored.
    pub fn append(&mut self, chunk: Frame) {
        if chunk.width() == 0 {
            return;
        }
        self.total_width += chunk.width();
        self.chunks.push(chunk);
    }

    /// The rightmost `width` columns (or the whole buffer if narrower).
    pub fn tail(&self, width: u32) -> Option<Frame> {
        let want = width.min(self.total_width);
        if want == 0 {
            return None;
        }
        let mut covered = 0;
        let mut start = self.chunks.len();
        while covered < want {
            start -= 1;
            covered += self.chunks[start].width();
        }
        let recent = Frame::concat_horizontal(&self.chunks[start..])?;
        Some(recent.columns(covered - want, covered))
    }

    /// Concatenate every chunk into one image.
    pub fn panorama(&self) -> Option<Frame> {
        Frame::concat_horizontal(&self.chunks)
    }
}

/// What pushing one frame did to the buffer.
#[derive(Debug, Clone)]
pub enum StitchOutcome {
    /// First frame of the session; it becomes the buffer.
    Seeded { width: u32 },
    /// New columns were found and appended.
    Appended {
        delta: Frame,
        offset: u32,
        score: f64,
        total_width: u32,
    },
    /// The template matched, but nothing lies to the right of it.
    NoNewColumns { score: f64 },
    /// Best correlation not above the threshold; frame dropped.
    NoMatch { score: f64 },
    /// Frame height differs from the buffer; frame dropped.
    HeightMismatch { expected: u32, got: u32 },
}

/// Best template position found by `match_template`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatchLocation {
    pub x: u32,
    pub y: u32,
    pub score: f64,
}

/// Appends horizontally scrolled frames to a `ScrollBuffer`.
///
/// The trailing `template_width` columns of the buffer are located in each
/// new frame with normalized cross-correlation. Columns to the right of the
/// match are new content.
pub struct ScrollStitcher {
    buffer: ScrollBuffer,
    template_width: u32,
    match_threshold: f64,
}

impl ScrollStitcher {
    pub fn new(config: &StitchConfig) -> Self {
        Self {
            buffer: ScrollBuffer::new(),
            template_width: config.template_width,
            match_threshold: config.match_threshold,
        }
    }

    pub fn buffer(&self) -> &ScrollBuffer {
        &self.buffer
    }

    pub fn push(&mut self, frame: &Frame) -> StitchOutcome {
        let Some(expected) = self.buffer.height() else {
            self.buffer.append(frame.clone());
            info!(width = frame.width(), height = frame.height(), "scroll buffer seeded");
            return StitchOutcome::Seeded {
                width: frame.width(),
            };
        };
        if frame.height() != expected {
            debug!(expected, got = frame.height(), "frame height changed, dropping");
            return StitchOutcome::HeightMismatch {
                expected,
                got: frame.height(),
            };
        }

        let Some(template) = self.buffer.tail(self.template_width) else {
            return StitchOutcome::NoMatch { score: 0.0 };
        };
        let Some(found) = match_template(&frame.to_gray(), &template.to_gray()) else {
            debug!(
                template_width = template.width(),
                frame_width = frame.width(),
                "template wider than frame"
            );
            return StitchOutcome::NoMatch { score: 0.0 };
        };

        if found.score <= self.match_threshold {
            debug!(
                score = found.score,
                threshold = self.match_threshold,
                "no confident match, dropping frame"
            );
            return StitchOutcome::NoMatch { score: found.score };
        }

        let start = found.x + template.width();
        if start >= frame.width() {
            debug!(offset = found.x, score = found.score, "no new columns");
            return StitchOutcome::NoNewColumns { score: found.score };
        }

        let delta = frame.columns(start, frame.width());
        self.buffer.append(delta.clone());
        debug!(
            offset = found.x,
            score = found.score,
            delta_width = delta.width(),
            total_width = self.buffer.total_width(),
            "appended new columns"
        );
        StitchOutcome::Appended {
            delta,
            offset: found.x,
            score: found.score,
            total_width: self.buffer.total_width(),
        }
    }
}

/// Zero-mean normalized cross-correlation of `template` over every position
/// where it fits entirely inside `image`.
///
/// Returns the highest-scoring location (first in row-major order on ties),
/// or `None` if the template is larger than the image. Positions where either
/// side has no variance score 0.
pub fn match_template(image: &GrayImage, template: &GrayImage) -> Option<MatchLocation> {
    let (iw, ih) = image.dimensions();
    let (tw, th) = template.dimensions();
    if tw == 0 || th == 0 || tw > iw || th > ih {
        return None;
    }

    let n = (tw as i64) * (th as i64);
    let t: Vec<i64> = template.as_raw().iter().map(|&v| v as i64).collect();
    let sum_t: i64 = t.iter().sum();
    let var_t = (n * t.iter().map(|v| v * v).sum::<i64>() - sum_t * sum_t) as f64;

    let sums = IntegralImage::new(image);
    let pixels = image.as_raw();
    let (tw, th, iw) = (tw as usize, th as usize, iw as usize);
    let cols = iw - tw + 1;
    let rows = ih as usize - th + 1;

    let scores: Vec<f64> = (0..cols * rows)
        .into_par_iter()
        .map(|pos| {
            let (x, y) = (pos % cols, pos / cols);
            let (sum_f, sum_ff) = sums.window(x, y, tw, th);
            let var_f = (n * sum_ff - sum_f * sum_f) as f64;
            if var_t <= 0.0 || var_f <= 0.0 {
                return 0.0;
            }
            let mut sum_tf = 0i64;
            for j in 0..th {
                let row = &pixels[(y + j) * iw + x..(y + j) * iw + x + tw];
                let trow = &t[j * tw..(j + 1) * tw];
                sum_tf += row
                    .iter()
                    .zip(trow)
                    .map(|(&f, &tv)| f as i64 * tv)
                    .sum::<i64>();
            }
            (n * sum_tf - sum_t * sum_f) as f64 / (var_t * var_f).sqrt()
        })
        .collect();

    let (best, score) = scores
        .iter()
        .copied()
        .enumerate()
        .fold((0, f64::NEG_INFINITY), |acc, (i, s)| if s > acc.1 { (i, s) } else { acc });

    Some(MatchLocation {
        x: (best % cols) as u32,
        y: (best / cols) as u32,
        score,
    })
}

/// Summed-area tables of pixel values and squared values.
struct IntegralImage {
    stride: usize,
    sum: Vec<i64>,
    sum_sq: Vec<i64>,
}

impl IntegralImage {
    fn new(image: &GrayImage) -> Self {
        let (w, h) = (image.width() as usize, image.height() as usize);
        let stride = w + 1;
        let mut sum = vec![0i64; stride * (h + 1)];
        let mut sum_sq = vec![0i64; stride * (h + 1)];
        for y in 0..h {
            let mut row_sum = 0i64;
            let mut row_sq = 0i64;
            for x in 0..w {
                let v = image.as_raw()[y * w + x] as i64;
                row_sum += v;
                row_sq += v * v;
                sum[(y + 1) * stride + x + 1] = sum[y * stride + x + 1] + row_sum;
                sum_sq[(y + 1) * stride + x + 1] = sum_sq[y * stride + x + 1] + row_sq;
            }
        }
        Self {
            stride,
            sum,
            sum_sq,
        }
    }

    /// (sum, sum of squares) over the `w x h` window at `(x, y)`.
    fn window(&self, x: usize, y: usize, w: usize, h: usize) -> (i64, i64) {
        let s = self.stride;
        let (a, b, c, d) = (y * s + x, y * s + x + w, (y + h) * s + x, (y + h) * s + x + w);
        (
            self.sum[d] - self.sum[b] - self.sum[c] + self.sum[a],
            self.sum_sq[d] - self.sum_sq[b] - self.sum_sq[c] + self.sum_sq[a],
        )
    }
}
