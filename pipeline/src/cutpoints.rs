use image::GrayImage;
use score_capture_common::frame::Frame;
use std::collections::BTreeSet;
use tracing::debug;

/// Gray level at or below which a pixel counts as ink.
pub const INK_THRESHOLD: u8 = 200;
/// Vertical structuring element height as a fraction of panorama height.
const KERNEL_HEIGHT_RATIO: f64 = 0.3;
const MIN_KERNEL_HEIGHT: u32 = 10;
/// Barline candidates closer than this collapse to the strongest one.
const PEAK_SEPARATION: u32 = 5;
/// Cut this many columns to the right of a chosen barline.
const BARLINE_OFFSET: u32 = 5;
/// Moving-average width for the whitespace fallback.
const SMOOTHING_WINDOW: usize = 5;
const SEARCH_LOW: f64 = 0.8;
const SEARCH_HIGH: f64 = 1.2;

/// How a cut inside a search window was chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CutKind {
    Barline { column: u32, strength: u32 },
    Whitespace { column: u32 },
}

impl CutKind {
    pub fn column(&self) -> u32 {
        match *self {
            CutKind::Barline { column, .. } | CutKind::Whitespace { column } => column,
        }
    }
}

/// Places cuts roughly every `target_width` columns across a panorama,
/// preferring barlines and falling back to the emptiest column.
#[derive(Debug, Clone)]
pub struct CutPointFinder {
    target_width: u32,
    min_slice_width: u32,
}

impl CutPointFinder {
    pub fn new(target_width: u32, min_slice_width: u32) -> Self {
        Self {
            target_width,
            min_slice_width,
        }
    }

    pub fn min_slice_width(&self) -> u32 {
        self.min_slice_width
    }

    pub fn find(&self, panorama: &Frame) -> CutSet {
        self.find_in_gray(&panorama.to_gray())
    }

    pub fn find_in_gray(&self, gray: &GrayImage) -> CutSet {
        let mut cuts = CutSet::new(self.min_slice_width);
        let width = gray.width();
        if self.target_width == 0 || width == 0 {
            return cuts;
        }

        let target = self.target_width as f64;
        let mut current = 0u32;
        while (width - current) as f64 > SEARCH_HIGH * target {
            let lo = current + (SEARCH_LOW * target).round() as u32;
            let hi = (current + (SEARCH_HIGH * target).round() as u32).min(width - 1);
            let kind = self.choose_cut(gray, lo, hi + 1);
            let cut = kind.column().clamp(current + 1, width - 1);
            debug!(current, lo, hi, cut, ?kind, "cut chosen");
            cuts.insert(cut);
            current = cut;
        }
        cuts
    }

    /// Pick a cut inside columns `[start, end)`.
    pub fn choose_cut(&self, gray: &GrayImage, start: u32, end: u32) -> CutKind {
        let last = gray.width().saturating_sub(1);
        let strongest = barline_candidates(gray, start, end)
            .into_iter()
            .max_by_key(|&(column, strength)| (strength, column));
        match strongest {
            Some((column, strength)) => CutKind::Barline {
                column: (column + BARLINE_OFFSET).min(last),
                strength,
            },
            None => CutKind::Whitespace {
                column: whitespace_column(gray, start, end),
            },
        }
    }
}

/// Strong vertical lines in columns `[start, end)` as `(column, strength)`,
/// ordered by column.
///
/// Ink is opened with a `1 x k` vertical element (k = 30% of the height, at
/// least 10), so only vertical runs of k or more pixels survive. The
/// per-column count of surviving pixels is the strength; local maxima above
/// k/2 are candidates, thinned so no two are within 5 columns.
pub fn barline_candidates(gray: &GrayImage, start: u32, end: u32) -> Vec<(u32, u32)> {
    let end = end.min(gray.width());
    if start >= end {
        return Vec::new();
    }
    let height = gray.height();
    let kernel = ((height as f64 * KERNEL_HEIGHT_RATIO) as u32).max(MIN_KERNEL_HEIGHT);

    let projection: Vec<u32> = (start..end)
        .map(|x| {
            let mut total = 0;
            let mut run = 0;
            for y in 0..height {
                if gray.get_pixel(x, y).0[0] <= INK_THRESHOLD {
                    run += 1;
                } else {
                    if run >= kernel {
                        total += run;
                    }
                    run = 0;
                }
            }
            if run >= kernel {
                total += run;
            }
            total
        })
        .collect();

    let floor = kernel as f64 / 2.0;
    let mut peaks: Vec<(u32, u32)> = (0..projection.len())
        .filter(|&i| {
            let v = projection[i];
            let left_ok = i == 0 || v >= projection[i - 1];
            let right_ok = i + 1 == projection.len() || v > projection[i + 1];
            v as f64 > floor && left_ok && right_ok
        })
        .map(|i| (start + i as u32, projection[i]))
        .collect();

    // Strongest first; on equal strength the later column wins.
    peaks.sort_by(|a, b| b.1.cmp(&a.1).then(b.0.cmp(&a.0)));
    let mut kept: Vec<(u32, u32)> = Vec::new();
    for peak in peaks {
        if kept.iter().all(|k| k.0.abs_diff(peak.0) >= PEAK_SEPARATION) {
            kept.push(peak);
        }
    }
    kept.sort_by_key(|p| p.0);
    kept
}

/// Column in `[start, end)` with the least smoothed ink, first on ties.
///
/// Ink per column is the sum of `255 - gray`; smoothing is a 5-wide moving
/// average that only counts in-window neighbours at the edges.
pub fn whitespace_column(gray: &GrayImage, start: u32, end: u32) -> u32 {
    let end = end.min(gray.width());
    if start >= end {
        return start;
    }
    let ink: Vec<f64> = (start..end)
        .map(|x| {
            (0..gray.height())
                .map(|y| (255 - gray.get_pixel(x, y).0[0]) as f64)
                .sum()
        })
        .collect();

    let half = SMOOTHING_WINDOW / 2;
    let smoothed: Vec<f64> = (0..ink.len())
        .map(|i| {
            let lo = i.saturating_sub(half);
            let hi = (i + half + 1).min(ink.len());
            ink[lo..hi].iter().sum::<f64>() / (hi - lo) as f64
        })
        .collect();

    let best = smoothed
        .iter()
        .enumerate()
        .fold((0, f64::INFINITY), |acc, (i, &v)| if v < acc.1 { (i, v) } else { acc })
        .0;
    start + best as u32
}

/// Manual adjustments applied on top of automatic detection.
#[derive(Debug, Clone, Default)]
pub struct CutEdits {
    pub add: Vec<u32>,
    pub remove: Vec<u32>,
    pub tolerance: u32,
}

impl CutEdits {
    pub fn is_empty(&self) -> bool {
        self.add.is_empty() && self.remove.is_empty()
    }

    /// Removals first, so a removal never takes out a cut added in the same pass.
    pub fn apply(&self, cuts: &mut CutSet) {
        for &x in &self.remove {
            match cuts.remove_nearest(x, self.tolerance) {
                Some(removed) => debug!(x, removed, "manual cut removal"),
                None => debug!(x, tolerance = self.tolerance, "no cut near removal point"),
            }
        }
        for &x in &self.add {
            if cuts.insert(x) {
                debug!(x, "manual cut added");
            }
        }
    }
}

/// Ordered, duplicate-free cut columns over a panorama.
///
/// Intervals narrower than `min_slice_width` are dropped: their columns
/// appear in no slice. Removing the cut between a real slice and a sliver
/// folds the sliver's columns back into that slice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CutSet {
    cuts: BTreeSet<u32>,
    min_slice_width: u32,
}

impl CutSet {
    pub fn new(min_slice_width: u32) -> Self {
        Self {
            cuts: BTreeSet::new(),
            min_slice_width,
        }
    }

    pub fn from_columns(columns: impl IntoIterator<Item = u32>, min_slice_width: u32) -> Self {
        let mut set = Self::new(min_slice_width);
        set.replace(columns);
        set
    }

    /// Add a cut. Column 0 is the panorama's left edge and is ignored.
    pub fn insert(&mut self, column: u32) -> bool {
        column > 0 && self.cuts.insert(column)
    }

    /// Remove the cut closest to `column` if it lies within `tolerance`.
    pub fn remove_nearest(&mut self, column: u32, tolerance: u32) -> Option<u32> {
        let nearest = self
            .cuts
            .iter()
            .copied()
            .filter(|c| c.abs_diff(column) <= tolerance)
            .min_by_key(|c| (c.abs_diff(column), *c))?;
        self.cuts.remove(&nearest);
        Some(nearest)
    }

    /// Discard every cut and use `columns` instead.
    pub fn replace(&mut self, columns: impl IntoIterator<Item = u32>) {
        self.cuts.clear();
        for c in columns {
            self.insert(c);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        self.cuts.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.cuts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cuts.is_empty()
    }

    /// Every `[start, end)` between consecutive boundaries, including slivers.
    pub fn intervals(&self, width: u32) -> Vec<(u32, u32)> {
        let mut bounds = vec![0];
        bounds.extend(self.cuts.iter().copied().filter(|&c| c < width));
        bounds.push(width);
        bounds.windows(2).map(|w| (w[0], w[1])).collect()
    }

    /// Intervals wide enough to become slices.
    pub fn slice_intervals(&self, width: u32) -> Vec<(u32, u32)> {
        self.intervals(width)
            .into_iter()
            .filter(|(a, b)| b - a >= self.min_slice_width)
            .collect()
    }

    pub fn slice_count(&self, width: u32) -> usize {
        self.slice_intervals(width).len()
    }

    /// Crop the panorama into slices, left to right.
    pub fn slices(&self, panorama: &Frame) -> Vec<Frame> {
        self.slice_intervals(panorama.width())
            .into_iter()
            .map(|(a, b)| panorama.columns(a, b))
            .collect()
    }
}
