use score_capture_common::config::{CaptureMode, Config};
use score_capture_common::frame::Frame;
use std::path::PathBuf;
use tracing::{error, info, warn};

use crate::cutpoints::{CutEdits, CutPointFinder, CutSet};
use crate::detector::{ChangeDetector, Confirmation, Trigger};
use crate::session::{CaptureSession, SavedImage, SessionOutput};
use crate::stitch::{ScrollStitcher, StitchOutcome};

/// Why a frame produced no output.
#[derive(Debug, Clone, PartialEq)]
pub enum Discard {
    Unchanged { score: f64 },
    Duplicate { distance: u32 },
    NoMatch { score: f64 },
    NoNewColumns,
    HeightMismatch,
    /// A clean frame arrived without a pending candidate.
    NotRequested,
    /// The clean recapture failed or was cancelled.
    CleanFrameUnavailable,
    StorageFailed,
}

/// Result of handing one frame to a processor.
#[derive(Debug, Clone)]
pub enum Decision {
    Discarded(Discard),
    /// The frame is a candidate; recapture without the indicator and pass
    /// the result to `handle_clean`.
    NeedCleanFrame,
    Saved { seq: u64, path: PathBuf },
    /// `delta` holds the columns just appended (the whole frame when seeding).
    BufferUpdated { delta: Frame, total_width: u32 },
}

/// Per-mode frame handling. One instance lives for one session.
pub trait Processor: Send {
    fn mode(&self) -> CaptureMode;

    fn handle(&mut self, frame: &Frame, session: &mut CaptureSession) -> Decision;

    fn handle_clean(&mut self, _frame: Frame, _session: &mut CaptureSession) -> Decision {
        Decision::Discarded(Discard::NotRequested)
    }

    /// The clean recapture for a pending candidate could not be taken.
    fn abandon_candidate(&mut self) {}

    /// Wrap up the session and return what it produced.
    fn finish(self: Box<Self>, session: &mut CaptureSession) -> SessionOutput;
}

/// Build the processor for the configured capture mode.
pub fn for_mode(config: &Config) -> Box<dyn Processor> {
    match config.capture.mode {
        CaptureMode::PageTurn => Box::new(PageTurnProcessor::new(
            ChangeDetector::new(config.capture.sensitivity, &config.detector),
        )),
        CaptureMode::ScrollStitch => Box::new(
            ScrollStitchProcessor::new(
                ScrollStitcher::new(&config.stitch),
                CutPointFinder::new(
                    config.slicing.effective_target_width(&config.capture.region),
                    config.slicing.min_slice_width,
                ),
            )
            .with_edits(CutEdits {
                add: config.slicing.add_cuts.clone(),
                remove: config.slicing.remove_cuts.clone(),
                tolerance: config.slicing.remove_tolerance,
            }),
        ),
    }
}

pub struct PageTurnProcessor {
    detector: ChangeDetector,
    pending: bool,
    pages: Vec<SavedImage>,
}

impl PageTurnProcessor {
    pub fn new(detector: ChangeDetector) -> Self {
        Self {
            detector,
            pending: false,
            pages: Vec::new(),
        }
    }
}

impl Processor for PageTurnProcessor {
    fn mode(&self) -> CaptureMode {
        CaptureMode::PageTurn
    }

    fn handle(&mut self, frame: &Frame, _session: &mut CaptureSession) -> Decision {
        match self.detector.check(frame) {
            Trigger::Unchanged { score } => Decision::Discarded(Discard::Unchanged { score }),
            Trigger::Candidate { .. } => {
                self.pending = true;
                Decision::NeedCleanFrame
            }
        }
    }

    fn handle_clean(&mut self, frame: Frame, session: &mut CaptureSession) -> Decision {
        if !std::mem::take(&mut self.pending) {
            warn!(session = session.id(), "clean frame without pending candidate");
            return Decision::Discarded(Discard::NotRequested);
        }

        let hash = match self.detector.confirm(&frame) {
            Confirmation::Duplicate { distance } => {
                return Decision::Discarded(Discard::Duplicate { distance })
            }
            Confirmation::NewPage { hash } => hash,
        };

        match session.persist(frame) {
            Ok(saved) => {
                self.detector.commit(&saved.frame, hash);
                let decision = Decision::Saved {
                    seq: saved.seq,
                    path: saved.path.clone(),
                };
                self.pages.push(saved);
                decision
            }
            Err(e) => {
                error!(session = session.id(), error = %e, "failed to store page");
                Decision::Discarded(Discard::StorageFailed)
            }
        }
    }

    fn abandon_candidate(&mut self) {
        self.pending = false;
    }

    fn finish(self: Box<Self>, session: &mut CaptureSession) -> SessionOutput {
        info!(session = session.id(), pages = self.pages.len(), "page-turn session finished");
        SessionOutput::Pages(self.pages)
    }
}

pub struct ScrollStitchProcessor {
    stitcher: ScrollStitcher,
    finder: CutPointFinder,
    edits: CutEdits,
}

impl ScrollStitchProcessor {
    pub fn new(stitcher: ScrollStitcher, finder: CutPointFinder) -> Self {
        Self {
            stitcher,
            finder,
            edits: CutEdits::default(),
        }
    }

    pub fn with_edits(mut self, edits: CutEdits) -> Self {
        self.edits = edits;
        self
    }
}

impl Processor for ScrollStitchProcessor {
    fn mode(&self) -> CaptureMode {
        CaptureMode::ScrollStitch
    }

    fn handle(&mut self, frame: &Frame, _session: &mut CaptureSession) -> Decision {
        match self.stitcher.push(frame) {
            StitchOutcome::Seeded { width } => Decision::BufferUpdated {
                delta: frame.clone(),
                total_width: width,
            },
            StitchOutcome::Appended {
                delta, total_width, ..
            } => Decision::BufferUpdated { delta, total_width },
            StitchOutcome::NoNewColumns { .. } => Decision::Discarded(Discard::NoNewColumns),
            StitchOutcome::NoMatch { score } => Decision::Discarded(Discard::NoMatch { score }),
            StitchOutcome::HeightMismatch { .. } => Decision::Discarded(Discard::HeightMismatch),
        }
    }

    fn finish(self: Box<Self>, session: &mut CaptureSession) -> SessionOutput {
        let Some(panorama) = self.stitcher.buffer().panorama() else {
            info!(session = session.id(), "scroll session finished with empty buffer");
            return SessionOutput::Slices {
                panorama: None,
                cuts: CutSet::new(self.finder.min_slice_width()),
                slices: Vec::new(),
            };
        };

        let mut cuts = self.finder.find(&panorama);
        if !self.edits.is_empty() {
            self.edits.apply(&mut cuts);
        }
        let mut slices = Vec::new();
        for slice in cuts.slices(&panorama) {
            match session.persist(slice) {
                Ok(saved) => slices.push(saved),
                Err(e) => error!(session = session.id(), error = %e, "failed to store slice"),
            }
        }
        info!(
            session = session.id(),
            panorama_width = panorama.width(),
            cuts = cuts.len(),
            slices = slices.len(),
            "scroll session finished"
        );
        SessionOutput::Slices {
            panorama: Some(panorama),
            cuts,
            slices,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::LocalStorage;
    use image::{Rgb, RgbImage};
    use score_capture_common::config::{DetectorConfig, StitchConfig};

    fn page(kind: u32) -> Frame {
        Frame::new(RgbImage::from_fn(160, 120, |x, y| {
            let on = match kind {
                0 => (y % 16) < 2 || ((x * 7 + y * 3) / 23) % 5 == 0,
                1 => x < 80,
                _ => (x / 10 + y / 10) % 2 == 0,
            };
            if on {
                Rgb([0, 0, 0])
            } else {
                Rgb([255, 255, 255])
            }
        }))
    }

    fn page_turn(sensitivity: f64) -> PageTurnProcessor {
        PageTurnProcessor::new(ChangeDetector::new(sensitivity, &DetectorConfig::default()))
    }

    fn session(dir: &std::path::Path) -> CaptureSession {
        CaptureSession::new(1, LocalStorage::new(dir, "score"))
    }

    /// Run one tick the way the controller does, using the same frame as the clean one.
    fn tick(p: &mut dyn Processor, frame: &Frame, s: &mut CaptureSession) -> Decision {
        match p.handle(frame, s) {
            Decision::NeedCleanFrame => p.handle_clean(frame.clone(), s),
            other => other,
        }
    }

    #[test]
    fn page_sequence_is_saved_once_per_page() {
        let tmp = tempfile::tempdir().unwrap();
        let mut s = session(tmp.path());
        let mut p = page_turn(0.9);

        let frames = [page(0), page(0), page(1), page(1), page(1), page(2)];
        let saved: Vec<u64> = frames
            .iter()
            .filter_map(|f| match tick(&mut p, f, &mut s) {
                Decision::Saved { seq, .. } => Some(seq),
                _ => None,
            })
            .collect();
        assert_eq!(saved, vec![1, 2, 3]);
        assert!(tmp.path().join("score_003.png").exists());

        let output = Box::new(p).finish(&mut s);
        assert!(matches!(&output, SessionOutput::Pages(pages) if pages.len() == 3));
    }

    #[test]
    fn identical_frames_never_saved_twice() {
        let tmp = tempfile::tempdir().unwrap();
        for sensitivity in [0.1, 0.5, 0.9, 0.99, 1.0] {
            let mut s = session(tmp.path());
            let mut p = page_turn(sensitivity);
            assert!(matches!(tick(&mut p, &page(2), &mut s), Decision::Saved { .. }));
            assert!(matches!(
                tick(&mut p, &page(2), &mut s),
                Decision::Discarded(Discard::Unchanged { .. })
            ));
        }
    }

    #[test]
    fn near_duplicate_is_rejected_by_hash() {
        let tmp = tempfile::tempdir().unwrap();
        let mut s = session(tmp.path());
        let mut p = page_turn(1.0);
        let first = page(0);
        tick(&mut p, &first, &mut s);

        let mut image = first.image().clone();
        image.put_pixel(60, 60, Rgb([90, 90, 90]));
        let decision = tick(&mut p, &Frame::new(image), &mut s);
        assert!(matches!(decision, Decision::Discarded(Discard::Duplicate { .. })));
        assert_eq!(s.saved_count(), 1);
    }

    #[test]
    fn clean_frame_requires_pending_candidate() {
        let tmp = tempfile::tempdir().unwrap();
        let mut s = session(tmp.path());
        let mut p = page_turn(0.9);
        assert!(matches!(
            p.handle_clean(page(0), &mut s),
            Decision::Discarded(Discard::NotRequested)
        ));

        assert!(matches!(p.handle(&page(0), &mut s), Decision::NeedCleanFrame));
        p.abandon_candidate();
        assert!(matches!(
            p.handle_clean(page(0), &mut s),
            Decision::Discarded(Discard::NotRequested)
        ));
        assert_eq!(s.saved_count(), 0);
    }

    #[test]
    fn storage_failure_keeps_previous_reference() {
        let tmp = tempfile::tempdir().unwrap();
        let blocker = tmp.path().join("blocked");
        std::fs::write(&blocker, b"x").unwrap();
        let mut broken = CaptureSession::new(1, LocalStorage::new(blocker.join("out"), "score"));
        let mut p = page_turn(0.9);

        assert!(matches!(
            tick(&mut p, &page(0), &mut broken),
            Decision::Discarded(Discard::StorageFailed)
        ));
        // Still nothing accepted, so the same page is a candidate again.
        assert!(matches!(p.handle(&page(0), &mut broken), Decision::NeedCleanFrame));
    }

    fn strip(width: u32, height: u32) -> RgbImage {
        RgbImage::from_fn(width, height, |x, y| {
            let mut h = x.wrapping_mul(2_246_822_519) ^ y.wrapping_mul(3_266_489_917);
            h ^= h >> 15;
            h = h.wrapping_mul(668_265_263);
            h ^= h >> 13;
            let v = if x % 300 == 299 { 0 } else { 210 + (h % 46) as u8 };
            Rgb([v, v, v])
        })
    }

    #[test]
    fn scroll_session_stitches_and_slices() {
        let tmp = tempfile::tempdir().unwrap();
        let mut s = session(tmp.path());
        let source = strip(1500, 50);
        let mut p = ScrollStitchProcessor::new(
            ScrollStitcher::new(&StitchConfig::default()),
            CutPointFinder::new(400, 50),
        );

        let mut widths = Vec::new();
        let mut deltas = Vec::new();
        for x in (0..=1100).step_by(100) {
            let frame = Frame::new(
                image::imageops::crop_imm(&source, x, 0, 400, 50).to_image(),
            );
            if let Decision::BufferUpdated { delta, total_width } = p.handle(&frame, &mut s) {
                widths.push(total_width);
                deltas.push(delta);
            }
        }
        // The visible deltas alone rebuild the strip.
        let rebuilt = Frame::concat_horizontal(&deltas).unwrap();
        assert_eq!(rebuilt.image().as_raw(), source.as_raw());
        assert_eq!(widths.first(), Some(&400));
        assert_eq!(widths.last(), Some(&1500));

        let output = Box::new(p).finish(&mut s);
        let SessionOutput::Slices {
            panorama,
            cuts,
            slices,
        } = output
        else {
            panic!("expected slices");
        };
        assert_eq!(panorama.unwrap().width(), 1500);
        assert!(!cuts.is_empty());
        assert_eq!(slices.len(), cuts.slice_count(1500));
        assert!(slices.iter().all(|s| s.frame.width() >= 50));
        assert_eq!(slices[0].seq, 1);
    }

    #[test]
    fn empty_scroll_session_yields_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        let mut s = session(tmp.path());
        let p = ScrollStitchProcessor::new(
            ScrollStitcher::new(&StitchConfig::default()),
            CutPointFinder::new(400, 50),
        );
        let output = Box::new(p).finish(&mut s);
        assert!(output.is_empty());
        assert!(matches!(output, SessionOutput::Slices { panorama: None, .. }));
    }
}
