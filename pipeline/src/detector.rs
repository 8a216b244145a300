use image::GrayImage;
use score_capture_common::config::DetectorConfig;
use score_capture_common::frame::Frame;
use tracing::{debug, info};

use crate::similarity::{structural_similarity, PerceptualHash};

enum DetectorState {
    /// Nothing accepted yet in this session.
    WaitingFirstFrame,
    /// At least one page accepted; compare against it.
    Steady {
        /// Border-cropped grayscale of the last accepted clean frame.
        last_gray: GrayImage,
        last_hash: PerceptualHash,
    },
}

/// Result of the cheap first look at a sampled frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Trigger {
    /// Possibly a new page: a clean recapture is needed before deciding.
    /// `score` is `None` for the first frame or when shapes differ.
    Candidate { score: Option<f64> },
    /// Similar enough to the last page; drop the frame.
    Unchanged { score: f64 },
}

/// Verdict on the clean (indicator-free) recapture of a candidate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Confirmation {
    NewPage { hash: PerceptualHash },
    Duplicate { distance: u32 },
}

/// Page-turn change detection.
///
/// Two stages: `check` compares the sampled frame to the last accepted page
/// with SSIM; a drop below the sensitivity makes it a candidate. `confirm`
/// then hashes the clean recapture and only a perceptual hash farther than
/// the dedup distance counts as a new page. `commit` records the accepted
/// page once it has been stored.
pub struct ChangeDetector {
    state: DetectorState,
    sensitivity: f64,
    border_px: u32,
    hash_distance_threshold: u32,
    accepted_count: u64,
}

impl ChangeDetector {
    pub fn new(sensitivity: f64, config: &DetectorConfig) -> Self {
        Self {
            state: DetectorState::WaitingFirstFrame,
            sensitivity,
            border_px: config.border_px,
            hash_distance_threshold: config.hash_distance_threshold,
            accepted_count: 0,
        }
    }

    pub fn accepted_count(&self) -> u64 {
        self.accepted_count
    }

    pub fn check(&self, frame: &Frame) -> Trigger {
        let last_gray = match &self.state {
            DetectorState::WaitingFirstFrame => {
                debug!("first frame, candidate unconditionally");
                return Trigger::Candidate { score: None };
            }
            DetectorState::Steady { last_gray, .. } => last_gray,
        };

        let gray = frame.gray_without_border(self.border_px);
        match structural_similarity(&gray, last_gray) {
            Ok(score) if score < self.sensitivity => {
                debug!(
                    score,
                    sensitivity = self.sensitivity,
                    "SSIM dropped below sensitivity"
                );
                Trigger::Candidate { score: Some(score) }
            }
            Ok(score) => {
                debug!(score, "frame unchanged");
                Trigger::Unchanged { score }
            }
            Err(e) => {
                debug!(error = %e, "shape mismatch, treating as changed");
                Trigger::Candidate { score: None }
            }
        }
    }

    pub fn confirm(&self, clean: &Frame) -> Confirmation {
        let hash = PerceptualHash::of_rgb(clean.image());
        match &self.state {
            DetectorState::WaitingFirstFrame => Confirmation::NewPage { hash },
            DetectorState::Steady { last_hash, .. } => {
                let distance = hash.distance(last_hash);
                let is_new = distance > self.hash_distance_threshold;
                debug!(
                    distance,
                    threshold = self.hash_distance_threshold,
                    is_new,
                    "pHash comparison"
                );
                if is_new {
                    Confirmation::NewPage { hash }
                } else {
                    Confirmation::Duplicate { distance }
                }
            }
        }
    }

    /// Make `clean` the new reference page.
    pub fn commit(&mut self, clean: &Frame, hash: PerceptualHash) {
        self.state = DetectorState::Steady {
            last_gray: clean.gray_without_border(self.border_px),
            last_hash: hash,
        };
        self.accepted_count += 1;
        info!(accepted = self.accepted_count, hash = %format_args!("{:016x}", hash.0), "page accepted");
    }
}
