//! Frame comparison primitives used by page-turn detection.

pub mod phash;
pub mod ssim;

pub use phash::PerceptualHash;
pub use ssim::structural_similarity;

#[derive(Debug, thiserror::Error)]
pub enum SimilarityError {
    #[error("cannot compare {a_width}x{a_height} with {b_width}x{b_height}")]
    ShapeMismatch {
        a_width: u32,
        a_height: u32,
        b_width: u32,
        b_height: u32,
    },
}
