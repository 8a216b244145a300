use score_capture_common::frame::Frame;
use std::path::PathBuf;
use tracing::{debug, info};

/// Writes accepted pages and finished slices as numbered PNG files.
///
/// File names follow `{prefix}_{seq:03}.png`, e.g. `captured_scores/score_001.png`.
#[derive(Debug, Clone)]
pub struct LocalStorage {
    dir: PathBuf,
    prefix: String,
}

impl LocalStorage {
    pub fn new(dir: impl Into<PathBuf>, prefix: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            prefix: prefix.into(),
        }
    }

    /// Create the output directory if it does not exist yet.
    pub fn ensure_dir(&self) -> Result<(), StorageError> {
        if !self.dir.exists() {
            std::fs::create_dir_all(&self.dir)
                .map_err(|e| StorageError::CreateDir(self.dir.display().to_string(), e))?;
            info!(dir = %self.dir.display(), "created output directory");
        }
        Ok(())
    }

    pub fn path_for(&self, seq: u64) -> PathBuf {
        self.dir.join(image_file_name(&self.prefix, seq))
    }

    /// Encode `frame` as PNG under its sequence number.
    pub fn put_image(&self, seq: u64, frame: &Frame) -> Result<PathBuf, StorageError> {
        self.ensure_dir()?;
        let path = self.path_for(seq);
        frame
            .image()
            .save(&path)
            .map_err(|e| StorageError::Encode(path.display().to_string(), e))?;
        debug!(
            path = %path.display(),
            width = frame.width(),
            height = frame.height(),
            "stored image"
        );
        Ok(path)
    }
}

/// e.g. `score_007.png`
pub fn image_file_name(prefix: &str, seq: u64) -> String {
    format!("{prefix}_{seq:03}.png")
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("failed to create output directory {0}: {1}")]
    CreateDir(String, std::io::Error),
    #[error("failed to write image {0}: {1}")]
    Encode(String, image::ImageError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    #[test]
    fn file_names_are_zero_padded() {
        assert_eq!(image_file_name("score", 1), "score_001.png");
        assert_eq!(image_file_name("score", 42), "score_042.png");
        assert_eq!(image_file_name("slice", 1234), "slice_1234.png");
    }

    #[test]
    fn put_image_creates_directory_and_file() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(tmp.path().join("nested/out"), "score");
        let frame = Frame::new(RgbImage::from_pixel(12, 7, Rgb([10, 20, 30])));

        let path = storage.put_image(3, &frame).unwrap();
        assert_eq!(path, tmp.path().join("nested/out/score_003.png"));

        let loaded = image::open(&path).unwrap().to_rgb8();
        assert_eq!(loaded.dimensions(), (12, 7));
        assert_eq!(loaded.get_pixel(5, 5), &Rgb([10, 20, 30]));
    }
}
