use image::{imageops, RgbImage};
use score_capture_common::frame::{CaptureRegion, Frame, FrameError};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

#[derive(Debug, thiserror::Error)]
pub enum AcquisitionError {
    #[error("invalid capture region: {0}")]
    InvalidRegion(#[from] FrameError),
    #[error(
        "region {width}x{height}+{left}+{top} lies outside the {screen_width}x{screen_height} screen"
    )]
    OutOfBounds {
        left: i32,
        top: i32,
        width: u32,
        height: u32,
        screen_width: u32,
        screen_height: u32,
    },
    #[error("screen grab failed: {0}")]
    Grab(String),
    #[error("acquisition cancelled")]
    Cancelled,
}

/// Produces the pixels inside a screen rectangle.
pub trait FrameSource: Send {
    fn grab(&mut self, region: &CaptureRegion) -> Result<Frame, AcquisitionError>;
}

/// On-screen capture-region overlay. Both calls must take effect before
/// the next `grab` returns.
pub trait Indicator: Send {
    fn hide(&mut self);
    fn show(&mut self);
}

/// For headless runs: there is nothing on screen to hide.
pub struct NoopIndicator;

impl Indicator for NoopIndicator {
    fn hide(&mut self) {}
    fn show(&mut self) {}
}

/// Replays a directory of full-screen screenshots in file-name order.
///
/// Every grab advances to the next screenshot; once the list is exhausted the
/// last one is held. The capture region is cropped out of the screenshot.
pub struct ReplaySource {
    screens: Vec<PathBuf>,
    next: usize,
    loaded: Option<(usize, RgbImage)>,
}

const SCREEN_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "bmp"];

impl ReplaySource {
    pub fn open(dir: &Path) -> Result<Self, AcquisitionError> {
        let entries = std::fs::read_dir(dir)
            .map_err(|e| AcquisitionError::Grab(format!("{}: {e}", dir.display())))?;
        let mut screens: Vec<PathBuf> = entries
            .flatten()
            .map(|entry| entry.path())
            .filter(|path| {
                path.extension()
                    .and_then(|e| e.to_str())
                    .map(|e| SCREEN_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
                    .unwrap_or(false)
            })
            .collect();
        screens.sort();

        if screens.is_empty() {
            return Err(AcquisitionError::Grab(format!(
                "no screenshots in {}",
                dir.display()
            )));
        }
        info!(dir = %dir.display(), screens = screens.len(), "replay source opened");
        Ok(Self {
            screens,
            next: 0,
            loaded: None,
        })
    }

    pub fn len(&self) -> usize {
        self.screens.len()
    }

    fn screen(&mut self, index: usize) -> Result<&RgbImage, AcquisitionError> {
        if self.loaded.as_ref().map(|(i, _)| *i) != Some(index) {
            let path = &self.screens[index];
            let image = image::open(path)
                .map_err(|e| AcquisitionError::Grab(format!("{}: {e}", path.display())))?
                .to_rgb8();
            debug!(path = %path.display(), "loaded screenshot");
            self.loaded = Some((index, image));
        }
        match &self.loaded {
            Some((_, image)) => Ok(image),
            None => Err(AcquisitionError::Grab("screenshot not loaded".into())),
        }
    }
}

impl FrameSource for ReplaySource {
    fn grab(&mut self, region: &CaptureRegion) -> Result<Frame, AcquisitionError> {
        region.validate()?;
        let index = self.next.min(self.screens.len() - 1);
        self.next = self.next.saturating_add(1);
        let screen = self.screen(index)?;
        let image = crop_region(screen, region)?;
        Ok(Frame::new(image))
    }
}

/// Copy `region` out of a full screenshot.
pub fn crop_region(screen: &RgbImage, region: &CaptureRegion) -> Result<RgbImage, AcquisitionError> {
    let (sw, sh) = screen.dimensions();
    let fits = region.left >= 0
        && region.top >= 0
        && region.left as u64 + region.width as u64 <= sw as u64
        && region.top as u64 + region.height as u64 <= sh as u64;
    if !fits {
        return Err(AcquisitionError::OutOfBounds {
            left: region.left,
            top: region.top,
            width: region.width,
            height: region.height,
            screen_width: sw,
            screen_height: sh,
        });
    }
    Ok(imageops::crop_imm(
        screen,
        region.left as u32,
        region.top as u32,
        region.width,
        region.height,
    )
    .to_image())
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn screen(shade: u8) -> RgbImage {
        RgbImage::from_fn(100, 80, |x, y| Rgb([shade, x as u8, y as u8]))
    }

    #[test]
    fn crops_region_from_screen() {
        let region = CaptureRegion::new(10, 20, 30, 40);
        let crop = crop_region(&screen(7), &region).unwrap();
        assert_eq!(crop.dimensions(), (30, 40));
        assert_eq!(crop.get_pixel(0, 0), &Rgb([7, 10, 20]));
        assert_eq!(crop.get_pixel(29, 39), &Rgb([7, 39, 59]));
    }

    #[test]
    fn region_outside_screen_is_rejected() {
        for region in [
            CaptureRegion::new(-1, 0, 30, 30),
            CaptureRegion::new(80, 0, 30, 30),
            CaptureRegion::new(0, 60, 30, 30),
        ] {
            assert!(matches!(
                crop_region(&screen(0), &region),
                Err(AcquisitionError::OutOfBounds { .. })
            ));
        }
    }

    #[test]
    fn replay_advances_then_holds_last_screen() {
        let tmp = tempfile::tempdir().unwrap();
        for (name, shade) in [("b.png", 2u8), ("a.png", 1), ("c.png", 3)] {
            screen(shade).save(tmp.path().join(name)).unwrap();
        }
        std::fs::write(tmp.path().join("notes.txt"), b"ignored").unwrap();

        let mut source = ReplaySource::open(tmp.path()).unwrap();
        assert_eq!(source.len(), 3);
        let region = CaptureRegion::new(0, 0, 20, 20);
        let shades: Vec<u8> = (0..5)
            .map(|_| source.grab(&region).unwrap().image().get_pixel(0, 0).0[0])
            .collect();
        assert_eq!(shades, vec![1, 2, 3, 3, 3]);
    }

    #[test]
    fn replay_rejects_tiny_region() {
        let tmp = tempfile::tempdir().unwrap();
        screen(0).save(tmp.path().join("a.png")).unwrap();
        let mut source = ReplaySource::open(tmp.path()).unwrap();
        assert!(matches!(
            source.grab(&CaptureRegion::new(0, 0, 10, 50)),
            Err(AcquisitionError::InvalidRegion(_))
        ));
    }

    #[test]
    fn empty_directory_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(matches!(
            ReplaySource::open(tmp.path()),
            Err(AcquisitionError::Grab(_))
        ));
    }
}
