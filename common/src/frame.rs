use chrono::Utc;
use image::{imageops, GrayImage, Luma, RgbImage};
use serde::Deserialize;
use std::fmt;

/// Minimum accepted width/height of a capture region, in pixels.
pub const MIN_REGION_SIDE: u32 = 10;

/// Screen rectangle sampled on every tick, in absolute screen coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct CaptureRegion {
    pub left: i32,
    pub top: i32,
    pub width: u32,
    pub height: u32,
}

impl CaptureRegion {
    pub fn new(left: i32, top: i32, width: u32, height: u32) -> Self {
        Self {
            left,
            top,
            width,
            height,
        }
    }

    pub fn validate(&self) -> Result<(), FrameError> {
        if self.width <= MIN_REGION_SIDE || self.height <= MIN_REGION_SIDE {
            return Err(FrameError::InvalidRegion {
                width: self.width,
                height: self.height,
            });
        }
        Ok(())
    }
}

/// An immutable 8-bit RGB raster with its capture timestamp.
///
/// Cloning is cheap enough for the sizes involved (a single screen region),
/// but callers pass `&Frame` wherever ownership is not needed.
#[derive(Clone, PartialEq)]
pub struct Frame {
    image: RgbImage,
    pub captured_at_ms: i64,
}

// Dimensions only; the pixel buffer would flood the logs.
impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width())
            .field("height", &self.height())
            .field("captured_at_ms", &self.captured_at_ms)
            .finish()
    }
}

impl Frame {
    /// Wrap an image captured right now.
    pub fn new(image: RgbImage) -> Self {
        Self {
            image,
            captured_at_ms: Utc::now().timestamp_millis(),
        }
    }

    pub fn with_timestamp(image: RgbImage, captured_at_ms: i64) -> Self {
        Self {
            image,
            captured_at_ms,
        }
    }

    /// Build a frame from a packed `width * height * 3` byte buffer.
    pub fn from_raw(width: u32, height: u32, data: Vec<u8>) -> Result<Self, FrameError> {
        let expected = width as usize * height as usize * 3;
        let got = data.len();
        if got != expected {
            return Err(FrameError::BufferSize { got, expected });
        }
        let image =
            RgbImage::from_raw(width, height, data).ok_or(FrameError::BufferSize { got, expected })?;
        Ok(Self::new(image))
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn image(&self) -> &RgbImage {
        &self.image
    }

    pub fn to_gray(&self) -> GrayImage {
        luma_bt601(&self.image)
    }

    /// Grayscale view with `border` pixels removed from every side.
    ///
    /// Regions too small to lose `2 * border` in either direction are
    /// converted uncropped.
    pub fn gray_without_border(&self, border: u32) -> GrayImage {
        let (w, h) = (self.width(), self.height());
        if border == 0 || w <= 2 * border || h <= 2 * border {
            return self.to_gray();
        }
        let inner = imageops::crop_imm(&self.image, border, border, w - 2 * border, h - 2 * border)
            .to_image();
        luma_bt601(&inner)
    }

    /// Copy of the column range `[start, end)`, full height. Bounds are clamped.
    pub fn columns(&self, start: u32, end: u32) -> Frame {
        let end = end.min(self.width());
        let start = start.min(end);
        let image = imageops::crop_imm(&self.image, start, 0, end - start, self.height()).to_image();
        Frame::with_timestamp(image, self.captured_at_ms)
    }

    /// Left-to-right concatenation of equally tall frames.
    ///
    /// Returns `None` for an empty list or when heights differ.
    pub fn concat_horizontal(parts: &[Frame]) -> Option<Frame> {
        let first = parts.first()?;
        let height = first.height();
        if parts.iter().any(|p| p.height() != height) {
            return None;
        }
        let width: u32 = parts.iter().map(Frame::width).sum();
        let mut out = RgbImage::new(width, height);
        let mut x = 0i64;
        for part in parts {
            imageops::replace(&mut out, part.image(), x, 0);
            x += part.width() as i64;
        }
        let ts = parts.last().map(|p| p.captured_at_ms).unwrap_or(first.captured_at_ms);
        Some(Frame::with_timestamp(out, ts))
    }
}

/// Grayscale with BT.601 weights (0.299 R + 0.587 G + 0.114 B), rounded.
pub fn luma_bt601(image: &RgbImage) -> GrayImage {
    GrayImage::from_fn(image.width(), image.height(), |x, y| {
        let [r, g, b] = image.get_pixel(x, y).0;
        let luma = (299 * r as u32 + 587 * g as u32 + 114 * b as u32 + 500) / 1000;
        Luma([luma as u8])
    })
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("capture region {width}x{height} is too small (each side must exceed 10px)")]
    InvalidRegion { width: u32, height: u32 },
    #[error("raster buffer has {got} bytes, expected {expected}")]
    BufferSize { got: usize, expected: usize },
}
