//! Raster frames flowing through the pipeline.
//!
//! - `Frame`: one captured RGB image plus capture metadata.
//! - Crop / resize helpers used by the detection passes and face fusion.
//!
//! All coordinates are source-frame pixels unless stated otherwise.

use image::codecs::jpeg::JpegEncoder;
use image::imageops::{self, FilterType};
use image::RgbImage;
use std::time::{Instant, SystemTime};

use crate::detect::BoundingBox;
use crate::error::{MonitorError, Result};

/// One captured frame.
#[derive(Clone, Debug)]
pub struct Frame {
    image: RgbImage,
    /// Per-source monotonic sequence number assigned at capture.
    pub sequence: u64,
    /// Monotonic capture instant.
    pub captured_at: Instant,
    /// Wall-clock capture time (handed to detection sinks).
    pub captured_wall: SystemTime,
}

impl Frame {
    pub fn new(image: RgbImage, sequence: u64) -> Self {
        Self {
            image,
            sequence,
            captured_at: Instant::now(),
            captured_wall: SystemTime::now(),
        }
    }

    /// Build a frame from tightly packed RGB24 bytes.
    pub fn from_rgb(pixels: Vec<u8>, width: u32, height: u32, sequence: u64) -> Result<Self> {
        let expected = (width as usize) * (height as usize) * 3;
        if pixels.len() != expected {
            return Err(MonitorError::InvalidRegion(format!(
                "expected {} RGB bytes for {}x{}, received {}",
                expected,
                width,
                height,
                pixels.len()
            )));
        }
        let image = RgbImage::from_raw(width, height, pixels).ok_or_else(|| {
            MonitorError::InvalidRegion(format!("cannot build {}x{} raster", width, height))
        })?;
        Ok(Self::new(image, sequence))
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

    /// Copy of this frame resized by `factor`, keeping capture metadata.
    pub fn scaled(&self, factor: f32) -> Frame {
        let width = ((self.width() as f32) * factor).round().max(1.0) as u32;
        let height = ((self.height() as f32) * factor).round().max(1.0) as u32;
        Frame {
            image: imageops::resize(&self.image, width, height, FilterType::Triangle),
            sequence: self.sequence,
            captured_at: self.captured_at,
            captured_wall: self.captured_wall,
        }
    }

    /// Resize to a fixed width, preserving aspect ratio.
    ///
    /// Returns the resized image and the applied scale (`target / width`).
    pub fn resized_to_width(&self, target_width: u32) -> (RgbImage, f32) {
        let scale = target_width as f32 / self.width().max(1) as f32;
        let height = ((self.height() as f32) * scale).round().max(1.0) as u32;
        let resized = imageops::resize(&self.image, target_width.max(1), height, FilterType::Triangle);
        (resized, scale)
    }

    /// Crop a region, clipped to the frame.
    ///
    /// Returns the crop and its clipped origin in source coordinates.
    pub fn crop(&self, region: &BoundingBox) -> Result<(RgbImage, BoundingBox)> {
        let clipped = region
            .clip(self.width(), self.height())
            .ok_or_else(|| MonitorError::InvalidRegion(format!("{:?} outside frame", region)))?;
        let x = clipped.x1.floor() as u32;
        let y = clipped.y1.floor() as u32;
        let w = (clipped.x2.ceil() as u32).min(self.width()).saturating_sub(x);
        let h = (clipped.y2.ceil() as u32).min(self.height()).saturating_sub(y);
        if w == 0 || h == 0 {
            return Err(MonitorError::InvalidRegion(format!(
                "{:?} is empty after clipping",
                region
            )));
        }
        let crop = imageops::crop_imm(&self.image, x, y, w, h).to_image();
        let origin = BoundingBox::new(x as f32, y as f32, (x + w) as f32, (y + h) as f32);
        Ok((crop, origin))
    }
}

/// Upscale an image so that its width is at least `min_width`.
///
/// Returns the (possibly unchanged) image and the applied scale factor.
pub fn upscale_to_min_width(image: RgbImage, min_width: u32) -> (RgbImage, f32) {
    let width = image.width();
    if width == 0 || width >= min_width {
        return (image, 1.0);
    }
    let scale = min_width as f32 / width as f32;
    let height = ((image.height() as f32) * scale).round().max(1.0) as u32;
    let resized = imageops::resize(&image, min_width, height, FilterType::Triangle);
    (resized, scale)
}

/// Default JPEG quality for emitted frames and stored snapshots.
pub const JPEG_QUALITY: u8 = 75;

/// Encode an RGB image as baseline JPEG.
pub fn encode_jpeg(image: &RgbImage, quality: u8) -> anyhow::Result<Vec<u8>> {
    let mut out = Vec::new();
    image.write_with_encoder(JpegEncoder::new_with_quality(&mut out, quality.clamp(1, 100)))?;
    Ok(out)
}
