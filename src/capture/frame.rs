//! Frame data structures for captured images

use anyhow::{bail, Result};
use image::{DynamicImage, RgbImage, RgbaImage};
use std::time::SystemTime;

/// Pixel encoding of a frame buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// 8-bit RGBA, 4 bytes per pixel
    Rgba8,
    /// 8-bit RGB, 3 bytes per pixel
    Rgb8,
}

impl PixelFormat {
    /// Bytes used by one pixel
    pub fn bytes_per_pixel(&self) -> usize {
        match self {
            PixelFormat::Rgba8 => 4,
            PixelFormat::Rgb8 => 3,
        }
    }
}

/// A captured frame held in memory
#[derive(Debug, Clone)]
pub struct Frame {
    /// Raw pixel data, row-major, no padding
    pub data: Vec<u8>,
    /// Frame width in pixels
    pub width: u32,
    /// Frame height in pixels
    pub height: u32,
    /// Pixel encoding of `data`
    pub format: PixelFormat,
    /// When the frame was captured
    pub captured_at: SystemTime,
}

impl Frame {
    /// Create a new frame, checking the buffer length against the dimensions
    pub fn new(data: Vec<u8>, width: u32, height: u32, format: PixelFormat) -> Result<Self> {
        let expected = width as usize * height as usize * format.bytes_per_pixel();
        if data.len() != expected {
            bail!(
                "frame buffer is {} bytes, expected {} for {}x{} {:?}",
                data.len(),
                expected,
                width,
                height,
                format
            );
        }

        Ok(Self {
            data,
            width,
            height,
            format,
            captured_at: SystemTime::now(),
        })
    }

    /// Build a frame from a decoded image, keeping RGB images as RGB
    pub fn from_image(image: DynamicImage) -> Self {
        match image {
            DynamicImage::ImageRgb8(rgb) => {
                let (width, height) = rgb.dimensions();
                Self {
                    data: rgb.into_raw(),
                    width,
                    height,
                    format: PixelFormat::Rgb8,
                    captured_at: SystemTime::now(),
                }
            }
            other => {
                let rgba = other.to_rgba8();
                let (width, height) = rgba.dimensions();
                Self {
                    data: rgba.into_raw(),
                    width,
                    height,
                    format: PixelFormat::Rgba8,
                    captured_at: SystemTime::now(),
                }
            }
        }
    }

    /// Convert into an `image` buffer for encoding or processing
    pub fn to_image(&self) -> Result<DynamicImage> {
        let image = match self.format {
            PixelFormat::Rgba8 => RgbaImage::from_raw(self.width, self.height, self.data.clone())
                .map(DynamicImage::ImageRgba8),
            PixelFormat::Rgb8 => RgbImage::from_raw(self.width, self.height, self.data.clone())
                .map(DynamicImage::ImageRgb8),
        };

        match image {
            Some(image) => Ok(image),
            None => bail!("frame buffer does not match {}x{}", self.width, self.height),
        }
    }

    /// Get frame dimensions as (width, height)
    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}
