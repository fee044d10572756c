//! Image preprocessing for the OCR models
//!
//! Resizing, normalization and NCHW tensor conversion for the PaddleOCR
//! detection and recognition inputs.

use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;

/// ImageNet statistics used by the detection model
const DET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const DET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Recognition maps [0, 255] to [-1, 1]
const REC_MEAN: [f32; 3] = [0.5, 0.5, 0.5];
const REC_STD: [f32; 3] = [0.5, 0.5, 0.5];

/// Detection input and the factors mapping it back to the source image
#[derive(Debug)]
pub struct DetectionInput {
    pub tensor: Array4<f32>,
    /// Source width / resized width
    pub scale_x: f32,
    /// Source height / resized height
    pub scale_y: f32,
}

/// Round to the nearest multiple of 32, never below 32
fn round_to_32(value: f32) -> u32 {
    (((value / 32.0).round() as u32) * 32).max(32)
}

/// Size the detection model sees for a `width`x`height` source
pub fn detection_size(width: u32, height: u32, max_side_len: u32) -> (u32, u32) {
    let longest = width.max(height) as f32;
    let ratio = if longest > max_side_len as f32 {
        max_side_len as f32 / longest
    } else {
        1.0
    };

    (
        round_to_32(width as f32 * ratio),
        round_to_32(height as f32 * ratio),
    )
}

/// Convert an RGB image to a normalized NCHW tensor (batch size 1)
pub fn to_nchw(image: &RgbImage, mean: &[f32; 3], std: &[f32; 3]) -> Array4<f32> {
    let (width, height) = image.dimensions();
    Array4::from_shape_fn((1, 3, height as usize, width as usize), |(_, c, y, x)| {
        let value = image.get_pixel(x as u32, y as u32).0[c] as f32 / 255.0;
        (value - mean[c]) / std[c]
    })
}

/// Prepare the full frame for the detection model
pub fn detection_input(image: &RgbImage, max_side_len: u32) -> DetectionInput {
    let (width, height) = image.dimensions();
    let (det_w, det_h) = detection_size(width, height, max_side_len);
    let resized = imageops::resize(image, det_w, det_h, FilterType::Triangle);

    DetectionInput {
        tensor: to_nchw(&resized, &DET_MEAN, &DET_STD),
        scale_x: width as f32 / det_w as f32,
        scale_y: height as f32 / det_h as f32,
    }
}

/// Prepare one text crop for the recognition model.
///
/// The crop is scaled to `target_height` keeping its aspect ratio, with the
/// width capped at `max_width`.
pub fn recognition_input(crop: &RgbImage, target_height: u32, max_width: u32) -> Array4<f32> {
    let (width, height) = crop.dimensions();
    let aspect = width as f32 / height.max(1) as f32;
    let rec_w = ((target_height as f32 * aspect).ceil() as u32).clamp(8, max_width);

    let resized = imageops::resize(crop, rec_w, target_height, FilterType::Triangle);
    to_nchw(&resized, &REC_MEAN, &REC_STD)
}
