//! Model output decoding and result annotation
//!
//! Turns the detection probability map into text boxes, decodes CTC
//! recognition output into strings, and outlines recognized text on the
//! output raster.

use image::{GrayImage, Luma, Rgba, RgbaImage};
use imageproc::drawing::draw_hollow_rect_mut;
use imageproc::rect::Rect;
use imageproc::region_labelling::{connected_components, Connectivity};
use sha2::{Digest, Sha256};

/// Axis-aligned text box in source image coordinates
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TextBox {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    /// Mean detection probability inside the region
    pub score: f32,
}

/// Thresholds applied to the detection map
#[derive(Debug, Clone, Copy)]
pub struct BoxParams {
    /// Pixel probability that counts as text
    pub pixel_threshold: f32,
    /// Minimum mean probability of a kept region
    pub box_threshold: f32,
    /// Minimum side of a kept region, in map pixels
    pub min_size: u32,
    /// DB unclip ratio used to grow shrunk regions back
    pub unclip_ratio: f32,
}

impl Default for BoxParams {
    fn default() -> Self {
        Self {
            pixel_threshold: 0.3,
            box_threshold: 0.6,
            min_size: 3,
            unclip_ratio: 1.5,
        }
    }
}

#[derive(Clone, Copy)]
struct Region {
    min_x: u32,
    min_y: u32,
    max_x: u32,
    max_y: u32,
    score_sum: f32,
    pixels: u32,
}

/// Extract text boxes from a `map_w`x`map_h` probability map.
///
/// Boxes are scaled by `scale_x`/`scale_y` into source coordinates and
/// clipped to `bounds`. The result is sorted top to bottom, left to right.
pub fn extract_boxes(
    prob: &[f32],
    map_w: u32,
    map_h: u32,
    params: &BoxParams,
    scale: (f32, f32),
    bounds: (u32, u32),
) -> Vec<TextBox> {
    if prob.len() < (map_w * map_h) as usize {
        return Vec::new();
    }

    let mask = GrayImage::from_fn(map_w, map_h, |x, y| {
        let p = prob[(y * map_w + x) as usize];
        Luma([if p > params.pixel_threshold { 255 } else { 0 }])
    });
    let labels = connected_components(&mask, Connectivity::Eight, Luma([0u8]));

    let mut regions: Vec<Option<Region>> = Vec::new();
    for (x, y, label) in labels.enumerate_pixels() {
        let label = label.0[0] as usize;
        if label == 0 {
            continue;
        }
        if regions.len() <= label {
            regions.resize(label + 1, None);
        }
        let p = prob[(y * map_w + x) as usize];
        let region = regions[label].get_or_insert(Region {
            min_x: x,
            min_y: y,
            max_x: x,
            max_y: y,
            score_sum: 0.0,
            pixels: 0,
        });
        region.min_x = region.min_x.min(x);
        region.min_y = region.min_y.min(y);
        region.max_x = region.max_x.max(x);
        region.max_y = region.max_y.max(y);
        region.score_sum += p;
        region.pixels += 1;
    }

    let (scale_x, scale_y) = scale;
    let (bound_w, bound_h) = bounds;

    let mut boxes: Vec<TextBox> = regions
        .into_iter()
        .flatten()
        .filter_map(|region| {
            let w = region.max_x - region.min_x + 1;
            let h = region.max_y - region.min_y + 1;
            if w.min(h) < params.min_size {
                return None;
            }

            let score = region.score_sum / region.pixels as f32;
            if score < params.box_threshold {
                return None;
            }

            // DB shrinks text kernels; grow by area * ratio / perimeter
            let pad = (w * h) as f32 * params.unclip_ratio / (2 * (w + h)) as f32;
            let x0 = ((region.min_x as f32 - pad) * scale_x).max(0.0) as u32;
            let y0 = ((region.min_y as f32 - pad) * scale_y).max(0.0) as u32;
            let x1 = (((region.max_x + 1) as f32 + pad) * scale_x).min(bound_w as f32) as u32;
            let y1 = (((region.max_y + 1) as f32 + pad) * scale_y).min(bound_h as f32) as u32;

            if x1 <= x0 || y1 <= y0 {
                return None;
            }

            Some(TextBox {
                x: x0,
                y: y0,
                width: x1 - x0,
                height: y1 - y0,
                score,
            })
        })
        .collect();

    boxes.sort_by_key(|b| (b.y, b.x));
    boxes
}

/// Greedy CTC decoding of a `steps`x`classes` probability matrix.
///
/// Class 0 is the blank; class `i` maps to `dictionary[i - 1]`. Returns the
/// text and the mean probability of the emitted characters.
pub fn ctc_greedy_decode(probs: &[f32], steps: usize, classes: usize, dictionary: &[String]) -> (String, f32) {
    let mut text = String::new();
    let mut confidence_sum = 0.0f32;
    let mut emitted = 0usize;
    let mut previous = 0usize;

    for step in probs.chunks_exact(classes).take(steps) {
        let (best, best_p) = step
            .iter()
            .copied()
            .enumerate()
            .fold((0usize, f32::MIN), |acc, (i, p)| if p > acc.1 { (i, p) } else { acc });

        if best != 0 && best != previous {
            if let Some(ch) = dictionary.get(best - 1) {
                text.push_str(ch);
                confidence_sum += best_p;
                emitted += 1;
            }
        }
        previous = best;
    }

    let confidence = if emitted == 0 { 0.0 } else { confidence_sum / emitted as f32 };
    (text, confidence)
}

/// Parse a recognition dictionary, one symbol per line, plus the space symbol
pub fn parse_dictionary(content: &str) -> Vec<String> {
    let mut symbols: Vec<String> = content
        .lines()
        .map(|line| line.trim_end_matches('\r').to_string())
        .filter(|line| !line.is_empty())
        .collect();
    symbols.push(" ".to_string());
    symbols
}

/// Display color for a text fragment, stable across runs
pub fn color_for(text: &str) -> Rgba<u8> {
    let digest = Sha256::digest(text.as_bytes());
    // Keep colors away from black so outlines stay visible
    Rgba([digest[0] | 0x40, digest[1] | 0x40, digest[2] | 0x40, 255])
}

/// Outline a box on the output raster
pub fn draw_box(image: &mut RgbaImage, text_box: &TextBox, color: Rgba<u8>) {
    for inset in 0..2u32 {
        if text_box.width <= inset * 2 || text_box.height <= inset * 2 {
            break;
        }
        let rect = Rect::at((text_box.x + inset) as i32, (text_box.y + inset) as i32)
            .of_size(text_box.width - inset * 2, text_box.height - inset * 2);
        draw_hollow_rect_mut(image, rect, color);
    }
}
