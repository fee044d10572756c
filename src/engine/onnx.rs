//! PaddleOCR engine on ONNX Runtime
//!
//! Detection (DBNet) finds text regions, recognition (CRNN + CTC) reads
//! each region. `Accelerated` registers a GPU execution provider where one
//! is available; `Reference` runs on the CPU.

use anyhow::{anyhow, bail, Context, Result};
use image::{imageops, RgbImage};
use ndarray::Array4;
use ort::session::builder::{GraphOptimizationLevel, SessionBuilder};
use ort::session::Session;
use ort::value::Tensor;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info, warn};

use super::models::{ModelKind, ModelStore};
use super::postprocess::{self, BoxParams};
use super::preprocess;
use super::{AccelerationMode, EngineFactory, InferenceEngine, InferenceResult};
use crate::capture::Frame;

/// Tunables for the ONNX engine
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OnnxEngineConfig {
    /// Model directory; `<data dir>/models` when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub models_dir: Option<PathBuf>,
    /// Pixel probability that counts as text
    pub detection_threshold: f32,
    /// Minimum mean probability of a kept text region
    pub box_threshold: f32,
    /// Minimum side of a kept region, in detection map pixels
    pub min_box_size: u32,
    /// Longest side fed to the detection model
    pub max_side_len: u32,
    /// Minimum recognition confidence for a fragment to be reported
    pub min_text_confidence: f32,
    /// Threads used inside one ONNX session
    pub intra_threads: usize,
    /// Never download; fail when a model file is missing
    pub offline: bool,
}

impl Default for OnnxEngineConfig {
    fn default() -> Self {
        Self {
            models_dir: None,
            detection_threshold: 0.3,
            box_threshold: 0.6,
            min_box_size: 3,
            max_side_len: 960,
            min_text_confidence: 0.5,
            intra_threads: 4,
            offline: false,
        }
    }
}

impl OnnxEngineConfig {
    fn box_params(&self) -> BoxParams {
        BoxParams {
            pixel_threshold: self.detection_threshold,
            box_threshold: self.box_threshold,
            min_size: self.min_box_size,
            ..BoxParams::default()
        }
    }
}

const REC_HEIGHT: u32 = 48;
const REC_MAX_WIDTH: u32 = 320;

/// Builds `OnnxEngine`s, fetching models on first use
pub struct OnnxEngineFactory {
    config: OnnxEngineConfig,
}

impl OnnxEngineFactory {
    /// Create a factory; nothing is loaded until `create`
    pub fn new(config: OnnxEngineConfig) -> Self {
        Self { config }
    }

    fn model_store(&self) -> Result<ModelStore> {
        let store = match &self.config.models_dir {
            Some(dir) => ModelStore::with_dir(dir.clone())?,
            None => ModelStore::new()?,
        };
        Ok(if self.config.offline {
            store.with_offline(true)
        } else {
            store
        })
    }
}

impl EngineFactory for OnnxEngineFactory {
    fn create(&self, mode: AccelerationMode) -> Result<Box<dyn InferenceEngine>> {
        let store = self.model_store()?;
        if !store.is_ready() {
            info!("OCR models missing from {:?}", store.dir());
        }
        let det_path = store.ensure(ModelKind::Detection)?;
        let rec_path = store.ensure(ModelKind::Recognition)?;
        let dict_path = store.ensure(ModelKind::Dictionary)?;

        let engine = OnnxEngine::load(&det_path, &rec_path, &dict_path, mode, self.config.clone())?;
        Ok(Box::new(engine))
    }
}

struct Sessions {
    detector: Session,
    recognizer: Session,
}

/// Text detection + recognition engine
pub struct OnnxEngine {
    sessions: Option<Sessions>,
    dictionary: Vec<String>,
    mode: AccelerationMode,
    config: OnnxEngineConfig,
}

impl OnnxEngine {
    /// Load both models and the dictionary
    pub fn load(
        det_path: &Path,
        rec_path: &Path,
        dict_path: &Path,
        mode: AccelerationMode,
        config: OnnxEngineConfig,
    ) -> Result<Self> {
        let dictionary = postprocess::parse_dictionary(
            &std::fs::read_to_string(dict_path)
                .with_context(|| format!("Failed to read dictionary {:?}", dict_path))?,
        );

        let detector = build_session(det_path, mode, config.intra_threads)?;
        let recognizer = build_session(rec_path, mode, config.intra_threads)?;

        info!(
            "OCR engine ready ({:?}, {} dictionary symbols)",
            mode,
            dictionary.len()
        );

        Ok(Self {
            sessions: Some(Sessions { detector, recognizer }),
            dictionary,
            mode,
            config,
        })
    }
}

impl InferenceEngine for OnnxEngine {
    fn infer(&mut self, frame: &Frame) -> Result<InferenceResult> {
        let sessions = self
            .sessions
            .as_mut()
            .ok_or_else(|| anyhow!("engine has been released"))?;

        let start = Instant::now();
        let source = frame.to_image()?;
        let rgb = source.to_rgb8();
        let mut output = source.to_rgba8();
        let (width, height) = rgb.dimensions();

        let det = preprocess::detection_input(&rgb, self.config.max_side_len);
        let (map_w, map_h, prob) = run_detection(&mut sessions.detector, det.tensor)?;
        let boxes = postprocess::extract_boxes(
            &prob,
            map_w,
            map_h,
            &self.config.box_params(),
            (det.scale_x, det.scale_y),
            (width, height),
        );
        let detect_time = start.elapsed();
        debug!("Detected {} text region(s) in {:?}", boxes.len(), detect_time);

        let mut items_found = HashMap::new();
        for text_box in &boxes {
            let crop = imageops::crop_imm(&rgb, text_box.x, text_box.y, text_box.width, text_box.height).to_image();
            let (text, confidence) = recognize(&mut sessions.recognizer, &crop, &self.dictionary)?;

            let text = text.trim().to_string();
            if text.is_empty() || confidence < self.config.min_text_confidence {
                continue;
            }

            let color = *items_found
                .entry(text.clone())
                .or_insert_with(|| postprocess::color_for(&text));
            postprocess::draw_box(&mut output, text_box, color);
        }

        let elapsed = start.elapsed();
        let mut execution_log = String::new();
        let _ = writeln!(execution_log, "Mode: {:?}", self.mode);
        let _ = writeln!(execution_log, "Input: {}x{}", width, height);
        let _ = writeln!(execution_log, "Text detection: {} ms, {} region(s)", detect_time.as_millis(), boxes.len());
        let _ = writeln!(
            execution_log,
            "Text recognition: {} ms, {} fragment(s)",
            (elapsed - detect_time).as_millis(),
            items_found.len()
        );
        let _ = write!(execution_log, "Total: {} ms", elapsed.as_millis());

        Ok(InferenceResult {
            image: output,
            items_found,
            execution_log,
            elapsed,
        })
    }

    fn release(&mut self) {
        if self.sessions.take().is_some() {
            info!("Released {:?} ONNX sessions", self.mode);
        }
    }
}

/// Build one session for the requested acceleration mode
fn build_session(path: &Path, mode: AccelerationMode, intra_threads: usize) -> Result<Session> {
    debug!("Loading ONNX model {:?} ({:?})", path, mode);

    let builder = Session::builder()?
        .with_optimization_level(GraphOptimizationLevel::Level3)?
        .with_intra_threads(intra_threads)?;

    let builder = match mode {
        AccelerationMode::Reference => builder,
        AccelerationMode::Accelerated => accelerate(builder)?,
    };

    builder
        .commit_from_file(path)
        .with_context(|| format!("Failed to load ONNX model {:?}", path))
}

#[cfg(target_os = "windows")]
fn accelerate(builder: SessionBuilder) -> Result<SessionBuilder> {
    use ort::execution_providers::DirectMLExecutionProvider;

    let builder = builder.with_execution_providers([DirectMLExecutionProvider::default().build()])?;
    info!("DirectML execution provider registered");
    Ok(builder)
}

#[cfg(not(target_os = "windows"))]
fn accelerate(builder: SessionBuilder) -> Result<SessionBuilder> {
    warn!("No GPU execution provider on this platform, running on CPU");
    Ok(builder)
}

/// Run detection, returning the probability map and its size
fn run_detection(session: &mut Session, input: Array4<f32>) -> Result<(u32, u32, Vec<f32>)> {
    let outputs = session.run(ort::inputs![Tensor::from_array(input)?])?;
    let (shape, data) = outputs[0].try_extract_tensor::<f32>()?;

    // [1, 1, H, W]
    if shape.len() != 4 {
        bail!("unexpected detection output shape {:?}", shape);
    }
    let map_h = shape[2] as u32;
    let map_w = shape[3] as u32;
    Ok((map_w, map_h, data.to_vec()))
}

/// Read one text crop
fn recognize(session: &mut Session, crop: &RgbImage, dictionary: &[String]) -> Result<(String, f32)> {
    let input = preprocess::recognition_input(crop, REC_HEIGHT, REC_MAX_WIDTH);
    let outputs = session.run(ort::inputs![Tensor::from_array(input)?])?;
    let (shape, data) = outputs[0].try_extract_tensor::<f32>()?;

    // [1, T, C]
    if shape.len() != 3 {
        bail!("unexpected recognition output shape {:?}", shape);
    }
    let steps = shape[1] as usize;
    let classes = shape[2] as usize;
    Ok(postprocess::ctc_greedy_decode(data, steps, classes, dictionary))
}
