//! Inference engine layer
//!
//! The engine itself is an opaque collaborator behind `InferenceEngine`.
//! `EngineManager` owns the single live instance; `onnx` provides a
//! PaddleOCR engine on ONNX Runtime.

pub mod manager;
pub mod models;
pub mod onnx;
pub mod postprocess;
pub mod preprocess;

use anyhow::Result;
use image::{Rgba, RgbaImage};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::capture::Frame;

pub use manager::{EngineManager, EngineState};
pub use onnx::{OnnxEngineConfig, OnnxEngineFactory};

/// How the engine executes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccelerationMode {
    /// CPU execution
    #[default]
    Reference,
    /// GPU execution provider where available
    Accelerated,
}

/// A loaded inference engine
pub trait InferenceEngine: Send {
    /// Run recognition on one frame (blocking)
    fn infer(&mut self, frame: &Frame) -> Result<InferenceResult>;

    /// Free the engine's resources. The engine is unusable afterwards.
    fn release(&mut self);
}

/// Builds engines for a given acceleration mode
pub trait EngineFactory: Send + Sync {
    /// Construct a new engine
    fn create(&self, mode: AccelerationMode) -> Result<Box<dyn InferenceEngine>>;
}

/// Output of one engine invocation
#[derive(Debug, Clone)]
pub struct InferenceResult {
    /// Input raster with recognized text outlined
    pub image: RgbaImage,
    /// Recognized fragments and the color each is outlined with
    pub items_found: HashMap<String, Rgba<u8>>,
    /// Human readable timing and status log
    pub execution_log: String,
    /// Wall time spent in the engine
    pub elapsed: Duration,
}

impl InferenceResult {
    /// Recognized fragments in a stable order, space separated
    pub fn text_summary(&self) -> String {
        let mut fragments: Vec<&str> = self.items_found.keys().map(String::as_str).collect();
        fragments.sort_unstable();
        fragments.join(" ")
    }
}
