//! ocr-handoff - Capture-to-inference handoff for on-device OCR
//!
//! Each image given on the command line is taken as one capture: it is
//! persisted, handed to the result context by reference, read by the OCR
//! engine and printed.

mod app;
mod capture;
mod config;
mod engine;
mod error;
mod pipeline;
mod signals;
mod storage;
#[cfg(test)]
mod testing;

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, reload, EnvFilter, Registry};

use crate::app::HandoffApp;
use crate::capture::{CaptureConfig, StillImageCapture};
use crate::config::AppConfig;
use crate::engine::{AccelerationMode, InferenceResult, OnnxEngineFactory};
use crate::pipeline::{ChannelPresenter, Presentation};
use crate::storage::FrameStore;

/// ocr-handoff - Persist captured frames and recognize their text
#[derive(Parser, Debug)]
#[command(name = "ocr-handoff")]
#[command(about = "Capture frames, persist them and run OCR on the persisted copy")]
struct Args {
    /// Images to feed through the pipeline, one capture each
    #[arg(required_unless_present = "list")]
    images: Vec<PathBuf>,

    /// Run the engine with GPU acceleration where available
    #[arg(long)]
    accelerated: bool,

    /// Configuration file (defaults to the platform config directory)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Directory for persisted frames
    #[arg(long)]
    frames_dir: Option<PathBuf>,

    /// Write annotated results into this directory
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// List persisted frames and exit
    #[arg(long)]
    list: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging first so configuration problems are reported.
    // Without RUST_LOG the configured level replaces "info" once loaded.
    let env_filter = EnvFilter::try_from_default_env().ok();
    let level_from_env = env_filter.is_some();
    let (filter, filter_handle) = reload::Layer::new(env_filter.unwrap_or_else(|| EnvFilter::new("info")));
    tracing_subscriber::registry().with(filter).with(fmt::layer()).init();

    let config_path = match &args.config {
        Some(path) => Some(path.clone()),
        None => config::default_config_path().ok(),
    };
    let mut config = match &config_path {
        Some(path) => config::load_or_default(path),
        None => AppConfig::default(),
    };

    if !level_from_env {
        apply_log_level(&filter_handle, &config.logging.level);
    }

    if let Some(dir) = &args.frames_dir {
        config.storage.frames_dir = Some(dir.clone());
    }
    if args.accelerated {
        config.engine.acceleration = AccelerationMode::Accelerated;
    }

    if args.list {
        return list_frames(&config);
    }

    info!("ocr-handoff starting...");
    if let Some(path) = &config_path {
        info!("Configuration: {:?}", path);
    }

    run(&config, &args.images, args.output.as_deref())?;

    info!("ocr-handoff shutdown complete");
    Ok(())
}

/// Switch the active log filter to the configured level
fn apply_log_level(handle: &reload::Handle<EnvFilter, Registry>, level: &str) {
    match EnvFilter::try_new(level) {
        Ok(filter) => {
            if let Err(e) = handle.reload(filter) {
                warn!("Failed to apply log level '{}': {}", level, e);
            }
        }
        Err(e) => warn!("Ignoring invalid log level '{}': {}", level, e),
    }
}

/// Print persisted frames, newest first
fn list_frames(config: &AppConfig) -> Result<()> {
    let store = FrameStore::new(config.storage.frame_store_config()?);
    let frames = store.list()?;

    println!("Persisted frames in {:?}:", store.dir());
    if frames.is_empty() {
        println!("  (none)");
    }
    for frame in &frames {
        println!("  {}", frame);
    }
    Ok(())
}

/// Push every image through the pipeline and report the outcomes
fn run(config: &AppConfig, images: &[PathBuf], output: Option<&Path>) -> Result<()> {
    let capture = Arc::new(StillImageCapture::new(CaptureConfig {
        images: images.to_vec(),
        repeat: false,
    }));
    let factory = Arc::new(OnnxEngineFactory::new(config.engine.onnx.clone()));
    let (presenter, presentations) = ChannelPresenter::new();

    let app = HandoffApp::new(config, capture, factory, Arc::new(presenter))?;
    app.bind_capture()?;

    if let Some(dir) = output {
        std::fs::create_dir_all(dir).with_context(|| format!("Failed to create output directory {:?}", dir))?;
    }

    let mut failures = 0usize;
    for image in images {
        app.trigger_capture()?;

        // Every capture ends in exactly one presentation
        let presentation = presentations
            .recv()
            .context("Pipeline stopped before presenting a result")?;

        println!("== {}", image.display());
        match presentation {
            Presentation::Result(result) => {
                print_result(&result);
                if let Some(dir) = output {
                    let path = annotated_path(dir, image);
                    match result.image.save(&path) {
                        Ok(()) => println!("Annotated image: {}", path.display()),
                        Err(e) => warn!("Failed to write {:?}: {}", path, e),
                    }
                }
            }
            Presentation::Error(message) => {
                failures += 1;
                println!("Error: {}", message);
            }
        }
    }

    if failures > 0 {
        bail!("{} of {} request(s) failed", failures, images.len());
    }
    Ok(())
}

fn print_result(result: &InferenceResult) {
    let mut fragments: Vec<_> = result.items_found.iter().collect();
    fragments.sort_by(|a, b| a.0.cmp(b.0));

    println!("Text: {}", result.text_summary());
    for (text, color) in fragments {
        let [r, g, b, _] = color.0;
        println!("  #{:02x}{:02x}{:02x}  {}", r, g, b, text);
    }
    println!("{}", result.execution_log);
}

/// `<output>/<image stem>_ocr.png`
fn annotated_path(dir: &Path, image: &Path) -> PathBuf {
    let stem = image
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "frame".to_string());
    dir.join(format!("{}_ocr.png", stem))
}
