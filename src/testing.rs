//! Test doubles shared by the pipeline tests

use anyhow::{bail, Result};
use image::{Rgba, RgbaImage};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::capture::{CaptureCallback, CaptureSource, Frame, PixelFormat};
use crate::engine::{AccelerationMode, EngineFactory, InferenceEngine, InferenceResult};

/// Counters observed by `CountingFactory` engines
#[derive(Debug, Default)]
pub struct EngineCounters {
    pub created: AtomicUsize,
    pub released: AtomicUsize,
    pub live: AtomicUsize,
    pub max_live: AtomicUsize,
    pub runs: AtomicUsize,
    pub running: AtomicBool,
}

impl EngineCounters {
    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }

    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    pub fn max_live(&self) -> usize {
        self.max_live.load(Ordering::SeqCst)
    }
}

/// Engine double that echoes the frame and records its lifecycle
pub struct CountingEngine {
    counters: Arc<EngineCounters>,
    delay: Duration,
    fail_inference: bool,
    panic_inference: bool,
    released: bool,
}

impl InferenceEngine for CountingEngine {
    fn infer(&mut self, frame: &Frame) -> Result<InferenceResult> {
        assert!(!self.released, "inference on a released engine");
        assert!(
            !self.counters.running.swap(true, Ordering::SeqCst),
            "two inferences ran concurrently"
        );
        std::thread::sleep(self.delay);
        self.counters.runs.fetch_add(1, Ordering::SeqCst);
        self.counters.running.store(false, Ordering::SeqCst);

        if self.panic_inference {
            panic!("injected engine panic");
        }
        if self.fail_inference {
            bail!("injected inference failure");
        }

        let image = frame.to_image()?.to_rgba8();
        let mut items_found = HashMap::new();
        items_found.insert(format!("{}x{}", frame.width, frame.height), Rgba([255, 0, 0, 255]));

        Ok(InferenceResult {
            image,
            items_found,
            execution_log: "counting engine".to_string(),
            elapsed: self.delay,
        })
    }

    fn release(&mut self) {
        assert!(!self.released, "engine released twice");
        self.released = true;
        self.counters.released.fetch_add(1, Ordering::SeqCst);
        self.counters.live.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Factory double counting live engines, optionally failing per mode
#[derive(Default)]
pub struct CountingFactory {
    pub counters: Arc<EngineCounters>,
    pub fail_modes: Mutex<Vec<AccelerationMode>>,
    pub fail_inference: AtomicBool,
    pub panic_inference: AtomicBool,
    pub delay: Duration,
}

impl CountingFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    pub fn fail_on(&self, mode: AccelerationMode) {
        self.fail_modes.lock().push(mode);
    }

    pub fn fail_inference(&self) {
        self.fail_inference.store(true, Ordering::SeqCst);
    }

    pub fn panic_inference(&self) {
        self.panic_inference.store(true, Ordering::SeqCst);
    }
}

impl EngineFactory for CountingFactory {
    fn create(&self, mode: AccelerationMode) -> Result<Box<dyn InferenceEngine>> {
        if self.fail_modes.lock().contains(&mode) {
            bail!("injected construction failure for {:?}", mode);
        }

        let live = self.counters.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.counters.max_live.fetch_max(live, Ordering::SeqCst);
        self.counters.created.fetch_add(1, Ordering::SeqCst);

        Ok(Box::new(CountingEngine {
            counters: self.counters.clone(),
            delay: self.delay,
            fail_inference: self.fail_inference.load(Ordering::SeqCst),
            panic_inference: self.panic_inference.load(Ordering::SeqCst),
            released: false,
        }))
    }
}

/// Capture double producing solid frames on the calling thread
pub struct FakeCamera {
    bound: AtomicBool,
    fail_capture: AtomicBool,
    panic_capture: AtomicBool,
    pub captures: AtomicUsize,
    size: u32,
}

impl FakeCamera {
    pub fn new(size: u32) -> Self {
        Self {
            bound: AtomicBool::new(false),
            fail_capture: AtomicBool::new(false),
            panic_capture: AtomicBool::new(false),
            captures: AtomicUsize::new(0),
            size,
        }
    }

    pub fn fail_captures(&self) {
        self.fail_capture.store(true, Ordering::SeqCst);
    }

    pub fn panic_captures(&self) {
        self.panic_capture.store(true, Ordering::SeqCst);
    }
}

impl CaptureSource for FakeCamera {
    fn bind(&self) -> Result<()> {
        self.bound.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_bound(&self) -> bool {
        self.bound.load(Ordering::SeqCst)
    }

    fn capture(&self, on_captured: CaptureCallback) {
        self.captures.fetch_add(1, Ordering::SeqCst);
        if self.panic_capture.load(Ordering::SeqCst) {
            panic!("injected capture panic");
        }
        if self.fail_capture.load(Ordering::SeqCst) {
            on_captured(Err(anyhow::anyhow!("injected capture failure")));
            return;
        }
        on_captured(Ok(solid_frame(self.size, 128)));
    }
}

/// Square RGBA frame filled with one shade
pub fn solid_frame(size: u32, shade: u8) -> Frame {
    let image = RgbaImage::from_pixel(size, size, Rgba([shade, shade, shade, 255]));
    Frame::new(image.into_raw(), size, size, PixelFormat::Rgba8).expect("valid frame")
}
