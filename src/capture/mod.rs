//! Capture Layer
//!
//! The capture capability is an external collaborator: the pipeline only
//! binds it and asks it for frames. `StillImageCapture` stands in for a
//! camera by decoding image files from disk.

pub mod frame;

use anyhow::{bail, Context, Result};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info};

pub use frame::{Frame, PixelFormat};

/// Callback receiving the outcome of one capture
pub type CaptureCallback = Box<dyn FnOnce(Result<Frame>) + Send + 'static>;

/// A source of frames, such as a camera
pub trait CaptureSource: Send + Sync {
    /// Bind the capture hardware; must succeed before `capture`
    fn bind(&self) -> Result<()>;

    /// Whether `bind` has succeeded
    fn is_bound(&self) -> bool;

    /// Take one frame and hand it to `on_captured`.
    ///
    /// The callback may run on the calling thread or on a thread owned by
    /// the source.
    fn capture(&self, on_captured: CaptureCallback);
}

/// Capture configuration
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Images served as captured frames, in order
    pub images: Vec<PathBuf>,
    /// Start over from the first image once all have been served
    pub repeat: bool,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            images: Vec::new(),
            repeat: true,
        }
    }
}

/// Capture source that serves image files as frames
pub struct StillImageCapture {
    config: CaptureConfig,
    bound: AtomicBool,
    next: Mutex<usize>,
}

impl StillImageCapture {
    /// Create a new still image capture source
    pub fn new(config: CaptureConfig) -> Self {
        Self {
            config,
            bound: AtomicBool::new(false),
            next: Mutex::new(0),
        }
    }

    /// Pick the path for the next capture, or None when exhausted
    fn next_path(&self) -> Option<PathBuf> {
        let mut next = self.next.lock();
        if *next >= self.config.images.len() {
            if !self.config.repeat || self.config.images.is_empty() {
                return None;
            }
            *next = 0;
        }
        let path = self.config.images[*next].clone();
        *next += 1;
        Some(path)
    }
}

impl CaptureSource for StillImageCapture {
    fn bind(&self) -> Result<()> {
        if self.config.images.is_empty() {
            bail!("no images configured for still capture");
        }
        for path in &self.config.images {
            if !path.is_file() {
                bail!("capture image {:?} is not readable", path);
            }
        }

        self.bound.store(true, Ordering::Release);
        info!("Still capture bound with {} image(s)", self.config.images.len());
        Ok(())
    }

    fn is_bound(&self) -> bool {
        self.bound.load(Ordering::Acquire)
    }

    fn capture(&self, on_captured: CaptureCallback) {
        let outcome = match self.next_path() {
            Some(path) => {
                debug!("Capturing frame from {:?}", path);
                image::open(&path)
                    .with_context(|| format!("Failed to decode capture image {:?}", path))
                    .map(Frame::from_image)
            }
            None => Err(anyhow::anyhow!("no more images to capture")),
        };
        on_captured(outcome);
    }
}
