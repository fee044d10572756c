//! Storage Layer
//!
//! Locates the directories the application writes to and persists captured
//! frames so they survive a context transition.

pub mod frame_store;

use anyhow::Result;
use std::path::PathBuf;

pub use frame_store::{FrameReference, FrameStore, FrameStoreConfig};

/// Subdirectory of the picture directory holding persisted frames
pub const FRAMES_SUBDIR: &str = "OCR";

fn project_dirs() -> Result<directories::ProjectDirs> {
    directories::ProjectDirs::from("org", "ocrhandoff", "OcrHandoff")
        .ok_or_else(|| anyhow::anyhow!("Could not determine project directories"))
}

/// Get the application data directory
pub fn get_data_dir() -> Result<PathBuf> {
    let data_dir = project_dirs()?.data_dir().to_path_buf();
    std::fs::create_dir_all(&data_dir)?;

    Ok(data_dir)
}

/// Get the configuration directory
pub fn get_config_dir() -> Result<PathBuf> {
    let config_dir = project_dirs()?.config_dir().to_path_buf();
    std::fs::create_dir_all(&config_dir)?;

    Ok(config_dir)
}

/// Default directory for persisted frames: `<Pictures>/OCR`.
///
/// Falls back to the data directory when the platform has no picture
/// directory. The directory is not created here; the frame store creates
/// it on first persist.
pub fn default_frames_dir() -> Result<PathBuf> {
    let pictures = directories::UserDirs::new().and_then(|dirs| dirs.picture_dir().map(|p| p.to_path_buf()));

    match pictures {
        Some(dir) => Ok(dir.join(FRAMES_SUBDIR)),
        None => Ok(get_data_dir()?.join(FRAMES_SUBDIR)),
    }
}
