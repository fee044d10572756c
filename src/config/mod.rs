//! Application Configuration
//!
//! User settings stored in TOML format.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::engine::{AccelerationMode, OnnxEngineConfig};
use crate::storage::FrameStoreConfig;

/// Application settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Where captured frames are persisted
    pub storage: StorageSettings,
    /// Inference engine settings
    pub engine: EngineSettings,
    /// Logging settings
    pub logging: LoggingSettings,
}

/// Frame persistence settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    /// Directory for persisted frames; `<Pictures>/OCR` when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frames_dir: Option<PathBuf>,
    /// Fixed prefix of frame file names
    pub file_prefix: String,
    /// Extension of frame file names. Frames are PNG encoded regardless.
    pub file_extension: String,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            frames_dir: None,
            file_prefix: "IMG_".to_string(),
            file_extension: "jpg".to_string(),
        }
    }
}

impl StorageSettings {
    /// Frame store configuration, resolving the default directory
    pub fn frame_store_config(&self) -> Result<FrameStoreConfig> {
        let dir = match &self.frames_dir {
            Some(dir) => dir.clone(),
            None => crate::storage::default_frames_dir()?,
        };

        Ok(FrameStoreConfig {
            dir,
            prefix: self.file_prefix.clone(),
            extension: self.file_extension.clone(),
        })
    }
}

/// Inference engine settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Execution mode of the engine
    pub acceleration: AccelerationMode,
    /// ONNX engine tunables
    #[serde(flatten)]
    pub onnx: OnnxEngineConfig,
}

/// Logging settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Default filter when `RUST_LOG` is unset
    pub level: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Load configuration from file
pub fn load_config(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path)?;
    let config: AppConfig = toml::from_str(&content)?;
    Ok(config)
}

/// Save configuration to file
pub fn save_config(config: &AppConfig, path: &Path) -> Result<()> {
    let content = toml::to_string_pretty(config)?;
    std::fs::write(path, content)?;
    Ok(())
}

/// Load configuration from `path`, falling back to defaults
pub fn load_or_default(path: &Path) -> AppConfig {
    if !path.exists() {
        info!("No configuration at {:?}, using defaults", path);
        return AppConfig::default();
    }

    match load_config(path) {
        Ok(config) => {
            info!("Loaded configuration from {:?}", path);
            config
        }
        Err(e) => {
            warn!("Ignoring invalid configuration {:?}: {:#}", path, e);
            AppConfig::default()
        }
    }
}

/// Default configuration file location
pub fn default_config_path() -> Result<PathBuf> {
    Ok(crate::storage::get_config_dir()?.join("config.toml"))
}
