//! Model store for the ONNX engine
//!
//! Downloads, verifies and caches the PaddleOCR model files. Downloads run
//! on a private tokio runtime so callers stay synchronous.

use anyhow::{bail, Context, Result};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::runtime::Runtime;
use tracing::{debug, info};

/// Set to forbid network access; missing models then fail to load
pub const OFFLINE_ENV: &str = "OCR_HANDOFF_OFFLINE";

/// Files the ONNX engine needs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelKind {
    /// Text detection model (DBNet)
    Detection,
    /// Text recognition model (CRNN, CTC output)
    Recognition,
    /// Character dictionary for recognition
    Dictionary,
}

impl ModelKind {
    /// Every file the engine loads
    pub const ALL: [ModelKind; 3] = [ModelKind::Detection, ModelKind::Recognition, ModelKind::Dictionary];

    /// File name inside the model directory
    pub fn filename(&self) -> &'static str {
        match self {
            ModelKind::Detection => "det.onnx",
            ModelKind::Recognition => "rec.onnx",
            ModelKind::Dictionary => "dict.txt",
        }
    }

    /// Where the file is fetched from
    pub fn download_url(&self) -> &'static str {
        match self {
            ModelKind::Detection => {
                "https://huggingface.co/monkt/paddleocr-onnx/resolve/main/detection/v3/det.onnx"
            }
            ModelKind::Recognition => {
                "https://huggingface.co/monkt/paddleocr-onnx/resolve/main/languages/english/rec.onnx"
            }
            ModelKind::Dictionary => {
                "https://huggingface.co/monkt/paddleocr-onnx/resolve/main/languages/english/dict.txt"
            }
        }
    }

    /// Plausible file size in bytes, used to reject truncated downloads
    pub fn expected_size_range(&self) -> (u64, u64) {
        match self {
            ModelKind::Detection => (2_000_000, 5_000_000),
            ModelKind::Recognition => (7_000_000, 10_000_000),
            ModelKind::Dictionary => (500, 10_000),
        }
    }
}

/// Record of the files fetched into a model directory
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelManifest {
    pub models: Vec<ModelRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelRecord {
    pub filename: String,
    pub size_bytes: u64,
    pub sha256: String,
    pub downloaded_at: String,
}

/// Directory of cached model files
#[derive(Debug, Clone)]
pub struct ModelStore {
    dir: PathBuf,
    offline: bool,
}

impl ModelStore {
    /// Store under `<data dir>/models`
    pub fn new() -> Result<Self> {
        Self::with_dir(crate::storage::get_data_dir()?.join("models"))
    }

    /// Store in a custom directory
    pub fn with_dir(dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create model directory {:?}", dir))?;
        Ok(Self {
            dir,
            offline: std::env::var_os(OFFLINE_ENV).is_some(),
        })
    }

    /// Forbid downloads; missing models become errors
    pub fn with_offline(mut self, offline: bool) -> Self {
        self.offline = offline;
        self
    }

    /// Model directory
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path a model file lives at
    pub fn path(&self, kind: ModelKind) -> PathBuf {
        self.dir.join(kind.filename())
    }

    /// Whether a model file is present with a plausible size
    pub fn is_available(&self, kind: ModelKind) -> bool {
        let (min, max) = kind.expected_size_range();
        std::fs::metadata(self.path(kind))
            .map(|meta| meta.is_file() && (min..=max).contains(&meta.len()))
            .unwrap_or(false)
    }

    /// Whether every model file is present
    pub fn is_ready(&self) -> bool {
        ModelKind::ALL.iter().all(|&kind| self.is_available(kind))
    }

    /// Path to a model file, downloading it first if needed
    pub fn ensure(&self, kind: ModelKind) -> Result<PathBuf> {
        let path = self.path(kind);
        if self.is_available(kind) {
            debug!("Model {:?} available at {:?}", kind, path);
            return Ok(path);
        }

        if self.offline {
            bail!(
                "Offline mode: {:?} is missing. Download {} and place it at {:?}",
                kind,
                kind.download_url(),
                path
            );
        }

        self.download(kind)?;
        Ok(path)
    }

    /// Fetch one model file (blocking)
    fn download(&self, kind: ModelKind) -> Result<()> {
        let url = kind.download_url();
        let path = self.path(kind);
        info!("Downloading {:?} model from {}", kind, url);

        let runtime = Runtime::new().context("Failed to create tokio runtime")?;
        let (size, sha256) = runtime.block_on(fetch_to_file(url, &path))?;

        if !self.is_available(kind) {
            std::fs::remove_file(&path).ok();
            bail!("Downloaded {:?} has an unexpected size of {} bytes", kind, size);
        }

        let mut manifest = self.load_manifest().unwrap_or_default();
        manifest.models.retain(|record| record.filename != kind.filename());
        manifest.models.push(ModelRecord {
            filename: kind.filename().to_string(),
            size_bytes: size,
            sha256,
            downloaded_at: chrono::Utc::now().to_rfc3339(),
        });
        self.save_manifest(&manifest)?;

        info!("Downloaded {:?} model ({} bytes)", kind, size);
        Ok(())
    }

    fn manifest_path(&self) -> PathBuf {
        self.dir.join("manifest.json")
    }

    /// Load the manifest, empty if none was written yet
    pub fn load_manifest(&self) -> Result<ModelManifest> {
        let path = self.manifest_path();
        if !path.exists() {
            return Ok(ModelManifest::default());
        }
        let content = std::fs::read_to_string(&path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Write the manifest
    pub fn save_manifest(&self, manifest: &ModelManifest) -> Result<()> {
        let content = serde_json::to_string_pretty(manifest)?;
        std::fs::write(self.manifest_path(), content)?;
        Ok(())
    }
}

/// Stream `url` into `path` through a temp file, returning size and SHA-256
async fn fetch_to_file(url: &str, path: &Path) -> Result<(u64, String)> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(300))
        .build()
        .context("Failed to create HTTP client")?;

    let response = client
        .get(url)
        .send()
        .await
        .context("Failed to send download request")?;

    if !response.status().is_success() {
        bail!("Download failed with status {}: {}", response.status(), url);
    }

    let temp_path = path.with_extension("part");
    let mut file = std::fs::File::create(&temp_path).context("Failed to create temp file")?;

    let mut hasher = Sha256::new();
    let mut size: u64 = 0;
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.context("Error reading download stream")?;
        file.write_all(&chunk).context("Failed to write to temp file")?;
        hasher.update(&chunk);
        size += chunk.len() as u64;
    }

    file.flush().context("Failed to flush temp file")?;
    drop(file);

    std::fs::rename(&temp_path, path).context("Failed to move downloaded file into place")?;

    Ok((size, format!("{:x}", hasher.finalize())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_model_filenames() {
        assert_eq!(ModelKind::Detection.filename(), "det.onnx");
        assert_eq!(ModelKind::Recognition.filename(), "rec.onnx");
        assert_eq!(ModelKind::Dictionary.filename(), "dict.txt");
    }

    #[test]
    fn test_truncated_file_is_not_available() {
        let dir = TempDir::new().unwrap();
        let store = ModelStore::with_dir(dir.path().to_path_buf()).unwrap();

        std::fs::write(store.path(ModelKind::Dictionary), b"a\n").unwrap();
        assert!(!store.is_available(ModelKind::Dictionary));

        std::fs::write(store.path(ModelKind::Dictionary), "x\n".repeat(400)).unwrap();
        assert!(store.is_available(ModelKind::Dictionary));
        assert!(!store.is_ready());
    }

    #[test]
    fn test_offline_store_refuses_missing_model() {
        let dir = TempDir::new().unwrap();
        let store = ModelStore::with_dir(dir.path().to_path_buf())
            .unwrap()
            .with_offline(true);

        let err = store.ensure(ModelKind::Dictionary).unwrap_err();
        assert!(err.to_string().contains("Offline mode"));

        std::fs::write(store.path(ModelKind::Dictionary), "x\n".repeat(400)).unwrap();
        assert_eq!(
            store.ensure(ModelKind::Dictionary).unwrap(),
            store.path(ModelKind::Dictionary)
        );
    }

    #[test]
    fn test_manifest_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = ModelStore::with_dir(dir.path().to_path_buf()).unwrap();
        assert!(store.load_manifest().unwrap().models.is_empty());

        let manifest = ModelManifest {
            models: vec![ModelRecord {
                filename: "det.onnx".to_string(),
                size_bytes: 3,
                sha256: "abc".to_string(),
                downloaded_at: "2024-01-01T00:00:00+00:00".to_string(),
            }],
        };
        store.save_manifest(&manifest).unwrap();

        let loaded = store.load_manifest().unwrap();
        assert_eq!(loaded.models.len(), 1);
        assert_eq!(loaded.models[0].sha256, "abc");
    }
}
